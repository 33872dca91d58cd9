// src/mapper/mod.rs
//! Port mapping negotiation
//!
//! A negotiation asks the gateway for one external mapping (UDP or TCP) and
//! yields a [`MappingResult`]. Two backends exist:
//! - [`CommandNegotiator`] shells out to a `natpmpc` compatible client and
//!   parses its text output
//! - [`NatPmpNegotiator`] speaks NAT-PMP (RFC 6886) to the gateway directly
//!
//! [`Mapper`] picks one per request based on the configured [`Backend`].

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{Backend, Config};
use crate::error::MapperResult;

pub mod command;
pub mod natpmp;
pub mod parse;

pub use command::CommandNegotiator;
pub use natpmp::NatPmpNegotiator;
pub use parse::parse_response;

/// Transport protocol of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    /// Lowercase name passed to the negotiation helper
    pub fn as_arg(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }

    /// NAT-PMP mapping opcode
    pub fn opcode(self) -> u8 {
        match self {
            Self::Udp => 2,
            Self::Tcp => 1,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "UDP"),
            Self::Tcp => write!(f, "TCP"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else {
            Err(format!("unknown protocol '{}'", s))
        }
    }
}

/// Outcome of one negotiation
///
/// Every field is optional: a helper may print only part of what it knows,
/// and a missing line only blanks its own field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingResult {
    pub protocol: Option<Protocol>,
    pub gateway: Option<IpAddr>,
    pub public_ip: Option<IpAddr>,
    pub public_port: Option<u16>,
    pub private_port: Option<u16>,
    /// Lifetime granted by the gateway, in seconds
    pub lifetime: Option<u32>,
}

impl MappingResult {
    /// Granted protocol and public port, if the mapping line was present
    pub fn granted(&self) -> Option<(Protocol, u16)> {
        Some((self.protocol?, self.public_port?))
    }
}

/// Renders the result in the text shape `natpmpc` prints
impl fmt::Display for MappingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(gateway) = self.gateway {
            writeln!(f, "using gateway : {}", gateway)?;
        }
        if let Some(ip) = self.public_ip {
            writeln!(f, "Public IP address : {}", ip)?;
        }
        if let (Some(protocol), Some(public), Some(private)) =
            (self.protocol, self.public_port, self.private_port)
        {
            writeln!(
                f,
                "Mapped public port {} protocol {} to local port {} lifetime {}",
                public,
                protocol,
                private,
                self.lifetime.unwrap_or(0)
            )?;
        }
        Ok(())
    }
}

/// Parameters of one negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRequest {
    pub protocol: Protocol,
    pub public_port: u16,
    pub private_port: u16,
    /// Requested lifetime in seconds
    pub lifetime: u32,
    pub gateway: String,
    pub timeout: Option<Duration>,
    pub exec_path: String,
    pub backend: Backend,
}

impl MappingRequest {
    /// Build the request for `protocol` from a config snapshot
    pub fn from_config(config: &Config, protocol: Protocol) -> Self {
        Self {
            protocol,
            public_port: config.preferred_public_port,
            private_port: config.preferred_private_port,
            lifetime: config.lifetime_interval,
            gateway: config.gateway_address.trim().to_string(),
            timeout: config.process_timeout(),
            exec_path: config.exec_path.clone(),
            backend: config.backend,
        }
    }
}

/// A parsed result together with the raw transcript it came from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Negotiation {
    pub result: MappingResult,
    pub output: String,
}

/// Something that can negotiate a port mapping
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn negotiate(&self, request: &MappingRequest) -> MapperResult<Negotiation>;
}

/// Production negotiator, dispatching on the request's backend
#[derive(Debug, Default)]
pub struct Mapper {
    command: CommandNegotiator,
    native: NatPmpNegotiator,
}

impl Mapper {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Negotiator for Mapper {
    async fn negotiate(&self, request: &MappingRequest) -> MapperResult<Negotiation> {
        tracing::debug!(
            "Negotiating {} mapping {} -> {} via {:?} backend",
            request.protocol,
            request.public_port,
            request.private_port,
            request.backend
        );

        match request.backend {
            Backend::Command => self.command.negotiate(request).await,
            Backend::Native => self.native.negotiate(request).await,
        }
    }
}
