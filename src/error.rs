use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::mapper::Protocol;

/// Errors raised while negotiating a single port mapping
#[derive(Debug, Error)]
pub enum MapperError {
    /// Negotiation helper exited with a non-zero status
    #[error("{protocol} negotiation failed (exit code {code:?})")]
    NegotiationFailed {
        protocol: Protocol,
        code: Option<i32>,
        /// Everything the helper printed before exiting
        output: String,
    },

    /// Negotiation did not finish within the configured timeout
    #[error("{protocol} negotiation timed out after {timeout:?}")]
    NegotiationTimeout {
        protocol: Protocol,
        timeout: Duration,
        /// Output captured before the helper was killed
        output: String,
    },

    /// Negotiation helper could not be started
    #[error("Failed to start negotiation helper {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Request cannot be sent as given
    #[error("Invalid mapping request: {0}")]
    InvalidRequest(String),

    /// Gateway answered with an error
    #[error("NAT-PMP error: {0}")]
    NatPmp(#[from] NatPmpError),

    /// Network I/O errors
    #[error("Network I/O error: {0}")]
    Io(#[from] io::Error),
}

impl MapperError {
    /// Raw output captured from the negotiation, if any
    pub fn output(&self) -> &str {
        match self {
            Self::NegotiationFailed { output, .. } | Self::NegotiationTimeout { output, .. } => output,
            _ => "",
        }
    }
}

/// NAT-PMP result codes and malformed responses (RFC 6886)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NatPmpError {
    #[error("Unsupported Version")]
    UnsupportedVersion,

    #[error("Not Authorized/Refused")]
    NotAuthorized,

    #[error("Network Failure")]
    NetworkFailure,

    #[error("Out of Resources")]
    OutOfResources,

    #[error("Unsupported Opcode")]
    UnsupportedOpcode,

    #[error("Unknown result code {0}")]
    Unknown(u16),

    #[error("Invalid response: {0}")]
    InvalidResponse(&'static str),
}

impl NatPmpError {
    /// Convert a non-zero result code from a gateway response
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => Self::UnsupportedVersion,
            2 => Self::NotAuthorized,
            3 => Self::NetworkFailure,
            4 => Self::OutOfResources,
            5 => Self::UnsupportedOpcode,
            other => Self::Unknown(other),
        }
    }
}

/// Errors from port-change hooks
#[derive(Debug, Error)]
pub enum HookError {
    #[error("Hook exited with code {code:?}")]
    Failed { code: Option<i32>, output: String },

    #[error("Hook timed out after {timeout:?}")]
    TimedOut { timeout: Duration, output: String },

    #[error("Failed to start hook {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Other(String),
}

/// Error reported by the host application collaborator
#[derive(Debug, Error)]
#[error("Host error: {0}")]
pub struct HostError(pub String);

/// Configuration load/save errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file I/O error at {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Config file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Control socket errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Control socket I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed control message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Control framing error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("Connection closed before a response arrived")]
    ConnectionClosed,

    #[error("Daemon returned an error: {0}")]
    Remote(String),
}

pub type MapperResult<T> = Result<T, MapperError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type ControlResult<T> = Result<T, ControlError>;
