// src/mapper/natpmp.rs
//! Native NAT-PMP client (RFC 6886)
//!
//! One negotiation is an external address request (opcode 0) followed by a
//! mapping request (opcode 1 for TCP, 2 for UDP). Requests are retransmitted
//! with a doubling delay; the whole exchange is bounded by the request
//! timeout.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::net::UdpSocket;
use tokio::time::{timeout, timeout_at, Instant};

use super::{MappingRequest, MappingResult, Negotiation, Negotiator};
use crate::error::{MapperError, MapperResult, NatPmpError};

/// Port NAT-PMP gateways listen on
pub const NATPMP_PORT: u16 = 5351;

const EXTERNAL_ADDRESS_OPCODE: u8 = 0;
const RESPONSE_OPCODE_OFFSET: u8 = 128;

/// Mapping responses are the longest at 16 bytes
const MAX_RESPONSE_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct NatPmpNegotiator {
    /// Gateway port, 5351 outside of tests
    port: u16,

    /// Delay before the first retransmission
    initial_retry: Duration,

    /// Attempts per request
    max_attempts: u32,
}

impl Default for NatPmpNegotiator {
    fn default() -> Self {
        Self {
            port: NATPMP_PORT,
            initial_retry: Duration::from_millis(250),
            max_attempts: 5,
        }
    }
}

impl NatPmpNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Talk to the gateway on a non-standard port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_retries(mut self, initial_retry: Duration, max_attempts: u32) -> Self {
        self.initial_retry = initial_retry;
        self.max_attempts = max_attempts.max(1);
        self
    }

    async fn exchange(
        &self,
        gateway: Ipv4Addr,
        request: &MappingRequest,
    ) -> MapperResult<MappingResult> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let target = SocketAddr::new(IpAddr::V4(gateway), self.port);

        let public_ip = self.external_address(&socket, target).await?;
        let (private_port, public_port, lifetime) = self
            .map_port(&socket, target, request)
            .await?;

        tracing::debug!(
            "NAT-PMP {} mapping granted: {} -> {} for {} seconds",
            request.protocol,
            public_port,
            private_port,
            lifetime
        );

        Ok(MappingResult {
            protocol: Some(request.protocol),
            gateway: Some(IpAddr::V4(gateway)),
            public_ip: Some(IpAddr::V4(public_ip)),
            public_port: Some(public_port),
            private_port: Some(private_port),
            lifetime: Some(lifetime),
        })
    }

    /// Opcode 0: ask the gateway for its external address
    async fn external_address(&self, socket: &UdpSocket, target: SocketAddr) -> MapperResult<Ipv4Addr> {
        let mut request = BytesMut::with_capacity(2);
        request.put_u8(0); // Version
        request.put_u8(EXTERNAL_ADDRESS_OPCODE);

        let response = self
            .send_request(socket, target, &request, EXTERNAL_ADDRESS_OPCODE, 12)
            .await?;

        let mut body = &response[8..];
        Ok(Ipv4Addr::new(
            body.get_u8(),
            body.get_u8(),
            body.get_u8(),
            body.get_u8(),
        ))
    }

    /// Opcode 1/2: request the mapping, returning (internal, external, lifetime)
    async fn map_port(
        &self,
        socket: &UdpSocket,
        target: SocketAddr,
        mapping: &MappingRequest,
    ) -> MapperResult<(u16, u16, u32)> {
        let opcode = mapping.protocol.opcode();

        let mut request = BytesMut::with_capacity(12);
        request.put_u8(0); // Version
        request.put_u8(opcode);
        request.put_u16(0); // Reserved
        request.put_u16(mapping.private_port);
        request.put_u16(mapping.public_port);
        request.put_u32(mapping.lifetime);

        let response = self.send_request(socket, target, &request, opcode, 16).await?;

        let mut body = &response[8..];
        let internal = body.get_u16();
        let external = body.get_u16();
        let lifetime = body.get_u32();

        if internal != mapping.private_port {
            return Err(NatPmpError::InvalidResponse("internal port mismatch").into());
        }

        Ok((internal, external, lifetime))
    }

    /// Send `request` until a matching response arrives, doubling the wait each time
    async fn send_request(
        &self,
        socket: &UdpSocket,
        target: SocketAddr,
        request: &[u8],
        opcode: u8,
        response_len: usize,
    ) -> MapperResult<Vec<u8>> {
        let mut retry_delay = self.initial_retry;

        for attempt in 0..self.max_attempts {
            socket.send_to(request, target).await?;
            let deadline = Instant::now() + retry_delay;

            loop {
                let mut buf = [0u8; MAX_RESPONSE_LEN];
                let (size, from) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
                    Ok(Ok(received)) => received,
                    Ok(Err(e)) => {
                        if attempt + 1 == self.max_attempts {
                            return Err(e.into());
                        }
                        break;
                    }
                    Err(_) => {
                        tracing::trace!("NAT-PMP opcode {} attempt {} unanswered", opcode, attempt + 1);
                        break;
                    }
                };

                if from != target {
                    tracing::debug!("Ignoring NAT-PMP packet from {}", from);
                    continue;
                }
                match check_response(&buf[..size], opcode, response_len) {
                    Some(response) => return response,
                    None => tracing::debug!("Ignoring NAT-PMP packet not answering opcode {}", opcode),
                }
            }

            retry_delay *= 2;
        }

        Err(NatPmpError::InvalidResponse("no response from gateway").into())
    }
}

/// Validate a datagram from the gateway against the request it should answer.
///
/// `None` means the packet answers another request, such as a late duplicate
/// reply to a retransmitted opcode 0, and should be skipped.
fn check_response(packet: &[u8], opcode: u8, response_len: usize) -> Option<MapperResult<Vec<u8>>> {
    if packet.len() < 2 || packet[1] != opcode + RESPONSE_OPCODE_OFFSET {
        return None;
    }

    let mut header = packet;
    if header.get_u8() != 0 {
        return Some(Err(NatPmpError::InvalidResponse("invalid response").into()));
    }
    header.advance(1);
    if header.remaining() < 2 {
        return Some(Err(NatPmpError::InvalidResponse("response too short").into()));
    }

    let result_code = header.get_u16();
    if result_code != 0 {
        return Some(Err(NatPmpError::from_code(result_code).into()));
    }
    if packet.len() < response_len {
        return Some(Err(NatPmpError::InvalidResponse("response too short").into()));
    }

    tracing::trace!("NAT-PMP opcode {} answered, epoch {}", opcode, header.get_u32());
    Some(Ok(packet[..response_len].to_vec()))
}

#[async_trait]
impl Negotiator for NatPmpNegotiator {
    async fn negotiate(&self, request: &MappingRequest) -> MapperResult<Negotiation> {
        if request.private_port == 0 {
            // Private port 0 with a non-zero lifetime is undefined, with zero it drops every mapping
            return Err(MapperError::InvalidRequest(
                "the native backend needs a non-zero private port".to_string(),
            ));
        }

        let gateway = resolve_gateway(&request.gateway)?;

        let result = match request.timeout {
            Some(limit) => timeout(limit, self.exchange(gateway, request))
                .await
                .map_err(|_| MapperError::NegotiationTimeout {
                    protocol: request.protocol,
                    timeout: limit,
                    output: format!("using gateway : {}\n", gateway),
                })??,
            None => self.exchange(gateway, request).await?,
        };

        Ok(Negotiation {
            output: result.to_string(),
            result,
        })
    }
}

/// Configured gateway, or the default route's gateway when none is set
fn resolve_gateway(configured: &str) -> MapperResult<Ipv4Addr> {
    if configured.is_empty() {
        return default_gateway().ok_or_else(|| {
            MapperError::InvalidRequest("no gateway configured and no default route".to_string())
        });
    }

    match configured.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => Ok(v4),
        Ok(IpAddr::V6(_)) => Err(MapperError::InvalidRequest(
            "NAT-PMP requires an IPv4 gateway".to_string(),
        )),
        Err(_) => Err(MapperError::InvalidRequest(format!(
            "invalid gateway address '{}'",
            configured
        ))),
    }
}

/// Default gateway from the routing table
#[cfg(target_os = "linux")]
fn default_gateway() -> Option<Ipv4Addr> {
    let table = std::fs::read_to_string("/proc/net/route").ok()?;
    parse_route_table(&table)
}

#[cfg(not(target_os = "linux"))]
fn default_gateway() -> Option<Ipv4Addr> {
    None
}

/// Find the default route (destination 00000000) in `/proc/net/route` text
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_route_table(table: &str) -> Option<Ipv4Addr> {
    table.lines().skip(1).find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 || parts[1] != "00000000" {
            return None;
        }
        // Gateway is hex, little-endian
        let raw = u32::from_str_radix(parts[2], 16).ok()?;
        let gateway = Ipv4Addr::from(raw.to_le_bytes());
        (!gateway.is_unspecified()).then_some(gateway)
    })
}
