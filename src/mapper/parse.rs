//! Parser for `natpmpc` style output

use once_cell::sync::Lazy;
use regex::Regex;
use std::net::IpAddr;

use super::{MappingResult, Protocol};

static GATEWAY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\busing gateway : ([0-9a-fA-F.:]+)\b").expect("gateway pattern is valid")
});

static PUBLIC_IP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bPublic IP address : ([0-9a-fA-F.:]+)\b").expect("public ip pattern is valid")
});

static MAPPING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\bMapped public port (\d{1,5}) protocol (\w{3}) to local port (\d{1,5}) lifetime (\d+)\b",
    )
    .expect("mapping pattern is valid")
});

/// Extract gateway, public IP and the mapping line from helper output.
///
/// Each field is searched for independently; text that matches none of the
/// patterns yields an all-`None` result.
pub fn parse_response(text: &str) -> MappingResult {
    let mut result = MappingResult {
        gateway: capture_addr(&GATEWAY_RE, text),
        public_ip: capture_addr(&PUBLIC_IP_RE, text),
        ..MappingResult::default()
    };

    if let Some(caps) = MAPPING_RE.captures(text) {
        let public_port = caps[1].parse::<u16>().ok();
        let private_port = caps[3].parse::<u16>().ok();

        // A 5-digit value above 65535 is not a port; drop the whole line
        if let (Some(public), Some(private)) = (public_port, private_port) {
            result.protocol = caps[2].parse::<Protocol>().ok();
            result.public_port = Some(public);
            result.private_port = Some(private);
            result.lifetime = caps[4].parse().ok();
        }
    }

    result
}

fn capture_addr(re: &Regex, text: &str) -> Option<IpAddr> {
    re.captures(text)?.get(1)?.as_str().parse().ok()
}
