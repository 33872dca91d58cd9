//! Last successfully committed mapping

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Timestamp format of [`StatusReport::last_update`]
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Written only by a refresh cycle, as one unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    pub last_update: Option<DateTime<Local>>,
    pub public_ip: Option<IpAddr>,
    /// (udp, tcp)
    pub current_ports: Option<(u16, u16)>,
}

impl Status {
    pub fn report(&self) -> StatusReport {
        StatusReport {
            last_update: self
                .last_update
                .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
                .unwrap_or_default(),
            public_ip_address: self.public_ip.map(|ip| ip.to_string()).unwrap_or_default(),
            current_port: self
                .current_ports
                .map(|(udp, tcp)| format!("{} / {}", udp, tcp))
                .unwrap_or_default(),
        }
    }
}

/// Status as shown to clients; empty strings mean unknown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub last_update: String,
    pub public_ip_address: String,
    pub current_port: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_empty_report() {
        assert_eq!(Status::default().report(), StatusReport::default());
    }

    #[test]
    fn test_report_format() {
        let status = Status {
            last_update: Some(Local.with_ymd_and_hms(2024, 5, 1, 13, 45, 9).unwrap()),
            public_ip: Some("203.0.113.9".parse().unwrap()),
            current_ports: Some((51413, 51414)),
        };

        let report = status.report();
        assert_eq!(report.last_update, "2024-05-01 13:45:09");
        assert_eq!(report.public_ip_address, "203.0.113.9");
        assert_eq!(report.current_port, "51413 / 51414");
    }
}
