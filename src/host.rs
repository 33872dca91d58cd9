//! The application whose listen port follows the mapping
//!
//! The daemon only consumes this interface; it is injected at construction.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::HostError;

pub type HostResult<T> = Result<T, HostError>;

#[async_trait]
pub trait Host: Send + Sync {
    /// Port the application currently listens on
    async fn listen_port(&self) -> HostResult<u16>;

    /// Switch the application to the newly mapped ports
    async fn set_listen_ports(&self, udp_port: u16, tcp_port: u16) -> HostResult<()>;

    /// Identifiers of the work items that should re-announce themselves
    async fn session_state(&self) -> HostResult<Vec<String>>;

    async fn force_reannounce(&self, items: &[String]) -> HostResult<()>;
}

/// Standalone host keeping the listen ports in memory
#[derive(Debug)]
pub struct LocalHost {
    ports: RwLock<(u16, u16)>,
}

impl LocalHost {
    pub fn new(initial_port: u16) -> Self {
        Self {
            ports: RwLock::new((initial_port, initial_port)),
        }
    }

    /// Current (udp, tcp) listen ports
    pub fn ports(&self) -> (u16, u16) {
        *self.ports.read()
    }
}

#[async_trait]
impl Host for LocalHost {
    async fn listen_port(&self) -> HostResult<u16> {
        // A single listen port is reported; UDP is what the mapping is compared against first
        Ok(self.ports.read().0)
    }

    async fn set_listen_ports(&self, udp_port: u16, tcp_port: u16) -> HostResult<()> {
        *self.ports.write() = (udp_port, tcp_port);
        tracing::info!("Listen ports set to {} / {}", udp_port, tcp_port);
        Ok(())
    }

    async fn session_state(&self) -> HostResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn force_reannounce(&self, items: &[String]) -> HostResult<()> {
        tracing::debug!("Nothing to re-announce ({} items)", items.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_host_tracks_ports() {
        let host = LocalHost::new(6881);
        assert_eq!(host.listen_port().await.unwrap(), 6881);

        host.set_listen_ports(51413, 51414).await.unwrap();
        assert_eq!(host.listen_port().await.unwrap(), 51413);
        assert_eq!(host.ports(), (51413, 51414));
        assert!(host.session_state().await.unwrap().is_empty());
    }
}
