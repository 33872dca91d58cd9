//! Local control surface
//!
//! Serves versioned JSON requests over a localhost TCP socket, one message
//! per line, and provides the matching client used by the CLI.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};

use crate::daemon::Daemon;
use crate::error::{ControlError, ControlResult};

pub mod protocol;

pub use protocol::{Envelope, Request, Response, PROTOCOL_VERSION};

/// Default control address
pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:58847";

/// Longest accepted line
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Answer one request
pub async fn handle_request(daemon: &Daemon, envelope: Envelope) -> Response {
    if envelope.version != PROTOCOL_VERSION {
        return Response::Error {
            message: ControlError::UnsupportedVersion(envelope.version).to_string(),
        };
    }

    match envelope.request {
        Request::GetConfig => Response::Config {
            config: daemon.get_config(),
        },
        Request::SetConfig { patch } => match daemon.set_config(patch).await {
            Ok(changed) => Response::ConfigUpdated { changed },
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        },
        Request::GetStatus => Response::Status {
            status: daemon.get_status(),
            scheduler: daemon.scheduler_state(),
        },
        Request::IsExecutableValid { path } => Response::ExecutableValid {
            valid: daemon.is_executable_valid(&path),
        },
        Request::Refresh => Response::Refreshed {
            outcome: daemon.refresh_now().await,
        },
    }
}

/// Parse a request line and answer it; malformed lines get an error response
pub async fn handle_line(daemon: &Daemon, line: &str) -> Response {
    match serde_json::from_str::<Envelope>(line) {
        Ok(envelope) => handle_request(daemon, envelope).await,
        Err(e) => Response::Error {
            message: ControlError::Json(e).to_string(),
        },
    }
}

pub struct ControlServer {
    listener: TcpListener,
}

impl ControlServer {
    pub async fn bind(addr: SocketAddr) -> ControlResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Control socket listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> ControlResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until `shutdown` resolves
    pub async fn serve<F>(self, daemon: Arc<Daemon>, shutdown: F) -> ControlResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::debug!("Control socket shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!("Control accept failed: {}", e);
                            continue;
                        }
                    };

                    let daemon = daemon.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, &daemon).await {
                            tracing::debug!("Control client {} error: {}", peer, e);
                        }
                    });
                }
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, daemon: &Daemon) -> ControlResult<()> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    while let Some(line) = framed.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let response = handle_line(daemon, &line).await;
        framed.send(serde_json::to_string(&response)?).await?;
    }

    Ok(())
}

/// Client side of the control socket
#[derive(Debug, Clone)]
pub struct ControlClient {
    addr: SocketAddr,
}

impl ControlClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Send one request and wait for its response
    pub async fn call(&self, request: Request) -> ControlResult<Response> {
        let stream = TcpStream::connect(self.addr).await?;
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        framed
            .send(serde_json::to_string(&Envelope::new(request))?)
            .await?;

        let line = framed.next().await.ok_or(ControlError::ConnectionClosed)??;
        match serde_json::from_str::<Response>(&line)? {
            Response::Error { message } => Err(ControlError::Remote(message)),
            response => Ok(response),
        }
    }
}
