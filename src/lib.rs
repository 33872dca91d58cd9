//! natpmpd library (lib.rs)
//!
//! Keeps a NAT-PMP port mapping alive for an application and follows the
//! mapped port when the gateway hands out a different one.
//!
//! Flow of one refresh cycle: the [`Scheduler`] ticks, the [`Mapper`]
//! negotiates UDP and TCP, the scheduler compares the granted ports with the
//! host's listen port and on a change updates [`Status`], switches the
//! [`Host`], runs the [`Notifier`] handlers and asks the host to re-announce.

#![warn(clippy::all)]

pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod host;
pub mod mapper;
pub mod notifier;
pub mod process;
pub mod scheduler;
pub mod status;

// Re-export main types
pub use config::{Backend, Config, ConfigPatch, ConfigStore};
pub use daemon::Daemon;
pub use host::{Host, LocalHost};
pub use mapper::{MappingResult, Mapper, Negotiator, Protocol};
pub use notifier::{Notifier, PortChange, PortChangeHandler};
pub use scheduler::{CycleOutcome, Scheduler, StartOutcome};
pub use status::{Status, StatusReport};

// Re-export error types
pub use error::{ConfigError, HookError, HostError, MapperError, NatPmpError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging system
///
/// `RUST_LOG` takes precedence over `level` when set.
///
/// # Example
/// ```no_run
/// natpmpd::init_logging("info");
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(true),
        )
        .with(filter)
        .init();
}
