//! Control messages exchanged with the daemon
//!
//! One JSON object per line. Every request carries the protocol version so
//! the daemon can refuse clients it does not understand.

use serde::{Deserialize, Serialize};

use crate::config::{Config, ConfigPatch};
use crate::scheduler::{CycleOutcome, SchedulerState};
use crate::status::StatusReport;

/// Current control protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Request envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub request: Request,
}

impl Envelope {
    pub fn new(request: Request) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    GetConfig,
    SetConfig { patch: ConfigPatch },
    GetStatus,
    IsExecutableValid { path: String },
    /// Run a refresh cycle now
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Config { config: Config },
    ConfigUpdated { changed: bool },
    Status {
        status: StatusReport,
        scheduler: SchedulerState,
    },
    ExecutableValid { valid: bool },
    Refreshed { outcome: CycleOutcome },
    Error { message: String },
}
