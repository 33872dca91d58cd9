// src/scheduler/mod.rs
//! Refresh scheduler
//!
//! While running, a single ticker task renews the UDP and TCP mappings every
//! `refresh_interval` and follows any port change through to the host. Cycles
//! never overlap: a cycle requested while another is in flight is skipped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::{Backend, Config};
use crate::error::MapperResult;
use crate::host::Host;
use crate::mapper::{MappingRequest, MappingResult, Negotiation, Negotiator, Protocol};
use crate::notifier::{Notifier, PortChange};
use crate::process::is_executable_valid;
use crate::status::Status;

/// Result of one refresh cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Another cycle was still running
    Skipped,

    /// A negotiation failed or could not be parsed; nothing was changed
    Aborted,

    /// The host already listens on the mapped ports
    Unchanged,

    /// Host, status and handlers were switched to new ports
    Changed(PortChange),
}

/// Why `start` did or did not start the ticker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    Disabled,
    InvalidExecutable,
    InvalidConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Running,
}

struct Timer {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Everything a cycle touches, shared with the ticker task
struct CycleContext {
    config: Arc<RwLock<Config>>,
    status: Arc<RwLock<Status>>,
    negotiator: Arc<dyn Negotiator>,
    host: Arc<dyn Host>,
    notifier: Notifier,

    /// Held for the duration of a cycle
    cycle_lock: Mutex<()>,
}

pub struct Scheduler {
    ctx: Arc<CycleContext>,
    timer: Mutex<Option<Timer>>,
    running: AtomicBool,
    generation: AtomicU64,
}

impl Scheduler {
    pub fn new(
        config: Arc<RwLock<Config>>,
        status: Arc<RwLock<Status>>,
        negotiator: Arc<dyn Negotiator>,
        host: Arc<dyn Host>,
        notifier: Notifier,
    ) -> Self {
        Self {
            ctx: Arc::new(CycleContext {
                config,
                status,
                negotiator,
                host,
                notifier,
                cycle_lock: Mutex::new(()),
            }),
            timer: Mutex::new(None),
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SchedulerState {
        if self.running.load(Ordering::SeqCst) {
            SchedulerState::Running
        } else {
            SchedulerState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    /// Number of times the ticker has been started
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Start the ticker if the config allows it; the first cycle runs immediately
    pub async fn start(&self) -> StartOutcome {
        let mut timer = self.timer.lock().await;
        if timer.is_some() {
            return StartOutcome::AlreadyRunning;
        }

        let config = self.ctx.config.read().clone();
        if !config.enabled {
            tracing::debug!("Refresh timer not started: disabled");
            return StartOutcome::Disabled;
        }
        if config.backend == Backend::Command && !is_executable_valid(&config.exec_path) {
            tracing::warn!(
                "Refresh timer not started: '{}' is not a valid executable",
                config.exec_path
            );
            return StartOutcome::InvalidExecutable;
        }
        if let Err(e) = config.validate() {
            tracing::warn!("Refresh timer not started: {}", e);
            return StartOutcome::InvalidConfig;
        }

        let period = config.refresh_period();
        tracing::debug!("Starting refresh timer with interval {:?}", period);

        let (stop, stopped) = oneshot::channel();
        let ctx = self.ctx.clone();
        let handle = tokio::spawn(async move { ctx.run_timer(period, stopped).await });

        *timer = Some(Timer { stop, handle });
        self.running.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        StartOutcome::Started
    }

    /// Stop the ticker, waiting for an in-flight cycle to finish.
    ///
    /// Returns false if it was not running.
    pub async fn stop(&self) -> bool {
        let mut timer = self.timer.lock().await;
        let Some(Timer { stop, handle }) = timer.take() else {
            return false;
        };

        self.running.store(false, Ordering::SeqCst);
        tracing::debug!("Stopping refresh timer");

        let _ = stop.send(());
        if let Err(e) = handle.await {
            tracing::warn!("Refresh timer task ended abnormally: {}", e);
        }
        true
    }

    /// Run one cycle now, unless one is already in flight
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.ctx.run_cycle().await
    }
}

impl CycleContext {
    async fn run_timer(&self, period: Duration, mut stopped: oneshot::Receiver<()>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut stopped => break,
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }
    }

    async fn run_cycle(&self) -> CycleOutcome {
        let Ok(_cycle) = self.cycle_lock.try_lock() else {
            tracing::debug!("Refresh cycle still in flight, skipping");
            return CycleOutcome::Skipped;
        };

        let config = self.config.read().clone();
        let udp_request = MappingRequest::from_config(&config, Protocol::Udp);
        let tcp_request = MappingRequest::from_config(&config, Protocol::Tcp);

        let (udp, tcp) = tokio::join!(
            self.negotiator.negotiate(&udp_request),
            self.negotiator.negotiate(&tcp_request)
        );
        let (udp, udp_output) = unpack(Protocol::Udp, udp);
        let (tcp, tcp_output) = unpack(Protocol::Tcp, tcp);

        let (Some((_, new_udp)), Some((_, new_tcp))) = (udp.granted(), tcp.granted()) else {
            tracing::warn!("Failed to update NAT-PMP mapped port");
            tracing::warn!("UDP output: {}", udp_output.trim_end());
            tracing::warn!("TCP output: {}", tcp_output.trim_end());
            return CycleOutcome::Aborted;
        };
        let public_ip = udp.public_ip.or(tcp.public_ip);

        let current_port = match self.host.listen_port().await {
            Ok(port) => port,
            Err(e) => {
                tracing::warn!("Could not read the current listen port: {}", e);
                return CycleOutcome::Aborted;
            }
        };

        if current_port == new_udp && current_port == new_tcp {
            tracing::debug!("Port {} already mapped", current_port);
            let mut status = self.status.write();
            if status.current_ports != Some((new_udp, new_tcp)) {
                *status = Status {
                    last_update: Some(Local::now()),
                    public_ip,
                    current_ports: Some((new_udp, new_tcp)),
                };
            }
            return CycleOutcome::Unchanged;
        }

        *self.status.write() = Status {
            last_update: Some(Local::now()),
            public_ip,
            current_ports: Some((new_udp, new_tcp)),
        };

        if let Err(e) = self.host.set_listen_ports(new_udp, new_tcp).await {
            tracing::warn!("Failed to apply listen ports {} / {}: {}", new_udp, new_tcp, e);
        } else {
            tracing::info!(
                "Changed listening port from {} to {},{}",
                current_port,
                new_udp,
                new_tcp
            );
        }

        let change = PortChange {
            old_port: current_port,
            udp_port: new_udp,
            tcp_port: new_tcp,
        };
        self.notifier.notify(&change, &config).await;

        self.reannounce().await;

        CycleOutcome::Changed(change)
    }

    async fn reannounce(&self) {
        tracing::info!("Reannouncing work items");
        let items = match self.host.session_state().await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!("Could not list work items to reannounce: {}", e);
                return;
            }
        };

        match self.host.force_reannounce(&items).await {
            Ok(()) => tracing::info!("{} work items reannounced", items.len()),
            Err(e) => tracing::warn!("Reannounce failed: {}", e),
        }
    }
}

/// Log a failed negotiation and reduce it to (result, raw output)
fn unpack(protocol: Protocol, negotiation: MapperResult<Negotiation>) -> (MappingResult, String) {
    match negotiation {
        Ok(Negotiation { result, output }) => (result, output),
        Err(e) => {
            tracing::warn!("Refresh {} port: {}", protocol, e);
            let output = e.output().to_string();
            if !output.trim().is_empty() {
                tracing::warn!("{}", output.trim_end());
            }
            (MappingResult::default(), output)
        }
    }
}
