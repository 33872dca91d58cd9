//! Daemon: owns config and status and ties the scheduler to config changes

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::config::{Config, ConfigPatch, ConfigStore};
use crate::error::ConfigResult;
use crate::host::Host;
use crate::mapper::Negotiator;
use crate::notifier::Notifier;
use crate::process;
use crate::scheduler::{CycleOutcome, Scheduler, SchedulerState, StartOutcome};
use crate::status::{Status, StatusReport};

pub struct Daemon {
    config: Arc<RwLock<Config>>,
    status: Arc<RwLock<Status>>,
    store: ConfigStore,
    scheduler: Scheduler,

    /// Serialises `set_config` calls
    update_lock: Mutex<()>,
}

impl Daemon {
    /// Build a daemon around an already loaded config; nothing runs until [`Daemon::start`]
    pub fn new(
        store: ConfigStore,
        config: Config,
        negotiator: Arc<dyn Negotiator>,
        host: Arc<dyn Host>,
        notifier: Notifier,
    ) -> Self {
        let config = Arc::new(RwLock::new(config));
        let status = Arc::new(RwLock::new(Status::default()));
        let scheduler = Scheduler::new(config.clone(), status.clone(), negotiator, host, notifier);

        Self {
            config,
            status,
            store,
            scheduler,
            update_lock: Mutex::new(()),
        }
    }

    /// Load the config from `store` and build the daemon
    pub fn load(
        store: ConfigStore,
        negotiator: Arc<dyn Negotiator>,
        host: Arc<dyn Host>,
        notifier: Notifier,
    ) -> ConfigResult<Self> {
        let config = store.load()?;
        Ok(Self::new(store, config, negotiator, host, notifier))
    }

    /// Start refreshing if enabled
    pub async fn start(&self) -> StartOutcome {
        let outcome = self.scheduler.start().await;
        tracing::info!("NAT-PMP daemon started ({:?})", outcome);
        outcome
    }

    /// Stop refreshing and forget the last status
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        *self.status.write() = Status::default();
        tracing::info!("NAT-PMP daemon stopped");
    }

    pub fn get_config(&self) -> Config {
        self.config.read().clone()
    }

    /// Apply a partial config update and persist it.
    ///
    /// When any value actually changes the scheduler is stopped first and
    /// started again (if still enabled) only after the new config is saved.
    /// Returns whether anything changed.
    pub async fn set_config(&self, patch: ConfigPatch) -> ConfigResult<bool> {
        let _update = self.update_lock.lock().await;

        let mut updated = self.get_config();
        patch.apply_to(&mut updated);
        updated.validate()?;

        let changed = patch.differs_from(&self.config.read());
        if changed {
            self.scheduler.stop().await;
        }

        *self.config.write() = updated.clone();
        let saved = self.store.save(&updated);

        if changed {
            tracing::info!("Configuration changed");
            self.scheduler.start().await;
        }

        saved.map(|()| changed)
    }

    pub fn get_status(&self) -> StatusReport {
        self.status.read().report()
    }

    pub fn is_executable_valid(&self, path: &str) -> bool {
        process::is_executable_valid(path)
    }

    /// Run one refresh cycle right away
    pub async fn refresh_now(&self) -> CycleOutcome {
        self.scheduler.run_cycle().await
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config_path(&self) -> &std::path::Path {
        self.store.path()
    }
}
