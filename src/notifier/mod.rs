//! Port-change notification
//!
//! Handlers run after the host has been switched to the new ports. They are
//! best effort: a failing handler is logged and the rest still run.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::HookError;
use crate::process::{is_executable_valid, run_with_timeout, split_command, CommandOutcome};

/// Listen port before the change and the newly mapped ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortChange {
    pub old_port: u16,
    pub udp_port: u16,
    pub tcp_port: u16,
}

#[async_trait]
pub trait PortChangeHandler: Send + Sync {
    /// Name used in log lines
    fn name(&self) -> &str;

    /// React to a change; `config` is the snapshot the cycle ran with
    async fn on_port_change(&self, change: &PortChange, config: &Config) -> Result<(), HookError>;
}

/// Runs `portchange_command <old> <udp> <tcp>`
#[derive(Debug, Default)]
pub struct CommandHook;

#[async_trait]
impl PortChangeHandler for CommandHook {
    fn name(&self) -> &str {
        "port change command"
    }

    async fn on_port_change(&self, change: &PortChange, config: &Config) -> Result<(), HookError> {
        let command = config.portchange_command.trim();
        if command.is_empty() {
            return Ok(());
        }
        if !is_executable_valid(command) {
            tracing::warn!("Port change command '{}' is not executable, skipping", command);
            return Ok(());
        }

        let Some((program, extra)) = split_command(command) else {
            return Ok(());
        };
        let mut args: Vec<String> = extra.into_iter().map(str::to_string).collect();
        args.extend([
            change.old_port.to_string(),
            change.udp_port.to_string(),
            change.tcp_port.to_string(),
        ]);

        tracing::debug!("Port change command: run");
        let timeout = config.process_timeout();
        let outcome = run_with_timeout(program, &args, timeout)
            .await
            .map_err(|source| HookError::Spawn {
                program: program.to_string(),
                source,
            })?;

        match outcome {
            CommandOutcome::Exited { status, output } if status.success() => {
                tracing::debug!("Port change command: done");
                if !output.trim().is_empty() {
                    tracing::debug!("{}", output.trim_end());
                }
                Ok(())
            }
            CommandOutcome::Exited { status, output } => Err(HookError::Failed {
                code: status.code(),
                output,
            }),
            CommandOutcome::TimedOut { output } => Err(HookError::TimedOut {
                timeout: timeout.unwrap_or_default(),
                output,
            }),
        }
    }
}

/// Only logs the change
#[derive(Debug, Default)]
pub struct LogHandler;

#[async_trait]
impl PortChangeHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn on_port_change(&self, change: &PortChange, _config: &Config) -> Result<(), HookError> {
        tracing::info!(
            old = change.old_port,
            udp = change.udp_port,
            tcp = change.tcp_port,
            "Mapped port changed"
        );
        Ok(())
    }
}

/// Ordered set of handlers
#[derive(Clone)]
pub struct Notifier {
    handlers: Vec<Arc<dyn PortChangeHandler>>,
}

impl Default for Notifier {
    /// Notifier running the configured port change command
    fn default() -> Self {
        Self::empty().with_handler(Arc::new(CommandHook))
    }
}

impl Notifier {
    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn PortChangeHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every handler in registration order; returns how many failed
    pub async fn notify(&self, change: &PortChange, config: &Config) -> usize {
        let mut failures = 0;

        for handler in &self.handlers {
            if let Err(e) = handler.on_port_change(change, config).await {
                failures += 1;
                tracing::warn!("{}: {}", handler.name(), e);
                if let HookError::Failed { output, .. } | HookError::TimedOut { output, .. } = &e {
                    if !output.trim().is_empty() {
                        tracing::warn!("{}", output.trim_end());
                    }
                }
            }
        }

        failures
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|h| h.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<PortChange>>,
    }

    #[async_trait]
    impl PortChangeHandler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn on_port_change(&self, change: &PortChange, _config: &Config) -> Result<(), HookError> {
            self.seen.lock().push(*change);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl PortChangeHandler for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_port_change(&self, _change: &PortChange, _config: &Config) -> Result<(), HookError> {
            Err(HookError::Other("webhook unreachable".to_string()))
        }
    }

    const CHANGE: PortChange = PortChange {
        old_port: 6881,
        udp_port: 51413,
        tcp_port: 51414,
    };

    #[tokio::test]
    async fn test_failure_does_not_stop_later_handlers() {
        let recorder = Arc::new(Recorder::default());
        let notifier = Notifier::empty()
            .with_handler(Arc::new(Failing))
            .with_handler(recorder.clone());

        let failures = notifier.notify(&CHANGE, &Config::default()).await;

        assert_eq!(failures, 1);
        assert_eq!(*recorder.seen.lock(), vec![CHANGE]);
    }

    #[tokio::test]
    async fn test_empty_command_is_skipped() {
        let config = Config::default();
        assert!(CommandHook.on_port_change(&CHANGE, &config).await.is_ok());

        let config = Config {
            portchange_command: "/no/such/hook.sh".to_string(),
            ..Config::default()
        };
        assert!(CommandHook.on_port_change(&CHANGE, &config).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_receives_positional_ports() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("hook.sh");
        let record = dir.path().join("args.txt");
        std::fs::write(&script, format!("echo \"$@\" > {}\n", record.display())).unwrap();

        let config = Config {
            portchange_command: format!("sh {}", script.display()),
            ..Config::default()
        };
        CommandHook.on_port_change(&CHANGE, &config).await.unwrap();

        let args = std::fs::read_to_string(&record).unwrap();
        assert_eq!(args.trim(), "6881 51413 51414");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_command_is_cut_off() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("hook.sh");
        std::fs::write(&script, "echo hook started\nsleep 6\necho hook finished\n").unwrap();

        let config = Config {
            portchange_command: format!("sh {}", script.display()),
            timeout: 1,
            ..Config::default()
        };

        let begun = std::time::Instant::now();
        let err = CommandHook.on_port_change(&CHANGE, &config).await.unwrap_err();
        assert!(begun.elapsed() < Duration::from_secs(4), "took {:?}", begun.elapsed());

        match err {
            HookError::TimedOut { timeout, output } => {
                assert_eq!(timeout, Duration::from_secs(1));
                assert!(output.contains("hook started"));
                assert!(!output.contains("hook finished"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command_is_reported() {
        let config = Config {
            portchange_command: "sh -c exit_7_please".to_string(),
            ..Config::default()
        };
        let err = CommandHook.on_port_change(&CHANGE, &config).await.unwrap_err();
        assert!(matches!(err, HookError::Failed { .. }));

        // Counted as a failure but never propagated
        let notifier = Notifier::default();
        assert_eq!(notifier.len(), 1);
        assert_eq!(notifier.notify(&CHANGE, &config).await, 1);
    }
}
