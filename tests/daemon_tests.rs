// tests/daemon_tests.rs
//! Daemon level tests: config updates, status surface, control socket

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use natpmpd::control::{ControlClient, ControlServer, Request, Response};
use natpmpd::error::{ControlError, MapperResult};
use natpmpd::mapper::{MappingRequest, Negotiation};
use natpmpd::scheduler::SchedulerState;
use natpmpd::{
    Backend, Config, ConfigPatch, ConfigStore, CycleOutcome, Daemon, LocalHost, MappingResult,
    Negotiator, Notifier, StartOutcome,
};

fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// Grants fixed ports and records the persisted refresh interval seen by each call
struct FileWatchingNegotiator {
    udp_port: u16,
    tcp_port: u16,
    config_path: PathBuf,
    seen_intervals: Mutex<Vec<u64>>,
}

#[async_trait]
impl Negotiator for FileWatchingNegotiator {
    async fn negotiate(&self, request: &MappingRequest) -> MapperResult<Negotiation> {
        if let Ok(config) = ConfigStore::new(&self.config_path).load() {
            self.seen_intervals.lock().push(config.refresh_interval);
        }

        let port = match request.protocol {
            natpmpd::Protocol::Udp => self.udp_port,
            natpmpd::Protocol::Tcp => self.tcp_port,
        };
        let result = MappingResult {
            protocol: Some(request.protocol),
            gateway: request.gateway.parse().ok(),
            public_ip: Some("203.0.113.9".parse().unwrap()),
            public_port: Some(port),
            private_port: Some(request.private_port),
            lifetime: Some(request.lifetime),
        };
        Ok(Negotiation {
            output: result.to_string(),
            result,
        })
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    daemon: Arc<Daemon>,
    negotiator: Arc<FileWatchingNegotiator>,
    host: Arc<LocalHost>,
    store: ConfigStore,
}

fn harness(enabled: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::new(dir.path().join("natpmpd.json"));
    let config = Config {
        enabled,
        backend: Backend::Native,
        refresh_interval: 3600,
        preferred_public_port: 51413,
        preferred_private_port: 51413,
        ..Config::default()
    };
    store.save(&config).unwrap();

    let negotiator = Arc::new(FileWatchingNegotiator {
        udp_port: 51413,
        tcp_port: 51414,
        config_path: store.path().to_path_buf(),
        seen_intervals: Mutex::new(Vec::new()),
    });
    let host = Arc::new(LocalHost::new(6881));

    let daemon = Arc::new(
        Daemon::load(store.clone(), negotiator.clone(), host.clone(), Notifier::empty()).unwrap(),
    );

    Harness {
        _dir: dir,
        daemon,
        negotiator,
        host,
        store,
    }
}

async fn wait_for_calls(negotiator: &FileWatchingNegotiator, calls: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while negotiator.seen_intervals.lock().len() < calls {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("negotiator was not called in time");
}

#[tokio::test]
async fn test_config_change_restarts_after_persisting() {
    setup_test_logging();
    let h = harness(true);

    assert_eq!(h.daemon.start().await, StartOutcome::Started);
    wait_for_calls(&h.negotiator, 2).await;
    assert_eq!(h.daemon.scheduler().generation(), 1);

    let changed = h
        .daemon
        .set_config(ConfigPatch {
            refresh_interval: Some(1800),
            ..ConfigPatch::default()
        })
        .await
        .unwrap();
    assert!(changed);
    assert_eq!(h.daemon.scheduler().generation(), 2);
    assert_eq!(h.daemon.scheduler_state(), SchedulerState::Running);

    // The restarted timer's first cycle already sees the saved value
    wait_for_calls(&h.negotiator, 4).await;
    let seen = h.negotiator.seen_intervals.lock().clone();
    assert_eq!(&seen[..2], &[3600, 3600]);
    assert_eq!(&seen[2..4], &[1800, 1800]);

    assert_eq!(h.store.load().unwrap().refresh_interval, 1800);
    h.daemon.shutdown().await;
}

#[tokio::test]
async fn test_unchanged_patch_keeps_scheduler_running() {
    let h = harness(true);
    h.daemon.start().await;

    let changed = h
        .daemon
        .set_config(ConfigPatch {
            refresh_interval: Some(3600),
            enabled: Some(true),
            ..ConfigPatch::default()
        })
        .await
        .unwrap();

    assert!(!changed);
    assert_eq!(h.daemon.scheduler().generation(), 1);
    assert!(h.daemon.scheduler().is_running());

    // Still written back to the daemon's store
    assert_eq!(h.daemon.config_path(), h.store.path());
    assert_eq!(h.store.load().unwrap(), h.daemon.get_config());
    h.daemon.shutdown().await;
}

#[tokio::test]
async fn test_disable_and_enable() {
    let h = harness(false);
    assert_eq!(h.daemon.start().await, StartOutcome::Disabled);
    assert_eq!(h.daemon.scheduler_state(), SchedulerState::Stopped);

    h.daemon
        .set_config(ConfigPatch {
            enabled: Some(true),
            ..ConfigPatch::default()
        })
        .await
        .unwrap();
    assert_eq!(h.daemon.scheduler_state(), SchedulerState::Running);

    h.daemon
        .set_config(ConfigPatch {
            enabled: Some(false),
            ..ConfigPatch::default()
        })
        .await
        .unwrap();
    assert_eq!(h.daemon.scheduler_state(), SchedulerState::Stopped);
    assert!(!h.store.load().unwrap().enabled);
}

#[tokio::test]
async fn test_invalid_patch_is_rejected_without_side_effects() {
    let h = harness(true);
    h.daemon.start().await;

    let result = h
        .daemon
        .set_config(ConfigPatch {
            refresh_interval: Some(0),
            ..ConfigPatch::default()
        })
        .await;

    assert!(result.is_err());
    assert_eq!(h.daemon.get_config().refresh_interval, 3600);
    assert_eq!(h.daemon.scheduler().generation(), 1);
    assert!(h.daemon.scheduler().is_running());
    h.daemon.shutdown().await;
}

#[tokio::test]
async fn test_refresh_updates_status_and_host() {
    let h = harness(false);
    assert_eq!(h.daemon.get_status().current_port, "");

    let outcome = h.daemon.refresh_now().await;
    assert!(matches!(outcome, CycleOutcome::Changed(change) if change.old_port == 6881));

    let status = h.daemon.get_status();
    assert_eq!(status.current_port, "51413 / 51414");
    assert_eq!(status.public_ip_address, "203.0.113.9");
    assert_eq!(h.host.ports(), (51413, 51414));

    h.daemon.shutdown().await;
    assert_eq!(h.daemon.get_status().current_port, "");
}

#[tokio::test]
async fn test_control_socket_round_trip() {
    setup_test_logging();
    let h = harness(false);

    let server = ControlServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let serve = tokio::spawn(server.serve(h.daemon.clone(), async {
        let _ = stopped.await;
    }));

    let client = ControlClient::new(addr);

    match client.call(Request::GetConfig).await.unwrap() {
        Response::Config { config } => assert_eq!(config.refresh_interval, 3600),
        other => panic!("unexpected response: {:?}", other),
    }

    let mut patch = ConfigPatch::default();
    patch.set_from_str("lifetime_interval", "120").unwrap();
    assert_eq!(
        client.call(Request::SetConfig { patch }).await.unwrap(),
        Response::ConfigUpdated { changed: true }
    );
    assert_eq!(h.store.load().unwrap().lifetime_interval, 120);

    assert!(matches!(
        client.call(Request::Refresh).await.unwrap(),
        Response::Refreshed {
            outcome: CycleOutcome::Changed(_)
        }
    ));

    match client.call(Request::GetStatus).await.unwrap() {
        Response::Status { status, scheduler } => {
            assert_eq!(status.current_port, "51413 / 51414");
            assert_eq!(scheduler, SchedulerState::Stopped);
        }
        other => panic!("unexpected response: {:?}", other),
    }

    assert_eq!(
        client
            .call(Request::IsExecutableValid {
                path: "/no/such/natpmpc".to_string()
            })
            .await
            .unwrap(),
        Response::ExecutableValid { valid: false }
    );

    let invalid = client
        .call(Request::SetConfig {
            patch: ConfigPatch {
                refresh_interval: Some(0),
                ..ConfigPatch::default()
            },
        })
        .await;
    assert!(matches!(invalid, Err(ControlError::Remote(_))));

    let _ = stop.send(());
    serve.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_control_rejects_other_versions_and_garbage() {
    let h = harness(false);

    let server = ControlServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let serve = tokio::spawn(server.serve(h.daemon.clone(), async {
        let _ = stopped.await;
    }));

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    write
        .write_all(b"{\"version\":2,\"request\":{\"type\":\"get_status\"}}\n")
        .await
        .unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    assert!(reply.contains("\"type\":\"error\""));
    assert!(reply.contains("version 2"));

    write.write_all(b"not json\n").await.unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    assert!(reply.contains("\"type\":\"error\""));

    // Connection stays usable after errors
    write
        .write_all(b"{\"version\":1,\"request\":{\"type\":\"get_status\"}}\n")
        .await
        .unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    assert!(reply.contains("\"type\":\"status\""));

    drop(write);
    let _ = stop.send(());
    serve.await.unwrap().unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_backend_end_to_end() {
    use natpmpd::Mapper;

    let dir = tempfile::tempdir().unwrap();
    let helper = dir.path().join("natpmpc.sh");
    let hook_log = dir.path().join("hook.log");
    let hook = dir.path().join("hook.sh");

    // Gateway hands out a different TCP port than UDP
    std::fs::write(
        &helper,
        r#"
echo "initnatpmp() returned 0 (SUCCESS)"
echo "using gateway : $7"
echo "Public IP address : 203.0.113.9"
if [ "$4" = "udp" ]; then
  echo "Mapped public port 51413 protocol UDP to local port $3 lifetime $5"
else
  echo "Mapped public port 51414 protocol TCP to local port $3 lifetime $5"
fi
"#,
    )
    .unwrap();
    std::fs::write(&hook, format!("echo \"$@\" >> {}\n", hook_log.display())).unwrap();

    let store = ConfigStore::new(dir.path().join("natpmpd.json"));
    let config = Config {
        enabled: true,
        exec_path: format!("sh {}", helper.display()),
        portchange_command: format!("sh {}", hook.display()),
        preferred_public_port: 51413,
        preferred_private_port: 51413,
        timeout: 5,
        ..Config::default()
    };
    let host = Arc::new(LocalHost::new(51413));
    let daemon = Daemon::new(store, config, Arc::new(Mapper::new()), host.clone(), Notifier::default());

    let outcome = daemon.refresh_now().await;
    assert!(matches!(outcome, CycleOutcome::Changed(_)), "{:?}", outcome);
    assert_eq!(daemon.get_status().current_port, "51413 / 51414");
    assert_eq!(host.ports(), (51413, 51414));

    let hook_calls = std::fs::read_to_string(&hook_log).unwrap();
    assert_eq!(hook_calls.lines().collect::<Vec<_>>(), vec!["51413 51413 51414"]);

    // Host still reports 51413 as its single listen port, so the TCP port differs again
    let again = daemon.refresh_now().await;
    assert!(matches!(again, CycleOutcome::Changed(_)));
}
