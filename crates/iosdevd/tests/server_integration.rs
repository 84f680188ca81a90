//! End-to-end tests: daemon server and client over a real Unix socket.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use iosdev_core::{DeviceId, TransportKind};
use iosdev_protocol::{ClientMessage, DaemonMessage, MessageType, RelaySource};
use iosdevd::backend::sim::{PeerMode, SimBackend, SimDeviceSpec};
use iosdevd::client::{ClientConfig, ClientError, DaemonClient};
use iosdevd::server::{DaemonServer, ServerError};
use iosdevd::{DeviceWatcher, WatcherConfig};

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    sim: SimBackend,
    socket_path: PathBuf,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), ServerError>>,
    _dir: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let sim = SimBackend::with_mode(PeerMode::Serve);
        let mut spec = SimDeviceSpec::new("sim-1")
            .property("DeviceName", "Test iPhone")
            .property("ProductVersion", "17.4");
        spec.syslog = vec!["launchd: hello".into(), "kernel: world".into()];
        sim.attach(spec, TransportKind::Local);

        let config = WatcherConfig {
            settle_window: Duration::from_millis(20),
            settle_timeout: Duration::from_secs(2),
        };
        let backend = Arc::new(sim.clone());
        let watcher =
            tokio::task::block_in_place(|| DeviceWatcher::start(backend, config)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("iosdev.sock");
        let cancel = CancellationToken::new();
        let server = DaemonServer::new(&socket_path, Arc::new(watcher), cancel.clone());
        let task = tokio::spawn(async move { server.run().await });

        Self {
            sim,
            socket_path,
            cancel,
            task,
            _dir: dir,
        }
    }

    async fn client(&self) -> DaemonClient {
        let config = ClientConfig {
            socket_path: self.socket_path.clone(),
            client_id: Some("test-client".into()),
            max_attempts: 50,
            retry_initial_delay: Duration::from_millis(10),
            retry_max_delay: Duration::from_millis(50),
            ..Default::default()
        };
        DaemonClient::connect(&config).await.unwrap()
    }

    async fn stop(self) {
        self.cancel.cancel();
        timeout(WAIT, self.task).await.unwrap().unwrap().unwrap();
        assert!(!self.socket_path.exists());
    }
}

async fn next(client: &mut DaemonClient) -> DaemonMessage {
    timeout(WAIT, client.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handshake_and_list() {
    let server = TestServer::start().await;
    let mut client = server.client().await;
    assert_eq!(client.client_id(), "test-client");

    match client.request(&ClientMessage::list_devices()).await.unwrap() {
        DaemonMessage::DeviceList { devices } => {
            assert_eq!(devices.len(), 1);
            assert_eq!(devices[0].udid, DeviceId::new("sim-1"));
            assert_eq!(devices[0].properties.name, "Test iPhone");
        }
        other => panic!("unexpected reply {other:?}"),
    }

    match client.request(&ClientMessage::ping(7)).await.unwrap() {
        DaemonMessage::Pong { seq } => assert_eq!(seq, 7),
        other => panic!("unexpected reply {other:?}"),
    }

    client.disconnect().await.unwrap();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watch_streams_changes() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    client.expect_ok(&ClientMessage::watch()).await.unwrap();
    match next(&mut client).await {
        DaemonMessage::DevicesChanged { devices } => assert_eq!(devices.len(), 1),
        other => panic!("expected snapshot, got {other:?}"),
    }

    server
        .sim
        .attach(SimDeviceSpec::new("sim-2"), TransportKind::Network);
    loop {
        match next(&mut client).await {
            DaemonMessage::DevicesChanged { devices } if devices.len() == 2 => break,
            DaemonMessage::DevicesChanged { .. } => continue,
            other => panic!("unexpected message {other:?}"),
        }
    }

    client.expect_ok(&ClientMessage::unwatch()).await.unwrap();
    client.disconnect().await.unwrap();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_syslog_lines_reach_client() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    client
        .expect_ok(&ClientMessage::start_syslog("sim-1"))
        .await
        .unwrap();

    let mut lines = Vec::new();
    while lines.len() < 2 {
        match next(&mut client).await {
            DaemonMessage::RelayData { udid, source, line } => {
                assert_eq!(udid, DeviceId::new("sim-1"));
                assert_eq!(source, RelaySource::Syslog);
                lines.push(line);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert_eq!(lines, vec!["launchd: hello", "kernel: world"]);

    client
        .expect_ok(&ClientMessage::stop_syslog("sim-1"))
        .await
        .unwrap();
    client.disconnect().await.unwrap();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forward_start_and_stop() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    client
        .expect_ok(&ClientMessage::start_forward("sim-1", 8080))
        .await
        .unwrap();
    // Starting again replaces the previous listener
    client
        .expect_ok(&ClientMessage::start_forward("sim-1", 8080))
        .await
        .unwrap();
    client
        .expect_ok(&ClientMessage::stop_forward("sim-1", 8080))
        .await
        .unwrap();

    server.sim.refuse_port(9);
    match client.request(&ClientMessage::start_forward("sim-1", 9)).await {
        Err(ClientError::Daemon { code, .. }) => {
            assert_eq!(code.as_deref(), Some("port_connect_failed"))
        }
        other => panic!("expected port error, got {other:?}"),
    }

    client.disconnect().await.unwrap();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_errors_carry_codes() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let cases = [
        (ClientMessage::start_syslog("missing"), "device_not_found"),
        (ClientMessage::start_forward("sim-1", 0), "invalid_argument"),
        (
            ClientMessage::new(MessageType::StartForward {
                udid: DeviceId::new("sim-1"),
                port: 70000,
            }),
            "invalid_argument",
        ),
        (
            ClientMessage::new(MessageType::StopForward {
                udid: DeviceId::new("sim-1"),
                port: -1,
            }),
            "invalid_argument",
        ),
        (
            ClientMessage::install("sim-1", "/nonexistent/Demo.app"),
            "app_not_found",
        ),
    ];

    for (request, expected) in cases {
        match client.request(&request).await {
            Err(ClientError::Daemon { code, message }) => {
                assert_eq!(code.as_deref(), Some(expected), "{message}");
            }
            other => panic!("expected {expected}, got {other:?}"),
        }
    }

    // The connection survives errors
    assert!(matches!(
        client.request(&ClientMessage::ping(1)).await,
        Ok(DaemonMessage::Pong { seq: 1 })
    ));

    client.disconnect().await.unwrap();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_install_over_socket() {
    let server = TestServer::start().await;
    let mut client = server.client().await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("PkgInfo"), "APPL????").unwrap();

    client
        .expect_ok(&ClientMessage::install("sim-1", dir.path()))
        .await
        .unwrap();

    let device = server
        .sim
        .device(&DeviceId::new("sim-1"), TransportKind::Local)
        .unwrap();
    assert_eq!(device.installed(), vec![dir.path().to_path_buf()]);

    client.disconnect().await.unwrap();
    server.stop().await;
}
