//! Device watcher driven by the simulated backend.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use iosdev_core::{DeviceError, DeviceId, DeviceView, TransportKind};
use iosdevd::backend::sim::{PeerMode, SimBackend, SimDeviceSpec, SimFailures};
use iosdevd::{
    DeviceWatcher, RelayListener, RelayMessage, WatchEvent, WatchListener, WatcherConfig,
};

const WAIT: Duration = Duration::from_secs(5);

fn quick() -> WatcherConfig {
    WatcherConfig {
        settle_window: Duration::from_millis(20),
        settle_timeout: Duration::from_secs(2),
    }
}

fn phone(udid: &str) -> SimDeviceSpec {
    SimDeviceSpec::new(udid)
        .property("DeviceName", "Test iPhone")
        .property("ProductVersion", "17.4")
}

fn start(sim: &SimBackend) -> DeviceWatcher {
    let backend = Arc::new(sim.clone());
    tokio::task::block_in_place(|| DeviceWatcher::start(backend, quick())).unwrap()
}

/// Waits for a device list matching `done`, skipping intermediate ones.
async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<WatchEvent>,
    done: impl Fn(&[DeviceView]) -> bool,
) -> Vec<DeviceView> {
    loop {
        match timeout(WAIT, rx.recv()).await {
            Ok(Some(WatchEvent::Change { devices })) if done(&devices) => return devices,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("watch channel closed"),
            Err(_) => panic!("timed out waiting for device list"),
        }
    }
}

async fn relay_lines(rx: &mut mpsc::UnboundedReceiver<RelayMessage>, count: usize) -> Vec<String> {
    let mut lines = Vec::new();
    while lines.len() < count {
        match timeout(WAIT, rx.recv()).await {
            Ok(Some(RelayMessage::Data(line))) => lines.push(line),
            other => panic!("expected a line, got {other:?}"),
        }
    }
    lines
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watch_delivers_snapshot_immediately() {
    let sim = SimBackend::new();
    sim.attach(phone("dev-1"), TransportKind::Local);
    let watcher = start(&sim);

    let (listener, mut rx) = WatchListener::channel();
    watcher.watch(listener).unwrap();

    // Delivered synchronously by watch()
    match rx.try_recv() {
        Ok(WatchEvent::Change { devices }) => {
            assert_eq!(devices.len(), 1);
            let device = &devices[0];
            assert_eq!(device.udid, DeviceId::new("dev-1"));
            assert_eq!(device.properties.name, "Test iPhone");
            assert_eq!(device.properties.product_version, "17.4");
            assert_eq!(device.interfaces, vec![TransportKind::Local]);
        }
        other => panic!("expected snapshot, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_attach_and_detach_notify_listeners() {
    let sim = SimBackend::new();
    let watcher = start(&sim);

    let (listener, mut rx) = WatchListener::channel();
    watcher.watch(listener.clone()).unwrap();
    wait_for(&mut rx, |devices| devices.is_empty()).await;

    sim.attach(phone("dev-1"), TransportKind::Local);
    let devices = wait_for(&mut rx, |devices| devices.len() == 1).await;
    assert_eq!(devices[0].udid, DeviceId::new("dev-1"));
    assert_eq!(watcher.list().len(), 1);

    sim.detach(&DeviceId::new("dev-1"), TransportKind::Local);
    wait_for(&mut rx, |devices| devices.is_empty()).await;
    assert!(watcher.list().is_empty());

    watcher.unwatch(&listener);
    sim.attach(phone("dev-2"), TransportKind::Local);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(watcher.list().len(), 1);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_stays_until_last_transport_leaves() {
    let sim = SimBackend::new();
    let udid = DeviceId::new("dual");
    sim.attach(phone("dual"), TransportKind::Local);
    sim.attach(phone("dual"), TransportKind::Network);
    let watcher = start(&sim);

    let (listener, mut rx) = WatchListener::channel();
    watcher.watch(listener).unwrap();
    let devices = wait_for(&mut rx, |devices| {
        devices.first().map(|d| d.interfaces.len()) == Some(2)
    })
    .await;
    assert_eq!(
        devices[0].interfaces,
        vec![TransportKind::Local, TransportKind::Network]
    );

    sim.detach(&udid, TransportKind::Local);
    let devices = wait_for(&mut rx, |devices| {
        devices.first().map(|d| d.interfaces.len()) == Some(1)
    })
    .await;
    assert_eq!(devices[0].interfaces, vec![TransportKind::Network]);

    sim.detach(&udid, TransportKind::Network);
    wait_for(&mut rx, |devices| devices.is_empty()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_relays_require_cable() {
    let sim = SimBackend::new();
    sim.attach(phone("wifi-only"), TransportKind::Network);
    let watcher = start(&sim);
    let udid = DeviceId::new("wifi-only");

    let (listener, _rx) = RelayListener::channel();
    assert_eq!(
        watcher.start_syslog(&udid, listener.clone()),
        Err(DeviceError::CableRequired { operation: "syslog" })
    );
    assert_eq!(
        watcher.start_forward(&udid, 8080, listener),
        Err(DeviceError::CableRequired { operation: "forward" })
    );

    let (listener, _rx) = RelayListener::channel();
    assert_eq!(
        watcher.start_syslog(&DeviceId::new("missing"), listener),
        Err(DeviceError::DeviceNotFound(DeviceId::new("missing")))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_probe_is_skipped() {
    let sim = SimBackend::new();
    let watcher = start(&sim);

    let (listener, mut rx) = WatchListener::channel();
    watcher.watch(listener).unwrap();

    let broken = phone("broken").failures(SimFailures {
        connect: Some(0x11),
        ..Default::default()
    });
    sim.attach(broken, TransportKind::Local);
    sim.attach(phone("good"), TransportKind::Local);

    let devices = wait_for(&mut rx, |devices| !devices.is_empty()).await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].udid, DeviceId::new("good"));
    assert!(watcher.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_syslog_streams_and_ends_on_detach() {
    let sim = SimBackend::with_mode(PeerMode::Serve);
    let mut spec = phone("logger");
    spec.syslog = vec!["kernel: booted".into(), "SpringBoard: ready".into()];
    sim.attach(spec, TransportKind::Local);
    let watcher = start(&sim);
    let udid = DeviceId::new("logger");

    let (first, mut first_rx) = RelayListener::channel();
    let (second, mut second_rx) = RelayListener::channel();
    watcher.start_syslog(&udid, first).unwrap();

    assert_eq!(
        relay_lines(&mut first_rx, 2).await,
        vec!["kernel: booted", "SpringBoard: ready"]
    );

    // The second listener joins the running stream
    watcher.start_syslog(&udid, second.clone()).unwrap();
    watcher.stop_syslog(&udid, &second).unwrap();

    sim.detach(&udid, TransportKind::Local);
    let end = timeout(WAIT, first_rx.recv()).await.unwrap();
    assert_eq!(end, Some(RelayMessage::End));
    assert!(matches!(
        timeout(Duration::from_millis(100), second_rx.recv()).await,
        Err(_) | Ok(None)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_on_unknown_device() {
    let sim = SimBackend::new();
    let watcher = start(&sim);
    let (listener, _rx) = RelayListener::channel();

    assert!(matches!(
        watcher.stop_forward(&DeviceId::new("nope"), 80, &listener),
        Err(DeviceError::DeviceNotFound(_))
    ));
    assert!(matches!(
        watcher.stop_syslog(&DeviceId::new("nope"), &listener),
        Err(DeviceError::DeviceNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_install_validates_and_installs() {
    let sim = SimBackend::new();
    sim.attach(phone("dev"), TransportKind::Local);
    let watcher = start(&sim);
    let udid = DeviceId::new("dev");

    let dir = tempfile::tempdir().unwrap();
    let app = dir.path().join("Demo.app");

    assert_eq!(
        watcher.install(&udid, &app),
        Err(DeviceError::AppNotFound(app.clone()))
    );

    std::fs::create_dir(&app).unwrap();
    assert_eq!(
        watcher.install(&udid, &app),
        Err(DeviceError::InvalidApp(app.clone()))
    );

    std::fs::write(app.join("PkgInfo"), "APPL????").unwrap();
    assert_eq!(
        watcher.install(&DeviceId::new("missing"), &app),
        Err(DeviceError::DeviceNotFound(DeviceId::new("missing")))
    );

    tokio::task::block_in_place(|| watcher.install(&udid, &app)).unwrap();
    let device = sim.device(&udid, TransportKind::Local).unwrap();
    assert_eq!(device.installed(), vec![app]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_install_falls_back_to_network() {
    let sim = SimBackend::new();
    sim.attach(phone("air"), TransportKind::Network);
    let watcher = start(&sim);
    let udid = DeviceId::new("air");

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("PkgInfo"), "APPL????").unwrap();

    tokio::task::block_in_place(|| watcher.install(&udid, dir.path())).unwrap();
    let device = sim.device(&udid, TransportKind::Network).unwrap();
    assert_eq!(device.installed().len(), 1);
    assert!(!device.is_session_active());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_ends_relays() {
    let sim = SimBackend::with_mode(PeerMode::Serve);
    sim.attach(phone("dev"), TransportKind::Local);
    let watcher = start(&sim);

    let (listener, mut rx) = RelayListener::channel();
    watcher
        .start_forward(&DeviceId::new("dev"), 8080, listener)
        .unwrap();

    watcher.shutdown();
    let end = timeout(WAIT, rx.recv()).await.unwrap();
    assert_eq!(end, Some(RelayMessage::End));
    assert_eq!(sim.subscriber_count(), 0);
}
