//! End-to-end tests for the tunnel supervisor
//!
//! Engines, interfaces and probes are replaced with in-process fakes
//! implementing the public traits; everything else is the real wiring.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sfkt_rust::config::{generate_config, ConnectionDescriptor, SecurityKind, TransportKind};
use sfkt_rust::engine::{ForwardingEngine, ProxyEngine, TrafficStats};
use sfkt_rust::event::Event;
use sfkt_rust::failover::FailoverOutcome;
use sfkt_rust::monitor::{ConnectivityMonitor, MonitorStatus, ReachabilityProbe};
use sfkt_rust::provider::{MemoryServerStore, ServerId, ServerRecord, ServerStore};
use sfkt_rust::session::{SessionComponents, SessionState};
use sfkt_rust::tun::{InterfaceProvider, InterfaceRequest, VirtualInterface};
use sfkt_rust::{Error, Result, Settings, Supervisor, SupervisorComponents};
use std::collections::HashSet;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

type CallLog = Arc<Mutex<Vec<String>>>;

/// Proxy engine that reads the target host back out of the generated
/// document and refuses to start for hosts in `failing`
#[derive(Default)]
struct FakeProxy {
    log: CallLog,
    failing: Mutex<HashSet<String>>,
    monitor: Mutex<Option<Arc<ConnectivityMonitor>>>,
    monitor_seen_running: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
}

fn target_host(config_path: &Path) -> String {
    let text = std::fs::read_to_string(config_path).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
    doc["outbounds"][0]["settings"]["vnext"][0]["address"]
        .as_str()
        .unwrap()
        .to_string()
}

#[async_trait]
impl ProxyEngine for FakeProxy {
    async fn test(&self, _work_dir: &Path, _config_path: &Path) -> String {
        String::new()
    }

    async fn start(&self, _work_dir: &Path, config_path: &Path) -> String {
        let host = target_host(config_path);
        self.log.lock().push(format!("proxy.start {}", host));

        if let Some(monitor) = self.monitor.lock().as_ref() {
            if monitor.is_running() {
                self.monitor_seen_running.store(true, Ordering::SeqCst);
            }
        }

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.failing.lock().contains(&host) {
            format!("cannot reach {}", host)
        } else {
            String::new()
        }
    }

    async fn stop(&self) {
        self.log.lock().push("proxy.stop".to_string());
    }
}

struct FakeForwarding {
    log: CallLog,
}

#[async_trait]
impl ForwardingEngine for FakeForwarding {
    async fn load(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _config_path: &Path, _tun_fd: RawFd) -> Result<()> {
        self.log.lock().push("fwd.start".to_string());
        Ok(())
    }

    async fn stop(&self) {
        self.log.lock().push("fwd.stop".to_string());
    }

    fn stats(&self) -> TrafficStats {
        TrafficStats::default()
    }
}

struct FakeInterface {
    open: Arc<AtomicUsize>,
    closed: bool,
}

impl VirtualInterface for FakeInterface {
    fn name(&self) -> &str {
        "fake0"
    }

    fn raw_fd(&self) -> RawFd {
        7
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeInterface {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Default)]
struct FakeInterfaces {
    open: Arc<AtomicUsize>,
    max_open: AtomicUsize,
}

impl InterfaceProvider for FakeInterfaces {
    fn establish(&self, _request: &InterfaceRequest) -> Result<Box<dyn VirtualInterface>> {
        let now_open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now_open, Ordering::SeqCst);
        Ok(Box::new(FakeInterface {
            open: self.open.clone(),
            closed: false,
        }))
    }
}

/// Probe with a switchable answer
struct SwitchProbe(AtomicBool);

#[async_trait]
impl ReachabilityProbe for SwitchProbe {
    async fn probe(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Fixture {
    supervisor: Supervisor,
    proxy: Arc<FakeProxy>,
    interfaces: Arc<FakeInterfaces>,
    probe: Arc<SwitchProbe>,
    log: CallLog,
    ids: Vec<ServerId>,
}

/// Servers A(50ms), B(120ms), C(unmeasured)
async fn fixture(configure: impl FnOnce(&mut Settings)) -> Fixture {
    let mut settings = Settings::default();
    settings.work_dir = std::env::temp_dir().join(format!("sfkt-it-{}", uuid::Uuid::new_v4()));
    settings.failover.settle_delay_ms = 10;
    settings.monitor.interval_secs = 1;
    configure(&mut settings);

    let log: CallLog = Arc::default();
    let proxy = Arc::new(FakeProxy {
        log: log.clone(),
        ..Default::default()
    });
    let interfaces = Arc::new(FakeInterfaces::default());
    let probe = Arc::new(SwitchProbe(AtomicBool::new(true)));

    let store = Arc::new(MemoryServerStore::new());
    let mut ids = Vec::new();
    for (name, latency) in [("A", Some(50)), ("B", Some(120)), ("C", None)] {
        let uri = format!("vless://id@{}.example.com:443?security=tls#{}", name.to_lowercase(), name);
        let id = store.insert(ServerRecord::from_uri(&uri).unwrap()).await.unwrap();
        if latency.is_some() {
            store.update_latency(id, latency, Utc::now()).await.unwrap();
        }
        ids.push(id);
    }

    let components = SupervisorComponents {
        session: SessionComponents {
            proxy: proxy.clone(),
            forwarding: Arc::new(FakeForwarding { log: log.clone() }),
            interfaces: interfaces.clone(),
        },
        probe: probe.clone(),
        store,
    };

    let supervisor = Supervisor::new(settings, components).unwrap();
    *proxy.monitor.lock() = Some(supervisor.monitor().clone());

    Fixture {
        supervisor,
        proxy,
        interfaces,
        probe,
        log,
        ids,
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

async fn next_matching<F: Fn(&Event) -> bool>(rx: &mut broadcast::Receiver<Event>, matches: F) -> Event {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not received")
}

#[test]
fn test_descriptor_scenario() {
    let uri = "vless://11111111-1111-1111-1111-111111111111@example.com:443?type=ws&security=tls&sni=example.com&path=%2Fws#My%20Server";
    let d = ConnectionDescriptor::parse(uri).unwrap();
    assert_eq!(d.identity, "11111111-1111-1111-1111-111111111111");
    assert_eq!(d.address, "example.com");
    assert_eq!(d.port, 443);
    assert_eq!(d.transport, TransportKind::Ws);
    assert_eq!(d.security, SecurityKind::Tls);
    assert_eq!(d.sni, "example.com");
    assert_eq!(d.path, "/ws");
    assert_eq!(d.label, "My Server");

    assert!(matches!(ConnectionDescriptor::parse("vless://missingatsign"), Err(Error::Parse(_))));
}

#[test]
fn test_generated_document_is_deterministic() {
    let settings = Settings::default();
    for transport in TransportKind::ALL {
        for security in SecurityKind::ALL {
            let uri = format!(
                "vless://id@host.example:8443?type={}&security={}&sni=sni.example&pbk=key&sid=ab#Node",
                transport, security
            );
            let d = ConnectionDescriptor::parse(&uri).unwrap();
            let first = generate_config(&d, &settings.network).to_json().unwrap();
            let second = generate_config(&d, &settings.network).to_json().unwrap();
            assert_eq!(first, second);
        }
    }
}

#[tokio::test]
async fn test_connect_and_disconnect() {
    let f = fixture(|_| {}).await;
    f.supervisor.initialize().await.unwrap();
    let mut events = f.supervisor.events().subscribe();

    f.supervisor.connect(f.ids[0]).await.unwrap();
    assert_eq!(f.supervisor.session().state(), SessionState::Active);
    assert_eq!(f.supervisor.session().active_server(), Some(f.ids[0]));
    assert_eq!(
        next_matching(&mut events, |e| matches!(e, Event::SessionStarted { .. })).await,
        Event::SessionStarted { label: "A".to_string() }
    );

    // Monitoring follows the session
    assert!(f.supervisor.monitor().is_running());

    f.supervisor.disconnect().await;
    assert_eq!(f.supervisor.session().state(), SessionState::Idle);
    assert_eq!(f.interfaces.open.load(Ordering::SeqCst), 0);
    assert!(!f.supervisor.monitor().is_running());

    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_connect_unknown_server() {
    let f = fixture(|_| {}).await;
    let err = f.supervisor.connect(ServerId(999)).await.unwrap_err();
    assert!(matches!(err, Error::Store(_)));
}

#[tokio::test]
async fn test_switching_servers_never_overlaps() {
    let f = fixture(|_| {}).await;

    f.supervisor.connect(f.ids[0]).await.unwrap();
    f.supervisor.connect(f.ids[1]).await.unwrap();
    f.supervisor.connect(f.ids[2]).await.unwrap();

    assert_eq!(f.interfaces.max_open.load(Ordering::SeqCst), 1);
    assert_eq!(f.interfaces.open.load(Ordering::SeqCst), 1);
    assert_eq!(f.supervisor.session().active_server(), Some(f.ids[2]));

    // Each switch tears the previous session down before starting the next
    let log = f.log.lock().clone();
    let starts: Vec<usize> = log
        .iter()
        .enumerate()
        .filter(|(_, l)| l.starts_with("proxy.start"))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(starts.len(), 3);
    for window in starts.windows(2) {
        let between = &log[window[0]..window[1]];
        assert!(between.contains(&"fwd.stop".to_string()));
        assert!(between.contains(&"proxy.stop".to_string()));
    }

    f.supervisor.shutdown().await;
    assert_eq!(f.interfaces.open.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failover_picks_successor_of_active() {
    let f = fixture(|_| {}).await;
    let mut events = f.supervisor.events().subscribe();

    // Active B; the successor in latency order is C
    f.supervisor.connect(f.ids[1]).await.unwrap();
    let outcome = f.supervisor.failover().handle_connection_lost().await;
    assert_eq!(
        outcome,
        FailoverOutcome::Switched {
            id: f.ids[2],
            label: "C".to_string()
        }
    );
    assert_eq!(f.supervisor.session().active_server(), Some(f.ids[2]));

    assert_eq!(
        next_matching(&mut events, |e| matches!(e, Event::FailoverSwitching { .. })).await,
        Event::FailoverSwitching { candidate: "C".to_string() }
    );
    assert_eq!(
        next_matching(&mut events, |e| matches!(e, Event::FailoverSucceeded { .. })).await,
        Event::FailoverSucceeded { label: "C".to_string() }
    );

    // Monitoring was paused for the attempt and resumed afterwards
    assert!(!f.proxy.monitor_seen_running.load(Ordering::SeqCst));
    assert!(f.supervisor.monitor().is_running());
    assert_eq!(f.supervisor.monitor().status(), MonitorStatus::RESET);
    assert!(!f.supervisor.failover().is_in_flight());

    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_failover_respects_preferred_set() {
    let f = fixture(|_| {}).await;
    f.supervisor.failover().set_preferred(vec![f.ids[0], f.ids[2]]);

    f.supervisor.connect(f.ids[0]).await.unwrap();
    let outcome = f.supervisor.failover().handle_connection_lost().await;
    assert!(matches!(outcome, FailoverOutcome::Switched { id, .. } if id == f.ids[2]));

    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_failover_exhausts_after_one_traversal() {
    let f = fixture(|_| {}).await;
    {
        let mut failing = f.proxy.failing.lock();
        failing.insert("b.example.com".to_string());
        failing.insert("c.example.com".to_string());
    }

    f.supervisor.connect(f.ids[0]).await.unwrap();

    let first = f.supervisor.failover().handle_connection_lost().await;
    assert!(matches!(first, FailoverOutcome::Failed { ref label, .. } if label == "B"));
    assert_eq!(f.supervisor.session().state(), SessionState::Failed);

    let second = f.supervisor.failover().handle_connection_lost().await;
    assert!(matches!(second, FailoverOutcome::Failed { ref label, .. } if label == "C"));

    let third = f.supervisor.failover().handle_connection_lost().await;
    assert_eq!(third, FailoverOutcome::Exhausted);

    // Nothing leaked across the failed attempts
    assert_eq!(f.interfaces.open.load(Ordering::SeqCst), 0);
    assert!(f.supervisor.monitor().is_running());

    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_failover_is_not_reentrant() {
    let f = fixture(|_| {}).await;
    f.supervisor.connect(f.ids[0]).await.unwrap();

    let gate = Arc::new(Notify::new());
    *f.proxy.gate.lock() = Some(gate.clone());

    let failover = f.supervisor.failover().clone();
    let first = tokio::spawn(async move { failover.handle_connection_lost().await });

    let coordinator = f.supervisor.failover().clone();
    wait_for(|| coordinator.is_in_flight()).await;
    assert_eq!(
        f.supervisor.failover().handle_connection_lost().await,
        FailoverOutcome::Busy
    );

    *f.proxy.gate.lock() = None;
    gate.notify_one();
    let outcome = first.await.unwrap();
    assert!(matches!(outcome, FailoverOutcome::Switched { id, .. } if id == f.ids[1]));
    assert!(!f.supervisor.failover().is_in_flight());

    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_no_candidates() {
    let f = fixture(|_| {}).await;
    for id in &f.ids {
        f.supervisor.store().delete(*id).await.unwrap();
    }

    let outcome = f.supervisor.failover().handle_connection_lost().await;
    assert_eq!(outcome, FailoverOutcome::NoCandidates);
    assert!(!f.supervisor.failover().is_in_flight());

    // Nothing was being monitored, so nothing is resumed
    assert!(!f.supervisor.monitor().is_running());

    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_lost_connectivity_drives_failover() {
    let f = fixture(|s| s.monitor.max_attempts = 3).await;
    f.supervisor.initialize().await.unwrap();
    let mut events = f.supervisor.events().subscribe();

    f.supervisor.connect(f.ids[0]).await.unwrap();
    f.probe.0.store(false, Ordering::SeqCst);

    // First failed probe -> connection lost -> A's successor B
    assert_eq!(
        next_matching(&mut events, |e| matches!(e, Event::FailoverSucceeded { .. })).await,
        Event::FailoverSucceeded { label: "B".to_string() }
    );
    assert_eq!(f.supervisor.session().active_server(), Some(f.ids[1]));

    f.probe.0.store(true, Ordering::SeqCst);
    f.supervisor.shutdown().await;
    assert_eq!(f.supervisor.session().state(), SessionState::Idle);
    assert!(!f.supervisor.monitor().is_running());
}

#[tokio::test]
async fn test_failed_candidate_keeps_monitoring_and_moves_on() {
    let f = fixture(|s| s.monitor.max_attempts = 10).await;
    f.supervisor.initialize().await.unwrap();
    let mut events = f.supervisor.events().subscribe();
    f.proxy.failing.lock().insert("b.example.com".to_string());

    f.supervisor.connect(f.ids[0]).await.unwrap();
    f.probe.0.store(false, Ordering::SeqCst);

    // A -> B fails to start; the next lost signal moves on to C
    assert_eq!(
        next_matching(&mut events, |e| matches!(e, Event::FailoverSucceeded { .. })).await,
        Event::FailoverSucceeded { label: "C".to_string() }
    );
    assert_eq!(f.supervisor.session().active_server(), Some(f.ids[2]));
    assert!(f.supervisor.monitor().is_running());

    let starts: Vec<String> = f
        .log
        .lock()
        .iter()
        .filter(|l| l.starts_with("proxy.start"))
        .cloned()
        .collect();
    assert_eq!(
        starts,
        vec![
            "proxy.start a.example.com".to_string(),
            "proxy.start b.example.com".to_string(),
            "proxy.start c.example.com".to_string(),
        ]
    );

    f.probe.0.store(true, Ordering::SeqCst);
    f.supervisor.shutdown().await;
    assert_eq!(f.interfaces.open.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_connect_stops_monitoring() {
    let f = fixture(|_| {}).await;
    f.supervisor.connect(f.ids[0]).await.unwrap();
    assert!(f.supervisor.monitor().is_running());

    f.proxy.failing.lock().insert("b.example.com".to_string());
    assert!(f.supervisor.connect(f.ids[1]).await.is_err());
    assert_eq!(f.supervisor.session().state(), SessionState::Failed);
    assert!(!f.supervisor.monitor().is_running());
}

#[test]
fn test_supervisor_rejects_invalid_settings() {
    let mut settings = Settings::default();
    settings.monitor.interval_secs = 0;

    let components = SupervisorComponents {
        session: SessionComponents {
            proxy: Arc::new(FakeProxy::default()),
            forwarding: Arc::new(FakeForwarding { log: CallLog::default() }),
            interfaces: Arc::new(FakeInterfaces::default()),
        },
        probe: Arc::new(SwitchProbe(AtomicBool::new(true))),
        store: Arc::new(MemoryServerStore::new()),
    };
    assert!(matches!(Supervisor::new(settings, components), Err(Error::Config(_))));
}

#[tokio::test]
async fn test_monitor_exhaustion_warns() {
    // A single attempt budget goes straight to NoInternet
    let f = fixture(|s| s.monitor.max_attempts = 1).await;
    f.supervisor.initialize().await.unwrap();
    let mut events = f.supervisor.events().subscribe();

    f.supervisor.connect(f.ids[0]).await.unwrap();
    f.probe.0.store(false, Ordering::SeqCst);

    assert_eq!(
        next_matching(&mut events, |e| matches!(e, Event::NoInternetWarning)).await,
        Event::NoInternetWarning
    );
    assert_eq!(f.supervisor.session().active_server(), Some(f.ids[0]));

    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_initialize_twice() {
    let f = fixture(|_| {}).await;
    f.supervisor.initialize().await.unwrap();
    assert!(matches!(f.supervisor.initialize().await, Err(Error::InvalidState(_))));
    f.supervisor.shutdown().await;
}

#[tokio::test]
async fn test_rank_all_updates_store() {
    let f = fixture(|s| s.ranking.timeout_ms = 200).await;

    let results = f.supervisor.rank_all().await.unwrap();
    assert_eq!(results.len(), 3);
    for record in f.supervisor.store().list().await.unwrap() {
        assert!(record.last_probe.is_some());
    }
}
