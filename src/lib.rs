//! sfkt - tunnel supervisor
//!
//! Turns a VLESS connection descriptor into a running tunnel and keeps it
//! healthy:
//! - Descriptor parsing and engine config generation
//! - Session lifecycle over two external engines and a virtual interface
//! - Periodic connectivity monitoring
//! - Automatic failover across candidate servers, ordered by latency
//!
//! # Architecture
//!
//! ```text
//!                     +------------------+
//!                     |    Supervisor    |
//!                     +--------+---------+
//!                              |
//!        +---------------------+--------------------+
//!        |                     |                    |
//! +------v------+     +--------v--------+   +-------v-------+
//! |  monitor/   |---->|    failover/    |-->|   session/    |
//! | (probes)    |     | (candidates)    |   | (state mach.) |
//! +-------------+     +--------+--------+   +-------+-------+
//!                              |                    |
//!                     +--------v--------+   +-------v-------+
//!                     |   provider/     |   | engine/ tun/  |
//!                     | (store, rank)   |   | config/       |
//!                     +-----------------+   +---------------+
//! ```

pub mod common;
pub mod config;
pub mod engine;
pub mod event;
pub mod failover;
pub mod monitor;
pub mod provider;
pub mod session;
pub mod tun;

pub use common::error::{Error, Result};
pub use config::Settings;

use event::EventBus;
use failover::FailoverCoordinator;
use monitor::{ConnectivityMonitor, MonitorSignal, ReachabilityProbe};
use parking_lot::Mutex;
use provider::{ProbeResult, ServerId, ServerStore};
use session::{SessionComponents, SessionController, SessionState};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Collaborators injected into the supervisor
#[derive(Clone)]
pub struct SupervisorComponents {
    pub session: SessionComponents,
    pub probe: Arc<dyn ReachabilityProbe>,
    pub store: Arc<dyn ServerStore>,
}

impl SupervisorComponents {
    /// Real engines, the Linux tun device, TCP probing and an in-memory store
    #[cfg(target_os = "linux")]
    pub fn system(settings: &Settings) -> Self {
        use engine::{Tun2SocksEngine, XrayEngine};
        use monitor::{RouteTableCapabilities, TcpReachabilityProbe};

        let engines = &settings.engines;
        let session = SessionComponents {
            proxy: Arc::new(XrayEngine::new(
                engines.proxy_executable.clone(),
                engines.stop_timeout(),
            )),
            forwarding: Arc::new(Tun2SocksEngine::new(
                engines.forwarding_executable.clone(),
                settings.tun.name.clone(),
                engines.stop_timeout(),
            )),
            interfaces: Arc::new(tun::LinuxTunProvider::new()),
        };
        let probe = TcpReachabilityProbe::from_settings(&settings.monitor, Arc::new(RouteTableCapabilities::new()));

        SupervisorComponents {
            session,
            probe: Arc::new(probe),
            store: Arc::new(provider::MemoryServerStore::new()),
        }
    }
}

/// Owns and wires every component. Obtain one with [`Supervisor::new`],
/// call [`Supervisor::initialize`] before use and
/// [`Supervisor::shutdown`] when done.
///
/// Monitoring follows sessions started through [`Supervisor::connect`]
/// and ends with [`Supervisor::disconnect`]. While a failover attempt is
/// in flight the coordinator alone pauses and resumes it.
pub struct Supervisor {
    settings: Arc<Settings>,
    events: EventBus,
    store: Arc<dyn ServerStore>,
    session: Arc<SessionController>,
    monitor: Arc<ConnectivityMonitor>,
    failover: Arc<FailoverCoordinator>,
    signals: Mutex<Option<mpsc::UnboundedReceiver<MonitorSignal>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(settings: Settings, components: SupervisorComponents) -> Result<Self> {
        settings.validate()?;
        info!("Initializing sfkt v{}", VERSION);

        let settings = Arc::new(settings);
        let events = EventBus::new();

        let session = Arc::new(SessionController::new(
            settings.clone(),
            components.session,
            events.clone(),
        ));
        let (monitor, signals) = ConnectivityMonitor::new(settings.monitor.clone(), components.probe);
        let failover = Arc::new(FailoverCoordinator::new(
            &settings.failover,
            components.store.clone(),
            session.clone(),
            monitor.clone(),
            events.clone(),
        ));

        Ok(Supervisor {
            settings,
            events,
            store: components.store,
            session,
            monitor,
            failover,
            signals: Mutex::new(Some(signals)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the failover coordinator
    pub async fn initialize(&self) -> Result<()> {
        let signals = self
            .signals
            .lock()
            .take()
            .ok_or_else(|| Error::invalid_state("supervisor already initialized"))?;

        tokio::fs::create_dir_all(&self.settings.work_dir).await?;

        let coordinator = tokio::spawn(self.failover.clone().run(signals, self.shutdown.child_token()));
        self.tasks.lock().push(coordinator);
        info!("Supervisor initialized (work dir {})", self.settings.work_dir.display());
        Ok(())
    }

    /// Cancel background tasks and tear everything down
    pub async fn shutdown(&self) {
        info!("Shutting down supervisor...");
        self.shutdown.cancel();

        // A failover attempt in flight runs to completion first
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        self.monitor.stop();
        self.session.stop().await;
        info!("Supervisor stopped");
    }

    /// Start a session for a stored server and monitor it
    pub async fn connect(&self, id: ServerId) -> Result<()> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::store(format!("Unknown server {}", id)))?;

        let result = self.session.start_record(&record).await;
        if !self.failover.is_in_flight() {
            match &result {
                Ok(()) if self.monitor.auto_failover() => self.monitor.start(),
                Ok(()) => {}
                Err(_) => self.monitor.stop(),
            }
        }
        result
    }

    pub async fn disconnect(&self) {
        self.monitor.stop();
        self.session.stop().await;
    }

    /// Probe every stored server and write the latencies back
    pub async fn rank_all(&self) -> Result<Vec<ProbeResult>> {
        let servers = self.store.list().await?;
        Ok(provider::rank_servers(self.store.as_ref(), &servers, self.settings.ranking.timeout()).await)
    }

    /// Toggle automatic failover; monitoring follows when a session is up
    pub fn set_auto_failover(&self, enabled: bool) {
        self.monitor.set_auto_failover(enabled);
        if self.failover.is_in_flight() {
            return;
        }
        if enabled && self.session.state() == SessionState::Active {
            self.monitor.start();
        } else if !enabled {
            self.monitor.stop();
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn ServerStore> {
        &self.store
    }

    pub fn session(&self) -> &Arc<SessionController> {
        &self.session
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn failover(&self) -> &Arc<FailoverCoordinator> {
        &self.failover
    }
}
