//! Tunnel session controller
//!
//! Owns the one live tunnel: the generated engine document, the proxy
//! engine, the virtual interface and the forwarding engine. Every start
//! and stop runs under a single operation lock, so a later call waits for
//! the earlier one to reach its terminal state.
//!
//! ```text
//! Idle -> Validating -> Starting -> Active -> Stopping -> Idle
//!             |             |
//!             +-> Failed <--+
//! ```

mod state;

pub use state::{SessionState, SessionStatus, StartRequest};

use crate::config::{generate_config, ForwardingConfig, Settings};
use crate::engine::{ForwardingEngine, ProxyEngine, TrafficStats};
use crate::event::{Event, EventBus};
use crate::provider::{ServerId, ServerRecord};
use crate::tun::{InterfaceProvider, InterfaceRequest, VirtualInterface};
use crate::{Error, Result};
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// External collaborators the controller drives
#[derive(Clone)]
pub struct SessionComponents {
    pub proxy: Arc<dyn ProxyEngine>,
    pub forwarding: Arc<dyn ForwardingEngine>,
    pub interfaces: Arc<dyn InterfaceProvider>,
}

/// Resources held by a live session
#[derive(Default)]
struct Live {
    interface: Option<Box<dyn VirtualInterface>>,
}

/// Tunnel session controller
pub struct SessionController {
    settings: Arc<Settings>,
    components: SessionComponents,
    events: EventBus,
    live: Mutex<Live>,
    status_tx: watch::Sender<SessionStatus>,
    last_server: RwLock<Option<StartRequest>>,
}

impl SessionController {
    pub fn new(settings: Arc<Settings>, components: SessionComponents, events: EventBus) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::idle());
        SessionController {
            settings,
            components,
            events,
            live: Mutex::new(Live::default()),
            status_tx,
            last_server: RwLock::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        self.status_tx.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// Current snapshot; also answers collaborators with `session-status`
    pub fn status(&self) -> SessionStatus {
        let status = self.status_tx.borrow().clone();
        self.events.publish(Event::SessionStatus {
            is_running: status.is_running(),
        });
        status
    }

    pub fn active_server(&self) -> Option<ServerId> {
        let status = self.status_tx.borrow();
        if status.is_running() {
            status.active_server
        } else {
            None
        }
    }

    /// Time since the session became Active; zero otherwise
    pub fn connection_duration(&self) -> Duration {
        let status = self.status_tx.borrow();
        match (status.state, status.started_at) {
            (SessionState::Active, Some(started)) => (Utc::now() - started).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    /// Forwarding engine counters; zero unless Active
    pub fn traffic_stats(&self) -> TrafficStats {
        if self.state() == SessionState::Active {
            self.components.forwarding.stats()
        } else {
            TrafficStats::default()
        }
    }

    /// Most recently started server
    pub fn last_server(&self) -> Option<StartRequest> {
        self.last_server.read().clone()
    }

    fn transition<F>(&self, new_state: SessionState, update: F)
    where
        F: FnOnce(&mut SessionStatus),
    {
        self.status_tx.send_modify(|status| {
            debug!("session state: {} -> {}", status.state, new_state);
            status.state = new_state;
            update(status);
        });
    }

    /// Start a session for a stored server
    pub async fn start_record(&self, record: &ServerRecord) -> Result<()> {
        let descriptor = record.connection_descriptor()?;
        let request = StartRequest::new(descriptor)
            .with_label(record.name.clone())
            .with_server(record.id);
        self.start(request).await
    }

    /// Start the last server again
    pub async fn reconnect(&self) -> Result<()> {
        let request = self
            .last_server()
            .ok_or_else(|| Error::invalid_state("no previous server to reconnect to"))?;
        self.start(request).await
    }

    /// Bring a session up. A running session is stopped first.
    pub async fn start(&self, request: StartRequest) -> Result<()> {
        let mut live = self.live.lock().await;

        if self.state().is_busy() {
            info!("Stopping current session before starting {}", request.label);
            self.teardown(&mut live).await;
        }

        let session_id = Uuid::new_v4();
        info!("Starting session {} ({})", request.label, session_id);
        self.transition(SessionState::Validating, |status| {
            status.session_id = Some(session_id);
            status.active_server = request.server_id;
            status.label = Some(request.label.clone());
            status.started_at = None;
            status.last_error = None;
        });

        match self.bring_up(&request, &mut live).await {
            Ok(()) => {
                self.transition(SessionState::Active, |status| {
                    status.started_at = Some(Utc::now());
                });
                *self.last_server.write() = Some(request.clone());
                info!("Session {} active via {}", session_id, request.descriptor.endpoint());
                self.events.publish(Event::SessionStarted { label: request.label });
                Ok(())
            }
            Err(e) => {
                error!("Session {} failed: {}", session_id, e);
                let message = e.to_string();
                self.transition(SessionState::Failed, |status| {
                    status.active_server = None;
                    status.last_error = Some(message.clone());
                });
                self.events.publish(Event::SessionError { message });
                self.events.publish(Event::SessionStopped);
                Err(e)
            }
        }
    }

    /// Stop the running session; a no-op when nothing runs
    pub async fn stop(&self) {
        let mut live = self.live.lock().await;
        if !self.state().is_busy() && live.interface.is_none() {
            debug!("stop requested with no session running");
            return;
        }
        self.teardown(&mut live).await;
    }

    async fn teardown(&self, live: &mut Live) {
        self.transition(SessionState::Stopping, |_| {});

        self.components.forwarding.stop().await;
        if let Some(mut interface) = live.interface.take() {
            interface.close();
        }
        self.components.proxy.stop().await;

        self.transition(SessionState::Idle, |status| {
            *status = SessionStatus::idle();
        });
        info!("Session stopped");
        self.events.publish(Event::SessionStopped);
    }

    /// Engage every subsystem in order, unwinding on the first failure
    async fn bring_up(&self, request: &StartRequest, live: &mut Live) -> Result<()> {
        let settings = &self.settings;
        let work_dir = &settings.work_dir;
        let config_path = settings.engine_config_path();

        // Validating
        let document = generate_config(&request.descriptor, &settings.network);
        document.write_to_file(&config_path).await?;
        let test_error = self.components.proxy.test(work_dir, &config_path).await;
        if !test_error.is_empty() {
            return Err(Error::config_test(test_error));
        }

        // Starting
        self.transition(SessionState::Starting, |_| {});
        let start_error = self.components.proxy.start(work_dir, &config_path).await;
        if !start_error.is_empty() {
            return Err(Error::engine_start(start_error));
        }

        let interface = match self.establish_interface().await {
            Ok(interface) => interface,
            Err(e) => {
                warn!("Interface allocation failed, stopping proxy engine");
                self.components.proxy.stop().await;
                return Err(e);
            }
        };

        if let Err(e) = self.start_forwarding(interface.as_ref()).await {
            warn!("Forwarding engine failed, releasing interface and proxy engine");
            self.components.forwarding.stop().await;
            let mut interface = interface;
            interface.close();
            self.components.proxy.stop().await;
            return Err(match e {
                Error::ForwardingEngineLoad(_) => e,
                other => Error::forwarding_load(other.to_string()),
            });
        }

        live.interface = Some(interface);
        Ok(())
    }

    async fn establish_interface(&self) -> Result<Box<dyn VirtualInterface>> {
        let request = InterfaceRequest::from_settings(&self.settings.tun, &self.settings.network);
        let provider = Arc::clone(&self.components.interfaces);
        tokio::task::spawn_blocking(move || provider.establish(&request))
            .await
            .map_err(|e| Error::interface(format!("interface task failed: {}", e)))?
    }

    async fn start_forwarding(&self, interface: &dyn VirtualInterface) -> Result<()> {
        let config = ForwardingConfig::new(interface.name(), self.settings.tun.mtu, &self.settings.network);
        config.write_to_file(self.settings.forwarding_config_path()).await?;

        self.components.forwarding.load().await?;
        self.components
            .forwarding
            .start(&self.settings.forwarding_config_path(), interface.raw_fd())
            .await
    }
}
