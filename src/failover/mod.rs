//! Failover coordinator
//!
//! Reacts to monitor signals by switching the session to the next
//! candidate server. Only one attempt runs at a time. A running monitor
//! is paused from the moment an attempt begins until it reaches a
//! terminal outcome, then resumed; a stopped one stays stopped.

mod context;

pub use context::{FailoverContext, Selection};

use crate::config::FailoverSettings;
use crate::event::{Event, EventBus};
use crate::monitor::{ConnectivityMonitor, MonitorSignal};
use crate::provider::{ServerId, ServerStore};
use crate::session::SessionController;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a failover attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverOutcome {
    /// Switched to the named server
    Switched { id: ServerId, label: String },
    /// Every candidate was tried in this traversal
    Exhausted,
    NoCandidates,
    /// The chosen candidate failed to start
    Failed { label: String, message: String },
    /// Another attempt is already in flight
    Busy,
}

pub struct FailoverCoordinator {
    settle_delay: Duration,
    preferred: RwLock<Vec<ServerId>>,
    store: Arc<dyn ServerStore>,
    session: Arc<SessionController>,
    monitor: Arc<ConnectivityMonitor>,
    events: EventBus,
    context: Mutex<FailoverContext>,
    in_flight: AtomicBool,
}

impl FailoverCoordinator {
    pub fn new(
        settings: &FailoverSettings,
        store: Arc<dyn ServerStore>,
        session: Arc<SessionController>,
        monitor: Arc<ConnectivityMonitor>,
        events: EventBus,
    ) -> Self {
        FailoverCoordinator {
            settle_delay: settings.settle_delay(),
            preferred: RwLock::new(settings.preferred.clone()),
            store,
            session,
            monitor,
            events,
            context: Mutex::new(FailoverContext::new()),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn preferred(&self) -> Vec<ServerId> {
        self.preferred.read().clone()
    }

    /// Replace the preferred subset; empty means every server
    pub fn set_preferred(&self, ids: Vec<ServerId>) {
        *self.preferred.write() = ids;
    }

    /// Consume monitor signals until cancelled
    pub async fn run(self: Arc<Self>, mut signals: mpsc::UnboundedReceiver<MonitorSignal>, token: CancellationToken) {
        loop {
            let signal = tokio::select! {
                _ = token.cancelled() => break,
                signal = signals.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };

            match signal {
                MonitorSignal::ConnectionLost { failures } => {
                    debug!("connection lost ({} consecutive failures)", failures);
                    let outcome = self.handle_connection_lost().await;
                    debug!("failover outcome: {:?}", outcome);
                }
                MonitorSignal::AllAttemptsFailed => self.handle_all_attempts_failed(),
            }
        }
        debug!("failover coordinator exited");
    }

    pub fn handle_all_attempts_failed(&self) {
        warn!("All connectivity checks failed");
        self.events.publish(Event::NoInternetWarning);
    }

    /// One failover attempt
    pub async fn handle_connection_lost(&self) -> FailoverOutcome {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("failover already in flight");
            return FailoverOutcome::Busy;
        }

        // Restored once the attempt ends, whatever the outcome
        let was_monitoring = self.monitor.is_running();
        self.monitor.stop();
        let outcome = self.attempt().await;

        if let FailoverOutcome::Switched { label, .. } = &outcome {
            self.context.lock().reset();
            self.monitor.reset_failure_count();
            self.events.publish(Event::FailoverSucceeded { label: label.clone() });
        }

        if was_monitoring {
            self.monitor.start();
        }
        self.in_flight.store(false, Ordering::SeqCst);
        outcome
    }

    async fn attempt(&self) -> FailoverOutcome {
        let all = match self.store.list().await {
            Ok(records) => records,
            Err(e) => {
                warn!("Failover cannot read servers: {}", e);
                return FailoverOutcome::NoCandidates;
            }
        };

        let candidates = FailoverContext::candidate_list(all, &self.preferred());
        let active = self.session.active_server();
        let selection = {
            let mut context = self.context.lock();
            context.set_candidates(candidates);
            context.next_candidate(active)
        };

        let record = match selection {
            Selection::Next(record) => record,
            Selection::Empty => {
                info!("No failover candidates");
                return FailoverOutcome::NoCandidates;
            }
            Selection::Exhausted => {
                warn!("Failover exhausted every candidate");
                return FailoverOutcome::Exhausted;
            }
        };

        info!("Failing over to {} ({})", record.name, record.id);
        self.events.publish(Event::FailoverSwitching {
            candidate: record.name.clone(),
        });

        self.session.stop().await;
        tokio::time::sleep(self.settle_delay).await;

        match self.session.start_record(&record).await {
            Ok(()) => FailoverOutcome::Switched {
                id: record.id,
                label: record.name,
            },
            Err(e) => {
                warn!("Failover to {} failed: {}", record.name, e);
                FailoverOutcome::Failed {
                    label: record.name,
                    message: e.to_string(),
                }
            }
        }
    }
}
