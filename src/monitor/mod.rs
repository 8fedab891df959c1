//! Connectivity monitor
//!
//! Periodically probes reachability while a session is up and turns the
//! results into a four-state health signal. Consecutive failures below
//! the configured maximum raise [`MonitorSignal::ConnectionLost`]; reaching
//! the maximum raises [`MonitorSignal::AllAttemptsFailed`] and resets the
//! counter.

mod probe;

pub use probe::{NetworkCapabilities, ReachabilityProbe, RouteTableCapabilities, TcpReachabilityProbe};

use crate::config::MonitorSettings;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonitorState {
    Connected,
    Checking,
    Reconnecting,
    NoInternet,
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorState::Connected => write!(f, "connected"),
            MonitorState::Checking => write!(f, "checking"),
            MonitorState::Reconnecting => write!(f, "reconnecting"),
            MonitorState::NoInternet => write!(f, "no-internet"),
        }
    }
}

/// State plus the consecutive failure count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonitorStatus {
    pub state: MonitorState,
    pub failures: u32,
}

impl MonitorStatus {
    pub const RESET: MonitorStatus = MonitorStatus {
        state: MonitorState::Connected,
        failures: 0,
    };
}

/// Signals consumed by the failover coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorSignal {
    /// A probe failed; `failures` is the consecutive count so far
    ConnectionLost { failures: u32 },
    /// The configured maximum was reached
    AllAttemptsFailed,
}

/// Periodic reachability monitor
pub struct ConnectivityMonitor {
    settings: MonitorSettings,
    probe: Arc<dyn ReachabilityProbe>,
    auto_failover: AtomicBool,
    status_tx: watch::Sender<MonitorStatus>,
    signal_tx: mpsc::UnboundedSender<MonitorSignal>,
    task: Mutex<Option<CancellationToken>>,
}

impl ConnectivityMonitor {
    pub fn new(
        settings: MonitorSettings,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MonitorSignal>) {
        let (status_tx, _) = watch::channel(MonitorStatus::RESET);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let monitor = ConnectivityMonitor {
            auto_failover: AtomicBool::new(settings.auto_failover),
            settings,
            probe,
            status_tx,
            signal_tx,
            task: Mutex::new(None),
        };
        (Arc::new(monitor), signal_rx)
    }

    pub fn status(&self) -> MonitorStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    pub fn auto_failover(&self) -> bool {
        self.auto_failover.load(Ordering::SeqCst)
    }

    /// Ticks are skipped while auto-failover is off
    pub fn set_auto_failover(&self, enabled: bool) {
        self.auto_failover.store(enabled, Ordering::SeqCst);
    }

    fn set_status(&self, new: MonitorStatus) {
        self.status_tx.send_if_modified(|status| {
            if *status == new {
                return false;
            }
            debug!(
                "monitor state: {} ({}) -> {} ({})",
                status.state, status.failures, new.state, new.failures
            );
            *status = new;
            true
        });
    }

    /// Start the periodic task. The first probe runs one interval from
    /// now; starting an already running monitor does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        self.set_status(MonitorStatus::RESET);

        let token = CancellationToken::new();
        *task = Some(token.clone());

        let period = self.settings.interval();
        info!("Connectivity monitor started (every {:?})", period);

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if !monitor.auto_failover() {
                    continue;
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = monitor.tick() => {}
                }
            }
            debug!("monitor task exited");
        });
    }

    /// Cancel the periodic task, including a probe in flight, and reset
    pub fn stop(&self) {
        if let Some(token) = self.task.lock().take() {
            token.cancel();
            info!("Connectivity monitor stopped");
        }
        self.set_status(MonitorStatus::RESET);
    }

    /// Back to {Connected, 0} without touching the timer
    pub fn reset_failure_count(&self) {
        self.set_status(MonitorStatus::RESET);
    }

    /// Run one probe and update state
    pub async fn tick(&self) -> MonitorStatus {
        let failures = self.status().failures;
        self.set_status(MonitorStatus {
            state: MonitorState::Checking,
            failures,
        });

        if self.probe.probe().await {
            self.set_status(MonitorStatus::RESET);
            return MonitorStatus::RESET;
        }

        let failures = failures + 1;
        let status = if failures < self.settings.max_attempts {
            warn!(
                "Connectivity lost (attempt {}/{})",
                failures, self.settings.max_attempts
            );
            MonitorStatus {
                state: MonitorState::Reconnecting,
                failures,
            }
        } else {
            warn!("No Internet after {} attempts", failures);
            MonitorStatus {
                state: MonitorState::NoInternet,
                failures: 0,
            }
        };

        self.set_status(status);
        let signal = match status.state {
            MonitorState::NoInternet => MonitorSignal::AllAttemptsFailed,
            _ => MonitorSignal::ConnectionLost { failures },
        };
        let _ = self.signal_tx.send(signal);
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Replays scripted results (false once exhausted) and records the
    /// monitor state observed during each probe
    #[derive(Default)]
    struct ScriptedProbe {
        results: Mutex<VecDeque<bool>>,
        calls: AtomicUsize,
        observer: Mutex<Option<watch::Receiver<MonitorStatus>>>,
        seen: Mutex<Vec<MonitorState>>,
    }

    impl ScriptedProbe {
        fn new(results: &[bool]) -> Arc<Self> {
            Arc::new(ScriptedProbe {
                results: Mutex::new(results.iter().copied().collect()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl ReachabilityProbe for ScriptedProbe {
        async fn probe(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(rx) = self.observer.lock().as_ref() {
                self.seen.lock().push(rx.borrow().state);
            }
            self.results.lock().pop_front().unwrap_or(false)
        }
    }

    fn settings(max_attempts: u32) -> MonitorSettings {
        MonitorSettings {
            max_attempts,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_three_failures_reach_no_internet() {
        let probe = ScriptedProbe::new(&[false, false, false]);
        let (monitor, mut signals) = ConnectivityMonitor::new(settings(3), probe.clone());
        *probe.observer.lock() = Some(monitor.subscribe());

        assert_eq!(
            monitor.tick().await,
            MonitorStatus { state: MonitorState::Reconnecting, failures: 1 }
        );
        assert_eq!(signals.recv().await, Some(MonitorSignal::ConnectionLost { failures: 1 }));

        assert_eq!(
            monitor.tick().await,
            MonitorStatus { state: MonitorState::Reconnecting, failures: 2 }
        );
        assert_eq!(signals.recv().await, Some(MonitorSignal::ConnectionLost { failures: 2 }));

        assert_eq!(
            monitor.tick().await,
            MonitorStatus { state: MonitorState::NoInternet, failures: 0 }
        );
        assert_eq!(signals.recv().await, Some(MonitorSignal::AllAttemptsFailed));
        assert_eq!(monitor.status().failures, 0);

        // Every probe ran while the monitor reported Checking
        assert_eq!(*probe.seen.lock(), vec![MonitorState::Checking; 3]);
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let probe = ScriptedProbe::new(&[false, false, true, false]);
        let (monitor, mut signals) = ConnectivityMonitor::new(settings(3), probe);

        monitor.tick().await;
        monitor.tick().await;
        assert_eq!(monitor.status().failures, 2);

        assert_eq!(monitor.tick().await, MonitorStatus::RESET);

        // Counting starts over after the success
        monitor.tick().await;
        assert_eq!(monitor.status().failures, 1);

        let mut received = Vec::new();
        while let Ok(signal) = signals.try_recv() {
            received.push(signal);
        }
        assert!(!received.contains(&MonitorSignal::AllAttemptsFailed));
    }

    #[tokio::test]
    async fn test_reset_failure_count() {
        let probe = ScriptedProbe::new(&[false]);
        let (monitor, _signals) = ConnectivityMonitor::new(settings(3), probe);

        monitor.tick().await;
        assert_eq!(monitor.status().state, MonitorState::Reconnecting);

        monitor.reset_failure_count();
        assert_eq!(monitor.status(), MonitorStatus::RESET);
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ticks_and_stop() {
        let probe = ScriptedProbe::new(&[]);
        let (monitor, mut signals) = ConnectivityMonitor::new(settings(3), probe.clone());

        monitor.start();
        monitor.start();
        assert!(monitor.is_running());

        // Nothing happens before the first interval elapses
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert_eq!(signals.recv().await, Some(MonitorSignal::ConnectionLost { failures: 1 }));
        assert_eq!(signals.recv().await, Some(MonitorSignal::ConnectionLost { failures: 2 }));
        assert_eq!(signals.recv().await, Some(MonitorSignal::AllAttemptsFailed));

        monitor.stop();
        assert!(!monitor.is_running());
        assert_eq!(monitor.status(), MonitorStatus::RESET);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_skipped_without_auto_failover() {
        let probe = ScriptedProbe::new(&[]);
        let mut monitor_settings = settings(3);
        monitor_settings.auto_failover = false;
        let (monitor, _signals) = ConnectivityMonitor::new(monitor_settings, probe.clone());

        monitor.start();
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);

        monitor.set_auto_failover(true);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        monitor.stop();
    }
}
