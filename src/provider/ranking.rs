//! Server latency ranking
//!
//! Every candidate is probed independently with a raw TCP connect; each
//! probe writes its own result back to the store as soon as it finishes.

use super::{ServerId, ServerRecord, ServerStore};
use crate::common::net::{latency_millis, measure_connect};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of one latency probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub id: ServerId,
    pub latency_ms: Option<u32>,
    pub at: DateTime<Utc>,
}

/// Connect latency to `host:port` in milliseconds
pub async fn measure_latency(host: &str, port: u16, timeout: Duration) -> Option<u32> {
    measure_connect(host, port, timeout).await.map(latency_millis)
}

/// Probe all servers concurrently and store each result.
///
/// Probes are not cancelled if the caller loses interest; a later
/// ranking simply overwrites their results.
pub async fn rank_servers(
    store: &dyn ServerStore,
    servers: &[ServerRecord],
    timeout: Duration,
) -> Vec<ProbeResult> {
    let probes = servers.iter().map(|server| async move {
        let latency_ms = measure_latency(&server.host, server.port, timeout).await;
        let result = ProbeResult {
            id: server.id,
            latency_ms,
            at: Utc::now(),
        };

        debug!("{} ({}): {}", server.name, server.id, format_latency(latency_ms));
        if let Err(e) = store.update_latency(result.id, result.latency_ms, result.at).await {
            warn!("Failed to store latency for {}: {}", server.id, e);
        }
        result
    });

    futures::future::join_all(probes).await
}

/// Coarse latency bucket used for display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyGrade {
    Good,
    Fair,
    Poor,
    Unknown,
}

impl LatencyGrade {
    pub fn of(latency_ms: Option<u32>) -> Self {
        match latency_ms {
            None => LatencyGrade::Unknown,
            Some(ms) if ms < 100 => LatencyGrade::Good,
            Some(ms) if ms < 200 => LatencyGrade::Fair,
            Some(_) => LatencyGrade::Poor,
        }
    }
}

impl std::fmt::Display for LatencyGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LatencyGrade::Good => write!(f, "good"),
            LatencyGrade::Fair => write!(f, "fair"),
            LatencyGrade::Poor => write!(f, "poor"),
            LatencyGrade::Unknown => write!(f, "unknown"),
        }
    }
}

/// "42ms", or "..." when unmeasured
pub fn format_latency(latency_ms: Option<u32>) -> String {
    latency_ms.map(|ms| format!("{}ms", ms)).unwrap_or_else(|| "...".to_string())
}
