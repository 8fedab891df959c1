//! Candidate servers and their store
//!
//! The store itself belongs to the embedding application; the core only
//! reads records and annotates them with measured latency.

mod ranking;

pub use ranking::{format_latency, measure_latency, rank_servers, LatencyGrade, ProbeResult};

use crate::config::ConnectionDescriptor;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tracing::{debug, warn};

/// Opaque server identifier assigned by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub u64);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Candidate server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: ServerId,
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Identity token from the descriptor
    pub identity: String,
    /// Descriptor URI the record was built from
    pub descriptor: String,
    /// Last measured connect latency in milliseconds
    pub latency_ms: Option<u32>,
    pub last_probe: Option<DateTime<Utc>>,
}

impl ServerRecord {
    /// Build an unsaved record (id 0) from a descriptor URI
    pub fn from_uri(uri: &str) -> Result<Self> {
        let descriptor = ConnectionDescriptor::parse(uri)?;
        Ok(ServerRecord {
            id: ServerId(0),
            name: descriptor.label,
            host: descriptor.address,
            port: descriptor.port,
            identity: descriptor.identity,
            descriptor: uri.to_string(),
            latency_ms: None,
            last_probe: None,
        })
    }

    /// Re-parse the stored descriptor
    pub fn connection_descriptor(&self) -> Result<ConnectionDescriptor> {
        ConnectionDescriptor::parse(&self.descriptor)
    }
}

/// Candidate order: ascending latency, unmeasured last, then ascending name
pub fn compare_candidates(a: &ServerRecord, b: &ServerRecord) -> Ordering {
    let by_latency = match (a.latency_ms, b.latency_ms) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_latency.then_with(|| a.name.cmp(&b.name))
}

/// Sort records in candidate order
pub fn sort_candidates(records: &mut [ServerRecord]) {
    records.sort_by(compare_candidates);
}

/// Create/read/update/delete access to server records
#[async_trait]
pub trait ServerStore: Send + Sync {
    /// All records in candidate order
    async fn list(&self) -> Result<Vec<ServerRecord>>;

    async fn get(&self, id: ServerId) -> Result<Option<ServerRecord>>;

    /// Insert a record, assigning a fresh id
    async fn insert(&self, record: ServerRecord) -> Result<ServerId>;

    /// Drop every record and insert the given ones
    async fn replace_all(&self, records: Vec<ServerRecord>) -> Result<Vec<ServerId>>;

    /// Record a probe result; last write wins
    async fn update_latency(&self, id: ServerId, latency_ms: Option<u32>, at: DateTime<Utc>) -> Result<()>;

    async fn delete(&self, id: ServerId) -> Result<()>;

    async fn count(&self) -> Result<usize>;
}

/// In-process store
pub struct MemoryServerStore {
    records: RwLock<BTreeMap<ServerId, ServerRecord>>,
    next_id: AtomicU64,
}

impl MemoryServerStore {
    pub fn new() -> Self {
        MemoryServerStore {
            records: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate(&self, mut record: ServerRecord) -> ServerRecord {
        record.id = ServerId(self.next_id.fetch_add(1, AtomicOrdering::SeqCst));
        record
    }
}

impl Default for MemoryServerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerStore for MemoryServerStore {
    async fn list(&self) -> Result<Vec<ServerRecord>> {
        let mut records: Vec<ServerRecord> = self.records.read().values().cloned().collect();
        sort_candidates(&mut records);
        Ok(records)
    }

    async fn get(&self, id: ServerId) -> Result<Option<ServerRecord>> {
        Ok(self.records.read().get(&id).cloned())
    }

    async fn insert(&self, record: ServerRecord) -> Result<ServerId> {
        let record = self.allocate(record);
        let id = record.id;
        self.records.write().insert(id, record);
        Ok(id)
    }

    async fn replace_all(&self, records: Vec<ServerRecord>) -> Result<Vec<ServerId>> {
        let allocated: Vec<ServerRecord> = records.into_iter().map(|r| self.allocate(r)).collect();
        let ids = allocated.iter().map(|r| r.id).collect();

        let mut guard = self.records.write();
        guard.clear();
        guard.extend(allocated.into_iter().map(|r| (r.id, r)));
        Ok(ids)
    }

    async fn update_latency(&self, id: ServerId, latency_ms: Option<u32>, at: DateTime<Utc>) -> Result<()> {
        let mut guard = self.records.write();
        let record = guard
            .get_mut(&id)
            .ok_or_else(|| Error::store(format!("Unknown server {}", id)))?;
        record.latency_ms = latency_ms;
        record.last_probe = Some(at);
        Ok(())
    }

    async fn delete(&self, id: ServerId) -> Result<()> {
        self.records.write().remove(&id);
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.records.read().len())
    }
}

/// Read one descriptor URI per line. Blank lines and `#` comments are
/// skipped; lines that fail to parse are logged and dropped.
pub fn load_uri_list(text: &str) -> Vec<ServerRecord> {
    let mut records = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match ServerRecord::from_uri(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping line {}: {}", lineno + 1, e),
        }
    }
    debug!("Loaded {} server descriptors", records.len());
    records
}
