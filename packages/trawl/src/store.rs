//! Persistence collaborator contract.
//!
//! # The Contract
//!
//! 1. **Append-only events.** Every event the bus accepts is stored exactly
//!    once, including events whose delivery was suppressed by the cycle
//!    check. Stored events are never updated.
//!
//! 2. **Scan instance owned by the controller.** Only the controller creates
//!    a scan instance and changes its status.
//!
//! 3. **Failures are fatal.** A [`StoreError`] ends the scan; there is no
//!    degraded mode.
//!
//! [`MemoryStore`] is the in-process implementation used by tests and by
//! embedders that do not need durability.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

use crate::event::{EventType, ScanEvent, StoredEvent};
use crate::scan::{ScanId, ScanInstance, ScanLogEntry, ScanStatus};

// =============================================================================
// Store Error
// =============================================================================

/// Errors from scan storage.
#[derive(Debug)]
pub enum StoreError {
    /// No scan instance with this id exists.
    UnknownScan(ScanId),

    /// Stored provenance links loop back on themselves.
    CorruptProvenance {
        /// Scan the loop was found in.
        scan_id: ScanId,
        /// First hash seen twice.
        hash: String,
    },

    /// Storage backend failed (timeout, connection, serialization).
    Backend(anyhow::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::UnknownScan(id) => write!(f, "unknown scan {}", id),
            StoreError::CorruptProvenance { scan_id, hash } => {
                write!(f, "provenance of scan {} loops at {}", scan_id, hash)
            }
            StoreError::Backend(e) => write!(f, "storage backend error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Backend(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(err)
    }
}

// =============================================================================
// Scan Store
// =============================================================================

/// Persists scans, their events and their logs.
///
/// Implementations must accept concurrent appends.
#[async_trait]
pub trait ScanStore: Send + Sync + 'static {
    /// Persist a new scan instance.
    async fn create_scan_instance(&self, instance: &ScanInstance) -> Result<(), StoreError>;

    /// Record a status change. `None` timestamps leave the stored value alone.
    async fn set_scan_status(
        &self,
        scan_id: ScanId,
        started: Option<DateTime<Utc>>,
        ended: Option<DateTime<Utc>>,
        status: ScanStatus,
    ) -> Result<(), StoreError>;

    /// Append one event.
    async fn store_event(&self, scan_id: ScanId, event: &ScanEvent) -> Result<(), StoreError>;

    /// The parent records of the events with the given hashes.
    ///
    /// Hashes that are unknown or belong to ROOT contribute nothing.
    async fn element_sources(
        &self,
        scan_id: ScanId,
        hashes: &[String],
    ) -> Result<Vec<StoredEvent>, StoreError>;

    /// Keep the merged configuration a scan ran with.
    async fn store_scan_config(&self, scan_id: ScanId, config: &Value) -> Result<(), StoreError>;

    /// Append a line to the scan log.
    async fn log_scan_event(&self, scan_id: ScanId, entry: ScanLogEntry) -> Result<(), StoreError>;

    async fn scan_instance(&self, scan_id: ScanId) -> Result<Option<ScanInstance>, StoreError>;

    /// All events of a scan, in storage order.
    async fn scan_events(&self, scan_id: ScanId) -> Result<Vec<StoredEvent>, StoreError>;

    async fn scan_logs(&self, scan_id: ScanId) -> Result<Vec<ScanLogEntry>, StoreError>;

    /// Number of stored events per type, ROOT excluded.
    async fn result_summary(
        &self,
        scan_id: ScanId,
    ) -> Result<BTreeMap<EventType, usize>, StoreError>;
}

/// Reconstruct an event's ancestors from storage, nearest first, ending at
/// ROOT.
pub async fn provenance_chain(
    store: &dyn ScanStore,
    scan_id: ScanId,
    hash: &str,
) -> Result<Vec<StoredEvent>, StoreError> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = hash.to_string();
    seen.insert(current.clone());

    loop {
        let sources = store
            .element_sources(scan_id, std::slice::from_ref(&current))
            .await?;
        let Some(parent) = sources.into_iter().next() else {
            break;
        };
        if !seen.insert(parent.hash.clone()) {
            return Err(StoreError::CorruptProvenance {
                scan_id,
                hash: parent.hash,
            });
        }
        let reached_root = parent.is_root();
        current = parent.hash.clone();
        chain.push(parent);
        if reached_root {
            break;
        }
    }

    Ok(chain)
}

// =============================================================================
// Memory Store
// =============================================================================

#[derive(Debug)]
struct ScanRecord {
    instance: ScanInstance,
    events: Vec<StoredEvent>,
    by_hash: HashMap<String, usize>,
    logs: Vec<ScanLogEntry>,
    config: Option<Value>,
}

/// In-memory scan store backed by a `DashMap` per scan.
#[derive(Debug, Default)]
pub struct MemoryStore {
    scans: DashMap<ScanId, ScanRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The configuration snapshot stored for a scan.
    pub fn scan_config(&self, scan_id: ScanId) -> Option<Value> {
        self.scans.get(&scan_id).and_then(|r| r.config.clone())
    }

    /// One stored event by hash.
    pub fn event(&self, scan_id: ScanId, hash: &str) -> Option<StoredEvent> {
        let record = self.scans.get(&scan_id)?;
        let index = *record.by_hash.get(hash)?;
        record.events.get(index).cloned()
    }

    /// Every scan instance, oldest first.
    pub fn scan_instances(&self) -> Vec<ScanInstance> {
        let mut instances: Vec<ScanInstance> =
            self.scans.iter().map(|r| r.instance.clone()).collect();
        instances.sort_by_key(|i| i.created_at);
        instances
    }

    /// Drop a scan and everything stored for it.
    pub fn delete_scan(&self, scan_id: ScanId) -> bool {
        self.scans.remove(&scan_id).is_some()
    }
}

#[async_trait]
impl ScanStore for MemoryStore {
    async fn create_scan_instance(&self, instance: &ScanInstance) -> Result<(), StoreError> {
        self.scans.insert(
            instance.id,
            ScanRecord {
                instance: instance.clone(),
                events: Vec::new(),
                by_hash: HashMap::new(),
                logs: Vec::new(),
                config: None,
            },
        );
        Ok(())
    }

    async fn set_scan_status(
        &self,
        scan_id: ScanId,
        started: Option<DateTime<Utc>>,
        ended: Option<DateTime<Utc>>,
        status: ScanStatus,
    ) -> Result<(), StoreError> {
        let mut record = self
            .scans
            .get_mut(&scan_id)
            .ok_or(StoreError::UnknownScan(scan_id))?;
        if started.is_some() {
            record.instance.started_at = started;
        }
        if ended.is_some() {
            record.instance.ended_at = ended;
        }
        record.instance.status = status;
        Ok(())
    }

    async fn store_event(&self, scan_id: ScanId, event: &ScanEvent) -> Result<(), StoreError> {
        let mut record = self
            .scans
            .get_mut(&scan_id)
            .ok_or(StoreError::UnknownScan(scan_id))?;
        let stored = StoredEvent::from_event(scan_id, event);
        let index = record.events.len();
        record.by_hash.insert(stored.hash.clone(), index);
        record.events.push(stored);
        Ok(())
    }

    async fn element_sources(
        &self,
        scan_id: ScanId,
        hashes: &[String],
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let record = self
            .scans
            .get(&scan_id)
            .ok_or(StoreError::UnknownScan(scan_id))?;

        let sources = hashes
            .iter()
            .filter_map(|hash| record.by_hash.get(hash).map(|&i| &record.events[i]))
            .filter(|child| !child.is_root())
            .filter_map(|child| record.by_hash.get(&child.source_hash))
            .map(|&i| record.events[i].clone())
            .collect();
        Ok(sources)
    }

    async fn store_scan_config(&self, scan_id: ScanId, config: &Value) -> Result<(), StoreError> {
        let mut record = self
            .scans
            .get_mut(&scan_id)
            .ok_or(StoreError::UnknownScan(scan_id))?;
        record.config = Some(config.clone());
        Ok(())
    }

    async fn log_scan_event(&self, scan_id: ScanId, entry: ScanLogEntry) -> Result<(), StoreError> {
        let mut record = self
            .scans
            .get_mut(&scan_id)
            .ok_or(StoreError::UnknownScan(scan_id))?;
        record.logs.push(entry);
        Ok(())
    }

    async fn scan_instance(&self, scan_id: ScanId) -> Result<Option<ScanInstance>, StoreError> {
        Ok(self.scans.get(&scan_id).map(|r| r.instance.clone()))
    }

    async fn scan_events(&self, scan_id: ScanId) -> Result<Vec<StoredEvent>, StoreError> {
        let record = self
            .scans
            .get(&scan_id)
            .ok_or(StoreError::UnknownScan(scan_id))?;
        Ok(record.events.clone())
    }

    async fn scan_logs(&self, scan_id: ScanId) -> Result<Vec<ScanLogEntry>, StoreError> {
        let record = self
            .scans
            .get(&scan_id)
            .ok_or(StoreError::UnknownScan(scan_id))?;
        Ok(record.logs.clone())
    }

    async fn result_summary(
        &self,
        scan_id: ScanId,
    ) -> Result<BTreeMap<EventType, usize>, StoreError> {
        let record = self
            .scans
            .get(&scan_id)
            .ok_or(StoreError::UnknownScan(scan_id))?;
        let mut summary = BTreeMap::new();
        for event in record.events.iter().filter(|e| !e.is_root()) {
            *summary.entry(event.event_type.clone()).or_insert(0) += 1;
        }
        Ok(summary)
    }
}
