use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::model::{NewSecret, SecretRecord};
use super::{generate_id, retention_secs, system_clock, Clock, SecretStore, StoreError};

/// Non-durable store for single-process deployments and tests.
///
/// Records live in a sharded `DashMap`; `remove` and `remove_if` lock only the
/// shard holding the id, so consumes on different ids never contend.
pub struct MemoryStore {
    records: DashMap<String, SecretRecord>,
    retention_secs: i64,
    clock: Clock,
}

impl MemoryStore {
    pub fn new(retention: Duration) -> Self {
        Self::with_clock(retention, system_clock())
    }

    pub fn with_clock(retention: Duration, clock: Clock) -> Self {
        Self {
            records: DashMap::new(),
            retention_secs: retention_secs(retention),
            clock,
        }
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }
}

impl SecretStore for MemoryStore {
    fn create(&self, secret: NewSecret) -> Result<String, StoreError> {
        let record = SecretRecord::from_new(secret, self.now());
        loop {
            let id = generate_id();
            if let Entry::Vacant(slot) = self.records.entry(id.clone()) {
                slot.insert(record);
                debug!(id = %id, "stored secret");
                return Ok(id);
            }
        }
    }

    fn consume_if_pending(&self, id: &str) -> Result<Option<SecretRecord>, StoreError> {
        let now = self.now();
        let Some((_, record)) = self.records.remove(id) else {
            return Ok(None);
        };
        if record.is_retention_expired(now, self.retention_secs) {
            debug!(id = %id, "discarded secret past retention on read");
            return Ok(None);
        }
        Ok(Some(record))
    }

    fn sweep(&self) -> Result<usize, StoreError> {
        let now = self.now();
        let retention = self.retention_secs;

        // Collect first: removing while iterating would deadlock on the shard lock.
        let candidates: Vec<String> = self
            .records
            .iter()
            .filter(|entry| entry.value().is_retention_expired(now, retention))
            .map(|entry| entry.key().clone())
            .collect();

        let removed = candidates
            .iter()
            .filter(|id| {
                self.records
                    .remove_if(id.as_str(), |_, r| r.is_retention_expired(now, retention))
                    .is_some()
            })
            .count();

        if removed > 0 {
            info!(removed, "swept unopened secrets past retention");
        }
        Ok(removed)
    }

    fn pending_count(&self) -> Result<usize, StoreError> {
        Ok(self.records.len())
    }
}
