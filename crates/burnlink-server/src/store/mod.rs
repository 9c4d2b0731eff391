//! Consume-once ciphertext storage.
//!
//! The trait is synchronous, like the handlers' view of the database: every
//! operation is one short transaction. Backends share one contract:
//! `consume_if_pending` is a single indivisible test-and-delete, and the
//! retention sweep deletes through the same primitive, so any two callers
//! racing on one id see exactly one winner.

pub mod db;
pub mod error;
pub mod memory;
pub mod model;
pub mod sweep;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;

pub use db::RedbStore;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use model::{NewSecret, SecretRecord, TEXT_CONTENT_TYPE};
pub use sweep::{spawn_sweep, SweepHandle, MIN_SWEEP_INTERVAL};

/// Random bytes behind every secret id (128 bits).
pub const ID_BYTES: usize = 16;

/// Source of "now" in unix seconds. Swappable so tests can age records.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub trait SecretStore: Send + Sync + 'static {
    /// Persist `secret` as pending under a fresh unguessable id and return the id.
    fn create(&self, secret: NewSecret) -> Result<String, StoreError>;

    /// Atomically remove and return the record for `id`.
    ///
    /// `Ok(None)` covers "never existed", "already consumed" and "past
    /// retention" alike; callers must not be able to tell them apart.
    fn consume_if_pending(&self, id: &str) -> Result<Option<SecretRecord>, StoreError>;

    /// Delete every pending record older than the retention window.
    /// Returns how many records this call removed.
    fn sweep(&self) -> Result<usize, StoreError>;

    /// Number of records currently held.
    fn pending_count(&self) -> Result<usize, StoreError>;
}

/// Generate a secret id: 16 bytes from the OS CSPRNG, hex-encoded.
pub fn generate_id() -> String {
    let mut bytes = [0u8; ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Shape check for ids arriving from the network. Anything else cannot exist.
pub fn is_valid_id(id: &str) -> bool {
    id.len() == ID_BYTES * 2 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Retention window in whole seconds, saturating for windows beyond `i64`.
pub(crate) fn retention_secs(retention: Duration) -> i64 {
    i64::try_from(retention.as_secs()).unwrap_or(i64::MAX)
}

pub fn system_clock() -> Clock {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    })
}
