use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableTable, ReadableTableMetadata, Table, TableDefinition};
use tracing::{debug, info, warn};

use super::model::{NewSecret, SecretRecord};
use super::{generate_id, retention_secs, system_clock, Clock, SecretStore, StoreError};

const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Marker byte leading every encoded record, so the layout can evolve.
const RECORD_V1_MARKER: u8 = 0x01;

/// Durable store backed by a single redb file.
///
/// redb runs write transactions one at a time, so a consume (remove inside a
/// write transaction) can never interleave with another consume or a sweep
/// touching the same id.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    retention_secs: i64,
    clock: Clock,
}

impl RedbStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, retention: Duration) -> Result<Self, StoreError> {
        Self::with_clock(path, retention, system_clock())
    }

    pub fn with_clock(path: &Path, retention: Duration, clock: Clock) -> Result<Self, StoreError> {
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            retention_secs: retention_secs(retention),
            clock,
        })
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }
}

impl SecretStore for RedbStore {
    fn create(&self, secret: NewSecret) -> Result<String, StoreError> {
        let record = SecretRecord::from_new(secret, self.now());
        let bytes = encode(&record)?;

        let write_txn = self.db.begin_write()?;
        let id = {
            let mut table = write_txn.open_table(SECRETS)?;
            let mut id = generate_id();
            while table.get(id.as_str())?.is_some() {
                id = generate_id();
            }
            table.insert(id.as_str(), bytes.as_slice())?;
            id
        };
        write_txn.commit()?;

        debug!(id = %id, "stored secret");
        Ok(id)
    }

    fn consume_if_pending(&self, id: &str) -> Result<Option<SecretRecord>, StoreError> {
        let now = self.now();
        let retention = self.retention_secs;

        let write_txn = self.db.begin_write()?;
        let taken = {
            let mut table = write_txn.open_table(SECRETS)?;
            take_if(&mut table, id, |_| true)?
        };
        // A decode failure above drops the transaction uncommitted: the record
        // stays put and nothing is delivered.
        write_txn.commit()?;

        Ok(taken.and_then(|record| {
            if record.is_retention_expired(now, retention) {
                debug!(id = %id, "discarded secret past retention on read");
                None
            } else {
                Some(record)
            }
        }))
    }

    fn sweep(&self) -> Result<usize, StoreError> {
        let now = self.now();
        let retention = self.retention_secs;

        // Collect candidates in a read pass first. Records that no longer
        // decode can never be delivered, so they are purged too.
        let (candidates, corrupt) = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SECRETS)?;
            let mut expired = Vec::new();
            let mut corrupt = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                match decode(v.value()) {
                    Ok(record) if record.is_retention_expired(now, retention) => {
                        expired.push(k.value().to_owned());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(id = %k.value(), error = %e, "purging undecodable record");
                        corrupt.push(k.value().to_owned());
                    }
                }
            }
            (expired, corrupt)
        };

        if candidates.is_empty() && corrupt.is_empty() {
            return Ok(0);
        }

        // Delete through the consume primitive: an id a reader got to first
        // is simply absent here and not counted.
        let write_txn = self.db.begin_write()?;
        let mut removed = 0usize;
        {
            let mut table = write_txn.open_table(SECRETS)?;
            for id in &candidates {
                match take_if(&mut table, id, |r| r.is_retention_expired(now, retention)) {
                    Ok(Some(_)) => removed += 1,
                    Ok(None) => {}
                    // Replaced by a corrupt value since the read pass.
                    Err(StoreError::Codec(_)) => removed += purge_corrupt(&mut table, id)?,
                    Err(e) => return Err(e),
                }
            }
            for id in &corrupt {
                removed += purge_corrupt(&mut table, id)?;
            }
        }
        write_txn.commit()?;

        if removed > 0 {
            info!(removed, "swept unopened secrets past retention");
        }
        Ok(removed)
    }

    fn pending_count(&self) -> Result<usize, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        Ok(table.len()? as usize)
    }
}

/// Remove `id` from `table` and return its record, if present and `pred` holds.
/// Only ever called inside a write transaction.
fn take_if(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    id: &str,
    pred: impl FnOnce(&SecretRecord) -> bool,
) -> Result<Option<SecretRecord>, StoreError> {
    // Copy the bytes out so the AccessGuard borrow ends before mutation.
    let raw: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());
    let Some(raw) = raw else {
        return Ok(None);
    };
    let record = decode(&raw)?;
    if !pred(&record) {
        return Ok(None);
    }
    table.remove(id)?;
    Ok(Some(record))
}

/// Remove `id` if its value still fails to decode. Returns how many records went.
fn purge_corrupt(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    id: &str,
) -> Result<usize, StoreError> {
    let still_corrupt = match table.get(id)? {
        Some(guard) => decode(guard.value()).is_err(),
        None => false,
    };
    if !still_corrupt {
        return Ok(0);
    }
    table.remove(id)?;
    Ok(1)
}

/// Encode a record as `[RECORD_V1_MARKER] + bincode(record)`.
fn encode(record: &SecretRecord) -> Result<Vec<u8>, StoreError> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_V1_MARKER);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<SecretRecord, StoreError> {
    match bytes.split_first() {
        Some((&RECORD_V1_MARKER, payload)) => {
            let (record, _) =
                bincode::serde::decode_from_slice(payload, bincode::config::standard())?;
            Ok(record)
        }
        Some((marker, _)) => Err(StoreError::Codec(format!(
            "unknown record marker {marker:#04x}"
        ))),
        None => Err(StoreError::Codec("empty record".into())),
    }
}
