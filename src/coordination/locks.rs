// Leased exclusive lock registry
//
// Named locks with a time-to-live. A lock is held until it is explicitly
// released or its lease expires; expiry does not remove the record, so the
// registry stays inspectable after the fact. The next acquire of an expired
// id simply replaces the stale record.

use crate::error::{Result, StorageNodeError};
use crate::types::NodeId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Persistent record of a named lock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    /// Lock id
    pub id: String,

    /// Node that acquired the lock
    pub owner_node: NodeId,

    /// When the lock was acquired
    pub acquired_at: DateTime<Utc>,

    /// Lease expiry
    pub expires_at: DateTime<Utc>,

    /// Whether the lock was explicitly released
    pub released: bool,
}

impl LockRecord {
    /// Whether the lock is currently held.
    pub fn is_held(&self) -> bool {
        !self.released && Utc::now() < self.expires_at
    }
}

/// Registry of named, leased, exclusive locks
pub struct LockRegistry {
    local_node: NodeId,
    locks: Arc<DashMap<String, LockRecord>>,
}

impl LockRegistry {
    pub fn new(local_node: impl Into<NodeId>) -> Self {
        Self {
            local_node: local_node.into(),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Acquire the named lock for `ttl`.
    ///
    /// Fails with `AlreadyExists` while another holder's lease is live.
    /// Records left behind by released or expired locks are replaced.
    pub fn acquire(&self, id: &str, ttl: Duration) -> Result<LockHandle> {
        if id.is_empty() {
            return Err(StorageNodeError::InvalidArgument(
                "lock id must not be empty".to_string(),
            ));
        }
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|_| StorageNodeError::InvalidArgument("lock ttl out of range".into()))?;
        let record = LockRecord {
            id: id.to_string(),
            owner_node: self.local_node.clone(),
            acquired_at: now,
            expires_at,
            released: false,
        };

        match self.locks.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().is_held() {
                    return Err(StorageNodeError::AlreadyExists(format!(
                        "lock {id} held by {} until {}",
                        entry.get().owner_node,
                        entry.get().expires_at
                    )));
                }
                entry.insert(record);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(record);
            }
        }
        debug!("lock {} acquired by {}", id, self.local_node);
        Ok(LockHandle {
            id: id.to_string(),
            owner: self.local_node.clone(),
            expires_at,
            released: false,
            locks: Arc::clone(&self.locks),
        })
    }

    /// Look up the record for a lock id, held or not.
    pub fn get(&self, id: &str) -> Option<LockRecord> {
        self.locks.get(id).map(|r| r.value().clone())
    }

    /// Whether the named lock is currently held.
    pub fn is_held(&self, id: &str) -> bool {
        self.locks.get(id).map(|r| r.is_held()).unwrap_or(false)
    }

    /// All records, for inspection.
    pub fn list(&self) -> Vec<LockRecord> {
        let mut records: Vec<LockRecord> =
            self.locks.iter().map(|e| e.value().clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}

/// Caller-side handle to an acquired lock
#[derive(Debug)]
pub struct LockHandle {
    /// Lock id
    pub id: String,

    /// Owning node
    pub owner: NodeId,

    /// Current lease expiry
    pub expires_at: DateTime<Utc>,

    released: bool,
    locks: Arc<DashMap<String, LockRecord>>,
}

impl LockHandle {
    /// Release the lock, deleting its record.
    ///
    /// The first call succeeds; any further call is `InvalidArgument`.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Err(StorageNodeError::InvalidArgument(format!(
                "lock {} already released",
                self.id
            )));
        }
        self.released = true;
        self.locks.remove(&self.id);
        debug!("lock {} released", self.id);
        Ok(())
    }

    /// Extend the lease to `now + ttl`.
    pub fn renew(&mut self, ttl: Duration) -> Result<()> {
        if self.released {
            return Err(StorageNodeError::InvalidArgument(format!(
                "lock {} already released",
                self.id
            )));
        }
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|_| StorageNodeError::InvalidArgument("lock ttl out of range".into()))?;
        match self.locks.get_mut(&self.id) {
            Some(mut record) if !record.released => {
                record.expires_at = expires_at;
                self.expires_at = expires_at;
                Ok(())
            }
            _ => Err(StorageNodeError::NotFound(format!(
                "lock {} no longer registered",
                self.id
            ))),
        }
    }

    /// Whether this handle still holds the lock.
    pub fn is_held(&self) -> bool {
        !self.released && Utc::now() < self.expires_at
    }
}
