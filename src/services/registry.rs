//! In-memory metadata registry.
//!
//! One mutex guards the whole map. Every deletion path (timer, sweep,
//! single-use completion, explicit delete, fetch-time expiry) goes through
//! `remove` or `expire`, and only the caller that actually takes the record
//! out of the map goes on to unlink its blob.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    errors::{StoreError, StoreResult},
    models::object::ObjectMeta,
    services::{id_generator::ObjectId, lifecycle::DeletionHandle},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    Available,
    /// A single-use download is streaming; other fetches must not see it.
    Claimed,
}

/// Registry entry: metadata plus the handle of its scheduled deletion.
#[derive(Debug)]
pub struct ObjectRecord {
    pub meta: ObjectMeta,
    pub state: TransferState,
    deletion: Option<DeletionHandle>,
}

impl ObjectRecord {
    pub fn new(meta: ObjectMeta) -> Self {
        Self {
            meta,
            state: TransferState::Available,
            deletion: None,
        }
    }

    pub fn take_deletion_handle(&mut self) -> Option<DeletionHandle> {
        self.deletion.take()
    }
}

/// Result of looking an id up for a client.
#[derive(Debug)]
pub enum Lookup {
    Live {
        meta: ObjectMeta,
        state: TransferState,
    },
    /// Removed because its TTL elapsed.
    Expired,
    Missing,
}

/// Result of an expiry attempt.
#[derive(Debug)]
pub enum Expiry {
    Removed(ObjectRecord),
    /// Still live; the deadline has not passed on the wall clock yet.
    NotDue(DateTime<Utc>),
    /// Someone else already removed it.
    Gone,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub live: usize,
    pub downloading: usize,
    pub expired_tombstones: usize,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<ObjectId, ObjectRecord>,
    /// Ids removed by expiry, so late fetches can answer `Expired` rather
    /// than `NotFound`.
    tombstones: HashMap<ObjectId, DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct MetadataRegistry {
    inner: Mutex<Inner>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new record. A duplicate id means the generator is broken.
    pub fn insert(&self, record: ObjectRecord) -> StoreResult<()> {
        let mut inner = self.lock();
        let id = record.meta.id.clone();
        if inner.records.contains_key(&id) || inner.tombstones.contains_key(&id) {
            return Err(StoreError::Conflict(id));
        }
        inner.records.insert(id, record);
        Ok(())
    }

    pub fn get(&self, id: &ObjectId) -> Option<ObjectMeta> {
        self.lock().records.get(id).map(|r| r.meta.clone())
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.lock().records.contains_key(id)
    }

    pub fn lookup(&self, id: &ObjectId) -> Lookup {
        let inner = self.lock();
        if let Some(record) = inner.records.get(id) {
            Lookup::Live {
                meta: record.meta.clone(),
                state: record.state,
            }
        } else if inner.tombstones.contains_key(id) {
            Lookup::Expired
        } else {
            Lookup::Missing
        }
    }

    pub fn is_expired(&self, id: &ObjectId) -> bool {
        self.lock().tombstones.contains_key(id)
    }

    /// Take the record out of the map. At most one caller gets `Some`.
    pub fn remove(&self, id: &ObjectId) -> Option<ObjectRecord> {
        self.lock().records.remove(id)
    }

    /// Remove the record if its deadline has passed at `now`, leaving a
    /// tombstone in the same critical section.
    pub fn expire(&self, id: &ObjectId, now: DateTime<Utc>) -> Expiry {
        let mut inner = self.lock();
        let Some(record) = inner.records.get(id) else {
            return Expiry::Gone;
        };
        if !record.meta.is_expired_at(now) {
            return Expiry::NotDue(record.meta.expires_at);
        }

        match inner.records.remove(id) {
            Some(record) => {
                inner.tombstones.insert(id.clone(), now);
                Expiry::Removed(record)
            }
            None => Expiry::Gone,
        }
    }

    /// Attach the scheduled deletion to its record. Hands the handle back if
    /// the record is already gone so the caller can cancel it.
    pub fn set_deletion_handle(
        &self,
        id: &ObjectId,
        handle: DeletionHandle,
    ) -> Option<DeletionHandle> {
        match self.lock().records.get_mut(id) {
            Some(record) => {
                record.deletion = Some(handle);
                None
            }
            None => Some(handle),
        }
    }

    /// Mark the record as being downloaded. Only one caller can hold a claim.
    pub fn claim(&self, id: &ObjectId) -> bool {
        match self.lock().records.get_mut(id) {
            Some(record) if record.state == TransferState::Available => {
                record.state = TransferState::Claimed;
                true
            }
            _ => false,
        }
    }

    /// Make a claimed record available again after an incomplete download.
    pub fn release(&self, id: &ObjectId) {
        if let Some(record) = self.lock().records.get_mut(id) {
            record.state = TransferState::Available;
        }
    }

    pub fn snapshot(&self) -> Vec<(ObjectId, ObjectMeta)> {
        self.lock()
            .records
            .iter()
            .map(|(id, record)| (id.clone(), record.meta.clone()))
            .collect()
    }

    /// Forget tombstones recorded before `cutoff`.
    pub fn prune_tombstones(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        let before = inner.tombstones.len();
        inner.tombstones.retain(|_, expired_at| *expired_at >= cutoff);
        before - inner.tombstones.len()
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.lock();
        RegistryStats {
            live: inner.records.len(),
            downloading: inner
                .records
                .values()
                .filter(|r| r.state == TransferState::Claimed)
                .count(),
            expired_tombstones: inner.tombstones.len(),
        }
    }
}
