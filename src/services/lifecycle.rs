//! Lifecycle manager.
//!
//! Owns the expiry semantics of stored objects:
//! - one timer wheel (`DelayQueue`) driven by a single background task holds
//!   the deferred deletion of every object;
//! - a periodic sweep catches anything the timers missed and deletes blob
//!   files that have no live record;
//! - at startup every pre-existing blob is purged, since its metadata died
//!   with the previous process.
//!
//! All paths remove through the registry first; whoever gets the record
//! unlinks the blob, everyone else does nothing.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::{collections::HashMap, io, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::{
    sync::CancellationToken,
    time::{DelayQueue, delay_queue},
};
use tracing::{debug, info, warn};

use crate::services::{
    blob_store::BlobStore,
    id_generator::ObjectId,
    registry::{Expiry, MetadataRegistry, ObjectRecord},
};

/// Longest TTL the timer wheel accepts. Longer requests are clamped.
pub const MAX_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug)]
enum TimerCommand {
    Schedule { id: ObjectId, deadline: Instant },
    Cancel(ObjectId),
}

/// Cancels the scheduled deletion of one object.
///
/// Safe to use after the timer fired: the wheel task ignores ids it no
/// longer tracks.
#[derive(Debug)]
pub struct DeletionHandle {
    id: ObjectId,
    commands: mpsc::UnboundedSender<TimerCommand>,
}

impl DeletionHandle {
    pub fn cancel(self) {
        // A closed channel means the wheel is gone; nothing left to cancel.
        let _ = self.commands.send(TimerCommand::Cancel(self.id));
    }
}

/// Outcome of one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub orphans: usize,
    pub failures: usize,
    pub tombstones_pruned: usize,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        self.expired == 0 && self.orphans == 0 && self.failures == 0
    }
}

#[derive(Clone, Debug)]
pub struct LifecycleManager {
    registry: Arc<MetadataRegistry>,
    blobs: Arc<BlobStore>,
    commands: mpsc::UnboundedSender<TimerCommand>,
    shutdown: CancellationToken,
    expired_retention: chrono::Duration,
}

impl LifecycleManager {
    /// Spawn the timer wheel task. Must be called inside a Tokio runtime.
    pub fn start(
        registry: Arc<MetadataRegistry>,
        blobs: Arc<BlobStore>,
        expired_retention: Duration,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        tokio::spawn(run_timer_wheel(
            receiver,
            registry.clone(),
            blobs.clone(),
            shutdown.clone(),
        ));

        Self {
            registry,
            blobs,
            commands,
            shutdown,
            expired_retention: chrono::Duration::from_std(expired_retention)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Delete every file left in the storage root by a previous process.
    /// Run before the first upload is accepted.
    pub async fn reconcile_startup(&self) -> io::Result<usize> {
        let removed = self.blobs.purge_all().await?;
        if removed > 0 {
            info!(
                removed,
                root = %self.blobs.root().display(),
                "removed blobs left by a previous run"
            );
        }
        Ok(removed)
    }

    /// Queue the deferred deletion of an object at its `expires_at`.
    pub fn schedule(&self, id: &ObjectId, expires_at: DateTime<Utc>) -> DeletionHandle {
        let command = TimerCommand::Schedule {
            id: id.clone(),
            deadline: deadline_for(expires_at),
        };
        if self.commands.send(command).is_err() {
            warn!(%id, "timer wheel stopped; the sweep will expire this object");
        }
        DeletionHandle {
            id: id.clone(),
            commands: self.commands.clone(),
        }
    }

    /// Remove an overdue object and unlink its blob.
    ///
    /// Returns `true` if the object is gone afterwards because of expiry,
    /// whoever did the removal.
    pub async fn expire(&self, id: &ObjectId) -> bool {
        match self.registry.expire(id, Utc::now()) {
            Expiry::Removed(record) => {
                discard(&self.blobs, record, "expired").await;
                true
            }
            Expiry::NotDue(_) => false,
            Expiry::Gone => self.registry.is_expired(id),
        }
    }

    /// Remove an object regardless of its deadline. Used for explicit
    /// deletes. Returns `false` if another path got there first.
    pub async fn consume(&self, id: &ObjectId) -> bool {
        match self.registry.remove(id) {
            Some(record) => {
                discard(&self.blobs, record, "deleted").await;
                true
            }
            None => false,
        }
    }

    /// Finish a single-use download: the record leaves the registry now and
    /// the blob is unlinked in the background.
    ///
    /// Callable from synchronous contexts such as `Stream::poll_next`.
    pub fn consume_detached(&self, id: &ObjectId) -> bool {
        match self.registry.remove(id) {
            Some(record) => {
                let blobs = self.blobs.clone();
                tokio::spawn(async move { discard(&blobs, record, "consumed").await });
                true
            }
            None => false,
        }
    }

    /// One reconciliation pass over the registry and the storage root.
    ///
    /// Never stops early: a failed delete is counted, logged, and left for
    /// the next pass.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Utc::now();

        for (id, meta) in self.registry.snapshot() {
            if !meta.is_expired_at(now) {
                continue;
            }
            if let Expiry::Removed(record) = self.registry.expire(&id, now) {
                if discard(&self.blobs, record, "swept").await {
                    report.expired += 1;
                } else {
                    report.failures += 1;
                }
            }
        }

        match self.blobs.list_all().await {
            Ok(mut listing) => loop {
                let entry = match listing.next_blob().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "storage listing failed mid-sweep");
                        report.failures += 1;
                        break;
                    }
                };

                // Reservation first: once it is released the record is
                // already registered.
                if self.blobs.is_reserved(&entry.name) {
                    continue;
                }
                let live = ObjectId::parse(&entry.name)
                    .is_some_and(|id| self.registry.contains(&id));
                if live {
                    continue;
                }

                match self.blobs.delete(&entry.path).await {
                    Ok(true) => {
                        debug!(path = %entry.path.display(), "removed orphan blob");
                        report.orphans += 1;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(path = %entry.path.display(), error = %err, "failed to remove orphan blob");
                        report.failures += 1;
                    }
                }
            },
            Err(err) => {
                warn!(error = %err, "could not list storage root");
                report.failures += 1;
            }
        }

        let cutoff = now
            .checked_sub_signed(self.expired_retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        report.tombstones_pruned = self.registry.prune_tombstones(cutoff);

        report
    }

    /// Run `sweep_once` every `every` until shutdown.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            info!(interval_secs = every.as_secs(), "sweep loop started");
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = manager.sweep_once().await;
                        if report.is_quiet() {
                            debug!(?report, "sweep pass finished");
                        } else if report.failures > 0 {
                            warn!(?report, "sweep pass finished with failures");
                        } else {
                            info!(?report, "sweep pass reclaimed storage");
                        }
                    }
                }
            }
            info!("sweep loop stopped");
        })
    }

    /// Stop the timer wheel and the sweep loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Cancel the record's pending timer and unlink its blob.
/// Returns `false` if the unlink failed; the orphan sweep retries it.
async fn discard(blobs: &BlobStore, mut record: ObjectRecord, reason: &'static str) -> bool {
    if let Some(handle) = record.take_deletion_handle() {
        handle.cancel();
    }
    match blobs.delete(&record.meta.storage_path).await {
        Ok(_) => {
            debug!(id = %record.meta.id, reason, "object removed");
            true
        }
        Err(err) => {
            warn!(
                id = %record.meta.id,
                reason,
                error = %err,
                "failed to unlink blob; the sweep will retry"
            );
            false
        }
    }
}

fn deadline_for(expires_at: DateTime<Utc>) -> Instant {
    let remaining = (expires_at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
        .min(MAX_TTL);
    Instant::now() + remaining
}

async fn run_timer_wheel(
    mut commands: mpsc::UnboundedReceiver<TimerCommand>,
    registry: Arc<MetadataRegistry>,
    blobs: Arc<BlobStore>,
    shutdown: CancellationToken,
) {
    // `recv` yields `None` once every manager and handle is dropped.
    let mut queue: DelayQueue<ObjectId> = DelayQueue::new();
    let mut keys: HashMap<ObjectId, delay_queue::Key> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(TimerCommand::Schedule { id, deadline }) => {
                    let key = queue.insert_at(id.clone(), deadline);
                    if let Some(previous) = keys.insert(id, key) {
                        queue.remove(&previous);
                    }
                }
                Some(TimerCommand::Cancel(id)) => {
                    if let Some(key) = keys.remove(&id) {
                        queue.remove(&key);
                    }
                }
                None => break,
            },
            Some(fired) = queue.next(), if !queue.is_empty() => {
                let id = fired.into_inner();
                keys.remove(&id);
                match registry.expire(&id, Utc::now()) {
                    Expiry::Removed(record) => {
                        let blobs = blobs.clone();
                        tokio::spawn(async move { discard(&blobs, record, "ttl").await });
                    }
                    Expiry::NotDue(expires_at) => {
                        let key = queue.insert_at(id.clone(), deadline_for(expires_at));
                        keys.insert(id, key);
                    }
                    Expiry::Gone => {}
                }
            }
        }
    }
    debug!(pending = keys.len(), "timer wheel stopped");
}
