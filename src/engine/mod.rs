mod error;
mod mutations;
mod packing;
mod queries;
mod validate;

pub use error::EngineError;
pub use mutations::{EquipmentPatch, NewReservation};
pub use packing::PackingLine;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedEquipmentState = Arc<RwLock<EquipmentState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        change: Change,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        changes: Vec<Change>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { change, response } => {
                let mut batch = vec![(change, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { change, response }) => {
                            batch.push((change, response));
                        }
                        Ok(other) => {
                            // Flush what we have before running the non-append command.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Change, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[(Change, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (change, _) in batch {
        if let Err(e) = wal.append_buffered(change) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even after an append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Change, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { changes, response } => {
            let result = Wal::write_compact_file(wal.path(), &changes)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { change, response } => {
            let mut batch = vec![(change, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Reverse lookups for reservations, kept in step with the per-resource lists.
#[derive(Default)]
pub(super) struct ReservationIndex {
    /// reservation id → (resource id, event id)
    by_reservation: DashMap<Ulid, (Ulid, Ulid)>,
    /// event id → reservation ids
    by_event: DashMap<Ulid, Vec<Ulid>>,
}

impl ReservationIndex {
    fn map(&self, id: Ulid, resource_id: Ulid, event_id: Ulid) {
        self.by_reservation.insert(id, (resource_id, event_id));
        self.by_event.entry(event_id).or_default().push(id);
    }

    fn unmap(&self, id: &Ulid) {
        let Some((_, (_, event_id))) = self.by_reservation.remove(id) else {
            return;
        };
        if let Some(mut ids) = self.by_event.get_mut(&event_id) {
            ids.retain(|r| r != id);
        }
        self.by_event.remove_if(&event_id, |_, ids| ids.is_empty());
    }

    pub(super) fn resource_for(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.by_reservation.get(reservation_id).map(|e| e.value().0)
    }

    /// `(reservation id, resource id)` pairs belonging to an event.
    pub(super) fn event_reservations(&self, event_id: &Ulid) -> Vec<(Ulid, Ulid)> {
        let ids = self
            .by_event
            .get(event_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.resource_for(&id).map(|rid| (id, rid)))
            .collect()
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedEquipmentState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) index: ReservationIndex,
    /// Mutations hold it shared, WAL compaction exclusively.
    pub(super) gate: RwLock<()>,
}

/// Apply a change directly to an EquipmentState (no locking, caller holds the lock).
fn apply_to_resource(rs: &mut EquipmentState, change: &Change, index: &ReservationIndex) {
    match change {
        Change::ReservationInserted {
            id,
            event_id,
            resource_id,
            quantity,
            window,
        } => {
            rs.insert_reservation(Reservation {
                id: *id,
                event_id: *event_id,
                quantity: *quantity,
                window: *window,
            });
            index.map(*id, *resource_id, *event_id);
        }
        Change::ReservationRemoved { id, .. } => {
            rs.remove_reservation(*id);
            index.unmap(id);
        }
        Change::ResourceUpdated {
            name,
            track_type,
            total_quantity,
            current_available,
            ..
        } => {
            rs.name = name.clone();
            rs.track_type = *track_type;
            rs.total_quantity = *total_quantity;
            rs.current_available = *current_available;
        }
        // ResourceCreated/Deleted are handled at the DashMap level, and a
        // Batch is split into its parts by the caller.
        Change::ResourceCreated { .. } | Change::ResourceDeleted { .. } | Change::Batch(_) => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let changes = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            index: ReservationIndex::default(),
            gate: RwLock::new(()),
        };

        // Replay: we're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never use blocking_write here because this may
        // run inside an async context (lazy tenant creation).
        for change in &changes {
            engine.replay_change(change)?;
        }

        tracing::debug!(
            changes = changes.len(),
            resources = engine.state.len(),
            "replayed WAL"
        );
        Ok(engine)
    }

    fn replay_change(&self, change: &Change) -> io::Result<()> {
        match change {
            Change::ResourceCreated {
                id,
                name,
                track_type,
                total_quantity,
                current_available,
            } => {
                let rs = EquipmentState::new(
                    *id,
                    name.clone(),
                    *track_type,
                    *total_quantity,
                    *current_available,
                );
                self.state.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Change::ResourceDeleted { id } => {
                self.state.remove(id);
            }
            Change::Batch(changes) => {
                for change in changes {
                    self.replay_change(change)?;
                }
            }
            other => {
                if let Some(resource_id) = change_resource_id(other)
                    && let Some(entry) = self.state.get(&resource_id)
                {
                    let rs_arc = entry.clone();
                    drop(entry);
                    let Ok(mut guard) = rs_arc.try_write() else {
                        return Err(io::Error::other("replay: resource state contended"));
                    };
                    apply_to_resource(&mut guard, other, &self.index);
                }
            }
        }
        Ok(())
    }

    /// Write a change to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, change: &Change) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                change: change.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn resource_state(&self, id: &Ulid) -> Option<SharedEquipmentState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn resource_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.index.resource_for(reservation_id)
    }

    /// WAL-append then apply, under the caller's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut EquipmentState,
        change: &Change,
    ) -> Result<(), EngineError> {
        self.wal_append(change).await?;
        apply_to_resource(rs, change, &self.index);
        Ok(())
    }
}

/// The resource a non-Create/Delete change applies to.
fn change_resource_id(change: &Change) -> Option<Ulid> {
    match change {
        Change::ReservationInserted { resource_id, .. }
        | Change::ReservationRemoved { resource_id, .. } => Some(*resource_id),
        Change::ResourceUpdated { id, .. } => Some(*id),
        Change::ResourceCreated { .. } | Change::ResourceDeleted { .. } | Change::Batch(_) => None,
    }
}
