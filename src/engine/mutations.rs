use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::validate::{validate_name, validate_quantity, validate_stock, validate_window};
use super::{apply_to_resource, Engine, EngineError, WalCommand};

/// Partial update of an equipment item. `None` leaves a field unchanged;
/// `name: Some(None)` clears the name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EquipmentPatch {
    pub name: Option<Option<String>>,
    pub track_type: Option<TrackType>,
    pub total_quantity: Option<u32>,
    pub current_available: Option<u32>,
}

/// One row of a raw reservation insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub id: Ulid,
    pub event_id: Ulid,
    pub resource_id: Ulid,
    pub quantity: i64,
    pub window: DateWindow,
}

impl Engine {
    pub async fn create_resource(
        &self,
        id: Ulid,
        name: Option<String>,
        track_type: TrackType,
        total_quantity: u32,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many equipment items"));
        }
        validate_name(name.as_deref())?;
        validate_stock(total_quantity)?;
        let _gate = self.gate.read().await;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        // Serialized items are always a stock of one.
        let total_quantity = if track_type == TrackType::Unique {
            1
        } else {
            total_quantity
        };

        let change = Change::ResourceCreated {
            id,
            name: name.clone(),
            track_type,
            total_quantity,
            current_available: total_quantity,
        };
        self.wal_append(&change).await?;
        let rs = EquipmentState::new(id, name, track_type, total_quantity, total_quantity);
        self.state.insert(id, Arc::new(RwLock::new(rs)));
        tracing::debug!(%id, total_quantity, "equipment created");
        Ok(())
    }

    pub async fn update_resource(&self, id: Ulid, patch: EquipmentPatch) -> Result<(), EngineError> {
        if let Some(name) = &patch.name {
            validate_name(name.as_deref())?;
        }
        let _gate = self.gate.read().await;
        let rs = self.resource_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;

        let track_type = patch.track_type.unwrap_or(guard.track_type);
        let total_quantity = if track_type == TrackType::Unique {
            1
        } else {
            patch.total_quantity.unwrap_or(guard.total_quantity)
        };
        validate_stock(total_quantity)?;

        let current_available = match patch.current_available {
            Some(c) if c > total_quantity => {
                return Err(EngineError::InvalidInput(format!(
                    "current_available {c} exceeds total_quantity {total_quantity}"
                )));
            }
            Some(c) => c,
            // Shrinking the stock takes units out of service first.
            None => guard.current_available.min(total_quantity),
        };
        let name = match patch.name {
            Some(name) => name,
            None => guard.name.clone(),
        };

        let change = Change::ResourceUpdated {
            id,
            name,
            track_type,
            total_quantity,
            current_available,
        };
        self.persist_and_apply(&mut guard, &change).await
    }

    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        let rs = self.resource_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.write().await;
        if !guard.reservations.is_empty() {
            return Err(EngineError::HasReservations(id));
        }

        let change = Change::ResourceDeleted { id };
        self.wal_append(&change).await?;
        self.state.remove(&id);
        drop(guard);
        tracing::debug!(%id, "equipment deleted");
        Ok(())
    }

    /// Unchecked insert: the row is written whatever the remaining stock.
    /// Availability checks belong to the caller (see `save_packing_list`).
    pub async fn insert_reservation(&self, row: NewReservation) -> Result<(), EngineError> {
        let quantity = validate_quantity(row.quantity)?;
        validate_window(&row.window)?;
        if self.index.resource_for(&row.id).is_some() {
            return Err(EngineError::AlreadyExists(row.id));
        }
        let _gate = self.gate.read().await;
        let rs = self
            .resource_state(&row.resource_id)
            .ok_or(EngineError::NotFound(row.resource_id))?;
        let mut guard = rs.write().await;
        // The resource may have been deleted while we waited for the lock.
        if !self.state.contains_key(&row.resource_id) {
            return Err(EngineError::NotFound(row.resource_id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on equipment"));
        }

        let change = Change::ReservationInserted {
            id: row.id,
            event_id: row.event_id,
            resource_id: row.resource_id,
            quantity,
            window: row.window,
        };
        self.persist_and_apply(&mut guard, &change).await
    }

    /// Multi-row raw insert. Every row is validated before the first write.
    pub async fn insert_reservations(&self, rows: Vec<NewReservation>) -> Result<usize, EngineError> {
        if rows.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let count = rows.len();
        self.commit_reservations(None, rows).await?;
        Ok(count)
    }

    /// Remove `clear_event`'s reservations (if given) and insert `rows`, as a
    /// single WAL record under the write locks of every equipment item
    /// touched. Either the whole set lands or nothing changes. Returns how
    /// many reservations were removed.
    pub(super) async fn commit_reservations(
        &self,
        clear_event: Option<Ulid>,
        rows: Vec<NewReservation>,
    ) -> Result<usize, EngineError> {
        let mut inserts = Vec::with_capacity(rows.len());
        let mut seen = HashSet::with_capacity(rows.len());
        for row in rows {
            let quantity = validate_quantity(row.quantity)?;
            validate_window(&row.window)?;
            if !seen.insert(row.id) || self.index.resource_for(&row.id).is_some() {
                return Err(EngineError::AlreadyExists(row.id));
            }
            inserts.push(Change::ReservationInserted {
                id: row.id,
                event_id: row.event_id,
                resource_id: row.resource_id,
                quantity,
                window: row.window,
            });
        }

        let _gate = self.gate.read().await;
        let old = clear_event
            .map(|event_id| self.index.event_reservations(&event_id))
            .unwrap_or_default();

        // Lock in id order so two batches never wait on each other.
        let mut ids: Vec<Ulid> = old
            .iter()
            .map(|(_, resource_id)| *resource_id)
            .chain(inserts.iter().filter_map(change_target))
            .collect();
        ids.sort();
        ids.dedup();
        let mut locked: Vec<(Ulid, OwnedRwLockWriteGuard<EquipmentState>)> =
            Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(rs) = self.resource_state(&id) {
                locked.push((id, rs.write_owned().await));
            }
        }
        // Anything deleted while we waited for its lock is gone from `state`.
        locked.retain(|(id, _)| self.state.contains_key(id));

        let mut changes = Vec::with_capacity(old.len() + inserts.len());
        for (id, resource_id) in old {
            let Ok(i) = locked.binary_search_by_key(&resource_id, |(rid, _)| *rid) else {
                continue;
            };
            if locked[i].1.reservations.iter().any(|r| r.id == id) {
                changes.push(Change::ReservationRemoved { id, resource_id });
            }
        }
        let removed = changes.len();

        let mut net: HashMap<Ulid, isize> = HashMap::new();
        for change in &changes {
            if let Some(resource_id) = change_target(change) {
                *net.entry(resource_id).or_default() -= 1;
            }
        }
        for change in &inserts {
            let Some(resource_id) = change_target(change) else {
                continue;
            };
            let Ok(i) = locked.binary_search_by_key(&resource_id, |(rid, _)| *rid) else {
                return Err(EngineError::NotFound(resource_id));
            };
            let entry = net.entry(resource_id).or_default();
            *entry += 1;
            let after = locked[i].1.reservations.len() as isize + *entry;
            if after > MAX_RESERVATIONS_PER_RESOURCE as isize {
                return Err(EngineError::LimitExceeded("too many reservations on equipment"));
            }
        }
        changes.extend(inserts);
        if changes.is_empty() {
            return Ok(0);
        }

        self.wal_append(&Change::Batch(changes.clone())).await?;
        for change in &changes {
            let Some(resource_id) = change_target(change) else {
                continue;
            };
            if let Ok(i) = locked.binary_search_by_key(&resource_id, |(rid, _)| *rid) {
                apply_to_resource(&mut locked[i].1, change, &self.index);
            }
        }
        Ok(removed)
    }

    /// Remove one reservation; returns the equipment it belonged to.
    pub async fn delete_reservation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.gate.read().await;
        let resource_id = self
            .resource_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .resource_state(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut guard = rs.write().await;
        let change = Change::ReservationRemoved { id, resource_id };
        self.persist_and_apply(&mut guard, &change).await?;
        Ok(resource_id)
    }

    /// Clear an event's packing list. Returns how many reservations went away.
    pub async fn delete_reservations_for_event(&self, event_id: Ulid) -> Result<usize, EngineError> {
        let removed = self.commit_reservations(Some(event_id), Vec::new()).await?;
        tracing::debug!(%event_id, removed, "cleared event reservations");
        Ok(removed)
    }

    /// Compact the WAL by rewriting it with only the changes needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Blocks every mutation until the compacted file is swapped in, so no
        // change lands in the old file after the snapshot was taken.
        let _gate = self.gate.write().await;
        let mut changes = Vec::new();

        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for rs in resources {
            let guard = rs.read().await;
            changes.push(Change::ResourceCreated {
                id: guard.id,
                name: guard.name.clone(),
                track_type: guard.track_type,
                total_quantity: guard.total_quantity,
                current_available: guard.current_available,
            });
            for r in &guard.reservations {
                changes.push(Change::ReservationInserted {
                    id: r.id,
                    event_id: r.event_id,
                    resource_id: guard.id,
                    quantity: r.quantity,
                    window: r.window,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                changes,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Equipment a reservation insert or removal applies to.
fn change_target(change: &Change) -> Option<Ulid> {
    match change {
        Change::ReservationInserted { resource_id, .. }
        | Change::ReservationRemoved { resource_id, .. } => Some(*resource_id),
        _ => None,
    }
}
