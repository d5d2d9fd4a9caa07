use async_trait::async_trait;
use ulid::Ulid;

use crate::evaluator::OverlapSource;
use crate::model::*;

use super::validate::validate_window;
use super::{Engine, EngineError};

impl Engine {
    /// Units of `resource_id` committed to reservations overlapping `window`.
    /// Unknown equipment has nothing booked.
    pub async fn booked_quantity(
        &self,
        resource_id: Ulid,
        window: DateWindow,
        exclude: Option<Exclusion>,
    ) -> Result<u64, EngineError> {
        validate_window(&window)?;
        let Some(rs) = self.resource_state(&resource_id) else {
            return Ok(0);
        };
        let guard = rs.read().await;
        Ok(guard.booked_quantity(&window, exclude))
    }

    pub async fn resource_info(&self, id: Ulid) -> Option<ResourceInfo> {
        let rs = self.resource_state(&id)?;
        let guard = rs.read().await;
        Some(guard.info())
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(resources.len());
        for rs in resources {
            out.push(rs.read().await.info());
        }
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn get_reservations(&self, resource_id: Ulid) -> Vec<ReservationInfo> {
        let Some(rs) = self.resource_state(&resource_id) else {
            return vec![];
        };
        let guard = rs.read().await;
        guard
            .reservations
            .iter()
            .map(|r| ReservationInfo {
                id: r.id,
                event_id: r.event_id,
                resource_id,
                quantity: r.quantity,
                start: r.window.start,
                end: r.window.end,
            })
            .collect()
    }

    /// An event's packing list, ordered by equipment id.
    pub async fn get_event_reservations(&self, event_id: Ulid) -> Vec<ReservationInfo> {
        let mut rows = self.index.event_reservations(&event_id);
        rows.sort_by_key(|(_, resource_id)| *resource_id);

        let mut out = Vec::with_capacity(rows.len());
        for (id, resource_id) in rows {
            let Some(rs) = self.resource_state(&resource_id) else {
                continue;
            };
            let guard = rs.read().await;
            if let Some(r) = guard.reservations.iter().find(|r| r.id == id) {
                out.push(ReservationInfo {
                    id: r.id,
                    event_id: r.event_id,
                    resource_id,
                    quantity: r.quantity,
                    start: r.window.start,
                    end: r.window.end,
                });
            }
        }
        out
    }
}

#[async_trait]
impl OverlapSource for Engine {
    async fn sum_overlapping_quantity(
        &self,
        resource_id: Ulid,
        window: DateWindow,
        exclude: Option<Exclusion>,
    ) -> Result<u64, EngineError> {
        self.booked_quantity(resource_id, window, exclude).await
    }

    async fn get_resource(&self, resource_id: Ulid) -> Result<Option<ResourceInfo>, EngineError> {
        Ok(self.resource_info(resource_id).await)
    }
}
