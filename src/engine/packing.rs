//! Event packing lists: the create/update flow that checks every equipment
//! line and then rewrites the event's reservations.
//!
//! Lines are checked one after another against what is already stored, with
//! the event's own previous reservations left out of the sums. Nothing is held
//! between the checks and the writes, and lines naming the same equipment are
//! not summed against each other, so two concurrent saves (or duplicate lines
//! in one save) can still overshoot the stock. The write itself is one WAL
//! record: the event ends up with its old list or its new one, never a mix.

use chrono::NaiveDate;
use tracing::{debug, info};
use ulid::Ulid;

use crate::evaluator::{self, Decision};
use crate::limits::MAX_PACKING_LINES;
use crate::model::{DateWindow, Exclusion};

use super::mutations::NewReservation;
use super::validate::{validate_quantity, validate_window};
use super::{Engine, EngineError};

/// One equipment line of an event's packing list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackingLine {
    pub resource_id: Ulid,
    pub quantity: i64,
}

impl Engine {
    /// Check every line, then replace the event's reservations with one per
    /// line. The first line that does not fit aborts the save before anything
    /// is written. Returns the new reservation ids, in line order.
    pub async fn save_packing_list(
        &self,
        event_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        lines: &[PackingLine],
    ) -> Result<Vec<Ulid>, EngineError> {
        if lines.len() > MAX_PACKING_LINES {
            return Err(EngineError::LimitExceeded("too many packing-list lines"));
        }
        let window = DateWindow::try_new(start, end).ok_or_else(|| {
            EngineError::InvalidInput(format!("window start {start} is after end {end}"))
        })?;
        validate_window(&window)?;
        for line in lines {
            validate_quantity(line.quantity)?;
        }

        let exclude = Some(Exclusion::Event(event_id));
        for line in lines {
            let decision =
                evaluator::check(self, line.resource_id, line.quantity, start, end, exclude)
                    .await?;
            if let Decision::Reject(shortfall) = decision {
                info!(
                    %event_id,
                    resource_id = %line.resource_id,
                    requested = shortfall.requested,
                    available = shortfall.actual_available,
                    "packing list rejected"
                );
                metrics::counter!(crate::observability::PACKING_LIST_REJECTIONS_TOTAL).increment(1);
                return Err(EngineError::Insufficient(shortfall));
            }
        }

        let rows: Vec<NewReservation> = lines
            .iter()
            .map(|line| NewReservation {
                id: Ulid::new(),
                event_id,
                resource_id: line.resource_id,
                quantity: line.quantity,
                window,
            })
            .collect();
        let ids = rows.iter().map(|row| row.id).collect::<Vec<_>>();
        // The old list is swapped for the new one in a single write.
        let cleared = self.commit_reservations(Some(event_id), rows).await?;
        debug!(%event_id, %window, cleared, lines = ids.len(), "packing list saved");
        Ok(ids)
    }
}
