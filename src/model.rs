use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Closed interval `[start, end]` of whole days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "DateWindow start must not be after end");
        Self { start, end }
    }

    /// `None` when `start > end`.
    pub fn try_new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Number of calendar days covered; a single-day window counts 1.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Closed intervals share at least one day.
    pub fn overlaps(&self, other: &DateWindow) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// How an equipment item is tracked in inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackType {
    /// Serialized single item; stock is always exactly 1.
    Unique,
    Bulk,
    Kit,
}

impl TrackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackType::Unique => "unique",
            TrackType::Bulk => "bulk",
            TrackType::Kit => "kit",
        }
    }
}

impl FromStr for TrackType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unique" => Ok(TrackType::Unique),
            "bulk" => Ok(TrackType::Bulk),
            "kit" => Ok(TrackType::Kit),
            other => Err(format!("unknown track type: {other}")),
        }
    }
}

/// Reservation to leave out of an overlap sum (edit-in-place).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    Reservation(Ulid),
    /// Every reservation belonging to this event.
    Event(Ulid),
}

impl Exclusion {
    pub fn matches(&self, reservation: &Reservation) -> bool {
        match self {
            Exclusion::Reservation(id) => reservation.id == *id,
            Exclusion::Event(event_id) => reservation.event_id == *event_id,
        }
    }
}

/// N units of one equipment item committed to an event's date window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub event_id: Ulid,
    pub quantity: u32,
    pub window: DateWindow,
}

#[derive(Debug, Clone)]
pub struct EquipmentState {
    pub id: Ulid,
    pub name: Option<String>,
    pub track_type: TrackType,
    /// Fixed stock count.
    pub total_quantity: u32,
    /// Stock in service. Lowered by maintenance or loss, never by bookings.
    pub current_available: u32,
    /// Sorted by `window.start`.
    pub reservations: Vec<Reservation>,
}

impl EquipmentState {
    pub fn new(
        id: Ulid,
        name: Option<String>,
        track_type: TrackType,
        total_quantity: u32,
        current_available: u32,
    ) -> Self {
        Self {
            id,
            name,
            track_type,
            total_quantity,
            current_available,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by window.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.window.start <= reservation.window.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    /// Reservations whose window shares at least one day with `query`.
    /// Everything at index >= right_bound starts after `query.end`.
    pub fn overlapping(&self, query: &DateWindow) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.window.start <= query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.window.end >= query.start)
    }

    /// Sum of reserved quantities overlapping `query`, minus the excluded ones.
    pub fn booked_quantity(&self, query: &DateWindow, exclude: Option<Exclusion>) -> u64 {
        self.overlapping(query)
            .filter(|r| !exclude.is_some_and(|x| x.matches(r)))
            .map(|r| u64::from(r.quantity))
            .sum()
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            name: self.name.clone(),
            track_type: self.track_type,
            total_quantity: self.total_quantity,
            current_available: self.current_available,
        }
    }
}

/// WAL record format. Flat, one variant per mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    ResourceCreated {
        id: Ulid,
        name: Option<String>,
        track_type: TrackType,
        total_quantity: u32,
        current_available: u32,
    },
    ResourceUpdated {
        id: Ulid,
        name: Option<String>,
        track_type: TrackType,
        total_quantity: u32,
        current_available: u32,
    },
    ResourceDeleted {
        id: Ulid,
    },
    ReservationInserted {
        id: Ulid,
        event_id: Ulid,
        resource_id: Ulid,
        quantity: u32,
        window: DateWindow,
    },
    ReservationRemoved {
        id: Ulid,
        resource_id: Ulid,
    },
    /// Reservation inserts and removals written as one record, so replay
    /// sees all of them or none.
    Batch(Vec<Change>),
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub track_type: TrackType,
    pub total_quantity: u32,
    pub current_available: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub id: Ulid,
    pub event_id: Ulid,
    pub resource_id: Ulid,
    pub quantity: u32,
    pub start: NaiveDate,
    pub end: NaiveDate,
}
