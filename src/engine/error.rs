use thiserror::Error;
use ulid::Ulid;

use crate::evaluator::Shortfall;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A packing-list line did not fit the remaining stock.
    #[error("insufficient availability for {}: {}", .0.resource_id, .0)]
    Insufficient(Shortfall),
    #[error("cannot delete equipment {0}: reservations still reference it")]
    HasReservations(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    /// Storage could not answer; callers must treat the booking as rejected.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("WAL error: {0}")]
    WalError(String),
}
