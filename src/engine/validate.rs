use crate::limits::*;
use crate::model::DateWindow;

use super::EngineError;

pub(crate) fn validate_window(window: &DateWindow) -> Result<(), EngineError> {
    if window.start > window.end {
        return Err(EngineError::InvalidInput(format!(
            "window start {} is after end {}",
            window.start, window.end
        )));
    }
    if window.start < min_valid_date() || window.end > max_valid_date() {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    if window.days() > MAX_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("window too wide"));
    }
    Ok(())
}

/// Quantities arrive as i64 from the SQL layer; anything non-positive is a caller error.
pub(crate) fn validate_quantity(quantity: i64) -> Result<u32, EngineError> {
    if quantity <= 0 {
        return Err(EngineError::InvalidInput(format!(
            "quantity must be positive, got {quantity}"
        )));
    }
    match u32::try_from(quantity) {
        Ok(q) if q <= MAX_QUANTITY => Ok(q),
        _ => Err(EngineError::LimitExceeded("quantity too large")),
    }
}

pub(crate) fn validate_name(name: Option<&str>) -> Result<(), EngineError> {
    if name.is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("equipment name too long"));
    }
    Ok(())
}

/// Stock counts may be zero (everything retired), never above MAX_QUANTITY.
pub(crate) fn validate_stock(value: u32) -> Result<(), EngineError> {
    if value > MAX_QUANTITY {
        return Err(EngineError::LimitExceeded("stock count too large"));
    }
    Ok(())
}
