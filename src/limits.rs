use chrono::NaiveDate;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 50_000;
pub const MAX_NAME_LEN: usize = 512;

/// Stock counts and requested quantities.
pub const MAX_QUANTITY: u32 = 1_000_000;

/// Lines accepted in one packing-list save.
pub const MAX_PACKING_LINES: usize = 500;
/// Rows accepted in one raw reservation INSERT.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Longest booking window, in days (about ten years).
pub const MAX_WINDOW_DAYS: i64 = 3660;

pub fn min_valid_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN)
}

pub fn max_valid_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(9999, 12, 31).unwrap_or(NaiveDate::MAX)
}
