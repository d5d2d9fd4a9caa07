//! Availability evaluation: how many units of an equipment item are still free
//! over a date window once other events' reservations are counted, and whether
//! a request for N units fits.
//!
//! Evaluation is per resource and stateless. It reads through [`OverlapSource`]
//! and never writes; nothing is held between the check and whatever insert the
//! caller performs afterwards.

use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::{DateWindow, Exclusion, ResourceInfo};
use crate::observability::EVALUATIONS_TOTAL;

/// Storage the evaluator reads reservations and stock from.
#[async_trait]
pub trait OverlapSource: Send + Sync {
    /// Sum of `quantity` over reservations of `resource_id` whose window
    /// overlaps `window`, leaving out whatever `exclude` matches.
    async fn sum_overlapping_quantity(
        &self,
        resource_id: Ulid,
        window: DateWindow,
        exclude: Option<Exclusion>,
    ) -> Result<u64, EngineError>;

    async fn get_resource(&self, resource_id: Ulid) -> Result<Option<ResourceInfo>, EngineError>;
}

/// Why a request was refused, in the terms shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shortfall {
    pub resource_id: Ulid,
    pub requested: u64,
    pub actual_available: u32,
    pub booked: u64,
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Requested: {}, Available: {}",
            self.requested, self.actual_available
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept { booked: u64, actual_available: u32 },
    Reject(Shortfall),
}

impl Decision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Decision::Accept { .. })
    }

    pub fn booked(&self) -> u64 {
        match self {
            Decision::Accept { booked, .. } => *booked,
            Decision::Reject(s) => s.booked,
        }
    }

    pub fn actual_available(&self) -> u32 {
        match self {
            Decision::Accept {
                actual_available, ..
            } => *actual_available,
            Decision::Reject(s) => s.actual_available,
        }
    }
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The overlap sum or resource lookup failed. Never read as "nothing booked".
    #[error(transparent)]
    Collaborator(#[from] EngineError),
}

impl From<EvalError> for EngineError {
    fn from(e: EvalError) -> Self {
        match e {
            EvalError::InvalidInput(msg) => EngineError::InvalidInput(msg),
            EvalError::Collaborator(inner) => inner,
        }
    }
}

/// Stock left once `booked` units are committed elsewhere. Clamped at zero.
pub fn actual_available(current_available: u32, booked: u64) -> u32 {
    // The result never exceeds current_available, so it fits in u32.
    u64::from(current_available).saturating_sub(booked) as u32
}

pub fn decide(resource_id: Ulid, current_available: u32, booked: u64, requested: u64) -> Decision {
    let actual_available = actual_available(current_available, booked);
    if requested <= u64::from(actual_available) {
        Decision::Accept {
            booked,
            actual_available,
        }
    } else {
        Decision::Reject(Shortfall {
            resource_id,
            requested,
            actual_available,
            booked,
        })
    }
}

/// Boundary checks done before any storage round trip.
pub fn validate_request(
    requested: i64,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<(u64, DateWindow), EvalError> {
    if requested <= 0 {
        return Err(EvalError::InvalidInput(format!(
            "requested quantity must be positive, got {requested}"
        )));
    }
    let requested = requested.unsigned_abs();
    let window = DateWindow::try_new(start, end).ok_or_else(|| {
        EvalError::InvalidInput(format!("window start {start} is after end {end}"))
    })?;
    Ok((requested, window))
}

/// Decide whether `requested` units of an already loaded `resource` fit in
/// `[start, end]`.
pub async fn evaluate<S: OverlapSource + ?Sized>(
    source: &S,
    resource: &ResourceInfo,
    requested: i64,
    start: NaiveDate,
    end: NaiveDate,
    exclude: Option<Exclusion>,
) -> Result<Decision, EvalError> {
    let (requested, window) = validate_request(requested, start, end)?;
    evaluate_window(source, resource, requested, window, exclude).await
}

/// Load `resource_id` through the source, then [`evaluate`].
pub async fn check<S: OverlapSource + ?Sized>(
    source: &S,
    resource_id: Ulid,
    requested: i64,
    start: NaiveDate,
    end: NaiveDate,
    exclude: Option<Exclusion>,
) -> Result<Decision, EvalError> {
    check_loaded(source, resource_id, requested, start, end, exclude)
        .await
        .map(|(_, decision)| decision)
}

/// Like [`check`], also returning the resource snapshot the decision was
/// computed from.
pub async fn check_loaded<S: OverlapSource + ?Sized>(
    source: &S,
    resource_id: Ulid,
    requested: i64,
    start: NaiveDate,
    end: NaiveDate,
    exclude: Option<Exclusion>,
) -> Result<(ResourceInfo, Decision), EvalError> {
    let (requested, window) = validate_request(requested, start, end)?;
    let resource = source
        .get_resource(resource_id)
        .await?
        .ok_or(EngineError::NotFound(resource_id))?;
    let decision = evaluate_window(source, &resource, requested, window, exclude).await?;
    Ok((resource, decision))
}

async fn evaluate_window<S: OverlapSource + ?Sized>(
    source: &S,
    resource: &ResourceInfo,
    requested: u64,
    window: DateWindow,
    exclude: Option<Exclusion>,
) -> Result<Decision, EvalError> {
    let booked = match source
        .sum_overlapping_quantity(resource.id, window, exclude)
        .await
    {
        Ok(booked) => booked,
        Err(e) => {
            warn!(resource_id = %resource.id, %window, "overlap sum failed: {e}");
            metrics::counter!(EVALUATIONS_TOTAL, "outcome" => "error").increment(1);
            return Err(e.into());
        }
    };

    let decision = decide(resource.id, resource.current_available, booked, requested);
    debug!(
        resource_id = %resource.id,
        %window,
        requested,
        booked,
        current_available = resource.current_available,
        accepted = decision.is_accept(),
        "evaluated availability"
    );
    let outcome = if decision.is_accept() { "accept" } else { "reject" };
    metrics::counter!(EVALUATIONS_TOTAL, "outcome" => outcome).increment(1);
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EquipmentState, Reservation, TrackType};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    /// Single in-memory resource; counts how often storage was asked.
    struct StateSource {
        state: EquipmentState,
        calls: AtomicUsize,
    }

    impl StateSource {
        fn new(current_available: u32) -> Self {
            Self {
                state: EquipmentState::new(
                    Ulid::new(),
                    None,
                    TrackType::Bulk,
                    current_available,
                    current_available,
                ),
                calls: AtomicUsize::new(0),
            }
        }

        fn reserve(&mut self, start: &str, end: &str, quantity: u32) -> Reservation {
            let r = Reservation {
                id: Ulid::new(),
                event_id: Ulid::new(),
                quantity,
                window: DateWindow::new(d(start), d(end)),
            };
            self.state.insert_reservation(r.clone());
            r
        }

        fn info(&self) -> ResourceInfo {
            self.state.info()
        }
    }

    #[async_trait]
    impl OverlapSource for StateSource {
        async fn sum_overlapping_quantity(
            &self,
            resource_id: Ulid,
            window: DateWindow,
            exclude: Option<Exclusion>,
        ) -> Result<u64, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if resource_id != self.state.id {
                return Ok(0);
            }
            Ok(self.state.booked_quantity(&window, exclude))
        }

        async fn get_resource(
            &self,
            resource_id: Ulid,
        ) -> Result<Option<ResourceInfo>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((resource_id == self.state.id).then(|| self.state.info()))
        }
    }

    struct FailingSource;

    #[async_trait]
    impl OverlapSource for FailingSource {
        async fn sum_overlapping_quantity(
            &self,
            _resource_id: Ulid,
            _window: DateWindow,
            _exclude: Option<Exclusion>,
        ) -> Result<u64, EngineError> {
            Err(EngineError::Unavailable("connection reset".into()))
        }

        async fn get_resource(
            &self,
            _resource_id: Ulid,
        ) -> Result<Option<ResourceInfo>, EngineError> {
            Err(EngineError::Unavailable("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn overlap_rejects_with_remaining_quantity() {
        let mut src = StateSource::new(10);
        src.reserve("2024-06-01", "2024-06-03", 6);

        let decision = evaluate(&src, &src.info(), 5, d("2024-06-02"), d("2024-06-04"), None)
            .await
            .unwrap();
        match decision {
            Decision::Reject(s) => {
                assert_eq!(s.booked, 6);
                assert_eq!(s.actual_available, 4);
                assert_eq!(s.requested, 5);
                assert_eq!(s.to_string(), "Requested: 5, Available: 4");
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disjoint_window_accepts() {
        let mut src = StateSource::new(10);
        src.reserve("2024-06-01", "2024-06-03", 6);

        let decision = evaluate(&src, &src.info(), 5, d("2024-06-04"), d("2024-06-05"), None)
            .await
            .unwrap();
        assert_eq!(
            decision,
            Decision::Accept {
                booked: 0,
                actual_available: 10
            }
        );
    }

    #[tokio::test]
    async fn editing_own_reservation_excludes_it() {
        let mut src = StateSource::new(10);
        let own = src.reserve("2024-06-01", "2024-06-03", 6);

        let by_reservation = evaluate(
            &src,
            &src.info(),
            8,
            d("2024-06-01"),
            d("2024-06-03"),
            Some(Exclusion::Reservation(own.id)),
        )
        .await
        .unwrap();
        assert!(by_reservation.is_accept());
        assert_eq!(by_reservation.booked(), 0);

        let by_event = evaluate(
            &src,
            &src.info(),
            8,
            d("2024-06-01"),
            d("2024-06-03"),
            Some(Exclusion::Event(own.event_id)),
        )
        .await
        .unwrap();
        assert!(by_event.is_accept());
    }

    #[tokio::test]
    async fn zero_quantity_is_invalid_before_querying() {
        let src = StateSource::new(3);
        let err = evaluate(&src, &src.info(), 0, d("2024-06-01"), d("2024-06-01"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::InvalidInput(_)));
        assert_eq!(src.calls.load(Ordering::SeqCst), 0);

        let err = evaluate(&src, &src.info(), -2, d("2024-06-01"), d("2024-06-01"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn reversed_window_is_invalid() {
        let src = StateSource::new(3);
        let err = check(&src, src.state.id, 1, d("2024-06-05"), d("2024-06-01"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::InvalidInput(_)));
        assert_eq!(src.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn single_day_window_counts_touching_reservation() {
        let mut src = StateSource::new(2);
        src.reserve("2024-06-01", "2024-06-03", 2);

        let decision = evaluate(&src, &src.info(), 1, d("2024-06-03"), d("2024-06-03"), None)
            .await
            .unwrap();
        assert_eq!(decision.actual_available(), 0);
        assert!(!decision.is_accept());
    }

    #[tokio::test]
    async fn collaborator_failure_fails_closed() {
        let resource = EquipmentState::new(Ulid::new(), None, TrackType::Bulk, 5, 5).info();
        let err = evaluate(&FailingSource, &resource, 1, d("2024-06-01"), d("2024-06-02"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EvalError::Collaborator(EngineError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn check_unknown_resource_is_not_found() {
        let src = StateSource::new(5);
        let missing = Ulid::new();
        let err = check(&src, missing, 1, d("2024-06-01"), d("2024-06-01"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EvalError::Collaborator(EngineError::NotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn check_loads_current_stock() {
        let mut src = StateSource::new(10);
        src.state.current_available = 3; // two units out for repair
        let decision = check(&src, src.state.id, 4, d("2024-06-01"), d("2024-06-01"), None)
            .await
            .unwrap();
        assert_eq!(decision.actual_available(), 3);
        assert!(!decision.is_accept());
    }

    #[tokio::test]
    async fn huge_request_is_rejected_not_invalid() {
        let src = StateSource::new(10);
        let requested = i64::from(u32::MAX) + 1;
        let decision = evaluate(&src, &src.info(), requested, d("2024-06-01"), d("2024-06-01"), None)
            .await
            .unwrap();
        match decision {
            Decision::Reject(s) => {
                assert_eq!(s.requested, u64::from(u32::MAX) + 1);
                assert_eq!(s.actual_available, 10);
                assert_eq!(s.to_string(), "Requested: 4294967296, Available: 10");
            }
            other => panic!("expected reject, got {other:?}"),
        }

        let decision = evaluate(&src, &src.info(), i64::MAX, d("2024-06-01"), d("2024-06-01"), None)
            .await
            .unwrap();
        assert!(!decision.is_accept());
    }

    #[tokio::test]
    async fn check_loaded_returns_the_stock_it_decided_on() {
        let mut src = StateSource::new(10);
        src.state.current_available = 7;
        src.reserve("2024-06-01", "2024-06-02", 3);

        let (resource, decision) =
            check_loaded(&src, src.state.id, 4, d("2024-06-02"), d("2024-06-02"), None)
                .await
                .unwrap();
        assert_eq!(resource.current_available, 7);
        assert_eq!(decision.actual_available(), 4);
        assert!(decision.is_accept());
        // One stock read and one overlap sum.
        assert_eq!(src.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn eval_error_converts_to_engine_error() {
        let e: EngineError = EvalError::InvalidInput("bad".into()).into();
        assert!(matches!(e, EngineError::InvalidInput(_)));
        let e: EngineError = EvalError::Collaborator(EngineError::NotFound(Ulid::nil())).into();
        assert!(matches!(e, EngineError::NotFound(_)));
    }

    fn date_strategy() -> impl Strategy<Value = NaiveDate> {
        (0i64..400).prop_map(|offset| {
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Days::new(offset as u64)
        })
    }

    fn window_strategy() -> impl Strategy<Value = DateWindow> {
        (date_strategy(), 0u64..30)
            .prop_map(|(start, len)| DateWindow::new(start, start + chrono::Days::new(len)))
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        #[test]
        fn oversubscribed_stock_clamps_to_zero(current in 0u32..1000, extra in 0u64..10_000) {
            let booked = u64::from(current) + extra;
            prop_assert_eq!(actual_available(current, booked), 0);
        }

        #[test]
        fn accept_iff_request_fits(current in 0u32..1000, booked in 0u64..2000, requested in 1u64..2000) {
            let decision = decide(Ulid::nil(), current, booked, requested);
            let available = actual_available(current, booked);
            prop_assert_eq!(decision.is_accept(), requested <= u64::from(available));
            prop_assert_eq!(decision.actual_available(), available);
        }

        #[test]
        fn overlap_is_symmetric(a in window_strategy(), b in window_strategy()) {
            prop_assert_eq!(a.overlaps(&b), b.overlaps(&a));
            prop_assert_eq!(a.overlaps(&b), a.start <= b.end && b.start <= a.end);
        }

        #[test]
        fn non_overlapping_reservations_never_count(
            existing in prop::collection::vec((window_strategy(), 1u32..20), 0..12),
            query in window_strategy(),
        ) {
            let mut state = EquipmentState::new(Ulid::new(), None, TrackType::Bulk, 100, 100);
            let mut expected = 0u64;
            for (window, quantity) in existing {
                if window.overlaps(&query) {
                    expected += u64::from(quantity);
                }
                state.insert_reservation(Reservation {
                    id: Ulid::new(),
                    event_id: Ulid::new(),
                    quantity,
                    window,
                });
            }
            prop_assert_eq!(state.booked_quantity(&query, None), expected);
        }

        #[test]
        fn repeated_evaluation_is_idempotent(
            existing in prop::collection::vec((window_strategy(), 1u32..5), 0..8),
            query in window_strategy(),
            requested in 1i64..30,
        ) {
            let mut src = StateSource::new(20);
            for (window, quantity) in existing {
                src.state.insert_reservation(Reservation {
                    id: Ulid::new(),
                    event_id: Ulid::new(),
                    quantity,
                    window,
                });
            }
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let info = src.info();
            let first = rt
                .block_on(evaluate(&src, &info, requested, query.start, query.end, None))
                .unwrap();
            let second = rt
                .block_on(evaluate(&src, &info, requested, query.start, query.end, None))
                .unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
