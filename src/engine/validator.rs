use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// A not-yet-persisted reservation window submitted for validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub equipment_id: Ulid,
    pub start: Ms,
    pub end: Ms,
}

/// Why a candidate reservation was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// `start >= end`.
    InvalidTimeRange,
    /// Overlaps an existing reservation on the same equipment.
    TimeConflict,
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::InvalidTimeRange => "INVALID_TIME_RANGE",
            Rejection::TimeConflict => "TIME_CONFLICT",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Rejection::InvalidTimeRange => "end time must be after start time",
            Rejection::TimeConflict => "this time slot is already reserved",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for Rejection {}

/// Decide whether `candidate` may be admitted on `equipment`.
///
/// 1. `start >= end` is rejected with [`Rejection::InvalidTimeRange`].
/// 2. Any reservation on the equipment overlapping `[start, end)` is a
///    [`Rejection::TimeConflict`], except the one whose id is `exclude_id`
///    (an edit of an existing reservation never conflicts with itself).
///
/// Pure: reads `equipment`, never mutates it. Does not look at
/// `is_available`; unavailable equipment can still be booked.
///
/// Returns the validated span on success.
pub fn validate(
    equipment: &EquipmentState,
    candidate: &Candidate,
    exclude_id: Option<Ulid>,
) -> Result<Span, Rejection> {
    debug_assert_eq!(equipment.id, candidate.equipment_id);
    if candidate.start >= candidate.end {
        return Err(Rejection::InvalidTimeRange);
    }
    let span = Span::new(candidate.start, candidate.end);
    let conflict = equipment
        .overlapping(&span)
        .any(|existing| Some(existing.id) != exclude_id);
    if conflict {
        return Err(Rejection::TimeConflict);
    }
    Ok(span)
}

/// Range and duration limits, checked once the validator has accepted a span.
pub(crate) fn check_span_limits(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(())
}

/// Field checks shared by create and update.
pub(crate) fn check_reservation_fields(
    test_name: &str,
    temperature: f64,
    additional_equipment: &[Ulid],
) -> Result<(), EngineError> {
    if test_name.trim().is_empty() {
        return Err(EngineError::InvalidField("test_name must not be empty"));
    }
    if test_name.chars().count() > MAX_TEST_NAME_LEN {
        return Err(EngineError::LimitExceeded("test_name too long"));
    }
    if !temperature.is_finite() {
        return Err(EngineError::InvalidField("temperature must be a finite number"));
    }
    if additional_equipment.len() > MAX_ADDITIONAL_PER_RESERVATION {
        return Err(EngineError::LimitExceeded("too much additional equipment"));
    }
    Ok(())
}
