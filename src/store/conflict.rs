use ulid::Ulid;

use crate::model::*;

use super::StoreError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Index of the first range in `existing` that overlaps `candidate`.
///
/// Half-open semantics: a range ending exactly where the candidate starts
/// does not conflict. O(n), no allocation.
pub fn conflicting_index(existing: &[TimeRange], candidate: &TimeRange) -> Option<usize> {
    existing
        .iter()
        .position(|r| candidate.start < r.end && r.start < candidate.end)
}

pub fn has_conflict(existing: &[TimeRange], candidate: &TimeRange) -> bool {
    conflicting_index(existing, candidate).is_some()
}

pub(crate) fn validate_range(range: &TimeRange) -> Result<(), StoreError> {
    use crate::limits::*;
    // Deserialized ranges skip the constructor.
    TimeRange::new(range.start, range.end)?;
    if range.start < MIN_VALID_TIMESTAMP_MS || range.end > MAX_VALID_TIMESTAMP_MS {
        return Err(StoreError::LimitExceeded("timestamp out of range"));
    }
    if range.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(StoreError::LimitExceeded("booking too long"));
    }
    Ok(())
}

/// Reject `candidate` if it overlaps a confirmed booking in the room.
/// `exclude` drops a booking's own prior range when it is being updated.
/// Caller holds the room's write lock.
pub(crate) fn check_no_conflict(
    rs: &RoomState,
    candidate: &TimeRange,
    exclude: Option<Ulid>,
) -> Result<(), StoreError> {
    let (ids, ranges): (Vec<Ulid>, Vec<TimeRange>) = rs
        .overlapping(candidate)
        .filter(|b| b.is_confirmed() && Some(b.id) != exclude)
        .map(|b| (b.id, b.range))
        .unzip();
    match conflicting_index(&ranges, candidate) {
        Some(i) => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            Err(StoreError::Conflict(ids[i]))
        }
        None => Ok(()),
    }
}
