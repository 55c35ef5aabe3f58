use std::collections::BTreeSet;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.is_empty() {
        return Err(EngineError::validation(format!(
            "interval [{}, {}) must have positive length",
            span.start, span.end
        )));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("interval too wide"));
    }
    Ok(())
}

/// Units on `resource` free for all of `span`, given its existing reservations.
///
/// A unit is taken if any CONFIRMED or ACTIVE reservation on it overlaps `span`.
/// `exclude` ignores one reservation (used when extending it). Free units are
/// handed out lowest-first so assignment is reproducible.
pub fn resolve<'a>(
    resource: &Resource,
    existing: impl IntoIterator<Item = &'a Reservation>,
    span: &Span,
    required_units: u32,
    exclude: Option<Ulid>,
) -> Result<Availability, EngineError> {
    validate_span(span)?;
    if required_units == 0 {
        return Err(EngineError::validation("required units must be at least 1"));
    }

    let occupied: BTreeSet<u32> = existing
        .into_iter()
        .filter(|r| r.resource_id == resource.id)
        .filter(|r| Some(r.id) != exclude)
        .filter(|r| r.status.holds_capacity() && r.span.overlaps(span))
        .map(|r| r.unit)
        .collect();

    let free_units: Vec<u32> = (1..=resource.capacity)
        .filter(|u| !occupied.contains(u))
        .collect();
    let available_units = free_units.len() as u32;
    let is_available = available_units >= required_units;
    let assigned_units = if is_available {
        free_units[..required_units as usize].to_vec()
    } else {
        Vec::new()
    };

    Ok(Availability {
        resource_id: resource.id,
        span: *span,
        capacity: resource.capacity,
        required_units,
        available_units,
        is_available,
        free_units,
        assigned_units,
    })
}

/// Conflict error for an availability snapshot that came up short.
pub(crate) fn conflict(availability: &Availability) -> EngineError {
    EngineError::Conflict {
        resource_id: availability.resource_id,
        available_units: availability.available_units,
        required_units: availability.required_units,
    }
}
