use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::StoreError;
use crate::db::models::event::EventStatus;

pub mod geo;
pub mod token;
pub mod verifier;

pub use verifier::{AttendanceVerifier, VerifiedAttendance};

pub type VerifyResult<T> = core::result::Result<T, VerifyError>;

/// One variant per gate of the verification pipeline, plus storage failure.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("scanned payload is not a valid attendance code")]
    MalformedPayload,

    #[error("event not found")]
    EventNotFound,

    #[error("event is {0} and not accepting attendance")]
    EventNotOpenForAttendance(EventStatus),

    #[error("user is not enrolled in this event")]
    NotEnrolled,

    #[error("attendance is only accepted between {start} and {end}")]
    OutsideWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("attendance code is invalid or has expired")]
    InvalidOrExpiredToken,

    #[error("you are {distance_meters:.0}m from the event; must be within {radius_km}km")]
    OutsideGeofence { distance_meters: f64, radius_km: f64 },

    #[error("attendance already marked for this event")]
    AlreadyMarked,

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl VerifyError {
    pub fn kind(&self) -> &'static str {
        match self {
            VerifyError::MalformedPayload => "malformed_payload",
            VerifyError::EventNotFound => "event_not_found",
            VerifyError::EventNotOpenForAttendance(_) => "event_not_open_for_attendance",
            VerifyError::NotEnrolled => "not_enrolled",
            VerifyError::OutsideWindow { .. } => "outside_window",
            VerifyError::InvalidOrExpiredToken => "invalid_or_expired_token",
            VerifyError::OutsideGeofence { .. } => "outside_geofence",
            VerifyError::AlreadyMarked => "already_marked",
            VerifyError::Storage(e) if e.is_transient() => "storage_unavailable",
            VerifyError::Storage(_) => "storage_error",
        }
    }

    /// Only infrastructure failures are worth retrying
    pub fn is_retriable(&self) -> bool {
        matches!(self, VerifyError::Storage(e) if e.is_transient())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_only_transient_storage_is_retriable() {
        assert!(VerifyError::Storage(StoreError::Timeout(Duration::from_secs(2))).is_retriable());
        assert!(!VerifyError::Storage(StoreError::Corrupt("x".into())).is_retriable());
        assert!(!VerifyError::AlreadyMarked.is_retriable());
        assert!(!VerifyError::MalformedPayload.is_retriable());
    }

    #[test]
    fn test_geofence_message_carries_distance() {
        let err = VerifyError::OutsideGeofence {
            distance_meters: 4987.6,
            radius_km: 1.0,
        };
        assert_eq!(err.kind(), "outside_geofence");
        assert!(err.to_string().contains("4988m"));
    }
}
