use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::decode_tag;
use super::event::EventId;
use super::user::UserId;
use crate::attendance::geo::GeoPoint;
use crate::db::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    PendingReview,
    Rejected,
}

/// Immutable proof that a user attended an event.
///
/// At most one exists per `(event_id, user_id)`; the `attendance_event_user_key` constraint
/// enforces this in storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: Uuid,
    pub event_id: EventId,
    pub user_id: UserId,
    pub attended_at: DateTime<Utc>,
    pub scanned_location: GeoPoint,
    pub within_geofence: bool,
    pub token_used: String,
    pub points_awarded: u32,
    pub verification_status: VerificationStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttendanceFilter {
    pub event_id: Option<EventId>,
    pub user_id: Option<UserId>,
    pub verification_status: Option<VerificationStatus>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AttendanceRow {
    pub id: Uuid,
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub attended_at: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub within_geofence: bool,
    pub token_used: String,
    pub points_awarded: i64,
    pub verification_status: String,
}

impl AttendanceRecord {
    pub fn verified(
        event_id: EventId,
        user_id: UserId,
        attended_at: DateTime<Utc>,
        scanned_location: GeoPoint,
        token_used: &str,
        points: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id,
            user_id,
            attended_at,
            scanned_location,
            within_geofence: true,
            token_used: token_used.to_string(),
            points_awarded: points,
            verification_status: VerificationStatus::Verified,
        }
    }
}

impl AttendanceFilter {
    pub fn matches(&self, record: &AttendanceRecord) -> bool {
        self.event_id.is_none_or(|id| id == record.event_id)
            && self.user_id.is_none_or(|id| id == record.user_id)
            && self
                .verification_status
                .is_none_or(|s| s == record.verification_status)
    }
}

impl TryFrom<AttendanceRow> for AttendanceRecord {
    type Error = StoreError;

    fn try_from(row: AttendanceRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.id,
            event_id: EventId(row.event_id),
            user_id: UserId(row.user_id),
            attended_at: row.attended_at,
            scanned_location: GeoPoint {
                latitude: row.latitude,
                longitude: row.longitude,
            },
            within_geofence: row.within_geofence,
            token_used: row.token_used,
            points_awarded: u32::try_from(row.points_awarded).map_err(|_| {
                StoreError::Corrupt(format!("attendance.points_awarded = {}", row.points_awarded))
            })?,
            verification_status: decode_tag(
                "attendance.verification_status",
                &row.verification_status,
            )?,
        })
    }
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Verified => "verified",
            VerificationStatus::PendingReview => "pending_review",
            VerificationStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for VerificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verified" => Ok(VerificationStatus::Verified),
            "pending_review" => Ok(VerificationStatus::PendingReview),
            "rejected" => Ok(VerificationStatus::Rejected),
            other => Err(format!("unknown verification status '{other}'")),
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_filter_matches() {
        let record = AttendanceRecord::verified(
            EventId::new(),
            UserId::new(),
            Utc::now(),
            GeoPoint {
                latitude: 19.0761,
                longitude: 72.8778,
            },
            "t1",
            10,
        );

        assert!(AttendanceFilter::default().matches(&record));
        assert!(
            AttendanceFilter {
                event_id: Some(record.event_id),
                verification_status: Some(VerificationStatus::Verified),
                ..Default::default()
            }
            .matches(&record)
        );
        assert!(
            !AttendanceFilter {
                user_id: Some(UserId::new()),
                ..Default::default()
            }
            .matches(&record)
        );
    }

    fn row(points_awarded: i64) -> AttendanceRow {
        AttendanceRow {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            attended_at: Utc::now(),
            latitude: 19.0761,
            longitude: 72.8778,
            within_geofence: true,
            token_used: "t1".into(),
            points_awarded,
            verification_status: "verified".into(),
        }
    }

    #[test]
    fn test_row_conversion() {
        let record = AttendanceRecord::try_from(row(10)).unwrap();
        assert_eq!(record.points_awarded, 10);
        assert_eq!(record.verification_status, VerificationStatus::Verified);

        for bad in [-10, i64::from(u32::MAX) + 1] {
            assert!(matches!(
                AttendanceRecord::try_from(row(bad)),
                Err(StoreError::Corrupt(msg)) if msg.contains("points_awarded")
            ));
        }

        let mut unknown = row(10);
        unknown.verification_status = "approved".into();
        assert!(matches!(
            AttendanceRecord::try_from(unknown),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_verification_status_wire_names() {
        assert_eq!(
            serde_json::to_value(VerificationStatus::PendingReview).unwrap(),
            "pending_review"
        );
        assert_eq!(
            "rejected".parse::<VerificationStatus>().unwrap(),
            VerificationStatus::Rejected
        );
        assert!("approved".parse::<VerificationStatus>().is_err());
    }
}
