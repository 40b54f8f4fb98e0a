use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::decode_tag;
use super::user::{Principal, UserId};
use crate::attendance::geo::GeoPoint;
use crate::db::StoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Upcoming,
    Active,
    Completed,
    Cancelled,
}

/// Wall-clock schedule as entered by the organizer; interpreted in the configured event offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub date: NaiveDate,
    #[serde(with = "hh_mm")]
    pub start_time: NaiveTime,
    #[serde(with = "hh_mm")]
    pub end_time: NaiveTime,
}

/// Inclusive interval during which check-ins are admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// The single live verification secret for an event
#[derive(Clone, PartialEq, Eq)]
pub struct AttendanceToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub user_id: UserId,
    pub enrolled_at: DateTime<Utc>,
}

/// Post-event metrics submitted by the organizer
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompletionSummary {
    pub wet_waste_kg: f64,
    pub dry_waste_kg: f64,
    pub other_waste_details: String,
    pub event_summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: EventId,
    pub title: String,
    pub description: String,
    pub schedule: Schedule,
    pub location_name: String,
    pub location: GeoPoint,
    pub geofence_radius_km: f64,
    pub status: EventStatus,
    /// Never serialized with the event; handed out through the token endpoints only
    #[serde(skip_serializing)]
    pub token: Option<AttendanceToken>,
    pub window: AttendanceWindow,
    pub created_by: UserId,
    pub enrolled: Vec<Enrollment>,
    pub summary: CompletionSummary,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventFilter {
    pub status: Option<EventStatus>,
    pub created_by: Option<UserId>,
}

/// Flat `events` row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub event_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub location_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub geofence_radius_km: f64,
    pub status: String,
    pub attendance_token: Option<String>,
    pub attendance_token_expires_at: Option<DateTime<Utc>>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub created_by: Uuid,
    pub wet_waste_kg: f64,
    pub dry_waste_kg: f64,
    pub other_waste_details: String,
    pub event_summary: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EnrollmentRow {
    pub event_id: Uuid,
    pub user_id: Uuid,
    pub enrolled_at: DateTime<Utc>,
}

impl Event {
    pub fn is_enrolled(&self, user_id: &UserId) -> bool {
        self.enrolled.iter().any(|e| &e.user_id == user_id)
    }

    pub fn is_created_by(&self, principal: &Principal) -> bool {
        self.created_by == principal.user_id
    }
}

impl EventRow {
    pub fn into_event(self, enrolled: Vec<Enrollment>) -> StoreResult<Event> {
        let token = match (self.attendance_token, self.attendance_token_expires_at) {
            (Some(value), Some(expires_at)) if !value.is_empty() => {
                Some(AttendanceToken { value, expires_at })
            }
            _ => None,
        };

        Ok(Event {
            id: EventId(self.id),
            title: self.title,
            description: self.description,
            schedule: Schedule {
                date: self.event_date,
                start_time: self.start_time,
                end_time: self.end_time,
            },
            location_name: self.location_name,
            location: GeoPoint {
                latitude: self.latitude,
                longitude: self.longitude,
            },
            geofence_radius_km: self.geofence_radius_km,
            status: decode_tag("events.status", &self.status)?,
            token,
            window: AttendanceWindow {
                start: self.window_start,
                end: self.window_end,
            },
            created_by: UserId(self.created_by),
            enrolled,
            summary: CompletionSummary {
                wet_waste_kg: self.wet_waste_kg,
                dry_waste_kg: self.dry_waste_kg,
                other_waste_details: self.other_waste_details,
                event_summary: self.event_summary,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl From<EnrollmentRow> for Enrollment {
    fn from(value: EnrollmentRow) -> Self {
        Enrollment {
            user_id: UserId(value.user_id),
            enrolled_at: value.enrolled_at,
        }
    }
}

impl AttendanceWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for EventId {
    fn from(value: Uuid) -> Self {
        EventId(value)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Upcoming => "upcoming",
            EventStatus::Active => "active",
            EventStatus::Completed => "completed",
            EventStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upcoming" => Ok(EventStatus::Upcoming),
            "active" => Ok(EventStatus::Active),
            "completed" => Ok(EventStatus::Completed),
            "cancelled" => Ok(EventStatus::Cancelled),
            other => Err(format!("unknown event status '{other}'")),
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `HH:MM` wall-clock times
pub mod hh_mm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn parse(raw: &str) -> Option<NaiveTime> {
        let raw = raw.trim();
        // `%H` alone would also take a single digit
        if raw.len() != 5 {
            return None;
        }
        NaiveTime::parse_from_str(raw, FORMAT).ok()
    }

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&time.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| {
            serde::de::Error::custom(format!("time '{raw}' must be in HH:MM format"))
        })
    }

    pub mod option {
        use chrono::NaiveTime;
        use serde::{Deserialize, Deserializer};

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<NaiveTime>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => super::parse(&raw).map(Some).ok_or_else(|| {
                    serde::de::Error::custom(format!("time '{raw}' must be in HH:MM format"))
                }),
                None => Ok(None),
            }
        }
    }
}

// keeps the secret out of logs and `?event` span fields
impl fmt::Debug for AttendanceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttendanceToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;

    use super::*;

    fn row() -> EventRow {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 4, 0, 0).unwrap();
        EventRow {
            id: Uuid::new_v4(),
            title: "Juhu beach sweep".into(),
            description: "Morning cleanup along the northern stretch".into(),
            event_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            start_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
            location_name: "Juhu Beach, Mumbai".into(),
            latitude: 19.076,
            longitude: 72.8777,
            geofence_radius_km: 1.0,
            status: "active".into(),
            attendance_token: Some("abc".into()),
            attendance_token_expires_at: Some(at),
            window_start: at,
            window_end: at,
            created_by: Uuid::new_v4(),
            wet_waste_kg: 0.0,
            dry_waste_kg: 0.0,
            other_waste_details: String::new(),
            event_summary: String::new(),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_row_into_event() {
        let event = row().into_event(Vec::new()).unwrap();
        assert_eq!(event.status, EventStatus::Active);
        assert_eq!(event.token.as_ref().map(|t| t.value.as_str()), Some("abc"));
        assert_eq!(event.location.latitude, 19.076);
    }

    #[test]
    fn test_row_without_token_or_with_bad_status() {
        let mut no_token = row();
        no_token.attendance_token = Some(String::new());
        assert!(no_token.into_event(Vec::new()).unwrap().token.is_none());

        let mut bad = row();
        bad.status = "archived".into();
        assert!(matches!(
            bad.into_event(Vec::new()),
            Err(crate::db::StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_token_hidden_from_serialization_and_debug() {
        let event = row().into_event(Vec::new()).unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("token").is_none());
        assert_eq!(json["status"], "active");

        let debug = format!("{:?}", event.token);
        assert!(!debug.contains("abc"));
    }

    #[test]
    fn test_schedule_times_are_hh_mm() {
        let schedule: Schedule = serde_json::from_value(serde_json::json!({
            "date": "2025-03-01",
            "start_time": "09:30",
            "end_time": "13:00",
        }))
        .unwrap();
        assert_eq!(schedule.start_time, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(serde_json::to_value(schedule).unwrap()["end_time"], "13:00");

        assert!(hh_mm::parse("9:30").is_none());
        assert!(hh_mm::parse("24:00").is_none());
        assert!(hh_mm::parse("09:30:00").is_none());
    }

    #[test]
    fn test_window_contains_is_inclusive() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 4, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        let window = AttendanceWindow { start, end };

        assert!(window.contains(start));
        assert!(window.contains(end));
        assert!(!window.contains(start - chrono::TimeDelta::seconds(1)));
        assert!(!window.contains(end + chrono::TimeDelta::seconds(1)));
    }
}
