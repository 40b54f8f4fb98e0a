//! Status rules, input validation and attendance window derivation for events.
//!
//! Everything here is pure; [`super::EventService`] loads and persists around it.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde::Deserialize;

use super::{EventError, EventResult};
use crate::attendance::geo::GeoPoint;
use crate::constants::{
    ATTENDANCE_WINDOW_PADDING_MINUTES, DEFAULT_GEOFENCE_RADIUS_KM, MAX_GEOFENCE_RADIUS_KM,
    MAX_SUMMARY_LEN, MIN_DESCRIPTION_LEN, MIN_GEOFENCE_RADIUS_KM, MIN_LOCATION_NAME_LEN,
    MIN_SUMMARY_LEN, MIN_TITLE_LEN,
};
use crate::db::models::event::{
    AttendanceWindow, CompletionSummary, Event, EventId, EventStatus, Schedule, hh_mm,
};
use crate::db::models::user::{Principal, Role, UserId};

impl EventStatus {
    /// Completed and cancelled events never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Cancelled)
    }

    pub fn is_open_for_attendance(&self) -> bool {
        matches!(self, EventStatus::Upcoming | EventStatus::Active)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewEvent {
    pub title: String,
    pub description: String,
    pub date: NaiveDate,
    #[serde(with = "hh_mm")]
    pub start_time: NaiveTime,
    #[serde(with = "hh_mm")]
    pub end_time: NaiveTime,
    pub location_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub geofence_radius_km: Option<f64>,
}

/// Partial edit; absent fields are left alone
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub date: Option<NaiveDate>,
    #[serde(default, with = "hh_mm::option")]
    pub start_time: Option<NaiveTime>,
    #[serde(default, with = "hh_mm::option")]
    pub end_time: Option<NaiveTime>,
    pub location_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub geofence_radius_km: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionDetails {
    pub wet_waste_kg: f64,
    pub dry_waste_kg: f64,
    #[serde(default)]
    pub other_waste_details: Option<String>,
    pub event_summary: String,
}

/// What an applied [`EventPatch`] requires of the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EditImpact {
    /// Schedule or coordinates moved; the window was re-derived and the token must be replaced
    pub rotate_token: bool,
}

/// `[start - 30m, end + 30m]`, with the schedule read as wall-clock time at `offset`
pub fn derive_window(schedule: &Schedule, offset: FixedOffset) -> EventResult<AttendanceWindow> {
    let padding = TimeDelta::minutes(ATTENDANCE_WINDOW_PADDING_MINUTES);
    let start = local_instant(schedule.date, schedule.start_time, offset)?;
    let end = local_instant(schedule.date, schedule.end_time, offset)?;

    Ok(AttendanceWindow {
        start: start - padding,
        end: end + padding,
    })
}

fn local_instant(
    date: NaiveDate,
    time: NaiveTime,
    offset: FixedOffset,
) -> EventResult<DateTime<Utc>> {
    date.and_time(time)
        .and_local_timezone(offset)
        .single()
        .map(|at| at.with_timezone(&Utc))
        .ok_or_else(|| EventError::Validation(format!("{date} {time} is not a valid local time")))
}

fn min_len(field: &str, value: &str, min: usize) -> EventResult<()> {
    if value.trim().chars().count() < min {
        return Err(EventError::Validation(format!(
            "{field} must be at least {min} characters"
        )));
    }
    Ok(())
}

fn location(latitude: f64, longitude: f64) -> EventResult<GeoPoint> {
    GeoPoint::new(latitude, longitude).ok_or_else(|| {
        EventError::Validation(
            "latitude must be within [-90, 90] and longitude within [-180, 180]".into(),
        )
    })
}

fn radius(km: f64) -> EventResult<f64> {
    if !(MIN_GEOFENCE_RADIUS_KM..=MAX_GEOFENCE_RADIUS_KM).contains(&km) {
        return Err(EventError::Validation(format!(
            "geofence radius must be between {MIN_GEOFENCE_RADIUS_KM} and {MAX_GEOFENCE_RADIUS_KM} km"
        )));
    }
    Ok(km)
}

fn schedule(date: NaiveDate, start_time: NaiveTime, end_time: NaiveTime) -> EventResult<Schedule> {
    if end_time <= start_time {
        return Err(EventError::Validation(
            "end time must be after start time".into(),
        ));
    }
    Ok(Schedule {
        date,
        start_time,
        end_time,
    })
}

/// Validates `new` into an upcoming event without a token
pub fn build_event(
    new: NewEvent,
    created_by: UserId,
    offset: FixedOffset,
    now: DateTime<Utc>,
) -> EventResult<Event> {
    min_len("title", &new.title, MIN_TITLE_LEN)?;
    min_len("description", &new.description, MIN_DESCRIPTION_LEN)?;
    min_len("location name", &new.location_name, MIN_LOCATION_NAME_LEN)?;

    let location = location(new.latitude, new.longitude)?;
    let geofence_radius_km = radius(new.geofence_radius_km.unwrap_or(DEFAULT_GEOFENCE_RADIUS_KM))?;
    let schedule = schedule(new.date, new.start_time, new.end_time)?;
    let window = derive_window(&schedule, offset)?;

    Ok(Event {
        id: EventId::new(),
        title: new.title.trim().to_string(),
        description: new.description.trim().to_string(),
        schedule,
        location_name: new.location_name.trim().to_string(),
        location,
        geofence_radius_km,
        status: EventStatus::Upcoming,
        token: None,
        window,
        created_by,
        enrolled: Vec::new(),
        summary: CompletionSummary::default(),
        created_at: now,
        updated_at: now,
    })
}

/// Applies `patch` to `event` in place. Fails without touching `event` if any field is invalid.
pub fn apply_patch(
    event: &mut Event,
    patch: EventPatch,
    offset: FixedOffset,
) -> EventResult<EditImpact> {
    if let Some(title) = &patch.title {
        min_len("title", title, MIN_TITLE_LEN)?;
    }
    if let Some(description) = &patch.description {
        min_len("description", description, MIN_DESCRIPTION_LEN)?;
    }
    if let Some(name) = &patch.location_name {
        min_len("location name", name, MIN_LOCATION_NAME_LEN)?;
    }
    let geofence_radius_km = patch.geofence_radius_km.map(radius).transpose()?;

    let moved_to = match (patch.latitude, patch.longitude) {
        (Some(lat), Some(lng)) => Some(location(lat, lng)?),
        (None, None) => None,
        _ => {
            return Err(EventError::Validation(
                "latitude and longitude must be updated together".into(),
            ));
        }
    };

    let rescheduled = if patch.date.is_some() || patch.start_time.is_some() || patch.end_time.is_some()
    {
        let schedule = schedule(
            patch.date.unwrap_or(event.schedule.date),
            patch.start_time.unwrap_or(event.schedule.start_time),
            patch.end_time.unwrap_or(event.schedule.end_time),
        )?;
        let window = derive_window(&schedule, offset)?;
        Some((schedule, window))
    } else {
        None
    };

    if let Some(title) = patch.title {
        event.title = title.trim().to_string();
    }
    if let Some(description) = patch.description {
        event.description = description.trim().to_string();
    }
    if let Some(name) = patch.location_name {
        event.location_name = name.trim().to_string();
    }
    if let Some(km) = geofence_radius_km {
        event.geofence_radius_km = km;
    }

    let mut impact = EditImpact::default();
    if let Some(point) = moved_to {
        event.location = point;
        impact.rotate_token = true;
    }
    if let Some((schedule, window)) = rescheduled {
        event.schedule = schedule;
        event.window = window;
        impact.rotate_token = true;
    }

    Ok(impact)
}

impl CompletionDetails {
    pub fn validate(self) -> EventResult<CompletionSummary> {
        let waste_ok = |kg: f64| kg.is_finite() && kg >= 0.0;
        if !waste_ok(self.wet_waste_kg) || !waste_ok(self.dry_waste_kg) {
            return Err(EventError::Validation(
                "waste collected cannot be negative".into(),
            ));
        }

        let event_summary = self.event_summary.trim().to_string();
        let len = event_summary.chars().count();
        if !(MIN_SUMMARY_LEN..=MAX_SUMMARY_LEN).contains(&len) {
            return Err(EventError::Validation(format!(
                "event summary must be between {MIN_SUMMARY_LEN} and {MAX_SUMMARY_LEN} characters"
            )));
        }

        Ok(CompletionSummary {
            wet_waste_kg: self.wet_waste_kg,
            dry_waste_kg: self.dry_waste_kg,
            other_waste_details: self
                .other_waste_details
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
            event_summary,
        })
    }
}

pub fn ensure_organizer(principal: &Principal) -> EventResult<()> {
    if principal.role != Role::Organizer {
        return Err(EventError::Forbidden(
            "only organizers can create events".into(),
        ));
    }
    Ok(())
}

pub fn ensure_creator(event: &Event, principal: &Principal, action: &str) -> EventResult<()> {
    if !event.is_created_by(principal) {
        return Err(EventError::Forbidden(format!(
            "only the event's creator can {action}"
        )));
    }
    Ok(())
}

pub fn ensure_creator_or_supervisor(
    event: &Event,
    principal: &Principal,
    action: &str,
) -> EventResult<()> {
    if !event.is_created_by(principal) && !principal.is_supervisor() {
        return Err(EventError::Forbidden(format!(
            "only the event's creator or a supervisor can {action}"
        )));
    }
    Ok(())
}

/// Fails with [`EventError::Conflict`] unless `event` is in one of `allowed`
pub fn ensure_status(event: &Event, allowed: &[EventStatus], action: &str) -> EventResult<()> {
    if !allowed.contains(&event.status) {
        return Err(EventError::Conflict(format!(
            "cannot {action} an event that is {}",
            event.status
        )));
    }
    Ok(())
}
