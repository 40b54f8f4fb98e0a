use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::api::server::{AppState, JsonResult, RouteError};
use crate::attendance::VerifiedAttendance;
use crate::attendance::geo::GeoPoint;
use crate::attendance::token::IssuedToken;
use crate::db::prelude::*;
use crate::event::service::EventWithToken;
use crate::event::{CompletionDetails, EventPatch, NewEvent};

/// Body of a scan. `payload` is the decoded QR content; clients that parse it before posting may
/// send the object itself.
#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub payload: serde_json::Value,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Deserialize)]
pub struct StatusChange {
    pub status: EventStatus,
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
}

pub async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, RouteError> {
    payload
        .map(|Json(inner)| inner)
        .map_err(|e| RouteError::InvalidRequest(e.body_text()))
}

fn event_id(path: Result<Path<EventId>, PathRejection>) -> Result<EventId, RouteError> {
    path.map(|Path(id)| id)
        .map_err(|_| RouteError::InvalidRequest(String::from("event id must be a uuid")))
}

fn query<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, RouteError> {
    query
        .map(|Query(inner)| inner)
        .map_err(|e| RouteError::InvalidRequest(e.body_text()))
}

//
// attendance
//

#[instrument(skip(state, payload), fields(user_id = %principal.user_id))]
pub async fn scan_attendance(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    payload: Result<Json<ScanRequest>, JsonRejection>,
) -> JsonResult<VerifiedAttendance> {
    let scan = body(payload)?;
    let location = GeoPoint::new(scan.latitude, scan.longitude).ok_or_else(|| {
        RouteError::InvalidRequest(String::from(
            "latitude must be within [-90, 90] and longitude within [-180, 180]",
        ))
    })?;

    let raw = match scan.payload {
        serde_json::Value::String(raw) => raw,
        other => other.to_string(),
    };

    let verified = state
        .verifier
        .verify(&principal.user_id, &raw, location)
        .await?;

    Ok(Json(verified))
}

/// Platform-wide attendance listing for supervisors
#[instrument(skip(state, filter), fields(user_id = %principal.user_id))]
pub async fn all_attendance(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    filter: Result<Query<AttendanceFilter>, QueryRejection>,
) -> JsonResult<Vec<AttendanceRecord>> {
    if !principal.is_supervisor() {
        return Err(RouteError::Forbidden(String::from(
            "only supervisors may list attendance across events",
        )));
    }

    let filter = query(filter)?;
    Ok(Json(state.attendance.list_attendance(&filter).await?))
}

#[instrument(skip(state, path), fields(user_id = %principal.user_id))]
pub async fn event_attendance(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    path: Result<Path<EventId>, PathRejection>,
) -> JsonResult<Vec<AttendanceRecord>> {
    let id = event_id(path)?;
    state.events.audit(&principal, &id).await?;

    let filter = AttendanceFilter {
        event_id: Some(id),
        ..Default::default()
    };
    Ok(Json(state.attendance.list_attendance(&filter).await?))
}

#[instrument(skip(state), fields(user_id = %principal.user_id))]
pub async fn my_points(
    State(state): State<Arc<AppState>>,
    principal: Principal,
) -> JsonResult<PointBalance> {
    let points = state.ledger.balance(&principal.user_id).await?;

    Ok(Json(PointBalance {
        user_id: principal.user_id,
        points,
    }))
}

//
// events
//

#[instrument(skip(state, payload), fields(user_id = %principal.user_id))]
pub async fn create_event(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    payload: Result<Json<NewEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<EventWithToken>), RouteError> {
    let new = body(payload)?;
    let created = state.events.create(&principal, new).await?;

    Ok((StatusCode::CREATED, Json(created)))
}

#[instrument(skip(state, filter))]
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    _principal: Principal,
    filter: Result<Query<EventFilter>, QueryRejection>,
) -> JsonResult<Vec<Event>> {
    let filter = query(filter)?;
    Ok(Json(state.events.list(&filter).await?))
}

#[instrument(skip(state, path))]
pub async fn get_event(
    State(state): State<Arc<AppState>>,
    _principal: Principal,
    path: Result<Path<EventId>, PathRejection>,
) -> JsonResult<Event> {
    let id = event_id(path)?;
    Ok(Json(state.events.get(&id).await?))
}

#[instrument(skip(state, path, payload), fields(user_id = %principal.user_id))]
pub async fn update_event(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    path: Result<Path<EventId>, PathRejection>,
    payload: Result<Json<EventPatch>, JsonRejection>,
) -> JsonResult<EventWithToken> {
    let id = event_id(path)?;
    let patch = body(payload)?;

    Ok(Json(state.events.update(&principal, &id, patch).await?))
}

#[instrument(skip(state, path), fields(user_id = %principal.user_id))]
pub async fn delete_event(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    path: Result<Path<EventId>, PathRejection>,
) -> Result<StatusCode, RouteError> {
    let id = event_id(path)?;
    state.events.delete(&principal, &id).await?;

    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, path, payload), fields(user_id = %principal.user_id))]
pub async fn set_event_status(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    path: Result<Path<EventId>, PathRejection>,
    payload: Result<Json<StatusChange>, JsonRejection>,
) -> JsonResult<Event> {
    let id = event_id(path)?;
    let StatusChange { status } = body(payload)?;

    Ok(Json(state.events.set_status(&principal, &id, status).await?))
}

#[instrument(skip(state, path, payload), fields(user_id = %principal.user_id))]
pub async fn complete_event(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    path: Result<Path<EventId>, PathRejection>,
    payload: Result<Json<CompletionDetails>, JsonRejection>,
) -> JsonResult<Event> {
    let id = event_id(path)?;
    let details = body(payload)?;

    Ok(Json(state.events.complete(&principal, &id, details).await?))
}

#[instrument(skip(state, path), fields(user_id = %principal.user_id))]
pub async fn refresh_event_token(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    path: Result<Path<EventId>, PathRejection>,
) -> JsonResult<IssuedToken> {
    let id = event_id(path)?;
    Ok(Json(state.events.refresh_token(&principal, &id).await?))
}

#[instrument(skip(state, path), fields(user_id = %principal.user_id))]
pub async fn current_event_token(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    path: Result<Path<EventId>, PathRejection>,
) -> JsonResult<IssuedToken> {
    let id = event_id(path)?;
    Ok(Json(state.events.current_token(&principal, &id).await?))
}

#[instrument(skip(state, path), fields(user_id = %principal.user_id))]
pub async fn enroll(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    path: Result<Path<EventId>, PathRejection>,
) -> JsonResult<Event> {
    let id = event_id(path)?;
    Ok(Json(state.events.enroll(&principal, &id).await?))
}

#[instrument(skip(state, path), fields(user_id = %principal.user_id))]
pub async fn leave(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    path: Result<Path<EventId>, PathRejection>,
) -> JsonResult<Event> {
    let id = event_id(path)?;
    Ok(Json(state.events.leave(&principal, &id).await?))
}

#[instrument(skip(state, path), fields(user_id = %principal.user_id))]
pub async fn enrolled_users(
    State(state): State<Arc<AppState>>,
    principal: Principal,
    path: Result<Path<EventId>, PathRejection>,
) -> JsonResult<Vec<Enrollment>> {
    let id = event_id(path)?;
    Ok(Json(state.events.roster(&principal, &id).await?))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_scan_request_accepts_string_or_object_payload() {
        let as_string: ScanRequest = serde_json::from_value(serde_json::json!({
            "payload": "{\"eventId\":\"x\",\"token\":\"y\"}",
            "latitude": 19.07,
            "longitude": 72.87
        }))
        .unwrap();
        assert!(as_string.payload.is_string());

        let as_object: ScanRequest = serde_json::from_value(serde_json::json!({
            "payload": { "eventId": "x", "token": "y" },
            "latitude": 19.07,
            "longitude": 72.87
        }))
        .unwrap();
        assert!(as_object.payload.is_object());
    }
}
