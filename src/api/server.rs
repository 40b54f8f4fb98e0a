use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::extract::{MatchedPath, Request};
use axum::middleware::{self, Next, from_fn};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::FixedOffset;
use http::StatusCode;
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::instrument;

use crate::api::handler::*;
use crate::api::middleware::cors;
use crate::api::middleware::gateway::verify_gateway;
use crate::attendance::token::TokenIssuer;
use crate::attendance::{AttendanceVerifier, VerifyError};
use crate::db::prelude::*;
use crate::event::{EventError, EventService};
use crate::util::env::Config;
use crate::util::{Clock, SystemClock};

pub type JsonResult<T> = core::result::Result<Json<T>, RouteError>;

#[derive(Clone, Debug)]
pub struct AppState {
    pub events: EventService,
    pub verifier: AttendanceVerifier,
    pub attendance: Arc<dyn AttendanceStore>,
    pub ledger: Arc<dyn PointsLedger>,
    pub gateway_token: Arc<str>,
}

impl AppState {
    pub fn new(
        events: Arc<dyn EventStore>,
        attendance: Arc<dyn AttendanceStore>,
        ledger: Arc<dyn PointsLedger>,
        clock: Arc<dyn Clock>,
        utc_offset: FixedOffset,
        gateway_token: &str,
    ) -> Self {
        Self {
            events: EventService::new(
                events.clone(),
                Arc::new(TokenIssuer::new()),
                clock.clone(),
                utc_offset,
            ),
            verifier: AttendanceVerifier::new(events, attendance.clone(), clock),
            attendance,
            ledger,
            gateway_token: Arc::from(gateway_token),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let gated = Router::new()
        //
        // attendance
        .route("/attendance/scan", post(scan_attendance))
        .route("/attendance", get(all_attendance))
        .route("/attendance/events/{id}", get(event_attendance))
        .route("/points/me", get(my_points))
        //
        // events
        .route("/events", post(create_event).get(list_events))
        .route(
            "/events/{id}",
            get(get_event).put(update_event).delete(delete_event),
        )
        .route("/events/{id}/status", patch(set_event_status))
        .route("/events/{id}/complete-details", patch(complete_event))
        .route("/events/{id}/refresh-token", patch(refresh_event_token))
        .route("/events/{id}/token", get(current_event_token))
        .route("/events/{id}/enroll", post(enroll).delete(leave))
        .route("/events/{id}/enrolled", get(enrolled_users))
        .route_layer(middleware::from_fn_with_state(state.clone(), verify_gateway));

    Router::new()
        .route("/", get(health))
        .merge(gated)
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let method = req.method();
                let uri = req.uri();

                let matched_path = req
                    .extensions()
                    .get::<MatchedPath>()
                    .map(|matched| matched.as_str());

                tracing::debug_span!("api_request", ?method, ?uri, ?matched_path)
            }),
        )
        .layer(from_fn(log_route_errors))
        .with_state(state)
}

/// Reports server-side failures attached to `RouteError` responses
#[instrument(skip(request, next), fields(uri = request.uri().to_string()))]
async fn log_route_errors(request: Request, next: Next) -> Response {
    let res = next.run(request).await;
    if let Some(err) = res.extensions().get::<Arc<RouteError>>() {
        tracing::error!(error = ?err, "error occurred inside route handler");
    }

    res
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = ?e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

/// Binds the API listener and spawns the server, returning its task handles.
#[instrument(skip(config, pool))]
pub async fn start_server(
    config: &'static Config,
    pool: &'static PgPool,
) -> Result<Vec<JoinHandle<()>>, RouteError> {
    tracing::info!("starting server");

    let timeout = config.store_timeout;
    let state = Arc::new(AppState::new(
        Arc::new(EventRepository::new(pool, timeout)),
        Arc::new(AttendanceRepository::new(pool, timeout)),
        Arc::new(LedgerRepository::new(pool, timeout)),
        Arc::new(SystemClock),
        config.event_utc_offset,
        &config.gateway_token,
    ));
    let app = router(state).layer(cors(config));

    let socket_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.server_api_port);
    let listener = tokio::net::TcpListener::bind(socket_addr).await?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<SocketAddr>();
    let server_handle = tokio::task::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            _ = tx.send(addr);
        }

        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
        {
            tracing::error!(error = ?e, "server exited with error");
        }
    });

    let logging_handle = tokio::task::spawn(async move {
        if let Some(addr) = rx.recv().await {
            tracing::info!(
                server_url = %format!("http://127.0.0.1:{}", addr.port()),
                "server ready"
            );
        }
    });

    Ok(vec![server_handle, logging_handle])
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    AuthError(StatusCode),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn store_status(err: &StoreError) -> StatusCode {
    if err.is_transient() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl RouteError {
    fn status(&self) -> StatusCode {
        match self {
            RouteError::Verify(err) => match err {
                VerifyError::MalformedPayload => StatusCode::BAD_REQUEST,
                VerifyError::EventNotFound => StatusCode::NOT_FOUND,
                VerifyError::EventNotOpenForAttendance(_) => StatusCode::BAD_REQUEST,
                VerifyError::NotEnrolled => StatusCode::FORBIDDEN,
                VerifyError::OutsideWindow { .. } => StatusCode::BAD_REQUEST,
                VerifyError::InvalidOrExpiredToken => StatusCode::UNAUTHORIZED,
                VerifyError::OutsideGeofence { .. } => StatusCode::FORBIDDEN,
                VerifyError::AlreadyMarked => StatusCode::CONFLICT,
                VerifyError::Storage(e) => store_status(e),
            },

            RouteError::Event(err) => match err {
                EventError::NotFound => StatusCode::NOT_FOUND,
                EventError::Forbidden(_) => StatusCode::FORBIDDEN,
                EventError::Conflict(_) => StatusCode::CONFLICT,
                EventError::Validation(_) => StatusCode::BAD_REQUEST,
                EventError::Token(_) => StatusCode::INTERNAL_SERVER_ERROR,
                EventError::Store(e) => store_status(e),
            },

            RouteError::Store(e) => store_status(e),
            RouteError::AuthError(status) => *status,
            RouteError::Forbidden(_) => StatusCode::FORBIDDEN,
            RouteError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RouteError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            RouteError::Verify(err) => err.kind(),
            RouteError::Event(err) => err.kind(),
            RouteError::Store(e) if e.is_transient() => "storage_unavailable",
            RouteError::Store(_) => "storage_error",
            RouteError::AuthError(_) => "unauthorized",
            RouteError::Forbidden(_) => "forbidden",
            RouteError::InvalidRequest(_) => "invalid_request",
            RouteError::Io(_) => "internal",
        }
    }

    fn retriable(&self) -> bool {
        match self {
            RouteError::Verify(err) => err.is_retriable(),
            RouteError::Event(err) => err.is_retriable(),
            RouteError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            kind: &'static str,
            message: String,
            retriable: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            distance_meters: Option<f64>,
        }

        let status = self.status();
        let message = match &self {
            RouteError::AuthError(_) => String::from("invalid or missing gateway credentials"),
            // storage details stay in the logs
            RouteError::Store(_)
            | RouteError::Verify(VerifyError::Storage(_))
            | RouteError::Event(EventError::Store(_)) => match status {
                StatusCode::SERVICE_UNAVAILABLE => String::from("storage temporarily unavailable"),
                _ => String::from("storage error"),
            },
            err => err.to_string(),
        };
        let distance_meters = match &self {
            RouteError::Verify(VerifyError::OutsideGeofence {
                distance_meters, ..
            }) => Some(distance_meters.round()),
            _ => None,
        };

        let body = ErrorResponse {
            kind: self.kind(),
            message,
            retriable: self.retriable(),
            distance_meters,
        };

        let mut response = (status, Json(body)).into_response();
        // client mistakes aren't an error for the server to care about
        if status.is_server_error() {
            response.extensions_mut().insert(Arc::new(self));
        }

        response
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::constants::{PRINCIPAL_ID_HEADER, PRINCIPAL_ROLE_HEADER};
    use crate::db::memory::MemoryStore;
    use crate::util::clock::FixedClock;

    const GATEWAY: &str = "test-gateway-token";

    struct TestApp {
        store: Arc<MemoryStore>,
        clock: Arc<FixedClock>,
        app: Router,
    }

    fn ist() -> FixedOffset {
        FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap()
    }

    /// 07:30 IST on the day of the sample event below
    fn event_morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 2, 2, 0, 0).unwrap()
    }

    fn test_app_with(store: MemoryStore) -> TestApp {
        let store = Arc::new(store);
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
        ));
        let state = Arc::new(AppState::new(
            store.clone(),
            store.clone(),
            store.clone(),
            clock.clone(),
            ist(),
            GATEWAY,
        ));

        TestApp {
            store,
            clock,
            app: router(state),
        }
    }

    fn test_app() -> TestApp {
        test_app_with(MemoryStore::new())
    }

    impl TestApp {
        async fn call(
            &self,
            method: &str,
            uri: &str,
            principal: Option<&Principal>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut req = http::Request::builder().method(method).uri(uri);
            if let Some(p) = principal {
                req = req
                    .header("authorization", GATEWAY)
                    .header(PRINCIPAL_ID_HEADER, p.user_id.to_string())
                    .header(PRINCIPAL_ROLE_HEADER, p.role.to_string());
            }
            let req = match body {
                Some(body) => req
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string())),
                None => req.body(Body::empty()),
            }
            .unwrap();

            let res = self.app.clone().oneshot(req).await.unwrap();
            let status = res.status();
            let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
            let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

            (status, value)
        }

        async fn create_event(&self, organizer: &Principal) -> Value {
            let (status, body) = self
                .call(
                    "POST",
                    "/events",
                    Some(organizer),
                    Some(json!({
                        "title": "Juhu beach sweep",
                        "description": "Morning cleanup along the northern stretch",
                        "date": "2025-03-02",
                        "start_time": "07:00",
                        "end_time": "10:00",
                        "location_name": "Juhu Beach, Mumbai",
                        "latitude": 19.0760,
                        "longitude": 72.8777,
                        "geofence_radius_km": 1.0
                    })),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED, "{body}");
            body
        }
    }

    fn organizer() -> Principal {
        Principal::new(UserId::new(), Role::Organizer)
    }

    fn volunteer() -> Principal {
        Principal::new(UserId::new(), Role::Volunteer)
    }

    #[tokio::test]
    async fn test_health_needs_no_gateway() {
        let app = test_app();
        let (status, body) = app.call("GET", "/", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_gateway_rejects_unauthenticated() {
        let app = test_app();
        let (status, body) = app.call("GET", "/events", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["kind"], "unauthorized");

        let req = http::Request::builder()
            .uri("/events")
            .header("authorization", "wrong-token")
            .header(PRINCIPAL_ID_HEADER, UserId::new().to_string())
            .header(PRINCIPAL_ROLE_HEADER, "volunteer")
            .body(Body::empty())
            .unwrap();
        let res = app.app.clone().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_event_json_hides_token() {
        let app = test_app();
        let org = organizer();
        let created = app.create_event(&org).await;

        assert!(created["event"].get("token").is_none());
        assert_eq!(created["event"]["schedule"]["start_time"], "07:00");
        assert_eq!(created["attendance_code"]["token"].as_str().unwrap().len(), 64);

        let id = created["event"]["id"].as_str().unwrap();
        let (status, fetched) = app.call("GET", &format!("/events/{id}"), Some(&org), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(fetched.get("token").is_none());
        assert_eq!(fetched["status"], "upcoming");
    }

    #[tokio::test]
    async fn test_scan_flow_over_http() {
        let app = test_app();
        let org = organizer();
        let user = volunteer();

        let created = app.create_event(&org).await;
        let id = created["event"]["id"].as_str().unwrap().to_string();

        let (status, _) = app
            .call("POST", &format!("/events/{id}/enroll"), Some(&user), None)
            .await;
        assert_eq!(status, StatusCode::OK);

        app.clock.set(event_morning());
        let (status, code) = app
            .call("PATCH", &format!("/events/{id}/refresh-token"), Some(&org), None)
            .await;
        assert_eq!(status, StatusCode::OK);

        let scan = json!({
            "payload": code["payload"],
            "latitude": 19.0761,
            "longitude": 72.8778
        });
        let (status, body) = app
            .call("POST", "/attendance/scan", Some(&user), Some(scan.clone()))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["user_points"], 10);
        assert_eq!(body["attendance"]["verification_status"], "verified");

        let (status, body) = app
            .call("POST", "/attendance/scan", Some(&user), Some(scan))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "already_marked");
        assert_eq!(body["retriable"], false);

        let (status, body) = app.call("GET", "/points/me", Some(&user), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["points"], 10);

        let (status, body) = app
            .call("GET", &format!("/attendance/events/{id}"), Some(&org), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = app
            .call("GET", &format!("/attendance/events/{id}"), Some(&user), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_scan_errors_map_to_statuses() {
        let app = test_app();
        let org = organizer();
        let user = volunteer();

        let created = app.create_event(&org).await;
        let id = created["event"]["id"].as_str().unwrap().to_string();
        app.call("POST", &format!("/events/{id}/enroll"), Some(&user), None)
            .await;
        app.clock.set(event_morning());
        let (_, code) = app
            .call("PATCH", &format!("/events/{id}/refresh-token"), Some(&org), None)
            .await;

        let (status, body) = app
            .call(
                "POST",
                "/attendance/scan",
                Some(&user),
                Some(json!({ "payload": "garbage", "latitude": 19.0761, "longitude": 72.8778 })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "malformed_payload");

        let (status, body) = app
            .call(
                "POST",
                "/attendance/scan",
                Some(&user),
                Some(json!({ "payload": code["payload"], "latitude": 19.1210, "longitude": 72.8777 })),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["kind"], "outside_geofence");
        let distance = body["distance_meters"].as_f64().unwrap();
        assert!((distance - 5_000.0).abs() < 100.0);

        let (status, body) = app
            .call(
                "POST",
                "/attendance/scan",
                Some(&user),
                Some(json!({ "payload": code["payload"], "latitude": 95.0, "longitude": 72.8777 })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_request");

        app.clock.advance(TimeDelta::minutes(11));
        let (status, body) = app
            .call(
                "POST",
                "/attendance/scan",
                Some(&user),
                Some(json!({ "payload": code["payload"], "latitude": 19.0761, "longitude": 72.8778 })),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["kind"], "invalid_or_expired_token");

        let stranger = volunteer();
        let (status, body) = app
            .call(
                "POST",
                "/attendance/scan",
                Some(&stranger),
                Some(json!({ "payload": code["payload"], "latitude": 19.0761, "longitude": 72.8778 })),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["kind"], "not_enrolled");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_is_service_unavailable() {
        let app = test_app_with(MemoryStore::with_timeout(Duration::from_millis(100)));
        let user = volunteer();
        app.store.set_latency(Duration::from_secs(1));

        let (status, body) = app.call("GET", "/points/me", Some(&user), None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["kind"], "storage_unavailable");
        assert_eq!(body["retriable"], true);
    }

    #[tokio::test]
    async fn test_event_lifecycle_over_http() {
        let app = test_app();
        let org = organizer();
        let supervisor = Principal::new(UserId::new(), Role::Supervisor);

        let (status, body) = app
            .call("POST", "/events", Some(&volunteer()), Some(json!({})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

        let created = app.create_event(&org).await;
        let id = created["event"]["id"].as_str().unwrap().to_string();

        let (status, body) = app
            .call(
                "PUT",
                &format!("/events/{id}"),
                Some(&org),
                Some(json!({ "start_time": "08:00" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert!(body["attendance_code"]["token"].is_string());

        let (status, body) = app
            .call(
                "PATCH",
                &format!("/events/{id}/status"),
                Some(&supervisor),
                Some(json!({ "status": "cancelled" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cancelled");

        let (status, body) = app
            .call(
                "PATCH",
                &format!("/events/{id}/status"),
                Some(&org),
                Some(json!({ "status": "active" })),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "conflict");

        let (status, _) = app
            .call("GET", "/events?status=cancelled", Some(&org), None)
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = app
            .call("GET", "/events?status=archived", Some(&org), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app
            .call("DELETE", &format!("/events/{id}"), Some(&org), None)
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = app
            .call("GET", &format!("/events/{id}"), Some(&org), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "event_not_found");

        let (status, _) = app
            .call("GET", "/events/not-a-uuid", Some(&org), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_attendance_listing_is_supervisor_only() {
        let app = test_app();
        let supervisor = Principal::new(UserId::new(), Role::Supervisor);

        let (status, body) = app
            .call("GET", "/attendance?verification_status=verified", Some(&supervisor), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());

        let (status, _) = app.call("GET", "/attendance", Some(&organizer()), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(app.store.attendance_count().await, 0);
    }
}
