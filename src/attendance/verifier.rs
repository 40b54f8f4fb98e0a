use std::sync::Arc;

use serde::Serialize;
use tracing::instrument;

use super::geo::{GeoPoint, within_radius};
use super::token::ScanPayload;
use super::{VerifyError, VerifyResult};
use crate::constants::ATTENDANCE_POINTS;
use crate::db::StoreError;
use crate::db::models::attendance::AttendanceRecord;
use crate::db::models::user::UserId;
use crate::db::repositories::{AttendanceStore, EventStore};
use crate::util::Clock;

/// A committed check-in and the user's balance after the award
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedAttendance {
    pub attendance: AttendanceRecord,
    pub user_points: i64,
}

#[derive(Debug, Clone)]
pub struct AttendanceVerifier {
    events: Arc<dyn EventStore>,
    attendance: Arc<dyn AttendanceStore>,
    clock: Arc<dyn Clock>,
    award: u32,
}

impl AttendanceVerifier {
    pub fn new(
        events: Arc<dyn EventStore>,
        attendance: Arc<dyn AttendanceStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            events,
            attendance,
            clock,
            award: ATTENDANCE_POINTS,
        }
    }

    /// Admits `user_id` to the event named in `scanned` if every gate passes, in order:
    ///
    /// 1. payload parses
    /// 2. event exists
    /// 3. event is upcoming or active
    /// 4. user is enrolled
    /// 5. now is inside the attendance window (inclusive)
    /// 6. token is the event's current one and unexpired
    /// 7. `location` is inside the geofence
    /// 8. no attendance exists yet for the pair
    ///
    /// after which the record is written and points credited together. The first failing gate
    /// decides the error; nothing is written unless all of them pass.
    #[instrument(skip(self, scanned), fields(user_id = %user_id, event_id = tracing::field::Empty))]
    pub async fn verify(
        &self,
        user_id: &UserId,
        scanned: &str,
        location: GeoPoint,
    ) -> VerifyResult<VerifiedAttendance> {
        let payload = ScanPayload::parse(scanned).ok_or(VerifyError::MalformedPayload)?;
        let event_id = payload.event_id;
        tracing::Span::current().record("event_id", tracing::field::display(event_id));

        let event = self
            .events
            .get_event(&event_id)
            .await?
            .ok_or(VerifyError::EventNotFound)?;

        if !event.status.is_open_for_attendance() {
            return Err(VerifyError::EventNotOpenForAttendance(event.status));
        }

        if !event.is_enrolled(user_id) {
            return Err(VerifyError::NotEnrolled);
        }

        let now = self.clock.now();
        if !event.window.contains(now) {
            return Err(VerifyError::OutsideWindow {
                start: event.window.start,
                end: event.window.end,
            });
        }

        let token_ok = event
            .token
            .as_ref()
            .is_some_and(|t| t.accepts(&payload.token, now));
        if !token_ok {
            return Err(VerifyError::InvalidOrExpiredToken);
        }

        let distance_meters = location.distance_meters(&event.location);
        if !within_radius(distance_meters, event.geofence_radius_km) {
            tracing::debug!(distance_meters, radius_km = event.geofence_radius_km, "outside geofence");
            return Err(VerifyError::OutsideGeofence {
                distance_meters,
                radius_km: event.geofence_radius_km,
            });
        }

        if self.attendance.attendance_exists(&event_id, user_id).await? {
            return Err(VerifyError::AlreadyMarked);
        }

        let record = AttendanceRecord::verified(
            event_id,
            *user_id,
            now,
            location,
            &payload.token,
            self.award,
        );

        // a concurrent scan may have committed between the existence check and here
        let user_points = match self.attendance.commit_attendance(&record).await {
            Ok(total) => total,
            Err(StoreError::Duplicate(constraint)) => {
                tracing::debug!(constraint = %constraint, "lost attendance race");
                return Err(VerifyError::AlreadyMarked);
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(distance_meters, user_points, "attendance verified");

        Ok(VerifiedAttendance {
            attendance: record,
            user_points,
        })
    }
}
