use core::fmt;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Transaction};
use tracing::instrument;

use crate::db::models::attendance::{AttendanceFilter, AttendanceRecord};
use crate::db::models::event::{
    AttendanceToken, CompletionSummary, Event, EventFilter, EventId, EventStatus,
};
use crate::db::models::user::UserId;
use crate::db::{StoreError, StoreResult};

pub mod attendance;
pub mod event;
pub mod ledger;

pub struct Tx<'a> {
    inner: Option<Transaction<'a, Postgres>>,
}

impl<'a> Tx<'a> {
    /// Runs `f` inside a transaction, committing only when it returns `Ok`.
    ///
    /// `f` hands the transaction back alongside its result; on `Err` the transaction is rolled back
    /// before the error is returned.
    #[instrument(skip(pool, f))]
    pub async fn with_tx<F, Fut, T>(pool: &'static Pool<Postgres>, f: F) -> StoreResult<T>
    where
        F: FnOnce(Tx<'a>) -> Fut,
        Fut: Future<Output = (Tx<'a>, StoreResult<T>)>,
    {
        let tx = Self::begin(pool).await?;
        let (mut tx, result) = f(tx).await;

        match result {
            Ok(val) => {
                tx.commit().await?;
                Ok(val)
            }
            Err(e) => {
                tracing::trace!(error = ?e, "transacted query failure");
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = ?rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(pool))]
    pub async fn begin(pool: &'static Pool<Postgres>) -> StoreResult<Self> {
        let inner = pool.begin().await?;
        Ok(Self { inner: Some(inner) })
    }

    #[instrument(skip(self))]
    pub async fn commit(&mut self) -> StoreResult<()> {
        match self.inner.take() {
            Some(tx) => Ok(tx.commit().await?),
            None => Err(completed()),
        }
    }

    #[instrument(skip(self))]
    pub async fn rollback(&mut self) -> StoreResult<()> {
        match self.inner.take() {
            Some(tx) => Ok(tx.rollback().await?),
            None => Err(completed()),
        }
    }

    fn inner_mut(&mut self) -> StoreResult<&mut Transaction<'a, Postgres>> {
        self.inner.as_mut().ok_or_else(completed)
    }

    /// Fails with [`StoreError::Duplicate`] when the user already holds a record for the event.
    #[instrument(skip(self, record), fields(event_id = %record.event_id, user_id = %record.user_id))]
    pub async fn insert_attendance(&mut self, record: &AttendanceRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO attendance (
                id,
                event_id,
                user_id,
                attended_at,
                latitude,
                longitude,
                within_geofence,
                token_used,
                points_awarded,
                verification_status,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            "#,
        )
        .bind(record.id)
        .bind(record.event_id)
        .bind(record.user_id)
        .bind(record.attended_at)
        .bind(record.scanned_location.latitude)
        .bind(record.scanned_location.longitude)
        .bind(record.within_geofence)
        .bind(&record.token_used)
        .bind(i64::from(record.points_awarded))
        .bind(record.verification_status.as_str())
        .execute(&mut **self.inner_mut()?)
        .await?;

        Ok(())
    }

    /// Increments the user's balance in place, returning the new total
    #[instrument(skip(self))]
    pub async fn award_points(&mut self, user_id: &UserId, points: u32) -> StoreResult<i64> {
        Ok(sqlx::query_scalar::<_, i64>(sql_fragment::AWARD_POINTS)
            .bind(user_id)
            .bind(i64::from(points))
            .fetch_one(&mut **self.inner_mut()?)
            .await?)
    }
}

fn completed() -> StoreError {
    StoreError::SqlxError(sqlx::Error::Protocol(
        "Transaction already completed".into(),
    ))
}

pub mod sql_fragment {
    pub const EVENT_FIELDS: &str = r#"
        id,
        title,
        description,
        event_date,
        start_time,
        end_time,
        location_name,
        latitude,
        longitude,
        geofence_radius_km,
        status,
        attendance_token,
        attendance_token_expires_at,
        window_start,
        window_end,
        created_by,
        wet_waste_kg,
        dry_waste_kg,
        other_waste_details,
        event_summary,
        created_at,
        updated_at
    "#;

    pub const ENROLLMENT_FIELDS: &str = r#"
        event_id,
        user_id,
        enrolled_at
    "#;

    pub const ATTENDANCE_FIELDS: &str = r#"
        id,
        event_id,
        user_id,
        attended_at,
        latitude,
        longitude,
        within_geofence,
        token_used,
        points_awarded,
        verification_status
    "#;

    /// `$1` user id, `$2` non-negative increment
    pub const AWARD_POINTS: &str = r#"
        INSERT INTO user_points (
            user_id,
            points,
            updated_at
        )
        VALUES ($1, $2, NOW())
        ON CONFLICT (user_id)
        DO UPDATE SET
            points = user_points.points + $2,
            updated_at = NOW()
        RETURNING points
    "#;
}

/// Shared shape of the Postgres-backed repositories
pub trait Repository {
    const TABLE_NAME: &'static str;

    fn new(pool: &'static Pool<Postgres>, timeout: Duration) -> Self
    where
        Self: Sized;

    fn pool(&self) -> &'static Pool<Postgres>;

    /// Bound applied to each call via [`crate::db::timed`]
    fn timeout(&self) -> Duration;
}

/// Event rows and their rosters.
///
/// Every mutating call is conditional on the event's current status and reports whether a row was
/// actually changed; `Ok(false)` means the event is missing or no longer in an accepting status.
#[async_trait]
pub trait EventStore: Send + Sync + fmt::Debug {
    async fn insert_event(&self, event: &Event) -> StoreResult<()>;

    async fn get_event(&self, id: &EventId) -> StoreResult<Option<Event>>;

    async fn list_events(&self, filter: &EventFilter) -> StoreResult<Vec<Event>>;

    /// Writes structural fields and window (upcoming/active only). The token columns are replaced
    /// only when `token` is given.
    async fn update_event(&self, event: &Event, token: Option<&AttendanceToken>)
    -> StoreResult<bool>;

    /// Non-terminal events only
    async fn set_status(&self, id: &EventId, status: EventStatus) -> StoreResult<bool>;

    /// Upcoming/active events only
    async fn set_token(&self, id: &EventId, token: &AttendanceToken) -> StoreResult<bool>;

    /// Active/completed events only; leaves the event completed
    async fn set_summary(&self, id: &EventId, summary: &CompletionSummary) -> StoreResult<bool>;

    /// Upcoming/cancelled events only; the roster goes with it
    async fn delete_event(&self, id: &EventId) -> StoreResult<bool>;

    /// Upcoming/active events only. A repeat enrollment fails with [`StoreError::Duplicate`].
    async fn enroll(&self, id: &EventId, user_id: &UserId) -> StoreResult<bool>;

    async fn unenroll(&self, id: &EventId, user_id: &UserId) -> StoreResult<bool>;
}

#[async_trait]
pub trait AttendanceStore: Send + Sync + fmt::Debug {
    async fn attendance_exists(&self, event_id: &EventId, user_id: &UserId) -> StoreResult<bool>;

    /// Inserts `record` and credits its points in one transaction, returning the user's new
    /// balance. A second record for the same `(event_id, user_id)` fails with
    /// [`StoreError::Duplicate`] and leaves no trace.
    async fn commit_attendance(&self, record: &AttendanceRecord) -> StoreResult<i64>;

    async fn list_attendance(&self, filter: &AttendanceFilter) -> StoreResult<Vec<AttendanceRecord>>;
}

#[async_trait]
pub trait PointsLedger: Send + Sync + fmt::Debug {
    /// Atomic increment; returns the new total
    async fn award(&self, user_id: &UserId, points: u32) -> StoreResult<i64>;

    /// Zero for users who never earned points
    async fn balance(&self, user_id: &UserId) -> StoreResult<i64>;
}
