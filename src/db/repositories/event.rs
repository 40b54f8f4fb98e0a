use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use tracing::instrument;
use uuid::Uuid;

use super::{EventStore, Repository, sql_fragment};
use crate::db::models::event::{
    AttendanceToken, CompletionSummary, Enrollment, EnrollmentRow, Event, EventFilter, EventId,
    EventRow, EventStatus,
};
use crate::db::models::user::UserId;
use crate::db::{StoreError, StoreResult, timed};

#[derive(Debug)]
pub struct EventRepository {
    pool: &'static Pool<Postgres>,
    timeout: Duration,
}

impl Repository for EventRepository {
    const TABLE_NAME: &'static str = "events";

    fn new(pool: &'static Pool<Postgres>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    fn pool(&self) -> &'static Pool<Postgres> {
        self.pool
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl EventRepository {
    async fn roster(&self, id: Uuid) -> StoreResult<Vec<Enrollment>> {
        let rows = sqlx::query_as::<_, EnrollmentRow>(&format!(
            "SELECT {} FROM event_enrollments WHERE event_id = $1 ORDER BY enrolled_at ASC",
            sql_fragment::ENROLLMENT_FIELDS
        ))
        .bind(id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(Enrollment::from).collect())
    }

    async fn rosters(&self, ids: Vec<Uuid>) -> StoreResult<HashMap<Uuid, Vec<Enrollment>>> {
        let rows = sqlx::query_as::<_, EnrollmentRow>(&format!(
            "SELECT {} FROM event_enrollments WHERE event_id = ANY($1) ORDER BY enrolled_at ASC",
            sql_fragment::ENROLLMENT_FIELDS
        ))
        .bind(ids)
        .fetch_all(self.pool())
        .await?;

        let mut grouped: HashMap<Uuid, Vec<Enrollment>> = HashMap::new();
        for row in rows {
            grouped.entry(row.event_id).or_default().push(row.into());
        }

        Ok(grouped)
    }
}

#[async_trait]
impl EventStore for EventRepository {
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    async fn insert_event(&self, event: &Event) -> StoreResult<()> {
        let token = event.token.as_ref();

        timed(self.timeout(), async {
            sqlx::query(&format!(
                r#"
                INSERT INTO {} ({})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                        $17, $18, $19, $20, $21, $22)
                "#,
                Self::TABLE_NAME,
                sql_fragment::EVENT_FIELDS
            ))
            .bind(event.id)
            .bind(&event.title)
            .bind(&event.description)
            .bind(event.schedule.date)
            .bind(event.schedule.start_time)
            .bind(event.schedule.end_time)
            .bind(&event.location_name)
            .bind(event.location.latitude)
            .bind(event.location.longitude)
            .bind(event.geofence_radius_km)
            .bind(event.status.as_str())
            .bind(token.map(|t| t.value.as_str()))
            .bind(token.map(|t| t.expires_at))
            .bind(event.window.start)
            .bind(event.window.end)
            .bind(event.created_by)
            .bind(event.summary.wet_waste_kg)
            .bind(event.summary.dry_waste_kg)
            .bind(&event.summary.other_waste_details)
            .bind(&event.summary.event_summary)
            .bind(event.created_at)
            .bind(event.updated_at)
            .execute(self.pool())
            .await
        })
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_event(&self, id: &EventId) -> StoreResult<Option<Event>> {
        timed(self.timeout(), async {
            let row = sqlx::query_as::<_, EventRow>(&format!(
                "SELECT {} FROM {} WHERE id = $1",
                sql_fragment::EVENT_FIELDS,
                Self::TABLE_NAME
            ))
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

            match row {
                Some(row) => {
                    let enrolled = self.roster(row.id).await?;
                    Ok::<_, StoreError>(Some(row.into_event(enrolled)?))
                }
                None => Ok(None),
            }
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_events(&self, filter: &EventFilter) -> StoreResult<Vec<Event>> {
        timed(self.timeout(), async {
            let rows = sqlx::query_as::<_, EventRow>(&format!(
                r#"
                SELECT {} FROM {}
                WHERE ($1::TEXT IS NULL OR status = $1)
                AND ($2::UUID IS NULL OR created_by = $2)
                ORDER BY event_date ASC, start_time ASC, created_at ASC
                "#,
                sql_fragment::EVENT_FIELDS,
                Self::TABLE_NAME
            ))
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.created_by)
            .fetch_all(self.pool())
            .await?;

            let mut rosters = self.rosters(rows.iter().map(|r| r.id).collect()).await?;

            rows.into_iter()
                .map(|row| {
                    let enrolled = rosters.remove(&row.id).unwrap_or_default();
                    row.into_event(enrolled)
                })
                .collect::<StoreResult<Vec<_>>>()
        })
        .await
    }

    #[instrument(skip(self, event, token), fields(event_id = %event.id, rotated = token.is_some()))]
    async fn update_event(
        &self,
        event: &Event,
        token: Option<&AttendanceToken>,
    ) -> StoreResult<bool> {
        let result = timed(
            self.timeout(),
            sqlx::query(
                r#"
                UPDATE events
                SET title = $2,
                    description = $3,
                    event_date = $4,
                    start_time = $5,
                    end_time = $6,
                    location_name = $7,
                    latitude = $8,
                    longitude = $9,
                    geofence_radius_km = $10,
                    window_start = $11,
                    window_end = $12,
                    attendance_token = COALESCE($13, attendance_token),
                    attendance_token_expires_at = COALESCE($14, attendance_token_expires_at),
                    updated_at = NOW()
                WHERE id = $1
                AND status IN ('upcoming', 'active')
                "#,
            )
            .bind(event.id)
            .bind(&event.title)
            .bind(&event.description)
            .bind(event.schedule.date)
            .bind(event.schedule.start_time)
            .bind(event.schedule.end_time)
            .bind(&event.location_name)
            .bind(event.location.latitude)
            .bind(event.location.longitude)
            .bind(event.geofence_radius_km)
            .bind(event.window.start)
            .bind(event.window.end)
            .bind(token.map(|t| t.value.as_str()))
            .bind(token.map(|t| t.expires_at))
            .execute(self.pool()),
        )
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn set_status(&self, id: &EventId, status: EventStatus) -> StoreResult<bool> {
        let result = timed(
            self.timeout(),
            sqlx::query(
                r#"
                UPDATE events
                SET status = $2,
                    updated_at = NOW()
                WHERE id = $1
                AND status IN ('upcoming', 'active')
                "#,
            )
            .bind(id)
            .bind(status.as_str())
            .execute(self.pool()),
        )
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, token))]
    async fn set_token(&self, id: &EventId, token: &AttendanceToken) -> StoreResult<bool> {
        let result = timed(
            self.timeout(),
            sqlx::query(
                r#"
                UPDATE events
                SET attendance_token = $2,
                    attendance_token_expires_at = $3,
                    updated_at = NOW()
                WHERE id = $1
                AND status IN ('upcoming', 'active')
                "#,
            )
            .bind(id)
            .bind(&token.value)
            .bind(token.expires_at)
            .execute(self.pool()),
        )
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, summary))]
    async fn set_summary(&self, id: &EventId, summary: &CompletionSummary) -> StoreResult<bool> {
        let result = timed(
            self.timeout(),
            sqlx::query(
                r#"
                UPDATE events
                SET wet_waste_kg = $2,
                    dry_waste_kg = $3,
                    other_waste_details = $4,
                    event_summary = $5,
                    status = 'completed',
                    updated_at = NOW()
                WHERE id = $1
                AND status IN ('active', 'completed')
                "#,
            )
            .bind(id)
            .bind(summary.wet_waste_kg)
            .bind(summary.dry_waste_kg)
            .bind(&summary.other_waste_details)
            .bind(&summary.event_summary)
            .execute(self.pool()),
        )
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn delete_event(&self, id: &EventId) -> StoreResult<bool> {
        let result = timed(
            self.timeout(),
            sqlx::query(
                r#"
                DELETE FROM events
                WHERE id = $1
                AND status IN ('upcoming', 'cancelled')
                "#,
            )
            .bind(id)
            .execute(self.pool()),
        )
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn enroll(&self, id: &EventId, user_id: &UserId) -> StoreResult<bool> {
        let result = timed(
            self.timeout(),
            sqlx::query(
                r#"
                INSERT INTO event_enrollments (event_id, user_id, enrolled_at)
                SELECT id, $2, NOW() FROM events
                WHERE id = $1
                AND status IN ('upcoming', 'active')
                "#,
            )
            .bind(id)
            .bind(user_id)
            .execute(self.pool()),
        )
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn unenroll(&self, id: &EventId, user_id: &UserId) -> StoreResult<bool> {
        let result = timed(
            self.timeout(),
            sqlx::query("DELETE FROM event_enrollments WHERE event_id = $1 AND user_id = $2")
                .bind(id)
                .bind(user_id)
                .execute(self.pool()),
        )
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
