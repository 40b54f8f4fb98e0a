use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use tracing::instrument;

use super::{AttendanceStore, Repository, Tx, sql_fragment};
use crate::db::models::attendance::{AttendanceFilter, AttendanceRecord, AttendanceRow};
use crate::db::models::event::EventId;
use crate::db::models::user::UserId;
use crate::db::{StoreResult, timed};

#[derive(Debug)]
pub struct AttendanceRepository {
    pool: &'static Pool<Postgres>,
    timeout: Duration,
}

impl Repository for AttendanceRepository {
    const TABLE_NAME: &'static str = "attendance";

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

#[async_trait]
impl AttendanceStore for AttendanceRepository {
    #[instrument(skip(self))]
    async fn attendance_exists(&self, event_id: &EventId, user_id: &UserId) -> StoreResult<bool> {
        timed(
            self.timeout(),
            sqlx::query_scalar::<_, bool>(&format!(
                "SELECT EXISTS (SELECT 1 FROM {} WHERE event_id = $1 AND user_id = $2)",
                Self::TABLE_NAME
            ))
            .bind(event_id)
            .bind(user_id)
            .fetch_one(self.pool()),
        )
        .await
    }

    #[instrument(skip(self, record), fields(event_id = %record.event_id, user_id = %record.user_id))]
    async fn commit_attendance(&self, record: &AttendanceRecord) -> StoreResult<i64> {
        let points = record.points_awarded;

        // dropping the transaction on timeout rolls it back
        let balance = timed(
            self.timeout(),
            Tx::with_tx(self.pool(), |mut tx| async move {
                let result = async {
                    tx.insert_attendance(record).await?;
                    tx.award_points(&record.user_id, points).await
                }
                .await;

                (tx, result)
            }),
        )
        .await?;

        tracing::info!(points, balance, "attendance committed");
        Ok(balance)
    }

    #[instrument(skip(self))]
    async fn list_attendance(&self, filter: &AttendanceFilter) -> StoreResult<Vec<AttendanceRecord>> {
        let rows = timed(
            self.timeout(),
            sqlx::query_as::<_, AttendanceRow>(&format!(
                r#"
                SELECT {} FROM {}
                WHERE ($1::UUID IS NULL OR event_id = $1)
                AND ($2::UUID IS NULL OR user_id = $2)
                AND ($3::TEXT IS NULL OR verification_status = $3)
                ORDER BY attended_at DESC
                "#,
                sql_fragment::ATTENDANCE_FIELDS,
                Self::TABLE_NAME
            ))
            .bind(filter.event_id)
            .bind(filter.user_id)
            .bind(filter.verification_status.map(|s| s.as_str()))
            .fetch_all(self.pool()),
        )
        .await?;

        rows.into_iter().map(AttendanceRecord::try_from).collect()
    }
}
