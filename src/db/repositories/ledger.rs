use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use tracing::instrument;

use super::{PointsLedger, Repository, Tx};
use crate::db::models::user::UserId;
use crate::db::{StoreResult, timed};

/// Per-user point totals; only ever incremented
#[derive(Debug)]
pub struct LedgerRepository {
    pool: &'static Pool<Postgres>,
    timeout: Duration,
}

impl Repository for LedgerRepository {
    const TABLE_NAME: &'static str = "user_points";

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
impl PointsLedger for LedgerRepository {
    /// Same increment `commit_attendance` runs inside its transaction
    #[instrument(skip(self))]
    async fn award(&self, user_id: &UserId, points: u32) -> StoreResult<i64> {
        let total = timed(
            self.timeout(),
            Tx::with_tx(self.pool(), |mut tx| async move {
                let result = tx.award_points(user_id, points).await;
                (tx, result)
            }),
        )
        .await?;

        tracing::debug!(total, "points awarded");
        Ok(total)
    }

    #[instrument(skip(self))]
    async fn balance(&self, user_id: &UserId) -> StoreResult<i64> {
        let points = timed(
            self.timeout(),
            sqlx::query_scalar::<_, i64>(&format!(
                "SELECT points FROM {} WHERE user_id = $1",
                Self::TABLE_NAME
            ))
            .bind(user_id)
            .fetch_optional(self.pool()),
        )
        .await?;

        Ok(points.unwrap_or(0))
    }
}
