use std::sync::LazyLock;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::instrument;

#[cfg(test)]
pub mod memory;
pub mod models;
pub mod repositories;

pub mod prelude {
    pub use crate::db::db_pool;
    pub use crate::db::{StoreError, StoreResult};

    pub use crate::db::models::attendance::{
        AttendanceFilter, AttendanceRecord, VerificationStatus,
    };
    pub use crate::db::models::event::{
        AttendanceToken, AttendanceWindow, CompletionSummary, Enrollment, Event, EventFilter,
        EventId, EventStatus, Schedule,
    };
    pub use crate::db::models::user::{PointBalance, Principal, Role, UserId};

    pub use crate::db::repositories::Tx;
    pub use crate::db::repositories::attendance::AttendanceRepository;
    pub use crate::db::repositories::event::EventRepository;
    pub use crate::db::repositories::ledger::LedgerRepository;
    pub use crate::db::repositories::{AttendanceStore, EventStore, PointsLedger, Repository};
}

static DB_POOL: LazyLock<OnceCell<Db>> = LazyLock::new(OnceCell::new);
pub async fn db_pool(database_url: &str, acquire_timeout: Duration) -> StoreResult<&'static PgPool> {
    Ok(&DB_POOL
        .get_or_try_init(|| async move { Db::new_pool(database_url, acquire_timeout).await })
        .await?
        .pool)
}

struct Db {
    pool: PgPool,
}

impl Db {
    pub async fn new_pool(db_url: &str, acquire_timeout: Duration) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .acquire_timeout(acquire_timeout)
            .connect(db_url)
            .await?;

        Ok(Self { pool })
    }
}

#[instrument(skip(pool))]
pub async fn migrate(pool: &PgPool) -> StoreResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("database migrations applied");

    Ok(())
}

/// Bounds a storage call by `limit`; an elapsed call surfaces as the transient
/// [`StoreError::Timeout`] rather than hanging the request.
pub async fn timed<T, E, F>(limit: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<StoreError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => {
            tracing::warn!(?limit, "storage call timed out");
            Err(StoreError::Timeout(limit))
        }
    }
}

pub type StoreResult<T> = core::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage call did not complete within {0:?}")]
    Timeout(Duration),

    #[error("uniqueness constraint violated ({0})")]
    Duplicate(String),

    #[error("stored row could not be decoded: {0}")]
    Corrupt(String),

    #[error(transparent)]
    MigrateError(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    SqlxError(sqlx::Error),
}

impl StoreError {
    /// Whether retrying the same call later could succeed without any other state changing
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Timeout(_) => true,
            StoreError::SqlxError(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &value {
            if db_err.is_unique_violation() {
                let constraint = db_err.constraint().unwrap_or("unknown").to_string();
                return StoreError::Duplicate(constraint);
            }
        }

        StoreError::SqlxError(value)
    }
}
