use cleanup_attendance::api::server::{RouteError, start_server};
use cleanup_attendance::db::{StoreError, db_pool, migrate};
use cleanup_attendance::util::env::{self, EnvErr};
use cleanup_attendance::util::telemetry;
use futures::future::join_all;
use thiserror::Error;

#[derive(Debug, Error)]
enum RunnerErr {
    #[error(transparent)]
    Env(#[from] EnvErr),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Std(#[from] Box<dyn std::error::Error>),
}

type Result<T> = core::result::Result<T, RunnerErr>;

#[tokio::main]
async fn main() -> Result<()> {
    let config = env::config().await?;
    let telemetry_registry = telemetry::Telemetry::new(config)?.register();

    tracing::info!("starting main application");

    let pool = db_pool(&config.database_url, config.store_timeout).await?;
    migrate(pool).await?;

    let handles = start_server(config, pool).await?;
    _ = join_all(handles).await;

    telemetry_registry.shutdown();
    Ok(())
}
