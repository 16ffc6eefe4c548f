//! Reference server binary
//!
//! Wires config from the environment, the storage backend (Postgres
//! when `DATABASE_URL` is set, in-memory otherwise), the local world,
//! and the HTTP router. Applications embed [`capstan_api::router`]
//! with a runtime that carries their own workflow and step registries;
//! this binary serves the bare engine surface.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use capstan_api::{router, AppState};
use capstan_codec::{ClassRegistry, PayloadEncryption};
use capstan_engine::{LocalWorld, Runtime, StepRegistry, WorkflowRegistry};
use capstan_storage::{MemoryStorage, MemoryStreamStore, PostgresStorage, Storage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let storage: Arc<dyn Storage> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = sqlx::PgPool::connect(&url)
                .await
                .context("failed to connect to Postgres")?;
            let storage = PostgresStorage::new(pool);
            storage.migrate().await.context("migrations failed")?;
            info!("using PostgreSQL storage");
            Arc::new(storage)
        }
        Err(_) => {
            info!("DATABASE_URL not set; using in-memory storage");
            Arc::new(MemoryStorage::new())
        }
    };

    let mut world = LocalWorld::new(storage, Arc::new(MemoryStreamStore::new()));
    if std::env::var("WORKFLOW_ENCRYPTION_KEY").is_ok() {
        let encryption =
            PayloadEncryption::from_env().context("invalid encryption key configuration")?;
        world = world.with_encryption(encryption);
    }
    let world = Arc::new(world);

    let runtime = Runtime::new(
        world,
        WorkflowRegistry::new(),
        StepRegistry::new(),
        ClassRegistry::new(),
    );
    runtime.install();

    let app = router(AppState { runtime });

    let addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, app).await.context("server exited")?;
    Ok(())
}
