use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use course_progress_engine::{
    app,
    config::{Config, StoreBackend},
    db,
    store::{MemoryStore, PgStore, Store},
    sweeper, Engine,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store: Arc<dyn Store> = match (config.backend, &config.database) {
        (StoreBackend::Postgres, Some(database)) => {
            let pool = db::connect(database).await?;
            Arc::new(PgStore::new(pool))
        }
        (StoreBackend::Postgres, None) => anyhow::bail!("postgres backend without database config"),
        (StoreBackend::Memory, _) => match &config.catalog_path {
            Some(path) => Arc::new(MemoryStore::load_catalog(path).await?),
            None => {
                tracing::warn!("memory backend without CATALOG_PATH, no courses available");
                Arc::new(MemoryStore::new())
            }
        },
    };

    let engine = Engine::new(store);
    if let Some(every) = config.sweep_interval {
        sweeper::spawn(engine.clone(), every);
    }

    let addr = config.server_addr();
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on http://{}", addr);

    axum::serve(listener, app(engine)).await?;
    Ok(())
}
