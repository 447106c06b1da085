use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};

use crate::config::DatabaseConfig;

pub type Db = Pool<Postgres>;

pub async fn connect(cfg: &DatabaseConfig) -> Result<Db> {
    let pool = PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .connect(&cfg.url)
        .await
        .context("connecting to DATABASE_URL")?;
    // crate-relative path for sqlx migrations
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("running migrations")?;
    Ok(pool)
}
