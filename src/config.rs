use anyhow::{bail, Context, Result};
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub backend: StoreBackend,
    /// Required for the Postgres backend.
    pub database: Option<DatabaseConfig>,
    /// Course content for the memory backend.
    pub catalog_path: Option<PathBuf>,
    /// `None` disables the expiry sweeper.
    pub sweep_interval: Option<Duration>,
    pub log_filter: String,
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse {key}: {e}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = parsed("SERVER_HOST", IpAddr::from([0, 0, 0, 0]))?;
        let port = parsed("PORT", 8081u16)?;

        let backend = match env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "postgres".into())
            .to_lowercase()
            .as_str()
        {
            "postgres" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            other => bail!("Unknown STORE_BACKEND: {other}"),
        };

        let database = match backend {
            StoreBackend::Postgres => Some(DatabaseConfig {
                url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
                max_connections: parsed("DATABASE_MAX_CONNECTIONS", 10u32)?,
            }),
            StoreBackend::Memory => None,
        };

        let sweep_secs = parsed("EXPIRY_SWEEP_SECS", 30u64)?;
        let sweep_interval = (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs));

        Ok(Config {
            host,
            port,
            backend,
            database,
            catalog_path: env::var("CATALOG_PATH").ok().map(PathBuf::from),
            sweep_interval,
            log_filter: env::var("RUST_LOG")
                .unwrap_or_else(|_| "course_progress_engine=info,tower_http=info".into()),
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}
