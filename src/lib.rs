pub mod certification;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod gate;
pub mod locks;
pub mod models;
pub mod routes;
pub mod scoring;
pub mod session;
pub mod store;
pub mod sweeper;
pub mod tracker;

use axum::{extract::DefaultBodyLimit, Router};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub use engine::{Actor, Engine};

/// Full HTTP app: engine routes plus the shared layers.
pub fn app(engine: Engine) -> Router {
    routes::router(engine)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
                .layer(DefaultBodyLimit::max(64 * 1024)),
        )
}
