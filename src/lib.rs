pub mod attempt;
pub mod auth;
pub mod collaborators;
pub mod config;
pub mod db;
pub mod error;
pub mod gradebook;
pub mod models;
pub mod progress;
pub mod quiz;
pub mod response;
pub mod routes;
pub mod services;
pub mod store;
pub mod sweep;

use axum::{extract::DefaultBodyLimit, routing::get, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::response::ok;
use crate::services::Engine;

/// The full HTTP application, ready to be served.
pub fn app(engine: Engine) -> Router {
    Router::new()
        .route("/health", get(|| async { ok("ok", "healthy") }))
        .merge(routes::router(engine))
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}
