//! HTTP relay that stores each room's signaling log and serves it back to
//! polling peers.

pub mod config;
pub mod handlers;

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use tidepool_proto::RoomLogs;

pub use config::Config;
pub use handlers::SharedRooms;

pub fn router(rooms: SharedRooms) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/rooms/:room/signals",
            get(handlers::list_signals).post(handlers::append_signal),
        )
        .with_state(rooms)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub fn shared_rooms(config: &Config) -> SharedRooms {
    Arc::new(RoomLogs::new(config.retention))
}
