//! The operator HTTP boundary.

pub mod broadcast;
pub mod response;
pub mod tick;

use axum::{
    Router,
    routing::{get, post, put},
};
use std::sync::Arc;

use crate::driver::TickDriver;
use crate::store::EntityStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EntityStore>,
    pub driver: Arc<TickDriver>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/broadcast/save", put(broadcast::save_broadcast))
        .route("/broadcasts", get(broadcast::list_broadcasts))
        .route("/checkbroadcasts", post(tick::check_broadcasts))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}
