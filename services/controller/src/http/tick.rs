//! The per-site tick trigger.

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::debug;

use super::AppState;
use super::broadcast::authenticate;
use super::response::internal_error;

/// `POST /checkbroadcasts`: run the tick driver for the authenticated
/// token's site.  The sweep runs on a blocking thread; the per-broadcast
/// scopes are cancelled as each tick returns.
pub async fn check_broadcasts(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let claims = match authenticate(&state, &headers).await {
        Ok(claims) => claims,
        Err(resp) => return resp,
    };
    debug!(site = claims.skey, "tick trigger");

    let driver = state.driver.clone();
    let result = tokio::task::spawn_blocking(move || driver.tick_site(claims.skey)).await;
    match result {
        Ok(Ok(summary)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "ok": true,
                "broadcasts": summary.broadcasts,
                "failures": summary.failures,
            })),
        )
            .into_response(),
        Ok(Err(e)) => internal_error(e),
        Err(e) => internal_error(e),
    }
}
