//! Operator broadcast endpoints.

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::info;

use oc_protocol::{BroadcastConfig, BroadcastSave, broadcast_key_prefix};

use super::AppState;
use super::response::{bad_request, internal_error, unauthorized};
use crate::auth::{TokenClaims, extract_bearer, validate_token};
use crate::store::{ConfigStore, EntityStore, StoreError};

/// Resolve and check the bearer token carried by a request.
pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<TokenClaims, Response> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .ok_or_else(|| unauthorized("missing bearer token"))?
        .to_owned();
    let store = state.store.clone();
    let claims = tokio::task::spawn_blocking(move || validate_token(store.as_ref(), &raw))
        .await
        .map_err(internal_error)?;
    claims.ok_or_else(|| unauthorized("unknown or revoked token"))
}

/// `PUT /broadcast/save`: merge the operator-editable projection into the
/// record.  Controller-owned machinery (derived flags, state tags/data,
/// counters, spilled events) is never overwritten.
pub async fn save_broadcast(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(save): Json<BroadcastSave>,
) -> Response {
    let claims = match authenticate(&state, &headers).await {
        Ok(claims) => claims,
        Err(resp) => return resp,
    };
    if claims.skey != save.skey {
        return unauthorized("token not scoped to this site");
    }
    if save.name.trim().is_empty() {
        return bad_request("broadcast name must not be empty");
    }
    if save.end <= save.start {
        return bad_request("broadcast end must be after start");
    }

    let store = state.store.clone();
    let result = tokio::task::spawn_blocking(move || {
        let fresh_uuid = uuid::Uuid::new_v4().to_string();
        let config_store = ConfigStore::new(store, save.skey, save.name.clone());
        config_store.save(&|cfg| {
            let existing_uuid = cfg.uuid.clone();
            save.merge_into(cfg);
            // A record keeps its identity across saves; brand-new records
            // are minted one.
            cfg.uuid = save
                .uuid
                .clone()
                .or(existing_uuid)
                .or_else(|| Some(fresh_uuid.clone()));
        })
    })
    .await;
    match result {
        Ok(Ok(post)) => {
            info!(site = post.skey, broadcast = %post.name, "broadcast saved");
            (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response()
        }
        Ok(Err(e)) => internal_error(e),
        Err(e) => internal_error(e),
    }
}

/// `GET /broadcasts`: the site's configs, derived flags included, for UI
/// rendering.
pub async fn list_broadcasts(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let claims = match authenticate(&state, &headers).await {
        Ok(claims) => claims,
        Err(resp) => return resp,
    };
    let store = state.store.clone();
    let result = tokio::task::spawn_blocking(
        move || -> Result<Vec<BroadcastConfig>, StoreError> {
            let keys = store.list_keys(&broadcast_key_prefix(claims.skey))?;
            let mut configs = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(json) = store.get(&key)? {
                    if let Ok(cfg) = serde_json::from_str(&json) {
                        configs.push(cfg);
                    }
                }
            }
            Ok(configs)
        },
    )
    .await;
    match result {
        Ok(Ok(configs)) => Json(configs).into_response(),
        Ok(Err(e)) => internal_error(e),
        Err(e) => internal_error(e),
    }
}
