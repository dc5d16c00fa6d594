//! Appservice transaction listener: the homeserver's push channel for
//! Matrix events.
//!
//! The homeserver PUTs event batches to
//! `/_matrix/app/v1/transactions/{txnId}`, authenticated with the
//! homeserver token. Message events from users outside the bridge's own
//! namespace are handed to the portal engine; everything else is ignored.
//! Transactions are acknowledged immediately and deduplicated by id, so a
//! homeserver retry cannot relay a message twice.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::put;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error};

use super::MessageContent;
use crate::portal::PortalEngine;

/// Shared state of the transaction endpoint.
#[derive(Clone)]
pub struct AppserviceState {
    /// Portal engine Matrix messages are routed to.
    pub engine: Arc<PortalEngine>,
    /// Token the homeserver authenticates with.
    pub hs_token: String,
    // Ids of transactions already processed this process lifetime.
    seen: Arc<Mutex<HashSet<String>>>,
}

impl AppserviceState {
    /// Create the endpoint state.
    pub fn new(engine: Arc<PortalEngine>, hs_token: String) -> Self {
        Self {
            engine,
            hs_token,
            seen: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    access_token: Option<String>,
}

/// One pushed transaction: an ordered batch of events.
#[derive(Deserialize)]
struct Transaction {
    #[serde(default)]
    events: Vec<serde_json::Value>,
}

/// Build the appservice router.
pub fn router(state: AppserviceState) -> Router {
    Router::new()
        .route("/_matrix/app/v1/transactions/{txn_id}", put(transactions))
        .with_state(state)
}

/// The homeserver's token, from the `Authorization` header or the legacy
/// `access_token` query parameter.
fn token_from(headers: &HeaderMap, query: &TokenQuery) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_owned)
        .or_else(|| query.access_token.clone())
}

async fn transactions(
    State(state): State<AppserviceState>,
    Path(txn_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(txn): Json<Transaction>,
) -> Response {
    let Some(token) = token_from(&headers, &query) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "errcode": "M_MISSING_TOKEN" })),
        )
            .into_response();
    };
    if token != state.hs_token {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "errcode": "M_FORBIDDEN" })),
        )
            .into_response();
    }

    if !state.seen.lock().await.insert(txn_id.clone()) {
        debug!(txn_id, "duplicate transaction acknowledged");
        return Json(json!({})).into_response();
    }
    debug!(txn_id, events = txn.events.len(), "transaction received");

    for event in txn.events {
        dispatch(&state.engine, &event);
    }
    Json(json!({})).into_response()
}

/// Hand one pushed event to the engine, if it is a relayable message.
fn dispatch(engine: &Arc<PortalEngine>, event: &serde_json::Value) {
    if event.get("type").and_then(|v| v.as_str()) != Some("m.room.message") {
        return;
    }
    let (Some(room_id), Some(sender), Some(event_id)) = (
        event.get("room_id").and_then(|v| v.as_str()),
        event.get("sender").and_then(|v| v.as_str()),
        event.get("event_id").and_then(|v| v.as_str()),
    ) else {
        return;
    };
    // Events from the bot or a puppet are the bridge's own output echoed
    // back by the homeserver.
    if engine.is_bridge_user(sender) {
        return;
    }
    let content = MessageContent::parse(event.get("content").unwrap_or(&serde_json::Value::Null));

    let engine = Arc::clone(engine);
    let room_id = room_id.to_owned();
    let sender = sender.to_owned();
    let event_id = event_id.to_owned();
    tokio::spawn(async move {
        if let Err(e) = engine
            .handle_matrix_message(&room_id, &sender, &event_id, &content)
            .await
        {
            error!(event_id, error = %e, "failed to relay outbound message");
        }
    });
}
