//! Webhook receiver: authenticates inbound provider requests and routes the
//! typed events to the portal engine.
//!
//! Responses are immediate: 204 once the event is handed off, 400 for a
//! missing signature or malformed body, 401 for a bad signature. The
//! provider does not wait for Matrix delivery to complete.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use tracing::{debug, error, info};
use url::{form_urlencoded, Url};

use super::events::{MessageEvent, StatusEvent};
use super::signature::{RequestBody, RequestValidator};
use super::ProviderError;
use crate::portal::PortalEngine;

/// Header carrying the provider's request signature.
pub const SIGNATURE_HEADER: &str = "X-Provider-Signature";

/// Shared state of the webhook endpoints.
#[derive(Clone)]
pub struct WebhookState {
    /// Portal engine events are routed to.
    pub engine: Arc<PortalEngine>,
    /// Validator holding the shared provider secret.
    pub validator: Arc<RequestValidator>,
    /// Externally visible base URL the provider signed against.
    pub public_base: Url,
}

/// Build the webhook router.
pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/receive", post(receive))
        .route("/status", post(status))
        .with_state(state)
}

/// Run the bridge's HTTP listener until the process exits.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(app: Router, address: &str, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind((address, port)).await?;
    info!(address, port, "listener started");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Authenticate a request and parse its form body.
fn authenticate(
    state: &WebhookState,
    headers: &HeaderMap,
    uri: &Uri,
    body: &Bytes,
) -> Result<Vec<(String, String)>, ProviderError> {
    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return Err(ProviderError::MissingSignature);
    };
    let form: Vec<(String, String)> = form_urlencoded::parse(body).into_owned().collect();
    let url = request_url(&state.public_base, uri);
    if !state
        .validator
        .validate(&url, &RequestBody::Form(&form), signature)
    {
        return Err(ProviderError::InvalidSignature);
    }
    Ok(form)
}

/// Map a provider error to the webhook's wire response.
fn error_response(e: &ProviderError) -> Response {
    let status = match e {
        ProviderError::MissingSignature | ProviderError::MalformedEvent(_) => {
            StatusCode::BAD_REQUEST
        }
        ProviderError::InvalidSignature => StatusCode::UNAUTHORIZED,
        ProviderError::Http(_) | ProviderError::SendFailed(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string()).into_response()
}

/// Reassemble the URL the provider signed: configured public base plus the
/// request's path and query.
fn request_url(public_base: &Url, uri: &Uri) -> Url {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let joined = format!(
        "{}{path_and_query}",
        public_base.as_str().trim_end_matches('/')
    );
    // A base that does not reparse with the path appended cannot have been
    // signed; validation will reject the request.
    Url::parse(&joined).unwrap_or_else(|_| public_base.clone())
}

async fn receive(
    State(state): State<WebhookState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let form = match authenticate(&state, &headers, &uri, &body) {
        Ok(form) => form,
        Err(e) => return error_response(&e),
    };
    let event = match MessageEvent::from_form(&form) {
        Ok(event) => event,
        Err(e) => return error_response(&e),
    };
    debug!(id = %event.id, sender = %event.sender, "received provider message event");

    let engine = Arc::clone(&state.engine);
    tokio::spawn(async move {
        if let Err(e) = engine.handle_remote_message(&event).await {
            error!(id = %event.id, error = %e, "failed to relay inbound message");
        }
    });
    StatusCode::NO_CONTENT.into_response()
}

async fn status(
    State(state): State<WebhookState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let form = match authenticate(&state, &headers, &uri, &body) {
        Ok(form) => form,
        Err(e) => return error_response(&e),
    };
    let event = match StatusEvent::from_form(&form) {
        Ok(event) => event,
        Err(e) => return error_response(&e),
    };
    debug!(id = %event.id, status = ?event.status, "received provider status event");

    let engine = Arc::clone(&state.engine);
    tokio::spawn(async move {
        if let Err(e) = engine.handle_remote_status(&event).await {
            error!(id = %event.id, error = %e, "failed to apply delivery status");
        }
    });
    StatusCode::NO_CONTENT.into_response()
}
