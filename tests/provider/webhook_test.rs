//! End-to-end webhook tests over the axum router.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use matrix_sms_bridge::provider::signature::RequestValidator;
use matrix_sms_bridge::provider::webhook::{router, WebhookState, SIGNATURE_HEADER};
use tower::ServiceExt as _;
use url::Url;

use crate::portal_mock::{engine_with, test_settings, Call, MockMatrix, MockProvider, REMOTE};

const SECRET: &str = "shared-secret";
const PUBLIC_BASE: &str = "https://bridge.example.com";

async fn state_with_mocks() -> (WebhookState, Arc<MockMatrix>, Arc<MockProvider>) {
    let matrix = MockMatrix::new();
    let provider = MockProvider::new();
    let (engine, _store) =
        engine_with(Arc::clone(&matrix), Arc::clone(&provider), test_settings()).await;
    let state = WebhookState {
        engine: Arc::new(engine),
        validator: Arc::new(RequestValidator::new(SECRET)),
        public_base: Url::parse(PUBLIC_BASE).expect("valid base url"),
    };
    (state, matrix, provider)
}

fn message_form() -> Vec<(String, String)> {
    [
        ("MessageSid", "SM123"),
        ("From", REMOTE),
        ("To", "whatsapp:+15550000000"),
        ("SmsStatus", "received"),
        ("Body", "hello"),
        ("NumSegments", "1"),
    ]
    .iter()
    .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
    .collect()
}

fn sign(path: &str, form: &[(String, String)]) -> String {
    let validator = RequestValidator::new(SECRET);
    let url = Url::parse(&format!("{PUBLIC_BASE}{path}")).expect("valid url");
    BASE64.encode(validator.compute(&url, form))
}

fn encode_body(form: &[(String, String)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in form {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

fn signed_request(path: &str, form: &[(String, String)]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/x-www-form-urlencoded")
        .header(SIGNATURE_HEADER, sign(path, form))
        .body(Body::from(encode_body(form)))
        .expect("request builds")
}

/// Poll the mock until the spawned relay task has delivered, or time out.
async fn wait_for_text(matrix: &MockMatrix) -> Option<Call> {
    for _ in 0..200 {
        let delivered = matrix
            .calls()
            .await
            .into_iter()
            .find(|call| matches!(call, Call::Text { .. }));
        if delivered.is_some() {
            return delivered;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    None
}

#[tokio::test]
async fn missing_signature_is_rejected_with_400() {
    let (state, _matrix, _provider) = state_with_mocks().await;
    let request = Request::builder()
        .method("POST")
        .uri("/receive")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(encode_body(&message_form())))
        .expect("request builds");
    let response = router(state).oneshot(request).await.expect("router responds");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invalid_signature_is_rejected_with_401() {
    let (state, matrix, _provider) = state_with_mocks().await;
    let form = message_form();
    let request = Request::builder()
        .method("POST")
        .uri("/receive")
        .header("content-type", "application/x-www-form-urlencoded")
        .header(SIGNATURE_HEADER, BASE64.encode(b"wrong signature"))
        .body(Body::from(encode_body(&form)))
        .expect("request builds");
    let response = router(state).oneshot(request).await.expect("router responds");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(matrix.calls().await.is_empty());
}

#[tokio::test]
async fn signed_message_is_accepted_and_relayed() {
    let (state, matrix, _provider) = state_with_mocks().await;
    let form = message_form();
    let response = router(state)
        .oneshot(signed_request("/receive", &form))
        .await
        .expect("router responds");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let delivered = wait_for_text(&matrix).await.expect("message relayed");
    let Call::Text { body, .. } = delivered else {
        panic!("expected a text delivery");
    };
    assert_eq!(body, "hello");
}

#[tokio::test]
async fn signed_but_malformed_event_is_rejected_with_400() {
    let (state, _matrix, _provider) = state_with_mocks().await;
    // Valid signature over a body that lacks MessageSid.
    let form: Vec<(String, String)> = [("From", REMOTE)]
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    let response = router(state)
        .oneshot(signed_request("/receive", &form))
        .await
        .expect("router responds");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn status_endpoint_accepts_signed_events() {
    let (state, _matrix, _provider) = state_with_mocks().await;
    let form: Vec<(String, String)> = [
        ("MessageSid", "SMout0"),
        ("From", "whatsapp:+15550000000"),
        ("To", REMOTE),
        ("SmsStatus", "delivered"),
        ("EventType", "DELIVERED"),
    ]
    .iter()
    .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
    .collect();
    let response = router(state)
        .oneshot(signed_request("/status", &form))
        .await
        .expect("router responds");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}
