//! Outbound (Matrix → provider) relay tests.

use std::sync::Arc;

use matrix_sms_bridge::matrix::{MediaKind, MessageContent};
use matrix_sms_bridge::portal::{EngineSettings, PortalEngine};
use matrix_sms_bridge::store::Store;

use crate::mock::{engine_with, message_event, test_settings, MockMatrix, MockProvider, REMOTE};

const ROOM: &str = "!room0:example.com";
const SENDER: &str = "@alice:example.com";

/// Engine with a materialized portal for [`REMOTE`] in [`ROOM`].
async fn bridged_engine(
    settings: EngineSettings,
) -> (PortalEngine, Store, Arc<MockMatrix>, Arc<MockProvider>) {
    let matrix = MockMatrix::new();
    let provider = MockProvider::new();
    let (engine, store) =
        engine_with(Arc::clone(&matrix), Arc::clone(&provider), settings).await;
    engine
        .handle_remote_message(&message_event("SM1", "open the room", None))
        .await
        .expect("relay succeeds");
    (engine, store, matrix, provider)
}

fn text(body: &str, html: Option<&str>) -> MessageContent {
    MessageContent::Text {
        body: body.to_owned(),
        html: html.map(str::to_owned),
    }
}

#[tokio::test]
async fn text_is_sent_to_the_remote_and_correlated() {
    let (engine, store, _matrix, provider) = bridged_engine(test_settings()).await;

    engine
        .handle_matrix_message(ROOM, SENDER, "$local1", &text("hello", None))
        .await
        .expect("relay succeeds");

    let sends = provider.sends().await;
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].to, REMOTE);
    assert_eq!(sends[0].body.as_deref(), Some("hello"));
    assert!(sends[0].media_url.is_none());

    let message = store
        .message_by_matrix("$local1", ROOM)
        .await
        .expect("store reads")
        .expect("message correlated");
    assert_eq!(message.remote_id, "SMout0");
    assert_eq!(message.remote_receiver, REMOTE);
}

#[tokio::test]
async fn formatted_body_is_flattened_to_the_remote_dialect() {
    let (engine, _store, _matrix, provider) = bridged_engine(test_settings()).await;

    engine
        .handle_matrix_message(
            ROOM,
            SENDER,
            "$local1",
            &text("hi there", Some("<strong>hi</strong> there")),
        )
        .await
        .expect("relay succeeds");

    assert_eq!(provider.sends().await[0].body.as_deref(), Some("*hi* there"));
}

#[tokio::test]
async fn message_template_substitutes_the_sender() {
    let mut settings = test_settings();
    settings.message_template = "{displayname}: {message}".to_owned();
    let (engine, _store, matrix, provider) = bridged_engine(settings).await;
    *matrix.displayname.lock().expect("displayname mutex") = Some("Alice".to_owned());

    engine
        .handle_matrix_message(ROOM, SENDER, "$local1", &text("hello", None))
        .await
        .expect("relay succeeds");

    assert_eq!(
        provider.sends().await[0].body.as_deref(),
        Some("Alice: hello")
    );
}

#[tokio::test]
async fn template_falls_back_to_the_mxid_without_a_displayname() {
    let mut settings = test_settings();
    settings.message_template = "{displayname} ({localpart}): {message}".to_owned();
    let (engine, _store, _matrix, provider) = bridged_engine(settings).await;

    engine
        .handle_matrix_message(ROOM, SENDER, "$local1", &text("hello", None))
        .await
        .expect("relay succeeds");

    assert_eq!(
        provider.sends().await[0].body.as_deref(),
        Some("@alice:example.com (alice): hello")
    );
}

#[tokio::test]
async fn media_is_sent_as_a_public_url_without_a_body() {
    let (engine, store, _matrix, provider) = bridged_engine(test_settings()).await;

    engine
        .handle_matrix_message(
            ROOM,
            SENDER,
            "$local1",
            &MessageContent::Media {
                kind: MediaKind::Image,
                mxc: "mxc://example.com/abc".to_owned(),
            },
        )
        .await
        .expect("relay succeeds");

    let sends = provider.sends().await;
    assert_eq!(sends.len(), 1);
    assert!(sends[0].body.is_none());
    assert_eq!(
        sends[0].media_url.as_deref(),
        Some("https://matrix.example.com/_matrix/media/r0/download/example.com/abc")
    );
    assert!(store
        .message_by_matrix("$local1", ROOM)
        .await
        .expect("store reads")
        .is_some());
}

#[tokio::test]
async fn notices_are_dropped_unless_enabled() {
    let notice = MessageContent::Notice {
        body: "a notice".to_owned(),
        html: None,
    };

    let (engine, store, _matrix, provider) = bridged_engine(test_settings()).await;
    engine
        .handle_matrix_message(ROOM, SENDER, "$local1", &notice)
        .await
        .expect("drop is not an error");
    assert!(provider.sends().await.is_empty());
    assert!(store
        .message_by_matrix("$local1", ROOM)
        .await
        .expect("store reads")
        .is_none());

    let mut settings = test_settings();
    settings.bridge_notices = true;
    let (engine, _store, _matrix, provider) = bridged_engine(settings).await;
    engine
        .handle_matrix_message(ROOM, SENDER, "$local1", &notice)
        .await
        .expect("relay succeeds");
    assert_eq!(provider.sends().await[0].body.as_deref(), Some("a notice"));
}

#[tokio::test]
async fn unsupported_message_kinds_are_dropped() {
    let (engine, store, _matrix, provider) = bridged_engine(test_settings()).await;

    engine
        .handle_matrix_message(
            ROOM,
            SENDER,
            "$local1",
            &MessageContent::Other {
                msgtype: "m.location".to_owned(),
            },
        )
        .await
        .expect("drop is not an error");

    assert!(provider.sends().await.is_empty());
    assert!(store
        .message_by_matrix("$local1", ROOM)
        .await
        .expect("store reads")
        .is_none());
}

#[tokio::test]
async fn messages_in_unbridged_rooms_are_ignored() {
    let (engine, _store, _matrix, provider) = bridged_engine(test_settings()).await;

    engine
        .handle_matrix_message("!elsewhere:example.com", SENDER, "$local1", &text("hi", None))
        .await
        .expect("drop is not an error");

    assert!(provider.sends().await.is_empty());
}
