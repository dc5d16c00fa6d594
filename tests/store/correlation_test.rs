//! Correlation-store round trips against an in-memory database.

use matrix_sms_bridge::store::{MessageRow, PortalRow, PuppetRow, Store};

const REMOTE: &str = "whatsapp:+15551234567";
const ROOM: &str = "!abc:example.com";

#[tokio::test]
async fn portal_rows_are_found_by_both_keys() {
    let store = Store::in_memory().await.expect("store opens");
    store
        .insert_portal(&PortalRow {
            remote_id: REMOTE.to_owned(),
            room_id: None,
        })
        .await
        .expect("insert succeeds");
    store
        .set_portal_room(REMOTE, ROOM)
        .await
        .expect("update succeeds");

    let by_remote = store
        .portal_by_remote(REMOTE)
        .await
        .expect("query succeeds")
        .expect("row exists");
    assert_eq!(by_remote.room_id.as_deref(), Some(ROOM));

    let by_room = store
        .portal_by_room(ROOM)
        .await
        .expect("query succeeds")
        .expect("row exists");
    assert_eq!(by_room.remote_id, REMOTE);
}

#[tokio::test]
async fn portal_insert_is_idempotent() {
    let store = Store::in_memory().await.expect("store opens");
    store
        .insert_portal(&PortalRow {
            remote_id: REMOTE.to_owned(),
            room_id: Some(ROOM.to_owned()),
        })
        .await
        .expect("insert succeeds");
    // A later persist of the same ephemeral portal must not clear the room.
    store
        .insert_portal(&PortalRow {
            remote_id: REMOTE.to_owned(),
            room_id: None,
        })
        .await
        .expect("reinsert is ignored");

    let row = store
        .portal_by_remote(REMOTE)
        .await
        .expect("query succeeds")
        .expect("row exists");
    assert_eq!(row.room_id.as_deref(), Some(ROOM));
}

#[tokio::test]
async fn deleted_portal_disappears_from_both_lookups() {
    let store = Store::in_memory().await.expect("store opens");
    store
        .insert_portal(&PortalRow {
            remote_id: REMOTE.to_owned(),
            room_id: Some(ROOM.to_owned()),
        })
        .await
        .expect("insert succeeds");
    store.delete_portal(REMOTE).await.expect("delete succeeds");

    assert!(store
        .portal_by_remote(REMOTE)
        .await
        .expect("query succeeds")
        .is_none());
    assert!(store
        .portal_by_room(ROOM)
        .await
        .expect("query succeeds")
        .is_none());
}

#[tokio::test]
async fn puppet_registration_flag_flips_once() {
    let store = Store::in_memory().await.expect("store opens");
    store
        .insert_puppet(&PuppetRow {
            remote_id: REMOTE.to_owned(),
            matrix_registered: false,
        })
        .await
        .expect("insert succeeds");

    let row = store
        .puppet_by_remote(REMOTE)
        .await
        .expect("query succeeds")
        .expect("row exists");
    assert!(!row.matrix_registered);

    store
        .set_puppet_registered(REMOTE)
        .await
        .expect("update succeeds");
    let row = store
        .puppet_by_remote(REMOTE)
        .await
        .expect("query succeeds")
        .expect("row exists");
    assert!(row.matrix_registered);
}

#[tokio::test]
async fn messages_are_found_by_both_identities() {
    let store = Store::in_memory().await.expect("store opens");
    store
        .insert_message(&MessageRow {
            event_id: "$ev1".to_owned(),
            room_id: ROOM.to_owned(),
            remote_receiver: REMOTE.to_owned(),
            remote_id: "SM1".to_owned(),
        })
        .await
        .expect("insert succeeds");

    let by_remote = store
        .message_by_remote("SM1", REMOTE)
        .await
        .expect("query succeeds")
        .expect("row exists");
    assert_eq!(by_remote.event_id, "$ev1");

    let by_matrix = store
        .message_by_matrix("$ev1", ROOM)
        .await
        .expect("query succeeds")
        .expect("row exists");
    assert_eq!(by_matrix.remote_id, "SM1");

    assert!(store
        .message_by_remote("SM1", "whatsapp:+19999999999")
        .await
        .expect("query succeeds")
        .is_none());
}

#[tokio::test]
async fn same_provider_id_is_allowed_across_conversations() {
    let store = Store::in_memory().await.expect("store opens");
    for (receiver, event, room) in [
        (REMOTE, "$ev1", ROOM),
        ("whatsapp:+19999999999", "$ev2", "!other:example.com"),
    ] {
        store
            .insert_message(&MessageRow {
                event_id: event.to_owned(),
                room_id: room.to_owned(),
                remote_receiver: receiver.to_owned(),
                remote_id: "SM1".to_owned(),
            })
            .await
            .expect("insert succeeds");
    }

    let row = store
        .message_by_remote("SM1", "whatsapp:+19999999999")
        .await
        .expect("query succeeds")
        .expect("row exists");
    assert_eq!(row.event_id, "$ev2");
}
