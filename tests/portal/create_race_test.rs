//! Concurrent room-creation tests.

use std::sync::Arc;

use crate::mock::{engine_with, message_event, test_settings, Call, MockMatrix, MockProvider};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_inbound_messages_create_one_room() {
    let matrix = MockMatrix::new();
    let provider = MockProvider::new();
    let (engine, _store) =
        engine_with(Arc::clone(&matrix), Arc::clone(&provider), test_settings()).await;
    let engine = Arc::new(engine);

    let mut tasks = Vec::new();
    for i in 0..16 {
        let engine = Arc::clone(&engine);
        tasks.push(tokio::spawn(async move {
            engine
                .handle_remote_message(&message_event(&format!("SM{i}"), "race", None))
                .await
        }));
    }
    for task in tasks {
        task.await.expect("task completes").expect("relay succeeds");
    }

    assert_eq!(matrix.room_creates().await, 1);
    let texts = matrix
        .calls()
        .await
        .iter()
        .filter(|call| matches!(call, Call::Text { .. }))
        .count();
    assert_eq!(texts, 16);
}
