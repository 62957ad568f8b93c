use super::*;

async fn setup_store() -> (SqliteStore, tempfile::NamedTempFile) {
    let db_file = tempfile::NamedTempFile::new().unwrap();
    let store = SqliteStore::new(db_file.path().to_str().unwrap())
        .await
        .unwrap();
    (store, db_file)
}

fn make_message(session_id: &str, role: &str, content: &str) -> NewMessage {
    NewMessage {
        session_id: session_id.to_string(),
        role: role.to_string(),
        content: content.to_string(),
        user_id: Some(42),
        user_name: Some("Bob".to_string()),
        user_role: Some("member".to_string()),
        group_id: Some(100),
        group_name: Some("test group".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn messages_come_back_in_ascending_order() {
    let (store, _db) = setup_store().await;
    for i in 0..5 {
        store
            .save_message(&make_message("group:100", "user", &format!("msg {i}")))
            .await
            .unwrap();
    }

    let messages = store.get_messages("group:100", 3, None).await.unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].content, "msg 2");
    assert_eq!(messages[2].content, "msg 4");
}

#[tokio::test]
async fn before_filter_excludes_newer_rows() {
    let (store, _db) = setup_store().await;
    store
        .save_message(&make_message("group:100", "user", "old"))
        .await
        .unwrap();
    let cutoff = Utc::now();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    store
        .save_message(&make_message("group:100", "user", "new"))
        .await
        .unwrap();

    let messages = store
        .get_messages("group:100", 10, Some(cutoff))
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "old");
}

#[tokio::test]
async fn user_lookup_spans_sessions() {
    let (store, _db) = setup_store().await;
    store
        .save_message(&make_message("group:100", "user", "in group"))
        .await
        .unwrap();
    store
        .save_message(&make_message("personal:42", "user", "personal copy"))
        .await
        .unwrap();

    let all = store.get_messages_by_user(42, None, 10).await.unwrap();
    assert_eq!(all.len(), 2);

    let scoped = store
        .get_messages_by_user(42, Some("personal:42"), 10)
        .await
        .unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].content, "personal copy");
}

#[tokio::test]
async fn search_is_substring_match() {
    let (store, _db) = setup_store().await;
    store
        .save_message(&make_message("group:100", "user", "we talked about rust"))
        .await
        .unwrap();
    store
        .save_message(&make_message("group:100", "user", "unrelated"))
        .await
        .unwrap();
    store
        .save_message(&make_message("group:200", "user", "rust elsewhere"))
        .await
        .unwrap();

    let hits = store.search_messages("group:100", "rust", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].content, "we talked about rust");

    // LIKE metacharacters in the needle must not act as wildcards.
    let hits = store.search_messages("group:100", "%", 10).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn reset_clears_messages_but_keeps_identity() {
    let (store, _db) = setup_store().await;
    let session = store
        .create_session("group:100", SessionKind::Group, 100)
        .await
        .unwrap();
    store
        .set_compressed_context("group:100", "summary")
        .await
        .unwrap();
    store
        .save_message(&make_message("group:100", "user", "hello"))
        .await
        .unwrap();

    store.reset_session("group:100").await.unwrap();

    let messages = store.get_messages("group:100", 10, None).await.unwrap();
    assert!(messages.is_empty());
    let after = store.get_session("group:100").await.unwrap().unwrap();
    assert_eq!(after.id, session.id);
    assert_eq!(after.created_at, session.created_at);
    assert!(after.compressed_context.is_none());
}

#[tokio::test]
async fn create_session_is_idempotent() {
    let (store, _db) = setup_store().await;
    let first = store
        .create_session("group:100", SessionKind::Group, 100)
        .await
        .unwrap();
    let second = store
        .create_session("group:100", SessionKind::Group, 100)
        .await
        .unwrap();
    assert_eq!(first.created_at, second.created_at);
}

#[tokio::test]
async fn topic_update_merges_fields_and_prune_keeps_newest() {
    let (store, _db) = setup_store().await;
    let id = store
        .save_topic("group:100", "rust", &["borrow".to_string()], "intro", 10)
        .await
        .unwrap();

    store
        .update_topic(
            id,
            &TopicPatch {
                summary: Some("deeper".to_string()),
                add_messages: Some(5),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let topics = store.get_topics("group:100", 10).await.unwrap();
    assert_eq!(topics[0].summary, "deeper");
    assert_eq!(topics[0].message_count, 15);
    assert_eq!(topics[0].keyword_list(), vec!["borrow".to_string()]);

    for i in 0..5 {
        store
            .save_topic("group:100", &format!("t{i}"), &[], "", 1)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    store.prune_topics("group:100", 3).await.unwrap();
    let topics = store.get_topics("group:100", 10).await.unwrap();
    assert_eq!(topics.len(), 3);
    assert_eq!(topics[0].title, "t4");
}

#[tokio::test]
async fn oldest_expressions_are_deleted_first() {
    let (store, _db) = setup_store().await;
    for i in 0..6 {
        store
            .save_expression("group:100", 42, "Bob", &format!("s{i}"), "casual", "e")
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    assert_eq!(store.get_expression_count("group:100").await.unwrap(), 6);
    store
        .delete_oldest_expressions("group:100", 4)
        .await
        .unwrap();

    let left = store.get_expressions("group:100", 10).await.unwrap();
    assert_eq!(left.len(), 4);
    assert_eq!(left[0].situation, "s5");
    assert!(left.iter().all(|e| e.situation != "s0" && e.situation != "s1"));
}

#[tokio::test]
async fn emoji_registration_ignores_duplicates() {
    let (store, _db) = setup_store().await;
    assert!(store.save_emoji("cat.png", "a cat", "cute").await.unwrap());
    assert!(!store.save_emoji("cat.png", "other", "sad").await.unwrap());
    assert!(store.has_emoji("cat.png").await.unwrap());

    let cute = store.get_emojis_by_emotion("cute", 5).await.unwrap();
    assert_eq!(cute.len(), 1);
    assert_eq!(cute[0].description, "a cat");
}

#[tokio::test]
async fn emoji_usage_order_is_descending() {
    let (store, _db) = setup_store().await;
    store.save_emoji("a.png", "", "happy").await.unwrap();
    store.save_emoji("b.png", "", "happy").await.unwrap();
    let all = store.get_all_emojis().await.unwrap();
    let b = all.iter().find(|e| e.file_name == "b.png").unwrap();
    store.increment_emoji_usage(b.id).await.unwrap();
    store.increment_emoji_usage(b.id).await.unwrap();

    let happy = store.get_emojis_by_emotion("happy", 5).await.unwrap();
    assert_eq!(happy[0].file_name, "b.png");
    assert_eq!(happy[0].usage_count, 2);
}
