//! End-to-end dispatcher scenarios against a scripted model and a recording
//! gateway.

use std::sync::Arc;

use chrono::Utc;

use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::humanizer::EmojiSystem;
use crate::rate_limit::RateLimiter;
use crate::skills::SkillRegistry;
use crate::store::SqliteStore;
use crate::testing::{temp_store, test_config, RecordingGateway, StubLlm};
use crate::traits::{
    FetchedMessage, GroupRole, MessageEvent, PokeEvent, ProviderResponse, Segment, Sender,
};

const BOT_ID: i64 = 10;
const GROUP: i64 = 100;
const USER: i64 = 42;

struct Fixture {
    dispatcher: Arc<Dispatcher>,
    llm: Arc<StubLlm>,
    gateway: Arc<RecordingGateway>,
    store: Arc<SqliteStore>,
    _db: tempfile::NamedTempFile,
}

async fn fixture(llm: StubLlm, cfg: AppConfig) -> Fixture {
    let (store, db) = temp_store().await;
    let llm = Arc::new(llm);
    let gateway = Arc::new(RecordingGateway::new());
    let skills = Arc::new(SkillRegistry::new());
    let rate = Arc::new(RateLimiter::new(cfg.rate_limit.clone()));
    let config = Arc::new(cfg);
    let emoji = Arc::new(EmojiSystem::new(
        llm.clone(),
        store.clone(),
        config.emoji.clone(),
        config.working_model().to_string(),
        config.is_multimodal,
    ));
    let dispatcher = Dispatcher::new(
        config,
        store.clone(),
        gateway.clone(),
        llm.clone(),
        skills,
        rate,
        emoji,
    );
    Fixture {
        dispatcher,
        llm,
        gateway,
        store,
        _db: db,
    }
}

fn text_response(content: &str) -> ProviderResponse {
    ProviderResponse {
        content: Some(content.to_string()),
        ..Default::default()
    }
}

fn group_event(segments: Vec<Segment>) -> MessageEvent {
    MessageEvent {
        message_id: 900,
        self_id: BOT_ID,
        group_id: Some(GROUP),
        user_id: USER,
        sender: Sender {
            user_id: USER,
            nickname: "Bob".to_string(),
            card: None,
            role: GroupRole::Member,
            title: None,
        },
        segments,
        time: Utc::now().timestamp(),
    }
}

fn at_bot_event(text: &str) -> MessageEvent {
    group_event(vec![Segment::at(BOT_ID), Segment::text(text)])
}

#[tokio::test]
async fn direct_at_trigger_sends_segmented_reply() {
    // S1: direct @-trigger, two-part reply, pacing between sends.
    let f = fixture(
        StubLlm::with_responses(vec![text_response("hey\n---\nhow's it going?")]),
        test_config(),
    )
    .await;

    f.dispatcher.on_message(at_bot_event("hi")).await;

    assert_eq!(f.gateway.group_texts(), vec!["hey", "how's it going?"]);
    {
        let sent = f.gateway.sent_group.lock().unwrap();
        let gap = (sent[1].2 - sent[0].2).num_milliseconds();
        assert!(gap >= 300, "sends were only {gap}ms apart");
    }

    // One inbound user row + one assistant row under the group session.
    let rows = f.store.get_messages("group:100", 10, None).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].role, "user");
    assert_eq!(rows[0].content, "hi");
    assert_eq!(rows[1].role, "assistant");

    // Cross-group copy under the sender's personal session.
    let personal = f.store.get_messages("personal:42", 10, None).await.unwrap();
    assert_eq!(personal.len(), 1);

    // Follow-up window opened for (group, user).
    assert!(f.dispatcher.has_follow_up(GROUP, USER));
}

#[tokio::test]
async fn duplicate_content_is_dropped_silently() {
    // S2: the second identical message inside the dedup window produces no
    // outbound and no rows.
    let f = fixture(
        StubLlm::with_responses(vec![
            text_response("hey"),
            text_response("should never be used"),
        ]),
        test_config(),
    )
    .await;

    f.dispatcher.on_message(at_bot_event("hi")).await;
    let rows_before = f.store.get_messages("group:100", 10, None).await.unwrap();
    f.dispatcher.on_message(at_bot_event("hi")).await;
    let rows_after = f.store.get_messages("group:100", 10, None).await.unwrap();

    assert_eq!(f.gateway.group_send_count(), 1);
    assert_eq!(f.llm.call_count(), 1);
    assert_eq!(rows_before.len(), rows_after.len());
}

#[tokio::test]
async fn follow_up_window_routes_through_planner() {
    // S3: a recent reply record lets an unaddressed message through, gated
    // by the planner; the record is consumed first.
    let f = fixture(
        StubLlm::with_responses(vec![
            text_response(r#"{"action": "reply", "reason": "follow-up"}"#),
            text_response("sure is"),
        ]),
        test_config(),
    )
    .await;
    f.dispatcher
        .seed_follow_up(GROUP, USER, Utc::now() - chrono::Duration::seconds(60));

    f.dispatcher
        .on_message(group_event(vec![Segment::text("really?")]))
        .await;

    // Planner call + one engine call; one outbound reply.
    assert_eq!(f.llm.call_count(), 2);
    assert_eq!(f.gateway.group_texts(), vec!["sure is"]);
    // A fresh window was opened by the new reply.
    assert!(f.dispatcher.has_follow_up(GROUP, USER));
}

#[tokio::test]
async fn expired_follow_up_record_is_ignored() {
    let f = fixture(StubLlm::always_text("unused"), test_config()).await;
    f.dispatcher
        .seed_follow_up(GROUP, USER, Utc::now() - chrono::Duration::minutes(4));

    f.dispatcher
        .on_message(group_event(vec![Segment::text("really?")]))
        .await;

    assert_eq!(f.llm.call_count(), 0);
    assert_eq!(f.gateway.group_send_count(), 0);
    // The stale record was consumed on the way.
    assert!(!f.dispatcher.has_follow_up(GROUP, USER));
}

#[tokio::test]
async fn planner_wait_suppresses_reply_but_persists_inbound() {
    // S6: planner says wait; the inbound is persisted, nothing is sent, and
    // the in-flight guard is released.
    let mut cfg = test_config();
    cfg.planner.enabled = true;
    let f = fixture(
        StubLlm::with_responses(vec![text_response(
            r#"{"action": "wait", "reason": "mid-discussion", "wait_seconds": 30}"#,
        )]),
        cfg,
    )
    .await;

    f.dispatcher.on_message(at_bot_event("hi")).await;

    assert_eq!(f.gateway.group_send_count(), 0);
    let rows = f.store.get_messages("group:100", 10, None).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].role, "user");
    // Guard released: the slot can be taken again.
    let hold = f.dispatcher.try_hold_in_flight("group:100");
    assert!(hold.is_some());
}

#[tokio::test]
async fn in_flight_session_drops_concurrent_arrivals() {
    let f = fixture(StubLlm::always_text("unused"), test_config()).await;
    let _hold = f.dispatcher.try_hold_in_flight("group:100").unwrap();

    f.dispatcher.on_message(at_bot_event("hi")).await;

    // Dropped before persisting or calling the model.
    assert_eq!(f.llm.call_count(), 0);
    let rows = f.store.get_messages("group:100", 10, None).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn quote_of_bot_message_triggers() {
    let f = fixture(
        StubLlm::with_responses(vec![text_response("yep")]),
        test_config(),
    )
    .await;
    f.gateway.set_fetched(FetchedMessage {
        message_id: 555,
        sender: Sender {
            user_id: BOT_ID,
            nickname: "miku".to_string(),
            ..Default::default()
        },
        segments: vec![Segment::text("earlier bot message")],
    });

    f.dispatcher
        .on_message(group_event(vec![
            Segment::reply(555),
            Segment::text("really?"),
        ]))
        .await;

    assert_eq!(f.gateway.group_texts(), vec!["yep"]);
}

#[tokio::test]
async fn quote_of_other_user_gets_content_prefix() {
    let f = fixture(
        StubLlm::with_responses(vec![text_response("noted")]),
        test_config(),
    )
    .await;
    f.gateway.set_fetched(FetchedMessage {
        message_id: 556,
        sender: Sender {
            user_id: 77,
            nickname: "Carol".to_string(),
            ..Default::default()
        },
        segments: vec![Segment::text("pizza friday?")],
    });

    // Quote of a non-bot user alone does not trigger; add an @ so it does.
    f.dispatcher
        .on_message(group_event(vec![
            Segment::reply(556),
            Segment::at(BOT_ID),
            Segment::text("what do you think"),
        ]))
        .await;

    let rows = f.store.get_messages("group:100", 10, None).await.unwrap();
    assert!(rows[0].content.starts_with("[引用 Carol: \"pizza friday?\"]"));
}

#[tokio::test]
async fn nickname_mention_counts_as_trigger() {
    let f = fixture(
        StubLlm::with_responses(vec![text_response("叫我干嘛")]),
        test_config(),
    )
    .await;

    f.dispatcher
        .on_message(group_event(vec![Segment::text("Miku 在吗")]))
        .await;

    assert_eq!(f.gateway.group_texts(), vec!["叫我干嘛"]);
}

#[tokio::test]
async fn unaddressed_message_is_ignored() {
    let f = fixture(StubLlm::always_text("unused"), test_config()).await;
    f.dispatcher
        .on_message(group_event(vec![Segment::text("just chatting")]))
        .await;
    assert_eq!(f.llm.call_count(), 0);
    assert_eq!(f.gateway.group_send_count(), 0);
}

#[tokio::test]
async fn own_messages_are_dropped() {
    let f = fixture(StubLlm::always_text("unused"), test_config()).await;
    let mut ev = at_bot_event("hi");
    ev.user_id = BOT_ID;
    f.dispatcher.on_message(ev).await;
    assert_eq!(f.llm.call_count(), 0);
}

#[tokio::test]
async fn whitelist_excludes_other_groups() {
    let mut cfg = test_config();
    cfg.whitelist_groups = vec![200];
    let f = fixture(StubLlm::always_text("unused"), cfg).await;

    f.dispatcher.on_message(at_bot_event("hi")).await;

    assert_eq!(f.llm.call_count(), 0);
    assert_eq!(f.gateway.group_send_count(), 0);
}

#[tokio::test]
async fn frequency_gate_suppresses_group_reply() {
    let mut cfg = test_config();
    cfg.frequency.enabled = true;
    cfg.frequency.speak_probability = 0.0;
    cfg.frequency.quiet_probability_multiplier = 0.0;
    let f = fixture(StubLlm::always_text("unused"), cfg).await;

    f.dispatcher.on_message(at_bot_event("hi")).await;

    // Inbound persisted, no model call, no outbound.
    assert_eq!(f.llm.call_count(), 0);
    assert_eq!(f.gateway.group_send_count(), 0);
    let rows = f.store.get_messages("group:100", 10, None).await.unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn reset_self_clears_personal_session() {
    let f = fixture(
        StubLlm::with_responses(vec![text_response("hello")]),
        test_config(),
    )
    .await;
    // Seed the personal session via a normal message.
    f.dispatcher.on_message(at_bot_event("hi")).await;
    assert!(!f
        .store
        .get_messages("personal:42", 10, None)
        .await
        .unwrap()
        .is_empty());

    f.dispatcher
        .on_message(group_event(vec![Segment::text("/reset-self")]))
        .await;

    assert!(f
        .store
        .get_messages("personal:42", 10, None)
        .await
        .unwrap()
        .is_empty());
    // A confirmation went out.
    let texts = f.gateway.group_texts();
    assert!(texts.last().unwrap().contains("重置"));
}

#[tokio::test]
async fn reset_group_requires_privileges() {
    let f = fixture(
        StubLlm::with_responses(vec![text_response("hello")]),
        test_config(),
    )
    .await;
    f.dispatcher.on_message(at_bot_event("hi")).await;
    assert!(!f
        .store
        .get_messages("group:100", 10, None)
        .await
        .unwrap()
        .is_empty());

    // Plain member: refused.
    f.dispatcher
        .on_message(group_event(vec![Segment::text("/reset-group")]))
        .await;
    assert!(!f
        .store
        .get_messages("group:100", 10, None)
        .await
        .unwrap()
        .is_empty());

    // Group admin: allowed.
    let mut ev = group_event(vec![Segment::text("/reset-group")]);
    ev.sender.role = GroupRole::Admin;
    f.dispatcher.on_message(ev).await;
    assert!(f
        .store
        .get_messages("group:100", 10, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn poke_at_bot_replies_with_cooldown() {
    let f = fixture(
        StubLlm::with_responses(vec![text_response("别戳啦"), text_response("unused")]),
        test_config(),
    )
    .await;

    let poke = PokeEvent {
        self_id: BOT_ID,
        group_id: GROUP,
        user_id: USER,
        target_id: BOT_ID,
    };
    f.dispatcher.on_poke(poke.clone()).await;
    assert_eq!(f.gateway.group_texts(), vec!["别戳啦"]);

    // Second poke inside the cooldown window is ignored.
    f.dispatcher.on_poke(poke).await;
    assert_eq!(f.gateway.group_send_count(), 1);
}

#[tokio::test]
async fn poke_at_someone_else_is_ignored() {
    let f = fixture(StubLlm::always_text("unused"), test_config()).await;
    f.dispatcher
        .on_poke(PokeEvent {
            self_id: BOT_ID,
            group_id: GROUP,
            user_id: USER,
            target_id: 77,
        })
        .await;
    assert_eq!(f.llm.call_count(), 0);
}

#[tokio::test]
async fn multiline_reply_sends_one_message_per_line() {
    let f = fixture(
        StubLlm::with_responses(vec![text_response("line one\nline two")]),
        test_config(),
    )
    .await;

    f.dispatcher.on_message(at_bot_event("hi")).await;

    assert_eq!(f.gateway.group_texts(), vec!["line one", "line two"]);
}

#[tokio::test]
async fn image_inbound_is_persisted_as_content_parts() {
    let f = fixture(
        StubLlm::with_responses(vec![text_response("nice pic")]),
        test_config(),
    )
    .await;

    f.dispatcher
        .on_message(group_event(vec![
            Segment::at(BOT_ID),
            Segment::text("look"),
            Segment::Image {
                file: "cat.png".to_string(),
                url: Some("https://img.example/cat.png".to_string()),
            },
        ]))
        .await;

    let rows = f.store.get_messages("group:100", 10, None).await.unwrap();
    let parts: serde_json::Value = serde_json::from_str(&rows[0].content).unwrap();
    assert_eq!(parts[0]["type"], "text");
    assert_eq!(parts[1]["type"], "image_url");
    assert_eq!(parts[1]["image_url"]["url"], "https://img.example/cat.png");
}
