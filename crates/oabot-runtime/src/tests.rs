use std::sync::Arc;

use chrono::TimeZone;
use chrono_tz::Tz;
use httpmock::prelude::*;
use oabot_knowledge::{KnowledgeCache, KnowledgeCacheConfig};
use oabot_oauth::{FileTokenStore, TokenManager, TokenManagerConfig};
use serde_json::json;
use tokio::sync::watch;

use crate::broadcast::{parse_schedule_items, BroadcastConfig, BroadcastScheduler};
use crate::dispatch::{DispatchConfig, WebhookDispatcher};
use crate::event::{extract_inbound_event, InboundEventKind};
use crate::reply::FallbackReplyGenerator;
use crate::send::{DeliveryResult, MessageClient, OutboundSender, SEND_MAX_CHARS};
use crate::subscriber_store::{FileSubscriberStore, RemoteKvSubscriberStore, SubscriberStore};
use crate::ScheduledBroadcastItem;

const TZ: &str = "Asia/Ho_Chi_Minh";

fn token_manager(dir: &tempfile::TempDir, config: TokenManagerConfig) -> Arc<TokenManager> {
    let store = Arc::new(FileTokenStore::new(dir.path().join("tokens.json")));
    Arc::new(TokenManager::new(config, store).unwrap())
}

fn static_token_manager(dir: &tempfile::TempDir, access: &str) -> Arc<TokenManager> {
    token_manager(
        dir,
        TokenManagerConfig {
            app_id: "app".to_string(),
            secret_key: "secret".to_string(),
            static_access_token: Some(access.to_string()),
            ..TokenManagerConfig::default()
        },
    )
}

fn sender_against(server: &MockServer, tokens: Arc<TokenManager>) -> Arc<OutboundSender> {
    let client = MessageClient::new(server.base_url(), 2_000).unwrap();
    Arc::new(OutboundSender::new(client, tokens))
}

fn local_time(hour: u32, minute: u32) -> chrono::DateTime<Tz> {
    let tz: Tz = TZ.parse().unwrap();
    // 2025-03-03 is a Monday.
    tz.with_ymd_and_hms(2025, 3, 3, hour, minute, 0).unwrap()
}

// --- inbound event extraction ---

#[test]
fn extracts_text_message_from_sender_shape() {
    let payload = json!({
        "event_name": "user_send_text",
        "sender": { "user_id": "u-1" },
        "message": { "text": "xin chào" },
    });
    let event = extract_inbound_event(&payload);
    assert_eq!(event.kind, InboundEventKind::UserText);
    assert_eq!(event.user_id.as_deref(), Some("u-1"));
    assert_eq!(event.text.as_deref(), Some("xin chào"));
}

#[test]
fn extracts_text_from_alternate_payload_shapes() {
    let nested = json!({
        "user": { "user_id": "u-2" },
        "message": { "content": { "text": "hỏi đáp" } },
    });
    let event = extract_inbound_event(&nested);
    assert_eq!(event.kind, InboundEventKind::UserText);
    assert_eq!(event.text.as_deref(), Some("hỏi đáp"));

    let flat = json!({
        "recipient": { "user_id": "u-3" },
        "text": "top level",
    });
    let event = extract_inbound_event(&flat);
    assert_eq!(event.user_id.as_deref(), Some("u-3"));
    assert_eq!(event.text.as_deref(), Some("top level"));
}

#[test]
fn classifies_follow_and_unfollow_events() {
    let follow = json!({ "event_name": "follow", "sender": { "user_id": "u-9" } });
    assert_eq!(extract_inbound_event(&follow).kind, InboundEventKind::Follow);

    let unfollow = json!({ "event_name": "unfollow", "sender": { "user_id": "u-9" } });
    assert_eq!(
        extract_inbound_event(&unfollow).kind,
        InboundEventKind::Unfollow
    );
}

#[test]
fn payload_without_user_or_text_is_ignored() {
    let event = extract_inbound_event(&json!({ "event_name": "oa_send_text" }));
    assert_eq!(event.kind, InboundEventKind::Ignored);

    let only_text = extract_inbound_event(&json!({ "text": "no sender" }));
    assert_eq!(only_text.kind, InboundEventKind::Ignored);

    let blank_id = extract_inbound_event(&json!({
        "sender": { "user_id": "  " },
        "message": { "text": "hi" },
    }));
    assert_eq!(blank_id.kind, InboundEventKind::Ignored);
}

// --- delivery result classification ---

#[test]
fn delivery_result_classification() {
    let ok = DeliveryResult {
        error: 0,
        message: None,
    };
    assert!(ok.is_success());
    assert!(!ok.is_token_expired());

    for code in [-124, -216] {
        let expired = DeliveryResult {
            error: code,
            message: None,
        };
        assert!(expired.is_token_expired());
        assert!(!expired.is_success());
    }

    let transport = DeliveryResult {
        error: -1,
        message: Some("timed out".to_string()),
    };
    assert!(!transport.is_success());
    assert!(!transport.is_token_expired());
}

// --- subscriber stores ---

#[tokio::test]
async fn subscriber_add_is_idempotent_and_ordered() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSubscriberStore::new(dir.path().join("subscribers.json"));

    store.add("u1").await.unwrap();
    store.add("u2").await.unwrap();
    store.add("u1").await.unwrap();
    store.add("  ").await.unwrap();

    assert_eq!(store.list().await.unwrap(), vec!["u1", "u2"]);
}

#[tokio::test]
async fn subscriber_list_survives_reopen_and_remove_drops_member() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("subscribers.json");
    {
        let store = FileSubscriberStore::new(path.clone());
        store.add("u1").await.unwrap();
        store.add("u2").await.unwrap();
        store.remove("u1").await.unwrap();
        store.remove("missing").await.unwrap();
    }

    let reopened = FileSubscriberStore::new(path);
    assert_eq!(reopened.list().await.unwrap(), vec!["u2"]);
}

#[tokio::test]
async fn corrupt_subscriber_file_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("subscribers.json");
    std::fs::write(&path, "{ not json ]").unwrap();

    let store = FileSubscriberStore::new(path);
    assert!(store.list().await.unwrap().is_empty());
    store.add("u1").await.unwrap();
    assert_eq!(store.list().await.unwrap(), vec!["u1"]);
}

#[tokio::test]
async fn remote_kv_store_round_trips_members() {
    let server = MockServer::start();
    let add = server.mock(|when, then| {
        when.method(POST)
            .path("/sets/subs/add")
            .json_body(json!({"member": "u1"}));
        then.status(200).json_body(json!({"ok": true}));
    });
    let members = server.mock(|when, then| {
        when.method(GET).path("/sets/subs/members");
        then.status(200)
            .json_body(json!({"members": ["u1", "u2", "u1"]}));
    });

    let store =
        RemoteKvSubscriberStore::new(server.base_url(), "subs".to_string(), 2_000, None).unwrap();
    store.add("u1").await.unwrap();
    assert_eq!(store.list().await.unwrap(), vec!["u1", "u2"]);
    add.assert();
    members.assert();
}

#[tokio::test]
async fn remote_kv_store_falls_back_to_local_file_when_remote_is_down() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path_includes("/sets/");
        then.status(500);
    });
    server.mock(|when, then| {
        when.method(GET).path_includes("/sets/");
        then.status(500);
    });

    let dir = tempfile::tempdir().unwrap();
    let fallback = FileSubscriberStore::new(dir.path().join("subscribers.json"));
    let store = RemoteKvSubscriberStore::new(
        server.base_url(),
        "subs".to_string(),
        2_000,
        Some(fallback),
    )
    .unwrap();

    store.add("u1").await.unwrap();
    assert_eq!(store.list().await.unwrap(), vec!["u1"]);
}

#[tokio::test]
async fn remote_kv_store_without_fallback_propagates_failure() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path_includes("/sets/");
        then.status(503);
    });

    let store =
        RemoteKvSubscriberStore::new(server.base_url(), "subs".to_string(), 2_000, None).unwrap();
    assert!(store.add("u1").await.is_err());
}

// --- outbound send path ---

#[tokio::test]
async fn send_retries_exactly_once_after_token_expired_code() {
    let server = MockServer::start();

    let first_refresh = server.mock(|when, then| {
        when.method(POST)
            .path("/v4/oa/access_token")
            .body_includes("refresh_token=R0");
        then.status(200).json_body(json!({
            "access_token": "A1",
            "refresh_token": "R1",
            "expires_in": 90000,
        }));
    });
    let second_refresh = server.mock(|when, then| {
        when.method(POST)
            .path("/v4/oa/access_token")
            .body_includes("refresh_token=R1");
        then.status(200).json_body(json!({
            "access_token": "A2",
            "refresh_token": "R2",
            "expires_in": 90000,
        }));
    });
    let rejected_send = server.mock(|when, then| {
        when.method(POST)
            .path("/v2.0/oa/message")
            .header("access_token", "A1");
        then.status(200)
            .json_body(json!({"error": -216, "message": "access token expired"}));
    });
    let accepted_send = server.mock(|when, then| {
        when.method(POST)
            .path("/v2.0/oa/message")
            .header("access_token", "A2");
        then.status(200).json_body(json!({"error": 0}));
    });

    let dir = tempfile::tempdir().unwrap();
    let tokens = token_manager(
        &dir,
        TokenManagerConfig {
            app_id: "app".to_string(),
            secret_key: "secret".to_string(),
            oauth_base: server.base_url(),
            static_access_token: Some("A0".to_string()),
            static_refresh_token: Some("R0".to_string()),
            ..TokenManagerConfig::default()
        },
    );
    let sender = sender_against(&server, tokens);

    let result = sender.send("u1", "hello").await.unwrap();
    assert!(result.is_success());
    assert_eq!(first_refresh.hits(), 1);
    assert_eq!(second_refresh.hits(), 1);
    assert_eq!(rejected_send.hits(), 1);
    assert_eq!(accepted_send.hits(), 1);
}

#[tokio::test]
async fn send_does_not_retry_on_other_platform_errors() {
    let server = MockServer::start();
    let send = server.mock(|when, then| {
        when.method(POST).path("/v2.0/oa/message");
        then.status(200)
            .json_body(json!({"error": -32, "message": "user has not interacted"}));
    });

    let dir = tempfile::tempdir().unwrap();
    let sender = sender_against(&server, static_token_manager(&dir, "T"));

    let result = sender.send("u1", "hello").await.unwrap();
    assert_eq!(result.error, -32);
    assert_eq!(send.hits(), 1);
}

#[tokio::test]
async fn overlong_text_is_truncated_before_sending() {
    let server = MockServer::start();
    let long_text = "x".repeat(SEND_MAX_CHARS + 5);
    let send = server.mock(|when, then| {
        when.method(POST).path("/v2.0/oa/message").json_body(json!({
            "recipient": {"user_id": "u1"},
            "message": {"text": "x".repeat(SEND_MAX_CHARS)},
        }));
        then.status(200).json_body(json!({"error": 0}));
    });

    let dir = tempfile::tempdir().unwrap();
    let sender = sender_against(&server, static_token_manager(&dir, "T"));

    let result = sender.send("u1", &long_text).await.unwrap();
    assert!(result.is_success());
    send.assert();
}

#[tokio::test]
async fn transport_failure_maps_to_error_minus_one() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v2.0/oa/message");
        then.status(502).body("bad gateway");
    });

    let dir = tempfile::tempdir().unwrap();
    let sender = sender_against(&server, static_token_manager(&dir, "T"));

    let result = sender.send("u1", "hello").await.unwrap();
    assert_eq!(result.error, -1);
}

// --- webhook dispatch ---

fn dispatcher_for(
    server: &MockServer,
    dir: &tempfile::TempDir,
    subscribers: Arc<dyn SubscriberStore>,
) -> WebhookDispatcher {
    let knowledge = Arc::new(
        KnowledgeCache::new(KnowledgeCacheConfig {
            source_url: format!("{}/knowledge", server.base_url()),
            strict_first_fetch: false,
            ..KnowledgeCacheConfig::default()
        })
        .unwrap(),
    );
    let replies = Arc::new(FallbackReplyGenerator::new("Chào bạn!".to_string()));
    let sender = sender_against(server, static_token_manager(dir, "T"));
    WebhookDispatcher::new(subscribers, knowledge, replies, sender, DispatchConfig::default())
}

#[tokio::test]
async fn dispatcher_registers_each_sender_once_and_replies_every_time() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/knowledge");
        then.status(200).json_body(json!({"data": []}));
    });
    let send = server.mock(|when, then| {
        when.method(POST).path("/v2.0/oa/message");
        then.status(200).json_body(json!({"error": 0}));
    });

    let dir = tempfile::tempdir().unwrap();
    let subscribers = Arc::new(FileSubscriberStore::new(dir.path().join("subscribers.json")));
    let dispatcher = dispatcher_for(&server, &dir, subscribers.clone());

    for user in ["u1", "u2", "u1"] {
        dispatcher
            .handle_event(&json!({
                "sender": { "user_id": user },
                "message": { "text": "giờ mở cửa?" },
            }))
            .await;
    }

    assert_eq!(subscribers.list().await.unwrap(), vec!["u1", "u2"]);
    assert_eq!(send.hits(), 3);
}

#[tokio::test]
async fn dispatcher_handles_follow_and_unfollow_bookkeeping() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/knowledge");
        then.status(200).json_body(json!({"data": []}));
    });

    let dir = tempfile::tempdir().unwrap();
    let subscribers = Arc::new(FileSubscriberStore::new(dir.path().join("subscribers.json")));
    let dispatcher = dispatcher_for(&server, &dir, subscribers.clone());

    dispatcher
        .handle_event(&json!({"event_name": "follow", "sender": {"user_id": "u1"}}))
        .await;
    dispatcher
        .handle_event(&json!({"event_name": "follow", "sender": {"user_id": "u2"}}))
        .await;
    dispatcher
        .handle_event(&json!({"event_name": "unfollow", "sender": {"user_id": "u1"}}))
        .await;

    assert_eq!(subscribers.list().await.unwrap(), vec!["u2"]);
}

#[tokio::test]
async fn dispatcher_answers_directly_on_knowledge_title_match() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/knowledge");
        then.status(200).json_body(json!({"data": [
            {"id": 1, "title": "Giờ mở cửa", "content": "<p>Mở cửa 8h-22h hằng ngày.</p>"},
        ]}));
    });
    let send = server.mock(|when, then| {
        when.method(POST)
            .path("/v2.0/oa/message")
            .body_includes("8h-22h");
        then.status(200).json_body(json!({"error": 0}));
    });

    let dir = tempfile::tempdir().unwrap();
    let subscribers = Arc::new(FileSubscriberStore::new(dir.path().join("subscribers.json")));
    let dispatcher = dispatcher_for(&server, &dir, subscribers);

    dispatcher
        .handle_event(&json!({
            "sender": { "user_id": "u1" },
            "message": { "text": "GIỜ MỞ CỬA" },
        }))
        .await;

    send.assert();
}

// --- broadcast ---

fn scheduler_for(
    server: &MockServer,
    dir: &tempfile::TempDir,
    subscribers: Arc<dyn SubscriberStore>,
    config: BroadcastConfig,
) -> BroadcastScheduler {
    let sender = sender_against(server, static_token_manager(dir, "T"));
    BroadcastScheduler::new(config, sender, subscribers).unwrap()
}

#[tokio::test]
async fn broadcast_counts_partial_failure_without_aborting() {
    let server = MockServer::start();
    let ok = server.mock(|when, then| {
        when.method(POST)
            .path("/v2.0/oa/message")
            .body_includes("ok-");
        then.status(200).json_body(json!({"error": 0}));
    });
    let bad = server.mock(|when, then| {
        when.method(POST)
            .path("/v2.0/oa/message")
            .body_includes("bad-");
        then.status(200)
            .json_body(json!({"error": -201, "message": "cannot deliver"}));
    });

    let dir = tempfile::tempdir().unwrap();
    let subscribers = Arc::new(FileSubscriberStore::new(dir.path().join("subscribers.json")));
    for user in ["ok-1", "bad-2", "ok-3"] {
        subscribers.add(user).await.unwrap();
    }
    let scheduler = scheduler_for(
        &server,
        &dir,
        subscribers,
        BroadcastConfig {
            pacing_ms: 0,
            ..BroadcastConfig::default()
        },
    );

    let (_tx, rx) = watch::channel(false);
    let summary = scheduler.fan_out("khuyến mãi hôm nay", &rx).await.unwrap();

    assert_eq!(summary.sent, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.total, 3);
    assert_eq!(ok.hits(), 2);
    assert_eq!(bad.hits(), 1);
}

#[tokio::test]
async fn broadcast_stops_when_shutdown_is_already_requested() {
    let server = MockServer::start();
    let send = server.mock(|when, then| {
        when.method(POST).path("/v2.0/oa/message");
        then.status(200).json_body(json!({"error": 0}));
    });

    let dir = tempfile::tempdir().unwrap();
    let subscribers = Arc::new(FileSubscriberStore::new(dir.path().join("subscribers.json")));
    for user in ["u1", "u2"] {
        subscribers.add(user).await.unwrap();
    }
    let scheduler = scheduler_for(
        &server,
        &dir,
        subscribers,
        BroadcastConfig {
            pacing_ms: 0,
            ..BroadcastConfig::default()
        },
    );

    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let summary = scheduler.fan_out("msg", &rx).await.unwrap();

    assert_eq!(summary.sent, 0);
    assert_eq!(summary.total, 2);
    assert_eq!(send.hits(), 0);
}

#[tokio::test]
async fn scheduled_slot_wins_over_rotation_and_dedupes_within_the_minute() {
    let server = MockServer::start();
    let now = local_time(9, 30);
    server.mock(|when, then| {
        when.method(GET).path("/schedule");
        then.status(200).json_body(json!({"items": [
            {"id": "s1", "message": "tin 9h30", "sendTime": "09:30", "daysOfWeek": [1]},
        ]}));
    });

    let dir = tempfile::tempdir().unwrap();
    let subscribers = Arc::new(FileSubscriberStore::new(dir.path().join("subscribers.json")));
    let scheduler = scheduler_for(
        &server,
        &dir,
        subscribers,
        BroadcastConfig {
            schedule_url: Some(format!("{}/schedule", server.base_url())),
            rotation: vec!["xoay vòng".to_string()],
            ..BroadcastConfig::default()
        },
    );

    assert_eq!(scheduler.select_message(&now).await.as_deref(), Some("tin 9h30"));
    // Same minute again: the slot already fired, rotation takes over.
    assert_eq!(
        scheduler.select_message(&now).await.as_deref(),
        Some("xoay vòng")
    );
}

#[tokio::test]
async fn rotation_indexes_by_hour_and_fallback_closes_the_chain() {
    let server = MockServer::start();
    let dir = tempfile::tempdir().unwrap();
    let subscribers = Arc::new(FileSubscriberStore::new(dir.path().join("subscribers.json")));

    let rotating = scheduler_for(
        &server,
        &dir,
        subscribers.clone(),
        BroadcastConfig {
            rotation: vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()],
            fallback_message: Some("cuối".to_string()),
            ..BroadcastConfig::default()
        },
    );
    // Hour 9 % 4 == 1.
    assert_eq!(
        rotating.select_message(&local_time(9, 0)).await.as_deref(),
        Some("b")
    );

    let fallback_only = scheduler_for(
        &server,
        &dir,
        subscribers,
        BroadcastConfig {
            fallback_message: Some("cuối".to_string()),
            ..BroadcastConfig::default()
        },
    );
    assert_eq!(
        fallback_only.select_message(&local_time(9, 0)).await.as_deref(),
        Some("cuối")
    );
}

#[tokio::test]
async fn schedule_fetch_failure_falls_back_to_rotation() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/schedule");
        then.status(500);
    });

    let dir = tempfile::tempdir().unwrap();
    let subscribers = Arc::new(FileSubscriberStore::new(dir.path().join("subscribers.json")));
    let scheduler = scheduler_for(
        &server,
        &dir,
        subscribers,
        BroadcastConfig {
            schedule_url: Some(format!("{}/schedule", server.base_url())),
            rotation: vec!["dự phòng".to_string()],
            ..BroadcastConfig::default()
        },
    );

    assert_eq!(
        scheduler.select_message(&local_time(9, 30)).await.as_deref(),
        Some("dự phòng")
    );
}

#[test]
fn schedule_items_decode_from_all_known_envelopes() {
    let item = json!({"id": "s1", "message": "m", "sendTime": "09:30:00"});
    for raw in [
        json!([item.clone()]),
        json!({"items": [item.clone()]}),
        json!({"data": [item.clone()]}),
        json!({"result": [item.clone()]}),
        json!({"pagedItems": {"items": [item]}}),
    ] {
        let items = parse_schedule_items(&raw);
        assert_eq!(items.len(), 1, "envelope {raw} should decode");
        assert_eq!(items[0].send_time, "09:30");
    }

    assert!(parse_schedule_items(&json!({"unknown": true})).is_empty());
    // Items without an id or send time are dropped.
    assert!(parse_schedule_items(&json!([{"message": "m"}])).is_empty());
}

#[test]
fn schedule_slot_matching_honours_time_and_weekday() {
    let monday_0930 = local_time(9, 30);
    let item = ScheduledBroadcastItem {
        id: "s1".to_string(),
        topic_id: None,
        message: Some("m".to_string()),
        send_time: "09:30".to_string(),
        days_of_week: Some(vec![1]),
        last_sent_at_unix_ms: None,
    };
    assert!(item.matches_slot(&monday_0930));

    let sunday_only = ScheduledBroadcastItem {
        days_of_week: Some(vec![0]),
        ..item.clone()
    };
    assert!(!sunday_only.matches_slot(&monday_0930));

    let wrong_time = ScheduledBroadcastItem {
        send_time: "09:31".to_string(),
        ..item.clone()
    };
    assert!(!wrong_time.matches_slot(&monday_0930));

    let every_day = ScheduledBroadcastItem {
        days_of_week: None,
        ..item
    };
    assert!(every_day.matches_slot(&monday_0930));
}

#[test]
fn schedule_slot_remembers_a_send_within_the_same_minute() {
    let now = local_time(9, 30);
    let mut item = ScheduledBroadcastItem {
        id: "s1".to_string(),
        topic_id: None,
        message: Some("m".to_string()),
        send_time: "09:30".to_string(),
        days_of_week: None,
        last_sent_at_unix_ms: Some(now.timestamp_millis() as u64 + 15_000),
    };
    assert!(item.fired_this_minute(&now));

    item.last_sent_at_unix_ms = Some(now.timestamp_millis() as u64 - 120_000);
    assert!(!item.fired_this_minute(&now));

    item.last_sent_at_unix_ms = None;
    assert!(!item.fired_this_minute(&now));
}

#[tokio::test]
async fn next_due_follows_the_cron_expression() {
    let server = MockServer::start();
    let dir = tempfile::tempdir().unwrap();
    let subscribers = Arc::new(FileSubscriberStore::new(dir.path().join("subscribers.json")));
    let scheduler = scheduler_for(&server, &dir, subscribers, BroadcastConfig::default());

    let next = scheduler.next_due_after(local_time(9, 30)).unwrap();
    assert_eq!(next, local_time(10, 0));
}
