mod common;

use common::Harness;
use courier::delivery::PushJob;
use courier::model::PushPlatform;
use courier::push::PushOutcome;
use courier::repository::PushTokenRepository;
use std::collections::BTreeMap;
use uuid::Uuid;

fn message_push(user: Uuid, device: &str) -> PushJob {
    PushJob::message(
        user,
        device,
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        "preview",
        0,
    )
}

#[tokio::test]
async fn test_invalid_token_revokes_exactly_that_token() {
    let h = Harness::new();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    h.token(alice, "phone", PushPlatform::Android, "T");
    h.token(alice, "tablet", PushPlatform::Android, "T-tablet");
    h.token(bob, "phone", PushPlatform::Android, "T-bob");
    h.provider
        .respond_with("T", PushOutcome::InvalidToken("UNREGISTERED".to_string()));

    let report = h.worker.process(&message_push(alice, "phone")).await.unwrap();
    assert_eq!(report.targets, 1);
    assert_eq!(report.revoked, 1);
    assert_eq!(report.sent, 0);

    assert!(h.store.token_for(alice, "phone").unwrap().revoked_at.is_some());
    assert!(h.store.token_for(alice, "tablet").unwrap().is_active());
    assert!(h.store.token_for(bob, "phone").unwrap().is_active());

    // 已吊销的令牌不再被使用
    let report = h.worker.process(&message_push(alice, "phone")).await.unwrap();
    assert_eq!(report.targets, 0);
    assert_eq!(h.provider.sent_to("T").len(), 1);
}

#[tokio::test]
async fn test_revoke_does_not_touch_rotated_token() {
    let h = Harness::new();
    let alice = Uuid::new_v4();
    h.store
        .register(alice, "phone", PushPlatform::Ios, "T-old")
        .await
        .unwrap();

    // 发送 T-old 期间设备重新注册了 T-new，随后才收到 T-old 失效的结果
    h.store
        .register(alice, "phone", PushPlatform::Ios, "T-new")
        .await
        .unwrap();
    let revoked = h
        .store
        .revoke(alice, "phone", "T-old", chrono::Utc::now())
        .await
        .unwrap();

    assert!(!revoked);
    let token = h.store.token_for(alice, "phone").unwrap();
    assert_eq!(token.token, "T-new");
    assert!(token.is_active());
}

#[tokio::test]
async fn test_reregistering_clears_revocation() {
    let h = Harness::new();
    let alice = Uuid::new_v4();
    h.token(alice, "phone", PushPlatform::Android, "T");
    h.provider
        .respond_with("T", PushOutcome::InvalidToken("UNREGISTERED".to_string()));
    h.worker.process(&message_push(alice, "phone")).await.unwrap();
    assert!(!h.store.token_for(alice, "phone").unwrap().is_active());

    h.store
        .register(alice, "phone", PushPlatform::Android, "T2")
        .await
        .unwrap();
    let report = h.worker.process(&message_push(alice, "phone")).await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(h.provider.sent_to("T2").len(), 1);
}

#[tokio::test]
async fn test_message_push_payload() {
    let h = Harness::new();
    let alice = Uuid::new_v4();
    h.token(alice, "phone", PushPlatform::Android, "T");

    let (message_id, conversation_id, sender_id) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let job = PushJob::message(alice, "phone", message_id, conversation_id, sender_id, "lunch?", 2);
    h.worker.process(&job).await.unwrap();

    let sent = h.provider.sent_to("T");
    assert_eq!(sent.len(), 1);
    let message = &sent[0].message;
    assert_eq!(message.title, "New message");
    assert_eq!(message.body, "lunch?");
    assert_eq!(message.data["type"], "message");
    assert_eq!(message.data["messageId"], message_id.to_string());
    assert_eq!(message.data["conversationId"], conversation_id.to_string());
    assert_eq!(message.data["senderUserId"], sender_id.to_string());
}

#[tokio::test]
async fn test_notification_reaches_every_offline_device() {
    let h = Harness::new();
    let alice = Uuid::new_v4();
    h.token(alice, "phone", PushPlatform::Android, "T-phone");
    h.token(alice, "ipad", PushPlatform::Ios, "T-ipad");
    h.token(alice, "desktop", PushPlatform::Desktop, "T-desktop");
    h.presence.connect(alice, "desktop");

    let mut data = BTreeMap::new();
    data.insert("type".to_string(), "friend_request".to_string());
    let job = PushJob::notification(
        alice,
        Uuid::new_v4(),
        Some("Friend request".to_string()),
        None,
        data,
    );
    let report = h.worker.process(&job).await.unwrap();

    assert_eq!(report.targets, 3);
    assert_eq!(report.sent, 2);
    assert_eq!(report.skipped_online, 1);
    let sent = h.provider.sent_to("T-ipad");
    assert_eq!(sent[0].message.title, "Friend request");
    assert_eq!(sent[0].message.body, "You have a new notification");
    assert_eq!(sent[0].message.data["type"], "friend_request");
}

#[tokio::test]
async fn test_token_store_outage_fails_job() {
    let h = Harness::new();
    h.store.set_unavailable(true);
    let err = h
        .worker
        .process(&message_push(Uuid::new_v4(), "phone"))
        .await
        .unwrap_err();
    assert!(err.is_transient());
}
