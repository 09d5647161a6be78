mod common;

use common::{memory_config, Harness};
use courier::delivery::PushJob;
use courier::infra::{JobHandler, PresenceStore, PresenceTracker, WorkerPool};
use courier::model::PushPlatform;
use courier::push::{MockProvider, PushDispatchWorker, PushGateway, PushVendor};
use courier::queue::{enqueue_job, EnqueueOptions, EnqueueOutcome, JobQueue, MemoryJobQueue, QueueName};
use courier::repository::{MemoryStore, Repositories};
use courier::DeliveryServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

#[tokio::test]
async fn test_submitted_message_is_pushed_end_to_end() {
    let store = Arc::new(MemoryStore::new());
    let presence: Arc<dyn PresenceStore> = Arc::new(PresenceTracker::new());
    let queue = Arc::new(MemoryJobQueue::new(Duration::from_secs(60), Duration::from_secs(3600)));
    let provider = Arc::new(MockProvider::new(PushVendor::Fcm));

    let server = DeliveryServer::from_parts(
        memory_config(),
        Repositories::memory(store.clone()),
        presence,
        queue.clone(),
        Arc::new(PushGateway::mock(provider.clone())),
    );

    let (sender, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conversation = Uuid::new_v4();
    store.add_member(conversation, sender);
    store.add_member(conversation, bob);
    store.insert_token(courier::model::PushToken::new(bob, "D1", PushPlatform::Android, "TK1"));
    let message = courier::model::Message {
        id: Uuid::new_v4(),
        conversation_id: conversation,
        sender_id: sender,
        content_type: courier::model::ContentType::Text,
        body: "ship it".to_string(),
        media_url: None,
        created_at: chrono::Utc::now(),
        delivered_at: None,
    };
    store.insert_message(message.clone());

    let (tx, rx) = watch::channel(false);
    let handles = server.spawn_workers(rx);

    assert_eq!(
        server.dispatcher().submit(message.id).await.unwrap(),
        EnqueueOutcome::Enqueued
    );

    for _ in 0..200 {
        if !provider.sent_to("TK1").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    let sent = provider.sent_to("TK1");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message.body, "ship it");
    assert_eq!(store.retry_record(message.id, bob, "D1").unwrap().attempt, 0);
    // 第一轮重试还在等待退避
    assert_eq!(queue.len(QueueName::MessageRetry), 1);
    assert!(queue.is_empty(QueueName::Message));
}

#[tokio::test]
async fn test_duplicate_push_job_sends_once() {
    let h = Harness::new();
    let bob = Uuid::new_v4();
    h.token(bob, "D1", PushPlatform::Android, "TK1");

    let queue: Arc<dyn JobQueue> = h.queue.clone();
    let worker = Arc::new(PushDispatchWorker::new(
        h.presence.clone(),
        h.store.clone(),
        h.gateway.clone(),
    ));
    let pool = WorkerPool::new(queue.clone(), worker, 4, Duration::from_millis(10));

    let job = PushJob::message(bob, "D1", Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), "hi", 0);
    let options = || EnqueueOptions::for_job(&job);

    assert_eq!(
        enqueue_job(queue.as_ref(), &job, options()).await.unwrap(),
        EnqueueOutcome::Enqueued
    );
    assert_eq!(
        enqueue_job(queue.as_ref(), &job, options()).await.unwrap(),
        EnqueueOutcome::DuplicateIdempotencyKey
    );

    while pool.run_once().await.unwrap() {}

    // 完成后在保留窗口内仍视为重复
    assert_eq!(
        enqueue_job(queue.as_ref(), &job, options()).await.unwrap(),
        EnqueueOutcome::DuplicateIdempotencyKey
    );
    assert!(!pool.run_once().await.unwrap());
    assert_eq!(h.provider.sent_to("TK1").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_is_retried_by_queue() {
    let h = Harness::new();
    let bob = Uuid::new_v4();
    h.token(bob, "D1", PushPlatform::Android, "TK1");

    let queue: Arc<dyn JobQueue> = h.queue.clone();
    let worker: Arc<dyn JobHandler> = Arc::new(PushDispatchWorker::new(
        h.presence.clone(),
        h.store.clone(),
        h.gateway.clone(),
    ));
    let pool = WorkerPool::new(queue.clone(), worker, 1, Duration::from_millis(10));

    let job = PushJob::message(bob, "D1", Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), "hi", 0);
    enqueue_job(queue.as_ref(), &job, EnqueueOptions::for_job(&job))
        .await
        .unwrap();

    h.store.set_unavailable(true);
    assert!(pool.run_once().await.unwrap());
    assert_eq!(h.queue.len(QueueName::Push), 1);
    assert!(h.provider.sent().is_empty());

    h.store.set_unavailable(false);
    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(pool.run_once().await.unwrap());
    assert!(h.queue.is_empty(QueueName::Push));
    assert_eq!(h.provider.sent_to("TK1").len(), 1);
}

#[tokio::test]
async fn test_undecodable_payload_goes_to_dead_letter() {
    let h = Harness::new();
    let queue: Arc<dyn JobQueue> = h.queue.clone();
    let worker = Arc::new(PushDispatchWorker::new(
        h.presence.clone(),
        h.store.clone(),
        h.gateway.clone(),
    ));
    let pool = WorkerPool::new(queue.clone(), worker, 1, Duration::from_millis(10));

    queue
        .enqueue(
            QueueName::Push,
            "push",
            serde_json::json!({ "unexpected": true }),
            EnqueueOptions::new("push:broken"),
        )
        .await
        .unwrap();

    assert!(pool.run_once().await.unwrap());
    assert!(h.queue.is_empty(QueueName::Push));
    assert_eq!(h.queue.dead(QueueName::Push).len(), 1);
}
