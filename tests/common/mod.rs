#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, Utc};
use courier::config::ServerConfig;
use courier::delivery::{DeliveryDispatcher, DeliverySettings, PushJob, RetryJob, RetryScheduler};
use courier::infra::{PresenceStore, PresenceTracker};
use courier::model::{ContentType, Message, PushPlatform, PushToken, RetryRecord};
use courier::push::{MockProvider, PushDispatchWorker, PushGateway, PushVendor};
use courier::queue::{MemoryJobQueue, QueueName};
use courier::repository::{MemoryStore, Repositories};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// 全内存的投递链路
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub presence: Arc<PresenceTracker>,
    pub queue: Arc<MemoryJobQueue>,
    pub provider: Arc<MockProvider>,
    pub gateway: Arc<PushGateway>,
    pub dispatcher: DeliveryDispatcher,
    pub scheduler: RetryScheduler,
    pub worker: PushDispatchWorker,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(DeliverySettings::default())
    }

    pub fn with_settings(settings: DeliverySettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(PresenceTracker::new());
        let queue = Arc::new(MemoryJobQueue::new(Duration::from_secs(60), Duration::from_secs(3600)));
        let provider = Arc::new(MockProvider::new(PushVendor::Fcm));
        let gateway = Arc::new(PushGateway::mock(provider.clone()));
        let repos = Repositories::memory(store.clone());
        let presence_store: Arc<dyn PresenceStore> = presence.clone();

        Self {
            dispatcher: DeliveryDispatcher::new(repos.clone(), presence_store.clone(), queue.clone(), settings),
            scheduler: RetryScheduler::new(repos.clone(), presence_store.clone(), queue.clone(), settings),
            worker: PushDispatchWorker::new(presence_store, repos.tokens.clone(), gateway.clone()),
            store,
            presence,
            queue,
            provider,
            gateway,
        }
    }

    /// 建一个会话，返回 conversation id
    pub fn conversation(&self, members: &[Uuid]) -> Uuid {
        let conversation = Uuid::new_v4();
        for member in members {
            self.store.add_member(conversation, *member);
        }
        conversation
    }

    pub fn text_message(&self, conversation: Uuid, sender: Uuid, body: &str) -> Message {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: conversation,
            sender_id: sender,
            content_type: ContentType::Text,
            body: body.to_string(),
            media_url: None,
            created_at: Utc::now(),
            delivered_at: None,
        };
        self.store.insert_message(message.clone());
        message
    }

    pub fn token(&self, user: Uuid, device: &str, platform: PushPlatform, token: &str) {
        self.store.insert_token(PushToken::new(user, device, platform, token));
    }

    pub fn push_jobs(&self) -> Vec<PushJob> {
        self.queue.pending_jobs(QueueName::Push)
    }

    pub fn retry_jobs(&self) -> Vec<RetryJob> {
        self.queue.pending_jobs(QueueName::MessageRetry)
    }

    /// 执行队列中所有待发推送任务（不论是否到期）
    pub async fn drain_push_jobs(&self) {
        for job in self.push_jobs() {
            self.worker.process(&job).await.unwrap();
        }
    }

    /// 把重试记录的下次执行时间拨到过去，模拟退避时间已到
    pub fn make_due(&self, message_id: Uuid, user_id: Uuid, device_id: &str) {
        let mut record: RetryRecord = self.store.retry_record(message_id, user_id, device_id).unwrap();
        record.next_attempt_at = Utc::now() - ChronoDuration::seconds(1);
        self.store.put_retry_record(record);
    }
}

pub fn memory_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.store.backend = courier::config::StoreBackend::Memory;
    config.queue.backend = courier::config::QueueBackend::Memory;
    config.presence.backend = courier::config::PresenceBackend::Memory;
    config.queue.poll_interval_ms = 10;
    config
}
