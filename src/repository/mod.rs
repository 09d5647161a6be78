//! 数据访问层
//!
//! 投递核心只依赖这里的 trait；Postgres 实现用于生产，`MemoryStore` 用于测试和开发模式。

pub mod memory;
pub mod message_repo;
pub mod push_token_repo;
pub mod retry_repo;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Message, PushPlatform, PushToken, RetryRecord};

pub use memory::MemoryStore;
pub use message_repo::PgMessageRepository;
pub use push_token_repo::PgPushTokenRepository;
pub use retry_repo::PgRetryRepository;

/// 消息与会话成员
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn find_message(&self, message_id: Uuid) -> Result<Option<Message>>;

    /// 会话中仍在的成员，排除 `exclude_user`（通常是发送者）
    async fn active_recipients(&self, conversation_id: Uuid, exclude_user: Uuid) -> Result<Vec<Uuid>>;

    /// 设置 delivered_at（仅当尚未设置），返回是否写入
    async fn mark_delivered(&self, message_id: Uuid, at: DateTime<Utc>) -> Result<bool>;
}

/// 设备推送令牌
#[async_trait]
pub trait PushTokenRepository: Send + Sync {
    /// 用户未吊销的令牌，可按设备过滤
    async fn active_tokens(&self, user_id: Uuid, device_id: Option<&str>) -> Result<Vec<PushToken>>;

    async fn active_tokens_for_users(&self, user_ids: &[Uuid]) -> Result<Vec<PushToken>>;

    /// 注册令牌：同一 (user, device) 覆盖旧令牌并清除吊销状态
    async fn register(
        &self,
        user_id: Uuid,
        device_id: &str,
        platform: PushPlatform,
        token: &str,
    ) -> Result<PushToken>;

    /// 吊销令牌，只匹配 (user, device, token) 完全一致的行，避免误伤刚轮换的新令牌
    async fn revoke(&self, user_id: Uuid, device_id: &str, token: &str, at: DateTime<Utc>) -> Result<bool>;
}

/// 重试记录，键为 (message, user, device)；更新和删除都以当前 attempt 为条件
#[async_trait]
pub trait RetryRepository: Send + Sync {
    /// 不存在时插入，返回是否插入
    async fn insert_if_absent(&self, record: &RetryRecord) -> Result<bool>;

    async fn find(&self, message_id: Uuid, user_id: Uuid, device_id: &str) -> Result<Option<RetryRecord>>;

    /// 当存储中的 attempt 仍为 `expected_attempt` 时写入 `record` 的新状态
    async fn advance(&self, record: &RetryRecord, expected_attempt: u32) -> Result<bool>;

    async fn delete(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        device_id: &str,
        expected_attempt: u32,
    ) -> Result<bool>;
}

/// 投递链路使用的全部仓储
#[derive(Clone)]
pub struct Repositories {
    pub messages: Arc<dyn MessageRepository>,
    pub tokens: Arc<dyn PushTokenRepository>,
    pub retries: Arc<dyn RetryRepository>,
}

impl Repositories {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            messages: Arc::new(PgMessageRepository::new(pool.clone())),
            tokens: Arc::new(PgPushTokenRepository::new(pool.clone())),
            retries: Arc::new(PgRetryRepository::new(pool)),
        }
    }

    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            messages: store.clone(),
            tokens: store.clone(),
            retries: store,
        }
    }
}
