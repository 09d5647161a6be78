//! 内存数据存储
//!
//! 同时实现三个仓储 trait，语义与 Postgres 实现保持一致（条件更新、级联删除、唯一约束）。
//! 可以通过 `set_unavailable` 模拟数据库故障。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::{MessageRepository, PushTokenRepository, RetryRepository};
use crate::error::{Result, ServerError};
use crate::model::{ConversationMember, Message, PushPlatform, PushToken, RetryRecord};

#[derive(Default)]
struct Tables {
    messages: HashMap<Uuid, Message>,
    members: Vec<ConversationMember>,
    tokens: Vec<PushToken>,
    retries: HashMap<(Uuid, Uuid, String), RetryRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 打开后所有仓储调用返回 `ServerError::Database`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(ServerError::Database("memory store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    pub fn insert_message(&self, message: Message) {
        self.tables.lock().messages.insert(message.id, message);
    }

    /// 删除消息，级联删除其重试记录
    pub fn remove_message(&self, message_id: Uuid) {
        let mut tables = self.tables.lock();
        tables.messages.remove(&message_id);
        tables.retries.retain(|(mid, _, _), _| *mid != message_id);
    }

    pub fn message(&self, message_id: Uuid) -> Option<Message> {
        self.tables.lock().messages.get(&message_id).cloned()
    }

    pub fn add_member(&self, conversation_id: Uuid, user_id: Uuid) {
        let mut tables = self.tables.lock();
        tables
            .members
            .retain(|m| !(m.conversation_id == conversation_id && m.user_id == user_id));
        tables.members.push(ConversationMember {
            conversation_id,
            user_id,
            left_at: None,
        });
    }

    pub fn leave_conversation(&self, conversation_id: Uuid, user_id: Uuid) {
        let now = Utc::now();
        for member in self.tables.lock().members.iter_mut() {
            if member.conversation_id == conversation_id && member.user_id == user_id {
                member.left_at = Some(now);
            }
        }
    }

    /// 直接写入一条令牌行（不做唯一性处理）
    pub fn insert_token(&self, token: PushToken) {
        self.tables.lock().tokens.push(token);
    }

    /// 删除设备的令牌行
    pub fn remove_token(&self, user_id: Uuid, device_id: &str) {
        self.tables
            .lock()
            .tokens
            .retain(|t| !(t.user_id == user_id && t.device_id == device_id));
    }

    pub fn tokens(&self) -> Vec<PushToken> {
        self.tables.lock().tokens.clone()
    }

    pub fn token_for(&self, user_id: Uuid, device_id: &str) -> Option<PushToken> {
        self.tables
            .lock()
            .tokens
            .iter()
            .find(|t| t.user_id == user_id && t.device_id == device_id)
            .cloned()
    }

    pub fn retry_records(&self) -> Vec<RetryRecord> {
        let mut records: Vec<RetryRecord> = self.tables.lock().retries.values().cloned().collect();
        records.sort_by(|a, b| {
            (a.message_id, a.user_id, &a.device_id).cmp(&(b.message_id, b.user_id, &b.device_id))
        });
        records
    }

    pub fn retry_record(&self, message_id: Uuid, user_id: Uuid, device_id: &str) -> Option<RetryRecord> {
        self.tables
            .lock()
            .retries
            .get(&(message_id, user_id, device_id.to_string()))
            .cloned()
    }

    /// 直接覆盖一条重试记录
    pub fn put_retry_record(&self, record: RetryRecord) {
        self.tables
            .lock()
            .retries
            .insert((record.message_id, record.user_id, record.device_id.clone()), record);
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn find_message(&self, message_id: Uuid) -> Result<Option<Message>> {
        self.check()?;
        Ok(self.message(message_id))
    }

    async fn active_recipients(&self, conversation_id: Uuid, exclude_user: Uuid) -> Result<Vec<Uuid>> {
        self.check()?;
        let mut users: Vec<Uuid> = self
            .tables
            .lock()
            .members
            .iter()
            .filter(|m| m.conversation_id == conversation_id && m.user_id != exclude_user && m.is_active())
            .map(|m| m.user_id)
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }

    async fn mark_delivered(&self, message_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        self.check()?;
        let mut tables = self.tables.lock();
        match tables.messages.get_mut(&message_id) {
            Some(message) if message.delivered_at.is_none() => {
                message.delivered_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl PushTokenRepository for MemoryStore {
    async fn active_tokens(&self, user_id: Uuid, device_id: Option<&str>) -> Result<Vec<PushToken>> {
        self.check()?;
        let mut tokens: Vec<PushToken> = self
            .tables
            .lock()
            .tokens
            .iter()
            .filter(|t| t.user_id == user_id && t.is_active())
            .filter(|t| device_id.map_or(true, |d| t.device_id == d))
            .cloned()
            .collect();
        tokens.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(tokens)
    }

    async fn active_tokens_for_users(&self, user_ids: &[Uuid]) -> Result<Vec<PushToken>> {
        self.check()?;
        let mut tokens: Vec<PushToken> = self
            .tables
            .lock()
            .tokens
            .iter()
            .filter(|t| user_ids.contains(&t.user_id) && t.is_active())
            .cloned()
            .collect();
        tokens.sort_by(|a, b| (a.user_id, &a.device_id).cmp(&(b.user_id, &b.device_id)));
        Ok(tokens)
    }

    async fn register(
        &self,
        user_id: Uuid,
        device_id: &str,
        platform: PushPlatform,
        token: &str,
    ) -> Result<PushToken> {
        self.check()?;
        let now = Utc::now();
        let mut tables = self.tables.lock();
        tables
            .tokens
            .retain(|t| !(t.token == token && !(t.user_id == user_id && t.device_id == device_id)));

        if let Some(existing) = tables
            .tokens
            .iter_mut()
            .find(|t| t.user_id == user_id && t.device_id == device_id)
        {
            existing.platform = platform;
            existing.token = token.to_string();
            existing.updated_at = now;
            existing.revoked_at = None;
            return Ok(existing.clone());
        }

        let created = PushToken::new(user_id, device_id, platform, token);
        tables.tokens.push(created.clone());
        Ok(created)
    }

    async fn revoke(&self, user_id: Uuid, device_id: &str, token: &str, at: DateTime<Utc>) -> Result<bool> {
        self.check()?;
        let mut tables = self.tables.lock();
        let mut revoked = false;
        for row in tables.tokens.iter_mut().filter(|t| {
            t.user_id == user_id && t.device_id == device_id && t.token == token && t.revoked_at.is_none()
        }) {
            row.revoked_at = Some(at);
            row.updated_at = at;
            revoked = true;
        }
        Ok(revoked)
    }
}

#[async_trait]
impl RetryRepository for MemoryStore {
    async fn insert_if_absent(&self, record: &RetryRecord) -> Result<bool> {
        self.check()?;
        let mut tables = self.tables.lock();
        if !tables.messages.contains_key(&record.message_id) {
            return Err(ServerError::Database(format!(
                "retry record references missing message {}",
                record.message_id
            )));
        }
        let key = (record.message_id, record.user_id, record.device_id.clone());
        if tables.retries.contains_key(&key) {
            return Ok(false);
        }
        tables.retries.insert(key, record.clone());
        Ok(true)
    }

    async fn find(&self, message_id: Uuid, user_id: Uuid, device_id: &str) -> Result<Option<RetryRecord>> {
        self.check()?;
        Ok(self.retry_record(message_id, user_id, device_id))
    }

    async fn advance(&self, record: &RetryRecord, expected_attempt: u32) -> Result<bool> {
        self.check()?;
        let mut tables = self.tables.lock();
        match tables
            .retries
            .get_mut(&(record.message_id, record.user_id, record.device_id.clone()))
        {
            Some(stored) if stored.attempt == expected_attempt => {
                stored.attempt = record.attempt;
                stored.last_attempt_at = record.last_attempt_at;
                stored.next_attempt_at = record.next_attempt_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        device_id: &str,
        expected_attempt: u32,
    ) -> Result<bool> {
        self.check()?;
        let mut tables = self.tables.lock();
        let key = (message_id, user_id, device_id.to_string());
        match tables.retries.get(&key) {
            Some(stored) if stored.attempt == expected_attempt => {
                tables.retries.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
