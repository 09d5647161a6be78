//! 基于 Redis 的共享在线状态
//!
//! `presence:devices:{user}` 有序集合，成员为设备 id，score 为最后一次连接 / 心跳的毫秒时间。
//! 超过 TTL 未刷新的设备视为离线，读取时顺带清理。
//! Redis 不可用时一律按离线处理（多发一条推送无害，漏发才有害）。

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use super::presence_tracker::PresenceStore;
use super::redis::RedisClient;

pub struct RedisPresenceStore {
    redis: Arc<RedisClient>,
    ttl: Duration,
}

impl RedisPresenceStore {
    pub fn new(redis: Arc<RedisClient>, ttl: Duration) -> Self {
        Self { redis, ttl }
    }

    fn key(user_id: Uuid) -> String {
        format!("presence:devices:{}", user_id)
    }

    fn stale_before(&self) -> i64 {
        Utc::now().timestamp_millis() - self.ttl.as_millis() as i64
    }

    /// 用户当前在线的设备（顺带清理过期成员）
    pub async fn online_devices(&self, user_id: Uuid) -> crate::error::Result<Vec<String>> {
        let key = Self::key(user_id);
        let cutoff = self.stale_before();
        self.redis.zrem_below(&key, cutoff).await?;
        self.redis.zrange_from(&key, cutoff).await
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn is_online(&self, user_id: Uuid) -> bool {
        match self.online_devices(user_id).await {
            Ok(devices) => !devices.is_empty(),
            Err(e) => {
                warn!("[PRESENCE] is_online({}) failed, treating as offline: {}", user_id, e);
                false
            }
        }
    }

    async fn is_device_online(&self, user_id: Uuid, device_id: &str) -> bool {
        match self.redis.zscore(&Self::key(user_id), device_id).await {
            Ok(Some(seen_at)) => seen_at >= self.stale_before(),
            Ok(None) => false,
            Err(e) => {
                warn!(
                    "[PRESENCE] is_device_online({}, {}) failed, treating as offline: {}",
                    user_id, device_id, e
                );
                false
            }
        }
    }

    async fn mark_connected(&self, user_id: Uuid, device_id: &str) {
        let key = Self::key(user_id);
        let now = Utc::now().timestamp_millis();
        if let Err(e) = self.redis.zadd(&key, now, device_id).await {
            warn!("[PRESENCE] mark_connected({}, {}) failed: {}", user_id, device_id, e);
            return;
        }
        if let Err(e) = self.redis.expire(&key, self.ttl.as_secs().max(1)).await {
            warn!("[PRESENCE] refresh ttl for {} failed: {}", user_id, e);
        }
    }

    async fn mark_disconnected(&self, user_id: Uuid, device_id: &str) {
        if let Err(e) = self.redis.zrem(&Self::key(user_id), device_id).await {
            warn!("[PRESENCE] mark_disconnected({}, {}) failed: {}", user_id, device_id, e);
        }
    }
}
