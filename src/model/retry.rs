use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 单条 (消息, 用户, 设备) 的离线推送重试状态
///
/// 设备 id 只在用户内唯一，所以键里带上用户。同一个键最多一条；所有写入都以当前 attempt 为条件，
/// 删除即是取消，之后的定时触发都会变成空操作。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub message_id: Uuid,
    pub device_id: String,
    pub user_id: Uuid,
    pub attempt: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl RetryRecord {
    /// 投递时创建的初始记录（attempt = 0，立即可执行）
    pub fn initial(message_id: Uuid, device_id: impl Into<String>, user_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            message_id,
            device_id: device_id.into(),
            user_id,
            attempt: 0,
            last_attempt_at: None,
            next_attempt_at: now,
            created_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at <= now
    }
}
