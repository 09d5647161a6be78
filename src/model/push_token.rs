use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 推送平台
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushPlatform {
    Android,
    Ios,
    Web,
    Desktop,
}

impl PushPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushPlatform::Android => "android",
            PushPlatform::Ios => "ios",
            PushPlatform::Web => "web",
            PushPlatform::Desktop => "desktop",
        }
    }
}

impl FromStr for PushPlatform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "android" => Ok(PushPlatform::Android),
            "ios" => Ok(PushPlatform::Ios),
            "web" => Ok(PushPlatform::Web),
            "desktop" => Ok(PushPlatform::Desktop),
            other => Err(format!("unknown push platform: {}", other)),
        }
    }
}

impl fmt::Display for PushPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 设备推送令牌
///
/// 每个 (user_id, device_id) 只保留一条，重新注册会覆盖旧令牌。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_id: String,
    pub platform: PushPlatform,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 非空表示已吊销，不再用于发送
    pub revoked_at: Option<DateTime<Utc>>,
}

impl PushToken {
    pub fn new(user_id: Uuid, device_id: impl Into<String>, platform: PushPlatform, token: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            device_id: device_id.into(),
            platform,
            token: token.into(),
            created_at: now,
            updated_at: now,
            revoked_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }
}
