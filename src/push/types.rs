use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::PushPlatform;

/// 推送通道
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PushVendor {
    Apns,
    Fcm,
}

impl PushVendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushVendor::Apns => "apns",
            PushVendor::Fcm => "fcm",
        }
    }

    /// iOS 走 APNs，其余平台（Android / Web / 桌面）走 FCM
    pub fn for_platform(platform: PushPlatform) -> Self {
        match platform {
            PushPlatform::Ios => PushVendor::Apns,
            PushPlatform::Android | PushPlatform::Web | PushPlatform::Desktop => PushVendor::Fcm,
        }
    }
}

/// 推送目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushTarget {
    pub token: String,
    pub platform: PushPlatform,
}

/// 推送内容
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
}

/// 一次发送的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// 该平台没有可用凭据
    NotConfigured,
    /// 平台明确告知令牌已失效
    InvalidToken(String),
    /// 其他失败（网络、5xx、未知错误码）
    TransientError(String),
}

impl PushOutcome {
    /// 指标标签
    pub fn label(&self) -> &'static str {
        match self {
            PushOutcome::Delivered => "delivered",
            PushOutcome::NotConfigured => "not_configured",
            PushOutcome::InvalidToken(_) => "invalid_token",
            PushOutcome::TransientError(_) => "transient_error",
        }
    }
}
