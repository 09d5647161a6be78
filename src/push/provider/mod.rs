pub mod apns;
pub mod fcm;
pub mod mock;
pub mod provider_trait;

pub use apns::ApnsProvider;
pub use fcm::FcmProvider;
pub use mock::{MockProvider, SentPush};
pub use provider_trait::PushProvider;

use base64::Engine;

/// 凭据既可能是原文也可能是 base64；含 PEM 头的按原文处理
pub(crate) fn maybe_base64(value: &str) -> String {
    if value.contains("BEGIN") || value.trim_start().starts_with('{') {
        return value.to_string();
    }
    base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| value.to_string())
}

/// 环境变量里的私钥常把换行写成字面量 `\n`
pub(crate) fn normalize_pem(value: &str) -> String {
    if value.contains("\\n") {
        value.replace("\\n", "\n")
    } else {
        value.to_string()
    }
}
