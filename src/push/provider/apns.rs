use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{maybe_base64, normalize_pem};
use crate::config::ApnsConfig;
use crate::error::{Result, ServerError};
use crate::push::provider::provider_trait::PushProvider;
use crate::push::types::{PushMessage, PushOutcome, PushTarget, PushVendor};

const PRODUCTION_HOST: &str = "https://api.push.apple.com";
const SANDBOX_HOST: &str = "https://api.sandbox.push.apple.com";
/// provider token 有效期 1 小时，提前刷新
const JWT_LIFETIME: Duration = Duration::from_secs(50 * 60);

/// 表示令牌已失效的 reason
const INVALID_TOKEN_REASONS: &[&str] = &["BadDeviceToken", "Unregistered", "DeviceTokenNotForTopic"];

#[derive(Serialize)]
struct ProviderClaims<'a> {
    iss: &'a str,
    iat: i64,
}

/// APNs (Apple Push Notification service) Provider
///
/// 使用 APNs HTTP/2 API + token 认证（.p8 密钥）
pub struct ApnsProvider {
    client: Client,
    host: &'static str,
    bundle_id: String,
    team_id: String,
    key_id: String,
    private_key: EncodingKey,
    jwt: Mutex<Option<(String, Instant)>>,
}

impl ApnsProvider {
    /// 从配置创建；四项凭据缺任一项返回 `Ok(None)`
    pub fn from_config(client: Client, config: &ApnsConfig) -> Result<Option<Self>> {
        let (Some(key_id), Some(team_id), Some(bundle_id), Some(key)) = (
            config.key_id.as_deref(),
            config.team_id.as_deref(),
            config.bundle_id.as_deref(),
            config.private_key.as_deref(),
        ) else {
            return Ok(None);
        };

        let pem = normalize_pem(&maybe_base64(key));
        let private_key = EncodingKey::from_ec_pem(pem.as_bytes())
            .map_err(|e| ServerError::Configuration(format!("Failed to parse APNs private key: {}", e)))?;

        let host = if config.environment.eq_ignore_ascii_case("production") {
            PRODUCTION_HOST
        } else {
            SANDBOX_HOST
        };

        info!("[APNs] Provider initialized (topic={}, host={})", bundle_id, host);

        Ok(Some(Self {
            client,
            host,
            bundle_id: bundle_id.to_string(),
            team_id: team_id.to_string(),
            key_id: key_id.to_string(),
            private_key,
            jwt: Mutex::new(None),
        }))
    }

    /// 生成（或复用）provider JWT
    fn provider_token(&self) -> Result<String> {
        let mut cached = self.jwt.lock();
        if let Some((token, issued_at)) = cached.as_ref() {
            if issued_at.elapsed() < JWT_LIFETIME {
                return Ok(token.clone());
            }
        }

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.key_id.clone());
        let claims = ProviderClaims {
            iss: &self.team_id,
            iat: chrono::Utc::now().timestamp(),
        };
        let token = encode(&header, &claims, &self.private_key)
            .map_err(|e| ServerError::Push(format!("Failed to generate APNs JWT: {}", e)))?;

        *cached = Some((token.clone(), Instant::now()));
        Ok(token)
    }

    /// 构建 APNs 消息 payload，自定义数据放在顶层
    fn build_payload(message: &PushMessage) -> Value {
        let mut payload = Map::new();
        for (key, value) in &message.data {
            payload.insert(key.clone(), Value::String(value.clone()));
        }
        payload.insert(
            "aps".to_string(),
            json!({
                "alert": {
                    "title": message.title,
                    "body": message.body
                },
                "sound": "default",
                "content-available": 1
            }),
        );
        Value::Object(payload)
    }

    /// 把 APNs 失败 reason 归类
    pub fn classify_reason(status: u16, reason: Option<&str>) -> PushOutcome {
        match reason {
            Some(reason) if INVALID_TOKEN_REASONS.contains(&reason) => {
                PushOutcome::InvalidToken(reason.to_string())
            }
            Some(reason) => PushOutcome::TransientError(format!("status={}, reason={}", status, reason)),
            None => PushOutcome::TransientError(format!("status={}", status)),
        }
    }
}

#[async_trait]
impl PushProvider for ApnsProvider {
    async fn send(&self, target: &PushTarget, message: &PushMessage) -> PushOutcome {
        let jwt = match self.provider_token() {
            Ok(jwt) => jwt,
            Err(e) => return PushOutcome::TransientError(e.to_string()),
        };

        let url = format!("{}/3/device/{}", self.host, target.token);
        let response = match self
            .client
            .post(&url)
            .header("authorization", format!("bearer {}", jwt))
            .header("apns-topic", &self.bundle_id)
            .header("apns-priority", "10")
            .header("apns-push-type", "alert")
            .json(&Self::build_payload(message))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return PushOutcome::TransientError(format!("APNs request failed: {}", e)),
        };

        let status = response.status();
        if status.is_success() {
            debug!("[APNs] Push sent");
            return PushOutcome::Delivered;
        }

        let body = response.text().await.unwrap_or_default();
        let reason = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("reason").and_then(|r| r.as_str()).map(str::to_string));

        let outcome = Self::classify_reason(status.as_u16(), reason.as_deref());
        warn!("[APNs] Push failed: status={}, outcome={:?}", status, outcome);
        outcome
    }

    fn vendor(&self) -> PushVendor {
        PushVendor::Apns
    }
}
