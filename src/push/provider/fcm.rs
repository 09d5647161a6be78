use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{maybe_base64, normalize_pem};
use crate::error::{Result, ServerError};
use crate::push::provider::provider_trait::PushProvider;
use crate::push::types::{PushMessage, PushOutcome, PushTarget, PushVendor};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const JWT_BEARER_GRANT: &str = "urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer";
/// access token 到期前提前刷新的余量
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// 表示令牌已失效的错误码
const INVALID_TOKEN_CODES: &[&str] = &[
    "UNREGISTERED",
    "messaging/registration-token-not-registered",
    "messaging/invalid-registration-token",
];

/// service account JSON 中用到的字段
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccount {
    pub project_id: String,
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl ServiceAccount {
    /// 解析 service account（JSON 原文或 base64）
    pub fn parse(raw: &str) -> Result<Self> {
        let mut account: ServiceAccount = serde_json::from_str(raw)
            .or_else(|_| serde_json::from_str(&maybe_base64(raw)))
            .map_err(|e| ServerError::Configuration(format!("FCM service account JSON invalid: {}", e)))?;
        account.private_key = normalize_pem(&account.private_key);
        Ok(account)
    }
}

#[derive(Serialize)]
struct GrantClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// FCM (Firebase Cloud Messaging) Provider
///
/// 使用 FCM HTTP v1 API，OAuth2 access token 通过 service account 签发的 JWT 换取并缓存
pub struct FcmProvider {
    client: Client,
    project_id: String,
    client_email: String,
    token_uri: String,
    signing_key: EncodingKey,
    access_token: Mutex<Option<CachedToken>>,
}

impl FcmProvider {
    pub fn new(client: Client, account: ServiceAccount) -> Result<Self> {
        let signing_key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
            .map_err(|e| ServerError::Configuration(format!("FCM private key invalid: {}", e)))?;
        Ok(Self {
            client,
            project_id: account.project_id,
            client_email: account.client_email,
            token_uri: account.token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            signing_key,
            access_token: Mutex::new(None),
        })
    }

    /// 从配置创建；未配置返回 `Ok(None)`
    pub fn from_config(client: Client, service_account_json: Option<&str>) -> Result<Option<Self>> {
        let Some(raw) = service_account_json.filter(|s| !s.trim().is_empty()) else {
            return Ok(None);
        };
        let account = ServiceAccount::parse(raw)?;
        let provider = Self::new(client, account)?;
        info!("[FCM] Provider initialized for project {}", provider.project_id);
        Ok(Some(provider))
    }

    /// 获取 access token（缓存命中直接返回；锁不跨 await 持有）
    async fn access_token(&self) -> Result<String> {
        if let Some(cached) = self.access_token.lock().as_ref() {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.value.clone());
            }
        }

        let now = chrono::Utc::now().timestamp();
        let claims = GrantClaims {
            iss: &self.client_email,
            scope: FCM_SCOPE,
            aud: &self.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
            .map_err(|e| ServerError::Push(format!("FCM JWT signing failed: {}", e)))?;

        let response = self
            .client
            .post(&self.token_uri)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(format!("grant_type={}&assertion={}", JWT_BEARER_GRANT, assertion))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ServerError::Push(format!(
                "FCM token exchange failed: status={}, error={}",
                status, body
            )));
        }

        let token: TokenResponse = response.json().await?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        *self.access_token.lock() = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        debug!("[FCM] Access token refreshed (expires_in={}s)", token.expires_in);

        Ok(token.access_token)
    }

    /// 构建 FCM 消息 payload
    fn build_payload(target: &PushTarget, message: &PushMessage) -> serde_json::Value {
        json!({
            "message": {
                "token": target.token,
                "notification": {
                    "title": message.title,
                    "body": message.body
                },
                "data": message.data,
                "android": {
                    "priority": "high"
                },
                "webpush": {
                    "headers": {
                        "Urgency": "high"
                    }
                }
            }
        })
    }

    /// 把 FCM 错误响应归类
    pub fn classify_error(status: StatusCode, body: &str) -> PushOutcome {
        let parsed: serde_json::Value = serde_json::from_str(body).unwrap_or_default();
        let error = &parsed["error"];

        let mut codes: Vec<&str> = error["details"]
            .as_array()
            .map(|details| {
                details
                    .iter()
                    .filter_map(|d| d["errorCode"].as_str())
                    .collect()
            })
            .unwrap_or_default();
        if let Some(status_code) = error["status"].as_str() {
            codes.push(status_code);
        }

        if let Some(code) = codes.iter().find(|c| INVALID_TOKEN_CODES.contains(c)) {
            return PushOutcome::InvalidToken(code.to_string());
        }

        let detail = error["message"].as_str().unwrap_or(body);
        PushOutcome::TransientError(format!("status={}, error={}", status, detail))
    }
}

#[async_trait]
impl PushProvider for FcmProvider {
    async fn send(&self, target: &PushTarget, message: &PushMessage) -> PushOutcome {
        let access_token = match self.access_token().await {
            Ok(token) => token,
            Err(e) => return PushOutcome::TransientError(e.to_string()),
        };

        let url = format!(
            "https://fcm.googleapis.com/v1/projects/{}/messages:send",
            self.project_id
        );

        let response = match self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", access_token))
            .json(&Self::build_payload(target, message))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return PushOutcome::TransientError(format!("FCM request failed: {}", e)),
        };

        let status = response.status();
        if status.is_success() {
            debug!("[FCM] Push sent: platform={}", target.platform);
            return PushOutcome::Delivered;
        }

        if status == StatusCode::UNAUTHORIZED {
            // 令牌可能被提前吊销，下次重新换取
            self.access_token.lock().take();
        }

        let body = response.text().await.unwrap_or_default();
        let outcome = Self::classify_error(status, &body);
        warn!("[FCM] Push failed: status={}, outcome={:?}", status, outcome);
        outcome
    }

    fn vendor(&self) -> PushVendor {
        PushVendor::Fcm
    }
}
