use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::info;

use crate::push::provider::provider_trait::PushProvider;
use crate::push::types::{PushMessage, PushOutcome, PushTarget, PushVendor};

/// 一次被记录的发送
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPush {
    pub target: PushTarget,
    pub message: PushMessage,
}

/// Mock Provider（用于测试和开发模式）
///
/// 不调用真实 API，只打印日志并记录发送；可按令牌预设返回结果。
pub struct MockProvider {
    vendor: PushVendor,
    sent: Mutex<Vec<SentPush>>,
    scripted: Mutex<HashMap<String, PushOutcome>>,
}

impl MockProvider {
    pub fn new(vendor: PushVendor) -> Self {
        Self {
            vendor,
            sent: Mutex::new(Vec::new()),
            scripted: Mutex::new(HashMap::new()),
        }
    }

    /// 之后发往 `token` 的推送都返回 `outcome`
    pub fn respond_with(&self, token: &str, outcome: PushOutcome) {
        self.scripted.lock().insert(token.to_string(), outcome);
    }

    pub fn sent(&self) -> Vec<SentPush> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, token: &str) -> Vec<SentPush> {
        self.sent
            .lock()
            .iter()
            .filter(|p| p.target.token == token)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl PushProvider for MockProvider {
    async fn send(&self, target: &PushTarget, message: &PushMessage) -> PushOutcome {
        info!(
            "[MOCK PUSH] platform={}, token={}, title={}, body={}, data={:?}",
            target.platform, target.token, message.title, message.body, message.data
        );
        self.sent.lock().push(SentPush {
            target: target.clone(),
            message: message.clone(),
        });
        self.scripted
            .lock()
            .get(&target.token)
            .cloned()
            .unwrap_or(PushOutcome::Delivered)
    }

    fn vendor(&self) -> PushVendor {
        self.vendor
    }
}
