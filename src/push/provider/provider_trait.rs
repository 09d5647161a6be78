use async_trait::async_trait;

use crate::push::types::{PushMessage, PushOutcome, PushTarget, PushVendor};

/// Push Provider Trait（推送提供者接口）
///
/// 平台错误在 Provider 内部归类为 [`PushOutcome`]，不以 `Err` 形式向外抛出。
#[async_trait]
pub trait PushProvider: Send + Sync {
    /// 发送推送
    async fn send(&self, target: &PushTarget, message: &PushMessage) -> PushOutcome;

    /// 获取 Provider 对应的 Vendor
    fn vendor(&self) -> PushVendor;
}
