//! Push Gateway
//!
//! 把 FCM / APNs 统一为 `send(target, message) -> PushOutcome`。
//! 凭据在第一次使用时初始化并缓存；缺失或无法解析的凭据让该通道在进程生命周期内
//! 一直返回 `NotConfigured`，调用方既不报错也不吊销令牌。

use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::{PushConfig, PushMode};
use crate::model::PushPlatform;
use crate::push::provider::{ApnsProvider, FcmProvider, MockProvider, PushProvider};
use crate::push::types::{PushMessage, PushOutcome, PushTarget, PushVendor};

type SharedProvider = Option<Arc<dyn PushProvider>>;

pub struct PushGateway {
    config: PushConfig,
    client: Client,
    fcm: OnceCell<SharedProvider>,
    apns: OnceCell<SharedProvider>,
}

impl PushGateway {
    pub fn new(config: PushConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                warn!("[PUSH] Failed to build HTTP client ({}), using defaults", e);
                Client::new()
            });
        Self {
            config,
            client,
            fcm: OnceCell::new(),
            apns: OnceCell::new(),
        }
    }

    /// 直接指定各通道的 Provider（`None` 表示该通道未配置）
    pub fn with_providers(fcm: SharedProvider, apns: SharedProvider) -> Self {
        Self {
            config: PushConfig::default(),
            client: Client::new(),
            fcm: OnceCell::new_with(Some(fcm)),
            apns: OnceCell::new_with(Some(apns)),
        }
    }

    /// 两个通道都使用同一个 MockProvider
    pub fn mock(provider: Arc<MockProvider>) -> Self {
        let shared: Arc<dyn PushProvider> = provider;
        Self::with_providers(Some(shared.clone()), Some(shared))
    }

    async fn provider(&self, vendor: PushVendor) -> SharedProvider {
        let cell = match vendor {
            PushVendor::Fcm => &self.fcm,
            PushVendor::Apns => &self.apns,
        };
        cell.get_or_init(|| async { self.init_provider(vendor) })
            .await
            .clone()
    }

    fn init_provider(&self, vendor: PushVendor) -> SharedProvider {
        if self.config.mode == PushMode::Mock {
            info!("[PUSH] {} running in mock mode", vendor.as_str());
            return Some(Arc::new(MockProvider::new(vendor)));
        }

        let result = match vendor {
            PushVendor::Fcm => FcmProvider::from_config(
                self.client.clone(),
                self.config.fcm.service_account_json.as_deref(),
            )
            .map(|p| p.map(|p| Arc::new(p) as Arc<dyn PushProvider>)),
            PushVendor::Apns => ApnsProvider::from_config(self.client.clone(), &self.config.apns)
                .map(|p| p.map(|p| Arc::new(p) as Arc<dyn PushProvider>)),
        };

        match result {
            Ok(Some(provider)) => Some(provider),
            Ok(None) => {
                info!("[PUSH] {} credentials not configured", vendor.as_str());
                None
            }
            Err(e) => {
                warn!("[PUSH] {} init failed, disabled: {}", vendor.as_str(), e);
                None
            }
        }
    }

    /// 该平台是否有可用凭据
    pub async fn is_configured(&self, platform: PushPlatform) -> bool {
        self.provider(PushVendor::for_platform(platform)).await.is_some()
    }

    pub async fn send(&self, target: &PushTarget, message: &PushMessage) -> PushOutcome {
        match self.provider(PushVendor::for_platform(target.platform)).await {
            Some(provider) => provider.send(target, message).await,
            None => PushOutcome::NotConfigured,
        }
    }
}
