use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::delivery::jobs::PushJob;
use crate::error::Result;
use crate::infra::metrics;
use crate::infra::{JobHandler, PresenceStore};
use crate::push::gateway::PushGateway;
use crate::push::types::{PushOutcome, PushTarget};
use crate::queue::{JobEnvelope, QueueName};
use crate::repository::PushTokenRepository;

/// 一次推送任务的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub targets: usize,
    pub sent: usize,
    pub skipped_online: usize,
    pub skipped_unconfigured: usize,
    pub revoked: usize,
    pub transient_failures: usize,
}

/// Push Dispatch Worker（推送分发工作器）
///
/// 职责：
/// - 查询目标用户（或指定设备）未吊销的推送令牌
/// - 跳过已在线的设备和未配置凭据的平台
/// - 通过 Gateway 发送，令牌失效时精确吊销该令牌
///
/// 发送失败不会让任务失败：令牌失效已处理，临时错误由消息级重试兜底。
pub struct PushDispatchWorker {
    presence: Arc<dyn PresenceStore>,
    tokens: Arc<dyn PushTokenRepository>,
    gateway: Arc<PushGateway>,
}

impl PushDispatchWorker {
    pub fn new(
        presence: Arc<dyn PresenceStore>,
        tokens: Arc<dyn PushTokenRepository>,
        gateway: Arc<PushGateway>,
    ) -> Self {
        Self {
            presence,
            tokens,
            gateway,
        }
    }

    pub async fn process(&self, job: &PushJob) -> Result<PushReport> {
        let tokens = self
            .tokens
            .active_tokens(job.user_id, job.device_id.as_deref())
            .await?;

        let mut report = PushReport {
            targets: tokens.len(),
            ..Default::default()
        };
        if tokens.is_empty() {
            debug!(
                "[PUSH WORKER] No active tokens: user={}, device={:?}",
                job.user_id, job.device_id
            );
            return Ok(report);
        }

        let message = job.to_push_message();

        for token in tokens {
            if self.presence.is_device_online(token.user_id, &token.device_id).await {
                debug!("[PUSH WORKER] Device {} online, skipping push", token.device_id);
                report.skipped_online += 1;
                continue;
            }

            if !self.gateway.is_configured(token.platform).await {
                debug!(
                    "[PUSH WORKER] Platform {} not configured, skipping device {}",
                    token.platform, token.device_id
                );
                report.skipped_unconfigured += 1;
                continue;
            }

            let target = PushTarget {
                token: token.token.clone(),
                platform: token.platform,
            };
            let outcome = self.gateway.send(&target, &message).await;
            metrics::record_push(token.platform.as_str(), outcome.label());

            match outcome {
                PushOutcome::Delivered => {
                    report.sent += 1;
                }
                PushOutcome::NotConfigured => {
                    report.skipped_unconfigured += 1;
                }
                PushOutcome::InvalidToken(reason) => {
                    let revoked = self
                        .tokens
                        .revoke(token.user_id, &token.device_id, &token.token, Utc::now())
                        .await?;
                    if revoked {
                        report.revoked += 1;
                        metrics::record_token_revoked();
                    }
                    info!(
                        "[PUSH WORKER] Token revoked: user={}, device={}, reason={}",
                        token.user_id, token.device_id, reason
                    );
                }
                PushOutcome::TransientError(detail) => {
                    report.transient_failures += 1;
                    warn!(
                        "[PUSH WORKER] Transient push failure: user={}, device={}, error={}",
                        token.user_id, token.device_id, detail
                    );
                }
            }
        }

        debug!("[PUSH WORKER] user={} -> {:?}", job.user_id, report);
        Ok(report)
    }
}

#[async_trait]
impl JobHandler for PushDispatchWorker {
    fn queue(&self) -> QueueName {
        QueueName::Push
    }

    async fn handle(&self, job: &JobEnvelope) -> Result<()> {
        let payload: PushJob = job.decode()?;
        self.process(&payload).await?;
        Ok(())
    }
}
