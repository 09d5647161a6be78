//! Delivery Dispatcher
//!
//! 处理 `deliver-message` 任务：
//! 1. 读取消息与会话中的有效接收者（排除发送者和已退出成员）
//! 2. 任一接收者在线则写入 `delivered_at`
//! 3. 离线接收者的每个设备令牌：建立重试记录，入队第 0 轮推送和第一个重试任务

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::jobs::{DeliverMessageJob, PushJob, RetryJob};
use super::DeliverySettings;
use crate::error::Result;
use crate::infra::metrics;
use crate::infra::{JobHandler, PresenceStore};
use crate::model::RetryRecord;
use crate::queue::{enqueue_job, EnqueueOutcome, JobEnvelope, JobQueue, QueueName};
use crate::repository::Repositories;

/// 一次分发的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub recipients: usize,
    pub online_recipients: usize,
    /// 离线接收者的有效设备数
    pub offline_devices: usize,
    pub records_created: usize,
    pub push_jobs_enqueued: usize,
    pub retry_jobs_enqueued: usize,
}

pub struct DeliveryDispatcher {
    repos: Repositories,
    presence: Arc<dyn PresenceStore>,
    queue: Arc<dyn JobQueue>,
    settings: DeliverySettings,
}

impl DeliveryDispatcher {
    pub fn new(
        repos: Repositories,
        presence: Arc<dyn PresenceStore>,
        queue: Arc<dyn JobQueue>,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            repos,
            presence,
            queue,
            settings,
        }
    }

    /// 提交一条新消息等待投递（由消息写入方在落库后调用）
    pub async fn submit(&self, message_id: Uuid) -> Result<EnqueueOutcome> {
        let job = DeliverMessageJob { message_id };
        let outcome = enqueue_job(self.queue.as_ref(), &job, self.settings.enqueue_options(&job)).await?;
        debug!("[DISPATCHER] Submitted message {}: {:?}", message_id, outcome);
        Ok(outcome)
    }

    /// 分发一条消息；消息不存在时返回 `None`
    pub async fn dispatch(&self, message_id: Uuid) -> Result<Option<DispatchReport>> {
        let Some(message) = self.repos.messages.find_message(message_id).await? else {
            debug!("[DISPATCHER] Message {} not found, skipping", message_id);
            return Ok(None);
        };

        let recipients = self
            .repos
            .messages
            .active_recipients(message.conversation_id, message.sender_id)
            .await?;

        let mut report = DispatchReport {
            recipients: recipients.len(),
            ..Default::default()
        };

        let mut offline = Vec::with_capacity(recipients.len());
        for user_id in recipients {
            if self.presence.is_online(user_id).await {
                report.online_recipients += 1;
            } else {
                offline.push(user_id);
            }
        }

        if report.online_recipients > 0 {
            let marked = self.repos.messages.mark_delivered(message.id, Utc::now()).await?;
            debug!("[DISPATCHER] Message {} delivered live (first mark: {})", message.id, marked);
        }

        if offline.is_empty() {
            info!(
                "[DISPATCHER] Message {}: {} recipient(s), all online",
                message.id, report.recipients
            );
            metrics::record_dispatched(report.online_recipients, 0);
            return Ok(Some(report));
        }

        let preview = message.preview(self.settings.preview_chars);
        let tokens = self.repos.tokens.active_tokens_for_users(&offline).await?;

        for token in tokens {
            // 用户级查询之后设备可能刚连上
            if self.presence.is_device_online(token.user_id, &token.device_id).await {
                continue;
            }
            report.offline_devices += 1;

            let now = Utc::now();
            let record = RetryRecord::initial(message.id, token.device_id.clone(), token.user_id, now);
            if self.repos.retries.insert_if_absent(&record).await? {
                report.records_created += 1;
            }

            let retry = RetryJob {
                message_id: message.id,
                device_id: token.device_id.clone(),
                user_id: token.user_id,
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                preview: preview.clone(),
                attempt: 0,
            };

            let push = retry.push_job(0);
            if self.enqueue_push(&push).await?.is_enqueued() {
                report.push_jobs_enqueued += 1;
            }

            let options = self
                .settings
                .enqueue_options(&retry)
                .with_delay(self.settings.retry.base_delay);
            if enqueue_job(self.queue.as_ref(), &retry, options).await?.is_enqueued() {
                report.retry_jobs_enqueued += 1;
            }
        }

        info!(
            "[DISPATCHER] Message {}: {} recipient(s), {} online, {} offline device(s), {} push job(s)",
            message.id,
            report.recipients,
            report.online_recipients,
            report.offline_devices,
            report.push_jobs_enqueued
        );
        metrics::record_dispatched(report.online_recipients, report.offline_devices);

        Ok(Some(report))
    }

    async fn enqueue_push(&self, job: &PushJob) -> Result<EnqueueOutcome> {
        enqueue_job(self.queue.as_ref(), job, self.settings.enqueue_options(job)).await
    }
}

#[async_trait]
impl JobHandler for DeliveryDispatcher {
    fn queue(&self) -> QueueName {
        QueueName::Message
    }

    async fn handle(&self, job: &JobEnvelope) -> Result<()> {
        let payload: DeliverMessageJob = job.decode()?;
        self.dispatch(payload.message_id).await?;
        Ok(())
    }
}
