//! Retry Scheduler
//!
//! 每个 (消息, 用户, 设备) 一条重试链：`Pending(a) -> Retired | Pending(a + 1) | Exhausted`。
//! 重试任务带着入队时的 attempt，和存储中的记录不一致就是过期触发，直接忽略；
//! attempt 一致但还没到 `next_attempt_at`（时钟偏差、毫秒截断）则按剩余时间重新排队；
//! 记录的推进和删除都以读到的 attempt 为条件，多个 worker 并发时只有一个能推进。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::jobs::RetryJob;
use super::DeliverySettings;
use crate::error::Result;
use crate::infra::metrics;
use crate::infra::{JobHandler, PresenceStore};
use crate::model::RetryRecord;
use crate::queue::{enqueue_job, EnqueueOptions, JobEnvelope, JobQueue, QueueName};
use crate::repository::Repositories;

/// 重试链结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetiredReason {
    DeviceOnline,
    TokenGone,
    MessageGone,
}

/// 一次触发的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// 记录已不存在（已被回收或级联删除）
    Missing,
    /// 已达到最大重试次数
    Exhausted,
    /// 过期的触发：attempt 不匹配，或被其他 worker 抢先推进
    Stale,
    /// 本轮提前触发，已按剩余时间重新排队
    Deferred { until: DateTime<Utc> },
    /// 记录已删除
    Retired(RetiredReason),
    /// 已推进到 `attempt` 并发出推送；`next_retry` 为是否还排了下一轮
    Rescheduled { attempt: u32, next_retry: bool },
}

impl RetryOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RetryOutcome::Missing => "missing",
            RetryOutcome::Exhausted => "exhausted",
            RetryOutcome::Stale => "stale",
            RetryOutcome::Deferred { .. } => "deferred",
            RetryOutcome::Retired(RetiredReason::DeviceOnline) => "retired_online",
            RetryOutcome::Retired(RetiredReason::TokenGone) => "retired_token_gone",
            RetryOutcome::Retired(RetiredReason::MessageGone) => "retired_message_gone",
            RetryOutcome::Rescheduled { .. } => "rescheduled",
        }
    }
}

pub struct RetryScheduler {
    repos: Repositories,
    presence: Arc<dyn PresenceStore>,
    queue: Arc<dyn JobQueue>,
    settings: DeliverySettings,
}

impl RetryScheduler {
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

    pub async fn fire(&self, job: &RetryJob) -> Result<RetryOutcome> {
        let outcome = self.evaluate(job).await?;
        debug!(
            "[RETRY] message={} device={} attempt={} -> {:?}",
            job.message_id, job.device_id, job.attempt, outcome
        );
        metrics::record_retry_outcome(outcome.label());
        Ok(outcome)
    }

    async fn evaluate(&self, job: &RetryJob) -> Result<RetryOutcome> {
        let policy = self.settings.retry;

        let Some(record) = self
            .repos
            .retries
            .find(job.message_id, job.user_id, &job.device_id)
            .await?
        else {
            return Ok(RetryOutcome::Missing);
        };

        if policy.is_exhausted(record.attempt) {
            return Ok(RetryOutcome::Exhausted);
        }

        let now = Utc::now();
        if record.attempt != job.attempt {
            return Ok(RetryOutcome::Stale);
        }
        if !record.is_due(now) {
            return self.defer(job, &record, now).await;
        }

        if self.presence.is_device_online(record.user_id, &record.device_id).await {
            return self.retire(&record, RetiredReason::DeviceOnline).await;
        }

        let tokens = self
            .repos
            .tokens
            .active_tokens(record.user_id, Some(&record.device_id))
            .await?;
        if tokens.is_empty() {
            return self.retire(&record, RetiredReason::TokenGone).await;
        }

        if self.repos.messages.find_message(record.message_id).await?.is_none() {
            return self.retire(&record, RetiredReason::MessageGone).await;
        }

        let delay = policy.delay_for(record.attempt);
        let attempt = record.attempt + 1;
        let next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let advanced = RetryRecord {
            attempt,
            last_attempt_at: Some(now),
            next_attempt_at,
            ..record.clone()
        };

        if !self.repos.retries.advance(&advanced, record.attempt).await? {
            return Ok(RetryOutcome::Stale);
        }

        let push = job.push_job(attempt);
        enqueue_job(self.queue.as_ref(), &push, self.settings.enqueue_options(&push)).await?;

        let next_retry = !policy.is_exhausted(attempt);
        if next_retry {
            let next = job.next(attempt);
            let options = self.settings.enqueue_options(&next).with_delay(delay);
            enqueue_job(self.queue.as_ref(), &next, options).await?;
        } else {
            info!(
                "[RETRY] message={} device={} reached {} attempts, final push sent",
                record.message_id, record.device_id, attempt
            );
        }

        Ok(RetryOutcome::Rescheduled { attempt, next_retry })
    }

    /// 同一轮再排一次，到 `next_attempt_at` 时重新触发
    async fn defer(&self, job: &RetryJob, record: &RetryRecord, now: DateTime<Utc>) -> Result<RetryOutcome> {
        let remaining = (record.next_attempt_at - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(self.settings.retry.max_delay);
        // 向上取整到毫秒，Redis 队列按毫秒计分
        let wait = Duration::from_millis(remaining.as_micros().div_ceil(1_000) as u64);

        let options = EnqueueOptions {
            idempotency_key: job.deferral_key(now),
            ..self.settings.enqueue_options(job).with_delay(wait)
        };
        enqueue_job(self.queue.as_ref(), job, options).await?;

        debug!(
            "[RETRY] message={} device={} attempt={} fired {:?} early, deferred",
            job.message_id, job.device_id, job.attempt, remaining
        );
        Ok(RetryOutcome::Deferred {
            until: record.next_attempt_at,
        })
    }

    async fn retire(&self, record: &RetryRecord, reason: RetiredReason) -> Result<RetryOutcome> {
        if !self
            .repos
            .retries
            .delete(record.message_id, record.user_id, &record.device_id, record.attempt)
            .await?
        {
            warn!(
                "[RETRY] message={} device={} changed before retire ({:?}), leaving it",
                record.message_id, record.device_id, reason
            );
            return Ok(RetryOutcome::Stale);
        }
        Ok(RetryOutcome::Retired(reason))
    }
}

#[async_trait]
impl JobHandler for RetryScheduler {
    fn queue(&self) -> QueueName {
        QueueName::MessageRetry
    }

    async fn handle(&self, job: &JobEnvelope) -> Result<()> {
        let payload: RetryJob = job.decode()?;
        self.fire(&payload).await?;
        Ok(())
    }
}
