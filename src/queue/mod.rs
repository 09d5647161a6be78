//! 任务队列
//!
//! 至少一次投递的延时任务队列。每个任务都带幂等键：同一个键在队列中
//! （等待、执行中、失败保留、完成保留窗口内）只会存在一份，重复入队返回
//! [`EnqueueOutcome::DuplicateIdempotencyKey`]，调用方按成功处理。

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Result, ServerError};

pub use memory::MemoryJobQueue;
pub use self::redis::RedisJobQueue;

/// 队列名称，每个队列对应一个工作池
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    /// 新消息投递
    #[serde(rename = "message")]
    Message,
    /// 推送发送
    #[serde(rename = "push")]
    Push,
    /// 消息级重试
    #[serde(rename = "message-retry")]
    MessageRetry,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [QueueName::Message, QueueName::Push, QueueName::MessageRetry];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Message => "message",
            QueueName::Push => "push",
            QueueName::MessageRetry => "message-retry",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务失败后的退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    /// 第 n 次失败后等待 base * 2^(n-1)
    Exponential { base_ms: u64 },
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential {
            base_ms: base.as_millis() as u64,
        }
    }

    /// `failures` 为已失败次数（从 1 开始）
    pub fn delay_for(&self, failures: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { base_ms } => {
                let shift = failures.saturating_sub(1);
                let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
                Duration::from_millis(base_ms.saturating_mul(factor))
            }
        }
    }
}

/// 入队参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub idempotency_key: String,
    pub delay: Duration,
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl EnqueueOptions {
    /// 默认：立即执行，最多 3 次，2 秒起指数退避
    pub fn new(idempotency_key: impl Into<String>) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            delay: Duration::ZERO,
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_millis(2_000)),
        }
    }

    pub fn for_job<J: Job>(job: &J) -> Self {
        Self::new(job.idempotency_key())
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_attempts(mut self, max_attempts: u32, backoff: Backoff) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }
}

/// 入队结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// 相同幂等键的任务已存在（或刚完成），本次入队没有效果
    DuplicateIdempotencyKey,
}

impl EnqueueOutcome {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, EnqueueOutcome::Enqueued)
    }
}

/// 队列中保存的任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// 即幂等键
    pub id: String,
    pub queue: QueueName,
    pub name: String,
    pub payload: serde_json::Value,
    /// 已失败次数
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl JobEnvelope {
    pub fn new(queue: QueueName, name: &str, payload: serde_json::Value, options: &EnqueueOptions) -> Self {
        Self {
            id: options.idempotency_key.clone(),
            queue,
            name: name.to_string(),
            payload,
            attempts_made: 0,
            max_attempts: options.max_attempts,
            backoff: options.backoff,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }

    /// 解析任务负载
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ServerError::Serialization(format!("invalid payload for job {} ({}): {}", self.id, self.name, e))
        })
    }

    /// 记录一次失败，返回重新执行前需要等待的时间；次数用尽返回 None
    fn record_failure(&mut self, error: &str, retryable: bool) -> Option<Duration> {
        self.attempts_made += 1;
        self.last_error = Some(error.to_string());
        if retryable && self.attempts_made < self.max_attempts {
            Some(self.backoff.delay_for(self.attempts_made))
        } else {
            None
        }
    }
}

/// `fail` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// 已按退避策略重新排期
    Retrying { delay: Duration },
    /// 次数用尽或不可重试，任务进入死信
    Dead,
}

/// 任务队列
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// 入队；幂等键冲突时返回 `DuplicateIdempotencyKey` 而不是错误
    async fn enqueue(
        &self,
        queue: QueueName,
        name: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome>;

    /// 领取一个到期任务；领取后在可见性超时内不会再被其他消费者领取
    async fn reserve(&self, queue: QueueName) -> Result<Option<JobEnvelope>>;

    /// 等待新任务或到期任务，最多等待 `timeout`
    async fn wait(&self, queue: QueueName, timeout: Duration);

    /// 确认任务完成
    async fn complete(&self, job: &JobEnvelope) -> Result<()>;

    /// 标记任务失败
    async fn fail(&self, job: &JobEnvelope, error: &str, retryable: bool) -> Result<FailOutcome>;
}

/// 可入队的任务类型
pub trait Job: Serialize + DeserializeOwned + Send + Sync {
    const QUEUE: QueueName;
    const NAME: &'static str;

    fn idempotency_key(&self) -> String;
}

/// 序列化任务并入队
pub async fn enqueue_job<J: Job>(
    queue: &dyn JobQueue,
    job: &J,
    options: EnqueueOptions,
) -> Result<EnqueueOutcome> {
    let payload = serde_json::to_value(job)?;
    queue.enqueue(J::QUEUE, J::NAME, payload, options).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_job_backoff() {
        let backoff = Backoff::exponential(Duration::from_millis(2_000));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(8));
        // 不会溢出
        assert_eq!(backoff.delay_for(200), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_record_failure_respects_max_attempts() {
        let options = EnqueueOptions::new("push:a:b:0");
        let mut job = JobEnvelope::new(QueueName::Push, "push", serde_json::json!({}), &options);

        assert_eq!(job.record_failure("timeout", true), Some(Duration::from_secs(2)));
        assert_eq!(job.record_failure("timeout", true), Some(Duration::from_secs(4)));
        assert_eq!(job.record_failure("timeout", true), None);
        assert_eq!(job.attempts_made, 3);
        assert_eq!(job.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_permanent_failure_is_dead_immediately() {
        let options = EnqueueOptions::new("deliver:x");
        let mut job = JobEnvelope::new(QueueName::Message, "deliver-message", serde_json::json!({}), &options);
        assert_eq!(job.record_failure("bad payload", false), None);
    }

    #[test]
    fn test_queue_name_serde() {
        assert_eq!(serde_json::to_string(&QueueName::MessageRetry).unwrap(), "\"message-retry\"");
        assert_eq!(QueueName::Push.to_string(), "push");
    }
}
