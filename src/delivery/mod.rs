//! 消息投递
//!
//! - `dispatcher`：新消息到达后按在线状态分流（在线直接标记送达，离线走推送 + 重试）
//! - `scheduler`：消息级重试状态机
//! - `jobs`：三个队列的任务定义

pub mod backoff;
pub mod dispatcher;
pub mod jobs;
pub mod scheduler;

use std::time::Duration;

use crate::config::ServerConfig;
use crate::queue::{Backoff, EnqueueOptions, Job};

pub use backoff::RetryPolicy;
pub use dispatcher::{DeliveryDispatcher, DispatchReport};
pub use jobs::{DeliverMessageJob, PushJob, PushKind, RetryJob};
pub use scheduler::{RetiredReason, RetryOutcome, RetryScheduler};

/// 投递链路的可调参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliverySettings {
    /// 文本消息推送预览的最大字符数
    pub preview_chars: usize,
    pub retry: RetryPolicy,
    /// 队列层面（基础设施故障）的执行次数
    pub job_attempts: u32,
    pub job_backoff: Backoff,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            preview_chars: 140,
            retry: RetryPolicy::default(),
            job_attempts: 3,
            job_backoff: Backoff::exponential(Duration::from_millis(2_000)),
        }
    }
}

impl DeliverySettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            preview_chars: config.retry.preview_chars,
            retry: RetryPolicy::from_config(&config.retry),
            job_attempts: config.queue.job_attempts,
            job_backoff: Backoff::exponential(config.queue.job_backoff()),
        }
    }

    /// 带本配置重试参数的入队选项
    pub fn enqueue_options<J: Job>(&self, job: &J) -> EnqueueOptions {
        EnqueueOptions::for_job(job).with_attempts(self.job_attempts, self.job_backoff)
    }
}
