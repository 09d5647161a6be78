//! Redis 持久任务队列
//!
//! 布局：
//! - `courier:{jobs}:job:<id>`：任务 JSON，`SET NX` 创建，即幂等键本身
//! - `courier:{jobs}:queue:<queue>`：有序集合，score 为可执行时间（毫秒）
//! - `courier:{jobs}:queue:<queue>:dead`：死信任务 id 列表
//!
//! 领取时把 score 推后一个可见性超时作为租约；进程崩溃时任务在租约到期后重新可见。
//!
//! 领取脚本在服务端按 id 拼出任务键，没有在 KEYS 中声明。所有键共用 `{jobs}` hash tag，
//! 在 Redis Cluster 上落在同一个 slot；脚本只访问这一个 slot。

use ::redis::Script;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{EnqueueOptions, EnqueueOutcome, FailOutcome, JobEnvelope, JobQueue, QueueName};
use crate::error::{Result, ServerError};
use crate::infra::redis::RedisClient;

const JOB_KEY_PREFIX: &str = "courier:{jobs}:job:";
const QUEUE_KEY_PREFIX: &str = "courier:{jobs}:queue:";
const DEAD_LIST_LIMIT: i64 = 1000;

const ENQUEUE_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
  redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
  return 1
end
return 0
"#;

const RESERVE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ids == 0 then
  return false
end
local id = ids[1]
local body = redis.call('GET', ARGV[3] .. id)
if not body then
  redis.call('ZREM', KEYS[1], id)
  return false
end
redis.call('ZADD', KEYS[1], ARGV[2], id)
return {id, body}
"#;

const COMPLETE_SCRIPT: &str = r#"
redis.call('ZREM', KEYS[2], ARGV[2])
redis.call('EXPIRE', KEYS[1], ARGV[1])
return 1
"#;

const RETRY_SCRIPT: &str = r#"
redis.call('SET', KEYS[1], ARGV[1], 'XX')
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
return 1
"#;

const DEAD_SCRIPT: &str = r#"
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
redis.call('ZREM', KEYS[2], ARGV[3])
redis.call('LPUSH', KEYS[3], ARGV[3])
redis.call('LTRIM', KEYS[3], 0, ARGV[4])
return 1
"#;

/// Redis 任务队列
pub struct RedisJobQueue {
    redis: Arc<RedisClient>,
    visibility_timeout: Duration,
    retention: Duration,
    poll_interval: Duration,
    enqueue_script: Script,
    reserve_script: Script,
    complete_script: Script,
    retry_script: Script,
    dead_script: Script,
}

impl RedisJobQueue {
    pub fn new(
        redis: Arc<RedisClient>,
        visibility_timeout: Duration,
        retention: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            redis,
            visibility_timeout,
            retention,
            poll_interval,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            reserve_script: Script::new(RESERVE_SCRIPT),
            complete_script: Script::new(COMPLETE_SCRIPT),
            retry_script: Script::new(RETRY_SCRIPT),
            dead_script: Script::new(DEAD_SCRIPT),
        }
    }

    fn job_key(id: &str) -> String {
        format!("{}{}", JOB_KEY_PREFIX, id)
    }

    fn queue_key(queue: QueueName) -> String {
        format!("{}{}", QUEUE_KEY_PREFIX, queue.as_str())
    }

    fn dead_key(queue: QueueName) -> String {
        format!("{}{}:dead", QUEUE_KEY_PREFIX, queue.as_str())
    }

    fn retention_secs(&self) -> u64 {
        self.retention.as_secs().max(1)
    }
}

fn run_at_millis(delay: Duration) -> i64 {
    Utc::now().timestamp_millis() + delay.as_millis() as i64
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(
        &self,
        queue: QueueName,
        name: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome> {
        if options.idempotency_key.is_empty() {
            return Err(ServerError::InvalidRequest("idempotency key is empty".to_string()));
        }

        let envelope = JobEnvelope::new(queue, name, payload, &options);
        let body = serde_json::to_string(&envelope)?;

        let created: i64 = self
            .redis
            .eval_script(
                &self.enqueue_script,
                &[Self::job_key(&envelope.id), Self::queue_key(queue)],
                &[
                    body,
                    run_at_millis(options.delay).to_string(),
                    envelope.id.clone(),
                ],
            )
            .await
            .map_err(|e| ServerError::Queue(format!("enqueue {} failed: {}", envelope.id, e)))?;

        if created == 1 {
            debug!("[QUEUE] enqueued {} on {} (delay={:?})", envelope.id, queue, options.delay);
            Ok(EnqueueOutcome::Enqueued)
        } else {
            debug!("[QUEUE] duplicate idempotency key {} on {}", envelope.id, queue);
            Ok(EnqueueOutcome::DuplicateIdempotencyKey)
        }
    }

    async fn reserve(&self, queue: QueueName) -> Result<Option<JobEnvelope>> {
        let now = Utc::now().timestamp_millis();
        let lease_until = now + self.visibility_timeout.as_millis() as i64;

        let reserved: Option<(String, String)> = self
            .redis
            .eval_script(
                &self.reserve_script,
                &[Self::queue_key(queue)],
                &[now.to_string(), lease_until.to_string(), JOB_KEY_PREFIX.to_string()],
            )
            .await
            .map_err(|e| ServerError::Queue(format!("reserve on {} failed: {}", queue, e)))?;

        let Some((id, body)) = reserved else {
            return Ok(None);
        };

        match serde_json::from_str::<JobEnvelope>(&body) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(e) => {
                // 无法解析的任务直接进死信，避免每个租约周期反复出现
                warn!("[QUEUE] corrupt job body {}: {}", id, e);
                self.redis
                    .eval_script::<i64>(
                        &self.dead_script,
                        &[Self::job_key(&id), Self::queue_key(queue), Self::dead_key(queue)],
                        &[
                            body,
                            self.retention_secs().to_string(),
                            id.clone(),
                            (DEAD_LIST_LIMIT - 1).to_string(),
                        ],
                    )
                    .await?;
                Ok(None)
            }
        }
    }

    async fn wait(&self, _queue: QueueName, timeout: Duration) {
        tokio::time::sleep(timeout.min(self.poll_interval)).await;
    }

    async fn complete(&self, job: &JobEnvelope) -> Result<()> {
        self.redis
            .eval_script::<i64>(
                &self.complete_script,
                &[Self::job_key(&job.id), Self::queue_key(job.queue)],
                &[self.retention_secs().to_string(), job.id.clone()],
            )
            .await
            .map_err(|e| ServerError::Queue(format!("complete {} failed: {}", job.id, e)))?;
        Ok(())
    }

    async fn fail(&self, job: &JobEnvelope, error: &str, retryable: bool) -> Result<FailOutcome> {
        let mut envelope = job.clone();
        let retry_in = envelope.record_failure(error, retryable);
        let body = serde_json::to_string(&envelope)?;

        match retry_in {
            Some(delay) => {
                self.redis
                    .eval_script::<i64>(
                        &self.retry_script,
                        &[Self::job_key(&job.id), Self::queue_key(job.queue)],
                        &[body, run_at_millis(delay).to_string(), job.id.clone()],
                    )
                    .await
                    .map_err(|e| ServerError::Queue(format!("reschedule {} failed: {}", job.id, e)))?;
                Ok(FailOutcome::Retrying { delay })
            }
            None => {
                self.redis
                    .eval_script::<i64>(
                        &self.dead_script,
                        &[
                            Self::job_key(&job.id),
                            Self::queue_key(job.queue),
                            Self::dead_key(job.queue),
                        ],
                        &[
                            body,
                            self.retention_secs().to_string(),
                            job.id.clone(),
                            (DEAD_LIST_LIMIT - 1).to_string(),
                        ],
                    )
                    .await
                    .map_err(|e| ServerError::Queue(format!("dead-letter {} failed: {}", job.id, e)))?;
                Ok(FailOutcome::Dead)
            }
        }
    }
}
