//! 队列消费工作池
//!
//! 每个队列一个池：拉取到期任务，在并发上限内 spawn 执行。
//! 处理结果以 `Result` 返回：成功确认完成；可重试的基础设施错误交给队列按退避重排；
//! 其余错误直接进死信。

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::infra::metrics;
use crate::queue::{FailOutcome, JobEnvelope, JobQueue, QueueName};

/// 任务处理器
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// 消费的队列
    fn queue(&self) -> QueueName;

    async fn handle(&self, job: &JobEnvelope) -> Result<()>;
}

/// 工作池并发限流器
#[derive(Clone)]
pub struct WorkerLimiter {
    sem: Arc<Semaphore>,
    max_inflight: usize,
}

impl WorkerLimiter {
    pub fn new(max_inflight: usize) -> Self {
        let max_inflight = max_inflight.max(1);
        Self {
            sem: Arc::new(Semaphore::new(max_inflight)),
            max_inflight,
        }
    }

    /// 等待一个执行名额
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.sem.clone().acquire_owned().await.ok()
    }

    /// 当前正在执行的任务数
    pub fn inflight(&self) -> usize {
        self.max_inflight - self.sem.available_permits()
    }

    pub fn max_inflight(&self) -> usize {
        self.max_inflight
    }

    /// 等待所有执行中的任务结束
    async fn drain(&self) {
        let _ = self.sem.acquire_many(self.max_inflight as u32).await;
    }
}

/// 单个队列的工作池
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    limiter: WorkerLimiter,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            handler,
            limiter: WorkerLimiter::new(concurrency),
            poll_interval,
        }
    }

    pub fn limiter(&self) -> &WorkerLimiter {
        &self.limiter
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// 拉取并执行任务，直到收到关闭信号；返回前等待执行中的任务结束
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let queue_name = self.handler.queue();
        info!(
            "[WORKER POOL] {} started (concurrency={})",
            queue_name,
            self.limiter.max_inflight()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = self.limiter.acquire() => match permit {
                    Some(permit) => permit,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            match self.queue.reserve(queue_name).await {
                Ok(Some(job)) => {
                    let queue = self.queue.clone();
                    let handler = self.handler.clone();
                    let limiter = self.limiter.clone();
                    tokio::spawn(async move {
                        process(queue.as_ref(), handler.as_ref(), &limiter, job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.queue.wait(queue_name, self.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!("[WORKER POOL] {} reserve failed: {}", queue_name, e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        info!("[WORKER POOL] {} draining {} in-flight job(s)", queue_name, self.limiter.inflight());
        self.limiter.drain().await;
        info!("[WORKER POOL] {} stopped", queue_name);
    }

    /// 领取并同步执行一个任务；队列为空时返回 false
    pub async fn run_once(&self) -> Result<bool> {
        let Some(job) = self.queue.reserve(self.handler.queue()).await? else {
            return Ok(false);
        };
        process(self.queue.as_ref(), self.handler.as_ref(), &self.limiter, job).await;
        Ok(true)
    }
}

async fn process(queue: &dyn JobQueue, handler: &dyn JobHandler, limiter: &WorkerLimiter, job: JobEnvelope) {
    let queue_name = job.queue.as_str();
    metrics::record_worker_inflight(queue_name, limiter.inflight());

    match handler.handle(&job).await {
        Ok(()) => match queue.complete(&job).await {
            Ok(()) => {
                debug!("[WORKER POOL] {} job {} completed", queue_name, job.id);
                metrics::record_job(queue_name, "completed");
            }
            Err(e) => {
                // 未确认的任务在租约到期后会再次执行
                warn!("[WORKER POOL] {} job {} completed but ack failed: {}", queue_name, job.id, e);
            }
        },
        Err(e) => {
            let retryable = e.is_transient();
            match queue.fail(&job, &e.to_string(), retryable).await {
                Ok(FailOutcome::Retrying { delay }) => {
                    warn!(
                        "[WORKER POOL] {} job {} failed (attempt {}/{}), retrying in {:?}: {}",
                        queue_name,
                        job.id,
                        job.attempts_made + 1,
                        job.max_attempts,
                        delay,
                        e
                    );
                    metrics::record_job(queue_name, "retrying");
                }
                Ok(FailOutcome::Dead) => {
                    error!("[WORKER POOL] {} job {} moved to dead letter: {}", queue_name, job.id, e);
                    metrics::record_job(queue_name, "dead");
                }
                Err(fail_err) => {
                    error!(
                        "[WORKER POOL] {} job {} failed ({}) and could not be rescheduled: {}",
                        queue_name, job.id, e, fail_err
                    );
                }
            }
        }
    }

    metrics::record_worker_inflight(queue_name, limiter.inflight().saturating_sub(1));
}
