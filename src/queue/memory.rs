//! 进程内任务队列
//!
//! 用于测试和 `--dev` 运行。语义与 Redis 队列一致：领取后进入租约，
//! 租约过期未确认的任务会重新可见；完成的幂等键在保留窗口内仍视为重复。

use async_trait::async_trait;
use moka::future::Cache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{EnqueueOptions, EnqueueOutcome, FailOutcome, JobEnvelope, JobQueue, QueueName};
use crate::error::{Result, ServerError};

/// 死信最多保留条数，超出后丢弃最旧的
const DEAD_LETTER_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Waiting,
    Reserved,
}

#[derive(Debug, Clone)]
struct Slot {
    envelope: JobEnvelope,
    state: SlotState,
    /// 等待中为可执行时间，执行中为租约到期时间
    run_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct State {
    slots: HashMap<String, Slot>,
    dead: VecDeque<JobEnvelope>,
    seq: u64,
}

/// 内存任务队列
pub struct MemoryJobQueue {
    state: Mutex<State>,
    notifiers: HashMap<QueueName, Notify>,
    /// 已完成 / 已死信的幂等键
    retained: Cache<String, ()>,
    visibility_timeout: Duration,
    dead_letter_limit: usize,
}

impl MemoryJobQueue {
    pub fn new(visibility_timeout: Duration, retention: Duration) -> Self {
        let notifiers = QueueName::ALL.iter().map(|q| (*q, Notify::new())).collect();
        Self {
            state: Mutex::new(State::default()),
            notifiers,
            retained: Cache::builder().time_to_live(retention).build(),
            visibility_timeout,
            dead_letter_limit: DEAD_LETTER_LIMIT,
        }
    }

    pub fn with_dead_letter_limit(mut self, limit: usize) -> Self {
        self.dead_letter_limit = limit.max(1);
        self
    }

    fn notify(&self, queue: QueueName) {
        if let Some(notify) = self.notifiers.get(&queue) {
            notify.notify_one();
        }
    }

    /// 未完成的任务（等待中 + 执行中），按入队顺序
    pub fn pending(&self, queue: QueueName) -> Vec<JobEnvelope> {
        let state = self.state.lock();
        let mut slots: Vec<&Slot> = state
            .slots
            .values()
            .filter(|s| s.envelope.queue == queue)
            .collect();
        slots.sort_by_key(|s| s.seq);
        slots.into_iter().map(|s| s.envelope.clone()).collect()
    }

    /// 未完成任务的负载
    pub fn pending_jobs<T: DeserializeOwned>(&self, queue: QueueName) -> Vec<T> {
        self.pending(queue)
            .iter()
            .filter_map(|job| job.decode().ok())
            .collect()
    }

    /// 某个等待中的任务距离可执行还剩多久
    pub fn time_until_due(&self, idempotency_key: &str) -> Option<Duration> {
        let state = self.state.lock();
        state
            .slots
            .get(idempotency_key)
            .filter(|s| s.state == SlotState::Waiting)
            .map(|s| s.run_at.saturating_duration_since(Instant::now()))
    }

    /// 死信任务
    pub fn dead(&self, queue: QueueName) -> Vec<JobEnvelope> {
        self.state
            .lock()
            .dead
            .iter()
            .filter(|job| job.queue == queue)
            .cloned()
            .collect()
    }

    pub fn len(&self, queue: QueueName) -> usize {
        self.state
            .lock()
            .slots
            .values()
            .filter(|s| s.envelope.queue == queue)
            .count()
    }

    pub fn is_empty(&self, queue: QueueName) -> bool {
        self.len(queue) == 0
    }

    /// 最早的可执行时间
    fn next_due(&self, queue: QueueName) -> Option<Instant> {
        self.state
            .lock()
            .slots
            .values()
            .filter(|s| s.envelope.queue == queue)
            .map(|s| s.run_at)
            .min()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
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

        {
            let mut state = self.state.lock();
            if state.slots.contains_key(&options.idempotency_key)
                || self.retained.contains_key(&options.idempotency_key)
            {
                return Ok(EnqueueOutcome::DuplicateIdempotencyKey);
            }

            state.seq += 1;
            let seq = state.seq;
            let envelope = JobEnvelope::new(queue, name, payload, &options);
            state.slots.insert(
                options.idempotency_key.clone(),
                Slot {
                    envelope,
                    state: SlotState::Waiting,
                    run_at: Instant::now() + options.delay,
                    seq,
                },
            );
        }

        self.notify(queue);
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn reserve(&self, queue: QueueName) -> Result<Option<JobEnvelope>> {
        let now = Instant::now();
        let mut state = self.state.lock();

        // 到期的等待任务，或租约已过期的执行中任务
        let next = state
            .slots
            .values()
            .filter(|s| s.envelope.queue == queue && s.run_at <= now)
            .min_by_key(|s| (s.run_at, s.seq))
            .map(|s| s.envelope.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };

        let lease = now + self.visibility_timeout;
        Ok(state.slots.get_mut(&id).map(|slot| {
            slot.state = SlotState::Reserved;
            slot.run_at = lease;
            slot.envelope.clone()
        }))
    }

    async fn wait(&self, queue: QueueName, timeout: Duration) {
        let deadline = match self.next_due(queue) {
            Some(due) => due.min(Instant::now() + timeout),
            None => Instant::now() + timeout,
        };
        let Some(notify) = self.notifiers.get(&queue) else {
            tokio::time::sleep_until(deadline).await;
            return;
        };
        let _ = tokio::time::timeout_at(deadline, notify.notified()).await;
    }

    async fn complete(&self, job: &JobEnvelope) -> Result<()> {
        // 先写保留窗口，再移除任务，避免中间出现键完全不存在的窗口
        self.retained.insert(job.id.clone(), ()).await;
        self.state.lock().slots.remove(&job.id);
        Ok(())
    }

    async fn fail(&self, job: &JobEnvelope, error: &str, retryable: bool) -> Result<FailOutcome> {
        let mut envelope = {
            let state = self.state.lock();
            match state.slots.get(&job.id) {
                Some(slot) => slot.envelope.clone(),
                None => job.clone(),
            }
        };

        match envelope.record_failure(error, retryable) {
            Some(delay) => {
                let mut state = self.state.lock();
                if let Some(slot) = state.slots.get_mut(&job.id) {
                    slot.envelope = envelope;
                    slot.state = SlotState::Waiting;
                    slot.run_at = Instant::now() + delay;
                }
                drop(state);
                self.notify(job.queue);
                Ok(FailOutcome::Retrying { delay })
            }
            None => {
                self.retained.insert(job.id.clone(), ()).await;
                let mut state = self.state.lock();
                state.slots.remove(&job.id);
                state.dead.push_back(envelope);
                while state.dead.len() > self.dead_letter_limit {
                    state.dead.pop_front();
                }
                Ok(FailOutcome::Dead)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> MemoryJobQueue {
        MemoryJobQueue::new(Duration::from_secs(60), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_duplicate_key_is_reported_not_failed() {
        let q = queue();
        let first = q
            .enqueue(QueueName::Push, "push", json!({"n": 1}), EnqueueOptions::new("push:m:d:0"))
            .await
            .unwrap();
        let second = q
            .enqueue(QueueName::Push, "push", json!({"n": 2}), EnqueueOptions::new("push:m:d:0"))
            .await
            .unwrap();

        assert_eq!(first, EnqueueOutcome::Enqueued);
        assert_eq!(second, EnqueueOutcome::DuplicateIdempotencyKey);
        assert_eq!(q.len(QueueName::Push), 1);
        assert_eq!(q.pending(QueueName::Push)[0].payload, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_completed_key_stays_duplicate() {
        let q = queue();
        q.enqueue(QueueName::Push, "push", json!({}), EnqueueOptions::new("k"))
            .await
            .unwrap();
        let job = q.reserve(QueueName::Push).await.unwrap().unwrap();
        q.complete(&job).await.unwrap();
        assert!(q.is_empty(QueueName::Push));

        let again = q
            .enqueue(QueueName::Push, "push", json!({}), EnqueueOptions::new("k"))
            .await
            .unwrap();
        assert_eq!(again, EnqueueOutcome::DuplicateIdempotencyKey);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_job_not_reserved_early() {
        let q = queue();
        q.enqueue(
            QueueName::MessageRetry,
            "message-retry",
            json!({}),
            EnqueueOptions::new("retry:m:d:0").with_delay(Duration::from_secs(30)),
        )
        .await
        .unwrap();

        assert!(q.reserve(QueueName::MessageRetry).await.unwrap().is_none());
        assert_eq!(q.time_until_due("retry:m:d:0"), Some(Duration::from_secs(30)));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(q.reserve(QueueName::MessageRetry).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_makes_job_visible_again() {
        let q = MemoryJobQueue::new(Duration::from_secs(5), Duration::from_secs(3600));
        q.enqueue(QueueName::Message, "deliver-message", json!({}), EnqueueOptions::new("deliver:1"))
            .await
            .unwrap();

        let job = q.reserve(QueueName::Message).await.unwrap().unwrap();
        assert!(q.reserve(QueueName::Message).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        let again = q.reserve(QueueName::Message).await.unwrap().unwrap();
        assert_eq!(again.id, job.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_retries_then_dead() {
        let q = queue();
        q.enqueue(QueueName::Push, "push", json!({}), EnqueueOptions::new("p"))
            .await
            .unwrap();

        let job = q.reserve(QueueName::Push).await.unwrap().unwrap();
        let outcome = q.fail(&job, "redis down", true).await.unwrap();
        assert_eq!(outcome, FailOutcome::Retrying { delay: Duration::from_secs(2) });

        tokio::time::advance(Duration::from_secs(2)).await;
        let job = q.reserve(QueueName::Push).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 1);
        q.fail(&job, "redis down", true).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        let job = q.reserve(QueueName::Push).await.unwrap().unwrap();
        assert_eq!(q.fail(&job, "redis down", true).await.unwrap(), FailOutcome::Dead);

        assert!(q.is_empty(QueueName::Push));
        assert_eq!(q.dead(QueueName::Push).len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letters_are_capped() {
        let q = queue().with_dead_letter_limit(2);
        for key in ["d1", "d2", "d3"] {
            q.enqueue(QueueName::Push, "push", json!({}), EnqueueOptions::new(key))
                .await
                .unwrap();
            let job = q.reserve(QueueName::Push).await.unwrap().unwrap();
            assert_eq!(q.fail(&job, "bad payload", false).await.unwrap(), FailOutcome::Dead);
        }

        let dead: Vec<String> = q.dead(QueueName::Push).into_iter().map(|job| job.id).collect();
        assert_eq!(dead, vec!["d2".to_string(), "d3".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_wakes_on_enqueue() {
        let q = std::sync::Arc::new(queue());
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move {
                q.wait(QueueName::Push, Duration::from_secs(3600)).await;
                Instant::now()
            })
        };
        tokio::task::yield_now().await;

        let start = Instant::now();
        q.enqueue(QueueName::Push, "push", json!({}), EnqueueOptions::new("w"))
            .await
            .unwrap();
        let woke_at = waiter.await.unwrap();
        assert!(woke_at.duration_since(start) < Duration::from_secs(1));
    }
}
