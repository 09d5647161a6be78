mod common;

use chrono::Utc;
use common::Harness;
use courier::delivery::{RetiredReason, RetryJob, RetryOutcome};
use courier::model::PushPlatform;
use courier::queue::{Job, QueueName};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Scenario {
    h: Harness,
    user: Uuid,
    message_id: Uuid,
    first: RetryJob,
}

/// 发送者 + 一个离线接收者（设备 D1，令牌 TK1），消息已分发
async fn scenario() -> Scenario {
    let h = Harness::new();
    let (sender, user) = (Uuid::new_v4(), Uuid::new_v4());
    let conversation = h.conversation(&[sender, user]);
    h.token(user, "D1", PushPlatform::Android, "TK1");
    let message = h.text_message(conversation, sender, "are you there?");
    h.dispatcher.dispatch(message.id).await.unwrap();

    let first = h.retry_jobs().pop().unwrap();
    Scenario {
        h,
        user,
        message_id: message.id,
        first,
    }
}

#[tokio::test]
async fn test_first_retry_advances_to_attempt_one() {
    let s = scenario().await;
    let before = Utc::now();

    let outcome = s.h.scheduler.fire(&s.first).await.unwrap();
    assert_eq!(
        outcome,
        RetryOutcome::Rescheduled {
            attempt: 1,
            next_retry: true
        }
    );

    let record = s.h.store.retry_record(s.message_id, s.user, "D1").unwrap();
    assert_eq!(record.attempt, 1);
    let wait = record.next_attempt_at - before;
    assert!(wait >= chrono::Duration::seconds(30) && wait < chrono::Duration::seconds(31));

    let keys: Vec<String> = s.h.push_jobs().iter().map(|j| j.idempotency_key()).collect();
    assert!(keys.contains(&format!("push:{}:{}:D1:1", s.message_id, s.user)));
    assert_eq!(keys.len(), 2);
}

#[tokio::test]
async fn test_exhaustion_after_max_attempts() {
    let s = scenario().await;

    for attempt in 0..6 {
        s.h.make_due(s.message_id, s.user, "D1");
        let outcome = s.h.scheduler.fire(&s.first.next(attempt)).await.unwrap();
        assert_eq!(
            outcome,
            RetryOutcome::Rescheduled {
                attempt: attempt + 1,
                next_retry: attempt + 1 < 6
            }
        );
    }

    // 第 6 次之后没有下一轮重试任务
    assert!(s.h.retry_jobs().iter().all(|j| j.attempt < 6));
    let pushes_before = s.h.push_jobs().len();
    assert_eq!(pushes_before, 7);

    s.h.make_due(s.message_id, s.user, "D1");
    let outcome = s.h.scheduler.fire(&s.first.next(6)).await.unwrap();
    assert_eq!(outcome, RetryOutcome::Exhausted);
    assert_eq!(s.h.push_jobs().len(), pushes_before);

    // 记录保留但不再变化
    assert_eq!(s.h.store.retry_record(s.message_id, s.user, "D1").unwrap().attempt, 6);
}

#[tokio::test]
async fn test_device_back_online_wins() {
    let s = scenario().await;
    s.h.presence.connect(s.user, "D1");

    let outcome = s.h.scheduler.fire(&s.first).await.unwrap();
    assert_eq!(outcome, RetryOutcome::Retired(RetiredReason::DeviceOnline));
    assert!(s.h.store.retry_record(s.message_id, s.user, "D1").is_none());
    // 只有分发时的第 0 轮推送
    assert_eq!(s.h.push_jobs().len(), 1);

    // 推送任务执行时设备在线，也不会发送
    s.h.drain_push_jobs().await;
    assert!(s.h.provider.sent_to("TK1").is_empty());
}

#[tokio::test]
async fn test_cancelled_chain_fires_are_noops() {
    let s = scenario().await;
    s.h.store.remove_token(s.user, "D1");

    assert_eq!(
        s.h.scheduler.fire(&s.first).await.unwrap(),
        RetryOutcome::Retired(RetiredReason::TokenGone)
    );
    for attempt in 0..3 {
        assert_eq!(
            s.h.scheduler.fire(&s.first.next(attempt)).await.unwrap(),
            RetryOutcome::Missing
        );
    }
}

#[tokio::test]
async fn test_not_yet_due_is_deferred() {
    let s = scenario().await;
    s.h.scheduler.fire(&s.first).await.unwrap();
    let record = s.h.store.retry_record(s.message_id, s.user, "D1").unwrap();

    // 记录已推进到 attempt 1，下一轮要等 30 秒；提前到达的同轮任务重新排队
    let early = s.first.next(1);
    let outcome = s.h.scheduler.fire(&early).await.unwrap();
    assert_eq!(
        outcome,
        RetryOutcome::Deferred {
            until: record.next_attempt_at
        }
    );
    assert_eq!(s.h.store.retry_record(s.message_id, s.user, "D1").unwrap().attempt, 1);
    assert_eq!(s.h.push_jobs().len(), 2);

    let deferred: Vec<_> = s
        .h
        .queue
        .pending(QueueName::MessageRetry)
        .into_iter()
        .filter(|job| job.id.starts_with(&format!("{}:defer:", early.idempotency_key())))
        .collect();
    assert_eq!(deferred.len(), 1);
    let wait = s.h.queue.time_until_due(&deferred[0].id).unwrap();
    assert!(wait > Duration::from_secs(29) && wait <= Duration::from_secs(30));

    // 到期后触发重新排队的任务，链继续推进
    s.h.make_due(s.message_id, s.user, "D1");
    let job: RetryJob = deferred[0].decode().unwrap();
    assert_eq!(
        s.h.scheduler.fire(&job).await.unwrap(),
        RetryOutcome::Rescheduled {
            attempt: 2,
            next_retry: true
        }
    );
}

#[tokio::test]
async fn test_duplicate_fire_is_stale() {
    let s = scenario().await;
    s.h.scheduler.fire(&s.first).await.unwrap();
    s.h.make_due(s.message_id, s.user, "D1");

    // 同一个 attempt 0 的任务被重复投递
    assert_eq!(s.h.scheduler.fire(&s.first).await.unwrap(), RetryOutcome::Stale);
    assert_eq!(s.h.store.retry_record(s.message_id, s.user, "D1").unwrap().attempt, 1);
}

#[tokio::test]
async fn test_concurrent_fires_advance_once() {
    let s = Arc::new(scenario().await);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let s = s.clone();
            tokio::spawn(async move { s.h.scheduler.fire(&s.first).await.unwrap() })
        })
        .collect();

    let mut rescheduled = 0;
    for handle in handles {
        match handle.await.unwrap() {
            RetryOutcome::Rescheduled { attempt, .. } => {
                assert_eq!(attempt, 1);
                rescheduled += 1;
            }
            RetryOutcome::Stale => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    assert_eq!(rescheduled, 1);
    assert_eq!(s.h.store.retry_record(s.message_id, s.user, "D1").unwrap().attempt, 1);
    assert_eq!(s.h.push_jobs().len(), 2);
}

#[tokio::test]
async fn test_message_deleted_stops_retries() {
    let s = scenario().await;
    s.h.store.remove_message(s.message_id);
    assert_eq!(s.h.scheduler.fire(&s.first).await.unwrap(), RetryOutcome::Missing);
}
