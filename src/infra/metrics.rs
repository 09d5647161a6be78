//! Prometheus 指标：推送结果、重试状态机、队列任务、工作池并发
//!
//! 通过 `init(port)` 安装全局 Recorder 并在该端口暴露 `/metrics`。
//! 未初始化时各 `record_*` 调用是空操作。

use std::net::{Ipv4Addr, SocketAddr};

/// 指标名称
const COUNTER_PUSH_SENT: &str = "courier_push_sent_total";
const COUNTER_RETRY_OUTCOME: &str = "courier_retry_outcome_total";
const COUNTER_JOBS: &str = "courier_jobs_total";
const GAUGE_WORKER_INFLIGHT: &str = "courier_worker_inflight";
const COUNTER_TOKENS_REVOKED: &str = "courier_tokens_revoked_total";
const COUNTER_DISPATCHED: &str = "courier_messages_dispatched_total";
const COUNTER_DISPATCH_TARGETS: &str = "courier_dispatch_targets_total";
const GAUGE_REDIS_POOL_ACTIVE: &str = "courier_redis_pool_active";
const GAUGE_REDIS_POOL_IDLE: &str = "courier_redis_pool_idle";
const GAUGE_DB_POOL_SIZE: &str = "courier_db_pool_size";
const GAUGE_DB_POOL_IDLE: &str = "courier_db_pool_idle";

/// 安装 Prometheus Recorder 并启动 HTTP 抓取端点。进程内只能调用一次。
pub fn init(port: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        .install()?;
    Ok(())
}

/// 一次推送发送：platform = android/ios/web/desktop，outcome = delivered/invalid_token/...
pub fn record_push(platform: &str, outcome: &'static str) {
    metrics::counter!(COUNTER_PUSH_SENT, "platform" => platform.to_string(), "outcome" => outcome)
        .increment(1);
}

/// 重试调度器一次触发的结果
pub fn record_retry_outcome(outcome: &'static str) {
    metrics::counter!(COUNTER_RETRY_OUTCOME, "outcome" => outcome).increment(1);
}

/// 队列任务执行结果：completed / retrying / dead
pub fn record_job(queue: &'static str, result: &'static str) {
    metrics::counter!(COUNTER_JOBS, "queue" => queue, "result" => result).increment(1);
}

/// 工作池当前并发数
pub fn record_worker_inflight(queue: &'static str, inflight: usize) {
    metrics::gauge!(GAUGE_WORKER_INFLIGHT, "queue" => queue).set(inflight as f64);
}

/// 推送令牌被吊销
pub fn record_token_revoked() {
    metrics::counter!(COUNTER_TOKENS_REVOKED).increment(1);
}

/// 完成一次消息投递分发
pub fn record_dispatched(online_recipients: usize, offline_devices: usize) {
    metrics::counter!(COUNTER_DISPATCHED).increment(1);
    metrics::counter!(COUNTER_DISPATCH_TARGETS, "path" => "live").increment(online_recipients as u64);
    metrics::counter!(COUNTER_DISPATCH_TARGETS, "path" => "push").increment(offline_devices as u64);
}

/// 更新 Redis 连接池状态（Gauge）
pub fn record_redis_pool(active: u32, idle: u32) {
    metrics::gauge!(GAUGE_REDIS_POOL_ACTIVE).set(active as f64);
    metrics::gauge!(GAUGE_REDIS_POOL_IDLE).set(idle as f64);
}

/// 更新数据库连接池状态（Gauge）
pub fn record_db_pool(size: u32, idle: usize) {
    metrics::gauge!(GAUGE_DB_POOL_SIZE).set(size as f64);
    metrics::gauge!(GAUGE_DB_POOL_IDLE).set(idle as f64);
}
