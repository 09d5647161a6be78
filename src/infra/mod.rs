// Infrastructure layer - 基础设施层
// 数据库 / Redis 连接、在线状态、工作池、监控指标

pub mod database;
pub mod metrics;
pub mod presence_tracker;
pub mod redis;
pub mod redis_presence;
pub mod worker_pool;

pub use database::Database;
pub use presence_tracker::{PresenceStats, PresenceStore, PresenceTracker};
pub use redis_presence::RedisPresenceStore;
pub use worker_pool::{JobHandler, WorkerLimiter, WorkerPool};

pub use self::redis::RedisClient;
