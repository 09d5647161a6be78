// RedisClient - Redis客户端实现
// 基于 bb8-redis 连接池，所有命令统一带超时

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use redis::{AsyncCommands, FromRedisValue, Script};
use std::future::Future;
use std::time::Duration;

use crate::config::RedisConfig;
use crate::error::{Result, ServerError};

/// Redis 客户端（基于连接池）
pub struct RedisClient {
    pool: Pool<RedisConnectionManager>,
    /// 单条 Redis 命令的执行超时
    command_timeout: Duration,
}

impl RedisClient {
    /// 创建新的 Redis 客户端（从 RedisConfig 配置）
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        let manager = RedisConnectionManager::new(config.url.clone())
            .map_err(|e| ServerError::Redis(format!("Failed to create Redis manager: {}", e)))?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .min_idle(Some(config.min_idle))
            .connection_timeout(config.connection_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .build(manager)
            .await
            .map_err(|e| ServerError::Redis(format!("Failed to create Redis pool: {}", e)))?;

        let client = Self {
            pool,
            command_timeout: config.command_timeout(),
        };

        // 测试连接
        client
            .with_timeout(async {
                let mut conn = client.get_conn().await?;
                let _: String = conn
                    .ping()
                    .await
                    .map_err(|e| ServerError::Redis(format!("Redis ping failed: {}", e)))?;
                Ok(())
            })
            .await?;

        tracing::info!(
            "✅ Redis 连接池已创建 (pool_size={}, min_idle={}, conn_timeout={}s, cmd_timeout={}ms)",
            config.pool_size,
            config.min_idle,
            config.connection_timeout_secs,
            config.command_timeout_ms,
        );

        Ok(client)
    }

    /// 获取连接池状态（活跃连接数、空闲连接数）
    pub fn pool_state(&self) -> bb8::State {
        self.pool.state()
    }

    async fn get_conn(&self) -> Result<bb8::PooledConnection<'_, RedisConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| ServerError::Redis(format!("Failed to get Redis connection: {}", e)))
    }

    /// 执行带超时的 Redis 操作
    async fn with_timeout<F, T>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.command_timeout, op)
            .await
            .map_err(|_| {
                ServerError::Timeout(format!(
                    "Redis command timeout ({}ms)",
                    self.command_timeout.as_millis()
                ))
            })?
    }

    /// DEL key
    pub async fn del(&self, key: &str) -> Result<()> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            conn.del::<_, ()>(key)
                .await
                .map_err(|e| ServerError::Redis(format!("Redis DEL failed: {}", e)))?;
            Ok(())
        })
        .await
    }

    /// EXPIRE key seconds
    pub async fn expire(&self, key: &str, seconds: u64) -> Result<()> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            conn.expire::<_, ()>(key, seconds as i64)
                .await
                .map_err(|e| ServerError::Redis(format!("Redis EXPIRE failed: {}", e)))?;
            Ok(())
        })
        .await
    }

    // ============================================================
    // Sorted Set 操作
    // ============================================================

    /// ZADD key score member
    pub async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<()> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            conn.zadd::<_, _, _, ()>(key, member, score)
                .await
                .map_err(|e| ServerError::Redis(format!("Redis ZADD failed: {}", e)))?;
            Ok(())
        })
        .await
    }

    /// ZREM key member
    pub async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            conn.zrem::<_, _, ()>(key, member)
                .await
                .map_err(|e| ServerError::Redis(format!("Redis ZREM failed: {}", e)))?;
            Ok(())
        })
        .await
    }

    /// ZSCORE key member
    pub async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let score: Option<f64> = conn
                .zscore(key, member)
                .await
                .map_err(|e| ServerError::Redis(format!("Redis ZSCORE failed: {}", e)))?;
            Ok(score.map(|s| s as i64))
        })
        .await
    }

    /// ZRANGEBYSCORE key min +inf
    pub async fn zrange_from(&self, key: &str, min: i64) -> Result<Vec<String>> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let members: Vec<String> = conn
                .zrangebyscore(key, min, "+inf")
                .await
                .map_err(|e| ServerError::Redis(format!("Redis ZRANGEBYSCORE failed: {}", e)))?;
            Ok(members)
        })
        .await
    }

    /// ZREMRANGEBYSCORE key -inf max（清理过期成员）
    pub async fn zrem_below(&self, key: &str, max: i64) -> Result<()> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            conn.zrembyscore::<_, _, _, ()>(key, "-inf", format!("({}", max))
                .await
                .map_err(|e| ServerError::Redis(format!("Redis ZREMRANGEBYSCORE failed: {}", e)))?;
            Ok(())
        })
        .await
    }

    // ============================================================
    // Lua 脚本
    // ============================================================

    /// EVALSHA（首次自动 SCRIPT LOAD）
    pub async fn eval_script<T>(&self, script: &Script, keys: &[String], args: &[String]) -> Result<T>
    where
        T: FromRedisValue + Send,
    {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let mut invocation = script.prepare_invoke();
            for key in keys {
                invocation.key(key);
            }
            for arg in args {
                invocation.arg(arg);
            }
            let value: T = invocation
                .invoke_async(&mut *conn)
                .await
                .map_err(|e| ServerError::Redis(format!("Redis script failed: {}", e)))?;
            Ok(value)
        })
        .await
    }
}
