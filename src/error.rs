use thiserror::Error;

/// 服务错误类型
///
/// 只有基础设施故障（数据库、Redis、队列、网络）才会以错误形式返回；
/// 消息已删除、重试记录已被回收、任务重复等竞态属于正常流程，由各组件以返回值表达。
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),
    /// 数据库错误
    #[error("Database error: {0}")]
    Database(String),
    /// Redis 错误
    #[error("Redis error: {0}")]
    Redis(String),
    /// 任务队列错误
    #[error("Queue error: {0}")]
    Queue(String),
    /// 网络错误
    #[error("Network error: {0}")]
    Network(String),
    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// 超时错误
    #[error("Timeout error: {0}")]
    Timeout(String),
    /// 推送提供者错误
    #[error("Push provider error: {0}")]
    Push(String),
    /// 资源未找到
    #[error("Not found: {0}")]
    NotFound(String),
    /// 无效的请求
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ServerError {
    /// 是否值得由队列按退避策略重新执行
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServerError::Database(_)
                | ServerError::Redis(_)
                | ServerError::Queue(_)
                | ServerError::Network(_)
                | ServerError::Timeout(_)
                | ServerError::Push(_)
        )
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for ServerError {
    fn from(err: sqlx::Error) -> Self {
        ServerError::Database(err.to_string())
    }
}

impl From<redis::RedisError> for ServerError {
    fn from(err: redis::RedisError) -> Self {
        ServerError::Redis(err.to_string())
    }
}

impl From<reqwest::Error> for ServerError {
    fn from(err: reqwest::Error) -> Self {
        ServerError::Network(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ServerError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ServerError::Timeout(err.to_string())
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, ServerError>;
