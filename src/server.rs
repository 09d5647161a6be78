use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{PresenceBackend, QueueBackend, ServerConfig, StoreBackend};
use crate::delivery::{DeliveryDispatcher, DeliverySettings, RetryScheduler};
use crate::error::{Result, ServerError};
use crate::infra::database::mask_database_url;
use crate::infra::{
    Database, JobHandler, PresenceStore, PresenceTracker, RedisClient, RedisPresenceStore, WorkerPool,
};
use crate::push::{PushDispatchWorker, PushGateway};
use crate::queue::{JobQueue, MemoryJobQueue, RedisJobQueue};
use crate::repository::{MemoryStore, Repositories};

/// 投递服务
///
/// 按配置组装存储、队列、在线状态和推送网关，为三个队列各启动一个工作池，
/// 收到 Ctrl+C / SIGTERM 后停止拉取新任务并等待执行中的任务结束。
pub struct DeliveryServer {
    config: ServerConfig,
    repos: Repositories,
    presence: Arc<dyn PresenceStore>,
    queue: Arc<dyn JobQueue>,
    dispatcher: Arc<DeliveryDispatcher>,
    scheduler: Arc<RetryScheduler>,
    push_worker: Arc<PushDispatchWorker>,
    database: Option<Arc<Database>>,
    redis: Option<Arc<RedisClient>>,
}

impl DeliveryServer {
    /// 按配置创建服务
    pub async fn new(config: ServerConfig) -> Result<Self> {
        info!("🔧 Initializing delivery components...");

        let redis = match &config.redis {
            Some(redis_config)
                if config.queue.backend == QueueBackend::Redis
                    || config.presence.backend == PresenceBackend::Redis =>
            {
                Some(Arc::new(RedisClient::new(redis_config).await?))
            }
            _ => None,
        };
        let require_redis = || {
            redis
                .clone()
                .ok_or_else(|| ServerError::Configuration("redis backend selected but not configured".to_string()))
        };

        let (repos, database) = match config.store.backend {
            StoreBackend::Postgres => {
                info!("🗄️ Connecting to {}", mask_database_url(&config.database.url));
                let database = Database::new(&config.database)
                    .await
                    .map_err(|e| ServerError::Database(format!("数据库连接失败: {}", e)))?;
                let database = Arc::new(database);
                (Repositories::postgres(database.pool().clone()), Some(database))
            }
            StoreBackend::Memory => {
                warn!("Using in-memory store, data is lost on restart");
                (Repositories::memory(Arc::new(MemoryStore::new())), None)
            }
        };

        let queue: Arc<dyn JobQueue> = match config.queue.backend {
            QueueBackend::Redis => Arc::new(RedisJobQueue::new(
                require_redis()?,
                config.queue.visibility_timeout(),
                config.queue.completed_retention(),
                config.queue.poll_interval(),
            )),
            QueueBackend::Memory => Arc::new(MemoryJobQueue::new(
                config.queue.visibility_timeout(),
                config.queue.completed_retention(),
            )),
        };

        let presence: Arc<dyn PresenceStore> = match config.presence.backend {
            PresenceBackend::Redis => Arc::new(RedisPresenceStore::new(
                require_redis()?,
                Duration::from_secs(config.presence.ttl_secs),
            )),
            PresenceBackend::Memory => Arc::new(PresenceTracker::new()),
        };

        let gateway = Arc::new(PushGateway::new(config.push.clone()));

        let mut server = Self::from_parts(config, repos, presence, queue, gateway);
        server.database = database;
        server.redis = redis;

        info!("✅ Delivery components initialized");
        Ok(server)
    }

    /// 用现成的组件创建服务（测试和嵌入使用）
    pub fn from_parts(
        config: ServerConfig,
        repos: Repositories,
        presence: Arc<dyn PresenceStore>,
        queue: Arc<dyn JobQueue>,
        gateway: Arc<PushGateway>,
    ) -> Self {
        let settings = DeliverySettings::from_config(&config);

        let dispatcher = Arc::new(DeliveryDispatcher::new(
            repos.clone(),
            presence.clone(),
            queue.clone(),
            settings,
        ));
        let scheduler = Arc::new(RetryScheduler::new(
            repos.clone(),
            presence.clone(),
            queue.clone(),
            settings,
        ));
        let push_worker = Arc::new(PushDispatchWorker::new(
            presence.clone(),
            repos.tokens.clone(),
            gateway,
        ));

        Self {
            config,
            repos,
            presence,
            queue,
            dispatcher,
            scheduler,
            push_worker,
            database: None,
            redis: None,
        }
    }

    pub fn dispatcher(&self) -> Arc<DeliveryDispatcher> {
        self.dispatcher.clone()
    }

    pub fn presence(&self) -> Arc<dyn PresenceStore> {
        self.presence.clone()
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn queue(&self) -> Arc<dyn JobQueue> {
        self.queue.clone()
    }

    /// 启动三个工作池，返回它们的句柄
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let workers = &self.config.workers;
        let poll_interval = self.config.queue.poll_interval();

        let pools: [(Arc<dyn JobHandler>, usize); 3] = [
            (self.dispatcher.clone(), workers.message_concurrency),
            (self.push_worker.clone(), workers.push_concurrency),
            (self.scheduler.clone(), workers.retry_concurrency),
        ];

        pools
            .into_iter()
            .map(|(handler, concurrency)| {
                WorkerPool::new(self.queue.clone(), handler, concurrency, poll_interval)
                    .spawn(shutdown.clone())
            })
            .collect()
    }

    /// 运行直到收到关闭信号
    pub async fn run(&self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut handles = self.spawn_workers(shutdown_rx.clone());
        handles.push(self.start_pool_metrics(shutdown_rx));

        info!(
            "🚀 Delivery workers running (message={}, push={}, retry={})",
            self.config.workers.message_concurrency,
            self.config.workers.push_concurrency,
            self.config.workers.retry_concurrency
        );

        shutdown_signal().await;
        info!("🛑 Shutdown signal received, draining workers...");
        let _ = shutdown_tx.send(true);

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("Worker task panicked: {}", e);
            }
        }

        if let Some(database) = &self.database {
            database.close().await;
        }
        info!("👋 Delivery server stopped");
        Ok(())
    }

    /// 定时上报连接池指标
    fn start_pool_metrics(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let redis = self.redis.clone();
        let database = self.database.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }

                if let Some(ref redis) = redis {
                    let state = redis.pool_state();
                    let active = state.connections - state.idle_connections;
                    crate::infra::metrics::record_redis_pool(active, state.idle_connections);
                }

                if let Some(ref database) = database {
                    let pool = database.pool();
                    crate::infra::metrics::record_db_pool(pool.size(), pool.num_idle());
                }
            }
        })
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
