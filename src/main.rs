use anyhow::{Context, Result};
use courier::{
    cli::{Cli, Commands},
    config::{self, ServerConfig},
    infra::metrics,
    logging, DeliveryServer,
};
use std::fs;
use std::process;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载 .env 文件（如果存在）
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // 处理子命令
    if let Some(command) = &cli.command {
        match command {
            Commands::Run => {}
            Commands::Migrate => {
                return run_migrate(&cli).await;
            }
            Commands::GenerateConfig { path } => {
                return generate_config(path);
            }
            Commands::ValidateConfig { path } => {
                return validate_config(path);
            }
            Commands::ShowConfig => {
                return show_config(&cli);
            }
        }
    }

    // 快速读取配置文件的 [logging] 段（不加载完整配置）
    let early_log = config::load_early_logging_config(cli.config_file.as_deref());

    // 合并日志配置（优先级：CLI > 配置文件 > 默认值）
    let log_level = cli
        .get_log_level()
        .or(early_log.level)
        .unwrap_or_else(|| "info".to_string());
    let log_format = cli.get_log_format().or(early_log.format);
    let log_file = cli.log_file.clone().or(early_log.file);

    // 文件日志的 guard 必须活到进程结束
    let _log_guard = logging::init_logging(&log_level, log_format.as_deref(), log_file.as_deref(), cli.quiet)?;

    tracing::info!("🚀 courier starting...");

    // 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    let config = ServerConfig::load(&cli).context("加载配置失败")?;

    if cli.dev {
        tracing::info!("🔧 开发模式已启用（内存存储 / 内存队列 / 内存在线状态）");
    }

    tracing::info!("📊 Configuration:");
    tracing::info!("  - Store: {:?}", config.store.backend);
    tracing::info!("  - Queue: {:?}", config.queue.backend);
    tracing::info!("  - Presence: {:?}", config.presence.backend);
    tracing::info!("  - Push mode: {:?}", config.push.mode);
    tracing::info!(
        "  - Workers: message={}, push={}, retry={}",
        config.workers.message_concurrency,
        config.workers.push_concurrency,
        config.workers.retry_concurrency
    );
    tracing::info!(
        "  - Retry: max_attempts={}, base={}ms, max={}ms",
        config.retry.max_attempts,
        config.retry.base_delay_ms,
        config.retry.max_delay_ms
    );
    tracing::info!("  - Log Level: {}", log_level);
    if let Some(f) = &log_file {
        tracing::info!("  - Log File: {}", f);
    }

    if config.metrics.enabled {
        match metrics::init(config.metrics.port) {
            Ok(()) => tracing::info!("📈 Prometheus metrics on :{}/metrics", config.metrics.port),
            Err(e) => tracing::warn!("Failed to start metrics exporter: {}", e),
        }
    }

    let server = match DeliveryServer::new(config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("❌ 服务初始化失败: {}", e);
            tracing::error!("💡 请检查配置、数据库和 Redis 连接后重试");
            process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        tracing::error!("❌ 服务运行失败: {}", e);
        process::exit(1);
    }

    Ok(())
}

/// 生成默认配置文件
fn generate_config(path: &str) -> Result<()> {
    fs::write(path, config::DEFAULT_CONFIG_TOML).with_context(|| format!("无法写入配置文件: {}", path))?;
    println!("✅ 配置文件已生成: {}", path);
    Ok(())
}

/// 验证配置文件
fn validate_config(path: &str) -> Result<()> {
    let config = ServerConfig::from_toml_file(path)
        .with_context(|| format!("配置文件验证失败: {}", path))?;
    config
        .validate()
        .with_context(|| format!("配置文件验证失败: {}", path))?;

    println!("✅ 配置文件有效: {}", path);
    println!("📊 配置摘要:");
    println!("  - Store: {:?}", config.store.backend);
    println!("  - Queue: {:?}", config.queue.backend);
    println!("  - Presence: {:?}", config.presence.backend);
    println!("  - Push mode: {:?}", config.push.mode);

    Ok(())
}

// 编译时扫描 migrations/ 目录，按文件名排序嵌入
include!(concat!(env!("OUT_DIR"), "/migrations.rs"));

/// 执行数据库迁移
async fn run_migrate(cli: &Cli) -> Result<()> {
    // 获取 DATABASE_URL（CLI > 环境变量）
    let database_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .context("需要 DATABASE_URL，请在 .env 或环境变量中配置")?;

    println!("🔌 连接数据库...");
    let pool = sqlx::PgPool::connect(&database_url)
        .await
        .context("数据库连接失败，请检查 DATABASE_URL")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS courier_migrations (
            id SERIAL PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
    )
    .execute(&pool)
    .await
    .context("创建迁移记录表失败")?;

    let applied: Vec<String> = sqlx::query_scalar("SELECT name FROM courier_migrations ORDER BY id")
        .fetch_all(&pool)
        .await
        .context("查询迁移记录失败")?;

    let mut count = 0;
    for (name, sql) in MIGRATIONS {
        if applied.iter().any(|a| a.as_str() == *name) {
            println!("  ⏭ {} (已执行，跳过)", name);
            continue;
        }

        println!("  ▶ 执行 {}...", name);
        sqlx::raw_sql(sql)
            .execute(&pool)
            .await
            .with_context(|| format!("执行迁移失败: {}", name))?;

        sqlx::query("INSERT INTO courier_migrations (name) VALUES ($1)")
            .bind(*name)
            .execute(&pool)
            .await
            .with_context(|| format!("记录迁移状态失败: {}", name))?;

        println!("  ✅ {} 完成", name);
        count += 1;
    }

    if count == 0 {
        println!("✅ 数据库已是最新，无需迁移");
    } else {
        println!("✅ 成功执行 {} 个迁移", count);
    }

    pool.close().await;
    Ok(())
}

/// 显示最终配置（合并后的配置）
fn show_config(cli: &Cli) -> Result<()> {
    let _guard = logging::init_logging("info", None, None, false)?;

    let config = ServerConfig::load(cli).context("加载配置失败")?;

    println!("📊 最终配置（合并后的配置）:");
    println!("{}", serde_json::to_string_pretty(&config)?);

    Ok(())
}
