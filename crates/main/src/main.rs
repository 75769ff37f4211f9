//! 主应用程序入口
//!
//! 加载配置、连接数据库、选择消息传输，然后启动 Axum Web API 服务。

use std::sync::Arc;

use anyhow::Context;
use application::{
    Broker, BrokerTimeouts, LocalPubSub, MessageService, MessageServiceDependencies, PubSub,
    RetryConfig, SystemClock,
};
use config::{AppConfig, TransportKind};
use infrastructure::{
    create_pg_pool, KafkaPubSub, PgChatRepository, PgMessageRepository, PgUserRepository,
    RedisStreamPubSub, MIGRATOR,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env().context("加载配置失败")?;
    config.validate().context("配置无效")?;

    tracing::info!(
        "连接数据库: {}",
        config.database.url.split('@').next_back().unwrap_or("unknown")
    );
    let pg_pool = create_pg_pool(&config.database.url, config.database.max_connections).await?;

    // 运行迁移
    MIGRATOR.run(&pg_pool).await?;

    let timeouts = BrokerTimeouts {
        subscribe: config.broker.subscribe_timeout(),
        unsubscribe: config.broker.unsubscribe_timeout(),
        publish: config.broker.publish_timeout(),
        min_storage: config.broker.min_storage(),
        reading: config.broker.reading_timeout(),
    };
    let transport = build_transport(&config).await?;
    let broker = Arc::new(Broker::with_transport(transport, timeouts).context("装配消息代理失败")?);
    tracing::info!(
        transport = %config.broker.transport,
        redelivers_after_reconnect = broker.redelivers_after_reconnect()?,
        "消息代理已就绪"
    );

    let message_service = Arc::new(MessageService::new(MessageServiceDependencies {
        message_repository: Arc::new(PgMessageRepository::new(pg_pool.clone())),
        chat_repository: Arc::new(PgChatRepository::new(pg_pool.clone())),
        user_repository: Arc::new(PgUserRepository::new(pg_pool)),
        broker: broker.clone(),
        clock: Arc::new(SystemClock),
        write_retry: RetryConfig::new(
            config.persistence.write_attempts,
            config.persistence.retry_base(),
        ),
    }));

    let shutdown = CancellationToken::new();
    let state = AppState::new(
        broker.clone(),
        message_service,
        Arc::new(JwtService::new(config.jwt.clone())),
        shutdown.clone(),
        config.session.clone(),
    );

    // 启动 Web 服务器
    let app = router(state);
    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;

    tracing::info!("聊天室服务器启动在 http://{}", address);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    broker.close().await?;
    tracing::info!("服务器已停止");
    Ok(())
}

async fn build_transport(config: &AppConfig) -> anyhow::Result<Arc<dyn PubSub>> {
    let transport: Arc<dyn PubSub> = match config.broker.transport {
        TransportKind::Kafka => Arc::new(
            KafkaPubSub::new(&config.kafka, config.broker.publish_timeout())
                .context("创建 Kafka 传输失败")?,
        ),
        TransportKind::Redis => Arc::new(
            RedisStreamPubSub::new(&config.redis)
                .await
                .context("创建 Redis 传输失败")?,
        ),
        TransportKind::Memory => {
            Arc::new(LocalPubSub::new().with_batch_size(config.redis.read_batch))
        }
    };
    Ok(transport)
}

/// 收到 Ctrl+C 后取消根令牌，所有会话随之关闭
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "监听关闭信号失败");
    }
    tracing::info!("收到关闭信号");
    shutdown.cancel();
}
