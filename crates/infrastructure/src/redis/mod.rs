//! Redis Streams 模块
//!
//! 以用户主题为流名的追加日志传输：写入端共用一个连接管理器，
//! 每个订阅的读取端使用独立连接。

pub mod error;
pub mod publisher;
pub mod subscriber;

// 重新导出
pub use error::*;
pub use publisher::*;
pub use subscriber::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::Client;
use tracing::info;

use application::{PubSub, PubSubError, PubSubResult, TopicConsumer, TransportSettings};
use config::RedisConfig;
use domain::Topic;

/// 基于 Redis Streams 的发布/订阅传输
pub struct RedisStreamPubSub {
    client: Client,
    publisher: RedisStreamPublisher,
    settings: Arc<TransportSettings>,
    read_batch: usize,
    closed: AtomicBool,
}

impl RedisStreamPubSub {
    pub async fn new(config: &RedisConfig) -> RedisResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| RedisError::ConfigError {
            message: format!("创建 Redis 客户端失败: {}", e),
        })?;
        let publisher = RedisStreamPublisher::new(&client).await?;

        info!(read_batch = config.read_batch, "Redis Streams 传输已创建");

        Ok(Self {
            client,
            publisher,
            settings: Arc::new(TransportSettings::default()),
            read_batch: config.read_batch,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> PubSubResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PubSubError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PubSub for RedisStreamPubSub {
    fn set_min_storage_duration(&self, duration: Duration) {
        self.settings.set_min_storage(duration);
    }

    fn set_reading_timeout(&self, timeout: Duration) {
        self.settings.set_reading_timeout(timeout);
    }

    fn redelivers_after_reconnect(&self) -> bool {
        false
    }

    async fn subscribe(&self, topic: &Topic) -> PubSubResult<Box<dyn TopicConsumer>> {
        self.ensure_open()?;

        // 保活条目保证流存在，并给出读取起点
        let cursor = self
            .publisher
            .append(topic.as_str(), &[], self.settings.min_storage())
            .await
            .map_err(|err| PubSubError::subscribe(topic, err.to_string()))?;

        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| PubSubError::subscribe(topic, err.to_string()))?;

        Ok(Box::new(RedisStreamConsumer::new(
            connection,
            topic.clone(),
            cursor,
            self.read_batch,
            self.settings.clone(),
        )))
    }

    async fn publish(&self, topic: &Topic, payload: &[u8]) -> PubSubResult<()> {
        self.ensure_open()?;
        self.publisher
            .append(topic.as_str(), payload, self.settings.min_storage())
            .await
            .map(|_| ())
            .map_err(|err| PubSubError::publish(topic, err.to_string()))
    }

    async fn close(&self) -> PubSubResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Redis Streams 传输已关闭");
        }
        Ok(())
    }
}
