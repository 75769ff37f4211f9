//! Kafka 消息队列模块
//!
//! 以用户主题为单位的日志型传输：进程内共用一个生产者和一个管理客户端，
//! 每条连接一个独立的消费组。

pub mod admin;
pub mod consumer;
pub mod error;
pub mod producer;

// 重新导出
pub use admin::*;
pub use consumer::*;
pub use error::*;
pub use producer::*;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use application::{PubSub, PubSubError, PubSubResult, TopicConsumer, TransportSettings};
use config::KafkaConfig;
use domain::Topic;

/// 管理请求（建主题、删消费组）的超时
const ADMIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// 基于 Kafka 的发布/订阅传输
pub struct KafkaPubSub {
    config: KafkaConfig,
    producer: KafkaMessageProducer,
    admin: Arc<KafkaTopicAdmin>,
    settings: Arc<TransportSettings>,
    instance: String,
    consumers: AtomicU64,
    closed: AtomicBool,
}

impl KafkaPubSub {
    pub fn new(config: &KafkaConfig, send_timeout: Duration) -> KafkaResult<Self> {
        let producer = KafkaMessageProducer::new(config, send_timeout)?;
        let admin = KafkaTopicAdmin::new(config, ADMIN_REQUEST_TIMEOUT)?;
        let instance = Uuid::new_v4().simple().to_string()[..8].to_string();

        info!(brokers = %config.brokers, instance = %instance, "Kafka 传输已创建");

        Ok(Self {
            config: config.clone(),
            producer,
            admin: Arc::new(admin),
            settings: Arc::new(TransportSettings::default()),
            instance,
            consumers: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// 每条连接独占的消费组名，同一进程内单调递增，不同实例之间不冲突
    fn next_group_id(&self) -> String {
        let n = self.consumers.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}_{}_{}", self.config.group_prefix, self.instance, n)
    }

    fn ensure_open(&self) -> PubSubResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PubSubError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PubSub for KafkaPubSub {
    fn set_min_storage_duration(&self, duration: Duration) {
        self.settings.set_min_storage(duration);
    }

    fn set_reading_timeout(&self, timeout: Duration) {
        self.settings.set_reading_timeout(timeout);
    }

    fn redelivers_after_reconnect(&self) -> bool {
        // 消费组随连接创建和删除，新连接从最新位置开始读
        false
    }

    async fn subscribe(&self, topic: &Topic) -> PubSubResult<Box<dyn TopicConsumer>> {
        self.ensure_open()?;

        self.admin
            .ensure_topic(topic.as_str(), self.settings.min_storage())
            .await
            .map_err(|err| PubSubError::provision(topic, err.to_string()))?;

        let config = self.config.clone();
        let group_id = self.next_group_id();
        let owned_topic = topic.clone();
        let admin = self.admin.clone();
        let settings = self.settings.clone();

        // 返回前读取位置已经确定，之后发布的消息都会被读到
        let consumer = tokio::task::spawn_blocking(move || {
            KafkaTopicConsumer::new(&config, group_id, owned_topic, admin, settings)
        })
        .await
        .map_err(|err| PubSubError::subscribe(topic, err.to_string()))?
        .map_err(|err| PubSubError::subscribe(topic, err.to_string()))?;

        Ok(Box::new(consumer))
    }

    async fn publish(&self, topic: &Topic, payload: &[u8]) -> PubSubResult<()> {
        self.ensure_open()?;

        match self.producer.send(topic.as_str(), payload).await {
            Ok(()) => Ok(()),
            Err(KafkaError::UnknownTopic { .. }) => {
                // 接收者从未上线过，主题尚不存在
                self.admin
                    .ensure_topic(topic.as_str(), self.settings.min_storage())
                    .await
                    .map_err(|err| PubSubError::provision(topic, err.to_string()))?;
                self.producer
                    .send(topic.as_str(), payload)
                    .await
                    .map_err(|err| PubSubError::publish(topic, err.to_string()))
            }
            Err(err) => Err(PubSubError::publish(topic, err.to_string())),
        }
    }

    async fn close(&self) -> PubSubResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(err) = self.producer.flush(FLUSH_TIMEOUT) {
            warn!(error = %err, "关闭前刷新 Kafka 生产者失败");
            return Err(PubSubError::connection(err.to_string()));
        }
        info!("Kafka 传输已关闭");
        Ok(())
    }
}
