//! Kafka 消息消费者
//!
//! 每条 WebSocket 连接一个消费者，独占一个消费组并关闭自动提交：
//! 只有成功投递（或确认无需投递）的消息才提交位移。
//! 创建时直接按各分区当前的高水位分配读取位置，不等待消费组重平衡。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::kafka::admin::KafkaTopicAdmin;
use crate::kafka::{KafkaError, KafkaResult};
use application::liveness::{self, PayloadVerdict};
use application::{
    DeliveryError, DeliveryHandler, PubSubError, PubSubResult, TopicConsumer, TransportSettings,
};
use config::KafkaConfig;
use domain::Topic;

/// 查询分区元数据和水位的超时
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// 单个订阅的 Kafka 消费端
pub struct KafkaTopicConsumer {
    consumer: StreamConsumer,
    topic: Topic,
    group_id: String,
    admin: Arc<KafkaTopicAdmin>,
    settings: Arc<TransportSettings>,
}

impl KafkaTopicConsumer {
    /// 创建消费者，并把读取位置固定在每个分区的末尾
    ///
    /// 会阻塞在元数据请求上，异步上下文中应放到 `spawn_blocking` 里调用。
    pub fn new(
        config: &KafkaConfig,
        group_id: String,
        topic: Topic,
        admin: Arc<KafkaTopicAdmin>,
        settings: Arc<TransportSettings>,
    ) -> KafkaResult<Self> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &group_id)
            .set("group.id", &group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "latest")
            .set("session.timeout.ms", "10000")
            .set("heartbeat.interval.ms", "3000");

        let consumer: StreamConsumer =
            client_config
                .create()
                .map_err(|e| KafkaError::ConfigError {
                    message: format!("创建 Kafka 消费者失败: {}", e),
                })?;

        let assignment = Self::end_offsets(&consumer, &topic)?;
        consumer
            .assign(&assignment)
            .map_err(|e| KafkaError::ConsumerError {
                message: format!("分配分区失败: {}", e),
            })?;

        info!(
            topic = %topic,
            group_id = %group_id,
            partitions = assignment.count(),
            "Kafka 消费者已订阅"
        );

        Ok(Self {
            consumer,
            topic,
            group_id,
            admin,
            settings,
        })
    }

    /// 主题所有分区及其当前高水位
    fn end_offsets(consumer: &StreamConsumer, topic: &Topic) -> KafkaResult<TopicPartitionList> {
        let metadata = consumer.fetch_metadata(Some(topic.as_str()), METADATA_TIMEOUT)?;
        let partitions: Vec<i32> = metadata
            .topics()
            .iter()
            .filter(|meta| meta.name() == topic.as_str())
            .flat_map(|meta| meta.partitions().iter().map(|partition| partition.id()))
            .collect();
        if partitions.is_empty() {
            return Err(KafkaError::UnknownTopic {
                topic: topic.to_string(),
            });
        }

        let mut assignment = TopicPartitionList::new();
        for partition in partitions {
            let (_, high) = consumer.fetch_watermarks(topic.as_str(), partition, METADATA_TIMEOUT)?;
            assignment.add_partition_offset(topic.as_str(), partition, Offset::Offset(high))?;
        }
        Ok(assignment)
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    fn commit(&self, message: &BorrowedMessage<'_>) {
        if let Err(err) = self.consumer.commit_message(message, CommitMode::Async) {
            error!(topic = %self.topic, offset = message.offset(), error = %err, "提交位移失败");
        }
    }
}

#[async_trait]
impl TopicConsumer for KafkaTopicConsumer {
    fn topic(&self) -> &Topic {
        &self.topic
    }

    async fn read_messages(&mut self, cancel: CancellationToken, handler: Arc<dyn DeliveryHandler>) {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return,
                received = timeout(self.settings.reading_timeout(), self.consumer.recv()) => received,
            };

            let message = match received {
                // 读取超时只是回到循环顶部检查取消
                Err(_) => continue,
                Ok(Ok(message)) => message,
                Ok(Err(err)) => {
                    error!(topic = %self.topic, error = %err, "读取消息失败，结束读取");
                    return;
                }
            };

            let payload = message.payload().unwrap_or_default();
            match liveness::inspect(payload) {
                PayloadVerdict::Deliver => match handler.deliver(payload).await {
                    Ok(()) => self.commit(&message),
                    Err(DeliveryError::Closed) => {
                        debug!(topic = %self.topic, "连接已关闭，结束读取");
                        return;
                    }
                    Err(err) => {
                        error!(topic = %self.topic, offset = message.offset(), error = %err, "投递失败");
                    }
                },
                PayloadVerdict::Malformed(err) => {
                    warn!(topic = %self.topic, offset = message.offset(), error = %err, "无法解码的消息");
                }
                verdict => {
                    debug!(topic = %self.topic, offset = message.offset(), ?verdict, "跳过消息");
                    self.commit(&message);
                }
            }
        }
    }

    async fn unsubscribe(self: Box<Self>) -> PubSubResult<()> {
        let Self {
            consumer,
            topic,
            group_id,
            admin,
            ..
        } = *self;

        if let Err(err) = consumer.unassign() {
            warn!(topic = %topic, group_id = %group_id, error = %err, "取消分区分配失败");
        }
        drop(consumer);

        admin
            .delete_group(&group_id)
            .await
            .map_err(|err| PubSubError::unsubscribe(&topic, err.to_string()))?;

        debug!(topic = %topic, group_id = %group_id, "Kafka 订阅已释放");
        Ok(())
    }
}
