//! Kafka 消息生产者
//!
//! 进程内共用一个生产者，负责把消息负载写入接收者的主题。

use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use tracing::{debug, info};

use crate::kafka::{KafkaError, KafkaResult};
use config::KafkaConfig;

/// Kafka 消息生产者
pub struct KafkaMessageProducer {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaMessageProducer {
    /// 创建新的 Kafka 生产者
    ///
    /// # 参数
    /// - `config`: Kafka 配置
    /// - `send_timeout`: 单条消息等待确认的最长时间
    ///
    /// # 返回
    /// - `Ok(KafkaMessageProducer)`: 成功创建的生产者
    /// - `Err(KafkaError)`: 创建失败的错误
    pub fn new(config: &KafkaConfig, send_timeout: Duration) -> KafkaResult<Self> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("message.timeout.ms", send_timeout.as_millis().to_string())
            .set("compression.type", "snappy")
            .set("enable.idempotence", "true")
            .set("max.in.flight.requests.per.connection", "5");

        let producer: FutureProducer =
            client_config
                .create()
                .map_err(|e| KafkaError::ConfigError {
                    message: format!("创建 Kafka 生产者失败: {}", e),
                })?;

        info!(brokers = %config.brokers, "Kafka 生产者创建成功");

        Ok(Self {
            producer,
            send_timeout,
        })
    }

    /// 发送一条消息并等待确认
    pub async fn send(&self, topic: &str, payload: &[u8]) -> KafkaResult<()> {
        let record: FutureRecord<'_, (), [u8]> = FutureRecord::to(topic).payload(payload);

        match self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
        {
            Ok(_) => {
                debug!(topic, "消息已写入");
                Ok(())
            }
            Err((err, _)) => match err.rdkafka_error_code() {
                Some(RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownTopic) => {
                    Err(KafkaError::UnknownTopic {
                        topic: topic.to_string(),
                    })
                }
                _ => Err(KafkaError::ProducerError {
                    message: format!("发送失败: {}", err),
                }),
            },
        }
    }

    /// 刷新生产者缓冲区
    pub fn flush(&self, timeout: Duration) -> KafkaResult<()> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|e| KafkaError::ProducerError {
                message: format!("刷新生产者缓冲区失败: {}", e),
            })
    }
}

impl Drop for KafkaMessageProducer {
    fn drop(&mut self) {
        info!("Kafka 生产者正在关闭");
    }
}
