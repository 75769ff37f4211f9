//! Kafka 主题与消费组管理
//!
//! 所有会话共用一个 AdminClient：订阅前准备主题并写入保留时长，
//! 释放订阅时删除该连接独占的消费组。

use std::time::Duration;

use rdkafka::admin::{
    AdminClient, AdminOptions, AlterConfig, NewTopic, ResourceSpecifier, TopicReplication,
};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::types::RDKafkaErrorCode;
use tracing::{debug, info};

use crate::kafka::{KafkaError, KafkaResult};
use config::KafkaConfig;

pub struct KafkaTopicAdmin {
    admin: AdminClient<DefaultClientContext>,
    partition_count: i32,
    replication_factor: i32,
    request_timeout: Duration,
}

impl KafkaTopicAdmin {
    pub fn new(config: &KafkaConfig, request_timeout: Duration) -> KafkaResult<Self> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", format!("{}-admin", config.client_id))
            .create()
            .map_err(|e| KafkaError::ConfigError {
                message: format!("创建 Kafka 管理客户端失败: {}", e),
            })?;

        Ok(Self {
            admin,
            partition_count: config.partition_count,
            replication_factor: config.replication_factor,
            request_timeout,
        })
    }

    fn options(&self) -> AdminOptions {
        AdminOptions::new().request_timeout(Some(self.request_timeout))
    }

    /// 确保主题存在并应用保留时长
    ///
    /// 主题已存在不算错误；保留时长每次都会重新写入。
    pub async fn ensure_topic(&self, topic: &str, retention: Duration) -> KafkaResult<()> {
        let retention_ms = retention.as_millis().to_string();
        let options = self.options();

        let new_topic = NewTopic::new(
            topic,
            self.partition_count,
            TopicReplication::Fixed(self.replication_factor),
        )
        .set("retention.ms", &retention_ms);

        for result in self.admin.create_topics(&[new_topic], &options).await? {
            match result {
                Ok(name) => info!(topic = %name, "Kafka 主题已创建"),
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((name, code)) => {
                    return Err(KafkaError::AdminError {
                        message: format!("创建主题 {} 失败: {}", name, code),
                    })
                }
            }
        }

        let retention_config =
            AlterConfig::new(ResourceSpecifier::Topic(topic)).set("retention.ms", &retention_ms);
        for result in self.admin.alter_configs(&[retention_config], &options).await? {
            if let Err((resource, code)) = result {
                return Err(KafkaError::AdminError {
                    message: format!("修改 {:?} 的保留时长失败: {}", resource, code),
                });
            }
        }

        debug!(topic, retention_ms = %retention_ms, "Kafka 主题已就绪");
        Ok(())
    }

    /// 删除消费组，消费组不存在视为成功
    pub async fn delete_group(&self, group_id: &str) -> KafkaResult<()> {
        for result in self.admin.delete_groups(&[group_id], &self.options()).await? {
            match result {
                Ok(_) | Err((_, RDKafkaErrorCode::GroupIdNotFound)) => {}
                Err((group, code)) => {
                    return Err(KafkaError::AdminError {
                        message: format!("删除消费组 {} 失败: {}", group, code),
                    })
                }
            }
        }
        debug!(group_id, "Kafka 消费组已删除");
        Ok(())
    }
}
