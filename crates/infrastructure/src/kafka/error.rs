//! Kafka 错误类型定义

use thiserror::Error;

/// Kafka 操作错误
#[derive(Error, Debug)]
pub enum KafkaError {
    /// 连接错误
    #[error("Kafka 连接错误: {message}")]
    ConnectionError { message: String },

    /// 生产者错误
    #[error("Kafka 生产者错误: {message}")]
    ProducerError { message: String },

    /// 消费者错误
    #[error("Kafka 消费者错误: {message}")]
    ConsumerError { message: String },

    /// 管理接口错误（主题、消费组）
    #[error("Kafka 管理操作错误: {message}")]
    AdminError { message: String },

    /// 主题不存在
    #[error("Kafka 主题不存在: {topic}")]
    UnknownTopic { topic: String },

    /// 配置错误
    #[error("配置错误: {message}")]
    ConfigError { message: String },
}

/// Kafka 结果类型
pub type KafkaResult<T> = Result<T, KafkaError>;

impl From<rdkafka::error::KafkaError> for KafkaError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        match err {
            rdkafka::error::KafkaError::ClientConfig(..) | rdkafka::error::KafkaError::ClientCreation(_) => {
                KafkaError::ConfigError {
                    message: err.to_string(),
                }
            }
            rdkafka::error::KafkaError::ConsumerCommit(_)
            | rdkafka::error::KafkaError::MessageConsumption(_)
            | rdkafka::error::KafkaError::Subscription(_) => KafkaError::ConsumerError {
                message: err.to_string(),
            },
            rdkafka::error::KafkaError::AdminOp(_) | rdkafka::error::KafkaError::AdminOpCreation(_) => {
                KafkaError::AdminError {
                    message: err.to_string(),
                }
            }
            rdkafka::error::KafkaError::Canceled => KafkaError::ProducerError {
                message: "操作被取消".to_string(),
            },
            _ => KafkaError::ConnectionError {
                message: err.to_string(),
            },
        }
    }
}
