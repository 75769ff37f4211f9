//! 发布/订阅传输契约
//!
//! 每个用户对应一个主题，每条 WebSocket 连接对应一个独立的订阅。
//! 消息代理只依赖这里的 trait，Kafka、Redis Streams 和进程内实现
//! 都通过实现同一组 trait 接入。

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use domain::Topic;

/// 传输层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PubSubError {
    #[error("主题 {topic} 准备失败: {message}")]
    Provision { topic: String, message: String },

    #[error("发布到主题 {topic} 失败: {message}")]
    Publish { topic: String, message: String },

    #[error("订阅主题 {topic} 失败: {message}")]
    Subscribe { topic: String, message: String },

    #[error("释放订阅 {topic} 失败: {message}")]
    Unsubscribe { topic: String, message: String },

    #[error("传输连接错误: {message}")]
    Connection { message: String },

    #[error("传输层已关闭")]
    Closed,
}

impl PubSubError {
    pub fn provision(topic: &Topic, message: impl Into<String>) -> Self {
        Self::Provision {
            topic: topic.to_string(),
            message: message.into(),
        }
    }

    pub fn publish(topic: &Topic, message: impl Into<String>) -> Self {
        Self::Publish {
            topic: topic.to_string(),
            message: message.into(),
        }
    }

    pub fn subscribe(topic: &Topic, message: impl Into<String>) -> Self {
        Self::Subscribe {
            topic: topic.to_string(),
            message: message.into(),
        }
    }

    pub fn unsubscribe(topic: &Topic, message: impl Into<String>) -> Self {
        Self::Unsubscribe {
            topic: topic.to_string(),
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }
}

pub type PubSubResult<T> = Result<T, PubSubError>;

/// 投递回调的错误
///
/// `Closed` 表示下游连接已经关闭，读取循环收到后必须退出；
/// 其它错误只影响当前这条消息。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("连接已关闭")]
    Closed,

    #[error("投递失败: {message}")]
    Failed { message: String },
}

impl DeliveryError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// 订阅读取到消息后的投递回调
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn deliver(&self, payload: &[u8]) -> Result<(), DeliveryError>;
}

/// 单个订阅的消费端
///
/// 由 [`PubSub::subscribe`] 创建，生命周期为：创建 → 读取循环 → 释放。
/// `unsubscribe` 消耗自身，因此只能在读取循环结束、消费端被交还之后调用。
#[async_trait]
pub trait TopicConsumer: Send {
    fn topic(&self) -> &Topic;

    /// 持续读取并投递消息，直到令牌被取消或回调返回 [`DeliveryError::Closed`]。
    ///
    /// 过期的输入提示和保活条目不会交给回调。
    async fn read_messages(&mut self, cancel: CancellationToken, handler: Arc<dyn DeliveryHandler>);

    /// 释放该订阅在传输端持有的资源（消费组、连接等）
    async fn unsubscribe(self: Box<Self>) -> PubSubResult<()>;
}

/// 发布/订阅传输
#[async_trait]
pub trait PubSub: Send + Sync {
    /// 消息最短保留时长，在首次订阅/发布之前设置
    fn set_min_storage_duration(&self, duration: Duration);

    /// 单次读取的最长阻塞时间，决定读取循环响应取消的粒度
    fn set_reading_timeout(&self, timeout: Duration);

    /// 同一用户断线重连后是否会收到断线期间发布的消息
    fn redelivers_after_reconnect(&self) -> bool;

    async fn subscribe(&self, topic: &Topic) -> PubSubResult<Box<dyn TopicConsumer>>;

    async fn publish(&self, topic: &Topic, payload: &[u8]) -> PubSubResult<()>;

    async fn close(&self) -> PubSubResult<()>;
}

/// 各传输共享的可调参数
///
/// 设置在代理分配时写入一次，之后由各订阅的读取循环读取。
#[derive(Debug)]
pub struct TransportSettings {
    min_storage_ms: AtomicU64,
    reading_timeout_ms: AtomicU64,
}

impl TransportSettings {
    pub fn new(min_storage: Duration, reading_timeout: Duration) -> Self {
        Self {
            min_storage_ms: AtomicU64::new(duration_ms(min_storage)),
            reading_timeout_ms: AtomicU64::new(duration_ms(reading_timeout)),
        }
    }

    pub fn shared(min_storage: Duration, reading_timeout: Duration) -> Arc<Self> {
        Arc::new(Self::new(min_storage, reading_timeout))
    }

    pub fn min_storage(&self) -> Duration {
        Duration::from_millis(self.min_storage_ms.load(Ordering::Relaxed))
    }

    pub fn set_min_storage(&self, duration: Duration) {
        self.min_storage_ms
            .store(duration_ms(duration), Ordering::Relaxed);
    }

    pub fn reading_timeout(&self) -> Duration {
        Duration::from_millis(self.reading_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_reading_timeout(&self, timeout: Duration) {
        self.reading_timeout_ms
            .store(duration_ms(timeout).max(1), Ordering::Relaxed);
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::new(Duration::from_secs(72 * 60 * 60), Duration::from_millis(500))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip_in_milliseconds() {
        let settings = TransportSettings::default();
        assert_eq!(settings.min_storage(), Duration::from_secs(259_200));
        assert_eq!(settings.reading_timeout(), Duration::from_millis(500));

        settings.set_reading_timeout(Duration::ZERO);
        assert_eq!(settings.reading_timeout(), Duration::from_millis(1));

        settings.set_min_storage(Duration::from_secs(60));
        assert_eq!(settings.min_storage(), Duration::from_secs(60));
    }

    #[test]
    fn errors_name_the_topic() {
        let topic = Topic::for_user(domain::UserId::new(8));
        let err = PubSubError::publish(&topic, "broker down");
        assert_eq!(err.to_string(), "发布到主题 8 失败: broker down");
    }
}
