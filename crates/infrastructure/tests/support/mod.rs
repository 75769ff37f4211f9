//! 传输适配器集成测试的公共工具

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use application::{DeliveryError, DeliveryHandler, TopicConsumer};
use async_trait::async_trait;
use chrono::Utc;
use domain::{ChatId, ChatMessage, MessageKind, UserId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct Collector(Mutex<Vec<ChatMessage>>);

impl Collector {
    pub fn received(&self) -> Vec<ChatMessage> {
        self.0.lock().unwrap().clone()
    }

    /// 等到至少收到 `count` 条消息
    pub async fn wait_for(&self, count: usize, within: Duration) -> Vec<ChatMessage> {
        tokio::time::timeout(within, async {
            loop {
                let received = self.received();
                if received.len() >= count {
                    return received;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("messages not delivered in time")
    }
}

#[async_trait]
impl DeliveryHandler for Collector {
    async fn deliver(&self, payload: &[u8]) -> Result<(), DeliveryError> {
        let message =
            ChatMessage::decode(payload).map_err(|e| DeliveryError::failed(e.to_string()))?;
        self.0.lock().unwrap().push(message);
        Ok(())
    }
}

pub fn encoded(text: &str, kind: MessageKind, age_secs: i64) -> Vec<u8> {
    let mut message = ChatMessage::new(ChatId::new(1), text, kind);
    message.stamp(
        UserId::new(1),
        "Test",
        Utc::now() - chrono::Duration::seconds(age_secs),
    );
    message.encode().unwrap()
}

pub fn spawn_reader(
    mut consumer: Box<dyn TopicConsumer>,
    cancel: CancellationToken,
    handler: Arc<Collector>,
) -> JoinHandle<Box<dyn TopicConsumer>> {
    tokio::spawn(async move {
        consumer.read_messages(cancel, handler).await;
        consumer
    })
}
