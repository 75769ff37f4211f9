//! 进程内发布/订阅实现
//!
//! 按主题维护一段追加日志，语义与 Redis Streams 适配器一致：订阅时写入
//! 一条空的保活条目并从该位置开始读取（读取开始时删除该条目），
//! 发布时按保留时长裁剪旧条目。
//! 用于单节点部署和测试。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::liveness::{self, PayloadVerdict};
use crate::pubsub::{
    DeliveryError, DeliveryHandler, PubSub, PubSubError, PubSubResult, TopicConsumer,
    TransportSettings,
};
use domain::Topic;

const DEFAULT_BATCH: usize = 100;

struct Entry {
    appended_at: DateTime<Utc>,
    payload: Arc<[u8]>,
}

#[derive(Default)]
struct TopicLog {
    last_id: u64,
    entries: BTreeMap<u64, Entry>,
    notify: Arc<Notify>,
}

impl TopicLog {
    fn append(&mut self, payload: &[u8], retention: Duration) -> u64 {
        let now = Utc::now();
        if let Ok(retention) = chrono::Duration::from_std(retention) {
            let floor = now - retention;
            self.entries.retain(|_, entry| entry.appended_at >= floor);
        }

        self.last_id += 1;
        self.entries.insert(
            self.last_id,
            Entry {
                appended_at: now,
                payload: Arc::from(payload),
            },
        );
        self.notify.notify_waiters();
        self.last_id
    }
}

type Topics = Arc<Mutex<HashMap<Topic, TopicLog>>>;

#[derive(Clone)]
pub struct LocalPubSub {
    topics: Topics,
    settings: Arc<TransportSettings>,
    closed: Arc<AtomicBool>,
    batch_size: usize,
}

impl LocalPubSub {
    pub fn new() -> Self {
        Self {
            topics: Arc::default(),
            settings: Arc::new(TransportSettings::default()),
            closed: Arc::new(AtomicBool::new(false)),
            batch_size: DEFAULT_BATCH,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// 主题中当前保留的条目数
    pub async fn stored_len(&self, topic: &Topic) -> usize {
        let topics = self.topics.lock().await;
        topics.get(topic).map_or(0, |log| log.entries.len())
    }

    fn ensure_open(&self) -> PubSubResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PubSubError::Closed);
        }
        Ok(())
    }
}

impl Default for LocalPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for LocalPubSub {
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
        let cursor = {
            let mut topics = self.topics.lock().await;
            topics
                .entry(topic.clone())
                .or_default()
                .append(&[], self.settings.min_storage())
        };

        Ok(Box::new(LocalTopicConsumer {
            topic: topic.clone(),
            topics: self.topics.clone(),
            settings: self.settings.clone(),
            cursor,
            batch_size: self.batch_size,
        }))
    }

    async fn publish(&self, topic: &Topic, payload: &[u8]) -> PubSubResult<()> {
        self.ensure_open()?;
        let mut topics = self.topics.lock().await;
        topics
            .entry(topic.clone())
            .or_default()
            .append(payload, self.settings.min_storage());
        Ok(())
    }

    async fn close(&self) -> PubSubResult<()> {
        self.closed.store(true, Ordering::Release);
        let topics = self.topics.lock().await;
        for log in topics.values() {
            log.notify.notify_waiters();
        }
        Ok(())
    }
}

pub struct LocalTopicConsumer {
    topic: Topic,
    topics: Topics,
    settings: Arc<TransportSettings>,
    cursor: u64,
    batch_size: usize,
}

impl LocalTopicConsumer {
    async fn next_batch(&self) -> (Arc<Notify>, Vec<(u64, Arc<[u8]>)>) {
        let mut topics = self.topics.lock().await;
        let log = topics.entry(self.topic.clone()).or_default();
        let batch = log
            .entries
            .range(self.cursor + 1..)
            .take(self.batch_size)
            .map(|(id, entry)| (*id, entry.payload.clone()))
            .collect();
        (log.notify.clone(), batch)
    }

    async fn delete(&self, id: u64) {
        let mut topics = self.topics.lock().await;
        if let Some(log) = topics.get_mut(&self.topic) {
            log.entries.remove(&id);
        }
    }
}

#[async_trait]
impl TopicConsumer for LocalTopicConsumer {
    fn topic(&self) -> &Topic {
        &self.topic
    }

    async fn read_messages(&mut self, cancel: CancellationToken, handler: Arc<dyn DeliveryHandler>) {
        // 游标指向自己的保活条目，之后的读取不会再看到它
        self.delete(self.cursor).await;

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let (notify, batch) = self.next_batch().await;
            if batch.is_empty() {
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                // 加锁读取与注册通知之间可能有新条目写入，再检查一次
                if !self.next_batch().await.1.is_empty() {
                    continue;
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::timeout(self.settings.reading_timeout(), notified) => continue,
                }
            }

            for (id, payload) in batch {
                self.cursor = id;
                match liveness::inspect(&payload) {
                    PayloadVerdict::Deliver => match handler.deliver(&payload).await {
                        Ok(()) => {}
                        Err(DeliveryError::Closed) => {
                            tracing::debug!(topic = %self.topic, "连接已关闭，结束读取");
                            return;
                        }
                        Err(err) => {
                            tracing::error!(topic = %self.topic, entry_id = id, error = %err, "投递失败");
                        }
                    },
                    PayloadVerdict::Malformed(err) => {
                        tracing::warn!(topic = %self.topic, entry_id = id, error = %err, "无法解码的条目");
                    }
                    verdict => {
                        tracing::trace!(topic = %self.topic, entry_id = id, ?verdict, "丢弃条目");
                        self.delete(id).await;
                    }
                }
            }
        }
    }

    async fn unsubscribe(self: Box<Self>) -> PubSubResult<()> {
        Ok(())
    }
}
