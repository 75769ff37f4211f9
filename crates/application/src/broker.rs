//! 消息代理外观
//!
//! 进程内唯一的发布/订阅入口。传输实现只能分配一次，分配时写入保留时长
//! 和读取超时；此后订阅、发布、释放都经由这里完成，并各自带有超时。
//!
//! 订阅的读取循环运行在独立任务中，任务结束时把消费端交还给
//! [`Subscription`]。[`Broker::unsubscribe`] 先取消令牌、等待任务结束，
//! 拿回消费端后才释放传输端资源，因此释放绝不会与仍在运行的读取循环并发。

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::pubsub::{DeliveryHandler, PubSub, PubSubError, TopicConsumer};
use domain::Topic;

/// 代理错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("消息代理尚未分配传输实现")]
    NotAssigned,

    #[error("消息代理不允许重复分配")]
    Reassignment,

    #[error("{operation} 操作超时")]
    Timeout { operation: &'static str },

    #[error("读取任务异常退出: {message}")]
    ReadLoopAborted { message: String },

    #[error(transparent)]
    Transport(#[from] PubSubError),
}

/// 代理的时限与传输参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTimeouts {
    pub subscribe: Duration,
    pub unsubscribe: Duration,
    pub publish: Duration,
    pub min_storage: Duration,
    pub reading: Duration,
}

impl Default for BrokerTimeouts {
    fn default() -> Self {
        Self {
            subscribe: Duration::from_secs(30),
            unsubscribe: Duration::from_secs(30),
            publish: Duration::from_secs(5),
            min_storage: Duration::from_secs(72 * 60 * 60),
            reading: Duration::from_millis(500),
        }
    }
}

/// 一个正在运行的订阅
///
/// 必须交回 [`Broker::unsubscribe`] 才会释放传输端资源。直接丢弃时读取循环
/// 会在父令牌取消时退出，消费端随任务一起被回收。
pub struct Subscription {
    topic: Topic,
    cancel: CancellationToken,
    reader: JoinHandle<Box<dyn TopicConsumer>>,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// 读取循环是否已经结束（例如下游连接关闭）
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("finished", &self.reader.is_finished())
            .finish()
    }
}

pub struct Broker {
    transport: OnceLock<Arc<dyn PubSub>>,
    timeouts: BrokerTimeouts,
}

impl Broker {
    pub fn new(timeouts: BrokerTimeouts) -> Self {
        Self {
            transport: OnceLock::new(),
            timeouts,
        }
    }

    /// 创建并立即分配传输实现
    pub fn with_transport(
        transport: Arc<dyn PubSub>,
        timeouts: BrokerTimeouts,
    ) -> Result<Self, BrokerError> {
        let broker = Self::new(timeouts);
        broker.assign(transport)?;
        Ok(broker)
    }

    pub fn timeouts(&self) -> &BrokerTimeouts {
        &self.timeouts
    }

    /// 分配传输实现，只能成功一次
    pub fn assign(&self, transport: Arc<dyn PubSub>) -> Result<(), BrokerError> {
        let mut assigned = false;
        self.transport.get_or_init(|| {
            transport.set_min_storage_duration(self.timeouts.min_storage);
            transport.set_reading_timeout(self.timeouts.reading);
            assigned = true;
            transport
        });

        if !assigned {
            tracing::error!("消息代理已分配，拒绝重复分配");
            return Err(BrokerError::Reassignment);
        }

        tracing::info!(
            min_storage_secs = self.timeouts.min_storage.as_secs(),
            reading_timeout_ms = self.timeouts.reading.as_millis() as u64,
            "消息代理已分配传输实现"
        );
        Ok(())
    }

    pub fn is_assigned(&self) -> bool {
        self.transport.get().is_some()
    }

    fn transport(&self) -> Result<&Arc<dyn PubSub>, BrokerError> {
        self.transport.get().ok_or(BrokerError::NotAssigned)
    }

    pub fn redelivers_after_reconnect(&self) -> Result<bool, BrokerError> {
        Ok(self.transport()?.redelivers_after_reconnect())
    }

    /// 订阅主题并在后台启动读取循环
    ///
    /// 读取循环使用 `parent` 的子令牌：父令牌（会话或进程）取消时循环随之退出。
    pub async fn subscribe(
        &self,
        parent: &CancellationToken,
        topic: Topic,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription, BrokerError> {
        let transport = self.transport()?;

        let mut consumer = match timeout(self.timeouts.subscribe, transport.subscribe(&topic)).await
        {
            Ok(Ok(consumer)) => consumer,
            Ok(Err(err)) => {
                tracing::error!(topic = %topic, error = %err, "订阅失败");
                return Err(err.into());
            }
            Err(_) => {
                tracing::error!(topic = %topic, "订阅超时");
                return Err(BrokerError::Timeout {
                    operation: "subscribe",
                });
            }
        };

        let cancel = parent.child_token();
        let token = cancel.clone();
        let span = tracing::info_span!("read_messages", topic = %topic);
        let reader = tokio::spawn(
            async move {
                consumer.read_messages(token, handler).await;
                tracing::debug!("读取循环结束");
                consumer
            }
            .instrument(span),
        );

        tracing::debug!(topic = %topic, "订阅已建立");
        Ok(Subscription {
            topic,
            cancel,
            reader,
        })
    }

    /// 停止读取循环并释放订阅
    pub async fn unsubscribe(&self, subscription: Subscription) -> Result<(), BrokerError> {
        let Subscription {
            topic,
            cancel,
            reader,
        } = subscription;

        cancel.cancel();
        let consumer = reader.await.map_err(|err| {
            tracing::error!(topic = %topic, error = %err, "读取任务异常退出");
            BrokerError::ReadLoopAborted {
                message: err.to_string(),
            }
        })?;

        match timeout(self.timeouts.unsubscribe, consumer.unsubscribe()).await {
            Ok(Ok(())) => {
                tracing::debug!(topic = %topic, "订阅已释放");
                Ok(())
            }
            Ok(Err(err)) => {
                tracing::error!(topic = %topic, error = %err, "释放订阅失败");
                Err(err.into())
            }
            Err(_) => {
                tracing::error!(topic = %topic, "释放订阅超时");
                Err(BrokerError::Timeout {
                    operation: "unsubscribe",
                })
            }
        }
    }

    pub async fn publish(&self, topic: &Topic, payload: &[u8]) -> Result<(), BrokerError> {
        let transport = self.transport()?;
        match timeout(self.timeouts.publish, transport.publish(topic, payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                tracing::error!(topic = %topic, error = %err, "发布失败");
                Err(err.into())
            }
            Err(_) => {
                tracing::error!(topic = %topic, "发布超时");
                Err(BrokerError::Timeout {
                    operation: "publish",
                })
            }
        }
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        let transport = self.transport()?;
        transport.close().await.map_err(|err| {
            tracing::error!(error = %err, "关闭传输失败");
            BrokerError::from(err)
        })?;
        tracing::info!("消息代理已关闭");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{DeliveryError, PubSubResult};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Journal(Mutex<Vec<&'static str>>);

    impl Journal {
        fn push(&self, event: &'static str) {
            self.0.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().clone()
        }
    }

    /// 每次读取把一条消息交给回调，回调返回后才检查取消
    struct ScriptedConsumer {
        topic: Topic,
        journal: Arc<Journal>,
        feed: mpsc::Receiver<Vec<u8>>,
    }

    #[async_trait]
    impl TopicConsumer for ScriptedConsumer {
        fn topic(&self) -> &Topic {
            &self.topic
        }

        async fn read_messages(
            &mut self,
            cancel: CancellationToken,
            handler: Arc<dyn DeliveryHandler>,
        ) {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    payload = self.feed.recv() => match payload {
                        Some(payload) => {
                            if handler.deliver(&payload).await == Err(DeliveryError::Closed) {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            self.journal.push("loop_exit");
        }

        async fn unsubscribe(self: Box<Self>) -> PubSubResult<()> {
            self.journal.push("released");
            Ok(())
        }
    }

    struct ScriptedPubSub {
        journal: Arc<Journal>,
        feeds: Mutex<Vec<mpsc::Receiver<Vec<u8>>>>,
        settings: crate::pubsub::TransportSettings,
        publish_delay: Duration,
    }

    impl ScriptedPubSub {
        fn new(journal: Arc<Journal>) -> (Arc<Self>, mpsc::Sender<Vec<u8>>) {
            let (tx, rx) = mpsc::channel(8);
            let pubsub = Arc::new(Self {
                journal,
                feeds: Mutex::new(vec![rx]),
                settings: Default::default(),
                publish_delay: Duration::ZERO,
            });
            (pubsub, tx)
        }
    }

    #[async_trait]
    impl PubSub for ScriptedPubSub {
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
            let feed = self
                .feeds
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| PubSubError::subscribe(topic, "no feed"))?;
            Ok(Box::new(ScriptedConsumer {
                topic: topic.clone(),
                journal: self.journal.clone(),
                feed,
            }))
        }

        async fn publish(&self, _topic: &Topic, _payload: &[u8]) -> PubSubResult<()> {
            tokio::time::sleep(self.publish_delay).await;
            Ok(())
        }

        async fn close(&self) -> PubSubResult<()> {
            Ok(())
        }
    }

    struct SlowHandler {
        journal: Arc<Journal>,
        delay: Duration,
    }

    #[async_trait]
    impl DeliveryHandler for SlowHandler {
        async fn deliver(&self, _payload: &[u8]) -> Result<(), DeliveryError> {
            self.journal.push("deliver_start");
            tokio::time::sleep(self.delay).await;
            self.journal.push("deliver_done");
            Ok(())
        }
    }

    fn topic() -> Topic {
        Topic::for_user(domain::UserId::new(7))
    }

    #[tokio::test]
    async fn assign_only_once() {
        let journal = Arc::new(Journal::default());
        let (first, _) = ScriptedPubSub::new(journal.clone());
        let (second, _) = ScriptedPubSub::new(journal);

        let timeouts = BrokerTimeouts {
            reading: Duration::from_millis(250),
            ..BrokerTimeouts::default()
        };
        let broker = Broker::new(timeouts);
        assert!(!broker.is_assigned());
        broker.assign(first.clone()).unwrap();
        assert_eq!(broker.assign(second.clone()), Err(BrokerError::Reassignment));

        assert_eq!(first.settings.reading_timeout(), Duration::from_millis(250));
        assert_eq!(first.settings.min_storage(), Duration::from_secs(259_200));
        // 第二个传输从未被配置
        assert_eq!(second.settings.reading_timeout(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn operations_require_assignment() {
        let broker = Broker::new(BrokerTimeouts::default());
        let handler = Arc::new(SlowHandler {
            journal: Arc::new(Journal::default()),
            delay: Duration::ZERO,
        });

        assert_eq!(
            broker.publish(&topic(), b"x").await,
            Err(BrokerError::NotAssigned)
        );
        assert!(matches!(
            broker
                .subscribe(&CancellationToken::new(), topic(), handler)
                .await,
            Err(BrokerError::NotAssigned)
        ));
        assert_eq!(broker.close().await, Err(BrokerError::NotAssigned));
    }

    #[tokio::test]
    async fn unsubscribe_waits_for_in_flight_delivery() {
        let journal = Arc::new(Journal::default());
        let (pubsub, feed) = ScriptedPubSub::new(journal.clone());
        let broker = Broker::with_transport(pubsub, BrokerTimeouts::default()).unwrap();

        let handler = Arc::new(SlowHandler {
            journal: journal.clone(),
            delay: Duration::from_millis(150),
        });
        let root = CancellationToken::new();
        let subscription = broker.subscribe(&root, topic(), handler).await.unwrap();

        feed.send(b"payload".to_vec()).await.unwrap();
        while !journal.events().contains(&"deliver_start") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        broker.unsubscribe(subscription).await.unwrap();

        assert_eq!(
            journal.events(),
            vec!["deliver_start", "deliver_done", "loop_exit", "released"]
        );
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancellation_stops_read_loop() {
        let journal = Arc::new(Journal::default());
        let (pubsub, _feed) = ScriptedPubSub::new(journal.clone());
        let broker = Broker::with_transport(pubsub, BrokerTimeouts::default()).unwrap();

        let session = CancellationToken::new();
        let handler = Arc::new(SlowHandler {
            journal: journal.clone(),
            delay: Duration::ZERO,
        });
        let subscription = broker.subscribe(&session, topic(), handler).await.unwrap();

        session.cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !subscription.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        broker.unsubscribe(subscription).await.unwrap();
        assert_eq!(journal.events(), vec!["loop_exit", "released"]);
    }

    #[tokio::test]
    async fn publish_times_out() {
        let journal = Arc::new(Journal::default());
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let pubsub = Arc::new(ScriptedPubSub {
            journal,
            feeds: Mutex::new(vec![rx]),
            settings: Default::default(),
            publish_delay: Duration::from_millis(200),
        });
        let timeouts = BrokerTimeouts {
            publish: Duration::from_millis(20),
            ..BrokerTimeouts::default()
        };
        let broker = Broker::with_transport(pubsub, timeouts).unwrap();

        assert_eq!(
            broker.publish(&topic(), b"x").await,
            Err(BrokerError::Timeout {
                operation: "publish"
            })
        );
    }

    #[tokio::test]
    async fn subscribe_failure_is_propagated() {
        let journal = Arc::new(Journal::default());
        let (pubsub, _feed) = ScriptedPubSub::new(journal.clone());
        let broker = Broker::with_transport(pubsub, BrokerTimeouts::default()).unwrap();
        let handler = Arc::new(SlowHandler {
            journal,
            delay: Duration::ZERO,
        });
        let root = CancellationToken::new();

        let first = broker
            .subscribe(&root, topic(), handler.clone())
            .await
            .unwrap();
        let second = broker.subscribe(&root, topic(), handler).await;
        assert!(matches!(
            second,
            Err(BrokerError::Transport(PubSubError::Subscribe { .. }))
        ));
        broker.unsubscribe(first).await.unwrap();
    }
}
