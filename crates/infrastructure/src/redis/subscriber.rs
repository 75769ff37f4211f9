//! Redis Streams 读取端
//!
//! 每个订阅独占一条连接执行阻塞的 `XREAD`，游标从订阅时写入的保活条目开始，
//! 该条目在读取开始时删除。
//! 流没有按连接保存的读取位置，断线期间写入的条目不会在重连后补发。

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::redis::publisher::MESSAGE_FIELD;
use application::liveness::{self, PayloadVerdict};
use application::{DeliveryError, DeliveryHandler, PubSubResult, TopicConsumer, TransportSettings};
use domain::Topic;

pub struct RedisStreamConsumer {
    connection: MultiplexedConnection,
    topic: Topic,
    cursor: String,
    batch_size: usize,
    settings: Arc<TransportSettings>,
}

impl RedisStreamConsumer {
    pub fn new(
        connection: MultiplexedConnection,
        topic: Topic,
        cursor: String,
        batch_size: usize,
        settings: Arc<TransportSettings>,
    ) -> Self {
        Self {
            connection,
            topic,
            cursor,
            batch_size: batch_size.max(1),
            settings,
        }
    }

    pub fn cursor(&self) -> &str {
        &self.cursor
    }

    async fn delete(&mut self, entry_id: &str) {
        let deleted: Result<i64, redis::RedisError> = redis::cmd("XDEL")
            .arg(self.topic.as_str())
            .arg(entry_id)
            .query_async(&mut self.connection)
            .await;
        if let Err(err) = deleted {
            error!(stream = %self.topic, entry_id, error = %err, "删除条目失败");
        }
    }
}

#[async_trait]
impl TopicConsumer for RedisStreamConsumer {
    fn topic(&self) -> &Topic {
        &self.topic
    }

    async fn read_messages(&mut self, cancel: CancellationToken, handler: Arc<dyn DeliveryHandler>) {
        // XREAD 只返回游标之后的条目，起点处自己的保活条目要单独删除
        let keep_alive = self.cursor.clone();
        self.delete(&keep_alive).await;

        loop {
            let block_ms = self.settings.reading_timeout().as_millis() as u64;
            let mut read = redis::cmd("XREAD");
            read.arg("COUNT")
                .arg(self.batch_size)
                .arg("BLOCK")
                .arg(block_ms)
                .arg("STREAMS")
                .arg(self.topic.as_str())
                .arg(&self.cursor);

            let reply = tokio::select! {
                _ = cancel.cancelled() => return,
                reply = read.query_async::<Option<StreamReadReply>>(&mut self.connection) => reply,
            };

            let reply = match reply {
                Ok(Some(reply)) => reply,
                // BLOCK 超时没有新条目
                Ok(None) => continue,
                Err(err) => {
                    error!(stream = %self.topic, error = %err, "读取流失败，结束读取");
                    return;
                }
            };

            for key in reply.keys {
                for entry in key.ids {
                    self.cursor = entry.id.clone();

                    let payload = match entry.map.get(MESSAGE_FIELD) {
                        Some(redis::Value::BulkString(bytes)) => bytes.as_slice(),
                        Some(other) => {
                            error!(stream = %self.topic, entry_id = %entry.id, value = ?other, "条目字段类型不是字符串");
                            continue;
                        }
                        None => {
                            error!(stream = %self.topic, entry_id = %entry.id, "条目缺少 message 字段");
                            continue;
                        }
                    };

                    match liveness::inspect(payload) {
                        PayloadVerdict::Deliver => match handler.deliver(payload).await {
                            Ok(()) => {}
                            Err(DeliveryError::Closed) => {
                                debug!(stream = %self.topic, "连接已关闭，结束读取");
                                return;
                            }
                            Err(err) => {
                                error!(stream = %self.topic, entry_id = %entry.id, error = %err, "投递失败");
                            }
                        },
                        PayloadVerdict::Malformed(err) => {
                            warn!(stream = %self.topic, entry_id = %entry.id, error = %err, "无法解码的条目");
                        }
                        verdict => {
                            debug!(stream = %self.topic, entry_id = %entry.id, ?verdict, "删除条目");
                            self.delete(&entry.id).await;
                        }
                    }
                }
            }
        }
    }

    async fn unsubscribe(self: Box<Self>) -> PubSubResult<()> {
        debug!(stream = %self.topic, cursor = %self.cursor, "Redis 订阅已释放");
        Ok(())
    }
}
