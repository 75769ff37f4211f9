//! Redis Streams 写入端
//!
//! 所有会话共用一个自动重连的连接。每次写入都带 `MINID` 裁剪，
//! 把早于保留时长的条目从流中移除。

use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{debug, info};

use crate::redis::{RedisError, RedisResult};

/// 负载所在的字段名
pub const MESSAGE_FIELD: &str = "message";

#[derive(Clone)]
pub struct RedisStreamPublisher {
    connection: ConnectionManager,
}

impl RedisStreamPublisher {
    pub async fn new(client: &Client) -> RedisResult<Self> {
        let connection = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| RedisError::ConnectionError {
                message: format!("创建 Redis 连接管理器失败: {}", e),
            })?;

        info!("Redis 流写入端创建成功");
        Ok(Self { connection })
    }

    /// 追加一个条目并返回其ID
    pub async fn append(&self, stream: &str, payload: &[u8], retention: Duration) -> RedisResult<String> {
        let mut conn = self.connection.clone();
        let min_id = min_id(retention);

        let id: String = redis::cmd("XADD")
            .arg(stream)
            .arg("MINID")
            .arg(&min_id)
            .arg("*")
            .arg(MESSAGE_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisError::PublishError {
                message: format!("写入流 {} 失败: {}", stream, e),
            })?;

        debug!(stream, entry_id = %id, min_id = %min_id, "条目已写入");
        Ok(id)
    }
}

/// 保留下限对应的流ID：`<now - retention 的毫秒时间戳>-0`
pub fn min_id(retention: Duration) -> String {
    let retention_ms = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
    let floor = Utc::now().timestamp_millis().saturating_sub(retention_ms).max(0);
    format!("{}-0", floor)
}
