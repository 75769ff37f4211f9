//! 读取端的消息过滤
//!
//! 所有传输在把负载交给投递回调之前都先经过这里：保活条目和过期的
//! 输入提示被丢弃（并从传输中确认/删除），无法解码的负载记录日志后跳过。

use chrono::{DateTime, Utc};

use domain::{ChatMessage, DomainError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadVerdict {
    /// 正常消息，交给回调
    Deliver,
    /// 订阅时写入的空保活条目
    KeepAlive,
    /// 已过期的输入提示
    Stale,
    /// 无法解码
    Malformed(DomainError),
}

impl PayloadVerdict {
    /// 该条目是否应从传输中清理（确认或删除）而不投递
    pub fn should_discard(&self) -> bool {
        matches!(self, Self::KeepAlive | Self::Stale)
    }
}

pub fn inspect(payload: &[u8]) -> PayloadVerdict {
    inspect_at(payload, Utc::now())
}

pub fn inspect_at(payload: &[u8], now: DateTime<Utc>) -> PayloadVerdict {
    if payload.is_empty() {
        return PayloadVerdict::KeepAlive;
    }
    match ChatMessage::decode(payload) {
        Ok(message) if message.is_actual_at(now) => PayloadVerdict::Deliver,
        Ok(_) => PayloadVerdict::Stale,
        Err(err) => PayloadVerdict::Malformed(err),
    }
}
