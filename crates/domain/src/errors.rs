//! 领域模型错误定义
//!
//! 定义了消息校验与持久化过程中可能出现的错误类型。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// 消息帧无法解码
    #[error("消息解码失败: {message}")]
    Decode { message: String },

    /// 客户端不允许自行指定消息ID
    #[error("收到非零的消息ID: {0}")]
    NonZeroMessageId(u64),

    /// 聊天ID为零
    #[error("收到为零的聊天ID")]
    ZeroChatId,

    /// 消息文本为空
    #[error("收到空消息")]
    EmptyText,

    /// 聊天成员数量不足
    #[error("聊天成员数量不足: 至少需要 {min} 个, 实际 {actual} 个")]
    NotEnoughRecipients { min: usize, actual: usize },

    /// 发送者不存在
    #[error("发送者不存在: {0}")]
    UnknownSender(u64),

    /// 用户不是聊天成员
    #[error("用户 {user_id} 不是聊天 {chat_id} 的成员")]
    NotChatMember { user_id: u64, chat_id: u64 },
}

impl DomainError {
    /// 创建解码错误
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::decode(err.to_string())
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;

/// 持久化层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("记录不存在")]
    NotFound,

    /// 可串行化事务冲突，调用方可以重新执行同一写操作
    #[error("可串行化事务冲突: {message}")]
    SerializationConflict { message: String },

    #[error("存储错误: {message}")]
    Storage { message: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn serialization_conflict(message: impl Into<String>) -> Self {
        Self::SerializationConflict {
            message: message.into(),
        }
    }

    pub fn is_serialization_conflict(&self) -> bool {
        matches!(self, Self::SerializationConflict { .. })
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;
