//! Redis 错误类型定义

use thiserror::Error;

/// Redis 操作错误
#[derive(Error, Debug)]
pub enum RedisError {
    /// 连接错误
    #[error("Redis 连接错误: {message}")]
    ConnectionError { message: String },

    /// 写入流失败
    #[error("Redis 发布错误: {message}")]
    PublishError { message: String },

    /// 配置错误
    #[error("配置错误: {message}")]
    ConfigError { message: String },
}

/// Redis 结果类型
pub type RedisResult<T> = Result<T, RedisError>;
