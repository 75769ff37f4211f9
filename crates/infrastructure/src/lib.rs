//! 基础设施层实现。
//!
//! 提供 PostgreSQL 仓储以及 Kafka、Redis Streams 两种发布/订阅传输，
//! 实现应用层定义的接口。

pub mod kafka;
pub mod redis;
pub mod repository;

pub use kafka::{KafkaError, KafkaPubSub};
pub use self::redis::{RedisError, RedisStreamPubSub};
pub use repository::{
    create_pg_pool, PgChatRepository, PgMessageRepository, PgUserRepository, MIGRATOR,
};
