//! 应用层实现。
//!
//! 这里提供消息投递子系统的核心：统一的发布/订阅契约、消息代理外观、
//! 按用户组织的连接注册表，以及把上行帧变成持久化、可扇出消息的用例服务。
//! 具体传输（Kafka、Redis Streams）和持久化适配器在基础设施层实现。

pub mod broker;
pub mod clock;
pub mod connections;
pub mod error;
pub mod identity;
pub mod liveness;
pub mod local_pubsub;
pub mod pubsub;
pub mod repository;
pub mod retry;
pub mod services;

pub use broker::{Broker, BrokerError, BrokerTimeouts, Subscription};
pub use clock::{Clock, SystemClock};
pub use connections::{ConnectionHandle, ConnectionId, ConnectionRegistry, Presence, RegistryError};
pub use error::ApplicationError;
pub use identity::{Credentials, IdentityError, IdentityProvider};
pub use liveness::PayloadVerdict;
pub use local_pubsub::LocalPubSub;
pub use pubsub::{
    DeliveryError, DeliveryHandler, PubSub, PubSubError, PubSubResult, TopicConsumer,
    TransportSettings,
};
pub use repository::{ChatRepository, MessageRepository, UserRepository};
pub use retry::{retry_async, Backoff, RetryConfig};
pub use services::{FanOutError, MessageService, MessageServiceDependencies, RegisteredMessage};
