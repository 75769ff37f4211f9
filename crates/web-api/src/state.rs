use std::sync::Arc;

use application::{Broker, ConnectionRegistry, IdentityProvider, MessageService};
use config::SessionConfig;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub registry: ConnectionRegistry,
    pub message_service: Arc<MessageService>,
    pub identity: Arc<dyn IdentityProvider>,
    /// 进程级取消令牌，每个会话从它派生自己的子令牌
    pub shutdown: CancellationToken,
    pub session: SessionConfig,
}

impl AppState {
    pub fn new(
        broker: Arc<Broker>,
        message_service: Arc<MessageService>,
        identity: Arc<dyn IdentityProvider>,
        shutdown: CancellationToken,
        session: SessionConfig,
    ) -> Self {
        Self {
            broker,
            registry: ConnectionRegistry::new(),
            message_service,
            identity,
            shutdown,
            session,
        }
    }
}
