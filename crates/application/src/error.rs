use domain::{DomainError, RepositoryError};
use thiserror::Error;

use crate::broker::BrokerError;
use crate::connections::RegistryError;
use crate::identity::IdentityError;
use crate::services::FanOutError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("fan-out error: {0}")]
    FanOut(#[from] FanOutError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("authentication failed: {0}")]
    Authentication(#[from] IdentityError),
}

impl ApplicationError {
    /// 客户端提交的数据有误，而不是服务端故障
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Domain(_) | Self::Authentication(_))
    }
}
