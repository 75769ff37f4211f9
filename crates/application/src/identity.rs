//! 身份识别协作方
//!
//! 会话在建立订阅之前通过它把连接上携带的凭据换成用户ID。

use async_trait::async_trait;
use thiserror::Error;

use domain::UserId;

/// 连接请求中携带的凭据
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: Option<String>,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            access_token: Some(token.into()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("缺少访问令牌")]
    MissingToken,

    #[error("访问令牌无效: {0}")]
    InvalidToken(String),
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn identify(&self, credentials: &Credentials) -> Result<UserId, IdentityError>;
}
