//! Web API 层。
//!
//! 提供 Axum 路由：WebSocket 会话入口，以及在线状态、聊天历史等少量 HTTP 接口。

mod auth;
mod error;
mod routes;
mod session;
mod state;

pub use auth::{credentials_from_request, Claims, JwtService, ACCESS_TOKEN_COOKIE};
pub use config::JwtConfig;
pub use error::{ApiError, ErrorBody};
pub use routes::router;
pub use session::ChatSession;
pub use state::AppState;
