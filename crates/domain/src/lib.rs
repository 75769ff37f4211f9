//! 聊天消息投递系统核心领域模型
//!
//! 包含用户/聊天/消息标识、聊天消息信封、按用户划分的主题，
//! 以及输入提示（typing）消息的时效规则。

pub mod errors;
pub mod ids;
pub mod message;
pub mod topic;

// 重新导出常用类型
pub use errors::*;
pub use ids::*;
pub use message::*;
pub use topic::*;
