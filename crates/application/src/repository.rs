use async_trait::async_trait;

use domain::{ChatId, ChatMessage, MessageId, RepositoryResult, UserId};

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 在一个可串行化事务中写入消息，返回数据库分配的ID
    ///
    /// 事务冲突时返回 `RepositoryError::SerializationConflict`，由调用方决定是否重试。
    async fn create_message(&self, message: &ChatMessage) -> RepositoryResult<MessageId>;

    /// 聊天历史，按ID倒序，返回 `before` 之前（不含）的一页；`before` 为 0 表示从最新开始
    async fn list_messages(
        &self,
        chat_id: ChatId,
        before: MessageId,
        limit: u32,
    ) -> RepositoryResult<Vec<ChatMessage>>;
}

#[async_trait]
pub trait ChatRepository: Send + Sync {
    /// 聊天的全部成员（包括发送者本人）
    async fn chat_recipients(&self, chat_id: ChatId) -> RepositoryResult<Vec<UserId>>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// 用户的展示名，不存在时返回 `RepositoryError::NotFound`
    async fn display_name(&self, user_id: UserId) -> RepositoryResult<String>;
}
