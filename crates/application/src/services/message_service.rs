//! 消息处理服务
//!
//! 把客户端上行帧变成一条完整的消息：解码、补全作者和时间、校验、
//! 持久化普通消息，然后扇出到聊天每个成员的主题。

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;

use domain::{ChatId, ChatMessage, DomainError, History, MessageId, RepositoryError, Topic, UserId};

use crate::{
    broker::{Broker, BrokerError},
    clock::Clock,
    error::ApplicationError,
    repository::{ChatRepository, MessageRepository, UserRepository},
    retry::{retry_async, RetryConfig},
};

/// 历史消息每页条数
pub const HISTORY_PAGE_SIZE: u32 = 100;

/// 扇出过程中部分主题发布失败
///
/// 其余主题的发布不受影响，这里汇总所有失败的接收者。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutError {
    pub failures: Vec<(UserId, BrokerError)>,
}

impl FanOutError {
    pub fn failed_recipients(&self) -> Vec<UserId> {
        self.failures.iter().map(|(user_id, _)| *user_id).collect()
    }
}

impl fmt::Display for FanOutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} 个接收者投递失败", self.failures.len())?;
        for (user_id, err) in &self.failures {
            write!(f, "; {user_id}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for FanOutError {}

/// 已注册的消息及其接收者
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredMessage {
    pub message: ChatMessage,
    pub recipients: Vec<UserId>,
}

pub struct MessageServiceDependencies {
    pub message_repository: Arc<dyn MessageRepository>,
    pub chat_repository: Arc<dyn ChatRepository>,
    pub user_repository: Arc<dyn UserRepository>,
    pub broker: Arc<Broker>,
    pub clock: Arc<dyn Clock>,
    pub write_retry: RetryConfig,
}

pub struct MessageService {
    deps: MessageServiceDependencies,
}

impl MessageService {
    pub fn new(deps: MessageServiceDependencies) -> Self {
        Self { deps }
    }

    /// 解码上行帧并注册消息
    ///
    /// 普通消息写库后带上数据库分配的ID；输入提示不写库。
    pub async fn register(
        &self,
        frame: &[u8],
        sender: UserId,
    ) -> Result<RegisteredMessage, ApplicationError> {
        let mut message = ChatMessage::decode(frame)?;
        message.ensure_unregistered()?;
        if message.chat_id.is_zero() {
            return Err(DomainError::ZeroChatId.into());
        }

        let recipients = self.chat_members(message.chat_id, sender).await?;
        let author = self
            .deps
            .user_repository
            .display_name(sender)
            .await
            .map_err(|err| match err {
                RepositoryError::NotFound => ApplicationError::from(DomainError::UnknownSender(sender.get())),
                other => other.into(),
            })?;

        message.stamp(sender, author, self.deps.clock.now());
        message.validate(recipients.len())?;

        if message.is_registerable() {
            message.id = self.persist(&message).await?;
            tracing::debug!(
                chat_id = %message.chat_id,
                message_id = %message.id,
                author_id = %sender,
                "消息已写入"
            );
        }

        Ok(RegisteredMessage {
            message,
            recipients,
        })
    }

    async fn persist(&self, message: &ChatMessage) -> Result<MessageId, RepositoryError> {
        let repository = &self.deps.message_repository;
        retry_async(
            &self.deps.write_retry,
            RepositoryError::is_serialization_conflict,
            || repository.create_message(message),
        )
        .await
    }

    /// 把消息发布到每个接收者的主题
    ///
    /// 各主题并发发布；部分失败不影响其它接收者，失败汇总在 [`FanOutError`] 中。
    pub async fn share(
        &self,
        message: &ChatMessage,
        recipients: &[UserId],
    ) -> Result<(), ApplicationError> {
        let payload = message.encode()?;
        let broker = &self.deps.broker;

        let results = join_all(recipients.iter().map(|&recipient| {
            let payload = payload.as_slice();
            async move {
                let topic = Topic::for_user(recipient);
                (recipient, broker.publish(&topic, payload).await)
            }
        }))
        .await;

        let failures: Vec<(UserId, BrokerError)> = results
            .into_iter()
            .filter_map(|(recipient, result)| result.err().map(|err| (recipient, err)))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FanOutError { failures }.into())
        }
    }

    /// 会话收到一帧后的完整处理：注册、过滤、扇出
    ///
    /// 返回已扇出的消息；注册过程中已过期的输入提示被丢弃，返回 `None`。
    pub async fn dispatch(
        &self,
        frame: &[u8],
        sender: UserId,
    ) -> Result<Option<ChatMessage>, ApplicationError> {
        let RegisteredMessage {
            message,
            recipients,
        } = self.register(frame, sender).await?;

        if !message.is_actual_at(self.deps.clock.now()) {
            tracing::debug!(chat_id = %message.chat_id, author_id = %sender, "输入提示已过期，不再扇出");
            return Ok(None);
        }

        self.share(&message, &recipients).await?;
        Ok(Some(message))
    }

    /// 聊天历史的一页，仅聊天成员可见
    pub async fn history(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        before: MessageId,
    ) -> Result<History, ApplicationError> {
        if chat_id.is_zero() {
            return Err(DomainError::ZeroChatId.into());
        }
        self.chat_members(chat_id, user_id).await?;

        let messages = self
            .deps
            .message_repository
            .list_messages(chat_id, before, HISTORY_PAGE_SIZE)
            .await?;
        Ok(History::new(messages))
    }

    /// 聊天成员列表，同时确认 `user_id` 属于该聊天
    async fn chat_members(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<Vec<UserId>, ApplicationError> {
        let members = self.deps.chat_repository.chat_recipients(chat_id).await?;
        if !members.contains(&user_id) {
            return Err(DomainError::NotChatMember {
                user_id: user_id.get(),
                chat_id: chat_id.get(),
            }
            .into());
        }
        Ok(members)
    }
}
