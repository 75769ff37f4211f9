//! 聊天消息信封
//!
//! 同一个信封既是客户端上行帧的格式，也是经由主题扇出、最终写回
//! WebSocket 的下行帧格式。字段名沿用浏览器客户端的既有协议。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::ids::{ChatId, MessageId, UserId};

/// 输入提示消息的有效期（毫秒）
pub const TYPING_TTL_MS: i64 = 2_000;

/// 一个聊天至少需要的成员数
pub const MIN_CHAT_MEMBERS: usize = 2;

/// 消息类型，线上以整数表示；帧里必须带上 `Type`，0 和未知值都会被拒绝
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageKind {
    /// 普通消息，扇出前先持久化
    Ordinary,
    /// 输入提示，从不持久化，只在 TYPING_TTL_MS 内有效
    Typing,
}

impl TryFrom<u8> for MessageKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Ordinary),
            2 => Ok(Self::Typing),
            other => Err(format!("未知的消息类型: {other}")),
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Ordinary => 1,
            MessageKind::Typing => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "ChatID", default)]
    pub chat_id: ChatId,
    #[serde(rename = "ID", default)]
    pub id: MessageId,
    #[serde(rename = "Author", default)]
    pub author: String,
    #[serde(rename = "AuthorID", default)]
    pub author_id: UserId,
    #[serde(rename = "Text", default)]
    pub text: String,
    #[serde(rename = "Date", default)]
    pub date: DateTime<Utc>,
    #[serde(rename = "Type")]
    pub kind: MessageKind,
}

impl ChatMessage {
    pub fn new(chat_id: ChatId, text: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            chat_id,
            id: MessageId::default(),
            author: String::new(),
            author_id: UserId::default(),
            text: text.into(),
            date: DateTime::<Utc>::default(),
            kind,
        }
    }

    /// 从上行帧或主题负载解码
    pub fn decode(payload: &[u8]) -> DomainResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// 编码为主题负载 / 下行帧
    pub fn encode(&self) -> DomainResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn is_typing(&self) -> bool {
        self.kind == MessageKind::Typing
    }

    /// 普通消息始终有效；输入提示仅在发出后 TYPING_TTL_MS 内有效（恰好 2 秒即视为过期）
    pub fn is_actual_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_typing() || now.signed_duration_since(self.date) < Duration::milliseconds(TYPING_TTL_MS)
    }

    pub fn is_actual(&self) -> bool {
        self.is_actual_at(Utc::now())
    }

    /// 只有普通消息才会写入数据库
    pub fn is_registerable(&self) -> bool {
        self.kind == MessageKind::Ordinary
    }

    /// 由服务端补全作者信息和时间戳
    pub fn stamp(&mut self, author_id: UserId, author: impl Into<String>, date: DateTime<Utc>) {
        self.author_id = author_id;
        self.author = author.into();
        self.date = date;
    }

    /// 客户端提交的消息不能自带ID
    pub fn ensure_unregistered(&self) -> DomainResult<()> {
        if !self.id.is_zero() {
            return Err(DomainError::NonZeroMessageId(self.id.get()));
        }
        Ok(())
    }

    /// 注册前校验
    ///
    /// `recipients` 为聊天当前成员数。
    pub fn validate(&self, recipients: usize) -> DomainResult<()> {
        if self.text.is_empty() {
            return Err(DomainError::EmptyText);
        }
        if self.chat_id.is_zero() {
            return Err(DomainError::ZeroChatId);
        }
        if recipients < MIN_CHAT_MEMBERS {
            return Err(DomainError::NotEnoughRecipients {
                min: MIN_CHAT_MEMBERS,
                actual: recipients,
            });
        }
        Ok(())
    }
}

/// 聊天历史中的一页
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(rename = "LastID")]
    pub last_id: MessageId,
    #[serde(rename = "Messages")]
    pub messages: Vec<ChatMessage>,
}

impl History {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        let last_id = messages.last().map(|m| m.id).unwrap_or_default();
        Self { last_id, messages }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typing_at(date: DateTime<Utc>) -> ChatMessage {
        let mut message = ChatMessage::new(ChatId::new(1), "...", MessageKind::Typing);
        message.date = date;
        message
    }

    #[test]
    fn typing_staleness_boundary() {
        let now = Utc::now();
        assert!(typing_at(now - Duration::milliseconds(1900)).is_actual_at(now));
        assert!(!typing_at(now - Duration::milliseconds(2000)).is_actual_at(now));
        assert!(!typing_at(now - Duration::milliseconds(2100)).is_actual_at(now));
    }

    #[test]
    fn ordinary_messages_never_expire() {
        let mut message = ChatMessage::new(ChatId::new(1), "hello", MessageKind::Ordinary);
        message.date = Utc::now() - Duration::days(30);
        assert!(message.is_actual());
    }

    #[test]
    fn decodes_browser_client_frame() {
        let frame = br#"{"ChatID":5,"Text":"hi","Type":1}"#;
        let message = ChatMessage::decode(frame).unwrap();
        assert_eq!(message.chat_id, ChatId::new(5));
        assert_eq!(message.text, "hi");
        assert_eq!(message.kind, MessageKind::Ordinary);
        assert!(message.id.is_zero());
    }

    #[test]
    fn encode_uses_wire_field_names() {
        let mut message = ChatMessage::new(ChatId::new(3), "yo", MessageKind::Typing);
        message.stamp(UserId::new(9), "Ivan Petrov", Utc::now());
        let value: serde_json::Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();
        assert_eq!(value["ChatID"], 3);
        assert_eq!(value["AuthorID"], 9);
        assert_eq!(value["Author"], "Ivan Petrov");
        assert_eq!(value["Type"], 2);
        assert_eq!(ChatMessage::decode(&message.encode().unwrap()).unwrap(), message);
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(
            ChatMessage::decode(b"not json"),
            Err(DomainError::Decode { .. })
        ));
        assert!(ChatMessage::decode(br#"{"ChatID":1,"Text":"x","Type":7}"#).is_err());
        assert!(ChatMessage::decode(b"").is_err());
    }

    #[test]
    fn frames_without_a_type_are_rejected() {
        assert!(matches!(
            ChatMessage::decode(br#"{"ChatID":1,"Text":"x"}"#),
            Err(DomainError::Decode { .. })
        ));
        assert!(matches!(
            ChatMessage::decode(br#"{"ChatID":1,"Text":"x","Type":0}"#),
            Err(DomainError::Decode { .. })
        ));
    }

    #[test]
    fn validation_rules() {
        let message = ChatMessage::new(ChatId::new(1), "hello", MessageKind::Ordinary);
        assert!(message.validate(2).is_ok());
        assert_eq!(
            message.validate(1),
            Err(DomainError::NotEnoughRecipients { min: 2, actual: 1 })
        );

        let empty = ChatMessage::new(ChatId::new(1), "", MessageKind::Ordinary);
        assert_eq!(empty.validate(2), Err(DomainError::EmptyText));

        let no_chat = ChatMessage::new(ChatId::default(), "hello", MessageKind::Ordinary);
        assert_eq!(no_chat.validate(2), Err(DomainError::ZeroChatId));

        let mut with_id = message.clone();
        with_id.id = MessageId::new(12);
        assert_eq!(
            with_id.ensure_unregistered(),
            Err(DomainError::NonZeroMessageId(12))
        );
    }

    #[test]
    fn history_tracks_last_id() {
        let mut first = ChatMessage::new(ChatId::new(1), "a", MessageKind::Ordinary);
        first.id = MessageId::new(10);
        let mut second = first.clone();
        second.id = MessageId::new(9);
        let history = History::new(vec![first, second]);
        assert_eq!(history.last_id, MessageId::new(9));
        assert!(History::new(Vec::new()).last_id.is_zero());
    }
}
