use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};

use application::{ChatRepository, MessageRepository, UserRepository};
use domain::{
    ChatId, ChatMessage, MessageId, MessageKind, RepositoryError, RepositoryResult, UserId,
};

/// PostgreSQL 可串行化事务冲突
const SERIALIZATION_FAILURE: &str = "40001";

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    let conflict = err
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == SERIALIZATION_FAILURE);
    if conflict {
        RepositoryError::serialization_conflict(err.to_string())
    } else {
        RepositoryError::storage(err.to_string())
    }
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

fn to_db_id(id: u64) -> RepositoryResult<i64> {
    i64::try_from(id).map_err(|_| invalid_data(format!("ID 超出范围: {id}")))
}

fn from_db_id(id: i64) -> RepositoryResult<u64> {
    u64::try_from(id).map_err(|_| invalid_data(format!("数据库返回了负数ID: {id}")))
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: i64,
    author: String,
    author_id: i64,
    text: String,
    date: DateTime<Utc>,
}

impl MessageRecord {
    fn into_message(self, chat_id: ChatId) -> RepositoryResult<ChatMessage> {
        Ok(ChatMessage {
            chat_id,
            id: MessageId::new(from_db_id(self.id)?),
            author: self.author,
            author_id: UserId::new(from_db_id(self.author_id)?),
            text: self.text,
            date: self.date,
            kind: MessageKind::Ordinary,
        })
    }
}

#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn create_message(&self, message: &ChatMessage) -> RepositoryResult<MessageId> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO chat_messages (chat_id, author_id, date, text)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(to_db_id(message.chat_id.get())?)
        .bind(to_db_id(message.author_id.get())?)
        .bind(message.date)
        .bind(&message.text)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        // 冲突可能在提交时才暴露
        tx.commit().await.map_err(map_sqlx_err)?;

        Ok(MessageId::new(from_db_id(id)?))
    }

    async fn list_messages(
        &self,
        chat_id: ChatId,
        before: MessageId,
        limit: u32,
    ) -> RepositoryResult<Vec<ChatMessage>> {
        let records = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT
                chat_messages.id,
                users.full_name AS author,
                chat_messages.author_id,
                chat_messages.text,
                chat_messages.date
            FROM chat_messages
            JOIN users ON chat_messages.author_id = users.id
            WHERE chat_messages.chat_id = $1
                AND (chat_messages.id < $2 OR $2 = 0)
            ORDER BY chat_messages.id DESC
            LIMIT $3
            "#,
        )
        .bind(to_db_id(chat_id.get())?)
        .bind(to_db_id(before.get())?)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records
            .into_iter()
            .map(|record| record.into_message(chat_id))
            .collect()
    }
}

#[derive(Clone)]
pub struct PgChatRepository {
    pool: PgPool,
}

impl PgChatRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatRepository for PgChatRepository {
    async fn chat_recipients(&self, chat_id: ChatId) -> RepositoryResult<Vec<UserId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"SELECT user_id FROM chat_contacts WHERE chat_id = $1 ORDER BY user_id"#,
        )
        .bind(to_db_id(chat_id.get())?)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        ids.into_iter()
            .map(|id| from_db_id(id).map(UserId::new))
            .collect()
    }
}

#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn display_name(&self, user_id: UserId) -> RepositoryResult<String> {
        sqlx::query_scalar::<_, String>(r#"SELECT full_name FROM users WHERE id = $1"#)
            .bind(to_db_id(user_id.get())?)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?
            .ok_or(RepositoryError::NotFound)
    }
}

/// 创建 PostgreSQL 连接池
pub async fn create_pg_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// 数据库表结构迁移
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");
