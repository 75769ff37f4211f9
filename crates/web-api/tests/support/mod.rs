use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use application::{
    Broker, BrokerTimeouts, ChatRepository, LocalPubSub, MessageRepository, MessageService,
    MessageServiceDependencies, RetryConfig, SystemClock, UserRepository,
};
use async_trait::async_trait;
use config::SessionConfig;
use domain::{ChatId, ChatMessage, MessageId, RepositoryError, RepositoryResult, UserId};
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use web_api::{router, AppState, JwtConfig, JwtService};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const ALICE: UserId = UserId::new(1);
pub const BOB: UserId = UserId::new(2);
pub const CAROL: UserId = UserId::new(3);
pub const CHAT: ChatId = ChatId::new(10);

#[derive(Default)]
pub struct MemoryMessages {
    stored: Mutex<Vec<ChatMessage>>,
}

impl MemoryMessages {
    pub fn stored(&self) -> Vec<ChatMessage> {
        self.stored.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageRepository for MemoryMessages {
    async fn create_message(&self, message: &ChatMessage) -> RepositoryResult<MessageId> {
        let mut stored = self.stored.lock().unwrap();
        let id = MessageId::new(stored.len() as u64 + 1);
        let mut message = message.clone();
        message.id = id;
        stored.push(message);
        Ok(id)
    }

    async fn list_messages(
        &self,
        chat_id: ChatId,
        before: MessageId,
        limit: u32,
    ) -> RepositoryResult<Vec<ChatMessage>> {
        let stored = self.stored.lock().unwrap();
        Ok(stored
            .iter()
            .rev()
            .filter(|m| m.chat_id == chat_id && (before.is_zero() || m.id < before))
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

struct Directory {
    chats: HashMap<ChatId, Vec<UserId>>,
    names: HashMap<UserId, String>,
}

#[async_trait]
impl ChatRepository for Directory {
    async fn chat_recipients(&self, chat_id: ChatId) -> RepositoryResult<Vec<UserId>> {
        Ok(self.chats.get(&chat_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl UserRepository for Directory {
    async fn display_name(&self, user_id: UserId) -> RepositoryResult<String> {
        self.names.get(&user_id).cloned().ok_or(RepositoryError::NotFound)
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub jwt: JwtService,
    pub state: AppState,
    pub messages: Arc<MemoryMessages>,
    pub shutdown: CancellationToken,
}

impl TestServer {
    /// 用进程内传输和内存仓储启动一个完整的服务
    pub async fn start() -> Self {
        let directory = Arc::new(Directory {
            chats: HashMap::from([(CHAT, vec![ALICE, BOB])]),
            names: HashMap::from([
                (ALICE, "Alice".to_string()),
                (BOB, "Bob".to_string()),
                (CAROL, "Carol".to_string()),
            ]),
        });
        let messages = Arc::new(MemoryMessages::default());

        let timeouts = BrokerTimeouts {
            reading: Duration::from_millis(50),
            ..BrokerTimeouts::default()
        };
        let broker = Arc::new(
            Broker::with_transport(Arc::new(LocalPubSub::new()), timeouts).expect("assign transport"),
        );

        let message_service = Arc::new(MessageService::new(MessageServiceDependencies {
            message_repository: messages.clone(),
            chat_repository: directory.clone(),
            user_repository: directory,
            broker: broker.clone(),
            clock: Arc::new(SystemClock),
            write_retry: RetryConfig::default(),
        }));

        let jwt = JwtService::new(JwtConfig {
            secret: "test-secret-key-with-at-least-32-characters".to_string(),
            expiration_hours: 1,
        });
        let shutdown = CancellationToken::new();
        let state = AppState::new(
            broker,
            message_service,
            Arc::new(jwt.clone()),
            shutdown.clone(),
            SessionConfig {
                read_deadline_secs: 60,
                outbound_capacity: 16,
            },
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.ok();
        });

        Self {
            addr,
            jwt,
            state,
            messages,
            shutdown,
        }
    }

    pub fn token(&self, user_id: UserId) -> String {
        self.jwt.generate_token(user_id).expect("token")
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// 建立一条已认证的连接，并等到它完成登记和订阅
    pub async fn connect(&self, user_id: UserId) -> Client {
        let before = self.connections_of(user_id).await;
        let url = format!("ws://{}/ws?token={}", self.addr, self.token(user_id));
        let (client, _) = connect_async(url).await.expect("websocket connect");

        wait_until(|| async move { self.connections_of(user_id).await > before }).await;
        // 登记之后紧接着订阅
        tokio::time::sleep(Duration::from_millis(100)).await;
        client
    }

    pub async fn connections_of(&self, user_id: UserId) -> usize {
        self.state
            .registry
            .get(user_id)
            .await
            .map(|handles| handles.len())
            .unwrap_or(0)
    }
}

pub async fn wait_until<F, Fut>(condition: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

/// 下一条文本帧，解析为 JSON
pub async fn next_json(client: &mut Client) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(3), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let TungsteniteMessage::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("json frame");
        }
    }
}

/// 断言一段时间内没有文本帧到达
pub async fn assert_silent(client: &mut Client, wait: Duration) {
    if let Ok(Some(Ok(TungsteniteMessage::Text(text)))) =
        tokio::time::timeout(wait, client.next()).await
    {
        panic!("unexpected frame: {}", text.as_str());
    }
}

/// 等待服务端关闭连接
pub async fn expect_closed(client: &mut Client) {
    loop {
        match tokio::time::timeout(Duration::from_secs(3), client.next())
            .await
            .expect("timed out waiting for close")
        {
            None | Some(Err(_)) | Some(Ok(TungsteniteMessage::Close(_))) => return,
            Some(Ok(_)) => continue,
        }
    }
}
