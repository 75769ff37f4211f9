//! 连接注册表
//!
//! 记录每个已认证用户当前打开的所有 WebSocket 连接（多设备），用于在线状态
//! 查询和直接下发。注册表本身只负责记账，连接的读写由会话负责。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::pubsub::DeliveryError;
use domain::UserId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("用户 {0} 没有在线连接")]
    NotConnected(UserId),

    #[error("连接 {connection_id} 未注册在用户 {user_id} 名下")]
    NotRegistered {
        user_id: UserId,
        connection_id: ConnectionId,
    },
}

/// 连接标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 一条 WebSocket 连接的写入端
///
/// 克隆得到的句柄指向同一条连接。关闭是幂等的，关闭后写入返回
/// [`DeliveryError::Closed`]。
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<String>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    /// 创建句柄以及写任务使用的接收端
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (outbound, receiver) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: ConnectionId::new(),
            outbound,
            closed: CancellationToken::new(),
        };
        (handle, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn send_text(&self, text: String) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(DeliveryError::Closed),
            sent = self.outbound.send(text) => sent.map_err(|_| DeliveryError::Closed),
        }
    }

    /// 关闭连接，返回本次调用是否真正执行了关闭
    pub fn close(&self) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.closed.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.outbound.is_closed()
    }

    /// 等待连接被关闭
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// 用户在线状态，线上以 0/1 表示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Offline = 0,
    Online = 1,
}

impl Presence {
    pub fn code(self) -> u8 {
        self as u8
    }
}

struct Registered {
    handle: ConnectionHandle,
    seq: u64,
}

#[derive(Default)]
struct RegistryState {
    users: HashMap<UserId, HashMap<ConnectionId, Registered>>,
    current_seq: u64,
}

#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一条连接，返回全局递增的序号（从 1 开始）
    pub async fn store(&self, user_id: UserId, handle: &ConnectionHandle) -> u64 {
        let mut state = self.state.lock().await;
        state.current_seq += 1;
        let seq = state.current_seq;
        state.users.entry(user_id).or_default().insert(
            handle.id(),
            Registered {
                handle: handle.clone(),
                seq,
            },
        );
        tracing::debug!(user_id = %user_id, connection_id = %handle.id(), seq, "连接已登记");
        seq
    }

    /// 按登记顺序返回用户的所有连接
    pub async fn get(&self, user_id: UserId) -> Result<Vec<ConnectionHandle>, RegistryError> {
        let state = self.state.lock().await;
        let connections = state
            .users
            .get(&user_id)
            .filter(|connections| !connections.is_empty())
            .ok_or(RegistryError::NotConnected(user_id))?;

        let mut registered: Vec<&Registered> = connections.values().collect();
        registered.sort_by_key(|r| r.seq);
        Ok(registered.into_iter().map(|r| r.handle.clone()).collect())
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        let state = self.state.lock().await;
        state
            .users
            .get(&user_id)
            .is_some_and(|connections| !connections.is_empty())
    }

    pub async fn user_status(&self, user_id: UserId) -> Presence {
        if self.is_online(user_id).await {
            Presence::Online
        } else {
            Presence::Offline
        }
    }

    /// 关闭连接并从注册表移除
    ///
    /// 未认证的连接（`user_id` 为 `None`）只关闭不移除。连接重复关闭不会报错。
    pub async fn close_and_delete(
        &self,
        user_id: Option<UserId>,
        handle: &ConnectionHandle,
    ) -> Result<(), RegistryError> {
        handle.close();

        let Some(user_id) = user_id else {
            return Ok(());
        };

        let mut state = self.state.lock().await;
        let not_registered = || RegistryError::NotRegistered {
            user_id,
            connection_id: handle.id(),
        };
        let connections = state.users.get_mut(&user_id).ok_or_else(not_registered)?;
        connections.remove(&handle.id()).ok_or_else(not_registered)?;
        if connections.is_empty() {
            state.users.remove(&user_id);
        }

        tracing::debug!(user_id = %user_id, connection_id = %handle.id(), "连接已移除");
        Ok(())
    }

    /// 直接向用户的所有连接下发文本，返回成功写入的连接数
    pub async fn send_to_user(&self, user_id: UserId, text: &str) -> Result<usize, RegistryError> {
        let handles = self.get(user_id).await?;
        let mut delivered = 0;
        for handle in handles {
            match handle.send_text(text.to_owned()).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::warn!(user_id = %user_id, connection_id = %handle.id(), error = %err, "下发失败");
                }
            }
        }
        Ok(delivered)
    }

    pub async fn connection_count(&self) -> usize {
        let state = self.state.lock().await;
        state.users.values().map(HashMap::len).sum()
    }
}
