//! WebSocket 会话
//!
//! 每条连接一个会话任务：认证、登记、订阅个人主题，然后循环读取上行帧并
//! 交给消息服务处理。连接断开、读超时或服务关闭时依次释放订阅和注册表条目。

use std::sync::Arc;

use application::{
    ConnectionHandle, Credentials, DeliveryError, DeliveryHandler, Subscription,
};
use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::{ChatMessage, Topic, UserId};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

/// 把订阅读到的消息写回这条连接
struct SocketDelivery {
    user_id: UserId,
    handle: ConnectionHandle,
    /// 会话令牌，取消后不再等待写队列腾出空间
    cancel: CancellationToken,
}

#[async_trait]
impl DeliveryHandler for SocketDelivery {
    async fn deliver(&self, payload: &[u8]) -> Result<(), DeliveryError> {
        let message =
            ChatMessage::decode(payload).map_err(|err| DeliveryError::failed(err.to_string()))?;

        // 发布方和读取方之间可能隔了很久，写出前再检查一次
        if !message.is_actual() {
            tracing::debug!(user_id = %self.user_id, chat_id = %message.chat_id, "跳过过期的输入提示");
            return Ok(());
        }

        let text =
            serde_json::to_string(&message).map_err(|err| DeliveryError::failed(err.to_string()))?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DeliveryError::Closed),
            sent = self.handle.send_text(text) => sent,
        }
    }
}

/// 会话在 Receiving 状态结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Cancelled,
    ConnectionClosed,
    ClientClosed,
    ReadDeadline,
    ReadError,
}

pub struct ChatSession {
    state: AppState,
    credentials: Credentials,
}

impl ChatSession {
    pub fn new(state: AppState, credentials: Credentials) -> Self {
        Self { state, credentials }
    }

    pub async fn run(self, socket: WebSocket) {
        let (sink, stream) = socket.split();
        let cancel = self.state.shutdown.child_token();
        let (handle, outbound) = ConnectionHandle::new(self.state.session.outbound_capacity);
        let writer = tokio::spawn(write_frames(sink, outbound, handle.clone()));

        match self.state.identity.identify(&self.credentials).await {
            Ok(user_id) => self.serve(user_id, stream, &handle, &cancel).await,
            Err(err) => {
                tracing::warn!(connection_id = %handle.id(), error = %err, "WebSocket 认证失败");
                self.release(None, None, &handle, &cancel).await;
            }
        }

        cancel.cancel();
        if let Err(err) = writer.await {
            tracing::error!(connection_id = %handle.id(), error = %err, "WebSocket 写任务异常退出");
        }
    }

    async fn serve(
        &self,
        user_id: UserId,
        stream: SplitStream<WebSocket>,
        handle: &ConnectionHandle,
        cancel: &CancellationToken,
    ) {
        let seq = self.state.registry.store(user_id, handle).await;

        let delivery = Arc::new(SocketDelivery {
            user_id,
            handle: handle.clone(),
            cancel: cancel.clone(),
        });
        let subscription = match self
            .state
            .broker
            .subscribe(cancel, Topic::for_user(user_id), delivery)
            .await
        {
            Ok(subscription) => subscription,
            Err(err) => {
                tracing::error!(user_id = %user_id, connection_seq = seq, error = %err, "订阅个人主题失败");
                self.release(Some(user_id), None, handle, cancel).await;
                return;
            }
        };

        tracing::info!(user_id = %user_id, connection_seq = seq, "WebSocket 会话已建立");

        let reason = self.receive(user_id, stream, handle, cancel).await;
        tracing::info!(user_id = %user_id, connection_seq = seq, reason = ?reason, "WebSocket 会话结束");

        self.release(Some(user_id), Some(subscription), handle, cancel).await;
    }

    async fn receive(
        &self,
        user_id: UserId,
        mut stream: SplitStream<WebSocket>,
        handle: &ConnectionHandle,
        cancel: &CancellationToken,
    ) -> CloseReason {
        let read_deadline = self.state.session.read_deadline();

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return CloseReason::Cancelled,
                _ = handle.closed() => return CloseReason::ConnectionClosed,
                read = timeout(read_deadline, stream.next()) => read,
            };

            let message = match read {
                Err(_) => return CloseReason::ReadDeadline,
                Ok(None) => return CloseReason::ClientClosed,
                Ok(Some(Err(err))) => {
                    tracing::debug!(user_id = %user_id, error = %err, "读取 WebSocket 帧失败");
                    return CloseReason::ReadError;
                }
                Ok(Some(Ok(message))) => message,
            };

            match message {
                WsMessage::Text(text) => self.dispatch(user_id, text.as_str().as_bytes()).await,
                WsMessage::Binary(data) => self.dispatch(user_id, &data).await,
                WsMessage::Close(_) => return CloseReason::ClientClosed,
                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            }
        }
    }

    /// 处理一帧；单条消息的错误只记录日志，会话继续
    async fn dispatch(&self, user_id: UserId, frame: &[u8]) {
        match self.state.message_service.dispatch(frame, user_id).await {
            Ok(Some(message)) => {
                tracing::debug!(
                    user_id = %user_id,
                    chat_id = %message.chat_id,
                    message_id = %message.id,
                    "消息已扇出"
                );
            }
            Ok(None) => {}
            Err(err) if err.is_client_error() => {
                tracing::warn!(user_id = %user_id, error = %err, "丢弃无效消息");
            }
            Err(err) => {
                tracing::error!(user_id = %user_id, error = %err, "消息处理失败");
            }
        }
    }

    /// 先等读取循环退出并释放订阅，再从注册表移除；两步都会执行
    ///
    /// 会话令牌最先取消，读取端即使卡在已满的写队列上也能退出。
    async fn release(
        &self,
        user_id: Option<UserId>,
        subscription: Option<Subscription>,
        handle: &ConnectionHandle,
        cancel: &CancellationToken,
    ) {
        cancel.cancel();

        if let Some(subscription) = subscription {
            if let Err(err) = self.state.broker.unsubscribe(subscription).await {
                tracing::error!(user_id = ?user_id, error = %err, "取消订阅失败");
            }
        }

        if let Err(err) = self.state.registry.close_and_delete(user_id, handle).await {
            tracing::error!(user_id = ?user_id, error = %err, "移除连接失败");
        }
    }
}

/// 写任务：独占 socket 的写入端，连接关闭时发送 Close 帧后退出
async fn write_frames(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<String>,
    handle: ConnectionHandle,
) {
    loop {
        tokio::select! {
            _ = handle.closed() => break,
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if let Err(err) = sink.send(WsMessage::Text(text.into())).await {
                        tracing::debug!(connection_id = %handle.id(), error = %err, "写入 WebSocket 失败");
                        handle.close();
                        return;
                    }
                }
                None => break,
            },
        }
    }

    if let Err(err) = sink.send(WsMessage::Close(None)).await {
        tracing::debug!(connection_id = %handle.id(), error = %err, "发送关闭帧失败");
    }
}
