/// Agent WebSocket 连接处理
///
/// 注册 -> 心跳通知 -> 请求 / 响应

use axum::extract::ws::{Message as AxumWsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use common::ws_rpc::{HeartbeatRequest, MessageType, RegisterRequest, RegisterResponse, RpcMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::agent_manager::AgentConnection;
use crate::app_state::AppState;

/// 等待注册消息的时间
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket 升级处理器
pub async fn handle_agent_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_connection(socket, state))
}

async fn handle_agent_connection(socket: WebSocket, state: AppState) {
    info!("新的 Agent WebSocket 连接");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RpcMessage>();

    let (request_id, register) = match wait_for_registration(&mut ws_receiver, &state).await {
        Ok(registration) => registration,
        Err(e) => {
            error!("Agent 注册失败: {}", e);
            let _ = ws_sender.close().await;
            return;
        }
    };

    let response = RegisterResponse {
        success: true,
        message: "注册成功".to_string(),
    };
    let response_msg = match serde_json::to_value(&response) {
        Ok(payload) => RpcMessage::response(request_id, payload),
        Err(e) => {
            error!("序列化注册响应失败: {}", e);
            return;
        }
    };
    if let Err(e) = send_message(&mut ws_sender, response_msg).await {
        error!("发送注册响应失败: {}", e);
        return;
    }

    let manager = state.agent_manager();
    let connection = manager
        .register(
            register.node_id.clone(),
            register.hostname.clone(),
            register.ip_address.clone(),
            tx,
        )
        .await;
    info!(
        "Agent 已连接并注册: node_id={}, hostname={}, ip={}",
        register.node_id, register.hostname, register.ip_address
    );

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = send_message(&mut ws_sender, msg).await {
                error!("发送消息失败: {}", e);
                break;
            }
        }
        debug!("消息发送任务结束");
    });

    let receiver_connection = connection.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if let Err(e) = handle_incoming_message(msg, &receiver_connection).await {
                        warn!("处理消息失败: {}", e);
                    }
                }
                Err(e) => {
                    error!("接收消息错误: {}", e);
                    break;
                }
            }
        }
        debug!("消息接收任务结束");
    });

    tokio::select! {
        _ = &mut send_task => {
            debug!("发送任务已结束");
            recv_task.abort();
        }
        _ = &mut recv_task => {
            debug!("接收任务已结束");
            send_task.abort();
        }
    }

    manager.unregister(&connection).await;
    info!("Agent 连接已关闭: {}", register.node_id);
}

/// 第一条消息必须是 register 请求
async fn wait_for_registration(
    receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
) -> Result<(String, RegisterRequest), String> {
    let msg = match tokio::time::timeout(REGISTER_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(msg))) => msg,
        Ok(Some(Err(e))) => return Err(format!("接收注册消息错误: {}", e)),
        Ok(None) => return Err("连接已关闭".to_string()),
        Err(_) => return Err("等待注册消息超时".to_string()),
    };

    let rpc_msg = parse_websocket_message(msg).map_err(|e| format!("解析注册消息失败: {}", e))?;
    if rpc_msg.message_type != MessageType::Request {
        return Err("期望收到注册请求".to_string());
    }
    if rpc_msg.method.as_deref() != Some("register") {
        return Err(format!("期望 register 方法，收到: {:?}", rpc_msg.method));
    }

    let payload = rpc_msg.payload.ok_or("缺少注册信息")?;
    let register: RegisterRequest =
        serde_json::from_value(payload).map_err(|e| format!("解析注册信息失败: {}", e))?;

    // 未登记的主机也允许连接，只是不会被选为执行主机
    if let Err(e) = state.repo.get_host(&register.node_id).await {
        warn!("注册的 Agent 不对应已知主机: node_id={}, {}", register.node_id, e);
    }

    Ok((rpc_msg.id, register))
}

async fn handle_incoming_message(ws_msg: AxumWsMessage, connection: &Arc<AgentConnection>) -> Result<(), String> {
    let rpc_msg = parse_websocket_message(ws_msg)?;

    debug!(
        "收到消息: type={:?}, method={:?}, id={}",
        rpc_msg.message_type, rpc_msg.method, rpc_msg.id
    );

    match rpc_msg.message_type {
        MessageType::Notification => handle_notification(rpc_msg, connection).await,
        MessageType::Request => reject_agent_request(rpc_msg, connection),
        MessageType::Response => {
            connection.handle_response(rpc_msg).await;
            Ok(())
        }
    }
}

async fn handle_notification(msg: RpcMessage, connection: &AgentConnection) -> Result<(), String> {
    let method = msg.method.as_deref().ok_or("通知消息缺少方法名")?;

    match method {
        "heartbeat" => {
            connection.update_heartbeat().await;
            match msg
                .payload
                .map(serde_json::from_value::<HeartbeatRequest>)
                .transpose()
            {
                Ok(Some(beat)) => debug!("收到心跳: node_id={}, timestamp={}", beat.node_id, beat.timestamp),
                Ok(None) => debug!("收到心跳: node_id={}", connection.node_id),
                Err(e) => warn!("心跳内容无法解析: node_id={}, {}", connection.node_id, e),
            }
            Ok(())
        }
        _ => {
            warn!("未知的通知方法: {}", method);
            Ok(())
        }
    }
}

/// 编排器不接受 Agent 发起的请求
fn reject_agent_request(msg: RpcMessage, connection: &AgentConnection) -> Result<(), String> {
    let method = msg.method.clone().unwrap_or_default();
    warn!("未知的请求方法: node={}, method={}", connection.node_id, method);

    let error_response = RpcMessage::error_response(
        msg.id,
        "METHOD_NOT_FOUND",
        format!("方法不存在: {}", method),
        None,
    );
    connection
        .sender
        .send(error_response)
        .map_err(|_| "发送错误响应失败".to_string())
}

fn parse_websocket_message(ws_msg: AxumWsMessage) -> Result<RpcMessage, String> {
    match ws_msg {
        AxumWsMessage::Text(text) => RpcMessage::from_json(&text).map_err(|e| format!("解析 JSON 失败: {}", e)),
        AxumWsMessage::Binary(data) => {
            let text = String::from_utf8(data).map_err(|e| format!("二进制转字符串失败: {}", e))?;
            RpcMessage::from_json(&text).map_err(|e| format!("解析 JSON 失败: {}", e))
        }
        AxumWsMessage::Close(_) => Err("连接关闭".to_string()),
        _ => Err("不支持的消息类型".to_string()),
    }
}

async fn send_message(sender: &mut SplitSink<WebSocket, AxumWsMessage>, msg: RpcMessage) -> Result<(), String> {
    let json = msg.to_json().map_err(|e| format!("序列化消息失败: {}", e))?;

    sender
        .send(AxumWsMessage::Text(json))
        .await
        .map_err(|e| format!("发送 WebSocket 消息失败: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_text_and_binary() {
        let msg = RpcMessage::notification("heartbeat", json!({"node_id": "host-1", "timestamp": 1}));
        let text = msg.to_json().unwrap();

        let parsed = parse_websocket_message(AxumWsMessage::Text(text.clone())).unwrap();
        assert_eq!(parsed.method.as_deref(), Some("heartbeat"));

        let parsed = parse_websocket_message(AxumWsMessage::Binary(text.into_bytes())).unwrap();
        assert_eq!(parsed.message_type, MessageType::Notification);

        assert!(parse_websocket_message(AxumWsMessage::Close(None)).is_err());
    }

    #[tokio::test]
    async fn test_agent_request_is_rejected() {
        let manager = crate::ws::AgentConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = manager
            .register("host-1".to_string(), "kvm-01".to_string(), "10.0.0.1".to_string(), tx)
            .await;

        let request = RpcMessage::request("get_storage_pool_info", json!({"pool_id": "pool-1"}));
        let request_id = request.id.clone();
        let ws_msg = AxumWsMessage::Text(request.to_json().unwrap());
        handle_incoming_message(ws_msg, &connection).await.unwrap();

        let response = rx.recv().await.unwrap();
        assert_eq!(response.id, request_id);
        assert_eq!(response.error.unwrap().code, "METHOD_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_heartbeat_notification() {
        let manager = crate::ws::AgentConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = manager
            .register("host-1".to_string(), "kvm-01".to_string(), "10.0.0.1".to_string(), tx)
            .await;

        let beat = RpcMessage::notification("heartbeat", json!({"node_id": "host-1", "timestamp": 42}));
        handle_incoming_message(AxumWsMessage::Text(beat.to_json().unwrap()), &connection)
            .await
            .unwrap();
        assert_eq!(connection.heartbeat_elapsed().await, 0);
    }
}
