/// Agent 连接管理器
///
/// 管理所有主机 Agent 的 WebSocket 连接，并作为编排器下发命令的传输层

use async_trait::async_trait;
use common::ws_rpc::{RpcError, RpcErrorCode, RpcMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::motion::gateway::AgentTransport;

/// 等待响应的请求
type PendingRequest = oneshot::Sender<Result<RpcMessage, RpcError>>;

/// 单个 Agent 连接
pub struct AgentConnection {
    /// 主机 ID
    pub node_id: String,

    pub hostname: String,

    pub ip_address: String,

    /// 发送消息的通道
    pub sender: mpsc::UnboundedSender<RpcMessage>,

    last_heartbeat: RwLock<Instant>,

    /// request_id -> 等待者
    pending_requests: RwLock<HashMap<String, PendingRequest>>,
}

impl AgentConnection {
    /// 发送 RPC 请求并等待响应
    pub async fn call(
        &self,
        method: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<RpcMessage, RpcError> {
        let msg = RpcMessage::request(method, payload);
        let request_id = msg.id.clone();

        info!(
            "📤 [Server -> Agent] 发送请求: node={}, method={}, id={}",
            self.node_id, method, request_id
        );
        if let Some(payload) = &msg.payload {
            debug!("📤 请求内容: {}", payload);
        }

        let (tx, rx) = oneshot::channel();
        self.pending_requests
            .write()
            .await
            .insert(request_id.clone(), tx);

        if self.sender.send(msg).is_err() {
            self.pending_requests.write().await.remove(&request_id);
            return Err(RpcError::connection_closed());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.pending_requests.write().await.remove(&request_id);
                Err(RpcError::new(RpcErrorCode::InternalError, "响应通道被关闭"))
            }
            Err(_) => {
                self.pending_requests.write().await.remove(&request_id);
                Err(RpcError::timeout(format!(
                    "请求超时: method={}, id={}",
                    method, request_id
                )))
            }
        }
    }

    /// 处理收到的响应消息，唤醒对应的等待者
    pub async fn handle_response(&self, response: RpcMessage) {
        let request_id = response.id.clone();

        if let Some(error_info) = &response.error {
            warn!(
                "📥 [Agent -> Server] 收到错误响应: node={}, id={}, code={}, message={}",
                self.node_id, request_id, error_info.code, error_info.message
            );
        } else {
            info!("📥 [Agent -> Server] 收到成功响应: node={}, id={}", self.node_id, request_id);
        }

        let sender = self.pending_requests.write().await.remove(&request_id);
        let Some(sender) = sender else {
            debug!("收到未预期的响应: {}", request_id);
            return;
        };

        let result = match response.error {
            Some(error_info) => Err(RpcError::new(
                RpcErrorCode::from_code(&error_info.code),
                error_info.message,
            )),
            None => Ok(response),
        };
        if sender.send(result).is_err() {
            warn!("无法发送响应，等待者已关闭: {}", request_id);
        }
    }

    /// 连接断开时让所有等待中的请求立即失败
    async fn fail_pending(&self) {
        let pending: Vec<_> = self.pending_requests.write().await.drain().collect();
        for (_, sender) in pending {
            let _ = sender.send(Err(RpcError::connection_closed()));
        }
    }

    pub async fn update_heartbeat(&self) {
        *self.last_heartbeat.write().await = Instant::now();
    }

    /// 距离上次心跳的秒数
    pub async fn heartbeat_elapsed(&self) -> u64 {
        self.last_heartbeat.read().await.elapsed().as_secs()
    }
}

#[derive(Clone, Default)]
pub struct AgentConnectionManager {
    /// node_id -> AgentConnection
    connections: Arc<RwLock<HashMap<String, Arc<AgentConnection>>>>,
}

impl AgentConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册新的 Agent 连接，同一主机的旧连接被替换
    pub async fn register(
        &self,
        node_id: String,
        hostname: String,
        ip_address: String,
        sender: mpsc::UnboundedSender<RpcMessage>,
    ) -> Arc<AgentConnection> {
        let connection = Arc::new(AgentConnection {
            node_id: node_id.clone(),
            hostname,
            ip_address,
            sender,
            last_heartbeat: RwLock::new(Instant::now()),
            pending_requests: RwLock::new(HashMap::new()),
        });

        let replaced = self
            .connections
            .write()
            .await
            .insert(node_id.clone(), connection.clone());
        if let Some(old) = replaced {
            old.fail_pending().await;
        }

        info!("Agent 已注册: {}", node_id);
        connection
    }

    /// 注销连接，只移除仍是同一个连接的记录
    pub async fn unregister(&self, connection: &Arc<AgentConnection>) {
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(&connection.node_id) {
                Some(current) if Arc::ptr_eq(current, connection) => {
                    connections.remove(&connection.node_id)
                }
                _ => None,
            }
        };
        connection.fail_pending().await;
        if removed.is_some() {
            info!("Agent 已注销: {}", connection.node_id);
        }
    }

    pub async fn get(&self, node_id: &str) -> Option<Arc<AgentConnection>> {
        self.connections.read().await.get(node_id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// 清理心跳超时的连接，返回被清理的主机 ID
    pub async fn cleanup_timeout_connections(&self, timeout_secs: u64) -> Vec<String> {
        let mut expired = Vec::new();
        for (node_id, conn) in self.connections.read().await.iter() {
            let elapsed = conn.heartbeat_elapsed().await;
            if elapsed > timeout_secs {
                warn!("节点心跳超时: {} ({}秒)", node_id, elapsed);
                expired.push(conn.clone());
            }
        }

        let mut removed = Vec::new();
        for conn in expired {
            self.unregister(&conn).await;
            removed.push(conn.node_id.clone());
        }
        removed
    }

    /// 向指定主机发送 RPC 请求
    pub async fn call(
        &self,
        node_id: &str,
        method: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<RpcMessage, RpcError> {
        let connection = self
            .get(node_id)
            .await
            .ok_or_else(|| RpcError::node_not_found(node_id))?;

        connection.call(method, payload, timeout).await
    }

    /// 启动心跳超时检查任务
    pub fn start_heartbeat_monitor(self, timeout_secs: u64, check_interval_secs: u64) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(check_interval_secs));

            loop {
                interval.tick().await;

                let removed = self.cleanup_timeout_connections(timeout_secs).await;
                if !removed.is_empty() {
                    warn!("心跳监控: 清理了 {} 个超时节点", removed.len());
                }
            }
        });
    }
}

#[async_trait]
impl AgentTransport for AgentConnectionManager {
    async fn call(
        &self,
        node_id: &str,
        method: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<RpcMessage, RpcError> {
        AgentConnectionManager::call(self, node_id, method, payload, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// 模拟 Agent：读取发出的请求并原样回应
    fn spawn_echo_agent(connection: Arc<AgentConnection>, mut rx: mpsc::UnboundedReceiver<RpcMessage>) {
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let payload = request.payload.clone().unwrap_or_default();
                connection
                    .handle_response(RpcMessage::response(request.id, payload))
                    .await;
            }
        });
    }

    #[tokio::test]
    async fn test_call_routes_response_to_caller() {
        let manager = AgentConnectionManager::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = manager
            .register("host-1".to_string(), "kvm-01".to_string(), "10.0.0.1".to_string(), tx)
            .await;
        spawn_echo_agent(connection, rx);

        let response = manager
            .call("host-1", "copy", json!({"wait_secs": 10}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.payload.unwrap()["wait_secs"], 10);
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let manager = AgentConnectionManager::new();
        let err = manager
            .call("host-9", "copy", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::NodeNotFound);
    }

    #[tokio::test]
    async fn test_error_response_keeps_code() {
        let manager = AgentConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<RpcMessage>();
        let connection = manager
            .register("host-1".to_string(), "kvm-01".to_string(), "10.0.0.1".to_string(), tx)
            .await;

        let responder = connection.clone();
        tokio::spawn(async move {
            if let Some(request) = rx.recv().await {
                responder
                    .handle_response(RpcMessage::error_response(
                        request.id,
                        "VOLUME_NOT_FOUND",
                        "卷不存在",
                        None,
                    ))
                    .await;
            }
        });

        let err = manager
            .call("host-1", "copy", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::StorageError);
        assert_eq!(err.message, "卷不存在");
    }

    #[tokio::test]
    async fn test_unregister_fails_pending_requests() {
        let manager = AgentConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = manager
            .register("host-1".to_string(), "kvm-01".to_string(), "10.0.0.1".to_string(), tx)
            .await;

        let caller = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .call("host-1", "migrate", json!({}), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.unregister(&connection).await;

        let err = caller.await.unwrap().unwrap_err();
        assert_eq!(err.code, RpcErrorCode::ConnectionClosed);
        assert_eq!(manager.count().await, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_cleanup() {
        let manager = AgentConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager
            .register("host-1".to_string(), "kvm-01".to_string(), "10.0.0.1".to_string(), tx)
            .await;

        assert!(manager.cleanup_timeout_connections(60).await.is_empty());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(manager.cleanup_timeout_connections(0).await, vec!["host-1".to_string()]);
        assert!(manager.get("host-1").await.is_none());
    }
}
