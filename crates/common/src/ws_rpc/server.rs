/// WebSocket RPC 服务端辅助工具
///
/// Agent 侧按方法名分发命令；编排器的测试也用它模拟 Agent

use super::types::AgentCommand;
use super::{RpcError, RpcErrorCode, RpcMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

type HandlerFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, RpcError>> + Send>>;

/// 异步 RPC 方法处理器类型
pub type AsyncRpcHandler = Arc<dyn Fn(serde_json::Value) -> HandlerFuture + Send + Sync>;

/// RPC 方法路由器
#[derive(Clone, Default)]
pub struct RpcRouter {
    handlers: Arc<RwLock<HashMap<String, AsyncRpcHandler>>>,
}

impl RpcRouter {
    /// 创建新的路由器
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册原始 JSON 方法处理器
    pub async fn register<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, RpcError>> + Send + 'static,
    {
        let handler: AsyncRpcHandler = Arc::new(move |payload| Box::pin(handler(payload)));
        self.handlers.write().await.insert(method.into(), handler);
    }

    /// 注册强类型命令处理器
    ///
    /// 负载按命令类型反序列化，应答按应答类型序列化
    pub async fn register_command<C, F, Fut>(&self, handler: F)
    where
        C: AgentCommand + DeserializeOwned + 'static,
        C::Answer: Serialize,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C::Answer, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(C::METHOD, move |payload| {
            let handler = handler.clone();
            async move {
                let command: C = serde_json::from_value(payload)
                    .map_err(|e| RpcError::invalid_params(format!("命令参数错误: {}", e)))?;
                let answer = (*handler)(command).await?;
                Ok(serde_json::to_value(&answer)?)
            }
        })
        .await;
    }

    /// 处理 RPC 请求
    pub async fn handle_request(&self, msg: RpcMessage) -> RpcMessage {
        let method = match &msg.method {
            Some(m) => m.clone(),
            None => {
                return RpcMessage::error_response(
                    msg.id,
                    RpcErrorCode::InvalidRequest.as_str(),
                    "缺少方法名",
                    None,
                );
            }
        };

        let payload = msg.payload.clone().unwrap_or(serde_json::Value::Null);

        info!("📨 [收到RPC请求] method={}, id={}", method, msg.id);
        debug!("📨 请求内容: {}", payload);

        let handler = self.handlers.read().await.get(&method).cloned();
        let Some(handler) = handler else {
            return RpcMessage::error_response(
                msg.id,
                RpcErrorCode::MethodNotFound.as_str(),
                format!("方法不存在: {}", method),
                None,
            );
        };

        match handler(payload).await {
            Ok(result) => {
                info!("✅ [RPC处理成功] method={}, id={}", method, msg.id);
                RpcMessage::response(msg.id, result)
            }
            Err(err) => {
                warn!(
                    "❌ [RPC处理失败] method={}, id={}, code={}, error={}",
                    method,
                    msg.id,
                    err.code.as_str(),
                    err.message
                );
                RpcMessage::error_response(msg.id, err.code.as_str(), err.message, err.details)
            }
        }
    }

    /// 获取已注册的方法列表
    pub async fn list_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        methods.sort();
        methods
    }
}
