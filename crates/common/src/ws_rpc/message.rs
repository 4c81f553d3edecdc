/// 编排器与 Agent 之间的 RPC 消息
///
/// 编排器下发命令（request），Agent 回应答（response），心跳走 notification

use super::{RpcError, RpcErrorCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    /// 不需要应答
    Notification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    /// 应答沿用请求的 ID
    pub id: String,

    #[serde(rename = "type")]
    pub message_type: MessageType,

    /// request / notification 必填
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// 命令或应答的 JSON 负载
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorInfo>,
}

/// 错误应答内容，code 取 `RpcErrorCode::as_str`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RpcMessage {
    /// 下发给 Agent 的命令
    pub fn request(method: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: format!("req-{}", Uuid::new_v4()),
            message_type: MessageType::Request,
            method: Some(method.into()),
            payload: Some(payload),
            error: None,
        }
    }

    pub fn response(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            message_type: MessageType::Response,
            method: None,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error_response(
        id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: id.into(),
            message_type: MessageType::Response,
            method: None,
            payload: None,
            error: Some(RpcErrorInfo {
                code: code.into(),
                message: message.into(),
                details,
            }),
        }
    }

    pub fn notification(method: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: format!("notif-{}", Uuid::new_v4()),
            message_type: MessageType::Notification,
            method: Some(method.into()),
            payload: Some(payload),
            error: None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// 取出应答负载并按应答类型解析
    ///
    /// 错误应答还原成 RpcError，空负载视为命令失败
    pub fn into_payload<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        if let Some(error) = self.error {
            return Err(RpcError::new(RpcErrorCode::from_code(&error.code), error.message));
        }
        let payload = self
            .payload
            .ok_or_else(|| RpcError::command_failed(format!("响应缺少负载: {}", self.id)))?;
        Ok(serde_json::from_value(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_request() {
        let msg = RpcMessage::request("copy", json!({"wait_secs": 10800}));
        assert_eq!(msg.message_type, MessageType::Request);
        assert_eq!(msg.method.as_deref(), Some("copy"));
        assert!(msg.id.starts_with("req-"));
    }

    #[test]
    fn test_answer_keeps_request_id() {
        let msg = RpcMessage::response("req-123", json!({"success": true}));
        assert_eq!(msg.message_type, MessageType::Response);
        assert_eq!(msg.id, "req-123");
        assert!(msg.error.is_none());

        let msg = RpcMessage::error_response("req-124", "COMMAND_FAILED", "resign failed", None);
        assert_eq!(msg.id, "req-124");
        assert_eq!(msg.error.as_ref().unwrap().code, "COMMAND_FAILED");
    }

    #[test]
    fn test_into_payload() {
        #[derive(Debug, Deserialize)]
        struct Answer {
            success: bool,
        }

        let msg = RpcMessage::response("req-1", json!({"success": true}));
        let answer: Answer = msg.into_payload().unwrap();
        assert!(answer.success);

        let msg = RpcMessage::error_response("req-2", "TIMEOUT", "agent busy", None);
        let err = msg.into_payload::<Answer>().unwrap_err();
        assert_eq!(err.code, RpcErrorCode::Timeout);
        assert_eq!(err.message, "agent busy");

        let mut msg = RpcMessage::response("req-3", json!({}));
        msg.payload = None;
        let err = msg.into_payload::<Answer>().unwrap_err();
        assert_eq!(err.code, RpcErrorCode::CommandFailed);
    }

    #[test]
    fn test_wire_format() {
        let msg = RpcMessage::notification("heartbeat", json!({"node_id": "h1"}));
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"notification\""));
        assert!(!json.contains("error"));

        let parsed = RpcMessage::from_json(&json).unwrap();
        assert_eq!(msg.id, parsed.id);
        assert_eq!(parsed.message_type, MessageType::Notification);
    }
}

