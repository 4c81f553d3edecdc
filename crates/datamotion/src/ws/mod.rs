/// WebSocket 模块
///
/// 管理与主机 Agent 的 WebSocket 连接

pub mod agent_manager;
pub mod handler;

pub use agent_manager::AgentConnectionManager;
pub use handler::handle_agent_websocket;
