/// 存储数据迁移编排 - 公共库
/// 
/// 提供编排器与 Agent 共享的类型、错误处理、工具函数和 RPC 协议

pub mod errors;
pub mod models;
pub mod utils;
pub mod ws_rpc;

// 重新导出常用类型
pub use errors::{Error, Result};
pub use ws_rpc::{RpcMessage, RpcError, RpcErrorCode, MessageType};
