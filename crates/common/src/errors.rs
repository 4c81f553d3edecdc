use thiserror::Error;

/// 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    #[error("数据库错误: {0}")]
    Database(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 没有任何迁移过程可以处理该组合
    #[error("不支持的操作: {0}")]
    Unsupported(String),

    /// 前置条件不满足（虚拟机状态、格式白名单、重签名能力等）
    #[error("前置条件不满足: {0}")]
    Precondition(String),

    #[error("没有可用主机: {0}")]
    NoHostAvailable(String),

    #[error("非法状态转换: 对象 {object} 处于 {state} 状态，不接受事件 {event}")]
    IllegalTransition {
        object: String,
        state: String,
        event: String,
    },

    #[error("获取存储池锁超时: {0}")]
    LockTimeout(String),

    /// 主机没有在线的 Agent 连接
    #[error("主机不可达: {0}")]
    NoEndpoint(String),

    #[error("Agent 命令超时: {0}")]
    AgentTimeout(String),

    /// Agent 返回失败应答
    #[error("Agent 执行失败: {0}")]
    Agent(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("内部错误: {0}")]
    Internal(String),

    #[error("其他错误: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// 便于日志和回调使用的详细描述
    ///
    /// Agent 失败只返回 Agent 给出的原始信息
    pub fn detail(&self) -> String {
        match self {
            Self::Agent(details) => details.clone(),
            other => other.to_string(),
        }
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;
