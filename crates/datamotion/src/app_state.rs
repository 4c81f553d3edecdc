/// 应用全局状态

use std::sync::Arc;

use crate::motion::repository::MotionRepository;
use crate::motion::DataMotionService;
use crate::ws::AgentConnectionManager;

#[derive(Clone)]
pub struct AppState {
    /// Agent WebSocket 连接管理器
    pub agent_manager: AgentConnectionManager,
    pub motion: DataMotionService,
    pub repo: Arc<dyn MotionRepository>,
}

impl AppState {
    pub fn new(
        agent_manager: AgentConnectionManager,
        motion: DataMotionService,
        repo: Arc<dyn MotionRepository>,
    ) -> Self {
        Self {
            agent_manager,
            motion,
            repo,
        }
    }

    pub fn agent_manager(&self) -> AgentConnectionManager {
        self.agent_manager.clone()
    }
}
