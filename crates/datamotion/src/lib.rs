/// 存储数据迁移编排器
///
/// 决定卷、快照、模板在存储后端与虚拟化主机之间如何搬运，并驱动搬运完成

pub mod app_state;
pub mod config;
pub mod db;
pub mod metrics;
pub mod motion;
pub mod ws;

pub use motion::{CopyCommandResult, DataMotionService, MotionContext, MotionSettings, StrategyPriority};
