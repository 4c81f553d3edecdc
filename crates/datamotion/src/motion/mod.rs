/// 存储数据搬运编排
///
/// 决定卷、快照、模板如何在存储后端和主机之间移动，并驱动其完成

pub mod access;
pub mod cache;
pub mod context;
pub mod driver;
pub mod gateway;
pub mod host_selector;
pub mod lock;
pub mod object;
pub mod procedures;
pub mod qos;
pub mod repository;
pub mod service;
pub mod state_machine;
pub mod strategy;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{MotionContext, MotionSettings};
pub use service::{CopyCommandResult, DataMotionService};
pub use strategy::StrategyPriority;
