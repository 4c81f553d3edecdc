/// 数据对象生命周期状态机
///
/// 只有在转换表中出现的 (状态, 事件) 组合才会改变状态，
/// 其余组合一律返回 `Error::IllegalTransition`，对象保持原状。

use async_trait::async_trait;
use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use super::repository::MotionRepository;

/// 对象状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ObjectState {
    Allocated,
    Creating,
    Ready,
    Copying,
    Migrating,
    Resizing,
    Uploaded,
    Failed,
    Destroyed,
}

/// 生命周期事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ObjectEvent {
    CreateOnlyRequested,
    CopyingRequested,
    MigrationRequested,
    MigrationCopyRequested,
    MigrationCopySucceeded,
    OperationSuccessed,
    OperationFailed,
    DestroyRequested,
    ResizeRequested,
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl fmt::Display for ObjectEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 计算下一个状态，不存在的边返回 None
pub fn next_state(state: ObjectState, event: ObjectEvent) -> Option<ObjectState> {
    use ObjectEvent::*;
    use ObjectState::*;

    let next = match (state, event) {
        (Allocated, CreateOnlyRequested) => Creating,
        (Allocated, MigrationCopyRequested) => Creating,
        (Allocated, DestroyRequested) => Destroyed,

        (Creating, OperationSuccessed) => Ready,
        (Creating, MigrationCopySucceeded) => Ready,
        (Creating, OperationFailed) => Failed,
        (Creating, DestroyRequested) => Destroyed,

        (Ready, CopyingRequested) => Copying,
        (Ready, MigrationRequested) => Migrating,
        (Ready, ResizeRequested) => Resizing,
        (Ready, DestroyRequested) => Destroyed,

        (Copying | Migrating | Resizing, OperationSuccessed) => Ready,
        (Copying | Migrating | Resizing, OperationFailed) => Ready,

        (Uploaded, CopyingRequested) => Copying,
        (Uploaded, DestroyRequested) => Destroyed,

        (Failed, DestroyRequested) => Destroyed,

        _ => return None,
    };
    Some(next)
}

/// 受状态机管理的对象
#[async_trait]
pub trait StateTracked: Send + Sync {
    fn object_id(&self) -> &str;

    fn state(&self) -> ObjectState;

    fn set_state(&mut self, state: ObjectState);

    /// 持久化当前对象
    async fn save(&self, repo: &dyn MotionRepository) -> Result<()>;
}

/// 对对象施加事件并持久化
///
/// 持久化失败时状态回滚到事件之前
pub async fn process_event<T: StateTracked + ?Sized>(
    repo: &dyn MotionRepository,
    object: &mut T,
    event: ObjectEvent,
) -> Result<ObjectState> {
    let current = object.state();
    let next = next_state(current, event).ok_or_else(|| Error::IllegalTransition {
        object: object.object_id().to_string(),
        state: current.to_string(),
        event: event.to_string(),
    })?;

    object.set_state(next);
    if let Err(e) = object.save(repo).await {
        object.set_state(current);
        return Err(e);
    }

    debug!("对象 {} 状态变更: {} --{}--> {}", object.object_id(), current, event, next);
    Ok(next)
}
