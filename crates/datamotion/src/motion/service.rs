/// 数据搬运服务入口
///
/// 请求层通过 `DataMotionService` 判断能否处理、提交拷贝 / 迁移，
/// 结果通过 oneshot 通道返回，每个请求恰好返回一次

use common::ws_rpc::DataTo;
use common::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use super::context::MotionContext;
use super::object::{DataObject, DataStore, Host, VirtualMachine, Volume};
use super::procedures;
use super::strategy::{self, StrategyPriority};

/// 拷贝 / 迁移的最终结果
#[derive(Debug, Clone, Serialize)]
pub struct CopyCommandResult {
    pub success: bool,
    /// 失败原因
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// 成功时目标对象的描述
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<DataTo>,
}

impl CopyCommandResult {
    pub fn succeeded(data: Option<DataTo>) -> Self {
        Self {
            success: true,
            result: None,
            data,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            result: Some(reason.into()),
            data: None,
        }
    }
}

/// 结果发送端，只发送一次
///
/// 过程任务异常退出（panic）时在 Drop 中发送失败结果
struct Completion {
    sender: Option<oneshot::Sender<CopyCommandResult>>,
    procedure: &'static str,
}

impl Completion {
    fn new(procedure: &'static str) -> (Self, oneshot::Receiver<CopyCommandResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Some(tx),
                procedure,
            },
            rx,
        )
    }

    fn complete(mut self, result: CopyCommandResult) {
        crate::metrics::record_procedure(self.procedure, result.success);
        if let Some(sender) = self.sender.take() {
            if sender.send(result).is_err() {
                warn!("{} 结果无人接收", self.procedure);
            }
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            error!("{} 过程异常中止", self.procedure);
            crate::metrics::record_procedure(self.procedure, false);
            let _ = sender.send(CopyCommandResult::failed("过程异常中止"));
        }
    }
}

fn into_result(outcome: Result<Option<DataTo>>) -> CopyCommandResult {
    match outcome {
        Ok(data) => CopyCommandResult::succeeded(data),
        Err(e) => CopyCommandResult::failed(e.detail()),
    }
}

/// 数据搬运服务
#[derive(Clone)]
pub struct DataMotionService {
    ctx: Arc<MotionContext>,
}

impl DataMotionService {
    pub fn new(ctx: Arc<MotionContext>) -> Self {
        Self { ctx }
    }

    pub async fn can_handle(&self, src: &DataObject, dest: &DataObject) -> Result<StrategyPriority> {
        strategy::can_handle(&self.ctx, src, dest).await
    }

    pub async fn can_handle_vm_migration(
        &self,
        volume_map: &[(Volume, DataStore)],
        src_host: &Host,
        dest_host: &Host,
    ) -> Result<StrategyPriority> {
        strategy::can_handle_vm_migration(&self.ctx, volume_map, src_host, dest_host).await
    }

    /// 同步执行一次拷贝
    pub async fn copy(&self, src: DataObject, dest: DataObject) -> Result<Option<DataTo>> {
        procedures::copy(&self.ctx, src, dest).await
    }

    /// 在后台任务中执行拷贝
    ///
    /// `dest_host` 只用于日志，具体主机由各过程自行选择
    pub fn copy_async(
        &self,
        src: DataObject,
        dest: DataObject,
        dest_host: Option<Host>,
    ) -> oneshot::Receiver<CopyCommandResult> {
        let (completion, rx) = Completion::new("copy");
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            if let Some(host) = &dest_host {
                info!("拷贝 {} -> {} 指定目标主机 {}", src.id(), dest.id(), host.id);
            }
            let outcome = procedures::copy(&ctx, src, dest).await;
            completion.complete(into_result(outcome));
        });

        rx
    }

    /// 在后台任务中执行虚拟机连同磁盘的在线迁移
    pub fn copy_vm_async(
        &self,
        volume_map: Vec<(Volume, DataStore)>,
        vm: VirtualMachine,
        src_host: Host,
        dest_host: Host,
    ) -> oneshot::Receiver<CopyCommandResult> {
        let (completion, rx) = Completion::new("copy_vm");
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            let outcome = procedures::migrate_vm_with_volumes(&ctx, volume_map, vm, src_host, dest_host)
                .await
                .map(|_| None);
            completion.complete(into_result(outcome));
        });

        rx
    }

    pub async fn resize_volume(&self, volume_id: &str, new_size: u64) -> Result<Volume> {
        let outcome = procedures::resize_volume(&self.ctx, volume_id, new_size).await;
        crate::metrics::record_procedure("resize", outcome.is_ok());
        outcome
    }
}
