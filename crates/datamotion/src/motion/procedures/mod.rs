/// 迁移过程目录
///
/// 按 (源对象, 目标对象) 分派到具体过程，每个过程只有一个出口，
/// 在出口处发出所涉及对象的终止事件

mod live_migration;
mod resize;
mod snapshot;
mod template;
mod volume;

pub use live_migration::migrate_vm_with_volumes;
pub use resize::resize_volume;

use common::models::details;
use common::ws_rpc::DataTo;
use common::{Error, Result};
use tracing::{error, info};

use super::context::MotionContext;
use super::object::{DataObject, Snapshot, Volume};
use super::state_machine::{ObjectEvent, StateTracked};

/// 拷贝 / 迁移单个对象，成功时返回目标对象的描述
pub async fn copy(ctx: &MotionContext, src: DataObject, dest: DataObject) -> Result<Option<DataTo>> {
    let src_store = ctx.store_of(&src).await?;
    let dest_store = ctx.store_of(&dest).await?;
    info!(
        "📤 开始拷贝 {:?} {} ({}) -> {:?} {} ({})",
        src.kind(),
        src.id(),
        src_store.id,
        dest.kind(),
        dest.id(),
        dest_store.id
    );

    match (src, dest) {
        (DataObject::Snapshot(snapshot), dest) => {
            snapshot::handle_snapshot_copy(ctx, snapshot, dest, src_store, dest_store).await
        }
        (DataObject::Template(template), DataObject::Volume(volume)) => {
            template::create_volume_from_template(ctx, template, volume, src_store, dest_store).await
        }
        (DataObject::Volume(src), DataObject::Volume(dest)) => {
            volume::handle_volume_copy(ctx, src, dest, src_store, dest_store).await
        }
        (DataObject::Volume(volume), DataObject::Template(template)) if dest_store.is_image() => {
            template::create_template_from_volume(ctx, volume, template, src_store, dest_store).await
        }
        (src, dest) => Err(Error::Unsupported(format!(
            "不支持从 {:?} {} 拷贝到 {:?} {}",
            src.kind(),
            src.id(),
            dest.kind(),
            dest.id()
        ))),
    }
}

/// 快照是否由存储后端生成
pub(crate) fn uses_backend_snapshot(snapshot: &Snapshot) -> bool {
    snapshot
        .details
        .get(details::TAKE_SNAPSHOT)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// 按结果发出终止事件
pub(crate) async fn conclude<T: StateTracked + ?Sized>(ctx: &MotionContext, object: &mut T, success: bool) {
    let event = if success {
        ObjectEvent::OperationSuccessed
    } else {
        ObjectEvent::OperationFailed
    };
    ctx.fire_quietly(object, event).await;
}

/// 过程中新建的目标卷：成功转为 Ready，失败则作废
pub(crate) async fn conclude_created_volume(
    ctx: &MotionContext,
    volume: &mut Volume,
    outcome: Result<()>,
    delete_on_backend: bool,
) -> Result<Option<DataTo>> {
    match outcome {
        Ok(()) => {
            ctx.fire(volume, ObjectEvent::OperationSuccessed).await?;
            info!("✅ 卷 {} 已就绪", volume.id);
            Ok(Some(ctx.data_to(&DataObject::Volume(volume.clone())).await?))
        }
        Err(e) => {
            error!("卷 {} 处理失败: {}", volume.id, e);
            ctx.discard_volume(volume, delete_on_backend).await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::testing::{image_store, primary_store, template, volume, FakeAgent, FakeDriver, Harness};

    #[tokio::test]
    async fn test_unsupported_combination() {
        let h = Harness::new(FakeDriver::new("fake"), FakeAgent::new()).await;
        h.repo.insert_store(primary_store("pool-1", true)).await;
        h.repo.insert_store(image_store("image-1")).await;

        let src = DataObject::Template(template("tmpl-1", "image-1"));
        let dest = DataObject::Template(template("tmpl-2", "image-1"));
        assert!(matches!(copy(&h.ctx, src, dest).await, Err(Error::Unsupported(_))));

        // 卷到主存储上的模板不在目录中
        let src = DataObject::Volume(volume("vol-1", "pool-1"));
        let dest = DataObject::Template(template("tmpl-3", "pool-1"));
        assert!(matches!(copy(&h.ctx, src, dest).await, Err(Error::Unsupported(_))));
        assert!(h.agent.methods().is_empty());
    }

    #[test]
    fn test_backend_snapshot_marker() {
        let mut snap = crate::motion::testing::snapshot("snap-1", "vol-1", "pool-1");
        assert!(!uses_backend_snapshot(&snap));
        snap.details
            .insert(details::TAKE_SNAPSHOT.to_string(), "TRUE".to_string());
        assert!(uses_backend_snapshot(&snap));
    }
}
