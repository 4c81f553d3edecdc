/// 策略选择：判断编排器能否处理某个拷贝 / 迁移请求

use common::models::HypervisorType;
use common::Result;
use tracing::debug;

use super::context::MotionContext;
use super::object::{DataObject, DataStore, Host, Volume};

/// 处理优先级，数值越大越优先
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StrategyPriority {
    CantHandle,
    Supported,
    Highest,
}

/// 对象拷贝的处理优先级
pub async fn can_handle(ctx: &MotionContext, src: &DataObject, dest: &DataObject) -> Result<StrategyPriority> {
    let src_store = ctx.store_of(src).await?;
    let dest_store = ctx.store_of(dest).await?;

    let priority = match (src, dest) {
        (DataObject::Snapshot(_), _) | (_, DataObject::Snapshot(_)) => {
            either_supported(ctx, src, &src_store, dest, &dest_store).await
        }
        (DataObject::Template(_), DataObject::Volume(_)) => {
            src_store.id == dest_store.id
                && either_supported(ctx, src, &src_store, dest, &dest_store).await
        }
        (DataObject::Volume(_), DataObject::Volume(_)) => src_store.managed || dest_store.managed,
        (DataObject::Volume(_), DataObject::Template(_)) => src_store.managed,
        _ => false,
    };

    let priority = if priority {
        StrategyPriority::Highest
    } else {
        StrategyPriority::CantHandle
    };
    debug!("策略判定 {} -> {}: {:?}", src.id(), dest.id(), priority);
    Ok(priority)
}

async fn either_supported(
    ctx: &MotionContext,
    src: &DataObject,
    src_store: &DataStore,
    dest: &DataObject,
    dest_store: &DataStore,
) -> bool {
    ctx.supports(src, src_store).await || ctx.supports(dest, dest_store).await
}

/// 虚拟机连同磁盘迁移的处理优先级
///
/// 只处理 KVM，并且至少一块磁盘的源池或目标池是托管存储
pub async fn can_handle_vm_migration(
    ctx: &MotionContext,
    volume_map: &[(Volume, DataStore)],
    src_host: &Host,
    _dest_host: &Host,
) -> Result<StrategyPriority> {
    if src_host.hypervisor != HypervisorType::Kvm {
        return Ok(StrategyPriority::CantHandle);
    }
    for (volume, dest_store) in volume_map {
        let src_store = ctx.repo.get_store(&volume.store_id).await?;
        if src_store.managed || dest_store.managed {
            return Ok(StrategyPriority::Highest);
        }
    }
    Ok(StrategyPriority::CantHandle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::testing::{
        host, image_store, primary_store, snapshot, template, volume, FakeAgent, FakeDriver, Harness,
    };
    use common::models::capabilities;

    #[tokio::test]
    async fn test_snapshot_needs_capability() {
        let h = Harness::new(
            FakeDriver::new("fake").with_capability(capabilities::STORAGE_SYSTEM_SNAPSHOT, true),
            FakeAgent::new(),
        )
        .await;
        h.repo.insert_store(primary_store("pool-1", true)).await;
        h.repo.insert_store(image_store("image-1")).await;

        let src = DataObject::Snapshot(snapshot("snap-1", "vol-1", "pool-1"));
        let dest = DataObject::Snapshot(snapshot("snap-1-copy", "vol-1", "image-1"));
        assert_eq!(can_handle(&h.ctx, &src, &dest).await.unwrap(), StrategyPriority::Highest);

        let plain = Harness::new(FakeDriver::new("fake"), FakeAgent::new()).await;
        plain.repo.insert_store(primary_store("pool-1", true)).await;
        plain.repo.insert_store(image_store("image-1")).await;
        assert_eq!(
            can_handle(&plain.ctx, &src, &dest).await.unwrap(),
            StrategyPriority::CantHandle
        );
    }

    #[tokio::test]
    async fn test_template_requires_same_store() {
        let h = Harness::new(
            FakeDriver::new("fake").with_capability(capabilities::CAN_CREATE_VOLUME_FROM_VOLUME, true),
            FakeAgent::new(),
        )
        .await;
        h.repo.insert_store(primary_store("pool-1", true)).await;
        h.repo.insert_store(primary_store("pool-2", true)).await;

        let tmpl = DataObject::Template(template("tmpl-1", "pool-1"));
        let same = DataObject::Volume(volume("vol-1", "pool-1"));
        let other = DataObject::Volume(volume("vol-2", "pool-2"));
        assert_eq!(can_handle(&h.ctx, &tmpl, &same).await.unwrap(), StrategyPriority::Highest);
        assert_eq!(
            can_handle(&h.ctx, &tmpl, &other).await.unwrap(),
            StrategyPriority::CantHandle
        );
    }

    #[tokio::test]
    async fn test_volume_rules() {
        let h = Harness::new(FakeDriver::new("fake"), FakeAgent::new()).await;
        h.repo.insert_store(primary_store("managed", true)).await;
        h.repo.insert_store(primary_store("plain-1", false)).await;
        h.repo.insert_store(primary_store("plain-2", false)).await;
        h.repo.insert_store(image_store("image-1")).await;

        let managed = DataObject::Volume(volume("vol-1", "managed"));
        let plain = DataObject::Volume(volume("vol-2", "plain-1"));
        let plain_dest = DataObject::Volume(volume("vol-3", "plain-2"));
        let tmpl = DataObject::Template(template("tmpl-1", "image-1"));

        assert_eq!(can_handle(&h.ctx, &plain, &managed).await.unwrap(), StrategyPriority::Highest);
        assert_eq!(
            can_handle(&h.ctx, &plain, &plain_dest).await.unwrap(),
            StrategyPriority::CantHandle
        );
        assert_eq!(can_handle(&h.ctx, &managed, &tmpl).await.unwrap(), StrategyPriority::Highest);
        assert_eq!(can_handle(&h.ctx, &plain, &tmpl).await.unwrap(), StrategyPriority::CantHandle);
    }

    #[tokio::test]
    async fn test_vm_migration_rules() {
        let h = Harness::new(FakeDriver::new("fake"), FakeAgent::new()).await;
        h.repo.insert_store(primary_store("plain-1", false)).await;
        let managed = primary_store("managed", true);
        let plain = primary_store("plain-2", false);

        let kvm = host("h1", "c1", HypervisorType::Kvm);
        let xen = host("h2", "c2", HypervisorType::XenServer);
        let vol = volume("vol-1", "plain-1");

        let to_managed = vec![(vol.clone(), managed)];
        let to_plain = vec![(vol, plain)];
        assert_eq!(
            can_handle_vm_migration(&h.ctx, &to_managed, &kvm, &kvm).await.unwrap(),
            StrategyPriority::Highest
        );
        assert_eq!(
            can_handle_vm_migration(&h.ctx, &to_plain, &kvm, &kvm).await.unwrap(),
            StrategyPriority::CantHandle
        );
        assert_eq!(
            can_handle_vm_migration(&h.ctx, &to_managed, &xen, &kvm).await.unwrap(),
            StrategyPriority::CantHandle
        );
        assert!(StrategyPriority::Highest > StrategyPriority::Supported);
    }
}
