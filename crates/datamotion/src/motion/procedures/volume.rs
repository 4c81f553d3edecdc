/// 卷迁移过程
///
/// 源卷由调用方置为 Migrating 后进入这里；上传到镜像存储的卷处于 Uploaded

use common::models::{details, HypervisorType, ImageFormat, VmState};
use common::ws_rpc::{CopyVolumeCommand, DataTo, MigrateVolumeAnswer, MigrateVolumeCommand};
use common::{Error, Result};
use std::collections::HashMap;
use tracing::{error, info, warn};

use super::{conclude, conclude_created_volume};
use crate::motion::context::{volume_details, wait, MotionContext, Releases};
use crate::motion::object::{DataObject, DataStore, Host, Volume};
use crate::motion::state_machine::{ObjectEvent, ObjectState};

pub(super) async fn handle_volume_copy(
    ctx: &MotionContext,
    src: Volume,
    dest: Volume,
    src_store: DataStore,
    dest_store: DataStore,
) -> Result<Option<DataTo>> {
    let migrating = (src.state == ObjectState::Migrating).then(|| src.clone());
    let result = match src.state {
        ObjectState::Migrating if src_store.managed && dest_store.is_image() => {
            managed_to_secondary(ctx, src, dest, src_store, dest_store).await
        }
        ObjectState::Migrating if src_store.managed && !dest_store.managed => {
            managed_to_non_managed(ctx, src, dest, src_store, dest_store).await
        }
        ObjectState::Migrating
            if !src_store.managed && dest_store.managed && src.hypervisor == HypervisorType::XenServer =>
        {
            xen_non_managed_to_managed(ctx, src, dest, src_store, dest_store).await
        }
        ObjectState::Migrating if dest_store.is_primary() => {
            kvm_offline_migration(ctx, src, dest, src_store, dest_store).await
        }
        ObjectState::Uploaded if src_store.is_image() && dest_store.is_primary() => {
            uploaded_volume_import(ctx, src, dest, src_store, dest_store).await
        }
        state => Err(Error::Unsupported(format!(
            "不支持把 {} 状态的卷 {} 从 {} 拷贝到 {}",
            state, src.id, src_store.id, dest_store.id
        ))),
    };

    if let (Err(_), Some(fallback)) = (&result, migrating) {
        settle_failed_source(ctx, fallback).await;
    }
    result
}

/// 失败后源卷若仍处于 Migrating，补发 OperationFailed
async fn settle_failed_source(ctx: &MotionContext, fallback: Volume) {
    let mut src = match ctx.repo.get_volume(&fallback.id).await {
        Ok(stored) => stored,
        Err(_) => fallback,
    };
    if src.state == ObjectState::Migrating {
        conclude(ctx, &mut src, false).await;
    }
}

fn require_kvm(volume: &Volume) -> Result<()> {
    if volume.hypervisor != HypervisorType::Kvm {
        return Err(Error::Unsupported(format!(
            "卷 {} 属于 {}，该迁移只支持 KVM",
            volume.id, volume.hypervisor
        )));
    }
    Ok(())
}

/// 集群级存储池取集群内主机，否则取可用区内任意 KVM 主机
async fn kvm_host(ctx: &MotionContext, store: &DataStore, zone_id: &str) -> Result<Host> {
    if store.cluster_id().is_some() {
        return ctx.hosts.host_in_cluster(store).await;
    }
    ctx.hosts
        .select_host(zone_id, store, HypervisorType::Kvm, false)
        .await?
        .ok_or_else(|| Error::NoHostAvailable(format!("存储池 {} 没有可用的 KVM 主机", store.id)))
}

// ============================================================================
// 托管卷 -> 二级存储
// ============================================================================

async fn managed_to_secondary(
    ctx: &MotionContext,
    mut src: Volume,
    mut dest: Volume,
    src_store: DataStore,
    dest_store: DataStore,
) -> Result<Option<DataTo>> {
    ctx.ensure_vm_state(&src, &[VmState::Stopped]).await?;
    require_kvm(&src)?;
    let host = kvm_host(ctx, &src_store, &src.zone_id).await?;

    ctx.fire(&mut dest, ObjectEvent::CreateOnlyRequested).await?;

    let mut releases = Releases::default();
    let outcome: Result<()> = async {
        releases.qos(ctx.raise_qos(&src, &src_store).await?);
        if src.attached_vm.is_none() {
            releases.grant(ctx.grant(&DataObject::Volume(src.clone()), &host, &src_store).await?);
        }

        let command = CopyVolumeCommand {
            volume_id: src.id.clone(),
            volume_path: src.path.clone(),
            src_store: src_store.to_store_to(),
            dest_store: dest_store.to_store_to(),
            to_secondary: true,
            wait_secs: ctx.settings.primary_storage_download_wait,
            src_details: volume_details(&src, &src_store),
        };
        let answer = ctx
            .gateway
            .send_checked(
                &host,
                &command,
                wait(ctx.settings.primary_storage_download_wait),
                "无法把卷拷贝到二级存储",
            )
            .await?;

        let path = answer
            .volume_path
            .ok_or_else(|| Error::Agent("拷贝卷应答缺少路径".to_string()))?;
        dest.path = Some(path);
        ctx.repo.save_volume(&dest).await
    }
    .await;

    releases.release_all().await;
    conclude(ctx, &mut src, outcome.is_ok()).await;
    conclude_created_volume(ctx, &mut dest, outcome, false).await
}

// ============================================================================
// KVM 离线迁移
// ============================================================================

/// 授权源卷、切换目标卷 QoS 并授权目标卷后下发 MigrateVolume
async fn migrate_volume_for_kvm(
    ctx: &MotionContext,
    releases: &mut Releases,
    src: &Volume,
    src_store: &DataStore,
    dest: &Volume,
    dest_store: &DataStore,
    host: &Host,
) -> Result<MigrateVolumeAnswer> {
    let src_object = DataObject::Volume(src.clone());
    let dest_object = DataObject::Volume(dest.clone());

    releases.grant(ctx.grant(&src_object, host, src_store).await?);
    releases.qos(ctx.raise_qos(dest, dest_store).await?);
    releases.grant(ctx.grant(&dest_object, host, dest_store).await?);

    let attached_vm_name = ctx.attached_vm(src).await?.map(|vm| vm.instance_name);
    let command = MigrateVolumeCommand {
        volume_id: src.id.clone(),
        volume_path: src.path.clone(),
        src: Some(src_object.to_data_to(src_store)),
        dest: Some(dest_object.to_data_to(dest_store)),
        dest_store: Some(dest_store.to_store_to()),
        attached_vm_name,
        src_details: volume_details(src, src_store),
        dest_details: volume_details(dest, dest_store),
        wait_secs: ctx.settings.kvm_offline_migration_wait,
    };
    ctx.gateway
        .send_checked(
            host,
            &command,
            wait(ctx.settings.kvm_offline_migration_wait),
            "卷迁移失败",
        )
        .await
}

fn apply_migrated(volume: &mut Volume, answer: MigrateVolumeAnswer) {
    if let Some(path) = answer.volume_path {
        volume.path = Some(path);
    }
    if let Some(chain_info) = answer.chain_info {
        volume.chain_info = Some(chain_info);
    }
    if volume.format.is_none() {
        volume.format = Some(ImageFormat::Qcow2);
    }
}

/// 托管卷迁移到非托管存储池，目标卷由 Agent 在迁移时生成
async fn managed_to_non_managed(
    ctx: &MotionContext,
    mut src: Volume,
    mut dest: Volume,
    src_store: DataStore,
    dest_store: DataStore,
) -> Result<Option<DataTo>> {
    ctx.ensure_vm_state(&src, &[VmState::Stopped, VmState::Migrating])
        .await?;
    require_kvm(&src)?;
    let host = kvm_host(ctx, &dest_store, &dest.zone_id).await?;

    dest.iscsi_name = None;
    ctx.fire(&mut dest, ObjectEvent::CreateOnlyRequested).await?;

    let mut releases = Releases::default();
    let outcome: Result<()> = async {
        let answer =
            migrate_volume_for_kvm(ctx, &mut releases, &src, &src_store, &dest, &dest_store, &host).await?;
        apply_migrated(&mut dest, answer);
        ctx.repo.save_volume(&dest).await
    }
    .await;

    releases.release_all().await;
    conclude(ctx, &mut src, outcome.is_ok()).await;
    conclude_created_volume(ctx, &mut dest, outcome, false).await
}

/// 托管 -> 托管、非托管 -> 非托管、非托管 -> 托管 (KVM)
async fn kvm_offline_migration(
    ctx: &MotionContext,
    mut src: Volume,
    mut dest: Volume,
    src_store: DataStore,
    dest_store: DataStore,
) -> Result<Option<DataTo>> {
    ctx.ensure_vm_state(&src, &[VmState::Stopped, VmState::Migrating])
        .await?;
    require_kvm(&src)?;
    let host = ctx
        .hosts
        .migration_host(&src_store, &dest_store, &src.zone_id)
        .await?;

    let mut releases = Releases::default();
    let outcome: Result<()> = async {
        ctx.provision_volume(&mut dest).await?;
        if dest.iscsi_name.is_some() {
            dest.path = dest.iscsi_name.clone();
            ctx.repo.save_volume(&dest).await?;
        }

        let answer =
            migrate_volume_for_kvm(ctx, &mut releases, &src, &src_store, &dest, &dest_store, &host).await?;
        apply_migrated(&mut dest, answer);
        ctx.repo.save_volume(&dest).await
    }
    .await;

    releases.release_all().await;
    conclude(ctx, &mut src, outcome.is_ok()).await;
    conclude_created_volume(ctx, &mut dest, outcome, true).await
}

// ============================================================================
// XenServer 在线迁移到托管存储
// ============================================================================

/// 迁移确认成功后源卷才接管目标 LUN
fn adopt_destination(src: &mut Volume, dest: &Volume, dest_store: &DataStore, answer: MigrateVolumeAnswer) {
    src.last_pool_id = Some(src.store_id.clone());
    src.store_id = dest_store.id.clone();
    src.folder = dest.folder.clone();
    src.iscsi_name = dest.iscsi_name.clone();
    apply_migrated(src, answer);
}

async fn xen_non_managed_to_managed(
    ctx: &MotionContext,
    mut src: Volume,
    mut dest: Volume,
    src_store: DataStore,
    dest_store: DataStore,
) -> Result<Option<DataTo>> {
    let vm = match ctx.attached_vm(&src).await? {
        Some(vm) if vm.state == VmState::Running => vm,
        _ => {
            return Err(Error::Precondition(format!(
                "卷 {} 必须挂载在运行中的虚拟机上才能在线迁移",
                src.id
            )))
        }
    };
    let host_id = vm
        .host_id
        .as_deref()
        .ok_or_else(|| Error::Precondition(format!("虚拟机 {} 没有运行主机", vm.instance_name)))?;
    let host = ctx.repo.get_host(host_id).await?;

    let mut releases = Releases::default();
    let outcome: Result<MigrateVolumeAnswer> = async {
        ctx.provision_volume(&mut dest).await?;
        releases.qos(ctx.raise_qos(&dest, &dest_store).await?);
        releases.grant(ctx.grant(&DataObject::Volume(dest.clone()), &host, &dest_store).await?);

        let command = MigrateVolumeCommand {
            volume_id: src.id.clone(),
            volume_path: src.path.clone(),
            src: Some(DataObject::Volume(src.clone()).to_data_to(&src_store)),
            dest: None,
            dest_store: Some(dest_store.to_store_to()),
            attached_vm_name: Some(vm.instance_name.clone()),
            src_details: HashMap::new(),
            dest_details: volume_details(&dest, &dest_store),
            wait_secs: ctx.settings.migrate_wait,
        };
        ctx.gateway
            .send_checked(&host, &command, wait(ctx.settings.migrate_wait), "卷在线迁移失败")
            .await
    }
    .await;

    releases.release_all().await;
    match outcome {
        Ok(answer) => {
            adopt_destination(&mut src, &dest, &dest_store, answer);
            ctx.repo.save_volume(&src).await?;
            ctx.fire(&mut src, ObjectEvent::OperationSuccessed).await?;
            // 源卷接管了目标 LUN，目标记录只是占位
            if let Err(e) = ctx.repo.remove_volume(&dest.id).await {
                warn!("删除占位卷记录 {} 失败: {}", dest.id, e);
            }
            info!("✅ 卷 {} 已在线迁移到存储池 {}", src.id, dest_store.id);
            Ok(Some(DataObject::Volume(src).to_data_to(&dest_store)))
        }
        Err(e) => {
            error!("卷 {} 在线迁移失败: {}", src.id, e);
            dest.details
                .insert(details::BASIC_DELETE_BY_FOLDER.to_string(), "true".to_string());
            ctx.discard_volume(&mut dest, true).await;
            conclude(ctx, &mut src, false).await;
            Err(e)
        }
    }
}

// ============================================================================
// 上传卷导入
// ============================================================================

async fn uploaded_volume_import(
    ctx: &MotionContext,
    mut src: Volume,
    mut dest: Volume,
    src_store: DataStore,
    dest_store: DataStore,
) -> Result<Option<DataTo>> {
    if dest.format != Some(ImageFormat::Qcow2) {
        return Err(Error::Precondition(format!(
            "上传卷只能以 QCOW2 格式导入，卷 {} 的格式为 {:?}",
            dest.id, dest.format
        )));
    }

    let host = ctx
        .hosts
        .select_host(&src.zone_id, &src_store, src.hypervisor, false)
        .await?
        .ok_or_else(|| Error::NoHostAvailable(format!("可用区 {} 中没有 {} 主机", src.zone_id, src.hypervisor)))?;

    ctx.fire(&mut src, ObjectEvent::CopyingRequested).await?;

    let mut releases = Releases::default();
    let outcome: Result<()> = async {
        ctx.provision_volume(&mut dest).await?;
        releases.qos(ctx.raise_qos(&dest, &dest_store).await?);
        ctx.copy_image_to_volume(
            &DataObject::Volume(src.clone()),
            &src_store,
            &mut dest,
            &dest_store,
            &host,
        )
        .await
        .map(|_| ())
    }
    .await;

    releases.release_all().await;
    conclude(ctx, &mut src, outcome.is_ok()).await;
    conclude_created_volume(ctx, &mut dest, outcome, true).await
}
