/// 快照相关过程：快照备份到二级存储、由快照创建卷

use common::models::{capabilities, details, HypervisorType, ImageFormat, StoragePoolType};
use common::utils::{generate_id, temp_object_name};
use common::ws_rpc::{CopyAnswer, CopyCommand, DataTo};
use common::{Error, Result};
use std::collections::HashMap;
use tracing::{info, warn};

use super::{conclude, conclude_created_volume, uses_backend_snapshot};
use crate::motion::cache::{CacheManager, StagedCopy};
use crate::motion::context::{snapshot_details, verify_format, volume_details, wait, MotionContext, Releases};
use crate::motion::object::{DataObject, DataStore, Details, Host, Snapshot, Volume};
use crate::motion::state_machine::{ObjectEvent, ObjectState};

pub(super) async fn handle_snapshot_copy(
    ctx: &MotionContext,
    snapshot: Snapshot,
    dest: DataObject,
    src_store: DataStore,
    dest_store: DataStore,
) -> Result<Option<DataTo>> {
    verify_base_volume_format(ctx, &snapshot).await?;
    let src_supported = ctx
        .supports(&DataObject::Snapshot(snapshot.clone()), &src_store)
        .await;

    match dest {
        DataObject::Volume(volume) => snapshot_to_volume(ctx, snapshot, volume, src_store, dest_store).await,
        dest if dest_store.is_image() && src_supported => {
            copy_to_secondary(ctx, snapshot, dest, src_store, dest_store).await
        }
        dest => Err(Error::Unsupported(format!(
            "不支持把快照 {} 拷贝到 {:?} {}",
            snapshot.id,
            dest.kind(),
            dest.id()
        ))),
    }
}

/// 快照所属卷的格式必须在白名单内
async fn verify_base_volume_format(ctx: &MotionContext, snapshot: &Snapshot) -> Result<()> {
    let base = ctx.repo.get_volume(&snapshot.volume_id).await?;
    let base_store = ctx.repo.get_store(&base.store_id).await?;
    verify_format(base.format, base_store.pool_type)
}

// ============================================================================
// 快照 -> 二级存储
// ============================================================================

async fn copy_to_secondary(
    ctx: &MotionContext,
    mut snapshot: Snapshot,
    dest: DataObject,
    src_store: DataStore,
    dest_store: DataStore,
) -> Result<Option<DataTo>> {
    ctx.fire(&mut snapshot, ObjectEvent::CopyingRequested).await?;

    let outcome = match ctx
        .drivers
        .capability(&src_store, capabilities::CAN_DIRECT_ATTACH_SNAPSHOT)
        .await
    {
        Some(direct) => adaptive_copy(ctx, &snapshot, &dest, &src_store, &dest_store, direct).await,
        None => backend_copy(ctx, &mut snapshot, &dest, &src_store, &dest_store).await,
    };

    conclude(ctx, &mut snapshot, outcome.is_ok()).await;
    match outcome {
        Ok(answer) => {
            info!("✅ 快照 {} 已备份到 {}", snapshot.id, dest_store.id);
            Ok(Some(result_data(answer, &dest, &dest_store)))
        }
        Err(e) => {
            warn!("快照 {} 备份失败: {}", snapshot.id, e);
            Err(e)
        }
    }
}

/// 驱动声明了是否能直接挂载快照：不能时先由驱动物化一个临时卷
async fn adaptive_copy(
    ctx: &MotionContext,
    snapshot: &Snapshot,
    dest: &DataObject,
    src_store: &DataStore,
    dest_store: &DataStore,
    direct: bool,
) -> Result<CopyAnswer> {
    let host = ctx.hosts.host_for_snapshot(snapshot, src_store).await?;
    let mut temp: Option<Volume> = None;

    let outcome: Result<CopyAnswer> = async {
        let source = if direct {
            DataObject::Snapshot(snapshot.clone())
        } else {
            let volume = temp.insert(temp_volume_for(snapshot, src_store));
            ctx.repo.save_volume(volume).await?;
            ctx.fire(volume, ObjectEvent::CreateOnlyRequested).await?;
            materialize_snapshot(ctx, snapshot, volume, src_store).await?;
            ctx.fire(volume, ObjectEvent::OperationSuccessed).await?;
            DataObject::Volume(volume.clone())
        };

        let mut options = match &source {
            DataObject::Snapshot(s) => snapshot_details(s, src_store),
            DataObject::Volume(v) => volume_details(v, src_store),
            DataObject::Template(_) => HashMap::new(),
        };
        if let Some(path) = source.path() {
            options.insert(details::PATH.to_string(), path.to_string());
        }

        let grant = ctx.grant(&source, &host, src_store).await?;
        let command = CopyCommand {
            src: source.to_data_to(src_store),
            dest: dest.to_data_to(dest_store),
            wait_secs: ctx.settings.primary_storage_download_wait,
            execute_in_sequence: ctx.settings.execute_in_sequence,
            options,
            options2: HashMap::new(),
        };
        let outcome = ctx
            .gateway
            .send_checked(
                &host,
                &command,
                wait(ctx.settings.primary_storage_download_wait),
                "无法把快照拷贝到二级存储",
            )
            .await;
        grant.revoke().await;
        outcome
    }
    .await;

    if let Some(mut volume) = temp {
        ctx.expunge_volume(&mut volume).await;
    }
    outcome
}

fn temp_volume_for(snapshot: &Snapshot, store: &DataStore) -> Volume {
    Volume {
        id: generate_id(),
        name: temp_object_name(&snapshot.name),
        zone_id: snapshot.zone_id.clone(),
        size: snapshot.size,
        format: None,
        hypervisor: snapshot.hypervisor,
        state: ObjectState::Allocated,
        store_id: store.id.clone(),
        last_pool_id: None,
        last_id: None,
        attached_vm: None,
        path: None,
        iscsi_name: None,
        folder: None,
        chain_info: None,
        template_id: None,
        migration_options: None,
        details: Details::new(),
    }
}

async fn materialize_snapshot(
    ctx: &MotionContext,
    snapshot: &Snapshot,
    volume: &mut Volume,
    store: &DataStore,
) -> Result<()> {
    let driver = ctx.driver_for(store).await?;
    let src = DataObject::Snapshot(snapshot.clone());
    let dest = DataObject::Volume(volume.clone());
    if !driver.can_copy(&src, &dest).await {
        return Err(Error::Storage(format!(
            "存储池 {} 不能由快照 {} 创建临时卷",
            store.id, snapshot.id
        )));
    }

    let created = driver.copy_async(&src, &dest).await?;
    if let Some(path) = created.path {
        volume.path = Some(path);
    }
    if let Some(iscsi_name) = created.iscsi_name {
        volume.iscsi_name = Some(iscsi_name);
    }
    ctx.repo.save_volume(volume).await
}

/// 存储后端快照：必要时创建临时卷并重签名，经由可选的缓存拷贝到二级存储
async fn backend_copy(
    ctx: &MotionContext,
    snapshot: &mut Snapshot,
    dest: &DataObject,
    src_store: &DataStore,
    dest_store: &DataStore,
) -> Result<CopyAnswer> {
    let host = ctx.hosts.host_for_snapshot(snapshot, src_store).await?;
    let backend = uses_backend_snapshot(snapshot)
        && !(snapshot.hypervisor == HypervisorType::Kvm && src_store.is_pool_type(StoragePoolType::PowerFlex));

    if backend
        && snapshot.hypervisor == HypervisorType::XenServer
        && !ctx.repo.cluster_supports_resign(&host.cluster_id).await?
    {
        return Err(Error::Precondition(format!(
            "主机 {} 所在集群不支持重签名，无法使用存储后端快照",
            host.id
        )));
    }

    let mut releases = Releases::default();
    let mut staged: Option<StagedCopy> = None;
    let mut temp_created = false;

    let outcome: Result<CopyAnswer> = async {
        if CacheManager::needed(src_store, dest_store) {
            let scope = CacheManager::pick_cache_scope(src_store, dest_store);
            staged = Some(ctx.cache.stage(dest, &scope).await?);
        }

        let mut source = DataObject::Snapshot(snapshot.clone());
        let mut granted = false;
        if backend {
            ctx.snapshot_temp_volume(snapshot, src_store, details::TEMP_VOLUME_CREATE)
                .await?;
            temp_created = true;
            source = DataObject::Snapshot(snapshot.clone());

            if matches!(snapshot.hypervisor, HypervisorType::XenServer | HypervisorType::VMware) {
                let keep = snapshot.hypervisor == HypervisorType::XenServer;
                let mut extra = HashMap::new();
                if snapshot.hypervisor == HypervisorType::VMware {
                    extra.insert(details::VMDK.to_string(), snapshot.name.clone());
                }
                let (answer, grant) = ctx
                    .perform_resignature(&source, src_store, &host, extra, keep)
                    .await?;
                if let Some(grant) = grant {
                    releases.grant(grant);
                    granted = true;
                }
                if let Some(path) = answer.path {
                    source.set_path(path);
                }
            }
        }
        if !granted {
            releases.grant(ctx.grant(&source, &host, src_store).await?);
        }

        let options = match &source {
            DataObject::Snapshot(s) if src_store.managed => snapshot_details(s, src_store),
            _ => HashMap::new(),
        };
        let target = match staged.as_ref() {
            Some(s) => s
                .leaf()
                .map(|leaf| leaf.to_data_to(s.store()))
                .ok_or_else(|| Error::Internal("暂存副本为空".to_string()))?,
            None => dest.to_data_to(dest_store),
        };
        let command = CopyCommand {
            src: source.to_data_to(src_store),
            dest: target,
            wait_secs: ctx.settings.primary_storage_download_wait,
            execute_in_sequence: ctx.settings.execute_in_sequence,
            options,
            options2: HashMap::new(),
        };
        let answer = send_copy(ctx, &host, &command).await?;

        match staged.as_mut() {
            Some(staged) => copy_from_cache(ctx, &host, staged, answer, dest, dest_store).await,
            None => Ok(answer),
        }
    }
    .await;

    releases.release_all().await;
    if let Some(staged) = staged {
        staged.discard().await;
    }
    if temp_created {
        if let Err(e) = ctx
            .snapshot_temp_volume(snapshot, src_store, details::TEMP_VOLUME_DELETE)
            .await
        {
            warn!("删除快照 {} 的临时卷失败: {}", snapshot.id, e);
        }
    }
    outcome
}

/// 缓存副本就绪后再从缓存拷贝到最终目标
async fn copy_from_cache(
    ctx: &MotionContext,
    host: &Host,
    staged: &mut StagedCopy,
    answer: CopyAnswer,
    dest: &DataObject,
    dest_store: &DataStore,
) -> Result<CopyAnswer> {
    let cache_store = staged.store().clone();
    let leaf = staged
        .leaf_mut()
        .ok_or_else(|| Error::Internal("暂存副本为空".to_string()))?;

    ctx.fire(leaf, ObjectEvent::CreateOnlyRequested).await?;
    if let Some(path) = answer.new_data.and_then(|d| d.path) {
        leaf.set_path(path);
    }
    ctx.fire(leaf, ObjectEvent::OperationSuccessed).await?;

    let command = CopyCommand {
        src: leaf.to_data_to(&cache_store),
        dest: dest.to_data_to(dest_store),
        wait_secs: ctx.settings.primary_storage_download_wait,
        execute_in_sequence: ctx.settings.execute_in_sequence,
        options: HashMap::new(),
        options2: HashMap::new(),
    };
    send_copy(ctx, host, &command).await
}

async fn send_copy(ctx: &MotionContext, host: &Host, command: &CopyCommand) -> Result<CopyAnswer> {
    ctx.gateway
        .send_checked(
            host,
            command,
            wait(ctx.settings.primary_storage_download_wait),
            "无法把快照拷贝到二级存储",
        )
        .await
}

fn result_data(answer: CopyAnswer, dest: &DataObject, dest_store: &DataStore) -> DataTo {
    answer
        .new_data
        .unwrap_or_else(|| dest.to_data_to(dest_store))
}

// ============================================================================
// 快照 -> 卷
// ============================================================================

async fn snapshot_to_volume(
    ctx: &MotionContext,
    snapshot: Snapshot,
    volume: Volume,
    src_store: DataStore,
    dest_store: DataStore,
) -> Result<Option<DataTo>> {
    let src_supported = ctx.supports(&DataObject::Snapshot(snapshot.clone()), &src_store).await;
    let dest_supported = ctx.supports(&DataObject::Volume(volume.clone()), &dest_store).await;

    if src_supported && dest_supported {
        if src_store.id != dest_store.id {
            return Err(Error::Precondition(format!(
                "快照 {} 与卷 {} 必须位于同一存储池",
                snapshot.id, volume.id
            )));
        }
        return managed_volume_from_managed_snapshot(ctx, snapshot, volume, src_store, dest_store).await;
    }
    if src_supported {
        return volume_from_managed_snapshot(ctx, snapshot, volume, src_store, dest_store).await;
    }
    if dest_supported {
        return managed_volume_from_snapshot(ctx, snapshot, volume, src_store, dest_store).await;
    }

    Err(Error::Unsupported(format!(
        "存储池 {} 和 {} 都不支持由快照 {} 创建卷",
        src_store.id, dest_store.id, snapshot.id
    )))
}

/// 同一托管存储上由快照创建卷：克隆后重签名，或者拷贝 VDI
async fn managed_volume_from_managed_snapshot(
    ctx: &MotionContext,
    snapshot: Snapshot,
    mut volume: Volume,
    src_store: DataStore,
    dest_store: DataStore,
) -> Result<Option<DataTo>> {
    let hypervisor = snapshot.hypervisor;
    if !matches!(
        hypervisor,
        HypervisorType::XenServer | HypervisorType::VMware | HypervisorType::Kvm
    ) {
        return Err(Error::Unsupported(format!(
            "不支持在 {} 上由托管快照创建卷",
            hypervisor
        )));
    }

    let host = ctx.hosts.host_for_snapshot(&snapshot, &src_store).await?;
    let resign = ctx.repo.cluster_supports_resign(&host.cluster_id).await?;
    let backend = uses_backend_snapshot(&snapshot);
    if backend && hypervisor == HypervisorType::XenServer && !resign {
        return Err(Error::Precondition(format!(
            "主机 {} 所在集群不支持重签名，无法使用存储后端快照",
            host.id
        )));
    }
    let cloning = backend
        || (resign
            && ctx
                .drivers
                .has_capability(&src_store, capabilities::CAN_CREATE_VOLUME_FROM_VOLUME)
                .await);

    let mut releases = Releases::default();
    let outcome: Result<()> = async {
        if cloning {
            volume
                .details
                .insert(details::CLONE_OF_SNAPSHOT.to_string(), snapshot.id.clone());
        }
        let created = ctx.provision_volume(&mut volume).await;
        if cloning {
            volume.details.remove(details::CLONE_OF_SNAPSHOT);
            ctx.repo.save_volume(&volume).await?;
        }
        created?;

        match hypervisor {
            HypervisorType::XenServer | HypervisorType::VMware if cloning => {
                let mut extra = HashMap::new();
                if hypervisor == HypervisorType::VMware {
                    extra.insert(details::VMDK.to_string(), volume.name.clone());
                }
                let object = DataObject::Volume(volume.clone());
                let (answer, _) = ctx
                    .perform_resignature(&object, &dest_store, &host, extra, false)
                    .await?;
                let path = answer
                    .path
                    .ok_or_else(|| Error::Agent("重签名应答缺少路径".to_string()))?;
                volume.path = Some(path);
                ctx.repo.save_volume(&volume).await
            }
            HypervisorType::XenServer | HypervisorType::VMware => {
                releases.qos(ctx.raise_qos(&volume, &dest_store).await?);
                ctx.copy_of_vdi(&mut volume, &dest_store, &snapshot, &src_store, &host)
                    .await
                    .map(|_| ())
            }
            _ => {
                volume.path = volume.iscsi_name.clone();
                ctx.repo.save_volume(&volume).await
            }
        }
    }
    .await;

    releases.release_all().await;
    conclude_created_volume(ctx, &mut volume, outcome, true).await
}

/// 托管快照到非托管卷，只支持 XenServer 集群级存储池
async fn volume_from_managed_snapshot(
    ctx: &MotionContext,
    mut snapshot: Snapshot,
    mut volume: Volume,
    src_store: DataStore,
    dest_store: DataStore,
) -> Result<Option<DataTo>> {
    if snapshot.hypervisor != HypervisorType::XenServer {
        return Err(Error::Unsupported(format!(
            "由托管快照创建非托管卷只支持 XenServer，快照 {} 属于 {}",
            snapshot.id, snapshot.hypervisor
        )));
    }
    if dest_store.cluster_id().is_none() {
        return Err(Error::Precondition(format!(
            "目标存储池 {} 必须是集群级存储池",
            dest_store.id
        )));
    }

    let backend = uses_backend_snapshot(&snapshot);
    let mut releases = Releases::default();
    let mut temp_created = false;

    let outcome: Result<()> = async {
        let host = ctx.hosts.host_in_cluster(&dest_store).await?;
        let mut source = DataObject::Snapshot(snapshot.clone());

        if backend {
            if !ctx.repo.cluster_supports_resign(&host.cluster_id).await? {
                return Err(Error::Precondition(format!(
                    "主机 {} 所在集群不支持重签名，无法使用存储后端快照",
                    host.id
                )));
            }
            ctx.snapshot_temp_volume(&mut snapshot, &src_store, details::TEMP_VOLUME_CREATE)
                .await?;
            temp_created = true;
            source = DataObject::Snapshot(snapshot.clone());

            let (answer, grant) = ctx
                .perform_resignature(&source, &src_store, &host, HashMap::new(), true)
                .await?;
            if let Some(grant) = grant {
                releases.grant(grant);
            }
            if let Some(path) = answer.path {
                source.set_path(path);
            }
        } else {
            releases.grant(ctx.grant(&source, &host, &src_store).await?);
        }

        ctx.fire(&mut volume, ObjectEvent::CreateOnlyRequested).await?;
        let command = CopyCommand {
            src: source.to_data_to(&src_store),
            dest: DataObject::Volume(volume.clone()).to_data_to(&dest_store),
            wait_secs: ctx.settings.primary_storage_download_wait,
            execute_in_sequence: ctx.settings.execute_in_sequence,
            options: snapshot_details(&snapshot, &src_store),
            options2: HashMap::new(),
        };
        let answer = ctx
            .gateway
            .send_checked(
                &host,
                &command,
                wait(ctx.settings.primary_storage_download_wait),
                "无法由快照创建卷",
            )
            .await?;

        if let Some(new_data) = answer.new_data {
            if let Some(path) = new_data.path {
                volume.path = Some(path);
            }
            if let Some(format) = new_data.format {
                volume.format = Some(format);
            }
        }
        ctx.repo.save_volume(&volume).await
    }
    .await;

    releases.release_all().await;
    if temp_created {
        if let Err(e) = ctx
            .snapshot_temp_volume(&mut snapshot, &src_store, details::TEMP_VOLUME_DELETE)
            .await
        {
            warn!("删除快照 {} 的临时卷失败: {}", snapshot.id, e);
        }
    }
    conclude_created_volume(ctx, &mut volume, outcome, false).await
}

/// 非托管快照到托管卷
async fn managed_volume_from_snapshot(
    ctx: &MotionContext,
    snapshot: Snapshot,
    mut volume: Volume,
    src_store: DataStore,
    dest_store: DataStore,
) -> Result<Option<DataTo>> {
    let mut releases = Releases::default();
    let outcome: Result<()> = async {
        ctx.provision_volume(&mut volume).await?;
        releases.qos(ctx.raise_qos(&volume, &dest_store).await?);

        let host = ctx
            .hosts
            .select_host(&snapshot.zone_id, &src_store, snapshot.hypervisor, false)
            .await?
            .ok_or_else(|| {
                Error::NoHostAvailable(format!("可用区 {} 中没有 {} 主机", snapshot.zone_id, snapshot.hypervisor))
            })?;

        if snapshot.hypervisor == HypervisorType::XenServer {
            ctx.copy_of_vdi(&mut volume, &dest_store, &snapshot, &src_store, &host)
                .await?;
        } else {
            let source = DataObject::Snapshot(snapshot.clone());
            ctx.copy_image_to_volume(&source, &src_store, &mut volume, &dest_store, &host)
                .await?;
        }
        if volume.format.is_none() {
            volume.format = Some(ImageFormat::Qcow2);
            ctx.repo.save_volume(&volume).await?;
        }
        Ok(())
    }
    .await;

    releases.release_all().await;
    conclude_created_volume(ctx, &mut volume, outcome, true).await
}
