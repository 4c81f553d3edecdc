/// KVM 虚拟机连同多块磁盘的在线迁移
///
/// 流程：
/// 1. 校验源池 / 目标池组合
/// 2. 每块磁盘在目标池上复制卷记录、创建卷、授权目标主机、连接目标
/// 3. 目标主机 PrepareForMigration，源主机 Migrate
/// 4. 成功时新卷接替源卷；失败时回滚并清理所有新卷

use common::models::{constants, CloneType, HypervisorType, ImageFormat, PowerState, StoragePoolType};
use common::utils::generate_id;
use common::ws_rpc::{
    CheckVirtualMachineCommand, DiskSource, DiskTo, DiskType, DriverType, MigrateCommand, MigrateDiskInfo,
    PrepareForMigrationCommand, VirtualMachineTo,
};
use common::{Error, Result};
use std::collections::HashMap;
use tracing::{error, info, warn};

use crate::motion::access::AccessGrant;
use crate::motion::context::{volume_details, wait, MotionContext};
use crate::motion::object::{DataObject, DataStore, Host, MigrationOptions, VirtualMachine, Volume};
use crate::motion::qos::QosGuard;
use crate::motion::state_machine::{ObjectEvent, ObjectState};

/// 正在迁移的一块磁盘
struct MigratingDisk {
    src: Volume,
    src_store: DataStore,
    dest: Volume,
    dest_store: DataStore,
    grant: Option<AccessGrant>,
    qos: Option<QosGuard>,
    /// 目标主机已连接的 iSCSI 目标
    connected: Option<String>,
}

/// 链接克隆所需的后备文件
struct BackingFile {
    path: String,
    template_id: String,
    eligible: bool,
}

pub async fn migrate_vm_with_volumes(
    ctx: &MotionContext,
    volume_map: Vec<(Volume, DataStore)>,
    vm: VirtualMachine,
    src_host: Host,
    dest_host: Host,
) -> Result<()> {
    if src_host.hypervisor != HypervisorType::Kvm {
        return Err(Error::Unsupported(format!(
            "在线迁移只支持 KVM，源主机 {} 为 {}",
            src_host.id, src_host.hypervisor
        )));
    }
    verify_live_migration(ctx, &volume_map).await?;
    let vm = ctx.repo.get_vm(&vm.id).await?;

    info!(
        "📤 开始在线迁移虚拟机 {}: {} -> {}, 磁盘数={}",
        vm.instance_name,
        src_host.id,
        dest_host.id,
        volume_map.len()
    );

    let mut disks: Vec<MigratingDisk> = Vec::new();
    let outcome = async {
        let mut migrate_storage = HashMap::new();
        let mut non_shared_inc = false;
        let mut managed = false;

        for (src, dest_store) in volume_map {
            let src_store = ctx.repo.get_store(&src.store_id).await?;
            if src_store.id == dest_store.id && src_store.is_pool_type(StoragePoolType::PowerFlex) {
                info!("卷 {} 已在目标存储池 {} 上，跳过", src.id, dest_store.id);
                continue;
            }

            let backing = backing_file(ctx, &src, &src_store).await?;
            let linked = backing.as_ref().is_some_and(|b| b.eligible)
                && dest_store.pool_type.is_some_and(|t| t.is_file_based());
            non_shared_inc |= linked;
            managed |= dest_store.managed;

            let mut disk = MigratingDisk {
                dest: duplicate_volume(&src, &dest_store),
                src,
                src_store,
                dest_store,
                grant: None,
                qos: None,
                connected: None,
            };
            let prepared = prepare_disk(ctx, &mut disk, &dest_host, backing.as_ref(), linked).await;
            let key = disk.src.path.clone().unwrap_or_else(|| disk.src.id.clone());
            disks.push(disk);
            migrate_storage.insert(key, prepared?);
        }

        let vm_to = VirtualMachineTo {
            id: vm.id.clone(),
            name: vm.instance_name.clone(),
            state: Some(vm.state),
            disks: disks
                .iter()
                .map(|d| DiskTo {
                    volume_id: d.dest.id.clone(),
                    path: d.dest.path.clone(),
                    details: volume_details(&d.dest, &d.dest_store),
                })
                .collect(),
        };

        let prepared = ctx
            .gateway
            .send_checked(
                &dest_host,
                &PrepareForMigrationCommand {
                    vm: vm_to.clone(),
                    rollback: false,
                },
                wait(ctx.settings.migrate_wait),
                "目标主机准备迁移失败",
            )
            .await?;

        let command = MigrateCommand {
            vm_name: vm.instance_name.clone(),
            dest_ip: dest_host.private_ip.clone(),
            is_windows: vm.is_windows,
            vm: vm_to.clone(),
            execute_in_sequence: ctx.settings.execute_in_sequence,
            wait_secs: ctx.settings.kvm_online_migration_wait,
            migrate_storage,
            migrate_storage_managed: managed,
            migrate_non_shared_inc: non_shared_inc,
            auto_convergence: ctx.settings.kvm_auto_convergence,
            new_vm_cpu_shares: prepared.new_vm_cpu_shares,
        };
        send_migrate(ctx, &src_host, &dest_host, &command).await?;
        Ok::<_, Error>(vm_to)
    }
    .await;

    if outcome.is_err() {
        rollback_prepare(ctx, &vm, &dest_host, &disks).await;
    }

    let success = outcome.is_ok();
    for disk in disks {
        finish_disk(ctx, disk, &dest_host, success).await;
    }

    match outcome {
        Ok(_) => {
            info!("✅ 虚拟机 {} 已迁移到主机 {}", vm.instance_name, dest_host.id);
            Ok(())
        }
        Err(e) => {
            error!("虚拟机 {} 在线迁移失败: {}", vm.instance_name, e);
            Err(e)
        }
    }
}

/// 源池是托管存储时只允许 PowerFlex 之间或同池迁移；目标池必须全部托管或全部非托管
async fn verify_live_migration(ctx: &MotionContext, volume_map: &[(Volume, DataStore)]) -> Result<()> {
    let mut managed_dest = 0usize;
    for (volume, dest_store) in volume_map {
        let src_store = ctx.repo.get_store(&volume.store_id).await?;
        if src_store.managed {
            let powerflex = src_store.is_pool_type(StoragePoolType::PowerFlex)
                && dest_store.is_pool_type(StoragePoolType::PowerFlex);
            if !powerflex && src_store.id != dest_store.id {
                return Err(Error::Precondition(format!(
                    "卷 {} 位于托管存储池 {}，不能在线迁移到 {}",
                    volume.id, src_store.id, dest_store.id
                )));
            }
        }
        if dest_store.managed {
            managed_dest += 1;
        }
    }

    if managed_dest != 0 && managed_dest != volume_map.len() {
        return Err(Error::Precondition(
            "目标存储池必须全部是托管存储或全部是非托管存储".to_string(),
        ));
    }
    Ok(())
}

/// 卷所用模板在源池上的安装路径
async fn backing_file(ctx: &MotionContext, src: &Volume, src_store: &DataStore) -> Result<Option<BackingFile>> {
    let Some(template_id) = src.template_id.as_deref() else {
        return Ok(None);
    };
    let template = ctx.repo.get_template(template_id).await?;
    if template.hypervisor != Some(HypervisorType::Kvm) || template.format == ImageFormat::Iso {
        return Ok(None);
    }

    let path = ctx
        .repo
        .template_install_path(template_id, &src_store.id)
        .await?;
    Ok(path.map(|path| BackingFile {
        path,
        template_id: template.id.clone(),
        eligible: template.name != constants::DEFAULT_IMPORT_TEMPLATE_NAME,
    }))
}

/// 在目标池上复制源卷记录
fn duplicate_volume(src: &Volume, dest_store: &DataStore) -> Volume {
    let mut dest = src.clone();
    dest.id = generate_id();
    dest.store_id = dest_store.id.clone();
    dest.last_pool_id = Some(src.store_id.clone());
    dest.last_id = Some(src.id.clone());
    dest.state = ObjectState::Allocated;
    dest.path = None;
    dest.iscsi_name = None;
    dest.folder = None;
    dest.chain_info = None;
    dest.migration_options = None;
    dest.details.clear();
    dest
}

async fn prepare_disk(
    ctx: &MotionContext,
    disk: &mut MigratingDisk,
    dest_host: &Host,
    backing: Option<&BackingFile>,
    linked: bool,
) -> Result<MigrateDiskInfo> {
    ctx.repo.save_volume(&disk.dest).await?;
    for event in [
        ObjectEvent::MigrationCopyRequested,
        ObjectEvent::MigrationCopySucceeded,
        ObjectEvent::MigrationRequested,
    ] {
        ctx.fire(&mut disk.dest, event).await?;
    }
    if disk.src.state == ObjectState::Ready {
        ctx.fire(&mut disk.src, ObjectEvent::MigrationRequested).await?;
    }

    if !disk.dest_store.managed {
        disk.dest.migration_options = Some(migration_options(ctx, disk, backing, linked).await?);
        ctx.repo.save_volume(&disk.dest).await?;
    }

    let driver = ctx.driver_for(&disk.dest_store).await?;
    let created = driver
        .create_async(&disk.dest_store, &DataObject::Volume(disk.dest.clone()))
        .await?;
    if let Some(iscsi_name) = created.iscsi_name {
        disk.dest.iscsi_name = Some(iscsi_name);
    }
    if let Some(size) = created.size {
        disk.dest.size = size;
    }
    disk.dest.path = if disk.dest_store.managed {
        disk.dest.iscsi_name.clone()
    } else {
        Some(created.path.unwrap_or_else(|| disk.dest.id.clone()))
    };
    ctx.repo.save_volume(&disk.dest).await?;

    disk.qos = ctx.raise_qos(&disk.dest, &disk.dest_store).await?;
    disk.grant = Some(
        ctx.grant(&DataObject::Volume(disk.dest.clone()), dest_host, &disk.dest_store)
            .await?,
    );

    let mut device = disk.dest.path.clone().unwrap_or_else(|| disk.dest.id.clone());
    if disk.dest_store.managed {
        let iqn = disk
            .dest
            .iscsi_name
            .clone()
            .ok_or_else(|| Error::Storage(format!("卷 {} 没有 iSCSI 名称", disk.dest.id)))?;
        let paths = ctx.modify_targets(dest_host, &disk.dest_store, &iqn, true).await?;
        disk.connected = Some(iqn);
        device = paths
            .into_iter()
            .next()
            .ok_or_else(|| Error::Agent(format!("主机 {} 没有返回卷 {} 的设备路径", dest_host.id, disk.dest.id)))?;
    }

    Ok(disk_info(disk, device, backing.filter(|_| linked)))
}

async fn migration_options(
    ctx: &MotionContext,
    disk: &MigratingDisk,
    backing: Option<&BackingFile>,
    linked: bool,
) -> Result<MigrationOptions> {
    let (clone_type, backing_file, copy_src_template) = match backing {
        Some(backing) if linked => {
            let on_dest = ctx
                .repo
                .template_install_path(&backing.template_id, &disk.dest_store.id)
                .await?;
            let copy = on_dest.is_none();
            (CloneType::LinkedClone, Some(on_dest.unwrap_or_else(|| backing.path.clone())), copy)
        }
        _ => (CloneType::FullClone, None, false),
    };

    Ok(MigrationOptions {
        clone_type,
        src_pool_id: disk.src_store.id.clone(),
        src_pool_type: disk.src_store.pool_type,
        src_pool_cluster_id: disk.src_store.cluster_id().map(str::to_string),
        scope_type: disk.src_store.scope.scope_type,
        backing_file,
        copy_src_template,
        timeout_secs: ctx.settings.kvm_online_migration_wait,
    })
}

/// 文件池迁往非托管 NFS 时按 QCOW2 文件描述，其余按块设备描述
fn disk_info(disk: &MigratingDisk, device: String, backing: Option<&BackingFile>) -> MigrateDiskInfo {
    let file_based_src = disk.src_store.pool_type.is_some_and(|t| t.is_file_based());
    let as_file = file_based_src && disk.dest_store.is_nfs() && !disk.dest_store.managed;
    let serial_number = disk.src.path.clone().unwrap_or_else(|| disk.src.id.clone());

    if as_file {
        MigrateDiskInfo {
            serial_number,
            disk_type: DiskType::File,
            driver_type: DriverType::Qcow2,
            source: DiskSource::File,
            source_text: device,
            backing_store_text: backing.map(|b| b.path.clone()),
            source_disk_on_storage_file_system: disk.src_store.is_pool_type(StoragePoolType::Filesystem),
        }
    } else {
        MigrateDiskInfo {
            serial_number,
            disk_type: DiskType::Block,
            driver_type: DriverType::Raw,
            source: DiskSource::Dev,
            source_text: device,
            backing_store_text: None,
            source_disk_on_storage_file_system: disk.src_store.is_pool_type(StoragePoolType::Filesystem),
        }
    }
}

/// Migrate 超时后以目标主机上虚拟机的电源状态为准
async fn send_migrate(ctx: &MotionContext, src_host: &Host, dest_host: &Host, command: &MigrateCommand) -> Result<()> {
    let timeout = wait(ctx.settings.kvm_online_migration_wait);
    match ctx
        .gateway
        .send_checked(src_host, command, timeout, "虚拟机迁移失败")
        .await
    {
        Ok(_) => Ok(()),
        Err(Error::AgentTimeout(message)) => {
            warn!("虚拟机 {} 迁移命令超时，检查目标主机 {}", command.vm_name, dest_host.id);
            let check = CheckVirtualMachineCommand {
                vm_name: command.vm_name.clone(),
            };
            match ctx
                .gateway
                .send(dest_host, &check, wait(ctx.settings.migrate_wait))
                .await
            {
                Ok(answer) if answer.power_state == Some(PowerState::PowerOn) => {
                    info!("虚拟机 {} 已在目标主机 {} 上运行", command.vm_name, dest_host.id);
                    Ok(())
                }
                Ok(_) => Err(Error::AgentTimeout(message)),
                Err(e) => {
                    warn!("检查虚拟机 {} 状态失败: {}", command.vm_name, e);
                    Err(Error::AgentTimeout(message))
                }
            }
        }
        Err(e) => Err(e),
    }
}

async fn rollback_prepare(ctx: &MotionContext, vm: &VirtualMachine, dest_host: &Host, disks: &[MigratingDisk]) {
    let command = PrepareForMigrationCommand {
        vm: VirtualMachineTo {
            id: vm.id.clone(),
            name: vm.instance_name.clone(),
            state: Some(vm.state),
            disks: disks
                .iter()
                .map(|d| DiskTo {
                    volume_id: d.dest.id.clone(),
                    path: d.dest.path.clone(),
                    details: volume_details(&d.dest, &d.dest_store),
                })
                .collect(),
        },
        rollback: true,
    };
    if let Err(e) = ctx
        .gateway
        .send_checked(dest_host, &command, wait(ctx.settings.migrate_wait), "回滚迁移准备失败")
        .await
    {
        warn!("目标主机 {} 回滚迁移准备失败: {}", dest_host.id, e);
    }
}

async fn finish_disk(ctx: &MotionContext, mut disk: MigratingDisk, dest_host: &Host, success: bool) {
    if let Some(qos) = disk.qos.take() {
        qos.release().await;
    }

    if success {
        if let Some(grant) = disk.grant.take() {
            grant.retain();
        }
        if let Err(e) = adopt_source(ctx, &mut disk).await {
            warn!("卷 {} 迁移后更新记录失败: {}", disk.dest.id, e);
        }
        return;
    }

    if let Some(iqn) = disk.connected.take() {
        if let Err(e) = ctx.modify_targets(dest_host, &disk.dest_store, &iqn, false).await {
            warn!("断开主机 {} 上的目标 {} 失败: {}", dest_host.id, iqn, e);
        }
    }
    if let Some(grant) = disk.grant.take() {
        grant.revoke().await;
    }
    if disk.src.state == ObjectState::Migrating {
        ctx.fire_quietly(&mut disk.src, ObjectEvent::OperationFailed).await;
    }
    ctx.expunge_volume(&mut disk.dest).await;
}

/// 新卷接替源卷，源卷的快照转到新卷名下
async fn adopt_source(ctx: &MotionContext, disk: &mut MigratingDisk) -> Result<()> {
    disk.dest.format = Some(ImageFormat::Qcow2);
    disk.dest.last_id = Some(disk.src.id.clone());
    ctx.repo.save_volume(&disk.dest).await?;
    ctx.fire(&mut disk.dest, ObjectEvent::OperationSuccessed).await?;

    if disk.src.state == ObjectState::Migrating {
        ctx.fire(&mut disk.src, ObjectEvent::OperationSuccessed).await?;
    }
    ctx.fire(&mut disk.src, ObjectEvent::DestroyRequested).await?;

    for mut snapshot in ctx.repo.snapshots_of_volume(&disk.src.id).await? {
        snapshot.volume_id = disk.dest.id.clone();
        ctx.repo.save_snapshot(&snapshot).await?;
    }
    Ok(())
}
