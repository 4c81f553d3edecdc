/// 迁移过程共享的运行环境和公共步骤

use common::models::{details, DataStoreRole, ImageFormat, StoragePoolType, VmState};
use common::ws_rpc::{
    CopyAnswer, CopyCommand, DataTo, ModifyTargetsCommand, ResignatureAnswer, ResignatureCommand,
    TargetTypeToRemove,
};
use common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::access::AccessGrant;
use super::cache::{CacheManager, CacheStorage, StagedCopy};
use super::driver::{DriverRegistry, PrimaryDataStoreDriver};
use super::gateway::{AgentGateway, AgentTransport};
use super::host_selector::HostSelector;
use super::lock::{with_pool_lock, PoolLock};
use super::object::{DataObject, DataStore, Host, Snapshot, VirtualMachine, Volume};
use super::qos::QosGuard;
use super::repository::MotionRepository;
use super::state_machine::{process_event, ObjectEvent, ObjectState, StateTracked};
use common::models::constants;

/// 迁移相关的等待时间与开关
#[derive(Debug, Clone)]
pub struct MotionSettings {
    pub lock_timeout: Duration,
    /// 以下等待时间单位为秒，随命令下发给 Agent
    pub primary_storage_download_wait: u64,
    pub kvm_offline_migration_wait: u64,
    pub kvm_online_migration_wait: u64,
    pub migrate_wait: u64,
    pub storage_pool_max_wait: u64,
    pub execute_in_sequence: bool,
    pub kvm_auto_convergence: bool,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(constants::DEFAULT_LOCK_TIMEOUT_SECS),
            primary_storage_download_wait: constants::DEFAULT_PRIMARY_STORAGE_DOWNLOAD_WAIT,
            kvm_offline_migration_wait: constants::DEFAULT_KVM_STORAGE_OFFLINE_MIGRATION_WAIT,
            kvm_online_migration_wait: constants::DEFAULT_KVM_STORAGE_ONLINE_MIGRATION_WAIT,
            migrate_wait: constants::DEFAULT_MIGRATE_WAIT,
            storage_pool_max_wait: constants::DEFAULT_STORAGE_POOL_MAX_WAIT_SECONDS,
            execute_in_sequence: false,
            kvm_auto_convergence: false,
        }
    }
}

/// 秒数转换为 RPC 超时
pub fn wait(secs: u64) -> Duration {
    Duration::from_secs(secs)
}

/// 迁移过程运行环境
pub struct MotionContext {
    pub repo: Arc<dyn MotionRepository>,
    pub drivers: DriverRegistry,
    pub gateway: AgentGateway,
    pub lock: Arc<dyn PoolLock>,
    pub cache: CacheManager,
    pub hosts: HostSelector,
    pub settings: MotionSettings,
}

impl MotionContext {
    pub fn new(
        repo: Arc<dyn MotionRepository>,
        drivers: DriverRegistry,
        transport: Arc<dyn AgentTransport>,
        lock: Arc<dyn PoolLock>,
        cache: Arc<dyn CacheStorage>,
        settings: MotionSettings,
    ) -> Self {
        Self {
            hosts: HostSelector::new(repo.clone()),
            repo,
            drivers,
            gateway: AgentGateway::new(transport),
            lock,
            cache: CacheManager::new(cache),
            settings,
        }
    }

    // ------------------------------------------------------------------
    // 状态
    // ------------------------------------------------------------------

    pub async fn fire<T: StateTracked + ?Sized>(&self, object: &mut T, event: ObjectEvent) -> Result<ObjectState> {
        process_event(self.repo.as_ref(), object, event).await
    }

    /// 清理路径上的事件，失败只记录警告
    pub async fn fire_quietly<T: StateTracked + ?Sized>(&self, object: &mut T, event: ObjectEvent) {
        if let Err(e) = self.fire(object, event).await {
            warn!("对象 {} 处理事件 {} 失败: {}", object.object_id(), event, e);
        }
    }

    // ------------------------------------------------------------------
    // 查询
    // ------------------------------------------------------------------

    pub async fn store_of(&self, object: &DataObject) -> Result<DataStore> {
        self.repo.get_store(object.store_id()).await
    }

    pub async fn data_to(&self, object: &DataObject) -> Result<DataTo> {
        let store = self.store_of(object).await?;
        Ok(object.to_data_to(&store))
    }

    pub async fn driver_for(&self, store: &DataStore) -> Result<Arc<dyn PrimaryDataStoreDriver>> {
        self.drivers.for_store(store).await
    }

    /// 对象所在存储是否支持由存储系统完成数据搬运
    pub async fn supports(&self, object: &DataObject, store: &DataStore) -> bool {
        if !store.is_primary() {
            return false;
        }
        let capability = match object {
            DataObject::Volume(_) | DataObject::Snapshot(_) => {
                common::models::capabilities::STORAGE_SYSTEM_SNAPSHOT
            }
            DataObject::Template(_) => common::models::capabilities::CAN_CREATE_VOLUME_FROM_VOLUME,
        };
        self.drivers.has_capability(store, capability).await
    }

    pub async fn attached_vm(&self, volume: &Volume) -> Result<Option<VirtualMachine>> {
        match volume.attached_vm.as_deref() {
            Some(vm_id) => Ok(Some(self.repo.get_vm(vm_id).await?)),
            None => Ok(None),
        }
    }

    /// 挂载的虚拟机必须处于给定状态之一（未挂载视为满足）
    pub async fn ensure_vm_state(&self, volume: &Volume, allowed: &[VmState]) -> Result<()> {
        if let Some(vm) = self.attached_vm(volume).await? {
            if !allowed.contains(&vm.state) {
                return Err(Error::Precondition(format!(
                    "卷 {} 挂载的虚拟机 {} 处于 {:?} 状态，要求 {:?}",
                    volume.id, vm.instance_name, vm.state, allowed
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // 守卫
    // ------------------------------------------------------------------

    pub async fn grant(&self, object: &DataObject, host: &Host, store: &DataStore) -> Result<AccessGrant> {
        AccessGrant::grant(&self.drivers, object, host, store).await
    }

    /// 托管主存储上的卷切换迁移 QoS，其他存储不需要
    pub async fn raise_qos(&self, volume: &Volume, store: &DataStore) -> Result<Option<QosGuard>> {
        if !(store.managed && store.is_primary()) {
            return Ok(None);
        }
        let driver = self.driver_for(store).await?;
        Ok(Some(QosGuard::raise(driver, volume).await))
    }

    // ------------------------------------------------------------------
    // 卷创建与清理
    // ------------------------------------------------------------------

    /// 在目标存储上创建卷：Allocated -> Creating，随后调用驱动
    ///
    /// 卷保持 Creating，由调用方在过程结束时发出终止事件
    pub async fn provision_volume(&self, volume: &mut Volume) -> Result<()> {
        let store = self.repo.get_store(&volume.store_id).await?;
        let driver = self.driver_for(&store).await?;

        self.fire(volume, ObjectEvent::CreateOnlyRequested).await?;
        let created = driver
            .create_async(&store, &DataObject::Volume(volume.clone()))
            .await?;

        if let Some(iscsi_name) = created.iscsi_name {
            volume.iscsi_name = Some(iscsi_name);
        }
        if let Some(path) = created.path {
            volume.path = Some(path);
        }
        if let Some(size) = created.size {
            volume.size = size;
        }
        self.repo.save_volume(volume).await?;
        info!("已在存储池 {} 上创建卷 {}", store.id, volume.id);
        Ok(())
    }

    /// 作废失败过程中的卷：终止事件、销毁，必要时删除后端对象
    pub async fn discard_volume(&self, volume: &mut Volume, delete_on_backend: bool) {
        if matches!(
            volume.state,
            ObjectState::Creating | ObjectState::Copying | ObjectState::Migrating | ObjectState::Resizing
        ) {
            self.fire_quietly(volume, ObjectEvent::OperationFailed).await;
        }
        self.fire_quietly(volume, ObjectEvent::DestroyRequested).await;

        if delete_on_backend {
            self.delete_on_backend(&DataObject::Volume(volume.clone())).await;
        }
    }

    /// 作废并彻底删除卷记录
    pub async fn expunge_volume(&self, volume: &mut Volume) {
        self.discard_volume(volume, true).await;
        if let Err(e) = self.repo.remove_volume(&volume.id).await {
            warn!("删除卷记录 {} 失败: {}", volume.id, e);
        }
    }

    /// 尽力删除后端对象
    pub async fn delete_on_backend(&self, object: &DataObject) {
        let outcome = async {
            let store = self.store_of(object).await?;
            let driver = self.driver_for(&store).await?;
            driver.delete_async(&store, object).await
        }
        .await;
        match outcome {
            Ok(()) => debug!("已删除后端对象 {}", object.id()),
            Err(e) => warn!("删除后端对象 {} 失败: {}", object.id(), e),
        }
    }

    /// 通过快照上的 `temp_volume` 标记让驱动创建或删除临时卷
    pub async fn snapshot_temp_volume(
        &self,
        snapshot: &mut Snapshot,
        store: &DataStore,
        marker: &str,
    ) -> Result<()> {
        let driver = self.driver_for(store).await?;

        snapshot
            .details
            .insert(details::TEMP_VOLUME.to_string(), marker.to_string());
        self.repo.save_snapshot(snapshot).await?;

        let outcome = driver
            .create_async(store, &DataObject::Snapshot(snapshot.clone()))
            .await;

        snapshot.details.remove(details::TEMP_VOLUME);
        self.repo.save_snapshot(snapshot).await?;

        outcome.map(|_| ())
    }

    // ------------------------------------------------------------------
    // Agent 命令
    // ------------------------------------------------------------------

    /// 持存储池锁执行重签名
    ///
    /// `keep_granted` 为 true 时成功后保留访问授权并交给调用方
    pub async fn perform_resignature(
        &self,
        object: &DataObject,
        store: &DataStore,
        host: &Host,
        extra: HashMap<String, String>,
        keep_granted: bool,
    ) -> Result<(ResignatureAnswer, Option<AccessGrant>)> {
        let mut details = match object {
            DataObject::Volume(v) => volume_details(v, store),
            DataObject::Snapshot(s) => snapshot_details(s, store),
            DataObject::Template(_) => HashMap::new(),
        };
        details.extend(extra);
        let command = ResignatureCommand { details };
        let timeout = wait(self.settings.storage_pool_max_wait);

        let (grant, outcome) = with_pool_lock(&self.lock, &store.id, self.settings.lock_timeout, async {
            let grant = self.grant(object, host, store).await?;
            let outcome = self
                .gateway
                .send_checked(host, &command, timeout, "重签名失败")
                .await;
            Ok((grant, outcome))
        })
        .await?;

        match outcome {
            Ok(answer) => {
                info!("✅ 对象 {} 已在主机 {} 上完成重签名", object.id(), host.id);
                if keep_granted {
                    Ok((answer, Some(grant)))
                } else {
                    grant.revoke().await;
                    Ok((answer, None))
                }
            }
            Err(e) => {
                grant.revoke().await;
                Err(e)
            }
        }
    }

    /// 把镜像（快照 / 模板）拷贝到托管卷上
    pub async fn copy_image_to_volume(
        &self,
        src: &DataObject,
        src_store: &DataStore,
        dest: &mut Volume,
        dest_store: &DataStore,
        host: &Host,
    ) -> Result<CopyAnswer> {
        let dest_object = DataObject::Volume(dest.clone());
        let grant = self.grant(&dest_object, host, dest_store).await?;

        let command = CopyCommand {
            src: src.to_data_to(src_store),
            dest: dest_object.to_data_to(dest_store),
            wait_secs: self.settings.primary_storage_download_wait,
            execute_in_sequence: self.settings.execute_in_sequence,
            options: HashMap::new(),
            options2: volume_details(dest, dest_store),
        };
        let outcome = self
            .gateway
            .send_checked(
                host,
                &command,
                wait(self.settings.primary_storage_download_wait),
                "无法将镜像拷贝到卷",
            )
            .await;
        grant.revoke().await;

        let answer = outcome?;
        dest.format = Some(ImageFormat::Qcow2);
        if let Some(path) = answer.new_data.as_ref().and_then(|d| d.path.clone()) {
            dest.path = Some(path);
        }
        self.repo.save_volume(dest).await?;
        Ok(answer)
    }

    /// 把快照拷贝成卷上的 VDI，二级存储需要暂存时先暂存整条快照链
    pub async fn copy_of_vdi(
        &self,
        volume: &mut Volume,
        volume_store: &DataStore,
        snapshot: &Snapshot,
        snapshot_store: &DataStore,
        host: &Host,
    ) -> Result<CopyAnswer> {
        let staged: Option<StagedCopy> = if CacheManager::needed(snapshot_store, volume_store) {
            let scope = CacheManager::pick_cache_scope(snapshot_store, volume_store);
            Some(
                self.cache
                    .stage_snapshot_chain(snapshot, self.repo.as_ref(), &scope)
                    .await?,
            )
        } else {
            None
        };

        let (src, src_store) = match staged
            .as_ref()
            .and_then(|s| s.leaf().map(|leaf| (leaf.clone(), s.store().clone())))
        {
            Some(cached) => cached,
            None => (DataObject::Snapshot(snapshot.clone()), snapshot_store.clone()),
        };

        let outcome = async {
            let dest_object = DataObject::Volume(volume.clone());
            let snapshot_grant = self.grant(&src, host, &src_store).await?;
            let volume_grant = match self.grant(&dest_object, host, volume_store).await {
                Ok(grant) => grant,
                Err(e) => {
                    snapshot_grant.revoke().await;
                    return Err(e);
                }
            };

            let options = match &src {
                DataObject::Snapshot(s) if src_store.managed => snapshot_details(s, &src_store),
                _ => HashMap::new(),
            };
            let command = CopyCommand {
                src: src.to_data_to(&src_store),
                dest: dest_object.to_data_to(volume_store),
                wait_secs: self.settings.primary_storage_download_wait,
                execute_in_sequence: self.settings.execute_in_sequence,
                options,
                options2: volume_details(volume, volume_store),
            };
            let outcome = self
                .gateway
                .send_checked(
                    host,
                    &command,
                    wait(self.settings.primary_storage_download_wait),
                    "无法从快照拷贝 VDI",
                )
                .await;

            volume_grant.revoke().await;
            snapshot_grant.revoke().await;
            outcome
        }
        .await;

        if let Some(staged) = staged {
            staged.discard().await;
        }

        let answer = outcome?;
        if let Some(path) = answer.new_data.as_ref().and_then(|d| d.path.clone()) {
            volume.path = Some(path);
            self.repo.save_volume(volume).await?;
        }
        Ok(answer)
    }

    /// 让主机（及其集群）连接或断开托管存储上的目标，返回连接后的设备路径
    pub async fn modify_targets(
        &self,
        host: &Host,
        store: &DataStore,
        iqn: &str,
        add: bool,
    ) -> Result<Vec<String>> {
        let mut target = HashMap::new();
        target.insert(details::IQN.to_string(), iqn.to_string());
        target.insert(details::UUID.to_string(), store.id.clone());
        if let Some(pool_type) = store.pool_type {
            target.insert(details::PROTOCOL_TYPE.to_string(), pool_type_name(pool_type));
        }
        if let Some(address) = &store.host_address {
            target.insert(details::STORAGE_HOST.to_string(), address.clone());
        }
        if let Some(port) = store.port {
            target.insert(details::STORAGE_PORT.to_string(), port.to_string());
        }

        let command = ModifyTargetsCommand {
            targets: vec![target],
            add,
            apply_to_all_hosts_in_cluster: true,
            target_type_to_remove: TargetTypeToRemove::Dynamic,
        };
        let answer = self
            .gateway
            .send_checked(
                host,
                &command,
                wait(self.settings.storage_pool_max_wait),
                &format!("无法在主机 {} 上修改存储目标", host.id),
            )
            .await?;
        Ok(answer.connected_paths)
    }
}

/// 过程结束时统一释放的资源
///
/// 顺序：撤销授权、恢复 QoS、删除暂存对象
#[derive(Default)]
pub struct Releases {
    grants: Vec<AccessGrant>,
    qos: Vec<QosGuard>,
    staged: Vec<StagedCopy>,
}

impl Releases {
    pub fn grant(&mut self, grant: AccessGrant) {
        self.grants.push(grant);
    }

    pub fn qos(&mut self, guard: Option<QosGuard>) {
        if let Some(guard) = guard {
            self.qos.push(guard);
        }
    }

    pub fn staged(&mut self, staged: StagedCopy) {
        self.staged.push(staged);
    }

    pub async fn release_all(&mut self) {
        while let Some(grant) = self.grants.pop() {
            grant.revoke().await;
        }
        while let Some(guard) = self.qos.pop() {
            guard.release().await;
        }
        while let Some(staged) = self.staged.pop() {
            staged.discard().await;
        }
    }
}

fn pool_type_name(pool_type: StoragePoolType) -> String {
    serde_json::to_value(pool_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{:?}", pool_type))
}

/// 托管卷的连接参数
pub fn volume_details(volume: &Volume, store: &DataStore) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if !(store.managed && store.role == DataStoreRole::Primary) {
        return map;
    }
    map.insert(details::MANAGED.to_string(), "true".to_string());
    if let Some(address) = &store.host_address {
        map.insert(details::STORAGE_HOST.to_string(), address.clone());
    }
    if let Some(port) = store.port {
        map.insert(details::STORAGE_PORT.to_string(), port.to_string());
    }
    if let Some(pool_type) = store.pool_type {
        map.insert(details::PROTOCOL_TYPE.to_string(), pool_type_name(pool_type));
    }
    if let Some(iqn) = &volume.iscsi_name {
        map.insert(details::IQN.to_string(), iqn.clone());
    }
    map.insert(details::VOLUME_SIZE.to_string(), volume.size.to_string());
    copy_credentials(&volume.details, &mut map);
    map
}

/// 托管存储上快照的连接参数
pub fn snapshot_details(snapshot: &Snapshot, store: &DataStore) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert(details::MANAGED.to_string(), "true".to_string());
    if let Some(address) = &store.host_address {
        map.insert(details::STORAGE_HOST.to_string(), address.clone());
    }
    if let Some(port) = store.port {
        map.insert(details::STORAGE_PORT.to_string(), port.to_string());
    }
    let iqn = snapshot
        .details
        .get(details::IQN)
        .cloned()
        .or_else(|| snapshot.path.clone());
    if let Some(iqn) = iqn {
        map.insert(details::IQN.to_string(), iqn);
    }
    map.insert(details::VOLUME_SIZE.to_string(), snapshot.size.to_string());
    copy_credentials(&snapshot.details, &mut map);
    map
}

fn copy_credentials(from: &super::object::Details, to: &mut HashMap<String, String>) {
    for key in [
        details::SCSI_NAA_DEVICE_ID,
        details::CHAP_INITIATOR_USERNAME,
        details::CHAP_INITIATOR_SECRET,
        details::CHAP_TARGET_USERNAME,
        details::CHAP_TARGET_SECRET,
    ] {
        if let Some(value) = from.get(key) {
            to.insert(key.to_string(), value.clone());
        }
    }
}

/// 镜像格式白名单：VHD / OVA / QCOW2，RAW 仅限 PowerFlex 和 FiberChannel 池
pub fn verify_format(format: Option<ImageFormat>, pool_type: Option<StoragePoolType>) -> Result<()> {
    match format {
        Some(ImageFormat::Vhd | ImageFormat::Ova | ImageFormat::Qcow2) => Ok(()),
        Some(ImageFormat::Raw) if pool_type.is_some_and(|t| t.allows_raw()) => Ok(()),
        other => Err(Error::Precondition(format!(
            "不支持的镜像格式 {:?} (存储池类型 {:?})",
            other, pool_type
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::testing::{primary_store, snapshot, volume, FakeAgent, FakeDriver, Harness};
    use common::models::HypervisorType;
    use common::ws_rpc::ResignatureCommand;

    #[test]
    fn test_verify_format() {
        assert!(verify_format(Some(ImageFormat::Qcow2), None).is_ok());
        assert!(verify_format(Some(ImageFormat::Vhd), Some(StoragePoolType::Iscsi)).is_ok());
        assert!(verify_format(Some(ImageFormat::Raw), Some(StoragePoolType::PowerFlex)).is_ok());
        assert!(matches!(
            verify_format(Some(ImageFormat::Raw), Some(StoragePoolType::Iscsi)),
            Err(Error::Precondition(_))
        ));
        assert!(verify_format(Some(ImageFormat::Iso), None).is_err());
        assert!(verify_format(None, None).is_err());
    }

    #[test]
    fn test_volume_details_only_for_managed() {
        let mut vol = volume("vol-1", "pool-1");
        vol.iscsi_name = Some("iqn.2010-01.com.example:vol-1".to_string());
        vol.details
            .insert(details::CHAP_INITIATOR_USERNAME.to_string(), "chap".to_string());

        let managed = volume_details(&vol, &primary_store("pool-1", true));
        assert_eq!(managed.get(details::MANAGED).map(String::as_str), Some("true"));
        assert_eq!(
            managed.get(details::IQN).map(String::as_str),
            Some("iqn.2010-01.com.example:vol-1")
        );
        assert_eq!(managed.get(details::PROTOCOL_TYPE).map(String::as_str), Some("iscsi"));
        assert_eq!(
            managed.get(details::CHAP_INITIATOR_USERNAME).map(String::as_str),
            Some("chap")
        );

        assert!(volume_details(&vol, &primary_store("pool-2", false)).is_empty());
    }

    #[test]
    fn test_snapshot_details_fall_back_to_path() {
        let snap = snapshot("snap-1", "vol-1", "pool-1");
        let map = snapshot_details(&snap, &primary_store("pool-1", true));
        assert_eq!(map.get(details::IQN).map(String::as_str), Some("/snapshots/snap-1"));
    }

    #[tokio::test]
    async fn test_provision_and_discard_volume() {
        let h = Harness::new(FakeDriver::new("fake"), FakeAgent::new()).await;
        h.repo.insert_store(primary_store("pool-1", true)).await;
        let mut vol = volume("vol-1", "pool-1");
        vol.state = ObjectState::Allocated;
        h.repo.insert_volume(vol.clone()).await;

        h.ctx.provision_volume(&mut vol).await.unwrap();
        assert_eq!(vol.state, ObjectState::Creating);
        assert_eq!(vol.iscsi_name.as_deref(), Some("iqn.fake:vol-1"));

        h.ctx.discard_volume(&mut vol, true).await;
        assert_eq!(h.volume("vol-1").await.state, ObjectState::Destroyed);
        assert_eq!(h.driver.deletes(), vec!["vol-1"]);
    }

    #[tokio::test]
    async fn test_resignature_revokes_unless_kept() {
        let agent = FakeAgent::new().connect("h1");
        agent
            .router()
            .register_command(|_cmd: ResignatureCommand| async move {
                Ok(ResignatureAnswer {
                    success: true,
                    message: String::new(),
                    path: Some("/dev/sr/resigned".to_string()),
                    size: 1024,
                    format: Some(ImageFormat::Vhd),
                })
            })
            .await;
        let h = Harness::new(FakeDriver::new("fake"), agent).await;
        let store = primary_store("pool-1", true);
        let host = crate::motion::testing::host("h1", "c1", HypervisorType::XenServer);
        let object = DataObject::Volume(volume("vol-1", "pool-1"));

        let (answer, grant) = h
            .ctx
            .perform_resignature(&object, &store, &host, HashMap::new(), false)
            .await
            .unwrap();
        assert_eq!(answer.path.as_deref(), Some("/dev/sr/resigned"));
        assert!(grant.is_none());
        assert!(h.driver.granted().is_empty());

        let (_, grant) = h
            .ctx
            .perform_resignature(&object, &store, &host, HashMap::new(), true)
            .await
            .unwrap();
        assert_eq!(h.driver.granted().len(), 1);
        grant.unwrap().revoke().await;
        assert!(h.driver.granted().is_empty());
    }

    #[tokio::test]
    async fn test_resignature_lock_timeout() {
        let h = Harness::new(FakeDriver::new("fake"), FakeAgent::new().connect("h1")).await;
        let store = primary_store("pool-1", true);
        let host = crate::motion::testing::host("h1", "c1", HypervisorType::XenServer);
        let object = DataObject::Volume(volume("vol-1", "pool-1"));

        assert!(h.ctx.lock.acquire("pool-1", Duration::from_millis(10)).await.unwrap());
        let err = h
            .ctx
            .perform_resignature(&object, &store, &host, HashMap::new(), false)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::LockTimeout(_)));
        // 没有拿到锁就不会授权
        assert_eq!(h.driver.grant_calls(), 0);
        h.ctx.lock.release("pool-1").await.unwrap();
    }
}
