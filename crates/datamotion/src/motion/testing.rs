/// 测试夹具：对象构造器与各外部接口的内存替身

use async_trait::async_trait;
use common::models::{
    details, DataStoreRole, HypervisorType, ImageFormat, QosState, ResourceState, ScopeType,
    SnapshotLocation, StoragePoolType, VmState,
};
use common::utils::GIB;
use common::ws_rpc::{
    CopyAnswer, CopyCommand, ResignatureAnswer, ResignatureCommand, RpcError, RpcMessage, RpcRouter,
};
use common::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::cache::CacheStorage;
use super::context::{MotionContext, MotionSettings};
use super::driver::{CreateResult, DriverRegistry, PrimaryDataStoreDriver};
use super::gateway::AgentTransport;
use super::lock::InProcessPoolLock;
use super::object::{DataObject, DataStore, Details, Host, Scope, Snapshot, Template, VirtualMachine, Volume};
use super::repository::InMemoryRepository;
use super::service::DataMotionService;
use super::state_machine::ObjectState;

// ============================================================================
// 对象构造
// ============================================================================

pub fn primary_store(id: &str, managed: bool) -> DataStore {
    DataStore {
        id: id.to_string(),
        name: format!("{}-name", id),
        role: DataStoreRole::Primary,
        managed,
        pool_type: Some(if managed {
            StoragePoolType::Iscsi
        } else {
            StoragePoolType::NetworkFilesystem
        }),
        scope: Scope::zone("zone-1"),
        provider: "fake".to_string(),
        host_address: Some("192.168.10.10".to_string()),
        port: Some(3260),
        url: None,
    }
}

pub fn image_store(id: &str) -> DataStore {
    DataStore {
        id: id.to_string(),
        name: format!("{}-name", id),
        role: DataStoreRole::Image,
        managed: false,
        pool_type: Some(StoragePoolType::NetworkFilesystem),
        scope: Scope {
            scope_type: ScopeType::Zone,
            scope_id: None,
            zone_id: "zone-1".to_string(),
        },
        provider: "nfs".to_string(),
        host_address: Some("192.168.10.20".to_string()),
        port: None,
        url: Some(format!("nfs://192.168.10.20/export/{}", id)),
    }
}

pub fn host(id: &str, cluster: &str, hypervisor: HypervisorType) -> Host {
    Host {
        id: id.to_string(),
        name: format!("{}-name", id),
        cluster_id: cluster.to_string(),
        zone_id: "zone-1".to_string(),
        hypervisor,
        resource_state: ResourceState::Enabled,
        private_ip: format!("10.0.0.{}", id.len() + 1),
    }
}

pub fn volume(id: &str, store: &str) -> Volume {
    Volume {
        id: id.to_string(),
        name: format!("{}-name", id),
        zone_id: "zone-1".to_string(),
        size: 10 * GIB,
        format: Some(ImageFormat::Qcow2),
        hypervisor: HypervisorType::Kvm,
        state: ObjectState::Ready,
        store_id: store.to_string(),
        last_pool_id: None,
        last_id: None,
        attached_vm: None,
        path: Some(format!("/mnt/{}/{}", store, id)),
        iscsi_name: None,
        folder: None,
        chain_info: None,
        template_id: None,
        migration_options: None,
        details: Details::new(),
    }
}

pub fn snapshot(id: &str, volume_id: &str, store: &str) -> Snapshot {
    Snapshot {
        id: id.to_string(),
        name: format!("{}-name", id),
        zone_id: "zone-1".to_string(),
        volume_id: volume_id.to_string(),
        store_id: store.to_string(),
        size: 10 * GIB,
        path: Some(format!("/snapshots/{}", id)),
        hypervisor: HypervisorType::Kvm,
        state: ObjectState::Ready,
        parent_id: None,
        location: SnapshotLocation::Primary,
        details: Details::new(),
    }
}

pub fn template(id: &str, store: &str) -> Template {
    Template {
        id: id.to_string(),
        name: format!("{}-name", id),
        unique_name: format!("{}-unique", id),
        zone_id: "zone-1".to_string(),
        store_id: store.to_string(),
        format: ImageFormat::Qcow2,
        hypervisor: Some(HypervisorType::Kvm),
        size: 2 * GIB,
        state: ObjectState::Ready,
        install_path: Some(format!("template/tmpl/{}", id)),
    }
}

pub fn vm(id: &str, state: VmState, host_id: &str) -> VirtualMachine {
    VirtualMachine {
        id: id.to_string(),
        instance_name: format!("i-2-{}-VM", id),
        state,
        host_id: Some(host_id.to_string()),
        hypervisor: HypervisorType::Kvm,
        template_id: None,
        is_windows: false,
    }
}

// ============================================================================
// 存储驱动替身
// ============================================================================

#[derive(Default)]
struct DriverLog {
    creates: Vec<String>,
    deletes: Vec<String>,
    copies: Vec<(String, String)>,
    resizes: Vec<(String, u64)>,
    qos: Vec<(String, QosState)>,
    granted: Vec<(String, String)>,
    grant_calls: usize,
    temp_markers: Vec<String>,
}

pub struct FakeDriver {
    provider: String,
    capabilities: HashMap<String, bool>,
    failing_qos: bool,
    failing_create: bool,
    granularity: Option<u64>,
    log: Mutex<DriverLog>,
}

impl FakeDriver {
    pub fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            capabilities: HashMap::new(),
            failing_qos: false,
            failing_create: false,
            granularity: None,
            log: Mutex::new(DriverLog::default()),
        }
    }

    pub fn with_capability(mut self, key: &str, value: bool) -> Self {
        self.capabilities.insert(key.to_string(), value);
        self
    }

    pub fn with_granularity(mut self, granularity: u64) -> Self {
        self.granularity = Some(granularity);
        self
    }

    pub fn failing_qos(mut self) -> Self {
        self.failing_qos = true;
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.failing_create = true;
        self
    }

    pub fn creates(&self) -> Vec<String> {
        self.log.lock().unwrap().creates.clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.log.lock().unwrap().deletes.clone()
    }

    pub fn copies(&self) -> Vec<(String, String)> {
        self.log.lock().unwrap().copies.clone()
    }

    pub fn resizes(&self) -> Vec<(String, u64)> {
        self.log.lock().unwrap().resizes.clone()
    }

    pub fn qos_log(&self) -> Vec<(String, QosState)> {
        self.log.lock().unwrap().qos.clone()
    }

    /// 当前仍然有效的授权 (对象, 主机)
    pub fn granted(&self) -> Vec<(String, String)> {
        self.log.lock().unwrap().granted.clone()
    }

    pub fn grant_calls(&self) -> usize {
        self.log.lock().unwrap().grant_calls
    }

    /// 快照上收到的临时卷标记
    pub fn temp_markers(&self) -> Vec<String> {
        self.log.lock().unwrap().temp_markers.clone()
    }
}

#[async_trait]
impl PrimaryDataStoreDriver for FakeDriver {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn capabilities(&self) -> HashMap<String, bool> {
        self.capabilities.clone()
    }

    async fn create_async(&self, _store: &DataStore, object: &DataObject) -> Result<CreateResult> {
        if self.failing_create {
            return Err(Error::Storage(format!("后端创建 {} 失败", object.id())));
        }
        let mut log = self.log.lock().unwrap();
        log.creates.push(object.id().to_string());
        if let DataObject::Snapshot(snapshot) = object {
            if let Some(marker) = snapshot.details.get(details::TEMP_VOLUME) {
                log.temp_markers.push(marker.clone());
            }
        }
        Ok(CreateResult {
            path: None,
            iscsi_name: Some(format!("iqn.fake:{}", object.id())),
            size: None,
        })
    }

    async fn delete_async(&self, _store: &DataStore, object: &DataObject) -> Result<()> {
        self.log.lock().unwrap().deletes.push(object.id().to_string());
        Ok(())
    }

    async fn can_copy(&self, _src: &DataObject, _dest: &DataObject) -> bool {
        true
    }

    async fn copy_async(&self, src: &DataObject, dest: &DataObject) -> Result<CreateResult> {
        self.log
            .lock()
            .unwrap()
            .copies
            .push((src.id().to_string(), dest.id().to_string()));
        Ok(CreateResult {
            path: Some(format!("/fake/{}", dest.id())),
            iscsi_name: None,
            size: None,
        })
    }

    async fn grant_access(&self, object: &DataObject, host: &Host, _store: &DataStore) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.grant_calls += 1;
        log.granted.push((object.id().to_string(), host.id.clone()));
        Ok(())
    }

    async fn revoke_access(&self, object: &DataObject, host: &Host, _store: &DataStore) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        if let Some(pos) = log
            .granted
            .iter()
            .position(|(o, h)| o == object.id() && h == &host.id)
        {
            log.granted.remove(pos);
        }
        Ok(())
    }

    async fn set_quality_of_service_for_migration(&self, volume: &Volume, state: QosState) -> Result<()> {
        if self.failing_qos {
            return Err(Error::Storage("QoS 不可用".to_string()));
        }
        self.log.lock().unwrap().qos.push((volume.id.clone(), state));
        Ok(())
    }

    async fn resize(&self, volume: &Volume, new_size: u64) -> Result<()> {
        self.log.lock().unwrap().resizes.push((volume.id.clone(), new_size));
        Ok(())
    }

    fn size_granularity(&self) -> Option<u64> {
        self.granularity
    }
}

// ============================================================================
// Agent 替身
// ============================================================================

/// 用 RpcRouter 应答命令的 Agent
#[derive(Default)]
pub struct FakeAgent {
    router: RpcRouter,
    connected: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(String, String, serde_json::Value)>>,
}

impl FakeAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(self, host_id: &str) -> Self {
        self.connected.lock().unwrap().insert(host_id.to_string());
        self
    }

    pub fn router(&self) -> &RpcRouter {
        &self.router
    }

    /// 按调用顺序排列的方法名
    pub fn methods(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, method, _)| method.clone())
            .collect()
    }

    /// Copy 成功，新路径为 `/copied/<目标 ID>`
    pub async fn copy_succeeds(&self) {
        self.router
            .register_command(|cmd: CopyCommand| async move {
                let mut new_data = cmd.dest;
                new_data.path = Some(format!("/copied/{}", new_data.id));
                Ok(CopyAnswer {
                    success: true,
                    message: String::new(),
                    new_data: Some(new_data),
                })
            })
            .await;
    }

    pub async fn copy_fails(&self, message: &'static str) {
        self.router
            .register_command(move |_cmd: CopyCommand| async move {
                Ok(CopyAnswer {
                    success: false,
                    message: message.to_string(),
                    new_data: None,
                })
            })
            .await;
    }

    /// 重签名成功，返回路径 `/dev/resigned`
    pub async fn resignature_succeeds(&self) {
        self.router
            .register_command(|_cmd: ResignatureCommand| async move {
                Ok(ResignatureAnswer {
                    success: true,
                    message: String::new(),
                    path: Some("/dev/resigned".to_string()),
                    size: 10 * GIB,
                    format: Some(ImageFormat::Vhd),
                })
            })
            .await;
    }

    /// 某个方法的 (主机, 负载) 调用记录
    pub fn calls_of(&self, method: &str) -> Vec<(String, serde_json::Value)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m, _)| m == method)
            .map(|(host, _, payload)| (host.clone(), payload.clone()))
            .collect()
    }
}

#[async_trait]
impl AgentTransport for FakeAgent {
    async fn call(
        &self,
        node_id: &str,
        method: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> std::result::Result<RpcMessage, RpcError> {
        if !self.connected.lock().unwrap().contains(node_id) {
            return Err(RpcError::node_not_found(node_id));
        }
        self.calls
            .lock()
            .unwrap()
            .push((node_id.to_string(), method.to_string(), payload.clone()));

        let request = RpcMessage::request(method, payload);
        tokio::time::timeout(timeout, self.router.handle_request(request))
            .await
            .map_err(|_| RpcError::timeout(format!("调用 {} 超时", method)))
    }
}

// ============================================================================
// 镜像缓存替身
// ============================================================================

#[derive(Default)]
pub struct FakeCache {
    failing_delete: bool,
    live: Mutex<Vec<String>>,
}

impl FakeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_delete(mut self) -> Self {
        self.failing_delete = true;
        self
    }

    pub fn live_objects(&self) -> Vec<String> {
        self.live.lock().unwrap().clone()
    }
}

#[async_trait]
impl CacheStorage for FakeCache {
    async fn cache_store(&self, scope: &Scope) -> Result<DataStore> {
        let mut store = image_store("cache-1");
        store.role = DataStoreRole::ImageCache;
        store.pool_type = None;
        store.scope = scope.clone();
        Ok(store)
    }

    async fn create_cache_object(&self, object: &DataObject, cache_store: &DataStore) -> Result<DataObject> {
        let id = format!("{}-cache", object.id());
        let cached = match object.clone() {
            DataObject::Volume(mut v) => {
                v.id = id.clone();
                v.store_id = cache_store.id.clone();
                v.state = ObjectState::Allocated;
                DataObject::Volume(v)
            }
            DataObject::Snapshot(mut s) => {
                s.id = id.clone();
                s.store_id = cache_store.id.clone();
                s.state = ObjectState::Allocated;
                s.location = SnapshotLocation::Secondary;
                DataObject::Snapshot(s)
            }
            DataObject::Template(mut t) => {
                t.id = id.clone();
                t.store_id = cache_store.id.clone();
                t.state = ObjectState::Allocated;
                DataObject::Template(t)
            }
        };
        self.live.lock().unwrap().push(id);
        Ok(cached)
    }

    async fn delete_cache_object(&self, object: &DataObject) -> Result<()> {
        if self.failing_delete {
            return Err(Error::Storage(format!("无法删除缓存对象 {}", object.id())));
        }
        self.live.lock().unwrap().retain(|id| id != object.id());
        Ok(())
    }
}

// ============================================================================
// 组装
// ============================================================================

pub fn test_settings() -> MotionSettings {
    MotionSettings {
        lock_timeout: Duration::from_millis(200),
        primary_storage_download_wait: 5,
        kvm_offline_migration_wait: 5,
        kvm_online_migration_wait: 5,
        migrate_wait: 5,
        storage_pool_max_wait: 5,
        execute_in_sequence: false,
        kvm_auto_convergence: false,
    }
}

/// 一套完整的测试环境
pub struct Harness {
    pub repo: InMemoryRepository,
    pub driver: Arc<FakeDriver>,
    pub agent: Arc<FakeAgent>,
    pub cache: Arc<FakeCache>,
    pub ctx: Arc<MotionContext>,
}

impl Harness {
    pub async fn new(driver: FakeDriver, agent: FakeAgent) -> Self {
        Self::with_settings(driver, agent, test_settings()).await
    }

    pub async fn with_settings(driver: FakeDriver, agent: FakeAgent, settings: MotionSettings) -> Self {
        let repo = InMemoryRepository::new();
        let driver = Arc::new(driver);
        let agent = Arc::new(agent);
        let cache = Arc::new(FakeCache::new());

        let drivers = DriverRegistry::new();
        drivers.register(driver.clone()).await;

        let ctx = Arc::new(MotionContext::new(
            Arc::new(repo.clone()),
            drivers,
            agent.clone(),
            Arc::new(InProcessPoolLock::new()),
            cache.clone(),
            settings,
        ));

        Self {
            repo,
            driver,
            agent,
            cache,
            ctx,
        }
    }

    pub fn service(&self) -> DataMotionService {
        DataMotionService::new(self.ctx.clone())
    }

    pub async fn volume(&self, id: &str) -> Volume {
        use super::repository::MotionRepository;
        self.repo.get_volume(id).await.unwrap()
    }

    pub async fn snapshot(&self, id: &str) -> Snapshot {
        use super::repository::MotionRepository;
        self.repo.get_snapshot(id).await.unwrap()
    }

    pub async fn template(&self, id: &str) -> Template {
        use super::repository::MotionRepository;
        self.repo.get_template(id).await.unwrap()
    }
}
