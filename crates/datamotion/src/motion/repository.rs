/// 编排器访问的持久化接口
///
/// 存储池、主机、虚拟机、卷、快照、模板的查询与更新

use async_trait::async_trait;
use common::models::{HypervisorType, ScopeType};
use common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::object::{DataStore, Host, Snapshot, Template, VirtualMachine, Volume};

#[async_trait]
pub trait MotionRepository: Send + Sync + 'static {
    async fn get_store(&self, id: &str) -> Result<DataStore>;

    async fn get_host(&self, id: &str) -> Result<Host>;

    /// 能连接到该存储池的主机
    ///
    /// 主机级池只返回该主机，集群级池返回集群内主机，可用区级池返回可用区内主机
    async fn hosts_for_store(
        &self,
        store: &DataStore,
        hypervisor: Option<HypervisorType>,
    ) -> Result<Vec<Host>>;

    async fn hosts_in_zone(&self, zone_id: &str, hypervisor: HypervisorType) -> Result<Vec<Host>>;

    /// 集群是否支持重签名
    async fn cluster_supports_resign(&self, cluster_id: &str) -> Result<bool>;

    async fn get_vm(&self, id: &str) -> Result<VirtualMachine>;

    async fn get_volume(&self, id: &str) -> Result<Volume>;

    async fn save_volume(&self, volume: &Volume) -> Result<()>;

    /// 彻底删除卷记录
    async fn remove_volume(&self, id: &str) -> Result<()>;

    async fn get_snapshot(&self, id: &str) -> Result<Snapshot>;

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    async fn snapshots_of_volume(&self, volume_id: &str) -> Result<Vec<Snapshot>>;

    async fn get_template(&self, id: &str) -> Result<Template>;

    async fn save_template(&self, template: &Template) -> Result<()>;

    /// 模板在某个主存储池上的安装路径
    async fn template_install_path(&self, template_id: &str, pool_id: &str) -> Result<Option<String>>;
}

#[derive(Default)]
struct Tables {
    stores: HashMap<String, DataStore>,
    hosts: HashMap<String, Host>,
    /// cluster_id -> 是否支持重签名
    clusters: HashMap<String, bool>,
    vms: HashMap<String, VirtualMachine>,
    volumes: HashMap<String, Volume>,
    snapshots: HashMap<String, Snapshot>,
    templates: HashMap<String, Template>,
    /// (template_id, pool_id) -> install_path
    template_refs: HashMap<(String, String), String>,
}

/// 内存实现
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_store(&self, store: DataStore) {
        self.tables.write().await.stores.insert(store.id.clone(), store);
    }

    pub async fn insert_host(&self, host: Host) {
        self.tables.write().await.hosts.insert(host.id.clone(), host);
    }

    pub async fn insert_cluster(&self, cluster_id: impl Into<String>, supports_resign: bool) {
        self.tables
            .write()
            .await
            .clusters
            .insert(cluster_id.into(), supports_resign);
    }

    pub async fn insert_vm(&self, vm: VirtualMachine) {
        self.tables.write().await.vms.insert(vm.id.clone(), vm);
    }

    pub async fn insert_volume(&self, volume: Volume) {
        self.tables.write().await.volumes.insert(volume.id.clone(), volume);
    }

    pub async fn insert_snapshot(&self, snapshot: Snapshot) {
        self.tables
            .write()
            .await
            .snapshots
            .insert(snapshot.id.clone(), snapshot);
    }

    pub async fn insert_template(&self, template: Template) {
        self.tables
            .write()
            .await
            .templates
            .insert(template.id.clone(), template);
    }

    pub async fn insert_template_ref(
        &self,
        template_id: impl Into<String>,
        pool_id: impl Into<String>,
        install_path: impl Into<String>,
    ) {
        self.tables
            .write()
            .await
            .template_refs
            .insert((template_id.into(), pool_id.into()), install_path.into());
    }

    pub async fn volume_exists(&self, id: &str) -> bool {
        self.tables.read().await.volumes.contains_key(id)
    }

    pub async fn list_volumes(&self) -> Vec<Volume> {
        self.tables.read().await.volumes.values().cloned().collect()
    }
}

fn not_found(kind: &str, id: &str) -> Error {
    Error::NotFound(format!("{} {}", kind, id))
}

#[async_trait]
impl MotionRepository for InMemoryRepository {
    async fn get_store(&self, id: &str) -> Result<DataStore> {
        self.tables
            .read()
            .await
            .stores
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("存储池", id))
    }

    async fn get_host(&self, id: &str) -> Result<Host> {
        self.tables
            .read()
            .await
            .hosts
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("主机", id))
    }

    async fn hosts_for_store(
        &self,
        store: &DataStore,
        hypervisor: Option<HypervisorType>,
    ) -> Result<Vec<Host>> {
        let tables = self.tables.read().await;
        let scope_id = store.scope.scope_id.as_deref();
        let hosts = tables
            .hosts
            .values()
            .filter(|h| h.zone_id == store.scope.zone_id)
            .filter(|h| match store.scope.scope_type {
                ScopeType::Host => scope_id == Some(h.id.as_str()),
                ScopeType::Cluster => scope_id == Some(h.cluster_id.as_str()),
                ScopeType::Zone => true,
            })
            .filter(|h| hypervisor.map_or(true, |hv| h.hypervisor == hv))
            .cloned()
            .collect();
        Ok(hosts)
    }

    async fn hosts_in_zone(&self, zone_id: &str, hypervisor: HypervisorType) -> Result<Vec<Host>> {
        let tables = self.tables.read().await;
        Ok(tables
            .hosts
            .values()
            .filter(|h| h.zone_id == zone_id && h.hypervisor == hypervisor)
            .cloned()
            .collect())
    }

    async fn cluster_supports_resign(&self, cluster_id: &str) -> Result<bool> {
        Ok(self
            .tables
            .read()
            .await
            .clusters
            .get(cluster_id)
            .copied()
            .unwrap_or(false))
    }

    async fn get_vm(&self, id: &str) -> Result<VirtualMachine> {
        self.tables
            .read()
            .await
            .vms
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("虚拟机", id))
    }

    async fn get_volume(&self, id: &str) -> Result<Volume> {
        self.tables
            .read()
            .await
            .volumes
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("卷", id))
    }

    async fn save_volume(&self, volume: &Volume) -> Result<()> {
        self.insert_volume(volume.clone()).await;
        Ok(())
    }

    async fn remove_volume(&self, id: &str) -> Result<()> {
        self.tables
            .write()
            .await
            .volumes
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("卷", id))
    }

    async fn get_snapshot(&self, id: &str) -> Result<Snapshot> {
        self.tables
            .read()
            .await
            .snapshots
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("快照", id))
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.insert_snapshot(snapshot.clone()).await;
        Ok(())
    }

    async fn snapshots_of_volume(&self, volume_id: &str) -> Result<Vec<Snapshot>> {
        Ok(self
            .tables
            .read()
            .await
            .snapshots
            .values()
            .filter(|s| s.volume_id == volume_id)
            .cloned()
            .collect())
    }

    async fn get_template(&self, id: &str) -> Result<Template> {
        self.tables
            .read()
            .await
            .templates
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("模板", id))
    }

    async fn save_template(&self, template: &Template) -> Result<()> {
        self.insert_template(template.clone()).await;
        Ok(())
    }

    async fn template_install_path(&self, template_id: &str, pool_id: &str) -> Result<Option<String>> {
        Ok(self
            .tables
            .read()
            .await
            .template_refs
            .get(&(template_id.to_string(), pool_id.to_string()))
            .cloned())
    }
}
