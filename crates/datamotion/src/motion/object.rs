/// 数据对象模型
///
/// 卷、快照、模板统一用 `DataObject` 表示，迁移过程通过模式匹配分派

use async_trait::async_trait;
use common::models::{
    CloneType, DataObjectType, DataStoreRole, HypervisorType, ImageFormat, ResourceState,
    ScopeType, SnapshotLocation, StoragePoolType, VmState,
};
use common::ws_rpc::{DataStoreTo, DataTo};
use common::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::repository::MotionRepository;
use super::state_machine::{ObjectState, StateTracked};

pub type Details = BTreeMap<String, String>;

/// 作用域
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scope {
    pub scope_type: ScopeType,
    /// 主机 / 集群 / 可用区 ID
    pub scope_id: Option<String>,
    pub zone_id: String,
}

impl Scope {
    pub fn zone(zone_id: impl Into<String>) -> Self {
        let zone_id = zone_id.into();
        Self {
            scope_type: ScopeType::Zone,
            scope_id: Some(zone_id.clone()),
            zone_id,
        }
    }

    /// 扩大到所在可用区
    pub fn widen_to_zone(&self) -> Self {
        Self::zone(self.zone_id.clone())
    }
}

/// 数据存储（主存储池 / 镜像存储 / 镜像缓存）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataStore {
    pub id: String,
    pub name: String,
    pub role: DataStoreRole,
    pub managed: bool,
    pub pool_type: Option<StoragePoolType>,
    pub scope: Scope,
    /// 驱动提供者名称
    pub provider: String,
    pub host_address: Option<String>,
    pub port: Option<u16>,
    pub url: Option<String>,
}

impl DataStore {
    pub fn is_primary(&self) -> bool {
        self.role == DataStoreRole::Primary
    }

    pub fn is_image(&self) -> bool {
        matches!(self.role, DataStoreRole::Image | DataStoreRole::ImageCache)
    }

    pub fn is_nfs(&self) -> bool {
        self.pool_type == Some(StoragePoolType::NetworkFilesystem)
    }

    pub fn is_pool_type(&self, pool_type: StoragePoolType) -> bool {
        self.pool_type == Some(pool_type)
    }

    /// PowerFlex 或 FiberChannel 池
    pub fn allows_raw(&self) -> bool {
        self.pool_type.is_some_and(|t| t.allows_raw())
    }

    pub fn cluster_id(&self) -> Option<&str> {
        match self.scope.scope_type {
            ScopeType::Cluster => self.scope.scope_id.as_deref(),
            _ => None,
        }
    }

    pub fn host_id(&self) -> Option<&str> {
        match self.scope.scope_type {
            ScopeType::Host => self.scope.scope_id.as_deref(),
            _ => None,
        }
    }

    pub fn to_store_to(&self) -> DataStoreTo {
        DataStoreTo {
            id: self.id.clone(),
            role: self.role,
            pool_type: self.pool_type,
            managed: self.managed,
            scope: self.scope.scope_type,
            host_address: self.host_address.clone(),
            port: self.port,
            url: self.url.clone(),
        }
    }
}

/// 计算主机
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub cluster_id: String,
    pub zone_id: String,
    pub hypervisor: HypervisorType,
    pub resource_state: ResourceState,
    pub private_ip: String,
}

/// 虚拟机
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualMachine {
    pub id: String,
    pub instance_name: String,
    pub state: VmState,
    pub host_id: Option<String>,
    pub hypervisor: HypervisorType,
    pub template_id: Option<String>,
    pub is_windows: bool,
}

/// 在线迁移时目标卷的创建参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationOptions {
    pub clone_type: CloneType,
    pub src_pool_id: String,
    pub src_pool_type: Option<StoragePoolType>,
    pub src_pool_cluster_id: Option<String>,
    pub scope_type: ScopeType,
    /// 链接克隆的后备文件（模板在源池上的安装路径）
    pub backing_file: Option<String>,
    pub copy_src_template: bool,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub zone_id: String,
    pub size: u64,
    pub format: Option<ImageFormat>,
    pub hypervisor: HypervisorType,
    pub state: ObjectState,
    /// 当前所在存储池
    pub store_id: String,
    pub last_pool_id: Option<String>,
    /// 迁移来源卷
    pub last_id: Option<String>,
    pub attached_vm: Option<String>,
    pub path: Option<String>,
    pub iscsi_name: Option<String>,
    pub folder: Option<String>,
    pub chain_info: Option<String>,
    pub template_id: Option<String>,
    pub migration_options: Option<MigrationOptions>,
    pub details: Details,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    pub zone_id: String,
    /// 所属卷
    pub volume_id: String,
    pub store_id: String,
    pub size: u64,
    pub path: Option<String>,
    pub hypervisor: HypervisorType,
    pub state: ObjectState,
    /// 快照链上的父快照
    pub parent_id: Option<String>,
    pub location: SnapshotLocation,
    pub details: Details,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub unique_name: String,
    pub zone_id: String,
    pub store_id: String,
    pub format: ImageFormat,
    pub hypervisor: Option<HypervisorType>,
    pub size: u64,
    pub state: ObjectState,
    pub install_path: Option<String>,
}

/// 数据对象
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DataObject {
    Volume(Volume),
    Snapshot(Snapshot),
    Template(Template),
}

impl DataObject {
    pub fn id(&self) -> &str {
        match self {
            Self::Volume(v) => &v.id,
            Self::Snapshot(s) => &s.id,
            Self::Template(t) => &t.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Volume(v) => &v.name,
            Self::Snapshot(s) => &s.name,
            Self::Template(t) => &t.name,
        }
    }

    pub fn kind(&self) -> DataObjectType {
        match self {
            Self::Volume(_) => DataObjectType::Volume,
            Self::Snapshot(_) => DataObjectType::Snapshot,
            Self::Template(_) => DataObjectType::Template,
        }
    }

    pub fn store_id(&self) -> &str {
        match self {
            Self::Volume(v) => &v.store_id,
            Self::Snapshot(s) => &s.store_id,
            Self::Template(t) => &t.store_id,
        }
    }

    pub fn zone_id(&self) -> &str {
        match self {
            Self::Volume(v) => &v.zone_id,
            Self::Snapshot(s) => &s.zone_id,
            Self::Template(t) => &t.zone_id,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Self::Volume(v) => v.size,
            Self::Snapshot(s) => s.size,
            Self::Template(t) => t.size,
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Volume(v) => v.path.as_deref(),
            Self::Snapshot(s) => s.path.as_deref(),
            Self::Template(t) => t.install_path.as_deref(),
        }
    }

    pub fn format(&self) -> Option<ImageFormat> {
        match self {
            Self::Volume(v) => v.format,
            Self::Snapshot(_) => None,
            Self::Template(t) => Some(t.format),
        }
    }

    pub fn hypervisor(&self) -> Option<HypervisorType> {
        match self {
            Self::Volume(v) => Some(v.hypervisor),
            Self::Snapshot(s) => Some(s.hypervisor),
            Self::Template(t) => t.hypervisor,
        }
    }

    pub fn state(&self) -> ObjectState {
        match self {
            Self::Volume(v) => v.state,
            Self::Snapshot(s) => s.state,
            Self::Template(t) => t.state,
        }
    }

    pub fn set_path(&mut self, path: String) {
        match self {
            Self::Volume(v) => v.path = Some(path),
            Self::Snapshot(s) => s.path = Some(path),
            Self::Template(t) => t.install_path = Some(path),
        }
    }

    /// 对象在给定存储上的描述
    pub fn to_data_to(&self, store: &DataStore) -> DataTo {
        DataTo {
            id: self.id().to_string(),
            object_type: self.kind(),
            name: self.name().to_string(),
            path: self.path().map(str::to_string),
            format: self.format(),
            size: self.size(),
            hypervisor: self.hypervisor(),
            store: store.to_store_to(),
        }
    }
}

impl From<Volume> for DataObject {
    fn from(volume: Volume) -> Self {
        Self::Volume(volume)
    }
}

impl From<Snapshot> for DataObject {
    fn from(snapshot: Snapshot) -> Self {
        Self::Snapshot(snapshot)
    }
}

impl From<Template> for DataObject {
    fn from(template: Template) -> Self {
        Self::Template(template)
    }
}

#[async_trait]
impl StateTracked for Volume {
    fn object_id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ObjectState {
        self.state
    }

    fn set_state(&mut self, state: ObjectState) {
        self.state = state;
    }

    async fn save(&self, repo: &dyn MotionRepository) -> Result<()> {
        repo.save_volume(self).await
    }
}

#[async_trait]
impl StateTracked for Snapshot {
    fn object_id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ObjectState {
        self.state
    }

    fn set_state(&mut self, state: ObjectState) {
        self.state = state;
    }

    async fn save(&self, repo: &dyn MotionRepository) -> Result<()> {
        repo.save_snapshot(self).await
    }
}

#[async_trait]
impl StateTracked for Template {
    fn object_id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ObjectState {
        self.state
    }

    fn set_state(&mut self, state: ObjectState) {
        self.state = state;
    }

    async fn save(&self, repo: &dyn MotionRepository) -> Result<()> {
        repo.save_template(self).await
    }
}

#[async_trait]
impl StateTracked for DataObject {
    fn object_id(&self) -> &str {
        self.id()
    }

    fn state(&self) -> ObjectState {
        DataObject::state(self)
    }

    fn set_state(&mut self, state: ObjectState) {
        match self {
            Self::Volume(v) => v.state = state,
            Self::Snapshot(s) => s.state = state,
            Self::Template(t) => t.state = state,
        }
    }

    async fn save(&self, repo: &dyn MotionRepository) -> Result<()> {
        match self {
            Self::Volume(v) => repo.save_volume(v).await,
            Self::Snapshot(s) => repo.save_snapshot(s).await,
            Self::Template(t) => repo.save_template(t).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::testing::{primary_store, volume};

    #[test]
    fn test_store_scope_accessors() {
        let mut store = primary_store("pool-1", true);
        store.scope = Scope {
            scope_type: ScopeType::Cluster,
            scope_id: Some("cluster-1".to_string()),
            zone_id: "zone-1".to_string(),
        };
        assert_eq!(store.cluster_id(), Some("cluster-1"));
        assert_eq!(store.host_id(), None);
        assert_eq!(store.scope.widen_to_zone(), Scope::zone("zone-1"));
    }

    #[test]
    fn test_data_to_carries_store() {
        let store = primary_store("pool-1", true);
        let mut vol = volume("vol-1", "pool-1");
        vol.path = Some("iqn.2010-01.com.example:vol-1".to_string());

        let to = DataObject::from(vol).to_data_to(&store);
        assert_eq!(to.object_type, DataObjectType::Volume);
        assert_eq!(to.path.as_deref(), Some("iqn.2010-01.com.example:vol-1"));
        assert!(to.store.managed);
    }
}
