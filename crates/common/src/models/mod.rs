/// 共享数据模型
///
/// 定义编排器与 Agent 共享的枚举和常量

use serde::{Deserialize, Serialize};
use std::fmt;

/// 虚拟化类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorType {
    Kvm,
    XenServer,
    VMware,
    Hyperv,
    Simulator,
}

impl fmt::Display for HypervisorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Kvm => "KVM",
            Self::XenServer => "XenServer",
            Self::VMware => "VMware",
            Self::Hyperv => "Hyper-V",
            Self::Simulator => "Simulator",
        };
        write!(f, "{}", name)
    }
}

/// 镜像格式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Qcow2,
    Raw,
    Vhd,
    Ova,
    Iso,
}

/// 主存储池类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoragePoolType {
    NetworkFilesystem,
    SharedMountPoint,
    Filesystem,
    PowerFlex,
    FiberChannel,
    Iscsi,
    Rbd,
    Lvm,
}

impl StoragePoolType {
    /// 以文件形式保存卷的池（NFS 家族）
    pub fn is_file_based(&self) -> bool {
        matches!(
            self,
            Self::NetworkFilesystem | Self::SharedMountPoint | Self::Filesystem
        )
    }

    /// 允许 RAW 格式的块存储池
    pub fn allows_raw(&self) -> bool {
        matches!(self, Self::PowerFlex | Self::FiberChannel)
    }
}

/// 数据存储角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DataStoreRole {
    Primary,
    Image,
    ImageCache,
}

/// 作用域类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    Host,
    Cluster,
    Zone,
}

/// 资源状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Enabled,
    Disabled,
    Maintenance,
    PrepareForMaintenance,
}

/// 虚拟机状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Migrating,
    Error,
}

/// 虚拟机电源状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    PowerOn,
    PowerOff,
    PowerUnknown,
}

/// 迁移期间的 QoS 状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QosState {
    Migration,
    NoMigration,
}

/// 在线迁移时目标卷的克隆方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloneType {
    LinkedClone,
    FullClone,
}

/// 数据对象类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataObjectType {
    Volume,
    Snapshot,
    Template,
}

/// 快照所在位置
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotLocation {
    Primary,
    Secondary,
}

/// 存储驱动能力键
pub mod capabilities {
    pub const STORAGE_SYSTEM_SNAPSHOT: &str = "storage_system_snapshot";
    pub const CAN_CREATE_VOLUME_FROM_SNAPSHOT: &str = "can_create_volume_from_snapshot";
    pub const CAN_CREATE_VOLUME_FROM_VOLUME: &str = "can_create_volume_from_volume";
    pub const CAN_CLONE_VOLUME_FROM_TEMPLATE: &str = "can_clone_volume_from_template";
    pub const CAN_DIRECT_ATTACH_SNAPSHOT: &str = "can_direct_attach_snapshot";
    pub const CAN_REVERT_VOLUME_TO_SNAPSHOT: &str = "can_revert_volume_to_snapshot";
}

/// 对象详情 / 磁盘描述键
pub mod details {
    pub const MANAGED: &str = "managed";
    pub const STORAGE_HOST: &str = "storage_host";
    pub const STORAGE_PORT: &str = "storage_port";
    pub const IQN: &str = "iqn";
    pub const PROTOCOL_TYPE: &str = "protocol_type";
    pub const VOLUME_SIZE: &str = "volume_size";
    pub const SCSI_NAA_DEVICE_ID: &str = "scsi_naa_device_id";
    pub const CHAP_INITIATOR_USERNAME: &str = "chap_initiator_username";
    pub const CHAP_INITIATOR_SECRET: &str = "chap_initiator_secret";
    pub const CHAP_TARGET_USERNAME: &str = "chap_target_username";
    pub const CHAP_TARGET_SECRET: &str = "chap_target_secret";
    pub const PATH: &str = "path";
    pub const UUID: &str = "uuid";

    /// 快照由存储后端生成（需要临时卷才能读取）
    pub const TAKE_SNAPSHOT: &str = "take_snapshot";
    /// 驱动据此从快照创建 / 删除临时卷
    pub const TEMP_VOLUME: &str = "temp_volume";
    pub const TEMP_VOLUME_CREATE: &str = "create";
    pub const TEMP_VOLUME_DELETE: &str = "delete";

    pub const CLONE_OF_TEMPLATE: &str = "clone_of_template";
    pub const CLONE_OF_SNAPSHOT: &str = "clone_of_snapshot";
    pub const VMDK: &str = "vmdk";
    pub const TEMPLATE_RESIGN: &str = "template_resign";
    pub const BASIC_DELETE_BY_FOLDER: &str = "basic_delete_by_folder";
}

/// 常量定义
pub mod constants {
    /// 默认 Server 端口
    pub const DEFAULT_SERVER_PORT: u16 = 3000;

    /// 默认心跳间隔（秒）
    pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 30;

    /// 默认节点离线超时（秒）
    pub const DEFAULT_NODE_TIMEOUT: u64 = 180;

    /// 存储池锁默认等待时间（秒）
    pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 300;

    pub const DEFAULT_PRIMARY_STORAGE_DOWNLOAD_WAIT: u64 = 10800;
    pub const DEFAULT_KVM_STORAGE_OFFLINE_MIGRATION_WAIT: u64 = 21600;
    pub const DEFAULT_KVM_STORAGE_ONLINE_MIGRATION_WAIT: u64 = 86400;
    pub const DEFAULT_MIGRATE_WAIT: u64 = 3600;
    pub const DEFAULT_STORAGE_POOL_MAX_WAIT_SECONDS: u64 = 3600;

    /// 导入虚拟机时使用的占位模板，不能作为链接克隆的后备文件
    pub const DEFAULT_IMPORT_TEMPLATE_NAME: &str = "system-default-vm-import-dummy-template";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_type_families() {
        assert!(StoragePoolType::NetworkFilesystem.is_file_based());
        assert!(StoragePoolType::Filesystem.is_file_based());
        assert!(!StoragePoolType::PowerFlex.is_file_based());

        assert!(StoragePoolType::PowerFlex.allows_raw());
        assert!(StoragePoolType::FiberChannel.allows_raw());
        assert!(!StoragePoolType::Iscsi.allows_raw());
    }

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(serde_json::to_string(&HypervisorType::XenServer).unwrap(), "\"xenserver\"");
        assert_eq!(serde_json::to_string(&DataStoreRole::ImageCache).unwrap(), "\"image_cache\"");
        assert_eq!(serde_json::to_string(&PowerState::PowerOn).unwrap(), "\"power_on\"");
    }
}
