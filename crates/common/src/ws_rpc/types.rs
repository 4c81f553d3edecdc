/// WebSocket RPC 数据类型定义
///
/// 编排器下发给 Agent 的存储命令及其应答

use crate::models::{
    DataObjectType, DataStoreRole, HypervisorType, ImageFormat, PowerState, ScopeType,
    StoragePoolType, VmState,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// 命令约定
// ============================================================================

/// Agent 命令：方法名和应答类型在类型层面绑定
pub trait AgentCommand: Serialize + Send + Sync {
    /// RPC 方法名
    const METHOD: &'static str;

    /// 应答类型
    type Answer: AgentAnswer;
}

/// Agent 应答的公共部分
pub trait AgentAnswer: DeserializeOwned + Send {
    fn success(&self) -> bool;

    fn details(&self) -> &str;
}

// ============================================================================
// 心跳 / 注册
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
    pub hostname: String,
    pub ip_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub message: String,
}

// ============================================================================
// 数据对象描述
// ============================================================================

/// 数据存储描述
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataStoreTo {
    pub id: String,
    pub role: DataStoreRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_type: Option<StoragePoolType>,
    pub managed: bool,
    pub scope: ScopeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// 数据对象描述（卷 / 快照 / 模板）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataTo {
    pub id: String,
    pub object_type: DataObjectType,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<ImageFormat>,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hypervisor: Option<HypervisorType>,
    pub store: DataStoreTo,
}

// ============================================================================
// 拷贝
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyCommand {
    pub src: DataTo,
    pub dest: DataTo,
    pub wait_secs: u64,
    pub execute_in_sequence: bool,
    /// 源端附加参数
    #[serde(default)]
    pub options: HashMap<String, String>,
    /// 目标端附加参数
    #[serde(default)]
    pub options2: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyAnswer {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_data: Option<DataTo>,
}

/// 把托管卷整体拷贝到二级存储
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyVolumeCommand {
    pub volume_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_path: Option<String>,
    pub src_store: DataStoreTo,
    pub dest_store: DataStoreTo,
    pub to_secondary: bool,
    pub wait_secs: u64,
    #[serde(default)]
    pub src_details: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyVolumeAnswer {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_path: Option<String>,
}

// ============================================================================
// 卷迁移
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateVolumeCommand {
    pub volume_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<DataTo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest: Option<DataTo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_store: Option<DataStoreTo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attached_vm_name: Option<String>,
    #[serde(default)]
    pub src_details: HashMap<String, String>,
    #[serde(default)]
    pub dest_details: HashMap<String, String>,
    pub wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateVolumeAnswer {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_info: Option<String>,
}

// ============================================================================
// 重签名
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResignatureCommand {
    pub details: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResignatureAnswer {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<ImageFormat>,
}

// ============================================================================
// iSCSI 目标连接
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetTypeToRemove {
    Both,
    Static,
    Dynamic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyTargetsCommand {
    pub targets: Vec<HashMap<String, String>>,
    pub add: bool,
    pub apply_to_all_hosts_in_cluster: bool,
    pub target_type_to_remove: TargetTypeToRemove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyTargetsAnswer {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub connected_paths: Vec<String>,
}

// ============================================================================
// 虚拟机迁移
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskTo {
    pub volume_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub details: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachineTo {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<VmState>,
    #[serde(default)]
    pub disks: Vec<DiskTo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckVirtualMachineCommand {
    pub vm_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckVirtualMachineAnswer {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_state: Option<PowerState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareForMigrationCommand {
    pub vm: VirtualMachineTo,
    pub rollback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareForMigrationAnswer {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_vm_cpu_shares: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    File,
    Block,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DriverType {
    Qcow2,
    Raw,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiskSource {
    File,
    Dev,
}

/// 在线迁移时单个磁盘在目标端的描述
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrateDiskInfo {
    /// 源卷路径，作为磁盘匹配键
    pub serial_number: String,
    pub disk_type: DiskType,
    pub driver_type: DriverType,
    pub source: DiskSource,
    pub source_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backing_store_text: Option<String>,
    pub source_disk_on_storage_file_system: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateCommand {
    pub vm_name: String,
    pub dest_ip: String,
    pub is_windows: bool,
    pub vm: VirtualMachineTo,
    pub execute_in_sequence: bool,
    pub wait_secs: u64,
    pub migrate_storage: HashMap<String, MigrateDiskInfo>,
    pub migrate_storage_managed: bool,
    pub migrate_non_shared_inc: bool,
    pub auto_convergence: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_vm_cpu_shares: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateAnswer {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

// ============================================================================
// 命令绑定
// ============================================================================

impl AgentCommand for CopyCommand {
    const METHOD: &'static str = "copy";
    type Answer = CopyAnswer;
}

impl AgentCommand for CopyVolumeCommand {
    const METHOD: &'static str = "copy_volume";
    type Answer = CopyVolumeAnswer;
}

impl AgentCommand for MigrateVolumeCommand {
    const METHOD: &'static str = "migrate_volume";
    type Answer = MigrateVolumeAnswer;
}

impl AgentCommand for ResignatureCommand {
    const METHOD: &'static str = "resignature";
    type Answer = ResignatureAnswer;
}

impl AgentCommand for ModifyTargetsCommand {
    const METHOD: &'static str = "modify_targets";
    type Answer = ModifyTargetsAnswer;
}

impl AgentCommand for CheckVirtualMachineCommand {
    const METHOD: &'static str = "check_virtual_machine";
    type Answer = CheckVirtualMachineAnswer;
}

impl AgentCommand for PrepareForMigrationCommand {
    const METHOD: &'static str = "prepare_for_migration";
    type Answer = PrepareForMigrationAnswer;
}

impl AgentCommand for MigrateCommand {
    const METHOD: &'static str = "migrate";
    type Answer = MigrateAnswer;
}

macro_rules! impl_agent_answer {
    ($($answer:ty),* $(,)?) => {
        $(
            impl AgentAnswer for $answer {
                fn success(&self) -> bool {
                    self.success
                }

                fn details(&self) -> &str {
                    &self.message
                }
            }
        )*
    };
}

impl_agent_answer!(
    CopyAnswer,
    CopyVolumeAnswer,
    MigrateVolumeAnswer,
    ResignatureAnswer,
    ModifyTargetsAnswer,
    CheckVirtualMachineAnswer,
    PrepareForMigrationAnswer,
    MigrateAnswer,
);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_answer_defaults_when_fields_missing() {
        let answer: CopyAnswer = serde_json::from_value(json!({"success": true})).unwrap();
        assert!(answer.success());
        assert_eq!(answer.details(), "");
        assert!(answer.new_data.is_none());

        let answer: ModifyTargetsAnswer = serde_json::from_value(json!({
            "success": false,
            "message": "iscsiadm login failed"
        }))
        .unwrap();
        assert!(!answer.success());
        assert_eq!(answer.details(), "iscsiadm login failed");
        assert!(answer.connected_paths.is_empty());
    }

    #[test]
    fn test_method_names() {
        assert_eq!(CopyCommand::METHOD, "copy");
        assert_eq!(MigrateCommand::METHOD, "migrate");
        assert_eq!(PrepareForMigrationCommand::METHOD, "prepare_for_migration");
    }

    #[test]
    fn test_migrate_disk_info_wire_format() {
        let info = MigrateDiskInfo {
            serial_number: "/mnt/pool/vol-1".to_string(),
            disk_type: DiskType::Block,
            driver_type: DriverType::Raw,
            source: DiskSource::Dev,
            source_text: "/dev/disk/by-path/iqn-1".to_string(),
            backing_store_text: None,
            source_disk_on_storage_file_system: false,
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["disk_type"], "block");
        assert_eq!(value["driver_type"], "raw");
        assert_eq!(value["source"], "dev");
        assert!(value.get("backing_store_text").is_none());
    }
}
