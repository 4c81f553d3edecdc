/// 配置管理
///
/// 环境变量（可由 `.env` 提供）覆盖默认值

use common::models::constants;
use serde::Deserialize;
use std::time::Duration;

use crate::motion::MotionSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server_port: u16,
    /// 设置后使用数据库 advisory lock 作为存储池锁
    pub database_url: Option<String>,
    pub log_level: String,
    pub lock_timeout_secs: u64,
    pub primary_storage_download_wait: u64,
    pub kvm_storage_offline_migration_wait: u64,
    pub kvm_storage_online_migration_wait: u64,
    pub migrate_wait: u64,
    pub storage_pool_max_wait_seconds: u64,
    pub kvm_auto_convergence: bool,
    pub execute_in_sequence: bool,
    pub agent_heartbeat_timeout_secs: u64,
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> anyhow::Result<Self> {
        Self::load(config::Environment::default())
    }

    fn load(environment: config::Environment) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .set_default("server_port", i64::from(constants::DEFAULT_SERVER_PORT))?
            .set_default("log_level", "debug")?
            .set_default("lock_timeout_secs", constants::DEFAULT_LOCK_TIMEOUT_SECS)?
            .set_default(
                "primary_storage_download_wait",
                constants::DEFAULT_PRIMARY_STORAGE_DOWNLOAD_WAIT,
            )?
            .set_default(
                "kvm_storage_offline_migration_wait",
                constants::DEFAULT_KVM_STORAGE_OFFLINE_MIGRATION_WAIT,
            )?
            .set_default(
                "kvm_storage_online_migration_wait",
                constants::DEFAULT_KVM_STORAGE_ONLINE_MIGRATION_WAIT,
            )?
            .set_default("migrate_wait", constants::DEFAULT_MIGRATE_WAIT)?
            .set_default(
                "storage_pool_max_wait_seconds",
                constants::DEFAULT_STORAGE_POOL_MAX_WAIT_SECONDS,
            )?
            .set_default("kvm_auto_convergence", false)?
            .set_default("execute_in_sequence", false)?
            .set_default("agent_heartbeat_timeout_secs", constants::DEFAULT_NODE_TIMEOUT)?
            .add_source(environment.try_parsing(true))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn motion_settings(&self) -> MotionSettings {
        MotionSettings {
            lock_timeout: Duration::from_secs(self.lock_timeout_secs),
            primary_storage_download_wait: self.primary_storage_download_wait,
            kvm_offline_migration_wait: self.kvm_storage_offline_migration_wait,
            kvm_online_migration_wait: self.kvm_storage_online_migration_wait,
            migrate_wait: self.migrate_wait,
            storage_pool_max_wait: self.storage_pool_max_wait_seconds,
            execute_in_sequence: self.execute_in_sequence,
            kvm_auto_convergence: self.kvm_auto_convergence,
        }
    }
}
