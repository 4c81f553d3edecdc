/// 主存储驱动抽象层
///
/// 编排器只通过该接口操作存储后端，具体驱动按 provider 名称注册

use async_trait::async_trait;
use common::models::QosState;
use common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use super::object::{DataObject, DataStore, Host, Volume};

/// 驱动创建对象的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateResult {
    pub path: Option<String>,
    pub iscsi_name: Option<String>,
    pub size: Option<u64>,
}

/// 主存储驱动 Trait
#[async_trait]
pub trait PrimaryDataStoreDriver: Send + Sync + 'static {
    /// 驱动提供者名称
    fn provider(&self) -> &str;

    /// 能力表，键见 `common::models::capabilities`
    fn capabilities(&self) -> HashMap<String, bool>;

    async fn create_async(&self, store: &DataStore, object: &DataObject) -> Result<CreateResult>;

    async fn delete_async(&self, store: &DataStore, object: &DataObject) -> Result<()>;

    /// 驱动能否直接在后端完成拷贝
    async fn can_copy(&self, src: &DataObject, dest: &DataObject) -> bool;

    async fn copy_async(&self, src: &DataObject, dest: &DataObject) -> Result<CreateResult>;

    async fn grant_access(&self, object: &DataObject, host: &Host, store: &DataStore) -> Result<()>;

    async fn revoke_access(&self, object: &DataObject, host: &Host, store: &DataStore) -> Result<()>;

    async fn set_quality_of_service_for_migration(&self, volume: &Volume, state: QosState) -> Result<()>;

    async fn resize(&self, volume: &Volume, new_size: u64) -> Result<()>;

    /// 容量分配粒度（字节），没有粒度要求时为 None
    fn size_granularity(&self) -> Option<u64> {
        None
    }
}

/// 驱动注册表
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: Arc<RwLock<HashMap<String, Arc<dyn PrimaryDataStoreDriver>>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册驱动
    pub async fn register(&self, driver: Arc<dyn PrimaryDataStoreDriver>) {
        let provider = driver.provider().to_string();
        info!("注册存储驱动: {}", provider);
        self.drivers.write().await.insert(provider, driver);
    }

    /// 获取存储池对应的驱动
    pub async fn for_store(&self, store: &DataStore) -> Result<Arc<dyn PrimaryDataStoreDriver>> {
        self.drivers
            .read()
            .await
            .get(&store.provider)
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!("存储驱动 {} (存储池 {})", store.provider, store.id))
            })
    }

    /// 存储池的能力表，非主存储或未注册驱动时为空
    pub async fn capabilities(&self, store: &DataStore) -> HashMap<String, bool> {
        if !store.is_primary() {
            return HashMap::new();
        }
        match self.drivers.read().await.get(&store.provider) {
            Some(driver) => driver.capabilities(),
            None => HashMap::new(),
        }
    }

    /// 能力值，未声明时为 None
    pub async fn capability(&self, store: &DataStore, key: &str) -> Option<bool> {
        self.capabilities(store).await.get(key).copied()
    }

    /// 能力是否声明为 true
    pub async fn has_capability(&self, store: &DataStore, key: &str) -> bool {
        self.capability(store, key).await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::testing::{image_store, primary_store, FakeDriver};
    use common::models::capabilities;

    #[tokio::test]
    async fn test_capabilities_only_for_primary() {
        let registry = DriverRegistry::new();
        let driver = FakeDriver::new("fake").with_capability(capabilities::STORAGE_SYSTEM_SNAPSHOT, true);
        registry.register(Arc::new(driver)).await;

        let mut primary = primary_store("pool-1", true);
        primary.provider = "fake".to_string();
        let mut image = image_store("image-1");
        image.provider = "fake".to_string();

        assert!(registry.has_capability(&primary, capabilities::STORAGE_SYSTEM_SNAPSHOT).await);
        assert!(!registry.has_capability(&image, capabilities::STORAGE_SYSTEM_SNAPSHOT).await);
        assert_eq!(registry.capability(&primary, capabilities::CAN_DIRECT_ATTACH_SNAPSHOT).await, None);
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let registry = DriverRegistry::new();
        let mut store = primary_store("pool-1", true);
        store.provider = "missing".to_string();
        assert!(matches!(registry.for_store(&store).await, Err(Error::NotFound(_))));
    }
}
