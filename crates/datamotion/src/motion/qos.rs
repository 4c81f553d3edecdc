/// 迁移期间的 QoS 切换
///
/// 切换失败只记录警告，不影响迁移结果

use common::models::QosState;
use std::sync::Arc;
use tracing::{debug, warn};

use super::driver::PrimaryDataStoreDriver;
use super::object::Volume;

/// 尽力设置卷的迁移 QoS
pub async fn set_quality_of_service(
    driver: &dyn PrimaryDataStoreDriver,
    volume: &Volume,
    state: QosState,
) {
    match driver.set_quality_of_service_for_migration(volume, state).await {
        Ok(()) => debug!("卷 {} QoS 已切换为 {:?}", volume.id, state),
        Err(e) => warn!("设置卷 {} 的 QoS ({:?}) 失败: {}", volume.id, state, e),
    }
}

/// 迁移 QoS 守卫
///
/// 创建时切换到 `Migration`，`release` 时恢复 `NoMigration`
pub struct QosGuard {
    driver: Arc<dyn PrimaryDataStoreDriver>,
    volume: Volume,
    released: bool,
}

impl QosGuard {
    pub async fn raise(driver: Arc<dyn PrimaryDataStoreDriver>, volume: &Volume) -> Self {
        set_quality_of_service(driver.as_ref(), volume, QosState::Migration).await;
        Self {
            driver,
            volume: volume.clone(),
            released: false,
        }
    }

    pub async fn release(mut self) {
        self.released = true;
        set_quality_of_service(self.driver.as_ref(), &self.volume, QosState::NoMigration).await;
    }
}

impl Drop for QosGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!("QoS 守卫未显式释放，后台恢复卷 {} 的 QoS", self.volume.id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let driver = self.driver.clone();
            let volume = self.volume.clone();
            handle.spawn(async move {
                set_quality_of_service(driver.as_ref(), &volume, QosState::NoMigration).await;
            });
        }
    }
}
