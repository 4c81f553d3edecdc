/// 主机访问授权守卫
///
/// 托管存储需要先授权主机访问对象，操作结束后撤销授权。
/// 非托管存储无需授权，守卫为空操作。

use common::Result;
use std::sync::Arc;
use tracing::{debug, warn};

use super::driver::{DriverRegistry, PrimaryDataStoreDriver};
use super::object::{DataObject, DataStore, Host};

pub struct AccessGrant {
    driver: Option<Arc<dyn PrimaryDataStoreDriver>>,
    object: DataObject,
    host: Host,
    store: DataStore,
    released: bool,
}

impl AccessGrant {
    /// 授权主机访问对象，授权失败直接返回错误
    pub async fn grant(
        drivers: &DriverRegistry,
        object: &DataObject,
        host: &Host,
        store: &DataStore,
    ) -> Result<Self> {
        let driver = if store.managed && store.is_primary() {
            let driver = drivers.for_store(store).await?;
            driver.grant_access(object, host, store).await?;
            debug!("已授权主机 {} 访问 {}", host.id, object.id());
            Some(driver)
        } else {
            None
        };

        Ok(Self {
            driver,
            object: object.clone(),
            host: host.clone(),
            store: store.clone(),
            released: false,
        })
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// 保留授权，不再撤销
    pub fn retain(mut self) {
        self.released = true;
        self.driver = None;
    }

    /// 撤销授权，失败只记录警告
    pub async fn revoke(mut self) {
        self.released = true;
        if let Some(driver) = self.driver.take() {
            revoke_quietly(driver.as_ref(), &self.object, &self.host, &self.store).await;
        }
    }
}

async fn revoke_quietly(
    driver: &dyn PrimaryDataStoreDriver,
    object: &DataObject,
    host: &Host,
    store: &DataStore,
) {
    match driver.revoke_access(object, host, store).await {
        Ok(()) => debug!("已撤销主机 {} 对 {} 的访问", host.id, object.id()),
        Err(e) => warn!("撤销主机 {} 对 {} 的访问失败: {}", host.id, object.id(), e),
    }
}

impl Drop for AccessGrant {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(driver) = self.driver.take() else {
            return;
        };
        warn!("访问授权未显式撤销，后台撤销 {} @ {}", self.object.id(), self.host.id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let object = self.object.clone();
            let host = self.host.clone();
            let store = self.store.clone();
            handle.spawn(async move {
                revoke_quietly(driver.as_ref(), &object, &host, &store).await;
            });
        }
    }
}
