/// 存储池锁
///
/// 重签名期间按存储池 UUID 串行化，同一时刻整个集群只有一个持有者

use async_trait::async_trait;
use common::{Error, Result};
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, Statement,
    TransactionTrait,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::metrics;

/// 命名锁
#[async_trait]
pub trait PoolLock: Send + Sync + 'static {
    /// 在超时时间内获取锁，超时返回 false
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<bool>;

    async fn release(&self, key: &str) -> Result<()>;
}

/// 已持有的存储池锁
///
/// 显式 `release()` 释放；未释放就被丢弃（操作 panic 或任务被取消）时在后台释放
pub struct PoolLockGuard {
    lock: Arc<dyn PoolLock>,
    key: String,
    released: bool,
}

impl PoolLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) {
        self.released = true;
        release_quietly(self.lock.as_ref(), &self.key).await;
    }
}

async fn release_quietly(lock: &dyn PoolLock, key: &str) {
    match lock.release(key).await {
        Ok(()) => debug!("🔓 已释放存储池锁: {}", key),
        Err(e) => warn!("释放存储池锁失败: key={}, error={}", key, e),
    }
}

impl Drop for PoolLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!("存储池锁 {} 未显式释放，后台释放", self.key);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let lock = self.lock.clone();
            let key = std::mem::take(&mut self.key);
            handle.spawn(async move {
                release_quietly(lock.as_ref(), &key).await;
            });
        }
    }
}

/// 获取存储池锁，超时返回 `Error::LockTimeout`
pub async fn lock_pool(lock: &Arc<dyn PoolLock>, key: &str, timeout: Duration) -> Result<PoolLockGuard> {
    if !lock.acquire(key, timeout).await? {
        metrics::LOCK_TIMEOUTS.inc();
        return Err(Error::LockTimeout(format!(
            "{} (等待 {} 秒)",
            key,
            timeout.as_secs()
        )));
    }
    debug!("🔒 已获取存储池锁: {}", key);
    Ok(PoolLockGuard {
        lock: lock.clone(),
        key: key.to_string(),
        released: false,
    })
}

/// 持锁执行
///
/// 获取失败返回 `Error::LockTimeout`；操作返回、panic 或被取消都会释放锁
pub async fn with_pool_lock<F, T>(
    lock: &Arc<dyn PoolLock>,
    key: &str,
    timeout: Duration,
    operation: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let guard = lock_pool(lock, key, timeout).await?;
    let result = operation.await;
    guard.release().await;
    result
}

/// 进程内实现
#[derive(Default)]
pub struct InProcessPoolLock {
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    held: Mutex<HashMap<String, OwnedSemaphorePermit>>,
}

impl InProcessPoolLock {
    pub fn new() -> Self {
        Self::default()
    }

    async fn semaphore(&self, key: &str) -> Arc<Semaphore> {
        self.semaphores
            .lock()
            .await
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }
}

#[async_trait]
impl PoolLock for InProcessPoolLock {
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<bool> {
        let semaphore = self.semaphore(key).await;
        match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => {
                self.held.lock().await.insert(key.to_string(), permit);
                Ok(true)
            }
            Ok(Err(_)) => Err(Error::Internal(format!("锁已关闭: {}", key))),
            Err(_) => Ok(false),
        }
    }

    async fn release(&self, key: &str) -> Result<()> {
        match self.held.lock().await.remove(key) {
            Some(_permit) => Ok(()),
            None => Err(Error::InvalidArgument(format!("未持有锁: {}", key))),
        }
    }
}

/// 基于 PostgreSQL 事务级 advisory lock 的实现，跨控制面进程有效
pub struct DbPoolLock {
    db: DatabaseConnection,
    poll_interval: Duration,
    held: Mutex<HashMap<String, DatabaseTransaction>>,
}

impl DbPoolLock {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            poll_interval: Duration::from_millis(500),
            held: Mutex::new(HashMap::new()),
        }
    }

    async fn try_lock(txn: &DatabaseTransaction, key: &str) -> Result<bool> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT pg_try_advisory_xact_lock(hashtext($1)) AS locked",
            [key.to_string().into()],
        );
        let row = txn
            .query_one(stmt)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        match row {
            Some(row) => row
                .try_get::<bool>("", "locked")
                .map_err(|e| Error::Database(e.to_string())),
            None => Ok(false),
        }
    }
}

#[async_trait]
impl PoolLock for DbPoolLock {
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<bool> {
        let started = Instant::now();
        let txn = self
            .db
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        loop {
            if Self::try_lock(&txn, key).await? {
                self.held.lock().await.insert(key.to_string(), txn);
                return Ok(true);
            }
            if started.elapsed() >= timeout {
                if let Err(e) = txn.rollback().await {
                    warn!("回滚锁事务失败: key={}, error={}", key, e);
                }
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn release(&self, key: &str) -> Result<()> {
        let txn = self
            .held
            .lock()
            .await
            .remove(key)
            .ok_or_else(|| Error::InvalidArgument(format!("未持有锁: {}", key)))?;
        // 提交事务即释放 advisory lock
        txn.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}
