/// 镜像缓存（暂存）管理
///
/// 快照在非 NFS 的镜像存储之间搬运时先暂存到可用区的镜像缓存上，
/// 暂存对象只在所属迁移过程内存在。

use async_trait::async_trait;
use common::models::{DataStoreRole, SnapshotLocation};
use common::utils::generate_id;
use common::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::object::{DataObject, DataStore, Scope, Snapshot};
use super::repository::MotionRepository;
use super::state_machine::ObjectState;

/// 外部镜像缓存服务
#[async_trait]
pub trait CacheStorage: Send + Sync + 'static {
    /// 作用域内的镜像缓存存储
    async fn cache_store(&self, scope: &Scope) -> Result<DataStore>;

    /// 在缓存存储上登记对象的副本
    async fn create_cache_object(&self, object: &DataObject, cache_store: &DataStore) -> Result<DataObject>;

    async fn delete_cache_object(&self, object: &DataObject) -> Result<()>;
}

#[derive(Clone)]
pub struct CacheManager {
    storage: Arc<dyn CacheStorage>,
}

impl CacheManager {
    pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
        Self { storage }
    }

    /// 两端之间的拷贝是否需要暂存
    pub fn needed(src: &DataStore, dest: &DataStore) -> bool {
        if src.is_primary() && dest.is_primary() {
            return false;
        }
        let direct = |store: &DataStore| store.is_nfs() || store.role == DataStoreRole::ImageCache;
        !(direct(src) || direct(dest))
    }

    /// 暂存作用域：优先源端，扩大到可用区
    pub fn pick_cache_scope(src: &DataStore, dest: &DataStore) -> Scope {
        let scope = if src.scope.scope_id.is_some() {
            &src.scope
        } else {
            &dest.scope
        };
        scope.widen_to_zone()
    }

    /// 暂存单个对象
    pub async fn stage(&self, object: &DataObject, scope: &Scope) -> Result<StagedCopy> {
        let cache_store = self.storage.cache_store(scope).await?;
        let staged = self.storage.create_cache_object(object, &cache_store).await?;
        debug!("已在缓存存储 {} 上暂存 {}", cache_store.id, object.id());
        Ok(StagedCopy::new(self.storage.clone(), cache_store, vec![staged]))
    }

    /// 暂存整条快照链
    ///
    /// 依次为快照及其所有祖先创建缓存对象，返回守卫的主对象是链上最新的快照
    pub async fn stage_snapshot_chain(
        &self,
        snapshot: &Snapshot,
        repo: &dyn MotionRepository,
        scope: &Scope,
    ) -> Result<StagedCopy> {
        let cache_store = self.storage.cache_store(scope).await?;
        let mut staged = StagedCopy::new(self.storage.clone(), cache_store.clone(), Vec::new());

        let mut current = Some(snapshot.clone());
        while let Some(snap) = current {
            let object = DataObject::Snapshot(snap.clone());
            let cached = self.storage.create_cache_object(&object, &cache_store).await?;
            staged.objects.push(cached);

            current = match snap.parent_id.as_deref() {
                Some(parent_id) => Some(repo.get_snapshot(parent_id).await?),
                None => None,
            };
        }

        info!(
            "已暂存快照链: snapshot={}, 对象数={}, cache_store={}",
            snapshot.id,
            staged.objects.len(),
            cache_store.id
        );
        Ok(staged)
    }
}

/// 暂存副本守卫
pub struct StagedCopy {
    storage: Arc<dyn CacheStorage>,
    store: DataStore,
    /// 第一个元素是链上最新的对象
    objects: Vec<DataObject>,
    discarded: bool,
}

impl StagedCopy {
    fn new(storage: Arc<dyn CacheStorage>, store: DataStore, objects: Vec<DataObject>) -> Self {
        Self {
            storage,
            store,
            objects,
            discarded: false,
        }
    }

    /// 暂存的主对象
    pub fn leaf(&self) -> Option<&DataObject> {
        self.objects.first()
    }

    pub fn leaf_mut(&mut self) -> Option<&mut DataObject> {
        self.objects.first_mut()
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    /// 删除所有暂存对象，删除失败只记录警告
    pub async fn discard(mut self) {
        self.discarded = true;
        let objects = std::mem::take(&mut self.objects);
        discard_all(self.storage.as_ref(), objects).await;
    }
}

async fn discard_all(storage: &dyn CacheStorage, objects: Vec<DataObject>) {
    for object in objects {
        if let Err(e) = storage.delete_cache_object(&object).await {
            warn!("删除暂存对象 {} 失败: {}", object.id(), e);
        }
    }
}

impl Drop for StagedCopy {
    fn drop(&mut self) {
        if self.discarded || self.objects.is_empty() {
            return;
        }
        warn!("暂存副本未显式清理，后台删除 {} 个对象", self.objects.len());
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let storage = self.storage.clone();
            let objects = std::mem::take(&mut self.objects);
            handle.spawn(async move {
                discard_all(storage.as_ref(), objects).await;
            });
        }
    }
}

/// 内存中的镜像缓存登记表，每个可用区一个缓存存储
#[derive(Default)]
pub struct InMemoryCacheStorage {
    /// zone_id -> 缓存存储
    stores: RwLock<HashMap<String, DataStore>>,
    /// 已登记的缓存对象 ID
    objects: RwLock<HashSet<String>>,
}

impl InMemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_cache_store(&self, store: DataStore) {
        self.stores
            .write()
            .await
            .insert(store.scope.zone_id.clone(), store);
    }

    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl CacheStorage for InMemoryCacheStorage {
    async fn cache_store(&self, scope: &Scope) -> Result<DataStore> {
        self.stores
            .read()
            .await
            .get(&scope.zone_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("可用区 {} 没有镜像缓存存储", scope.zone_id)))
    }

    async fn create_cache_object(&self, object: &DataObject, cache_store: &DataStore) -> Result<DataObject> {
        let id = generate_id();
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
        self.objects.write().await.insert(id);
        Ok(cached)
    }

    async fn delete_cache_object(&self, object: &DataObject) -> Result<()> {
        if !self.objects.write().await.remove(object.id()) {
            return Err(Error::NotFound(format!("缓存对象 {}", object.id())));
        }
        Ok(())
    }
}
