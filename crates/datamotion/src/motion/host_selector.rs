/// 执行主机选择
///
/// 候选主机随机打乱后取第一个可用主机，需要重签名时跳过不支持重签名的集群

use common::models::{HypervisorType, ResourceState};
use common::{Error, Result};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::object::{DataStore, Host, Snapshot};
use super::repository::MotionRepository;

#[derive(Clone)]
pub struct HostSelector {
    repo: Arc<dyn MotionRepository>,
}

fn shuffled(mut hosts: Vec<Host>) -> Vec<Host> {
    hosts.shuffle(&mut rand::thread_rng());
    hosts
}

impl HostSelector {
    pub fn new(repo: Arc<dyn MotionRepository>) -> Self {
        Self { repo }
    }

    /// 为存储上的对象选择主机
    ///
    /// 主存储只考虑能连接该存储的主机，其他存储考虑可用区内同类型主机
    pub async fn select_host(
        &self,
        zone_id: &str,
        store: &DataStore,
        hypervisor: HypervisorType,
        require_resign: bool,
    ) -> Result<Option<Host>> {
        let candidates = if store.is_primary() {
            self.repo.hosts_for_store(store, Some(hypervisor)).await?
        } else {
            self.repo.hosts_in_zone(zone_id, hypervisor).await?
        };
        self.pick(candidates, require_resign).await
    }

    /// 从候选列表中挑选主机
    pub async fn pick(&self, candidates: Vec<Host>, require_resign: bool) -> Result<Option<Host>> {
        let mut rejected_clusters: HashSet<String> = HashSet::new();

        for host in shuffled(candidates) {
            if host.resource_state != ResourceState::Enabled {
                continue;
            }
            if !require_resign {
                return Ok(Some(host));
            }
            if rejected_clusters.contains(&host.cluster_id) {
                continue;
            }
            if self.repo.cluster_supports_resign(&host.cluster_id).await? {
                return Ok(Some(host));
            }
            debug!("集群 {} 不支持重签名，跳过", host.cluster_id);
            rejected_clusters.insert(host.cluster_id.clone());
        }
        Ok(None)
    }

    /// 存储池所在集群（或作用域）内的任一可用主机
    pub async fn host_in_cluster(&self, store: &DataStore) -> Result<Host> {
        let candidates = self.repo.hosts_for_store(store, None).await?;
        shuffled(candidates)
            .into_iter()
            .find(|h| h.resource_state == ResourceState::Enabled)
            .ok_or_else(|| Error::NoHostAvailable(format!("存储池 {} 没有可用主机", store.id)))
    }

    /// 处理快照的主机
    ///
    /// XenServer 优先选择支持重签名的集群，找不到时退回任意主机
    pub async fn host_for_snapshot(&self, snapshot: &Snapshot, store: &DataStore) -> Result<Host> {
        let zone = &snapshot.zone_id;
        let host = match snapshot.hypervisor {
            HypervisorType::XenServer => {
                match self
                    .select_host(zone, store, HypervisorType::XenServer, true)
                    .await?
                {
                    Some(host) => Some(host),
                    None => {
                        self.select_host(zone, store, HypervisorType::XenServer, false)
                            .await?
                    }
                }
            }
            HypervisorType::VMware | HypervisorType::Kvm => {
                self.select_host(zone, store, snapshot.hypervisor, false).await?
            }
            other => {
                return Err(Error::Unsupported(format!(
                    "快照所在的虚拟化类型 {} 不受支持",
                    other
                )))
            }
        };
        host.ok_or_else(|| Error::NoHostAvailable(format!("可用区 {} 中没有合适的主机", zone)))
    }

    /// KVM 卷迁移主机
    ///
    /// 主机级存储池固定主机，否则优先源池所在集群，最后任意能访问目标池的 KVM 主机
    pub async fn migration_host(&self, src: &DataStore, dest: &DataStore, zone_id: &str) -> Result<Host> {
        for store in [src, dest] {
            if let Some(host_id) = store.host_id() {
                return self.repo.get_host(host_id).await;
            }
        }
        if src.cluster_id().is_some() {
            return self.host_in_cluster(src).await;
        }
        self.select_host(zone_id, dest, HypervisorType::Kvm, false)
            .await?
            .ok_or_else(|| {
                Error::NoHostAvailable(format!("没有能访问存储池 {} 的 KVM 主机", dest.id))
            })
    }
}
