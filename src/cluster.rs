//! Logical clusters of devices.
//!
//! 中文: 设备集群：角色分配、负载均衡策略与同步状态记录。
//!
//! A cluster has exactly one primary. Its status is derived from node health
//! and never stored independently of the nodes. There is no leader election:
//! a failed primary stays primary until an operator replaces the cluster.

use crate::device::{DeviceRegistry, DeviceStatus, SessionState};
use crate::error::{Error, NotFoundError, Result, ValidationError};
use crate::events::{EventBus, HsmEvent};
use crate::store::{Record, Store};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Nodes below this score are considered unhealthy.
pub const HEALTHY_SCORE: u8 = 50;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Primary,
    Secondary,
    Backup,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Syncing,
    OutOfSync,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingPolicy {
    #[default]
    RoundRobin,
    Weighted,
    LeastConnections,
    PrimaryOnly,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Healthy,
    Degraded,
    Failed,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterStatus::Healthy => "healthy",
            ClusterStatus::Degraded => "degraded",
            ClusterStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterNode {
    pub device_id: String,
    pub role: NodeRole,
    pub weight: u32,
    pub health_score: u8,
    pub sync_status: SyncStatus,
    pub last_sync: Option<DateTime<Utc>>,
}

impl ClusterNode {
    fn is_healthy(&self) -> bool {
        self.health_score >= HEALTHY_SCORE
    }

    fn is_selectable(&self) -> bool {
        self.is_healthy() && self.sync_status != SyncStatus::OutOfSync
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub nodes: Vec<ClusterNode>,
    pub policy: LoadBalancingPolicy,
    pub status: ClusterStatus,
    pub last_sync: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    pub fn primary(&self) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.role == NodeRole::Primary)
    }

    fn node_mut(&mut self, device_id: &str) -> Option<&mut ClusterNode> {
        self.nodes.iter_mut().find(|n| n.device_id == device_id)
    }
}

impl Record for Cluster {
    const TABLE: &'static str = "clusters";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Derives cluster status from its nodes.
///
/// Failed when the primary, or every node, is unhealthy. Healthy when every
/// node is healthy and none is out of sync. Degraded otherwise.
pub fn derive_status(nodes: &[ClusterNode]) -> ClusterStatus {
    let primary_down = nodes
        .iter()
        .find(|n| n.role == NodeRole::Primary)
        .is_none_or(|p| !p.is_healthy());
    if primary_down || nodes.iter().all(|n| !n.is_healthy()) {
        return ClusterStatus::Failed;
    }
    if nodes.iter().all(|n| n.is_selectable()) {
        ClusterStatus::Healthy
    } else {
        ClusterStatus::Degraded
    }
}

fn default_weight() -> u32 {
    1
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSpec {
    pub device_id: String,
    pub role: NodeRole,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl NodeSpec {
    pub fn new(device_id: impl Into<String>, role: NodeRole) -> Self {
        Self {
            device_id: device_id.into(),
            role,
            weight: default_weight(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterSpec {
    pub name: String,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub policy: LoadBalancingPolicy,
}

#[derive(Debug)]
pub struct ClusterManager {
    store: Arc<Store>,
    devices: Arc<DeviceRegistry>,
    events: EventBus,
    cursors: DashMap<String, Arc<AtomicUsize>>,
}

impl ClusterManager {
    pub fn new(store: Arc<Store>, devices: Arc<DeviceRegistry>, events: EventBus) -> Self {
        Self {
            store,
            devices,
            events,
            cursors: DashMap::new(),
        }
    }

    pub fn create_cluster(&self, spec: ClusterSpec) -> Result<Cluster> {
        if spec.nodes.is_empty() {
            return Err(ValidationError::InvalidClusterTopology("a cluster needs at least one node".into()).into());
        }
        let primaries = spec.nodes.iter().filter(|n| n.role == NodeRole::Primary).count();
        if primaries != 1 {
            return Err(ValidationError::InvalidClusterTopology(format!(
                "exactly one primary node is required, found {primaries}"
            ))
            .into());
        }
        let mut seen = BTreeSet::new();
        for node in &spec.nodes {
            if !seen.insert(node.device_id.as_str()) {
                return Err(ValidationError::InvalidClusterTopology(format!(
                    "device {} appears more than once",
                    node.device_id
                ))
                .into());
            }
            self.devices.require_online(&node.device_id)?;
        }

        let now = Utc::now();
        let nodes: Vec<ClusterNode> = spec
            .nodes
            .into_iter()
            .map(|n| ClusterNode {
                device_id: n.device_id,
                role: n.role,
                weight: n.weight,
                health_score: 100,
                sync_status: SyncStatus::Synced,
                last_sync: Some(now),
            })
            .collect();
        let cluster = Cluster {
            id: Uuid::new_v4().to_string(),
            name: spec.name,
            status: derive_status(&nodes),
            nodes,
            policy: spec.policy,
            last_sync: Some(now),
            created_at: now,
            updated_at: now,
        };
        self.store.clusters.insert(cluster.clone())?;

        tracing::info!(cluster_id = %cluster.id, name = %cluster.name, nodes = cluster.nodes.len(), "cluster created");
        self.events.publish(HsmEvent::ClusterCreated {
            cluster_id: cluster.id.clone(),
            name: cluster.name.clone(),
            status: cluster.status,
        });
        Ok(cluster)
    }

    pub fn get_cluster(&self, cluster_id: &str) -> Result<Cluster> {
        self.store
            .clusters
            .get(cluster_id)
            .ok_or_else(|| NotFoundError::Cluster(cluster_id.to_string()).into())
    }

    pub fn list_clusters(&self) -> Vec<Cluster> {
        let mut clusters = self.store.clusters.values();
        clusters.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        clusters
    }

    pub fn update_node_health(&self, cluster_id: &str, device_id: &str, score: u8) -> Result<Cluster> {
        if score > 100 {
            return Err(ValidationError::InvalidHealthScore(score).into());
        }
        self.modify_node(cluster_id, device_id, |node, _| node.health_score = score)
    }

    /// Records a sync state change for one node. `Synced` also stamps the
    /// node and the cluster with the sync time.
    pub fn record_sync(&self, cluster_id: &str, device_id: &str, status: SyncStatus) -> Result<Cluster> {
        self.modify_node(cluster_id, device_id, |node, now| {
            node.sync_status = status;
            if status == SyncStatus::Synced {
                node.last_sync = Some(now);
            }
        })
    }

    /// Picks the node that should serve the next request.
    pub fn select_node(&self, cluster_id: &str) -> Result<ClusterNode> {
        let cluster = self.get_cluster(cluster_id)?;
        let candidates: Vec<&ClusterNode> = cluster
            .nodes
            .iter()
            .filter(|n| n.is_selectable())
            .filter(|n| self.devices.require_online(&n.device_id).is_ok())
            .collect();
        let no_node = || Error::from(ValidationError::NoAvailableNode(cluster.id.clone()));

        let chosen = match cluster.policy {
            LoadBalancingPolicy::PrimaryOnly => candidates
                .iter()
                .find(|n| n.role == NodeRole::Primary)
                .copied(),
            LoadBalancingPolicy::RoundRobin => {
                if candidates.is_empty() {
                    None
                } else {
                    let turn = self.cursor(&cluster.id).fetch_add(1, Ordering::Relaxed);
                    Some(candidates[turn % candidates.len()])
                }
            }
            LoadBalancingPolicy::Weighted => {
                let total: u64 = candidates.iter().map(|n| u64::from(n.weight)).sum();
                if total == 0 {
                    None
                } else {
                    let turn = self.cursor(&cluster.id).fetch_add(1, Ordering::Relaxed) as u64;
                    let mut point = turn % total;
                    candidates.iter().copied().find(|n| {
                        let weight = u64::from(n.weight);
                        if point < weight {
                            true
                        } else {
                            point -= weight;
                            false
                        }
                    })
                }
            }
            LoadBalancingPolicy::LeastConnections => candidates.iter().copied().min_by_key(|n| {
                self.store.sessions.count(|s| {
                    s.device_id == n.device_id && s.state == SessionState::Open
                })
            }),
        };

        chosen.cloned().ok_or_else(no_node)
    }

    /// Folds a device health probe into every cluster that contains the
    /// device.
    pub fn apply_device_status(&self, device_id: &str, status: DeviceStatus) -> Result<()> {
        let score = match status {
            DeviceStatus::Online => 100,
            DeviceStatus::Maintenance => HEALTHY_SCORE,
            DeviceStatus::Offline | DeviceStatus::Error => 0,
        };
        let clusters = self
            .store
            .clusters
            .filter(|c| c.nodes.iter().any(|n| n.device_id == device_id));
        for cluster in clusters {
            self.update_node_health(&cluster.id, device_id, score)?;
        }
        Ok(())
    }

    fn cursor(&self, cluster_id: &str) -> Arc<AtomicUsize> {
        self.cursors
            .entry(cluster_id.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }

    fn modify_node<F>(&self, cluster_id: &str, device_id: &str, f: F) -> Result<Cluster>
    where
        F: FnOnce(&mut ClusterNode, DateTime<Utc>),
    {
        let mut previous = None;
        let cluster = self
            .store
            .clusters
            .try_update(cluster_id, |c| {
                let now = Utc::now();
                let node = c.node_mut(device_id).ok_or_else(|| {
                    Error::from(NotFoundError::ClusterNode {
                        cluster_id: cluster_id.to_string(),
                        device_id: device_id.to_string(),
                    })
                })?;
                f(node, now);
                let synced_at = node.last_sync.filter(|_| node.sync_status == SyncStatus::Synced);
                c.last_sync = c.last_sync.max(synced_at);
                previous = Some(c.status);
                c.status = derive_status(&c.nodes);
                c.updated_at = now;
                Ok::<(), Error>(())
            })?
            .ok_or_else(|| NotFoundError::Cluster(cluster_id.to_string()))?;

        if let Some(from) = previous.filter(|from| *from != cluster.status) {
            tracing::warn!(cluster_id, %from, to = %cluster.status, "cluster status changed");
            self.events.publish(HsmEvent::ClusterStatusChanged {
                cluster_id: cluster_id.to_string(),
                from,
                to: cluster.status,
            });
        }
        Ok(cluster)
    }
}
