//! Shared handle enforcing the engine's lock discipline.
//!
//! The engine is a single-writer state machine. `SharedScheduler` puts
//! it behind one `RwLock`: every mutating entry point takes the write
//! side, status queries take the read side. No lock is held across
//! await points or I/O because the engine has neither.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use cellgrid_types::config::ConfigError;
use cellgrid_types::{
    AffinityGroupStatus, ClusterStatus, PodBindInfo, PodScheduleResult, PodSchedulingSpec,
    SchedulerConfig, VirtualCellStatus,
};

use crate::error::SchedulerResult;
use crate::scheduler::Scheduler;

/// Cloneable, thread-safe handle to one scheduler engine.
#[derive(Clone)]
pub struct SharedScheduler {
    inner: Arc<RwLock<Scheduler>>,
}

impl SharedScheduler {
    pub fn new(config: &SchedulerConfig) -> Result<SharedScheduler, ConfigError> {
        Ok(SharedScheduler {
            inner: Arc::new(RwLock::new(Scheduler::new(config)?)),
        })
    }

    /// Wrap an already built engine.
    pub fn from_engine(engine: Scheduler) -> SharedScheduler {
        SharedScheduler {
            inner: Arc::new(RwLock::new(engine)),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Scheduler> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> RwLockReadGuard<'_, Scheduler> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Mutating entry points (write side) ──────────────────────────

    pub fn schedule(
        &self,
        pod_key: &str,
        spec: &PodSchedulingSpec,
        suggested_nodes: &[String],
    ) -> SchedulerResult<PodScheduleResult> {
        self.write().schedule(pod_key, spec, suggested_nodes)
    }

    pub fn add_allocated_pod(&self, pod_key: &str, spec: &PodSchedulingSpec, info: &PodBindInfo) {
        self.write().add_allocated_pod(pod_key, spec, info);
    }

    pub fn delete_allocated_pod(&self, pod_key: &str, spec: &PodSchedulingSpec, info: &PodBindInfo) {
        self.write().delete_allocated_pod(pod_key, spec, info);
    }

    pub fn add_unallocated_pod(&self, pod_key: &str, spec: &PodSchedulingSpec) {
        self.write().add_unallocated_pod(pod_key, spec);
    }

    pub fn delete_unallocated_pod(&self, pod_key: &str, spec: &PodSchedulingSpec) {
        self.write().delete_unallocated_pod(pod_key, spec);
    }

    pub fn add_node(&self, node: &str, healthy: bool) {
        self.write().add_node(node, healthy);
    }

    pub fn update_node(&self, node: &str, healthy: bool) {
        self.write().update_node(node, healthy);
    }

    pub fn delete_node(&self, node: &str) {
        self.write().delete_node(node);
    }

    // ── Status queries (read side) ──────────────────────────────────

    pub fn cluster_status(&self) -> ClusterStatus {
        self.read().cluster_status()
    }

    pub fn virtual_cluster_status(&self, vc: &str) -> SchedulerResult<Vec<VirtualCellStatus>> {
        self.read().virtual_cluster_status(vc)
    }

    pub fn affinity_groups(&self) -> Vec<AffinityGroupStatus> {
        self.read().affinity_groups()
    }

    pub fn affinity_group(&self, name: &str) -> SchedulerResult<AffinityGroupStatus> {
        self.read().affinity_group(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellgrid_types::config::{ChainSpec, LevelSpec, RootCellSpec};
    use std::collections::BTreeMap;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            chains: vec![ChainSpec {
                name: "V100".to_string(),
                gpu_type: "V100".to_string(),
                levels: vec![
                    LevelSpec {
                        cell_type: "V100".to_string(),
                        child_count: 0,
                        is_node_level: false,
                    },
                    LevelSpec {
                        cell_type: "V100-node".to_string(),
                        child_count: 2,
                        is_node_level: true,
                    },
                ],
            }],
            physical_cluster: vec![RootCellSpec {
                chain: "V100".to_string(),
                nodes: vec!["n1".to_string()],
            }],
            virtual_clusters: BTreeMap::new(),
        }
    }

    #[test]
    fn handle_is_cloneable_and_queryable_across_threads() {
        let shared = SharedScheduler::new(&config()).unwrap();
        shared.add_node("n1", true);

        let other = shared.clone();
        let handle = std::thread::spawn(move || other.cluster_status());
        let status = handle.join().unwrap();
        assert_eq!(status.physical_cluster.len(), 1);
    }

    #[test]
    fn unknown_vc_query_is_an_error() {
        let shared = SharedScheduler::new(&config()).unwrap();
        assert!(shared.virtual_cluster_status("nope").is_err());
    }
}
