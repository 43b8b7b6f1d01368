//! Per-call scheduling inputs and outputs.
//!
//! The host daemon extracts a [`PodSchedulingSpec`] from each incoming
//! pod and feeds it to the engine together with the pod key. On bind it
//! reports back the [`PodBindInfo`] the engine originally emitted, which
//! makes pod admission self-contained reconciliation (the engine never
//! assumes it produced the placement it is being told about).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::PodKey;

/// Scheduling constraints carried by one pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSchedulingSpec {
    /// Owning virtual cluster.
    pub virtual_cluster: String,
    /// Priority. Negative values are opportunistic; values >= 0 are
    /// guaranteed and eligible for quota and preemption.
    pub priority: i32,
    /// Requested GPU type. None means any chain may serve the pod.
    #[serde(default)]
    pub gpu_type: Option<String>,
    /// GPUs requested by this pod.
    pub gpu_number: u32,
    /// Reservation to schedule into, if any.
    #[serde(default)]
    pub reservation_id: Option<String>,
    /// Release the whole gang when one pod is released.
    #[serde(default)]
    pub gang_release_enable: bool,
    /// Allow this group to be demoted to opportunistic instead of being
    /// killed when a higher-priority group wants its cells.
    #[serde(default)]
    pub lazy_preemption_enable: bool,
    /// The gang this pod belongs to.
    pub affinity_group: AffinityGroupSpec,
}

/// A gang of pods scheduled together with topology affinity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityGroupSpec {
    /// Group name, unique across the cluster.
    pub name: String,
    /// Member descriptions. Members with the same GPU count are merged.
    pub members: Vec<AffinityGroupMember>,
}

/// One member class of an affinity group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AffinityGroupMember {
    /// GPUs per pod in this class.
    pub gpu_number: u32,
    /// Number of pods in this class.
    pub pod_number: u32,
}

/// Physical placement of one bound pod, reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodBindInfo {
    /// Node the pod is bound to.
    pub node: String,
    /// GPU indices isolated for the pod on that node.
    pub gpu_isolation: Vec<u32>,
    /// Chain the placement was computed in.
    pub cell_chain: String,
    /// Placement of the whole group, one entry per member class.
    pub affinity_group_bind_info: Vec<MemberBindInfo>,
}

/// Group placement for one member class (one GPU count).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberBindInfo {
    /// One entry per pod of this class.
    pub pod_placements: Vec<PodPlacementInfo>,
}

/// Placement of a single pod within a group bind info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodPlacementInfo {
    pub physical_node: String,
    pub physical_gpu_indices: Vec<u32>,
    /// Per GPU, the cell type of the quota unit it was charged to.
    /// Empty string for opportunistic placements.
    pub preassigned_cell_types: Vec<String>,
}

/// Outcome of one `schedule` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PodScheduleResult {
    /// Bind the pod as instructed.
    Bind { bind_info: PodBindInfo },
    /// Evict the listed victim pods first, then retry the pod.
    Preempt {
        /// Victim pod keys grouped by node.
        victims: BTreeMap<String, BTreeSet<PodKey>>,
    },
    /// Nothing to do right now; retry later.
    Wait { reason: String },
}

impl PodScheduleResult {
    pub fn is_wait(&self) -> bool {
        matches!(self, PodScheduleResult::Wait { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_result_serializes_with_outcome_tag() {
        let r = PodScheduleResult::Wait {
            reason: "cluster full".to_string(),
        };
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains(r#""outcome":"wait""#));
    }

    #[test]
    fn spec_defaults_are_lenient() {
        let json = r#"{
            "virtual_cluster": "tenant-a",
            "priority": 1,
            "gpu_number": 2,
            "affinity_group": { "name": "g1", "members": [{ "gpu_number": 2, "pod_number": 1 }] }
        }"#;
        let spec: PodSchedulingSpec = serde_json::from_str(json).unwrap();
        assert!(spec.gpu_type.is_none());
        assert!(spec.reservation_id.is_none());
        assert!(!spec.lazy_preemption_enable);
    }
}
