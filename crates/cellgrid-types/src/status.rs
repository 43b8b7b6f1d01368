//! Read-only status snapshots exposed by the engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::PodKey;

/// Healthiness of a cell as exposed to API consumers.
///
/// A physical cell is bad when every GPU leaf under it is bad. A virtual
/// cell is bad when its bound physical cell is bad, or when it is unbound
/// and the remaining healthy physical capacity cannot cover it (doomed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellHealthiness {
    Healthy,
    Bad,
}

/// Allocation state of a physical cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellState {
    /// No group uses or acquires the cell.
    Free,
    /// A group runs on the cell.
    Used,
    /// A preemptor waits for the using group's pods to go away.
    Acquiring,
    /// A preemptor holds a previously free cell while its other victims
    /// drain.
    Acquired,
}

/// Lifecycle state of an affinity group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityGroupState {
    /// The group owns its cells and its pods may run.
    Allocated,
    /// The group waits for preemption victims to drain.
    Preempting,
    /// Another group has taken this group's cells.
    BeingPreempted,
}

/// Status of one physical cell, including its children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalCellStatus {
    pub cell_type: String,
    pub cell_address: String,
    pub level: u32,
    pub priority: i32,
    pub healthiness: CellHealthiness,
    pub state: CellState,
    /// Virtual cluster charged for the cell, if any. Set both for
    /// quota-bound cells and for opportunistic borrowings.
    pub vc: Option<String>,
    pub children: Vec<PhysicalCellStatus>,
}

/// Status of one virtual cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualCellStatus {
    pub cell_type: String,
    pub cell_address: String,
    pub level: u32,
    pub priority: i32,
    pub healthiness: CellHealthiness,
    /// Address of the bound physical cell, if bound.
    pub physical_cell: Option<String>,
}

/// Snapshot of the whole cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    /// Root cell statuses per chain, children included.
    pub physical_cluster: Vec<PhysicalCellStatus>,
    /// Per virtual cluster, the statuses of its virtual cells. Includes
    /// synthetic entries for opportunistic borrowings.
    pub virtual_clusters: BTreeMap<String, Vec<VirtualCellStatus>>,
}

/// Record left on a group that was demoted from guaranteed to
/// opportunistic instead of being killed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LazyPreemptionStatus {
    /// Name of the group that triggered the demotion.
    pub preemptor: String,
    /// Unix timestamp (seconds) of the demotion.
    pub preemption_time: u64,
}

/// Externally visible state of one affinity group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityGroupStatus {
    pub name: String,
    pub vc: String,
    pub priority: i32,
    pub state: AffinityGroupState,
    pub lazy_preemption_status: Option<LazyPreemptionStatus>,
    /// Bound pod keys per GPU count; `None` slots are unbound.
    pub pods: BTreeMap<u32, Vec<Option<PodKey>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_state_uses_snake_case() {
        let json = serde_json::to_string(&CellState::Acquiring).unwrap();
        assert_eq!(json, r#""acquiring""#);
    }

    #[test]
    fn group_state_round_trips() {
        for state in [
            AffinityGroupState::Allocated,
            AffinityGroupState::Preempting,
            AffinityGroupState::BeingPreempted,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            let back: AffinityGroupState = serde_json::from_str(&json).unwrap();
            assert_eq!(state, back);
        }
    }
}
