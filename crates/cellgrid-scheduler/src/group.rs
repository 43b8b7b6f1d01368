//! Affinity group state held by the engine.

use std::collections::{BTreeMap, BTreeSet};

use cellgrid_topology::{PhysicalCellId, VirtualCellId};
use cellgrid_types::{
    AffinityGroupState, AffinityGroupStatus, LazyPreemptionStatus, PodBindInfo, PodKey,
    PodSchedulingSpec,
};

/// Group placement in the physical cluster: GPU count per pod -> pods
/// -> per-GPU cell. `None` marks a GPU the engine could not account for
/// (external drift).
pub type PhysicalPlacement = BTreeMap<u32, Vec<Vec<Option<PhysicalCellId>>>>;

/// Group placement in the owning VC, same shape as the physical one.
pub type VirtualPlacement = BTreeMap<u32, Vec<Vec<Option<VirtualCellId>>>>;

/// A pod bound into one of the group's slots.
#[derive(Debug, Clone)]
pub struct AllocatedPod {
    pub key: PodKey,
    pub node: String,
}

/// A gang of pods tracked by the engine, together with the cells it
/// owns (or is acquiring).
#[derive(Debug)]
pub struct AffinityGroup {
    pub name: String,
    pub vc: String,
    pub priority: i32,
    pub gang_release_enable: bool,
    pub lazy_preemption_enable: bool,
    pub state: AffinityGroupState,
    /// GPU count -> expected pods of that class.
    pub total_pod_nums: BTreeMap<u32, u32>,
    /// GPU count -> pod slots. A slot is `None` until its pod binds.
    pub allocated_pods: BTreeMap<u32, Vec<Option<AllocatedPod>>>,
    pub physical_placement: PhysicalPlacement,
    /// `None` for opportunistic groups and after lazy preemption.
    pub virtual_placement: Option<VirtualPlacement>,
    pub lazy_preemption_status: Option<LazyPreemptionStatus>,
    /// Pods of a preempting group that have been scheduled but not yet
    /// bound. Only non-empty while the group is Preempting.
    pub preemptor_pods: BTreeSet<PodKey>,
}

impl AffinityGroup {
    /// Create a group shell from a scheduling spec. Members with the
    /// same GPU count are merged; placements start empty-shaped.
    pub fn from_spec(spec: &PodSchedulingSpec, state: AffinityGroupState) -> AffinityGroup {
        let mut total_pod_nums: BTreeMap<u32, u32> = BTreeMap::new();
        for member in &spec.affinity_group.members {
            *total_pod_nums.entry(member.gpu_number).or_insert(0) += member.pod_number;
        }

        let mut allocated_pods = BTreeMap::new();
        let mut physical_placement = BTreeMap::new();
        let mut virtual_placement = BTreeMap::new();
        for (&gpus, &pods) in &total_pod_nums {
            allocated_pods.insert(gpus, vec![None; pods as usize]);
            physical_placement.insert(gpus, vec![vec![None; gpus as usize]; pods as usize]);
            virtual_placement.insert(gpus, vec![vec![None; gpus as usize]; pods as usize]);
        }

        AffinityGroup {
            name: spec.affinity_group.name.clone(),
            vc: spec.virtual_cluster.clone(),
            priority: spec.priority,
            gang_release_enable: spec.gang_release_enable,
            lazy_preemption_enable: spec.lazy_preemption_enable,
            state,
            total_pod_nums,
            allocated_pods,
            physical_placement,
            virtual_placement: Some(virtual_placement),
            lazy_preemption_status: None,
            preemptor_pods: BTreeSet::new(),
        }
    }

    /// Index of the first unbound slot for the given GPU count.
    pub fn first_free_slot(&self, gpu_number: u32) -> Option<usize> {
        self.allocated_pods
            .get(&gpu_number)?
            .iter()
            .position(Option::is_none)
    }

    /// True once every pod slot has been released.
    pub fn all_pods_released(&self) -> bool {
        self.allocated_pods
            .values()
            .all(|slots| slots.iter().all(Option::is_none))
    }

    /// Number of pods still bound. Used to rank preemption victims.
    pub fn pods_left(&self) -> u32 {
        self.allocated_pods
            .values()
            .flatten()
            .filter(|slot| slot.is_some())
            .count() as u32
    }

    pub fn to_status(&self) -> AffinityGroupStatus {
        AffinityGroupStatus {
            name: self.name.clone(),
            vc: self.vc.clone(),
            priority: self.priority,
            state: self.state,
            lazy_preemption_status: self.lazy_preemption_status.clone(),
            pods: self
                .allocated_pods
                .iter()
                .map(|(&gpus, slots)| {
                    (
                        gpus,
                        slots
                            .iter()
                            .map(|s| s.as_ref().map(|p| p.key.clone()))
                            .collect(),
                    )
                })
                .collect(),
        }
    }
}

/// Find the slot index of a bound pod by matching its node and GPU
/// indices against the group bind info it carries.
pub fn allocated_pod_index(info: &PodBindInfo, gpu_number: u32) -> Option<usize> {
    let member = info.affinity_group_bind_info.iter().find(|m| {
        m.pod_placements
            .first()
            .is_some_and(|p| p.physical_gpu_indices.len() == gpu_number as usize)
    })?;
    member.pod_placements.iter().position(|p| {
        p.physical_node == info.node && p.physical_gpu_indices == info.gpu_isolation
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellgrid_types::{AffinityGroupMember, AffinityGroupSpec, MemberBindInfo, PodPlacementInfo};

    fn spec(members: Vec<AffinityGroupMember>) -> PodSchedulingSpec {
        PodSchedulingSpec {
            virtual_cluster: "tenant-a".to_string(),
            priority: 1,
            gpu_type: None,
            gpu_number: members[0].gpu_number,
            reservation_id: None,
            gang_release_enable: false,
            lazy_preemption_enable: false,
            affinity_group: AffinityGroupSpec {
                name: "g1".to_string(),
                members,
            },
        }
    }

    #[test]
    fn members_with_same_gpu_count_are_merged() {
        let g = AffinityGroup::from_spec(
            &spec(vec![
                AffinityGroupMember {
                    gpu_number: 2,
                    pod_number: 1,
                },
                AffinityGroupMember {
                    gpu_number: 2,
                    pod_number: 2,
                },
            ]),
            AffinityGroupState::Allocated,
        );
        assert_eq!(g.total_pod_nums[&2], 3);
        assert_eq!(g.allocated_pods[&2].len(), 3);
        assert_eq!(g.physical_placement[&2].len(), 3);
        assert_eq!(g.physical_placement[&2][0].len(), 2);
    }

    #[test]
    fn slot_helpers() {
        let mut g = AffinityGroup::from_spec(
            &spec(vec![AffinityGroupMember {
                gpu_number: 1,
                pod_number: 2,
            }]),
            AffinityGroupState::Allocated,
        );
        assert_eq!(g.first_free_slot(1), Some(0));
        assert!(g.all_pods_released());
        assert_eq!(g.pods_left(), 0);

        g.allocated_pods.get_mut(&1).unwrap()[0] = Some(AllocatedPod {
            key: "ns/p0".to_string(),
            node: "n1".to_string(),
        });
        assert_eq!(g.first_free_slot(1), Some(1));
        assert!(!g.all_pods_released());
        assert_eq!(g.pods_left(), 1);

        g.allocated_pods.get_mut(&1).unwrap()[1] = Some(AllocatedPod {
            key: "ns/p1".to_string(),
            node: "n1".to_string(),
        });
        assert_eq!(g.first_free_slot(1), None);
    }

    #[test]
    fn allocated_pod_index_matches_node_and_gpus() {
        let info = PodBindInfo {
            node: "n2".to_string(),
            gpu_isolation: vec![0, 1],
            cell_chain: "V100".to_string(),
            affinity_group_bind_info: vec![MemberBindInfo {
                pod_placements: vec![
                    PodPlacementInfo {
                        physical_node: "n1".to_string(),
                        physical_gpu_indices: vec![0, 1],
                        preassigned_cell_types: vec![String::new(), String::new()],
                    },
                    PodPlacementInfo {
                        physical_node: "n2".to_string(),
                        physical_gpu_indices: vec![0, 1],
                        preassigned_cell_types: vec![String::new(), String::new()],
                    },
                ],
            }],
        };
        assert_eq!(allocated_pod_index(&info, 2), Some(1));
        assert_eq!(allocated_pod_index(&info, 4), None);
    }
}
