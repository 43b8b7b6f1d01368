//! Assembly of pod schedule results.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use cellgrid_topology::{CellForest, PhysicalCellId};
use cellgrid_types::{
    CellState, MemberBindInfo, PodBindInfo, PodPlacementInfo, PodScheduleResult,
};

use crate::group::{PhysicalPlacement, VirtualPlacement};
use crate::scheduler::Scheduler;

impl Scheduler {
    /// Pods that must be evicted before the placement can be used:
    /// every bound pod of every group still running on the placement's
    /// cells, grouped by node. A gang waits for all of them.
    pub(crate) fn collect_preemption_victims(
        &self,
        placement: &PhysicalPlacement,
    ) -> BTreeMap<String, BTreeSet<String>> {
        let mut victims: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for cell in crate::scheduler::placement_cells(placement) {
            let cell = self.forest.phys(cell);
            if !matches!(cell.state, CellState::Used | CellState::Acquiring) {
                continue;
            }
            let Some(name) = &cell.using_group else {
                continue;
            };
            let Some(group) = self.allocated_groups.get(name) else {
                continue;
            };
            for pod in group.allocated_pods.values().flatten().flatten() {
                victims
                    .entry(pod.node.clone())
                    .or_default()
                    .insert(pod.key.clone());
            }
        }
        victims
    }
}

/// Turn a placement decision into the result handed back to the host:
/// a preemption order, a wait, or a bind instruction carrying the whole
/// group's placement.
#[allow(clippy::too_many_arguments)]
pub(crate) fn generate_pod_schedule_result(
    forest: &CellForest,
    physical: Option<&PhysicalPlacement>,
    virtual_: Option<&VirtualPlacement>,
    victims: &BTreeMap<String, BTreeSet<String>>,
    gpu_number: u32,
    pod_index: usize,
    suggested: &BTreeSet<String>,
    group_name: &str,
) -> PodScheduleResult {
    if !victims.is_empty() {
        info!(group = group_name, victims = victims.len(), "preemption required");
        return PodScheduleResult::Preempt {
            victims: victims.clone(),
        };
    }
    let Some(physical) = physical else {
        return PodScheduleResult::Wait {
            reason: format!("no free cells for affinity group {group_name}"),
        };
    };

    let pod_cells: Vec<PhysicalCellId> = physical
        .get(&gpu_number)
        .and_then(|pods| pods.get(pod_index))
        .map(|pod| pod.iter().flatten().copied().collect())
        .unwrap_or_default();
    let Some(&first) = pod_cells.first() else {
        return PodScheduleResult::Wait {
            reason: format!("placement for the pod not found in group {group_name}"),
        };
    };
    let node = forest.phys(first).nodes[0].clone();
    if !suggested.contains(&node) {
        debug!(group = group_name, node = %node, "picked node is not suggested, waiting");
        return PodScheduleResult::Wait {
            reason: format!("picked node {node} is not within the suggested nodes"),
        };
    }

    let gpu_isolation: Vec<u32> = pod_cells
        .iter()
        .map(|&leaf| forest.phys(leaf).gpu_indices[0])
        .collect();
    let cell_chain = forest.phys(first).chain.clone();

    let mut members = Vec::new();
    for (gpus, pods) in physical {
        let mut pod_placements = Vec::new();
        for (i, pod) in pods.iter().enumerate() {
            let mut physical_node = String::new();
            let mut physical_gpu_indices = Vec::new();
            let mut preassigned_cell_types = Vec::new();
            for (j, cell) in pod.iter().enumerate() {
                let Some(leaf) = cell else { continue };
                if physical_node.is_empty() {
                    physical_node = forest.phys(*leaf).nodes[0].clone();
                }
                physical_gpu_indices.push(forest.phys(*leaf).gpu_indices[0]);
                let cell_type = virtual_
                    .and_then(|vp| vp.get(gpus))
                    .and_then(|pods| pods.get(i))
                    .and_then(|pod| pod.get(j))
                    .and_then(|v| *v)
                    .map(|v| {
                        let preassigned = forest.virt(v).preassigned;
                        forest.virt(preassigned).cell_type.clone()
                    })
                    .unwrap_or_default();
                preassigned_cell_types.push(cell_type);
            }
            pod_placements.push(PodPlacementInfo {
                physical_node,
                physical_gpu_indices,
                preassigned_cell_types,
            });
        }
        members.push(MemberBindInfo { pod_placements });
    }

    PodScheduleResult::Bind {
        bind_info: PodBindInfo {
            node,
            gpu_isolation,
            cell_chain,
            affinity_group_bind_info: members,
        },
    }
}
