//! Status snapshots. Everything here derives from engine state at read
//! time; nothing is cached.

use cellgrid_topology::{PhysicalCellId, Priority, VirtualCellId};
use cellgrid_types::{AffinityGroupStatus, ClusterStatus, PhysicalCellStatus, VirtualCellStatus};

use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::Scheduler;

impl Scheduler {
    /// Snapshot of the physical cluster and every virtual cluster.
    pub fn cluster_status(&self) -> ClusterStatus {
        let mut physical_cluster = Vec::new();
        for chain in self.forest.chains() {
            for &root in &chain.roots {
                physical_cluster.push(self.physical_cell_status(root));
            }
        }
        let virtual_clusters = self
            .vc_sets
            .keys()
            .map(|vc| (vc.clone(), self.virtual_cells_of(vc)))
            .collect();
        ClusterStatus {
            physical_cluster,
            virtual_clusters,
        }
    }

    /// Virtual cell statuses of one tenant.
    pub fn virtual_cluster_status(&self, vc: &str) -> SchedulerResult<Vec<VirtualCellStatus>> {
        if !self.vc_sets.contains_key(vc) {
            return Err(SchedulerError::UnknownVirtualCluster(vc.to_string()));
        }
        Ok(self.virtual_cells_of(vc))
    }

    /// Statuses of all allocated affinity groups.
    pub fn affinity_groups(&self) -> Vec<AffinityGroupStatus> {
        self.allocated_groups.values().map(|g| g.to_status()).collect()
    }

    /// Status of one allocated affinity group.
    pub fn affinity_group(&self, name: &str) -> SchedulerResult<AffinityGroupStatus> {
        self.allocated_groups
            .get(name)
            .map(|g| g.to_status())
            .ok_or_else(|| SchedulerError::UnknownAffinityGroup(name.to_string()))
    }

    fn physical_cell_status(&self, id: PhysicalCellId) -> PhysicalCellStatus {
        let cell = self.forest.phys(id);
        let vc = cell
            .virtual_cell
            .map(|v| self.forest.virt(v).vc.clone())
            .or_else(|| cell.oppor_vc.clone());
        PhysicalCellStatus {
            cell_type: cell.cell_type.clone(),
            cell_address: cell.address.clone(),
            level: cell.level,
            priority: cell.priority.0,
            healthiness: cell.healthiness,
            state: cell.state,
            vc,
            children: cell
                .children
                .iter()
                .map(|&child| self.physical_cell_status(child))
                .collect(),
        }
    }

    fn virtual_cells_of(&self, vc: &str) -> Vec<VirtualCellStatus> {
        let mut statuses = Vec::new();
        let set = &self.vc_sets[vc];
        for levels in set.non_reserved.values() {
            for level in levels {
                for &cell in level {
                    statuses.push(self.virtual_cell_status(cell));
                }
            }
        }
        for &(root, _) in set.reserved.values() {
            self.collect_virtual_tree(root, &mut statuses);
        }
        // Opportunistic borrowings show up as synthetic virtual cells
        // carrying the borrowed physical cell's address.
        for chain in self.forest.chains() {
            for &leaf in &chain.full_list[0] {
                let cell = self.forest.phys(leaf);
                if cell.oppor_vc.as_deref() == Some(vc) {
                    statuses.push(VirtualCellStatus {
                        cell_type: cell.cell_type.clone(),
                        cell_address: cell.address.clone(),
                        level: cell.level,
                        priority: Priority::OPPORTUNISTIC.0,
                        healthiness: cell.healthiness,
                        physical_cell: Some(cell.address.clone()),
                    });
                }
            }
        }
        statuses
    }

    fn collect_virtual_tree(&self, id: VirtualCellId, out: &mut Vec<VirtualCellStatus>) {
        out.push(self.virtual_cell_status(id));
        for &child in &self.forest.virt(id).children {
            self.collect_virtual_tree(child, out);
        }
    }

    fn virtual_cell_status(&self, id: VirtualCellId) -> VirtualCellStatus {
        let cell = self.forest.virt(id);
        VirtualCellStatus {
            cell_type: cell.cell_type.clone(),
            cell_address: cell.address.clone(),
            level: cell.level,
            priority: cell.priority.0,
            healthiness: cell.healthiness,
            physical_cell: cell
                .physical_cell
                .map(|p| self.forest.phys(p).address.clone()),
        }
    }
}
