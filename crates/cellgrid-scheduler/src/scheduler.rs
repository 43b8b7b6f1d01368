//! The scheduling facade.
//!
//! `Scheduler` is the single-writer state machine behind every entry
//! point: scheduling, pod admission and release, node health changes,
//! and status queries. One call is atomic from the outside; nothing
//! here suspends or performs I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use cellgrid_topology::{
    CellForest, CellRef, FreeList, PhysicalCellId, Priority, VcCellSet, VirtualCellId,
};
use cellgrid_types::config::ConfigError;
use cellgrid_types::{
    AffinityGroupState, CellState, LazyPreemptionStatus, PodBindInfo, PodPlacementInfo,
    PodScheduleResult, PodSchedulingSpec, SchedulerConfig,
};

use crate::error::{SchedulerError, SchedulerResult};
use crate::group::{
    allocated_pod_index, AffinityGroup, AllocatedPod, PhysicalPlacement, VirtualPlacement,
};
use crate::{intra_vc, packer, result};

/// Internal form of one scheduling attempt.
#[derive(Debug)]
pub(crate) struct SchedulingRequest {
    pub vc: String,
    pub reservation_id: Option<String>,
    pub priority: Priority,
    pub group_name: String,
    /// GPU count -> pods, members with equal counts merged.
    pub pod_gpu_counts: BTreeMap<u32, u32>,
    /// Chain under consideration; set per attempt.
    pub chain: String,
}

/// The cell-based placement and preemption engine.
pub struct Scheduler {
    pub(crate) forest: CellForest,
    pub(crate) free_lists: BTreeMap<String, FreeList>,
    pub(crate) vc_sets: BTreeMap<String, VcCellSet>,
    pub(crate) allocated_groups: BTreeMap<String, AffinityGroup>,
    pub(crate) preemptor_groups: BTreeMap<String, AffinityGroup>,

    // The five counters, keyed by (chain, level) or (vc, chain, level).
    // They move together with the free-list structure; a discrepancy
    // between any of them is a bug.
    pub(crate) vc_free: BTreeMap<(String, String, u32), i32>,
    pub(crate) all_vc_free: BTreeMap<(String, u32), i32>,
    pub(crate) total_left: BTreeMap<(String, u32), i32>,
    pub(crate) bad_free: BTreeMap<(String, u32), i32>,
    pub(crate) vc_doomed_bad: BTreeMap<(String, String, u32), i32>,

    pub(crate) bad_nodes: BTreeSet<String>,
    /// (chain, level) pairs where a safety violation has been reported.
    pub(crate) broken_safety: BTreeSet<(String, u32)>,
}

impl Scheduler {
    /// Build the engine from a config. Fails when the config is
    /// structurally invalid or the physical cluster cannot back the
    /// configured VC quotas.
    pub fn new(config: &SchedulerConfig) -> Result<Scheduler, ConfigError> {
        let (forest, vc_sets) = CellForest::build(config)?;

        let mut free_lists = BTreeMap::new();
        for chain in forest.chains() {
            let mut list = FreeList::new(chain.top_level());
            for &root in &chain.roots {
                list.push(chain.top_level(), root);
            }
            free_lists.insert(chain.name.clone(), list);
        }

        let mut scheduler = Scheduler {
            forest,
            free_lists,
            vc_sets,
            allocated_groups: BTreeMap::new(),
            preemptor_groups: BTreeMap::new(),
            vc_free: BTreeMap::new(),
            all_vc_free: BTreeMap::new(),
            total_left: BTreeMap::new(),
            bad_free: BTreeMap::new(),
            vc_doomed_bad: BTreeMap::new(),
            bad_nodes: BTreeSet::new(),
            broken_safety: BTreeSet::new(),
        };
        scheduler.init_vc_free(config);
        scheduler.init_cell_counts()?;
        scheduler.init_reservations()?;
        scheduler.init_bad_nodes();
        info!(
            chains = scheduler.free_lists.len(),
            vcs = scheduler.vc_sets.len(),
            "scheduler engine constructed"
        );
        Ok(scheduler)
    }

    /// Seed `vcFree` from the configured quotas. Reserved cells count
    /// here too; `init_reservations` cashes them out again.
    fn init_vc_free(&mut self, config: &SchedulerConfig) {
        for (vc, spec) in &config.virtual_clusters {
            for quota in &spec.cells {
                let level = self
                    .forest
                    .chain(&quota.chain)
                    .level_of_type(&quota.cell_type)
                    .expect("validated by CellForest::build");
                *self
                    .vc_free
                    .entry((vc.clone(), quota.chain.clone(), level))
                    .or_insert(0) += quota.count as i32;
            }
        }
        let reserved: Vec<(String, String, u32)> = self
            .vc_sets
            .iter()
            .flat_map(|(vc, set)| {
                set.reserved.values().map(|&(_, pid)| {
                    let cell = self.forest.phys(pid);
                    (vc.clone(), cell.chain.clone(), cell.level)
                })
            })
            .collect();
        for (vc, chain, level) in reserved {
            *self.vc_free.entry((vc, chain, level)).or_insert(0) += 1;
        }
    }

    /// Initialize `allVCFree`, `totalLeft`, `badFree` and `doomedBad`,
    /// validating that the physical cluster can back every quota.
    fn init_cell_counts(&mut self) -> Result<(), ConfigError> {
        for ((_, chain, level), count) in self.vc_free.clone() {
            *self.all_vc_free.entry((chain, level)).or_insert(0) += count;
        }
        for ((vc, chain, level), _) in self.vc_free.clone() {
            self.vc_doomed_bad.insert((vc, chain, level), 0);
        }

        let chains: Vec<String> = self.forest.chain_names().map(str::to_string).collect();
        for chain_name in chains {
            let chain = self.forest.chain(&chain_name);
            let top = chain.top_level();
            let fanouts: Vec<u32> = (1..=top).map(|l| chain.fanout(l)).collect();
            let roots = chain.roots.len() as i32;

            let mut available = roots;
            self.total_left.insert((chain_name.clone(), top), roots);
            self.bad_free.insert((chain_name.clone(), top), 0);
            for level in (1..=top).rev() {
                let quota = self
                    .all_vc_free
                    .get(&(chain_name.clone(), level))
                    .copied()
                    .unwrap_or(0);
                let left = available - quota;
                if left < 0 {
                    return Err(ConfigError::IllegalInitialAssignment(format!(
                        "insufficient physical cells at chain {chain_name} level {level}: \
                         {quota} needed, {available} available"
                    )));
                }
                if level > 1 {
                    let fanout = fanouts[level as usize - 1] as i32;
                    available = left * fanout;
                    let above = self.total_left[&(chain_name.clone(), level)];
                    self.total_left
                        .insert((chain_name.clone(), level - 1), above * fanout);
                    self.bad_free.insert((chain_name.clone(), level - 1), 0);
                }
            }
        }
        Ok(())
    }

    /// Statically bind every reservation and take its physical cell out
    /// of the free list.
    fn init_reservations(&mut self) -> Result<(), ConfigError> {
        let reservations: Vec<(String, String, VirtualCellId, PhysicalCellId)> = self
            .vc_sets
            .iter()
            .flat_map(|(vc, set)| {
                set.reserved
                    .iter()
                    .map(|(rid, &(vroot, pid))| (vc.clone(), rid.clone(), vroot, pid))
            })
            .collect();
        for (vc, rid, vroot, pid) in reservations {
            let (chain, level) = {
                let cell = self.forest.phys(pid);
                (cell.chain.clone(), cell.level)
            };
            *self.vc_free_mut(&vc, &chain, level) -= 1;
            *self.all_vc_free_mut(&chain, level) -= 1;
            let (ok, message) = self.remove_cell_from_free_list(pid);
            if !ok {
                return Err(ConfigError::IllegalInitialAssignment(
                    message.unwrap_or_else(|| format!("reservation {rid} breaks safety")),
                ));
            }
            self.forest.bind(pid, vroot);
            self.forest.phys_mut(pid).reserved = true;
            debug!(vc = %vc, reservation = %rid, "reservation bound");
        }
        Ok(())
    }

    /// Mark every configured node bad and wait for explicit healthy
    /// signals; this keeps placements off nodes the cluster has not yet
    /// affirmed present.
    fn init_bad_nodes(&mut self) {
        info!("marking all configured nodes bad until the cluster reports them healthy");
        let mut nodes = BTreeSet::new();
        for chain in self.forest.chains() {
            for &root in &chain.roots {
                nodes.extend(self.forest.phys(root).nodes.iter().cloned());
            }
        }
        for node in nodes {
            self.set_bad_node(&node);
        }
    }

    // ── Scheduling ──────────────────────────────────────────────────

    /// Decide a placement for one pod. Request errors come back as
    /// `Err`; soft failures come back as a wait result.
    pub fn schedule(
        &mut self,
        pod_key: &str,
        spec: &PodSchedulingSpec,
        suggested_nodes: &[String],
    ) -> SchedulerResult<PodScheduleResult> {
        let group_name = spec.affinity_group.name.clone();
        info!(pod = pod_key, group = %group_name, "scheduling pod");
        let suggested: BTreeSet<String> = suggested_nodes.iter().cloned().collect();

        let physical: Option<PhysicalPlacement>;
        let virtual_: Option<VirtualPlacement>;
        let mut victims = BTreeMap::new();
        let mut pod_index = 0usize;

        if let Some(group) = self.allocated_groups.get(&group_name) {
            info!(pod = pod_key, group = %group_name, "pod from allocated affinity group");
            pod_index =
                group
                    .first_free_slot(spec.gpu_number)
                    .ok_or(SchedulerError::TooManyPods {
                        group: group_name.clone(),
                        gpu_number: spec.gpu_number,
                    })?;
            physical = Some(group.physical_placement.clone());
            virtual_ = group.virtual_placement.clone();
        } else if self.preemptor_groups.contains_key(&group_name) {
            info!(pod = pod_key, group = %group_name, "pod from preemptor affinity group");
            let group = self
                .preemptor_groups
                .get_mut(&group_name)
                .expect("checked above");
            group.preemptor_pods.insert(pod_key.to_string());
            let phys = group.physical_placement.clone();
            let virt = group.virtual_placement.clone();
            victims = self.collect_preemption_victims(&phys);
            if victims.is_empty() {
                info!(group = %group_name, "preemption victims have been cleaned up");
            }
            physical = Some(phys);
            virtual_ = virt;
        } else {
            info!(pod = pod_key, group = %group_name, "scheduling new affinity group");
            match self.schedule_new_affinity_group(spec, &suggested)? {
                None => {
                    physical = None;
                    virtual_ = None;
                }
                Some((phys_dense, virt_dense)) => {
                    let phys = wrap_physical(phys_dense);
                    let virt = virt_dense.map(wrap_virtual);
                    victims = self.collect_preemption_victims(&phys);
                    if !victims.is_empty() {
                        self.create_preemptor_affinity_group(spec, pod_key, &phys, virt.as_ref());
                    }
                    physical = Some(phys);
                    virtual_ = virt;
                }
            }
        }

        Ok(result::generate_pod_schedule_result(
            &self.forest,
            physical.as_ref(),
            virtual_.as_ref(),
            &victims,
            spec.gpu_number,
            pod_index,
            &suggested,
            &group_name,
        ))
    }

    /// Entrance of a new scheduling attempt for a whole group.
    fn schedule_new_affinity_group(
        &mut self,
        spec: &PodSchedulingSpec,
        suggested: &BTreeSet<String>,
    ) -> SchedulerResult<ScheduleOutcome> {
        let mut pod_gpu_counts: BTreeMap<u32, u32> = BTreeMap::new();
        for member in &spec.affinity_group.members {
            *pod_gpu_counts.entry(member.gpu_number).or_insert(0) += member.pod_number;
        }
        let mut sr = SchedulingRequest {
            vc: spec.virtual_cluster.clone(),
            reservation_id: spec.reservation_id.clone(),
            priority: Priority::from_request(spec.priority),
            group_name: spec.affinity_group.name.clone(),
            pod_gpu_counts,
            chain: String::new(),
        };
        self.validate_scheduling_request(&sr, spec)?;

        let outcome = if let Some(rid) = sr.reservation_id.clone() {
            info!(reservation = %rid, "using reservation");
            let (_, pid) = self.vc_sets[&sr.vc].reserved[&rid];
            sr.chain = self.forest.phys(pid).chain.clone();
            self.process_scheduling_request(&sr, suggested)
        } else {
            self.schedule_for_gpu_type(&mut sr, spec, suggested)?
        };
        if outcome.is_some() {
            info!(group = %sr.group_name, chain = %sr.chain, "succeeded in scheduling group");
        } else {
            info!(group = %sr.group_name, "failed to schedule group");
        }
        Ok(outcome)
    }

    /// Try each candidate chain in deterministic (lexicographic) order.
    fn schedule_for_gpu_type(
        &mut self,
        sr: &mut SchedulingRequest,
        spec: &PodSchedulingSpec,
        suggested: &BTreeSet<String>,
    ) -> SchedulerResult<ScheduleOutcome> {
        let chains: Vec<String> = match &spec.gpu_type {
            Some(gpu_type) => self
                .forest
                .chains_of_gpu_type(gpu_type)
                .ok_or_else(|| SchedulerError::UnknownGpuType(gpu_type.clone()))?
                .to_vec(),
            None => self.forest.chain_names().map(str::to_string).collect(),
        };
        for chain in chains {
            sr.chain = chain;
            if let Some(outcome) = self.process_scheduling_request(sr, suggested) {
                return Ok(Some(outcome));
            }
            debug!(chain = %sr.chain, group = %sr.group_name, "no placement in chain");
        }
        Ok(None)
    }

    /// Checks that need no placement search: existence of the VC and
    /// reservation, priority legality, and quota large enough for the
    /// biggest member.
    fn validate_scheduling_request(
        &self,
        sr: &SchedulingRequest,
        spec: &PodSchedulingSpec,
    ) -> SchedulerResult<()> {
        let Some(vc_set) = self.vc_sets.get(&sr.vc) else {
            return Err(SchedulerError::UnknownVirtualCluster(sr.vc.clone()));
        };
        if let Some(rid) = &sr.reservation_id {
            if !vc_set.reserved.contains_key(rid) {
                return Err(SchedulerError::UnknownReservation {
                    vc: sr.vc.clone(),
                    id: rid.clone(),
                });
            }
            if !sr.priority.is_guaranteed() {
                return Err(SchedulerError::OpportunisticReservation(rid.clone()));
            }
            return Ok(());
        }

        let candidate_chains: Vec<String> = match &spec.gpu_type {
            Some(gpu_type) => self
                .forest
                .chains_of_gpu_type(gpu_type)
                .ok_or_else(|| SchedulerError::UnknownGpuType(gpu_type.clone()))?
                .to_vec(),
            None => self.forest.chain_names().map(str::to_string).collect(),
        };

        if sr.priority.is_guaranteed() {
            if let Some(gpu_type) = &spec.gpu_type {
                if !candidate_chains.iter().any(|c| vc_set.has_chain(c)) {
                    return Err(SchedulerError::GpuTypeNotInVc {
                        gpu_type: gpu_type.clone(),
                        vc: sr.vc.clone(),
                    });
                }
            }
            let max_gpus = sr.pod_gpu_counts.keys().max().copied().unwrap_or(0);
            let fits = candidate_chains.iter().any(|chain_name| {
                let chain = self.forest.chain(chain_name);
                vc_set
                    .preassigned
                    .get(chain_name)
                    .is_some_and(|levels| {
                        levels.keys().any(|&l| chain.level(l).leaf_count >= max_gpus)
                    })
            });
            if !fits {
                return Err(SchedulerError::QuotaTooSmall {
                    vc: sr.vc.clone(),
                    gpu_number: max_gpus,
                });
            }
        }
        Ok(())
    }

    /// Feed the request to the VC scheduler or the opportunistic
    /// scheduler depending on its priority.
    fn process_scheduling_request(
        &mut self,
        sr: &SchedulingRequest,
        suggested: &BTreeSet<String>,
    ) -> ScheduleOutcome {
        if sr.priority.is_guaranteed() {
            let virt = intra_vc::schedule_within_vc(&self.forest, &self.vc_sets[&sr.vc], sr)?;
            let phys = self.map_virtual_placement_to_physical(&virt, sr, suggested)?;
            Some((phys, Some(virt)))
        } else {
            let phys = self.schedule_opportunistic(sr, suggested)?;
            Some((phys, None))
        }
    }

    /// Place a group on any free physical GPUs of the chain, ignoring
    /// VC accounting.
    fn schedule_opportunistic(
        &self,
        sr: &SchedulingRequest,
        suggested: &BTreeSet<String>,
    ) -> Option<BTreeMap<u32, Vec<Vec<PhysicalCellId>>>> {
        let roots: Vec<CellRef> = self
            .forest
            .chain(&sr.chain)
            .roots
            .iter()
            .copied()
            .map(CellRef::Phys)
            .collect();
        let request = packer::PackRequest {
            priority: Priority::OPPORTUNISTIC,
            pod_gpu_counts: &sr.pod_gpu_counts,
            suggested_nodes: Some(suggested),
        };
        let groups = &self.allocated_groups;
        let placement = packer::place_group(&self.forest, &sr.chain, &roots, &request, &|name| {
            groups.get(name).map(|g| g.pods_left()).unwrap_or(0)
        });
        match &placement {
            Some(_) => debug!(chain = %sr.chain, "opportunistic placement found"),
            None => info!(chain = %sr.chain, gpu_counts = ?sr.pod_gpu_counts,
                "insufficient free capacity for opportunistic request"),
        }
        placement.map(|p| {
            p.into_iter()
                .map(|(gpus, pods)| {
                    (
                        gpus,
                        pods.into_iter()
                            .map(|leaves| {
                                leaves
                                    .into_iter()
                                    .map(|c| match c {
                                        CellRef::Phys(id) => id,
                                        CellRef::Virt(_) => unreachable!("physical search"),
                                    })
                                    .collect()
                            })
                            .collect(),
                    )
                })
                .collect()
        })
    }

    // ── Group lifecycle ─────────────────────────────────────────────

    /// Create a preemptor group and allocate its cells immediately,
    /// before the victims are gone, so concurrent schedule attempts
    /// cannot pick the same victims (that would dead-lock the gangs).
    fn create_preemptor_affinity_group(
        &mut self,
        spec: &PodSchedulingSpec,
        pod_key: &str,
        physical: &PhysicalPlacement,
        virtual_: Option<&VirtualPlacement>,
    ) {
        let name = spec.affinity_group.name.clone();
        info!(group = %name, "creating new preemptor affinity group");
        let mut group = AffinityGroup::from_spec(spec, AffinityGroupState::Preempting);
        group.physical_placement = physical.clone();
        group.virtual_placement = virtual_.cloned();

        let pairs = placement_pairs(physical, virtual_);
        for (p, v) in pairs {
            let was_used = self.forest.phys(p).state == CellState::Used;
            if was_used {
                let using = self
                    .forest
                    .phys(p)
                    .using_group
                    .clone()
                    .expect("Used cell has a using group");
                let victim_vc = self.allocated_groups[&using].vc.clone();
                self.release_leaf(p, &victim_vc);
                if let Some(victim) = self.allocated_groups.get_mut(&using) {
                    victim.state = AffinityGroupState::BeingPreempted;
                }
            }
            let (ok, message) =
                self.allocate_leaf(p, v, Priority::from_request(spec.priority), &spec.virtual_cluster);
            if !ok {
                warn!(group = %name, message = message.as_deref().unwrap_or(""), "allocation broke safety");
            }
            let cell = self.forest.phys_mut(p);
            cell.acquiring_group = Some(name.clone());
            cell.state = if was_used {
                CellState::Acquiring
            } else {
                CellState::Acquired
            };
        }
        group.preemptor_pods.insert(pod_key.to_string());
        self.preemptor_groups.insert(name.clone(), group);
        info!(group = %name, "new preemptor affinity group created");
    }

    /// Revoke a preemption: give every cell back to whoever held it and
    /// delete the preemptor group.
    pub(crate) fn delete_preemptor_affinity_group(&mut self, name: &str, canceled_by: Option<&str>) {
        match canceled_by {
            Some(winner) => info!(
                group = name,
                winner, "preemption canceled by a higher-priority group"
            ),
            None => info!(group = name, "all preemptor pods deleted, deleting preemptor group"),
        }
        let group = self
            .preemptor_groups
            .remove(name)
            .expect("preemptor group exists");
        for p in placement_cells(&group.physical_placement) {
            self.release_leaf(p, &group.vc);
            self.forest.phys_mut(p).acquiring_group = None;
            match self.forest.phys(p).state {
                CellState::Acquiring => {
                    self.forest.phys_mut(p).state = CellState::Used;
                    // Return the cell to the group being preempted.
                    let victim_name = self
                        .forest
                        .phys(p)
                        .using_group
                        .clone()
                        .expect("Acquiring cell has a using group");
                    let victim = &self.allocated_groups[&victim_name];
                    let victim_vc = victim.vc.clone();
                    let victim_priority = Priority::from_request(victim.priority);
                    let v = if victim.virtual_placement.is_some() {
                        retrieve_virtual_cell(victim, p)
                    } else {
                        None
                    };
                    let (ok, message) = self.allocate_leaf(p, v, victim_priority, &victim_vc);
                    if !ok {
                        warn!(message = message.as_deref().unwrap_or(""), "allocation broke safety");
                    }
                }
                CellState::Acquired => {
                    self.forest.phys_mut(p).state = CellState::Free;
                }
                state => panic!("illegal state {state:?} on a preemptor cell"),
            }
        }
        info!(group = name, "preemptor affinity group deleted");
    }

    /// A preemptor whose victims have drained becomes allocated.
    fn preemptor_to_allocated(&mut self, name: &str) {
        let mut group = self
            .preemptor_groups
            .remove(name)
            .expect("preemptor group exists");
        for p in placement_cells(&group.physical_placement) {
            let cell = self.forest.phys_mut(p);
            cell.acquiring_group = None;
            cell.using_group = Some(name.to_string());
            cell.state = CellState::Used;
        }
        group.state = AffinityGroupState::Allocated;
        group.preemptor_pods.clear();
        self.allocated_groups.insert(name.to_string(), group);
        info!(group = name, "preemptor affinity group transits to allocated");
    }

    /// Demote a group from guaranteed to opportunistic without touching
    /// its pods: quota is released, the cells stay with the group.
    pub(crate) fn lazy_preempt_affinity_group(&mut self, victim: &str, preemptor: &str) {
        if let Some(mut group) = self.allocated_groups.remove(victim) {
            self.lazy_preempt_group(&mut group, preemptor);
            self.allocated_groups.insert(victim.to_string(), group);
        }
    }

    fn lazy_preempt_group(&mut self, group: &mut AffinityGroup, preemptor: &str) {
        if let Some(virtual_placement) = group.virtual_placement.take() {
            for pods in virtual_placement.values() {
                for pod in pods {
                    for &v in pod.iter().flatten() {
                        let Some(p) = self.forest.virt(v).physical_cell else {
                            continue;
                        };
                        self.release_leaf(p, &group.vc);
                        self.allocate_leaf(p, None, Priority::OPPORTUNISTIC, &group.vc);
                    }
                }
            }
        }
        group.lazy_preemption_status = Some(LazyPreemptionStatus {
            preemptor: preemptor.to_string(),
            preemption_time: epoch_secs(),
        });
        info!(victim = %group.name, preemptor, "affinity group lazy preempted from its VC");
    }

    // ── Pod admission and release ───────────────────────────────────

    /// Unallocated pods carry no engine state; kept for interface
    /// parity with the scheduling shell.
    pub fn add_unallocated_pod(&mut self, _pod_key: &str, _spec: &PodSchedulingSpec) {}

    /// Drop a scheduled-but-unbound preemptor pod; cancelling the whole
    /// preemption once the last one is gone.
    pub fn delete_unallocated_pod(&mut self, pod_key: &str, spec: &PodSchedulingSpec) {
        let name = &spec.affinity_group.name;
        let drained = match self.preemptor_groups.get_mut(name) {
            Some(group) => {
                if group.preemptor_pods.remove(pod_key) {
                    info!(pod = pod_key, group = %name, "deleting preemptor pod");
                }
                group.preemptor_pods.is_empty()
            }
            None => false,
        };
        if drained {
            self.delete_preemptor_affinity_group(name, None);
        }
    }

    /// Reconcile a pod the host has bound, whether or not this engine
    /// produced the placement.
    pub fn add_allocated_pod(&mut self, pod_key: &str, spec: &PodSchedulingSpec, info: &PodBindInfo) {
        let name = spec.affinity_group.name.clone();
        info!(
            pod = pod_key,
            group = %name,
            node = %info.node,
            gpus = ?info.gpu_isolation,
            "adding allocated pod"
        );

        if self.preemptor_groups.contains_key(&name) {
            self.preemptor_to_allocated(&name);
        }
        let pod_index = if self.allocated_groups.contains_key(&name) {
            match allocated_pod_index(info, spec.gpu_number) {
                Some(index) => index,
                None => {
                    warn!(
                        pod = pod_key,
                        group = %name,
                        node = %info.node,
                        "pod placement not found in group, ignoring"
                    );
                    return;
                }
            }
        } else {
            self.create_allocated_affinity_group(spec, info, pod_key);
            0
        };
        if let Some(slots) = self
            .allocated_groups
            .get_mut(&name)
            .and_then(|g| g.allocated_pods.get_mut(&spec.gpu_number))
        {
            if pod_index < slots.len() {
                slots[pod_index] = Some(AllocatedPod {
                    key: pod_key.to_string(),
                    node: info.node.clone(),
                });
            } else {
                warn!(pod = pod_key, group = %name, "pod slot out of range, ignoring");
            }
        } else {
            warn!(
                pod = pod_key,
                group = %name,
                gpus = spec.gpu_number,
                "no slots configured for this GPU count, ignoring"
            );
        }
    }

    /// Create a group from external truth and allocate its cells.
    fn create_allocated_affinity_group(
        &mut self,
        spec: &PodSchedulingSpec,
        info: &PodBindInfo,
        pod_key: &str,
    ) {
        let name = spec.affinity_group.name.clone();
        info!(pod = pod_key, group = %name, "creating new allocated affinity group");
        let mut group = AffinityGroup::from_spec(spec, AffinityGroupState::Allocated);
        let priority = Priority::from_request(spec.priority);
        let mut should_lazy_preempt = false;

        for member in &info.affinity_group_bind_info {
            let Some(first) = member.pod_placements.first() else {
                continue;
            };
            let gpu_number = first.physical_gpu_indices.len() as u32;
            for (pod_index, placement) in member.pod_placements.iter().enumerate() {
                for gpu_index in 0..placement.physical_gpu_indices.len() {
                    let Some((p, verdict)) = self.find_allocated_gpu(
                        placement,
                        gpu_index,
                        &info.cell_chain,
                        spec,
                        &group,
                        should_lazy_preempt,
                    ) else {
                        // The GPU address is not in the configured
                        // topology. The pod still runs; we must keep
                        // accounting for its other GPUs.
                        continue;
                    };

                    let slot = group
                        .physical_placement
                        .get_mut(&gpu_number)
                        .and_then(|pods| pods.get_mut(pod_index))
                        .and_then(|gpus| gpus.get_mut(gpu_index));
                    match slot {
                        Some(slot) => *slot = Some(p),
                        None => {
                            warn!(pod = pod_key, group = %name, "bind info does not match group shape");
                            continue;
                        }
                    }

                    let mut virtual_cell = None;
                    match verdict {
                        AdoptVerdict::Opportunistic => {
                            group.virtual_placement = None;
                        }
                        AdoptVerdict::Virtual(v) => {
                            if let Some(pods) = group
                                .virtual_placement
                                .as_mut()
                                .and_then(|vp| vp.get_mut(&gpu_number))
                            {
                                if let Some(gpus) =
                                    pods.get_mut(pod_index).and_then(|g| g.get_mut(gpu_index))
                                {
                                    *gpus = Some(v);
                                }
                            }
                            if let Some(bound) = self.forest.virt(v).physical_cell {
                                if let Some(using) = self.forest.phys(bound).using_group.clone() {
                                    self.lazy_preempt_affinity_group(&using, &name);
                                }
                            }
                            virtual_cell = Some(v);
                        }
                        AdoptVerdict::Lazy(lazy) => {
                            should_lazy_preempt = should_lazy_preempt || lazy;
                        }
                    }

                    // Even with both cells found, allocating may break
                    // safety when VC assignments changed underneath us.
                    let (ok, message) = self.allocate_leaf(p, virtual_cell, priority, &group.vc);
                    let cell = self.forest.phys_mut(p);
                    cell.using_group = Some(name.clone());
                    cell.state = CellState::Used;
                    if !ok {
                        should_lazy_preempt = true;
                        warn!(pod = pod_key, message = message.as_deref().unwrap_or(""), "allocation broke safety");
                    }
                }
            }
        }

        if should_lazy_preempt {
            let preemptor = group.name.clone();
            self.lazy_preempt_group(&mut group, &preemptor);
        }
        self.allocated_groups.insert(name.clone(), group);
        info!(group = %name, "new allocated affinity group created");
    }

    /// Locate the physical GPU for one bound address and re-derive its
    /// virtual cell if the group is still guaranteed.
    fn find_allocated_gpu(
        &self,
        placement: &PodPlacementInfo,
        gpu_index: usize,
        chain: &str,
        spec: &PodSchedulingSpec,
        group: &AffinityGroup,
        lazy_so_far: bool,
    ) -> Option<(PhysicalCellId, AdoptVerdict)> {
        let node = &placement.physical_node;
        let physical_gpu = placement.physical_gpu_indices[gpu_index];
        let Some(p) = self.forest.find_physical_gpu(chain, node, physical_gpu) else {
            warn!(
                node = %node,
                gpu = physical_gpu,
                chain,
                "cannot find GPU on node: not in the configured topology, GPU ignored"
            );
            return None;
        };
        if group.virtual_placement.is_none() || lazy_so_far {
            return Some((p, AdoptVerdict::Lazy(false)));
        }
        let Some(preassigned_type) = placement.preassigned_cell_types.get(gpu_index) else {
            warn!(node = %node, gpu = physical_gpu, "preassigned cell type missing in bind info");
            return Some((p, AdoptVerdict::Lazy(true)));
        };
        if preassigned_type.is_empty() {
            return Some((p, AdoptVerdict::Opportunistic));
        }

        let chain_info = self.forest.chain(chain);
        let Some(level) = chain_info.level_of_type(preassigned_type) else {
            warn!(cell_type = %preassigned_type, chain, "preassigned cell type not found in chain");
            return Some((p, AdoptVerdict::Lazy(true)));
        };
        let Some(vc_set) = self.vc_sets.get(&spec.virtual_cluster) else {
            warn!(vc = %spec.virtual_cluster, "virtual cluster not found");
            return Some((p, AdoptVerdict::Lazy(true)));
        };
        match self.map_physical_to_virtual(p, vc_set, spec.reservation_id.as_deref(), chain, level) {
            Ok(v) => Some((p, AdoptVerdict::Virtual(v))),
            Err(message) => {
                warn!(%message, "cannot find virtual cell for allocated pod");
                Some((p, AdoptVerdict::Lazy(true)))
            }
        }
    }

    /// Walk physical ancestors up to the preassigned level, reusing an
    /// existing binding where possible, and claim a matching unbound
    /// virtual cell on the way back down.
    fn map_physical_to_virtual(
        &self,
        p: PhysicalCellId,
        vc_set: &VcCellSet,
        reservation_id: Option<&str>,
        chain: &str,
        preassigned_level: u32,
    ) -> Result<VirtualCellId, String> {
        if let Some(v) = self.forest.phys(p).virtual_cell {
            return Ok(v);
        }
        let cell = self.forest.phys(p);
        if cell.level == preassigned_level {
            let candidates: Vec<VirtualCellId> = match reservation_id {
                Some(rid) => vc_set
                    .reserved
                    .get(rid)
                    .map(|&(vroot, _)| vec![vroot])
                    .ok_or_else(|| format!("reservation {rid} not found"))?,
                None => vc_set.preassigned_at(chain, preassigned_level).to_vec(),
            };
            return candidates
                .into_iter()
                .find(|&v| self.forest.virt(v).physical_cell.is_none())
                .ok_or_else(|| {
                    format!("insufficient free cells in the VC at the preassigned level {preassigned_level}")
                });
        }
        let Some(parent) = cell.parent else {
            return Err(format!(
                "physical and virtual cell hierarchies do not match: cannot reach level {preassigned_level}"
            ));
        };
        let parent_virtual =
            self.map_physical_to_virtual(parent, vc_set, reservation_id, chain, preassigned_level)?;
        self.forest
            .virt(parent_virtual)
            .children
            .iter()
            .copied()
            .filter(|&c| self.forest.virt(c).physical_cell.is_none())
            .min_by_key(|&c| (self.forest.virt(c).priority, c))
            .ok_or_else(|| "no unbound virtual cell under the preassigned cell".to_string())
    }

    /// Release a pod slot; the group is destroyed when the last slot
    /// empties.
    pub fn delete_allocated_pod(&mut self, pod_key: &str, spec: &PodSchedulingSpec, info: &PodBindInfo) {
        let name = spec.affinity_group.name.clone();
        info!(
            pod = pod_key,
            group = %name,
            node = %info.node,
            gpus = ?info.gpu_isolation,
            "deleting allocated pod"
        );
        let Some(group) = self.allocated_groups.get_mut(&name) else {
            warn!(pod = pod_key, group = %name, "group not found when deleting pod");
            return;
        };
        let Some(index) = allocated_pod_index(info, spec.gpu_number) else {
            warn!(pod = pod_key, group = %name, "pod placement not found in group");
            return;
        };
        if let Some(slots) = group.allocated_pods.get_mut(&spec.gpu_number) {
            if index < slots.len() {
                slots[index] = None;
            }
        }
        if group.all_pods_released() {
            self.delete_allocated_affinity_group(&name, pod_key);
        }
    }

    /// Release every cell of a fully drained group. Cells a preemptor
    /// is acquiring move to it instead of going free; their quota was
    /// already re-charged when the preemptor was created.
    fn delete_allocated_affinity_group(&mut self, name: &str, pod_key: &str) {
        info!(pod = pod_key, group = name, "all pods complete, deleting affinity group");
        let group = self
            .allocated_groups
            .remove(name)
            .expect("checked by caller");
        for p in placement_cells(&group.physical_placement) {
            debug_assert_eq!(
                self.forest.phys(p).using_group.as_deref(),
                Some(name),
                "group releases only its own cells"
            );
            self.forest.phys_mut(p).using_group = None;
            match self.forest.phys(p).state {
                CellState::Used => {
                    self.release_leaf(p, &group.vc);
                    self.forest.phys_mut(p).state = CellState::Free;
                }
                CellState::Acquiring => {
                    self.forest.phys_mut(p).state = CellState::Acquired;
                }
                state => panic!("illegal state {state:?} when releasing a group cell"),
            }
        }
        info!(group = name, "allocated affinity group deleted");
    }

    // ── Node health entry points ────────────────────────────────────

    /// A node joined (or re-joined) the cluster with a health verdict
    /// from the external health predicate.
    pub fn add_node(&mut self, node: &str, healthy: bool) {
        if healthy {
            self.set_healthy_node(node);
        } else {
            self.set_bad_node(node);
        }
    }

    /// A node's health verdict changed.
    pub fn update_node(&mut self, node: &str, healthy: bool) {
        if healthy {
            self.set_healthy_node(node);
        } else {
            self.set_bad_node(node);
        }
    }

    /// A node left the cluster.
    pub fn delete_node(&mut self, node: &str) {
        self.set_bad_node(node);
    }
}

/// Outcome of one scheduling attempt: dense placements, virtual side
/// present only for guaranteed requests.
type ScheduleOutcome = Option<(
    BTreeMap<u32, Vec<Vec<PhysicalCellId>>>,
    Option<BTreeMap<u32, Vec<Vec<VirtualCellId>>>>,
)>;

/// Verdict on one adopted GPU: opportunistic, bound to a virtual cell,
/// or (possibly) forcing a lazy preemption of the group.
enum AdoptVerdict {
    Opportunistic,
    Virtual(VirtualCellId),
    Lazy(bool),
}

pub(crate) fn wrap_physical(
    dense: BTreeMap<u32, Vec<Vec<PhysicalCellId>>>,
) -> PhysicalPlacement {
    dense
        .into_iter()
        .map(|(gpus, pods)| {
            (
                gpus,
                pods.into_iter()
                    .map(|leaves| leaves.into_iter().map(Some).collect())
                    .collect(),
            )
        })
        .collect()
}

pub(crate) fn wrap_virtual(
    dense: BTreeMap<u32, Vec<Vec<VirtualCellId>>>,
) -> VirtualPlacement {
    dense
        .into_iter()
        .map(|(gpus, pods)| {
            (
                gpus,
                pods.into_iter()
                    .map(|leaves| leaves.into_iter().map(Some).collect())
                    .collect(),
            )
        })
        .collect()
}

/// Every physical cell of a placement, holes skipped.
pub(crate) fn placement_cells(placement: &PhysicalPlacement) -> Vec<PhysicalCellId> {
    placement
        .values()
        .flatten()
        .flatten()
        .filter_map(|c| *c)
        .collect()
}

/// Paired physical and virtual cells of a placement.
fn placement_pairs(
    physical: &PhysicalPlacement,
    virtual_: Option<&VirtualPlacement>,
) -> Vec<(PhysicalCellId, Option<VirtualCellId>)> {
    let mut pairs = Vec::new();
    for (gpus, pods) in physical {
        for (pod_index, pod) in pods.iter().enumerate() {
            for (gpu_index, cell) in pod.iter().enumerate() {
                let Some(p) = cell else { continue };
                let v = virtual_
                    .and_then(|vp| vp.get(gpus))
                    .and_then(|pods| pods.get(pod_index))
                    .and_then(|pod| pod.get(gpu_index))
                    .and_then(|c| *c);
                pairs.push((*p, v));
            }
        }
    }
    pairs
}

/// Find the virtual cell a group holds at the same placement position
/// as the given physical cell.
fn retrieve_virtual_cell(group: &AffinityGroup, p: PhysicalCellId) -> Option<VirtualCellId> {
    let virtual_placement = group.virtual_placement.as_ref()?;
    for (gpus, pods) in &group.physical_placement {
        for (pod_index, pod) in pods.iter().enumerate() {
            for (gpu_index, cell) in pod.iter().enumerate() {
                if *cell == Some(p) {
                    return virtual_placement
                        .get(gpus)
                        .and_then(|pods| pods.get(pod_index))
                        .and_then(|pod| pod.get(gpu_index))
                        .and_then(|c| *c);
                }
            }
        }
    }
    None
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellgrid_types::config::{ChainSpec, LevelSpec, RootCellSpec, VcCellQuota, VirtualClusterSpec};
    use cellgrid_types::{AffinityGroupMember, AffinityGroupSpec, CellHealthiness};

    // One chain "DGX": 4 levels, fan-out 2 at each, 8 GPU leaves on 4
    // two-GPU nodes. Two tenants with one node-cell of quota each.
    fn test_config() -> SchedulerConfig {
        let mut virtual_clusters = BTreeMap::new();
        for vc in ["vc-a", "vc-b"] {
            virtual_clusters.insert(
                vc.to_string(),
                VirtualClusterSpec {
                    cells: vec![VcCellQuota {
                        chain: "DGX".to_string(),
                        cell_type: "V100-node".to_string(),
                        count: 1,
                    }],
                    reservations: vec![],
                },
            );
        }
        SchedulerConfig {
            chains: vec![ChainSpec {
                name: "DGX".to_string(),
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
                    LevelSpec {
                        cell_type: "V100-quad".to_string(),
                        child_count: 2,
                        is_node_level: false,
                    },
                    LevelSpec {
                        cell_type: "V100-rack".to_string(),
                        child_count: 2,
                        is_node_level: false,
                    },
                ],
            }],
            physical_cluster: vec![RootCellSpec {
                chain: "DGX".to_string(),
                nodes: vec![
                    "n1".to_string(),
                    "n2".to_string(),
                    "n3".to_string(),
                    "n4".to_string(),
                ],
            }],
            virtual_clusters,
        }
    }

    fn nodes() -> Vec<String> {
        vec!["n1".into(), "n2".into(), "n3".into(), "n4".into()]
    }

    fn ready_engine() -> Scheduler {
        let mut engine = Scheduler::new(&test_config()).unwrap();
        for node in nodes() {
            engine.add_node(&node, true);
        }
        assert!(engine.verify_invariants().is_empty());
        engine
    }

    fn gang(name: &str, vc: &str, priority: i32, pods: u32, gpus: u32) -> PodSchedulingSpec {
        PodSchedulingSpec {
            virtual_cluster: vc.to_string(),
            priority,
            gpu_type: None,
            gpu_number: gpus,
            reservation_id: None,
            gang_release_enable: false,
            lazy_preemption_enable: false,
            affinity_group: AffinityGroupSpec {
                name: name.to_string(),
                members: vec![AffinityGroupMember {
                    gpu_number: gpus,
                    pod_number: pods,
                }],
            },
        }
    }

    fn expect_bind(result: &PodScheduleResult) -> PodBindInfo {
        match result {
            PodScheduleResult::Bind { bind_info } => bind_info.clone(),
            other => panic!("expected a bind result, got {other:?}"),
        }
    }

    fn check(engine: &Scheduler) {
        let violations = engine.verify_invariants();
        assert!(violations.is_empty(), "invariant violations: {violations:?}");
    }

    #[test]
    fn construction_rejects_overcommitted_quota() {
        let mut config = test_config();
        config
            .virtual_clusters
            .get_mut("vc-a")
            .unwrap()
            .cells[0]
            .count = 4; // 4 + 1 node cells > 4 available
        assert!(matches!(
            Scheduler::new(&config),
            Err(ConfigError::IllegalInitialAssignment(_))
        ));
    }

    #[test]
    fn allocate_and_release_round_trips_all_counters() {
        let mut engine = ready_engine();
        let total_before: Vec<i32> = (1..=4).map(|l| engine.total_left_at("DGX", l)).collect();
        assert_eq!(engine.vc_free_at("vc-a", "DGX", 2), 1);

        let spec = gang("g1", "vc-a", 10, 1, 2);
        let result = engine.schedule("ns/g1-0", &spec, &nodes()).unwrap();
        let info = expect_bind(&result);
        check(&engine);
        // Nothing is committed until the pod is reported bound.
        assert_eq!(engine.vc_free_at("vc-a", "DGX", 2), 1);

        engine.add_allocated_pod("ns/g1-0", &spec, &info);
        check(&engine);
        assert_eq!(engine.vc_free_at("vc-a", "DGX", 2), 0);
        assert_eq!(engine.total_left_at("DGX", 2), 3);
        assert_eq!(engine.total_left_at("DGX", 1), 6);

        engine.delete_allocated_pod("ns/g1-0", &spec, &info);
        check(&engine);
        assert_eq!(engine.vc_free_at("vc-a", "DGX", 2), 1);
        let total_after: Vec<i32> = (1..=4).map(|l| engine.total_left_at("DGX", l)).collect();
        assert_eq!(total_before, total_after);
        // Buddies merged all the way back to the root.
        assert_eq!(engine.free_lists["DGX"].len_at(4), 1);
        assert!(engine.affinity_groups().is_empty());
    }

    #[test]
    fn pod_exceeding_every_quota_cell_is_rejected() {
        let mut engine = ready_engine();
        let spec = gang("g-big", "vc-a", 10, 1, 4);
        assert!(matches!(
            engine.schedule("ns/p0", &spec, &nodes()),
            Err(SchedulerError::QuotaTooSmall { gpu_number: 4, .. })
        ));
    }

    #[test]
    fn opportunistic_bypasses_vc_quota() {
        let mut engine = ready_engine();
        // vc-b's guaranteed group takes its node cell.
        let b = gang("g-b", "vc-b", 1, 1, 2);
        let b_info = expect_bind(&engine.schedule("ns/b-0", &b, &nodes()).unwrap());
        engine.add_allocated_pod("ns/b-0", &b, &b_info);

        // vc-a's quota is 2 GPUs, but opportunistic pods can take all
        // six remaining ones.
        let oppor = gang("g-opp", "vc-a", -1, 3, 2);
        let result = engine.schedule("ns/o-0", &oppor, &nodes()).unwrap();
        let info = expect_bind(&result);
        engine.add_allocated_pod("ns/o-0", &oppor, &info);
        check(&engine);
        assert_eq!(engine.vc_free_at("vc-a", "DGX", 2), 1, "no quota charged");

        // Nothing is free anymore; further opportunistic work waits.
        let extra = gang("g-extra", "vc-a", -1, 1, 1);
        let result = engine.schedule("ns/e-0", &extra, &nodes()).unwrap();
        assert!(result.is_wait());
    }

    #[test]
    fn preemption_walks_the_full_lifecycle() {
        let mut engine = ready_engine();
        let g1 = gang("g1", "vc-a", 10, 1, 2);
        let g1_info = expect_bind(&engine.schedule("ns/g1-0", &g1, &nodes()).unwrap());
        engine.add_allocated_pod("ns/g1-0", &g1, &g1_info);
        check(&engine);

        // A higher-priority group of the same tenant wants the cell.
        let g2 = gang("g2", "vc-a", 100, 1, 2);
        let result = engine.schedule("ns/g2-0", &g2, &nodes()).unwrap();
        let PodScheduleResult::Preempt { victims } = result else {
            panic!("expected preemption, got {result:?}");
        };
        let victim_pods: Vec<_> = victims.values().flatten().cloned().collect();
        assert_eq!(victim_pods, vec!["ns/g1-0".to_string()]);
        check(&engine);
        assert_eq!(
            engine.affinity_group("g1").unwrap().state,
            AffinityGroupState::BeingPreempted
        );
        for p in placement_cells(&engine.preemptor_groups["g2"].physical_placement) {
            assert_eq!(engine.forest.phys(p).state, CellState::Acquiring);
        }

        // The victim's pods are deleted externally.
        engine.delete_allocated_pod("ns/g1-0", &g1, &g1_info);
        check(&engine);
        assert!(engine.affinity_group("g1").is_err());
        for p in placement_cells(&engine.preemptor_groups["g2"].physical_placement) {
            assert_eq!(engine.forest.phys(p).state, CellState::Acquired);
        }

        // Re-scheduling the preemptor pod now yields a binding.
        let result = engine.schedule("ns/g2-0", &g2, &nodes()).unwrap();
        let g2_info = expect_bind(&result);
        engine.add_allocated_pod("ns/g2-0", &g2, &g2_info);
        check(&engine);
        let status = engine.affinity_group("g2").unwrap();
        assert_eq!(status.state, AffinityGroupState::Allocated);
    }

    #[test]
    fn higher_priority_preemptor_cancels_a_lower_one() {
        let mut engine = ready_engine();
        let g1 = gang("g1", "vc-a", 10, 1, 2);
        let g1_info = expect_bind(&engine.schedule("ns/g1-0", &g1, &nodes()).unwrap());
        engine.add_allocated_pod("ns/g1-0", &g1, &g1_info);

        let g2 = gang("g2", "vc-a", 100, 1, 2);
        let result = engine.schedule("ns/g2-0", &g2, &nodes()).unwrap();
        assert!(matches!(result, PodScheduleResult::Preempt { .. }));
        check(&engine);

        // g3 out-prioritizes g2 on the same cells: g2's preemption is
        // canceled, the cells return to g1, then g3 takes them.
        let g3 = gang("g3", "vc-a", 200, 1, 2);
        let result = engine.schedule("ns/g3-0", &g3, &nodes()).unwrap();
        let PodScheduleResult::Preempt { victims } = result else {
            panic!("expected preemption, got {result:?}");
        };
        let victim_pods: Vec<_> = victims.values().flatten().cloned().collect();
        assert_eq!(victim_pods, vec!["ns/g1-0".to_string()]);
        check(&engine);
        assert!(!engine.preemptor_groups.contains_key("g2"));
        for p in placement_cells(&engine.preemptor_groups["g3"].physical_placement) {
            let cell = engine.forest.phys(p);
            assert_eq!(cell.state, CellState::Acquiring);
            assert_eq!(cell.using_group.as_deref(), Some("g1"));
        }
    }

    #[test]
    fn lazy_preemption_demotes_instead_of_killing() {
        let mut engine = ready_engine();
        let mut g1 = gang("g1", "vc-a", 10, 1, 2);
        g1.lazy_preemption_enable = true;
        let g1_info = expect_bind(&engine.schedule("ns/g1-0", &g1, &nodes()).unwrap());
        engine.add_allocated_pod("ns/g1-0", &g1, &g1_info);

        // The higher-priority group takes the quota; g1 keeps running
        // as opportunistic on its old cells, so no victims are needed.
        let g2 = gang("g2", "vc-a", 100, 1, 2);
        let result = engine.schedule("ns/g2-0", &g2, &nodes()).unwrap();
        let g2_info = expect_bind(&result);
        assert_ne!(g2_info.node, g1_info.node, "g2 should avoid the demoted group");
        check(&engine);

        let g1_status = engine.affinity_group("g1").unwrap();
        let lazy = g1_status.lazy_preemption_status.expect("lazy preempted");
        assert_eq!(lazy.preemptor, "g2");
        assert_eq!(engine.vc_free_at("vc-a", "DGX", 2), 1, "quota released");

        engine.add_allocated_pod("ns/g2-0", &g2, &g2_info);
        check(&engine);
        assert_eq!(engine.vc_free_at("vc-a", "DGX", 2), 0);
    }

    #[test]
    fn doomed_bad_rises_and_falls_with_node_health() {
        let mut engine = ready_engine();
        for node in ["n4", "n3", "n2"] {
            engine.update_node(node, false);
            check(&engine);
        }
        // One healthy node cell covers each VC's single free cell.
        assert_eq!(engine.doomed_at("vc-a", "DGX", 2), 0);

        engine.update_node("n1", false);
        check(&engine);
        assert_eq!(engine.doomed_at("vc-a", "DGX", 2), 1);
        assert_eq!(engine.doomed_at("vc-b", "DGX", 2), 1);
        let statuses = engine.virtual_cluster_status("vc-a").unwrap();
        let pac = statuses
            .iter()
            .find(|s| s.cell_type == "V100-node")
            .unwrap();
        assert_eq!(pac.healthiness, CellHealthiness::Bad);

        engine.add_node("n1", true);
        check(&engine);
        assert_eq!(engine.doomed_at("vc-a", "DGX", 2), 0);
        let statuses = engine.virtual_cluster_status("vc-a").unwrap();
        let pac = statuses
            .iter()
            .find(|s| s.cell_type == "V100-node")
            .unwrap();
        assert_eq!(pac.healthiness, CellHealthiness::Healthy);
    }

    #[test]
    fn node_health_toggles_are_idempotent() {
        let mut engine = ready_engine();
        engine.update_node("n1", false);
        let bad_once: Vec<i32> = (1..=4).map(|l| engine.bad_free_at("DGX", l)).collect();
        engine.update_node("n1", false);
        let bad_twice: Vec<i32> = (1..=4).map(|l| engine.bad_free_at("DGX", l)).collect();
        assert_eq!(bad_once, bad_twice);
        check(&engine);

        engine.add_node("n1", true);
        let healthy_once: Vec<i32> = (1..=4).map(|l| engine.bad_free_at("DGX", l)).collect();
        engine.add_node("n1", true);
        let healthy_twice: Vec<i32> = (1..=4).map(|l| engine.bad_free_at("DGX", l)).collect();
        assert_eq!(healthy_once, healthy_twice);
        check(&engine);
    }

    #[test]
    fn unknown_gpu_addresses_are_tolerated_on_adoption() {
        let mut engine = ready_engine();
        let spec = gang("g-drift", "vc-a", 10, 1, 2);
        let info = PodBindInfo {
            node: "ghost-node".to_string(),
            gpu_isolation: vec![0, 1],
            cell_chain: "DGX".to_string(),
            affinity_group_bind_info: vec![cellgrid_types::MemberBindInfo {
                pod_placements: vec![cellgrid_types::PodPlacementInfo {
                    physical_node: "ghost-node".to_string(),
                    physical_gpu_indices: vec![0, 1],
                    preassigned_cell_types: vec![
                        "V100-node".to_string(),
                        "V100-node".to_string(),
                    ],
                }],
            }],
        };
        engine.add_allocated_pod("ns/drift-0", &spec, &info);
        check(&engine);
        // The pod is admitted, with holes in its placement.
        let status = engine.affinity_group("g-drift").unwrap();
        assert_eq!(status.pods[&2][0].as_deref(), Some("ns/drift-0"));

        engine.delete_allocated_pod("ns/drift-0", &spec, &info);
        check(&engine);
        assert!(engine.affinity_group("g-drift").is_err());
    }

    #[test]
    fn adoption_beyond_quota_lazy_preempts_the_group() {
        let mut engine = ready_engine();
        let g1 = gang("g1", "vc-a", 10, 1, 2);
        let g1_info = expect_bind(&engine.schedule("ns/g1-0", &g1, &nodes()).unwrap());
        engine.add_allocated_pod("ns/g1-0", &g1, &g1_info);

        // A second group of the same tenant claims the same quota unit
        // type; the tenant has no free one left, so the newcomer is
        // demoted to opportunistic on admission.
        let g2 = gang("g2", "vc-a", 10, 1, 2);
        let info = PodBindInfo {
            node: "n3".to_string(),
            gpu_isolation: vec![0, 1],
            cell_chain: "DGX".to_string(),
            affinity_group_bind_info: vec![cellgrid_types::MemberBindInfo {
                pod_placements: vec![cellgrid_types::PodPlacementInfo {
                    physical_node: "n3".to_string(),
                    physical_gpu_indices: vec![0, 1],
                    preassigned_cell_types: vec![
                        "V100-node".to_string(),
                        "V100-node".to_string(),
                    ],
                }],
            }],
        };
        engine.add_allocated_pod("ns/g2-0", &g2, &info);
        check(&engine);
        let status = engine.affinity_group("g2").unwrap();
        assert!(status.lazy_preemption_status.is_some());
        assert_eq!(engine.vc_free_at("vc-a", "DGX", 2), 0, "only g1 holds quota");
    }

    #[test]
    fn request_validation_errors() {
        let mut engine = ready_engine();
        let mut spec = gang("g", "nope", 1, 1, 1);
        assert!(matches!(
            engine.schedule("ns/p", &spec, &nodes()),
            Err(SchedulerError::UnknownVirtualCluster(_))
        ));

        spec.virtual_cluster = "vc-a".to_string();
        spec.reservation_id = Some("rsv".to_string());
        assert!(matches!(
            engine.schedule("ns/p", &spec, &nodes()),
            Err(SchedulerError::UnknownReservation { .. })
        ));

        spec.reservation_id = None;
        spec.gpu_type = Some("H100".to_string());
        assert!(matches!(
            engine.schedule("ns/p", &spec, &nodes()),
            Err(SchedulerError::UnknownGpuType(_))
        ));
    }

    #[test]
    fn extra_pods_beyond_the_configured_count_are_rejected() {
        let mut engine = ready_engine();
        let spec = gang("g1", "vc-a", 10, 1, 2);
        let info = expect_bind(&engine.schedule("ns/g1-0", &spec, &nodes()).unwrap());
        engine.add_allocated_pod("ns/g1-0", &spec, &info);

        assert!(matches!(
            engine.schedule("ns/g1-1", &spec, &nodes()),
            Err(SchedulerError::TooManyPods { .. })
        ));
    }

    #[test]
    fn unsuggested_nodes_turn_bindings_into_waits() {
        let mut engine = ready_engine();
        let spec = gang("g1", "vc-a", 10, 1, 2);
        // Only an unrelated node is suggested; every placement the
        // algorithm picks will be off-limits.
        let result = engine
            .schedule("ns/g1-0", &spec, &["does-not-exist".to_string()])
            .unwrap();
        assert!(result.is_wait());
    }
}
