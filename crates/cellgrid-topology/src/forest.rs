//! The cell forest: arenas of physical and virtual cells plus chain
//! metadata, built once from the scheduler config.

use std::collections::BTreeMap;

use cellgrid_types::config::{ConfigError, SchedulerConfig};
use cellgrid_types::{CellHealthiness, CellState};

use crate::cell::{CellRef, PhysicalCell, PhysicalCellId, Priority, VirtualCell, VirtualCellId};

/// Shape of one level of a chain, resolved from config.
#[derive(Debug, Clone)]
pub struct LevelInfo {
    pub cell_type: String,
    /// Children per cell at this level; 0 at the GPU level.
    pub child_count: u32,
    /// GPU leaves under one cell at this level.
    pub leaf_count: u32,
    pub is_node_level: bool,
}

/// Static metadata and cell indexes of one chain.
#[derive(Debug)]
pub struct ChainInfo {
    pub name: String,
    pub gpu_type: String,
    /// Indexed by `level - 1`.
    pub levels: Vec<LevelInfo>,
    /// Top-level physical cells of the chain.
    pub roots: Vec<PhysicalCellId>,
    /// Every physical cell of the chain, per level (`level - 1`).
    pub full_list: Vec<Vec<PhysicalCellId>>,
}

impl ChainInfo {
    pub fn top_level(&self) -> u32 {
        self.levels.len() as u32
    }

    pub fn level(&self, level: u32) -> &LevelInfo {
        &self.levels[level as usize - 1]
    }

    /// Children per cell at the given level.
    pub fn fanout(&self, level: u32) -> u32 {
        self.level(level).child_count
    }

    pub fn level_of_type(&self, cell_type: &str) -> Option<u32> {
        self.levels
            .iter()
            .position(|l| l.cell_type == cell_type)
            .map(|i| i as u32 + 1)
    }

    /// The level whose cells correspond one-to-one to physical nodes.
    pub fn node_level(&self) -> u32 {
        self.levels
            .iter()
            .position(|l| l.is_node_level)
            .map(|i| i as u32 + 1)
            .unwrap_or(1)
    }
}

/// The virtual cells of one tenant, grouped for the schedulers.
#[derive(Debug, Default)]
pub struct VcCellSet {
    /// chain -> per level (`level - 1`) -> all non-reserved virtual
    /// cells, in construction order.
    pub non_reserved: BTreeMap<String, Vec<Vec<VirtualCellId>>>,
    /// chain -> level -> quota-unit (preassigned) cells.
    pub preassigned: BTreeMap<String, BTreeMap<u32, Vec<VirtualCellId>>>,
    /// reservation id -> (virtual tree root, pinned physical cell).
    pub reserved: BTreeMap<String, (VirtualCellId, PhysicalCellId)>,
}

impl VcCellSet {
    /// Whether the tenant has any quota in the given chain.
    pub fn has_chain(&self, chain: &str) -> bool {
        self.non_reserved.contains_key(chain)
    }

    /// Preassigned cells at an exact chain and level, construction
    /// order. Empty when the tenant has no quota there.
    pub fn preassigned_at(&self, chain: &str, level: u32) -> &[VirtualCellId] {
        self.preassigned
            .get(chain)
            .and_then(|m| m.get(&level))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All preassigned cells of the tenant in a chain, any level.
    pub fn preassigned_roots(&self, chain: &str) -> Vec<VirtualCellId> {
        self.preassigned
            .get(chain)
            .map(|m| m.values().flatten().copied().collect())
            .unwrap_or_default()
    }
}

/// Arena of all cells plus chain metadata.
#[derive(Debug)]
pub struct CellForest {
    physical: Vec<PhysicalCell>,
    virtuals: Vec<VirtualCell>,
    chains: BTreeMap<String, ChainInfo>,
    /// gpu type -> chains providing it, lexicographic.
    gpu_type_chains: BTreeMap<String, Vec<String>>,
    address_index: BTreeMap<String, PhysicalCellId>,
}

impl CellForest {
    /// Build the forest from a validated config. Returns the forest and
    /// the per-tenant virtual cell sets.
    pub fn build(
        config: &SchedulerConfig,
    ) -> Result<(CellForest, BTreeMap<String, VcCellSet>), ConfigError> {
        config.validate()?;

        let mut forest = CellForest {
            physical: Vec::new(),
            virtuals: Vec::new(),
            chains: BTreeMap::new(),
            gpu_type_chains: BTreeMap::new(),
            address_index: BTreeMap::new(),
        };

        for spec in &config.chains {
            let levels: Vec<LevelInfo> = spec
                .levels
                .iter()
                .enumerate()
                .map(|(i, l)| LevelInfo {
                    cell_type: l.cell_type.clone(),
                    child_count: l.child_count,
                    leaf_count: spec.leaves_per_cell(i as u32 + 1),
                    is_node_level: l.is_node_level,
                })
                .collect();
            let num_levels = levels.len();
            forest.chains.insert(
                spec.name.clone(),
                ChainInfo {
                    name: spec.name.clone(),
                    gpu_type: spec.gpu_type.clone(),
                    levels,
                    roots: Vec::new(),
                    full_list: vec![Vec::new(); num_levels],
                },
            );
            forest
                .gpu_type_chains
                .entry(spec.gpu_type.clone())
                .or_default()
                .push(spec.name.clone());
        }

        let mut root_serial: BTreeMap<String, usize> = BTreeMap::new();
        for root in &config.physical_cluster {
            let serial = root_serial.entry(root.chain.clone()).or_insert(0);
            let address = format!("{}/{}", root.chain, serial);
            *serial += 1;

            let shape = forest.chains[&root.chain].levels.clone();
            let top = shape.len() as u32;
            let mut node_cursor = 0usize;
            let id = forest.build_physical_subtree(
                &root.chain,
                &shape,
                top,
                address,
                &root.nodes,
                &mut node_cursor,
            );
            let chain = forest.chains.get_mut(&root.chain).expect("chain built above");
            chain.roots.push(id);
        }

        let mut vc_sets: BTreeMap<String, VcCellSet> = BTreeMap::new();
        let mut reserved_cells: BTreeMap<PhysicalCellId, String> = BTreeMap::new();
        for (vc_name, vc_spec) in &config.virtual_clusters {
            let mut set = VcCellSet::default();
            let mut type_serial: BTreeMap<(String, String), usize> = BTreeMap::new();

            for quota in &vc_spec.cells {
                let shape = forest.chains[&quota.chain].levels.clone();
                let level = forest.chains[&quota.chain]
                    .level_of_type(&quota.cell_type)
                    .expect("validated in SchedulerConfig::validate");
                let serial = type_serial
                    .entry((quota.chain.clone(), quota.cell_type.clone()))
                    .or_insert(0);
                for _ in 0..quota.count {
                    let address = format!(
                        "{}/{}/{}:{}",
                        vc_name, quota.chain, quota.cell_type, serial
                    );
                    *serial += 1;
                    let levels = set
                        .non_reserved
                        .entry(quota.chain.clone())
                        .or_insert_with(|| vec![Vec::new(); shape.len()]);
                    let root = forest.build_virtual_subtree(
                        vc_name,
                        &quota.chain,
                        &shape,
                        level,
                        address,
                        None,
                        Some(levels),
                    );
                    set.preassigned
                        .entry(quota.chain.clone())
                        .or_default()
                        .entry(level)
                        .or_default()
                        .push(root);
                }
            }

            for r in &vc_spec.reservations {
                let pid = forest
                    .find_physical_by_address(&r.cell_address)
                    .filter(|&id| forest.phys(id).chain == r.chain)
                    .ok_or_else(|| ConfigError::UnknownReservedCell {
                        vc: vc_name.clone(),
                        id: r.id.clone(),
                        address: r.cell_address.clone(),
                    })?;
                if reserved_cells.insert(pid, r.id.clone()).is_some() {
                    return Err(ConfigError::CellAlreadyReserved {
                        vc: vc_name.clone(),
                        id: r.id.clone(),
                        address: r.cell_address.clone(),
                    });
                }
                let shape = forest.chains[&r.chain].levels.clone();
                let level = forest.phys(pid).level;
                let address = format!("{}/{}/{}", vc_name, r.chain, r.id);
                let root = forest.build_virtual_subtree(
                    vc_name, &r.chain, &shape, level, address, None, None,
                );
                set.reserved.insert(r.id.clone(), (root, pid));
            }

            vc_sets.insert(vc_name.clone(), set);
        }

        Ok((forest, vc_sets))
    }

    fn build_physical_subtree(
        &mut self,
        chain: &str,
        shape: &[LevelInfo],
        level: u32,
        address: String,
        nodes: &[String],
        node_cursor: &mut usize,
    ) -> PhysicalCellId {
        let info = &shape[level as usize - 1];
        let node_level = shape
            .iter()
            .position(|l| l.is_node_level)
            .map(|i| i as u32 + 1)
            .unwrap_or(1);

        if level > node_level {
            let mut children = Vec::with_capacity(info.child_count as usize);
            for j in 0..info.child_count {
                let child_address = format!("{address}/{j}");
                children.push(self.build_physical_subtree(
                    chain,
                    shape,
                    level - 1,
                    child_address,
                    nodes,
                    node_cursor,
                ));
            }
            let cell_nodes: Vec<String> = children
                .iter()
                .flat_map(|&c| self.phys(c).nodes.clone())
                .collect();
            let gpus_per_node = shape[node_level as usize - 1].leaf_count;
            self.new_physical(
                chain,
                level,
                address,
                info.cell_type.clone(),
                cell_nodes,
                (0..gpus_per_node).collect(),
                children,
            )
        } else if level == node_level {
            let node = nodes[*node_cursor].clone();
            *node_cursor += 1;
            self.build_physical_below(chain, shape, level, address, &node, 0)
        } else {
            unreachable!("recursion enters node scope via build_physical_below")
        }
    }

    /// Build a cell at or below the node level; every cell here sits on
    /// one node and covers a contiguous GPU index range.
    fn build_physical_below(
        &mut self,
        chain: &str,
        shape: &[LevelInfo],
        level: u32,
        address: String,
        node: &str,
        base: u32,
    ) -> PhysicalCellId {
        let info = &shape[level as usize - 1];
        let mut children = Vec::with_capacity(info.child_count as usize);
        if level > 1 {
            let child_leaves = shape[level as usize - 2].leaf_count;
            for j in 0..info.child_count {
                let child_address = format!("{address}/{j}");
                children.push(self.build_physical_below(
                    chain,
                    shape,
                    level - 1,
                    child_address,
                    node,
                    base + j * child_leaves,
                ));
            }
        }
        self.new_physical(
            chain,
            level,
            address,
            info.cell_type.clone(),
            vec![node.to_string()],
            (base..base + info.leaf_count).collect(),
            children,
        )
    }

    fn new_physical(
        &mut self,
        chain: &str,
        level: u32,
        address: String,
        cell_type: String,
        nodes: Vec<String>,
        gpu_indices: Vec<u32>,
        children: Vec<PhysicalCellId>,
    ) -> PhysicalCellId {
        let id = PhysicalCellId(self.physical.len() as u32);
        self.physical.push(PhysicalCell {
            chain: chain.to_string(),
            level,
            parent: None,
            children: children.clone(),
            address: address.clone(),
            cell_type,
            nodes,
            gpu_indices,
            healthiness: CellHealthiness::Healthy,
            split: false,
            state: CellState::Free,
            priority: Priority::FREE,
            used_leaves: BTreeMap::new(),
            using_group: None,
            acquiring_group: None,
            reserved: false,
            virtual_cell: None,
            pre_bound_virtual: None,
            oppor_vc: None,
        });
        for child in children {
            self.physical[child.0 as usize].parent = Some(id);
        }
        self.address_index.insert(address, id);
        let chain_info = self.chains.get_mut(chain).expect("chain exists");
        chain_info.full_list[level as usize - 1].push(id);
        id
    }

    fn build_virtual_subtree(
        &mut self,
        vc: &str,
        chain: &str,
        shape: &[LevelInfo],
        level: u32,
        address: String,
        preassigned: Option<VirtualCellId>,
        register: Option<&mut Vec<Vec<VirtualCellId>>>,
    ) -> VirtualCellId {
        let info = &shape[level as usize - 1];
        let id = VirtualCellId(self.virtuals.len() as u32);
        self.virtuals.push(VirtualCell {
            vc: vc.to_string(),
            chain: chain.to_string(),
            level,
            parent: None,
            children: Vec::new(),
            address: address.clone(),
            cell_type: info.cell_type.clone(),
            preassigned: preassigned.unwrap_or(id),
            physical_cell: None,
            pre_bound_physical: None,
            priority: Priority::FREE,
            used_leaves: BTreeMap::new(),
            healthiness: CellHealthiness::Healthy,
        });
        let mut register = register;
        if let Some(levels) = register.as_deref_mut() {
            levels[level as usize - 1].push(id);
        }

        let preassigned = preassigned.unwrap_or(id);
        let mut children = Vec::with_capacity(info.child_count as usize);
        for j in 0..info.child_count {
            let child_address = format!("{address}/{j}");
            let child = self.build_virtual_subtree(
                vc,
                chain,
                shape,
                level - 1,
                child_address,
                Some(preassigned),
                register.as_deref_mut(),
            );
            self.virtuals[child.0 as usize].parent = Some(id);
            children.push(child);
        }
        self.virtuals[id.0 as usize].children = children;
        id
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn phys(&self, id: PhysicalCellId) -> &PhysicalCell {
        &self.physical[id.0 as usize]
    }

    pub fn phys_mut(&mut self, id: PhysicalCellId) -> &mut PhysicalCell {
        &mut self.physical[id.0 as usize]
    }

    pub fn virt(&self, id: VirtualCellId) -> &VirtualCell {
        &self.virtuals[id.0 as usize]
    }

    pub fn virt_mut(&mut self, id: VirtualCellId) -> &mut VirtualCell {
        &mut self.virtuals[id.0 as usize]
    }

    /// Chain metadata. Panics on an unknown chain name; config
    /// validation guarantees every name the engine uses exists.
    pub fn chain(&self, name: &str) -> &ChainInfo {
        match self.chains.get(name) {
            Some(c) => c,
            None => panic!("chain {name} not found in the configured topology"),
        }
    }

    pub fn chain_opt(&self, name: &str) -> Option<&ChainInfo> {
        self.chains.get(name)
    }

    pub fn chains(&self) -> impl Iterator<Item = &ChainInfo> {
        self.chains.values()
    }

    pub fn chain_names(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(String::as_str)
    }

    /// Chains providing a GPU type, lexicographic order.
    pub fn chains_of_gpu_type(&self, gpu_type: &str) -> Option<&[String]> {
        self.gpu_type_chains.get(gpu_type).map(Vec::as_slice)
    }

    pub fn find_physical_by_address(&self, address: &str) -> Option<PhysicalCellId> {
        self.address_index.get(address).copied()
    }

    /// Look up the GPU leaf at (chain, node, gpu index).
    pub fn find_physical_gpu(
        &self,
        chain: &str,
        node: &str,
        gpu_index: u32,
    ) -> Option<PhysicalCellId> {
        let chain = self.chain_opt(chain)?;
        chain.full_list[0]
            .iter()
            .copied()
            .find(|&id| {
                let cell = self.phys(id);
                cell.nodes[0] == node && cell.gpu_indices[0] == gpu_index
            })
    }

    // ── Generic cell operations ─────────────────────────────────────

    pub fn level_of(&self, c: CellRef) -> u32 {
        match c {
            CellRef::Phys(id) => self.phys(id).level,
            CellRef::Virt(id) => self.virt(id).level,
        }
    }

    pub fn chain_of(&self, c: CellRef) -> &str {
        match c {
            CellRef::Phys(id) => &self.phys(id).chain,
            CellRef::Virt(id) => &self.virt(id).chain,
        }
    }

    pub fn parent_of(&self, c: CellRef) -> Option<CellRef> {
        match c {
            CellRef::Phys(id) => self.phys(id).parent.map(CellRef::Phys),
            CellRef::Virt(id) => self.virt(id).parent.map(CellRef::Virt),
        }
    }

    pub fn children_of(&self, c: CellRef) -> Vec<CellRef> {
        match c {
            CellRef::Phys(id) => self.phys(id).children.iter().copied().map(CellRef::Phys).collect(),
            CellRef::Virt(id) => self.virt(id).children.iter().copied().map(CellRef::Virt).collect(),
        }
    }

    pub fn priority_of(&self, c: CellRef) -> Priority {
        match c {
            CellRef::Phys(id) => self.phys(id).priority,
            CellRef::Virt(id) => self.virt(id).priority,
        }
    }

    pub fn healthiness_of(&self, c: CellRef) -> CellHealthiness {
        match c {
            CellRef::Phys(id) => self.phys(id).healthiness,
            CellRef::Virt(id) => self.virt(id).healthiness,
        }
    }

    pub fn address_of(&self, c: CellRef) -> &str {
        match c {
            CellRef::Phys(id) => &self.phys(id).address,
            CellRef::Virt(id) => &self.virt(id).address,
        }
    }

    pub fn leaf_count_of(&self, c: CellRef) -> u32 {
        self.chain(self.chain_of(c)).level(self.level_of(c)).leaf_count
    }

    /// Leaves used under the cell at the given priority or above.
    pub fn used_at_or_above(&self, c: CellRef, p: Priority) -> u32 {
        let used = match c {
            CellRef::Phys(id) => &self.phys(id).used_leaves,
            CellRef::Virt(id) => &self.virt(id).used_leaves,
        };
        used.range(p..).map(|(_, n)| n).sum()
    }

    /// Leaves under the cell a request at priority `p` may use: free
    /// leaves plus leaves held at strictly lower priorities.
    pub fn free_leaves_for(&self, c: CellRef, p: Priority) -> u32 {
        self.leaf_count_of(c)
            .saturating_sub(self.used_at_or_above(c, p))
    }

    /// Set a cell's priority, keeping every ancestor's priority the max
    /// of its children's.
    pub fn set_priority(&mut self, c: CellRef, p: Priority) {
        let original = self.priority_of(c);
        self.set_raw_priority(c, p);
        if let Some(parent) = self.parent_of(c) {
            let parent_priority = self.priority_of(parent);
            if p > parent_priority {
                self.set_priority(parent, p);
            } else if original == parent_priority && p < original {
                let max_buddy = self
                    .children_of(parent)
                    .into_iter()
                    .map(|b| self.priority_of(b))
                    .max()
                    .unwrap_or(Priority::FREE);
                self.set_priority(parent, max_buddy);
            }
        }
    }

    fn set_raw_priority(&mut self, c: CellRef, p: Priority) {
        match c {
            CellRef::Phys(id) => self.phys_mut(id).priority = p,
            CellRef::Virt(id) => self.virt_mut(id).priority = p,
        }
    }

    /// Adjust the used-leaf histogram of a cell and all its ancestors.
    pub fn update_used_leaves(&mut self, c: CellRef, p: Priority, delta: i32) {
        let mut cur = Some(c);
        while let Some(x) = cur {
            let used = match x {
                CellRef::Phys(id) => &mut self.phys_mut(id).used_leaves,
                CellRef::Virt(id) => &mut self.virt_mut(id).used_leaves,
            };
            let entry = used.entry(p).or_insert(0);
            let next = *entry as i64 + delta as i64;
            debug_assert!(next >= 0, "used-leaf histogram went negative");
            *entry = next.max(0) as u32;
            if *entry == 0 {
                used.remove(&p);
            }
            cur = self.parent_of(x);
        }
    }

    // ── Binding ─────────────────────────────────────────────────────

    /// Bind a physical and a virtual cell, walking up while the virtual
    /// ancestor chain is unbound. The bound virtual cells take on the
    /// physical side's healthiness.
    pub fn bind(&mut self, p: PhysicalCellId, v: VirtualCellId) {
        let (mut p, mut v) = (p, v);
        while self.virt(v).physical_cell.is_none() {
            self.phys_mut(p).virtual_cell = Some(v);
            let healthiness = self.phys(p).healthiness;
            let vcell = self.virt_mut(v);
            vcell.physical_cell = Some(p);
            vcell.healthiness = healthiness;
            match (self.virt(v).parent, self.phys(p).parent) {
                (Some(vp), Some(pp)) => {
                    v = vp;
                    p = pp;
                }
                _ => break,
            }
        }
    }

    /// Unbind a physical cell from its virtual counterpart, walking up
    /// while no sibling of the virtual cell remains bound. Stops at
    /// reserved cells, whose binding is static. The unbound virtual
    /// cells revert to healthy; doomed-bad accounting re-marks them
    /// when capacity is still short.
    pub fn unbind(&mut self, p: PhysicalCellId) {
        let Some(mut bound_virtual) = self.phys(p).virtual_cell else {
            return;
        };
        loop {
            let bound_physical = self
                .virt(bound_virtual)
                .physical_cell
                .expect("binding is symmetric");
            if self.phys(bound_physical).reserved {
                break;
            }
            self.phys_mut(bound_physical).virtual_cell = None;
            let vcell = self.virt_mut(bound_virtual);
            vcell.physical_cell = None;
            vcell.healthiness = CellHealthiness::Healthy;
            let Some(parent) = self.virt(bound_virtual).parent else {
                break;
            };
            let sibling_bound = self
                .virt(parent)
                .children
                .iter()
                .any(|&c| self.virt(c).physical_cell.is_some());
            if sibling_bound {
                break;
            }
            bound_virtual = parent;
        }
    }

    /// Record a temporary binding used within one mapping pass.
    pub fn pre_bind(&mut self, p: PhysicalCellId, v: VirtualCellId) {
        self.phys_mut(p).pre_bound_virtual = Some(v);
        self.virt_mut(v).pre_bound_physical = Some(p);
    }

    pub fn clear_pre_binding(&mut self, p: PhysicalCellId, v: VirtualCellId) {
        self.phys_mut(p).pre_bound_virtual = None;
        self.virt_mut(v).pre_bound_physical = None;
    }

    /// Set a physical cell's healthiness, mirroring it onto the bound
    /// virtual cell if one exists.
    pub fn set_phys_healthiness(&mut self, id: PhysicalCellId, h: CellHealthiness) {
        self.phys_mut(id).healthiness = h;
        if let Some(v) = self.phys(id).virtual_cell {
            self.virt_mut(v).healthiness = h;
        }
    }

    /// Number of all-bad cells at `level` in the subtree under `c`.
    pub fn bad_cells_at_level(&self, c: PhysicalCellId, level: u32) -> u32 {
        let cell = self.phys(c);
        if cell.level == level {
            return (cell.healthiness == CellHealthiness::Bad) as u32;
        }
        cell.children
            .clone()
            .into_iter()
            .map(|child| self.bad_cells_at_level(child, level))
            .sum()
    }
}
