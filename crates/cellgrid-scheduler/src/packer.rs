//! Topology-aware packing search.
//!
//! One routine serves all three scheduling modes: intra-VC scheduling
//! over a tenant's virtual cells, reservation-scoped scheduling over a
//! single reserved tree, and opportunistic scheduling over a chain's
//! physical cells. The caller picks the roots; the search is otherwise
//! identical.
//!
//! Pods are placed largest first. Each pod gets all its GPUs from one
//! cell at the lowest level that can hold it (never above the node
//! level, since a pod binds to a single node). Candidate cells are
//! ranked to pack tightly while avoiding preemption and unhealthy
//! hardware; within the chosen cell, leaves are taken best-fit-first,
//! free leaves before preemptible ones.
//!
//! The search never mutates the forest. Leaves taken for earlier pods
//! of the same group are tracked in a tentative overlay so later pods
//! see reduced availability and prefer co-located cells.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use cellgrid_topology::{CellForest, CellRef, Priority};
use cellgrid_types::{CellHealthiness, CellState};

/// One group placement request against a set of root cells.
pub(crate) struct PackRequest<'a> {
    pub priority: Priority,
    /// GPU count -> number of pods.
    pub pod_gpu_counts: &'a BTreeMap<u32, u32>,
    /// When set, cells whose nodes all lie in this set rank first.
    /// Virtual cells ignore it.
    pub suggested_nodes: Option<&'a BTreeSet<String>>,
}

/// Place a whole group or nothing. Returns, per GPU count, one leaf
/// list per pod.
pub(crate) fn place_group(
    forest: &CellForest,
    chain: &str,
    roots: &[CellRef],
    req: &PackRequest<'_>,
    pods_left: &dyn Fn(&str) -> u32,
) -> Option<BTreeMap<u32, Vec<Vec<CellRef>>>> {
    let mut pack = Pack {
        forest,
        chain,
        req,
        pods_left,
        tentative: HashMap::new(),
    };

    let mut pods: Vec<u32> = req
        .pod_gpu_counts
        .iter()
        .flat_map(|(&gpus, &count)| std::iter::repeat(gpus).take(count as usize))
        .collect();
    pods.sort_unstable_by(|a, b| b.cmp(a));

    let mut placements: BTreeMap<u32, Vec<Vec<CellRef>>> = BTreeMap::new();
    for &gpus in &pods {
        let Some(leaves) = pack.place_pod(roots, gpus) else {
            debug!(chain, gpus, priority = %req.priority, "packing failed, giving up on the group");
            return None;
        };
        placements.entry(gpus).or_default().push(leaves);
    }
    Some(placements)
}

struct Pack<'a> {
    forest: &'a CellForest,
    chain: &'a str,
    req: &'a PackRequest<'a>,
    pods_left: &'a dyn Fn(&str) -> u32,
    /// Leaves taken for this group so far, per cell and its ancestors.
    tentative: HashMap<CellRef, u32>,
}

impl<'a> Pack<'a> {
    fn avail(&self, c: CellRef) -> u32 {
        self.forest
            .free_leaves_for(c, self.req.priority)
            .saturating_sub(self.tentative.get(&c).copied().unwrap_or(0))
    }

    /// Record a taken leaf on itself and every ancestor.
    fn mark(&mut self, leaf: CellRef) {
        let mut cur = Some(leaf);
        while let Some(c) = cur {
            *self.tentative.entry(c).or_insert(0) += 1;
            cur = self.forest.parent_of(c);
        }
    }

    fn place_pod(&mut self, roots: &[CellRef], gpus: u32) -> Option<Vec<CellRef>> {
        let chain = self.forest.chain(self.chain);
        let node_level = chain.node_level();
        let target =
            (1..=node_level).find(|&l| chain.level(l).leaf_count >= gpus)?;

        let mut candidates = Vec::new();
        for &root in roots {
            self.collect_at_level(root, target, &mut candidates);
        }

        let best = candidates
            .into_iter()
            .filter(|&c| self.avail(c) >= gpus)
            .min_by_key(|&c| self.candidate_key(c))?;
        Some(self.take(best, gpus))
    }

    fn collect_at_level(&self, c: CellRef, level: u32, out: &mut Vec<CellRef>) {
        let l = self.forest.level_of(c);
        if l == level {
            out.push(c);
        } else if l > level {
            for child in self.forest.children_of(c) {
                self.collect_at_level(child, level, out);
            }
        }
    }

    /// Ranking of candidate cells for a pod. Smaller is better:
    /// suggested nodes first, healthy before bad, co-located with the
    /// group's earlier pods, fewest leaves needing preemption, tightest
    /// fit, then stable address order.
    fn candidate_key(&self, c: CellRef) -> (u8, u8, u8, u32, u32, String) {
        (
            self.suggested_miss(c),
            self.unhealthy(c),
            self.not_colocated(c),
            self.preempt_leaves(c),
            self.avail(c),
            self.forest.address_of(c).to_string(),
        )
    }

    fn suggested_miss(&self, c: CellRef) -> u8 {
        let (CellRef::Phys(id), Some(suggested)) = (c, self.req.suggested_nodes) else {
            return 0;
        };
        let all_in = self
            .forest
            .phys(id)
            .nodes
            .iter()
            .all(|n| suggested.contains(n));
        u8::from(!all_in)
    }

    fn unhealthy(&self, c: CellRef) -> u8 {
        u8::from(self.forest.healthiness_of(c) == CellHealthiness::Bad)
    }

    fn not_colocated(&self, c: CellRef) -> u8 {
        let mut cur = Some(c);
        while let Some(x) = cur {
            if self.tentative.get(&x).copied().unwrap_or(0) > 0 {
                return 0;
            }
            cur = self.forest.parent_of(x);
        }
        1
    }

    /// Leaves under the cell that would have to be preempted if taken.
    fn preempt_leaves(&self, c: CellRef) -> u32 {
        self.forest
            .used_at_or_above(c, Priority::OPPORTUNISTIC)
            .saturating_sub(self.forest.used_at_or_above(c, self.req.priority))
    }

    /// Rank of the pod(s) that would be evicted from a leaf: free
    /// leaves first, then lower-priority occupants, then occupants with
    /// fewer remaining pods, then by group name.
    fn victim_key(&self, c: CellRef) -> (i32, u32, String) {
        let priority = self.forest.priority_of(c);
        if let CellRef::Phys(id) = c {
            let cell = self.forest.phys(id);
            if matches!(cell.state, CellState::Used | CellState::Acquiring) {
                if let Some(name) = &cell.using_group {
                    return (priority.0, (self.pods_left)(name), name.clone());
                }
            }
        }
        (priority.0, 0, String::new())
    }

    /// Take `k` leaves under `c`. The caller guarantees availability.
    fn take(&mut self, c: CellRef, k: u32) -> Vec<CellRef> {
        if self.forest.level_of(c) == 1 {
            self.mark(c);
            return vec![c];
        }

        let kids: Vec<(CellRef, u32, usize)> = self
            .forest
            .children_of(c)
            .into_iter()
            .enumerate()
            .map(|(i, kid)| (kid, self.avail(kid), i))
            .collect();

        // Tightest single child that can hold the whole remainder.
        let fit = kids
            .iter()
            .filter(|&&(_, avail, _)| avail >= k)
            .min_by_key(|&&(kid, avail, i)| {
                let (p, left, name) = self.victim_key(kid);
                (avail, self.unhealthy(kid), p, left, name, i)
            });
        if let Some(&(kid, _, _)) = fit {
            return self.take(kid, k);
        }

        // Otherwise spread across children, draining the fullest first
        // so the pod touches as few subtrees as possible.
        let mut ordered = kids;
        ordered.sort_by(|a, b| {
            let ka = (std::cmp::Reverse(a.1), self.unhealthy(a.0), self.victim_key(a.0), a.2);
            let kb = (std::cmp::Reverse(b.1), self.unhealthy(b.0), self.victim_key(b.0), b.2);
            ka.cmp(&kb)
        });

        let mut out = Vec::with_capacity(k as usize);
        let mut remaining = k;
        for (kid, avail, _) in ordered {
            if remaining == 0 {
                break;
            }
            if avail == 0 {
                continue;
            }
            let t = avail.min(remaining);
            out.extend(self.take(kid, t));
            remaining -= t;
        }
        debug_assert!(remaining == 0, "availability changed during take");
        out
    }
}
