//! Static scheduler configuration.
//!
//! The config describes the cell hierarchy of every chain, the physical
//! roots with their node addresses, and the per-tenant quotas. It is
//! ingested exactly once when the engine is constructed; there is no
//! dynamic reconfiguration.
//!
//! Cell addresses are derived from the config deterministically: a root
//! cell of chain `c` is addressed `c/<rootIndex>`, and every child
//! appends `/<childIndex>`. Reservations reference these addresses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors produced while validating a [`SchedulerConfig`] or while
/// constructing the engine from it.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("chain {0} is defined more than once")]
    DuplicateChain(String),

    #[error("chain {0} defines no levels")]
    EmptyChain(String),

    #[error("chain {chain}: exactly one level must be marked as the node level")]
    NodeLevel { chain: String },

    #[error("chain {chain} level {level}: child count must be at least 1 above the GPU level")]
    ChildCount { chain: String, level: u32 },

    #[error("cell references unknown chain {0}")]
    UnknownChain(String),

    #[error("root cell {root} of chain {chain}: expected {expected} nodes, got {got}")]
    NodeCountMismatch {
        chain: String,
        root: usize,
        expected: u32,
        got: usize,
    },

    #[error("virtual cluster {vc}: unknown cell type {cell_type} in chain {chain}")]
    UnknownCellType {
        vc: String,
        chain: String,
        cell_type: String,
    },

    #[error("reservation {id} of virtual cluster {vc}: unknown cell address {address}")]
    UnknownReservedCell {
        vc: String,
        id: String,
        address: String,
    },

    #[error("reservation {id} of virtual cluster {vc}: cell {address} is already reserved")]
    CellAlreadyReserved {
        vc: String,
        id: String,
        address: String,
    },

    #[error("illegal initial virtual cluster assignment: {0}")]
    IllegalInitialAssignment(String),
}

/// Complete static description of the cluster and its tenants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cell chain definitions, one per hardware class.
    pub chains: Vec<ChainSpec>,
    /// Physical root cells. Multiple roots per chain are allowed.
    pub physical_cluster: Vec<RootCellSpec>,
    /// Virtual clusters keyed by name.
    pub virtual_clusters: BTreeMap<String, VirtualClusterSpec>,
}

/// One cell chain: a rooted tree shape for one hardware class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSpec {
    /// Chain name, unique across the config.
    pub name: String,
    /// GPU type provided by this chain's leaves. Several chains may
    /// share a GPU type.
    pub gpu_type: String,
    /// Levels from the GPU leaves (first entry, level 1) up to the
    /// chain root (last entry).
    pub levels: Vec<LevelSpec>,
}

/// Shape of one level within a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelSpec {
    /// Cell type name at this level (e.g. "V100", "V100-node").
    pub cell_type: String,
    /// Number of child cells under each cell at this level. Must be 0
    /// at the GPU level and at least 1 everywhere else.
    #[serde(default)]
    pub child_count: u32,
    /// True for the single level whose cells correspond one-to-one to
    /// physical nodes.
    #[serde(default)]
    pub is_node_level: bool,
}

/// A physical root cell and the nodes it spans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCellSpec {
    /// The chain this root belongs to.
    pub chain: String,
    /// Node names, one per node-level cell under this root, in address
    /// order.
    pub nodes: Vec<String>,
}

/// Quota and reservations of one virtual cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualClusterSpec {
    /// Non-reserved quota entries.
    #[serde(default)]
    pub cells: Vec<VcCellQuota>,
    /// Pinned physical cells, each with a caller-chosen id.
    #[serde(default)]
    pub reservations: Vec<ReservationSpec>,
}

/// One quota entry: `count` cells of `cell_type` in `chain`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcCellQuota {
    pub chain: String,
    pub cell_type: String,
    pub count: u32,
}

/// A reservation pins one exact physical cell to a virtual cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationSpec {
    /// Reservation id, referenced by scheduling requests.
    pub id: String,
    /// The chain of the reserved cell.
    pub chain: String,
    /// Address of the exact physical cell (see module docs).
    pub cell_address: String,
}

impl SchedulerConfig {
    /// Parse a config from its TOML representation.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Structural validation of the config. Cross-checks that need the
    /// built topology (reservation addresses, quota capacity) happen in
    /// the engine constructor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut chains: BTreeMap<&str, &ChainSpec> = BTreeMap::new();
        for chain in &self.chains {
            if chains.insert(&chain.name, chain).is_some() {
                return Err(ConfigError::DuplicateChain(chain.name.clone()));
            }
            if chain.levels.is_empty() {
                return Err(ConfigError::EmptyChain(chain.name.clone()));
            }
            if chain.levels.iter().filter(|l| l.is_node_level).count() != 1 {
                return Err(ConfigError::NodeLevel {
                    chain: chain.name.clone(),
                });
            }
            for (i, level) in chain.levels.iter().enumerate() {
                let wants_children = i > 0;
                if wants_children && level.child_count == 0 {
                    return Err(ConfigError::ChildCount {
                        chain: chain.name.clone(),
                        level: i as u32 + 1,
                    });
                }
            }
        }

        for (i, root) in self.physical_cluster.iter().enumerate() {
            let chain = chains
                .get(root.chain.as_str())
                .ok_or_else(|| ConfigError::UnknownChain(root.chain.clone()))?;
            let expected = chain.node_cells_per_root();
            if root.nodes.len() != expected as usize {
                return Err(ConfigError::NodeCountMismatch {
                    chain: root.chain.clone(),
                    root: i,
                    expected,
                    got: root.nodes.len(),
                });
            }
        }

        for (vc, spec) in &self.virtual_clusters {
            for quota in &spec.cells {
                let chain = chains
                    .get(quota.chain.as_str())
                    .ok_or_else(|| ConfigError::UnknownChain(quota.chain.clone()))?;
                if chain.level_of(&quota.cell_type).is_none() {
                    return Err(ConfigError::UnknownCellType {
                        vc: vc.clone(),
                        chain: quota.chain.clone(),
                        cell_type: quota.cell_type.clone(),
                    });
                }
            }
            for r in &spec.reservations {
                if !chains.contains_key(r.chain.as_str()) {
                    return Err(ConfigError::UnknownChain(r.chain.clone()));
                }
            }
        }

        Ok(())
    }
}

impl ChainSpec {
    /// Number of levels in the chain; the root sits at this level.
    pub fn top_level(&self) -> u32 {
        self.levels.len() as u32
    }

    /// Level of the named cell type, if the chain has it.
    pub fn level_of(&self, cell_type: &str) -> Option<u32> {
        self.levels
            .iter()
            .position(|l| l.cell_type == cell_type)
            .map(|i| i as u32 + 1)
    }

    /// Number of node-level cells under one root cell.
    pub fn node_cells_per_root(&self) -> u32 {
        let node_level = self
            .levels
            .iter()
            .position(|l| l.is_node_level)
            .map(|i| i as u32 + 1)
            .unwrap_or(1);
        // Product of child counts strictly above the node level.
        (node_level + 1..=self.top_level())
            .map(|l| self.levels[l as usize - 1].child_count)
            .product()
    }

    /// Number of GPU leaves under one cell at the given level.
    pub fn leaves_per_cell(&self, level: u32) -> u32 {
        (2..=level)
            .map(|l| self.levels[l as usize - 1].child_count)
            .product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> ChainSpec {
        ChainSpec {
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
                    child_count: 4,
                    is_node_level: true,
                },
                LevelSpec {
                    cell_type: "V100-rack".to_string(),
                    child_count: 2,
                    is_node_level: false,
                },
            ],
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            chains: vec![chain()],
            physical_cluster: vec![RootCellSpec {
                chain: "V100".to_string(),
                nodes: vec!["n1".to_string(), "n2".to_string()],
            }],
            virtual_clusters: BTreeMap::new(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn leaves_per_cell_multiplies_fanouts() {
        let c = chain();
        assert_eq!(c.leaves_per_cell(1), 1);
        assert_eq!(c.leaves_per_cell(2), 4);
        assert_eq!(c.leaves_per_cell(3), 8);
    }

    #[test]
    fn node_count_mismatch_is_rejected() {
        let mut cfg = config();
        cfg.physical_cluster[0].nodes.pop();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NodeCountMismatch { .. })
        ));
    }

    #[test]
    fn missing_node_level_is_rejected() {
        let mut cfg = config();
        cfg.chains[0].levels[1].is_node_level = false;
        assert!(matches!(cfg.validate(), Err(ConfigError::NodeLevel { .. })));
    }

    #[test]
    fn unknown_quota_cell_type_is_rejected() {
        let mut cfg = config();
        cfg.virtual_clusters.insert(
            "tenant-a".to_string(),
            VirtualClusterSpec {
                cells: vec![VcCellQuota {
                    chain: "V100".to_string(),
                    cell_type: "A100-node".to_string(),
                    count: 1,
                }],
                reservations: vec![],
            },
        );
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnknownCellType { .. })
        ));
    }

    #[test]
    fn toml_round_trip() {
        let toml_str = r#"
[[chains]]
name = "V100"
gpu_type = "V100"
levels = [
    { cell_type = "V100" },
    { cell_type = "V100-node", child_count = 4, is_node_level = true },
    { cell_type = "V100-rack", child_count = 2 },
]

[[physical_cluster]]
chain = "V100"
nodes = ["n1", "n2"]

[virtual_clusters.tenant-a]
cells = [{ chain = "V100", cell_type = "V100-node", count = 1 }]
"#;
        let cfg = SchedulerConfig::from_toml_str(toml_str).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.chains[0].top_level(), 3);
        assert_eq!(cfg.virtual_clusters["tenant-a"].cells[0].count, 1);
    }
}
