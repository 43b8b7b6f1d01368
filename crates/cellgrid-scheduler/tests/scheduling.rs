//! End-to-end scheduling scenarios driven through the public API.
//!
//! Every step re-checks the engine's invariants, so these double as
//! consistency tests for the counters and the preemption state machine.

use std::collections::BTreeMap;

use cellgrid_scheduler::{Scheduler, SchedulerError, SharedScheduler};
use cellgrid_types::config::{
    ChainSpec, LevelSpec, ReservationSpec, RootCellSpec, SchedulerConfig, VcCellQuota,
    VirtualClusterSpec,
};
use cellgrid_types::{
    AffinityGroupMember, AffinityGroupSpec, AffinityGroupState, CellHealthiness, PodBindInfo,
    PodScheduleResult, PodSchedulingSpec,
};

fn chain(name: &str, gpu_type: &str) -> ChainSpec {
    ChainSpec {
        name: name.to_string(),
        gpu_type: gpu_type.to_string(),
        levels: vec![
            LevelSpec {
                cell_type: gpu_type.to_string(),
                child_count: 0,
                is_node_level: false,
            },
            LevelSpec {
                cell_type: format!("{gpu_type}-node"),
                child_count: 2,
                is_node_level: true,
            },
            LevelSpec {
                cell_type: format!("{gpu_type}-quad"),
                child_count: 2,
                is_node_level: false,
            },
            LevelSpec {
                cell_type: format!("{gpu_type}-rack"),
                child_count: 2,
                is_node_level: false,
            },
        ],
    }
}

fn quota(chain: &str, cell_type: &str, count: u32) -> VirtualClusterSpec {
    VirtualClusterSpec {
        cells: vec![VcCellQuota {
            chain: chain.to_string(),
            cell_type: cell_type.to_string(),
            count,
        }],
        reservations: vec![],
    }
}

fn base_config() -> SchedulerConfig {
    let mut virtual_clusters = BTreeMap::new();
    virtual_clusters.insert("vc-a".to_string(), quota("DGX", "V100-node", 1));
    virtual_clusters.insert("vc-b".to_string(), quota("DGX", "V100-node", 1));
    SchedulerConfig {
        chains: vec![chain("DGX", "V100")],
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

fn ready(config: &SchedulerConfig) -> Scheduler {
    let mut engine = Scheduler::new(config).unwrap();
    for root in &config.physical_cluster {
        for node in &root.nodes {
            engine.add_node(node, true);
        }
    }
    check(&engine);
    engine
}

fn check(engine: &Scheduler) {
    let violations = engine.verify_invariants();
    assert!(violations.is_empty(), "invariant violations: {violations:?}");
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

fn expect_bind(result: PodScheduleResult) -> PodBindInfo {
    match result {
        PodScheduleResult::Bind { bind_info } => bind_info,
        other => panic!("expected a bind result, got {other:?}"),
    }
}

/// Bound virtual cells of a tenant at the quota-unit type.
fn bound_quota_cells(engine: &Scheduler, vc: &str, cell_type: &str) -> usize {
    engine
        .virtual_cluster_status(vc)
        .unwrap()
        .iter()
        .filter(|s| s.cell_type == cell_type && s.physical_cell.is_some())
        .count()
}

#[test]
fn schedule_bind_release_cycle() {
    let config = base_config();
    let mut engine = ready(&config);

    // A gang of two single-GPU pods inside one node-cell of quota.
    let spec = gang("job-1", "vc-a", 10, 2, 1);
    let first = expect_bind(engine.schedule("ns/job-1-0", &spec, &nodes()).unwrap());
    check(&engine);
    assert_eq!(first.gpu_isolation.len(), 1);
    assert!(nodes().contains(&first.node));
    assert_eq!(first.cell_chain, "DGX");
    let member = &first.affinity_group_bind_info[0];
    assert_eq!(member.pod_placements.len(), 2, "whole gang in the bind info");
    assert_eq!(
        member.pod_placements[0].preassigned_cell_types,
        vec!["V100-node"]
    );

    engine.add_allocated_pod("ns/job-1-0", &spec, &first);
    check(&engine);
    assert_eq!(bound_quota_cells(&engine, "vc-a", "V100-node"), 1);
    let status = engine.affinity_group("job-1").unwrap();
    assert_eq!(status.state, AffinityGroupState::Allocated);
    assert_eq!(status.pods[&1][0].as_deref(), Some("ns/job-1-0"));

    // The second pod of the gang gets the recorded placement, sharing
    // the node with the first.
    let second = expect_bind(engine.schedule("ns/job-1-1", &spec, &nodes()).unwrap());
    assert_eq!(second.node, first.node);
    assert_ne!(second.gpu_isolation, first.gpu_isolation);
    engine.add_allocated_pod("ns/job-1-1", &spec, &second);
    check(&engine);

    engine.delete_allocated_pod("ns/job-1-0", &spec, &first);
    check(&engine);
    assert!(engine.affinity_group("job-1").is_ok(), "one pod still bound");

    engine.delete_allocated_pod("ns/job-1-1", &spec, &second);
    check(&engine);
    assert_eq!(bound_quota_cells(&engine, "vc-a", "V100-node"), 0);
    assert!(engine.affinity_group("job-1").is_err());
    assert!(engine.affinity_groups().is_empty());
}

#[test]
fn oversized_guaranteed_request_is_a_bad_request() {
    let config = base_config();
    let mut engine = ready(&config);
    let spec = gang("job-big", "vc-a", 10, 1, 4);
    match engine.schedule("ns/p", &spec, &nodes()) {
        Err(SchedulerError::QuotaTooSmall { vc, gpu_number }) => {
            assert_eq!(vc, "vc-a");
            assert_eq!(gpu_number, 4);
        }
        other => panic!("expected QuotaTooSmall, got {other:?}"),
    }
    check(&engine);
}

#[test]
fn opportunistic_pods_use_surplus_capacity() {
    let config = base_config();
    let mut engine = ready(&config);

    let b = gang("job-b", "vc-b", 5, 1, 2);
    let b_info = expect_bind(engine.schedule("ns/b-0", &b, &nodes()).unwrap());
    engine.add_allocated_pod("ns/b-0", &b, &b_info);
    check(&engine);

    // Six GPUs remain; vc-a's quota is only two, but opportunistic
    // priority ignores quota entirely.
    let oppor = gang("job-opp", "vc-a", -1, 3, 2);
    let info = expect_bind(engine.schedule("ns/opp-0", &oppor, &nodes()).unwrap());
    engine.add_allocated_pod("ns/opp-0", &oppor, &info);
    check(&engine);
    // The borrowed cells appear in vc-a's status as opportunistic
    // entries backed by physical addresses.
    let statuses = engine.virtual_cluster_status("vc-a").unwrap();
    let borrowed = statuses
        .iter()
        .filter(|s| s.priority == -1 && s.physical_cell.is_some())
        .count();
    assert_eq!(borrowed, 6);

    // Nothing left: the next opportunistic request waits.
    let extra = gang("job-extra", "vc-b", -1, 1, 1);
    assert!(engine.schedule("ns/x-0", &extra, &nodes()).unwrap().is_wait());
    check(&engine);
}

#[test]
fn preemption_lifecycle_end_to_end() {
    let config = base_config();
    let mut engine = ready(&config);

    let low = gang("job-low", "vc-a", 10, 1, 2);
    let low_info = expect_bind(engine.schedule("ns/low-0", &low, &nodes()).unwrap());
    engine.add_allocated_pod("ns/low-0", &low, &low_info);
    check(&engine);

    let high = gang("job-high", "vc-a", 100, 1, 2);
    let result = engine.schedule("ns/high-0", &high, &nodes()).unwrap();
    let PodScheduleResult::Preempt { victims } = result else {
        panic!("expected preemption, got {result:?}");
    };
    assert_eq!(victims[&low_info.node].len(), 1);
    assert!(victims[&low_info.node].contains("ns/low-0"));
    check(&engine);
    assert_eq!(
        engine.affinity_group("job-low").unwrap().state,
        AffinityGroupState::BeingPreempted
    );

    // The host evicts the victim, then re-schedules the preemptor.
    engine.delete_allocated_pod("ns/low-0", &low, &low_info);
    check(&engine);
    let high_info = expect_bind(engine.schedule("ns/high-0", &high, &nodes()).unwrap());
    assert_eq!(high_info.node, low_info.node, "preemptor takes the same cells");
    engine.add_allocated_pod("ns/high-0", &high, &high_info);
    check(&engine);
    assert_eq!(
        engine.affinity_group("job-high").unwrap().state,
        AffinityGroupState::Allocated
    );
}

#[test]
fn racing_preemptors_resolve_by_priority() {
    let config = base_config();
    let mut engine = ready(&config);

    let low = gang("job-low", "vc-a", 10, 1, 2);
    let low_info = expect_bind(engine.schedule("ns/low-0", &low, &nodes()).unwrap());
    engine.add_allocated_pod("ns/low-0", &low, &low_info);

    let mid = gang("job-mid", "vc-a", 100, 1, 2);
    assert!(matches!(
        engine.schedule("ns/mid-0", &mid, &nodes()).unwrap(),
        PodScheduleResult::Preempt { .. }
    ));
    check(&engine);

    // A still higher priority request overlaps: the first preemptor is
    // canceled and its pod, never bound, is eventually deleted.
    let top = gang("job-top", "vc-a", 200, 1, 2);
    let result = engine.schedule("ns/top-0", &top, &nodes()).unwrap();
    let PodScheduleResult::Preempt { victims } = result else {
        panic!("expected preemption, got {result:?}");
    };
    assert!(victims[&low_info.node].contains("ns/low-0"));
    check(&engine);

    // Deleting the canceled preemptor's pod is a no-op now.
    engine.delete_unallocated_pod("ns/mid-0", &mid);
    check(&engine);

    // The winner completes its preemption.
    engine.delete_allocated_pod("ns/low-0", &low, &low_info);
    let top_info = expect_bind(engine.schedule("ns/top-0", &top, &nodes()).unwrap());
    engine.add_allocated_pod("ns/top-0", &top, &top_info);
    check(&engine);
    assert_eq!(
        engine.affinity_group("job-top").unwrap().state,
        AffinityGroupState::Allocated
    );
}

#[test]
fn canceling_the_last_preemptor_pod_releases_the_cells() {
    let config = base_config();
    let mut engine = ready(&config);

    let low = gang("job-low", "vc-a", 10, 1, 2);
    let low_info = expect_bind(engine.schedule("ns/low-0", &low, &nodes()).unwrap());
    engine.add_allocated_pod("ns/low-0", &low, &low_info);

    let high = gang("job-high", "vc-a", 100, 1, 2);
    assert!(matches!(
        engine.schedule("ns/high-0", &high, &nodes()).unwrap(),
        PodScheduleResult::Preempt { .. }
    ));
    check(&engine);

    // The preemptor pod goes away before ever binding; the victim gets
    // its cells back.
    engine.delete_unallocated_pod("ns/high-0", &high);
    check(&engine);
    let status = engine.cluster_status();
    let mut used_by_a = 0;
    let mut stack: Vec<_> = status.physical_cluster.iter().collect();
    while let Some(cell) = stack.pop() {
        if cell.level == 1
            && cell.state == cellgrid_types::CellState::Used
            && cell.vc.as_deref() == Some("vc-a")
        {
            used_by_a += 1;
            assert_eq!(cell.priority, 10, "the victim's priority is restored");
        }
        stack.extend(cell.children.iter());
    }
    assert_eq!(used_by_a, 2);
    let low_status = engine.affinity_group("job-low").unwrap();
    assert_eq!(low_status.pods[&2][0].as_deref(), Some("ns/low-0"));
}

#[test]
fn node_failures_doom_virtual_cells_deterministically() {
    let config = base_config();
    let mut engine = ready(&config);

    let quota_bad = |engine: &Scheduler, vc: &str| {
        engine
            .virtual_cluster_status(vc)
            .unwrap()
            .iter()
            .filter(|s| s.cell_type == "V100-node" && s.healthiness == CellHealthiness::Bad)
            .count()
    };

    for node in ["n4", "n3", "n2"] {
        engine.update_node(node, false);
        check(&engine);
    }
    // One healthy node still covers each tenant's single free cell.
    assert_eq!(quota_bad(&engine, "vc-a"), 0);
    assert_eq!(quota_bad(&engine, "vc-b"), 0);

    engine.update_node("n1", false);
    check(&engine);
    assert_eq!(quota_bad(&engine, "vc-a"), 1);
    assert_eq!(quota_bad(&engine, "vc-b"), 1);

    // Recovery reverses the marking exactly.
    engine.update_node("n1", true);
    check(&engine);
    assert_eq!(quota_bad(&engine, "vc-a"), 0);
    assert_eq!(quota_bad(&engine, "vc-b"), 0);

    for node in ["n2", "n3", "n4"] {
        engine.update_node(node, true);
        check(&engine);
    }
    let statuses = engine.virtual_cluster_status("vc-a").unwrap();
    assert!(statuses.iter().all(|s| s.healthiness == CellHealthiness::Healthy));
}

#[test]
fn reservations_pin_exact_cells() {
    let mut config = base_config();
    config.virtual_clusters.get_mut("vc-a").unwrap().reservations = vec![ReservationSpec {
        id: "rsv-1".to_string(),
        chain: "DGX".to_string(),
        // Second node cell of the first quad: n2.
        cell_address: "DGX/0/0/1".to_string(),
    }];
    let mut engine = ready(&config);

    let mut spec = gang("job-rsv", "vc-a", 10, 1, 2);
    spec.reservation_id = Some("rsv-1".to_string());
    let info = expect_bind(engine.schedule("ns/rsv-0", &spec, &nodes()).unwrap());
    assert_eq!(info.node, "n2", "reservation fixes the placement");
    engine.add_allocated_pod("ns/rsv-0", &spec, &info);
    check(&engine);

    engine.delete_allocated_pod("ns/rsv-0", &spec, &info);
    check(&engine);

    // Opportunistic pods may not use reservations.
    let mut oppor = gang("job-opp", "vc-a", -1, 1, 1);
    oppor.reservation_id = Some("rsv-1".to_string());
    assert!(matches!(
        engine.schedule("ns/opp-0", &oppor, &nodes()),
        Err(SchedulerError::OpportunisticReservation(_))
    ));
}

#[test]
fn gpu_type_must_exist_in_the_vc_for_guaranteed_pods() {
    let mut config = base_config();
    config.chains.push(chain("HGX", "H100"));
    config.physical_cluster.push(RootCellSpec {
        chain: "HGX".to_string(),
        nodes: vec!["h1".into(), "h2".into(), "h3".into(), "h4".into()],
    });
    config
        .virtual_clusters
        .insert("vc-h".to_string(), quota("HGX", "H100-node", 1));
    let mut engine = ready(&config);

    // vc-a has no H100 quota: guaranteed requests are bad requests.
    let mut spec = gang("job-h", "vc-a", 10, 1, 2);
    spec.gpu_type = Some("H100".to_string());
    assert!(matches!(
        engine.schedule("ns/h-0", &spec, &nodes()),
        Err(SchedulerError::GpuTypeNotInVc { .. })
    ));

    // The same request at opportunistic priority lands on the H100
    // chain's free cells.
    spec.priority = -1;
    let all: Vec<String> = nodes().into_iter().chain(["h1".into(), "h2".into(), "h3".into(), "h4".into()]).collect();
    let info = expect_bind(engine.schedule("ns/h-0", &spec, &all).unwrap());
    assert!(info.node.starts_with('h'));
    check(&engine);
}

#[test]
fn shared_handle_runs_the_same_flow() {
    let config = base_config();
    let shared = SharedScheduler::new(&config).unwrap();
    for node in nodes() {
        shared.add_node(&node, true);
    }

    let spec = gang("job-1", "vc-a", 10, 1, 2);
    let info = expect_bind(shared.schedule("ns/job-1-0", &spec, &nodes()).unwrap());
    shared.add_allocated_pod("ns/job-1-0", &spec, &info);
    assert_eq!(
        shared.affinity_group("job-1").unwrap().state,
        AffinityGroupState::Allocated
    );
    let status = shared.cluster_status();
    assert_eq!(status.physical_cluster.len(), 1);
    assert!(status.virtual_clusters.contains_key("vc-a"));
}
