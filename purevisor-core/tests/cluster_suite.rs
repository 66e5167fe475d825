//! Scheduler and cluster integration suite: SPREAD/PACK placement,
//! evacuation and rebalancing over a synthetic cluster.

extern crate std;

mod common;

use common::TestRam;

use purevisor_core::block::Uuid;
use purevisor_core::cluster::{Cluster, ClusterNode, NodeId, NodeState};
use purevisor_core::scheduler::{
    PlacementRequest, SchedPolicy, Scheduler, SchedulerConfig, SchedulerError,
};
use purevisor_core::vm_manager::{ManagedVmState, VmConfig, VmManager};

fn uuid(n: u64) -> Uuid {
    Uuid::from_timestamps(n, !n)
}

fn identical_node(name: &str) -> ClusterNode {
    let mut node = ClusterNode::new(name, "10.0.0.1", 7000, uuid(7));
    node.resources.cpu.total_threads = 16;
    node.resources.memory.total_bytes = 32 << 30;
    node.resources.memory.free_bytes = 24 << 30;
    node.resources.memory.used_bytes = 8 << 30;
    node
}

/// Cluster of three identical nodes with N1 carrying 3 VMs and N2/N3 one
/// each (the S7/S8 fixture).
fn spread_fixture() -> (Cluster, NodeId, NodeId, NodeId) {
    let mut cluster = Cluster::new("c0", uuid(1));
    let n1 = cluster.add_node(identical_node("N1"), 0).unwrap();
    let n2 = cluster.add_node(identical_node("N2"), 0).unwrap();
    let n3 = cluster.add_node(identical_node("N3"), 0).unwrap();
    cluster.node_mut(n1).unwrap().vm_count = 3;
    cluster.node_mut(n2).unwrap().vm_count = 1;
    cluster.node_mut(n3).unwrap().vm_count = 1;
    (cluster, n1, n2, n3)
}

/// S7: SPREAD always lands on one of the emptier nodes, never N1.
#[test]
fn spread_avoids_the_full_node() {
    let ram = TestRam::new(32 * 1024 * 1024);
    let pmm = ram.pmm();
    let (cluster, n1, n2, n3) = spread_fixture();
    let vms = VmManager::new(&pmm, n1);
    let mut sched = Scheduler::new(SchedulerConfig::default(), 42);

    for _ in 0..10 {
        let request = PlacementRequest::new(2, 1 << 30);
        let result = sched.schedule(&cluster, &vms, &request).unwrap();
        assert!(
            result.selected == n2 || result.selected == n3,
            "SPREAD picked the full node"
        );
        // The chosen node's score is the maximum among feasible nodes.
        for (_, alt_score) in result.alternatives.iter() {
            assert!(result.score >= *alt_score);
        }
    }
}

/// S8: PACK inverts the preference and picks the fullest node.
#[test]
fn pack_prefers_the_full_node() {
    let ram = TestRam::new(32 * 1024 * 1024);
    let pmm = ram.pmm();
    let (cluster, n1, _, _) = spread_fixture();
    let vms = VmManager::new(&pmm, n1);
    let mut sched = Scheduler::new(SchedulerConfig::default(), 42);

    let mut request = PlacementRequest::new(2, 1 << 30);
    request.policy = SchedPolicy::Pack;
    let result = sched.schedule(&cluster, &vms, &request).unwrap();
    assert_eq!(result.selected, n1);
}

/// With identical resources, fewer VMs means an equal-or-higher SPREAD
/// score.
#[test]
fn spread_score_monotone_in_vm_count() {
    let ram = TestRam::new(32 * 1024 * 1024);
    let pmm = ram.pmm();
    let (cluster, n1, n2, _) = spread_fixture();
    let vms = VmManager::new(&pmm, n1);
    let sched = Scheduler::new(SchedulerConfig::default(), 42);

    let request = PlacementRequest::new(2, 1 << 30);
    let busy = sched.score_node(cluster.node(n1).unwrap(), &request, &vms);
    let idle = sched.score_node(cluster.node(n2).unwrap(), &request, &vms);
    assert!(idle.total_score >= busy.total_score);
}

/// Every filter knocks out exactly the nodes it should.
#[test]
fn feasibility_filters() {
    let ram = TestRam::new(32 * 1024 * 1024);
    let pmm = ram.pmm();
    let mut cluster = Cluster::new("c0", uuid(1));
    let good = cluster.add_node(identical_node("good"), 0).unwrap();
    let offline = cluster.add_node(identical_node("offline"), 0).unwrap();
    let sick = cluster.add_node(identical_node("sick"), 0).unwrap();
    let tagged = cluster.add_node(identical_node("tagged"), 0).unwrap();

    cluster.node_mut(offline).unwrap().set_state(NodeState::Offline);
    cluster.node_mut(sick).unwrap().health.score = 25;
    cluster.node_mut(tagged).unwrap().add_tag("ssd");

    let vms = VmManager::new(&pmm, good);
    let mut sched = Scheduler::new(SchedulerConfig::default(), 7);

    // Tag-constrained request only fits the tagged node.
    let mut request = PlacementRequest::new(2, 1 << 30);
    request.require_tag("ssd");
    let result = sched.schedule(&cluster, &vms, &request).unwrap();
    assert_eq!(result.selected, tagged);

    // Forbidding it leaves nothing feasible.
    request.forbid("tagged");
    assert!(matches!(
        sched.schedule(&cluster, &vms, &request),
        Err(SchedulerError::NoFeasibleNode)
    ));

    // Oversized requests are refused by the capacity filters.
    let huge = PlacementRequest::new(1000, 1 << 30);
    assert!(matches!(
        sched.schedule(&cluster, &vms, &huge),
        Err(SchedulerError::NoFeasibleNode)
    ));
}

/// RANDOM picks only feasible nodes.
#[test]
fn random_policy_stays_feasible() {
    let ram = TestRam::new(32 * 1024 * 1024);
    let pmm = ram.pmm();
    let (mut cluster, n1, n2, n3) = spread_fixture();
    cluster.node_mut(n1).unwrap().set_state(NodeState::Failed);
    let vms = VmManager::new(&pmm, n2);
    let mut sched = Scheduler::new(SchedulerConfig::default(), 1234);

    for _ in 0..20 {
        let mut request = PlacementRequest::new(2, 1 << 30);
        request.policy = SchedPolicy::Random;
        let result = sched.schedule(&cluster, &vms, &request).unwrap();
        assert!(result.selected == n2 || result.selected == n3);
    }
}

/// Evacuation drains a node: every VM either moves or ends up errored.
#[test]
fn evacuation_empties_the_node() {
    let ram = TestRam::new(128 * 1024 * 1024);
    let pmm = ram.pmm();
    let mut cluster = Cluster::new("c0", uuid(1));
    let n1 = cluster.add_node(identical_node("N1"), 0).unwrap();
    let _n2 = cluster.add_node(identical_node("N2"), 0).unwrap();

    let mut vms = VmManager::new(&pmm, n1);
    let mut ids = std::vec::Vec::new();
    for i in 0..3 {
        let name = std::format!("vm{i}");
        let id = vms.create(VmConfig::new(&name, 1, 2 << 20), uuid(50 + i), 0);
        vms.start(id, &mut cluster, 0).unwrap();
        ids.push(id);
    }
    // One VM is stopped and therefore not migratable.
    vms.stop(ids[2], &mut cluster, 10).unwrap();

    let mut sched = Scheduler::new(SchedulerConfig::default(), 9);
    sched.evacuate_node(&mut cluster, &mut vms, n1).unwrap();

    for &id in &ids {
        let vm = vms.find(id).unwrap();
        assert!(
            vm.host_node != n1 || vm.state == ManagedVmState::Error,
            "vm {id} still hosted on the evacuated node"
        );
    }
    assert_eq!(cluster.node(n1).unwrap().vm_count, 0);
}

/// Rebalancing moves one VM when the spread exceeds the threshold.
#[test]
fn rebalance_moves_one_vm() {
    let ram = TestRam::new(128 * 1024 * 1024);
    let pmm = ram.pmm();
    let mut cluster = Cluster::new("c0", uuid(1));
    let n1 = cluster.add_node(identical_node("N1"), 0).unwrap();
    let n2 = cluster.add_node(identical_node("N2"), 0).unwrap();

    let mut vms = VmManager::new(&pmm, n1);
    for i in 0..4 {
        let name = std::format!("vm{i}");
        let id = vms.create(VmConfig::new(&name, 1, 2 << 20), uuid(60 + i), 0);
        vms.start(id, &mut cluster, 0).unwrap();
    }
    assert_eq!(cluster.node(n1).unwrap().vm_count, 4);

    let mut sched = Scheduler::new(SchedulerConfig::default(), 11);
    assert!(sched.rebalance(&mut cluster, &mut vms).unwrap());
    assert_eq!(cluster.node(n1).unwrap().vm_count, 3);
    assert_eq!(cluster.node(n2).unwrap().vm_count, 1);

    // 3 vs 1 is within the threshold; no further moves.
    assert!(!sched.rebalance(&mut cluster, &mut vms).unwrap());
}

/// Failure detection drops quorum and re-elects deterministically.
#[test]
fn quorum_and_failover() {
    let mut cluster = Cluster::new("c0", uuid(1));
    let n1 = cluster.add_node(identical_node("N1"), 0).unwrap();
    let n2 = cluster.add_node(identical_node("N2"), 0).unwrap();
    let n3 = cluster.add_node(identical_node("N3"), 0).unwrap();
    cluster.set_local_node(n3);
    cluster.elect_leader();
    assert_eq!(cluster.leader_id, Some(n1));
    assert!(cluster.check_quorum());

    // N1 goes silent; N2 keeps heartbeating.
    cluster.record_heartbeat(n2, 4000).unwrap();
    cluster.tick(6000);
    assert_eq!(cluster.node(n1).unwrap().state, NodeState::Failed);
    assert_eq!(cluster.leader_id, Some(n2));
    assert!(cluster.has_quorum); // 2 of 3 still online

    // N2 fails too: quorum is lost.
    cluster.tick(12_000);
    assert_eq!(cluster.node(n2).unwrap().state, NodeState::Failed);
    assert!(!cluster.has_quorum);
    assert_eq!(cluster.leader_id, Some(n3));
}
