//! Raft integration suite: elections and replicated storage writes over a
//! synchronous in-memory network, including partition behavior.

extern crate std;

use std::boxed::Box;
use std::collections::VecDeque;
use std::vec::Vec;

use purevisor_core::block::Uuid;
use purevisor_core::distributed::DistributedStorage;
use purevisor_core::memblk::MemBlockDevice;
use purevisor_core::pool::StoragePool;
use purevisor_core::raft::{RaftRole, RaftTransport, ELECTION_MAX_MS, HEARTBEAT_MS};

fn uuid(n: u64) -> Uuid {
    Uuid::from_timestamps(n, !n)
}

/// Captures outbound frames tagged with their sender.
struct Outbox {
    from: u32,
    frames: Vec<(u32, Vec<u8>)>,
}

impl RaftTransport for Outbox {
    fn send(&mut self, to: u32, bytes: &[u8]) {
        self.frames.push((to, bytes.to_vec()));
    }
}

/// A cluster of storage nodes joined by a lossless synchronous network.
/// Nodes listed in `isolated` neither send nor receive.
struct SimCluster {
    nodes: Vec<(u32, DistributedStorage, StoragePool)>,
    isolated: Vec<u32>,
}

impl SimCluster {
    fn new(ids: &[u32]) -> Self {
        let mut nodes = Vec::new();
        for &id in ids {
            let mut dist = DistributedStorage::new(id, 0x5EED_0000 + id as u64, uuid(id as u64));
            for &peer in ids.iter().filter(|&&p| p != id) {
                dist.join(peer).unwrap();
            }
            let mut pool = StoragePool::new("tank", uuid(100 + id as u64));
            pool.add_device(Box::new(MemBlockDevice::new(
                "mem0",
                16 * 1024 * 1024,
                uuid(200 + id as u64),
            )))
            .unwrap();
            pool.create_volume("v", 8 * 1024 * 1024, 0, true, uuid(300 + id as u64))
                .unwrap();
            nodes.push((id, dist, pool));
        }
        SimCluster {
            nodes,
            isolated: Vec::new(),
        }
    }

    fn node(&self, id: u32) -> &DistributedStorage {
        &self.nodes.iter().find(|(n, _, _)| *n == id).unwrap().1
    }

    fn node_mut(&mut self, id: u32) -> (&mut DistributedStorage, &mut StoragePool) {
        let entry = self.nodes.iter_mut().find(|(n, _, _)| *n == id).unwrap();
        (&mut entry.1, &mut entry.2)
    }

    /// Tick one node and deliver all resulting traffic to quiescence.
    fn tick_node(&mut self, id: u32, now_ms: u64) {
        let mut outbox = Outbox {
            from: id,
            frames: Vec::new(),
        };
        {
            let (dist, pool) = self.node_mut(id);
            dist.tick(now_ms, &mut outbox, pool);
        }
        self.deliver(outbox, now_ms);
    }

    /// Tick every node at `now_ms`.
    fn tick_all(&mut self, now_ms: u64) {
        let ids: Vec<u32> = self.nodes.iter().map(|(id, _, _)| *id).collect();
        for id in ids {
            self.tick_node(id, now_ms);
        }
    }

    /// Deliver frames, including any triggered in response, dropping
    /// traffic to and from isolated nodes.
    fn deliver(&mut self, outbox: Outbox, now_ms: u64) {
        let mut queue: VecDeque<(u32, u32, Vec<u8>)> = outbox
            .frames
            .into_iter()
            .map(|(to, bytes)| (outbox.from, to, bytes))
            .collect();
        while let Some((from, to, bytes)) = queue.pop_front() {
            if self.isolated.contains(&from) || self.isolated.contains(&to) {
                continue;
            }
            if !self.nodes.iter().any(|(id, _, _)| *id == to) {
                continue;
            }
            let mut next = Outbox {
                from: to,
                frames: Vec::new(),
            };
            {
                let (dist, pool) = self.node_mut(to);
                let _ = dist.receive(&bytes, now_ms, &mut next, pool);
            }
            for (dest, frame) in next.frames {
                queue.push_back((to, dest, frame));
            }
        }
    }

    fn leaders(&self) -> Vec<u32> {
        self.nodes
            .iter()
            .filter(|(_, d, _)| d.role() == RaftRole::Leader)
            .map(|(id, _, _)| *id)
            .collect()
    }
}

/// S5: in a two-node cluster with the peer isolated, the candidate can
/// never reach majority and its term grows without bound.
#[test]
fn two_nodes_no_majority_never_elects() {
    let mut sim = SimCluster::new(&[1, 2]);
    sim.isolated.push(2);

    let mut now = 0;
    let mut last_term = 0;
    for round in 1..=8 {
        now += ELECTION_MAX_MS + 1;
        sim.tick_node(1, now);
        let node = sim.node(1);
        assert_ne!(node.role(), RaftRole::Leader, "round {round}");
        assert!(node.raft().current_term() > last_term);
        last_term = node.raft().current_term();
    }
    assert!(sim.leaders().is_empty());
}

/// Drive node 1 to leadership: time out its election while the others are
/// still inside their windows, then deliver the vote traffic.
fn elect_node_one(sim: &mut SimCluster) -> u64 {
    let now = ELECTION_MAX_MS + 1;
    sim.tick_node(1, now);
    assert_eq!(sim.node(1).role(), RaftRole::Leader);
    now
}

/// S6: a replicated write reaches every node's local volume within two
/// heartbeat cycles, applied exactly once per node.
#[test]
fn three_node_write_replication() {
    let mut sim = SimCluster::new(&[1, 2, 3]);
    let mut now = elect_node_one(&mut sim);

    {
        let (dist, _) = sim.node_mut(1);
        dist.write("v", 0, b"X").unwrap();
    }

    // Two full heartbeat cycles replicate and commit.
    for _ in 0..3 {
        now += HEARTBEAT_MS;
        sim.tick_all(now);
    }

    for id in [1, 2, 3] {
        let mut buf = [0u8; 1];
        let (dist, pool) = sim.node_mut(id);
        let pool_writes = pool.stats.write_ops;
        dist.read(pool, "v", 0, &mut buf).unwrap();
        assert_eq!(&buf, b"X", "node {id} missing replicated write");
        // The write entry applied exactly once per node.
        assert_eq!(pool_writes, 1, "node {id} applied {pool_writes} times");
    }

    // Log matching: identical (term, payload) at every index on all nodes.
    let last = sim.node(1).raft().last_index();
    for idx in 1..=last {
        let reference = sim.node(1).raft().entry(idx).unwrap().clone();
        for id in [2u32, 3] {
            let entry = sim.node(id).raft().entry(idx).unwrap();
            assert_eq!(entry.term, reference.term, "index {idx} term differs");
            assert_eq!(entry.data, reference.data, "index {idx} payload differs");
        }
    }
}

/// Election uniqueness: across repeated elections there is never more
/// than one leader, and never two leaders in the same term.
#[test]
fn at_most_one_leader_per_term() {
    let mut sim = SimCluster::new(&[1, 2, 3]);
    let mut now = elect_node_one(&mut sim);
    assert_eq!(sim.leaders(), std::vec![1]);
    let first_term = sim.node(1).raft().current_term();

    // Partition the leader away; the remaining pair elects a successor in
    // a strictly higher term.
    sim.isolated.push(1);
    now += ELECTION_MAX_MS + 1;
    sim.tick_node(2, now);
    let leaders = sim.leaders();
    // Node 1 still believes it leads its old term, but no two leaders
    // share a term.
    assert!(leaders.len() <= 2);
    let term2 = sim.node(2).raft().current_term();
    assert!(term2 > first_term);
    if sim.node(2).role() == RaftRole::Leader {
        assert_ne!(sim.node(1).raft().current_term(), term2);
    }

    // Heal the partition: the deposed leader steps down on first contact.
    sim.isolated.clear();
    now += HEARTBEAT_MS;
    sim.tick_all(now);
    assert_eq!(sim.leaders().len(), 1);
}

/// A follower that missed entries is caught up by next_index backtracking.
#[test]
fn lagging_follower_catches_up() {
    let mut sim = SimCluster::new(&[1, 2, 3]);
    let mut now = elect_node_one(&mut sim);

    // Node 3 misses a batch of writes. Its clock does not advance while
    // partitioned, so it cannot disrupt with a higher-term election.
    sim.isolated.push(3);
    for i in 0..5u8 {
        let (dist, _) = sim.node_mut(1);
        dist.write("v", i as u64 * 4096, &[b'A' + i]).unwrap();
        now += HEARTBEAT_MS;
        sim.tick_node(1, now);
        sim.tick_node(2, now);
    }
    assert!(sim.node(3).raft().last_index() < sim.node(1).raft().last_index());

    // Reconnect and let heartbeats repair the log.
    sim.isolated.clear();
    for _ in 0..4 {
        now += HEARTBEAT_MS;
        sim.tick_all(now);
    }
    assert_eq!(
        sim.node(3).raft().last_index(),
        sim.node(1).raft().last_index()
    );
    let mut buf = [0u8; 1];
    let (dist, pool) = sim.node_mut(3);
    dist.read(pool, "v", 4 * 4096, &mut buf).unwrap();
    assert_eq!(&buf, b"E");
}

/// Followers refuse writes; the caller is told to redirect.
#[test]
fn follower_refuses_writes() {
    let mut sim = SimCluster::new(&[1, 2, 3]);
    elect_node_one(&mut sim);
    let (dist, _) = sim.node_mut(2);
    assert!(dist.write("v", 0, b"nope").is_err());
}
