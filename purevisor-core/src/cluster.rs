//! Cluster membership, node health and leadership.
//!
//! The cluster owns its nodes as a vector; back-references everywhere else
//! are [`NodeId`] handles resolved through the cluster. Deterministic
//! election (lowest-id Online node) is only authoritative while Raft is
//! not running; when the consensus layer is active its leader overrides.
//!
//! `tick` is the failure detector: an Online non-local node whose last
//! heartbeat is older than [`HEALTH_TIMEOUT_MS`] transitions to Failed,
//! the online count drops, and quorum and leadership are recomputed.

use alloc::boxed::Box;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::block::Uuid;
use crate::log;

pub const HEALTH_TIMEOUT_MS: u64 = 5000;
pub const HEARTBEAT_INTERVAL_MS: u64 = 500;
pub const MAX_NODES: usize = 64;
pub const MAX_TAGS: usize = 8;

/// Stable node handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unknown,
    Joining,
    Online,
    Degraded,
    Offline,
    Leaving,
    Failed,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Unknown => "UNKNOWN",
            NodeState::Joining => "JOINING",
            NodeState::Online => "ONLINE",
            NodeState::Degraded => "DEGRADED",
            NodeState::Offline => "OFFLINE",
            NodeState::Leaving => "LEAVING",
            NodeState::Failed => "FAILED",
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeRole: u32 {
        const COMPUTE    = 1 << 0;
        const STORAGE    = 1 << 1;
        const NETWORK    = 1 << 2;
        const MANAGEMENT = 1 << 3;
    }
}

#[derive(Debug, Clone, Default)]
pub struct CpuResources {
    pub total_threads: u32,
    pub vmx_supported: bool,
    pub model: heapless::String<64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryResources {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StorageResources {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct NodeResources {
    pub cpu: CpuResources,
    pub memory: MemoryResources,
    pub storage: StorageResources,
}

#[derive(Debug, Clone, Copy)]
pub struct NodeHealth {
    /// 0..=100; each unhealthy subsystem costs 25 points.
    pub score: u32,
    pub cpu_healthy: bool,
    pub memory_healthy: bool,
    pub storage_healthy: bool,
    pub network_healthy: bool,
    pub failed_checks: u64,
    pub consecutive_failures: u32,
    pub last_heartbeat_ms: u64,
    pub last_check_ms: u64,
}

impl Default for NodeHealth {
    fn default() -> Self {
        NodeHealth {
            score: 100,
            cpu_healthy: true,
            memory_healthy: true,
            storage_healthy: true,
            network_healthy: true,
            failed_checks: 0,
            consecutive_failures: 0,
            last_heartbeat_ms: 0,
            last_check_ms: 0,
        }
    }
}

/// One cluster member.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    pub id: NodeId,
    pub name: heapless::String<32>,
    pub address: heapless::String<48>,
    pub port: u16,
    pub uuid: Uuid,
    pub roles: NodeRole,
    pub state: NodeState,
    pub resources: NodeResources,
    pub health: NodeHealth,
    pub tags: heapless::Vec<heapless::String<16>, MAX_TAGS>,
    pub vm_count: u32,
    pub total_migrations: u32,
    pub joined_ms: u64,
    pub uptime_ms: u64,
    pub is_local: bool,
}

impl ClusterNode {
    pub fn new(name: &str, address: &str, port: u16, uuid: Uuid) -> Self {
        let mut n = heapless::String::new();
        let _ = n.push_str(name);
        let mut a = heapless::String::new();
        let _ = a.push_str(address);
        ClusterNode {
            id: NodeId(0),
            name: n,
            address: a,
            port,
            uuid,
            roles: NodeRole::empty(),
            state: NodeState::Unknown,
            resources: NodeResources::default(),
            health: NodeHealth::default(),
            tags: heapless::Vec::new(),
            vm_count: 0,
            total_migrations: 0,
            joined_ms: 0,
            uptime_ms: 0,
            is_local: false,
        }
    }

    pub fn set_state(&mut self, state: NodeState) {
        let old = self.state;
        self.state = state;
        log!(
            "node '{}': state {} -> {}",
            self.name,
            old.as_str(),
            state.as_str()
        );
    }

    pub fn add_role(&mut self, role: NodeRole) {
        self.roles |= role;
    }

    pub fn remove_role(&mut self, role: NodeRole) {
        self.roles &= !role;
    }

    pub fn add_tag(&mut self, tag: &str) -> bool {
        if self.tags.is_full() {
            return false;
        }
        let mut t = heapless::String::new();
        let _ = t.push_str(tag);
        self.tags.push(t).is_ok()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.as_str() == tag)
    }

    /// Recompute per-subsystem health and the aggregate score.
    pub fn health_check(&mut self, now_ms: u64) -> u32 {
        self.health.last_check_ms = now_ms;
        self.health.cpu_healthy = self.resources.cpu.total_threads > 0;
        self.health.memory_healthy = self.resources.memory.free_bytes > 0;
        self.health.storage_healthy = true;
        self.health.network_healthy = true;

        let mut score = 100u32;
        for healthy in [
            self.health.cpu_healthy,
            self.health.memory_healthy,
            self.health.storage_healthy,
            self.health.network_healthy,
        ] {
            if !healthy {
                score -= 25;
            }
        }
        self.health.score = score;
        if score < 50 {
            self.health.failed_checks += 1;
            self.health.consecutive_failures += 1;
        } else {
            self.health.consecutive_failures = 0;
        }
        score
    }
}

/// Membership change notifications, implemented by the collaborator that
/// cares (the management layer, the Raft bootstrap) and stored at
/// construction.
pub trait ClusterEvents {
    fn on_node_join(&mut self, _node: NodeId) {}
    fn on_node_leave(&mut self, _node: NodeId) {}
    fn on_leader_change(&mut self, _leader: NodeId) {}
}

/// No-op event sink.
pub struct NullEvents;

impl ClusterEvents for NullEvents {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterError {
    NodeNotFound,
    ClusterFull,
}

/// The cluster: owning list of nodes plus aggregate state.
pub struct Cluster {
    pub name: heapless::String<32>,
    pub uuid: Uuid,
    nodes: Vec<ClusterNode>,
    next_node_id: u32,
    pub online_count: u32,
    pub leader_id: Option<NodeId>,
    pub is_leader: bool,
    pub quorum_size: u32,
    pub has_quorum: bool,
    local_node: Option<NodeId>,
    pub total_cpu_threads: u64,
    pub total_memory: u64,
    pub total_storage: u64,
    events: Box<dyn ClusterEvents + Send>,
}

impl Cluster {
    pub fn new(name: &str, uuid: Uuid) -> Self {
        Self::with_events(name, uuid, Box::new(NullEvents))
    }

    pub fn with_events(name: &str, uuid: Uuid, events: Box<dyn ClusterEvents + Send>) -> Self {
        let mut n = heapless::String::new();
        let _ = n.push_str(name);
        log!("cluster: created '{}' ({})", name, uuid);
        Cluster {
            name: n,
            uuid,
            nodes: Vec::new(),
            next_node_id: 1,
            online_count: 0,
            leader_id: None,
            is_leader: false,
            quorum_size: 1,
            has_quorum: false,
            local_node: None,
            total_cpu_threads: 0,
            total_memory: 0,
            total_storage: 0,
            events,
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut ClusterNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.name.as_str() == name)
    }

    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [ClusterNode] {
        &mut self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn local_node(&self) -> Option<NodeId> {
        self.local_node
    }

    pub fn set_local_node(&mut self, id: NodeId) {
        self.local_node = Some(id);
        if let Some(n) = self.node_mut(id) {
            n.is_local = true;
        }
    }

    /// Add a node: Joining → Online, recompute quorum and aggregates,
    /// fire the join event.
    pub fn add_node(&mut self, mut node: ClusterNode, now_ms: u64) -> Result<NodeId, ClusterError> {
        if self.nodes.len() >= MAX_NODES {
            return Err(ClusterError::ClusterFull);
        }
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        node.id = id;
        node.set_state(NodeState::Joining);
        node.joined_ms = now_ms;
        node.health.last_heartbeat_ms = now_ms;
        node.set_state(NodeState::Online);
        self.nodes.push(node);

        self.quorum_size = self.nodes.len() as u32 / 2 + 1;
        self.update_stats();
        self.check_quorum();
        self.events.on_node_join(id);
        log!(
            "cluster '{}': node {} joined ({} nodes)",
            self.name,
            id.0,
            self.nodes.len()
        );
        Ok(id)
    }

    /// Remove a node: Leaving, unlink, recompute quorum, fire the event.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), ClusterError> {
        let idx = self
            .nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or(ClusterError::NodeNotFound)?;
        self.nodes[idx].set_state(NodeState::Leaving);
        self.nodes.remove(idx);

        self.quorum_size = if self.nodes.is_empty() {
            1
        } else {
            self.nodes.len() as u32 / 2 + 1
        };
        self.update_stats();
        self.check_quorum();
        self.events.on_node_leave(id);
        log!(
            "cluster '{}': node {} left ({} nodes)",
            self.name,
            id.0,
            self.nodes.len()
        );
        Ok(())
    }

    /// Deterministic election: the lowest-id Online node leads. Only used
    /// while Raft is inactive.
    pub fn elect_leader(&mut self) -> Option<NodeId> {
        let leader = self
            .nodes
            .iter()
            .filter(|n| n.state == NodeState::Online)
            .min_by_key(|n| n.id)?
            .id;
        let old = self.leader_id;
        self.leader_id = Some(leader);
        self.is_leader = self.local_node == Some(leader);
        if old != Some(leader) {
            log!("cluster '{}': new leader {}", self.name, leader.0);
            self.events.on_leader_change(leader);
        }
        Some(leader)
    }

    pub fn check_quorum(&mut self) -> bool {
        self.has_quorum = self.online_count >= self.quorum_size;
        self.has_quorum
    }

    /// Recompute aggregate resources and the online count.
    pub fn update_stats(&mut self) {
        self.online_count = 0;
        self.total_cpu_threads = 0;
        self.total_memory = 0;
        self.total_storage = 0;
        for node in self.nodes.iter().filter(|n| n.state == NodeState::Online) {
            self.online_count += 1;
            self.total_cpu_threads += node.resources.cpu.total_threads as u64;
            self.total_memory += node.resources.memory.total_bytes;
            self.total_storage += node.resources.storage.total_bytes;
        }
    }

    /// Record a heartbeat from a remote node.
    pub fn record_heartbeat(&mut self, id: NodeId, now_ms: u64) -> Result<(), ClusterError> {
        let node = self.node_mut(id).ok_or(ClusterError::NodeNotFound)?;
        node.health.last_heartbeat_ms = now_ms;
        Ok(())
    }

    /// Failure detector: stale Online non-local nodes fail, then quorum
    /// and leadership are recomputed. Uptimes refresh for live nodes.
    pub fn tick(&mut self, now_ms: u64) {
        let mut failed_any = false;
        for node in self.nodes.iter_mut() {
            if node.state == NodeState::Online && !node.is_local {
                let elapsed = now_ms.saturating_sub(node.health.last_heartbeat_ms);
                if elapsed > HEALTH_TIMEOUT_MS {
                    node.set_state(NodeState::Failed);
                    failed_any = true;
                }
            }
            if node.state == NodeState::Online {
                node.uptime_ms = now_ms.saturating_sub(node.joined_ms);
            }
        }
        if failed_any {
            self.update_stats();
            self.check_quorum();
            self.elect_leader();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> ClusterNode {
        let mut n = ClusterNode::new(name, "10.0.0.1", 7000, Uuid::from_timestamps(1, 2));
        n.resources.cpu.total_threads = 8;
        n.resources.memory.total_bytes = 8 << 30;
        n.resources.memory.free_bytes = 6 << 30;
        n
    }

    #[test]
    fn quorum_tracks_membership() {
        let mut cluster = Cluster::new("test", Uuid::from_timestamps(3, 4));
        let a = cluster.add_node(node("a"), 0).unwrap();
        assert_eq!(cluster.quorum_size, 1);
        cluster.add_node(node("b"), 0).unwrap();
        cluster.add_node(node("c"), 0).unwrap();
        assert_eq!(cluster.quorum_size, 2);
        assert!(cluster.check_quorum());
        cluster.remove_node(a).unwrap();
        assert_eq!(cluster.quorum_size, 2);
    }

    #[test]
    fn lowest_id_online_node_leads() {
        let mut cluster = Cluster::new("test", Uuid::from_timestamps(3, 4));
        let a = cluster.add_node(node("a"), 0).unwrap();
        let b = cluster.add_node(node("b"), 0).unwrap();
        assert_eq!(cluster.elect_leader(), Some(a));

        cluster.node_mut(a).unwrap().set_state(NodeState::Failed);
        cluster.update_stats();
        assert_eq!(cluster.elect_leader(), Some(b));
    }

    #[test]
    fn stale_heartbeat_fails_node_and_reelects() {
        let mut cluster = Cluster::new("test", Uuid::from_timestamps(3, 4));
        let a = cluster.add_node(node("a"), 0).unwrap();
        let b = cluster.add_node(node("b"), 0).unwrap();
        cluster.set_local_node(b);
        cluster.elect_leader();
        assert_eq!(cluster.leader_id, Some(a));

        // `a` is remote and goes quiet; `b` keeps heartbeating.
        cluster.record_heartbeat(b, 6000).ok();
        cluster.tick(HEALTH_TIMEOUT_MS + 1);

        assert_eq!(cluster.node(a).unwrap().state, NodeState::Failed);
        assert_eq!(cluster.leader_id, Some(b));
        assert!(cluster.is_leader);
        assert_eq!(cluster.online_count, 1);
    }

    #[test]
    fn health_score_drops_25_per_subsystem() {
        let mut n = node("a");
        n.resources.memory.free_bytes = 0;
        assert_eq!(n.health_check(0), 75);
        assert_eq!(n.health.consecutive_failures, 0);

        n.resources.cpu.total_threads = 0;
        assert_eq!(n.health_check(0), 50);

        // Score below 50 counts consecutive failures.
        let mut sick = node("b");
        sick.resources.memory.free_bytes = 0;
        sick.resources.cpu.total_threads = 0;
        sick.health.storage_healthy = false;
        // storage/network are recomputed as healthy; force the score down
        // by removing memory and cpu only -> 50, not below.
        assert_eq!(sick.health_check(0), 50);
        assert_eq!(sick.health.consecutive_failures, 0);
    }

    #[test]
    fn tags_and_roles() {
        let mut n = node("a");
        n.add_role(NodeRole::COMPUTE | NodeRole::STORAGE);
        assert!(n.roles.contains(NodeRole::STORAGE));
        n.remove_role(NodeRole::STORAGE);
        assert!(!n.roles.contains(NodeRole::STORAGE));

        assert!(n.add_tag("ssd"));
        assert!(n.has_tag("ssd"));
        assert!(!n.has_tag("gpu"));
    }
}
