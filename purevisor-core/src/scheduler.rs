//! Cluster scheduler: feasibility-filtered, weighted-score VM placement.
//!
//! Every node is first filtered (state, health, forbidden list, tags, CPU
//! and memory capacity) and then scored 0..=100 from free-resource ratios
//! weighted 40/40/10/10 (cpu/memory/storage/network), with an affinity
//! adjustment folded in as a bonus. SPREAD prefers emptier nodes, PACK
//! inverts the resource score to prefer fuller ones, RANDOM picks
//! uniformly among the feasible set.
//!
//! Used vCPUs are estimated as `2 × vm_count`; consulting each VM's actual
//! vCPU count is a known follow-up (TODO: replace the estimate once VM
//! records are visible from every scheduling context).

use heapless::Vec as BoundedVec;

use purevisor_hal::memory::PhysMapper;

use crate::cluster::{Cluster, ClusterNode, NodeId, NodeState};
use crate::vm_manager::VmManager;
use crate::{log, log_warn};

pub const WEIGHT_CPU: u32 = 40;
pub const WEIGHT_MEMORY: u32 = 40;
pub const WEIGHT_STORAGE: u32 = 10;
pub const WEIGHT_NETWORK: u32 = 10;

/// Per-VM vCPU estimate used for capacity accounting.
const VCPUS_PER_VM_ESTIMATE: u64 = 2;

/// Minimum health score a placement target must have.
const MIN_HEALTH_SCORE: u32 = 50;

/// VM-count spread that triggers rebalancing.
const REBALANCE_THRESHOLD: u32 = 2;

pub const MAX_TAGS: usize = 8;
pub const MAX_FORBIDDEN: usize = 8;
pub const MAX_AFFINITY: usize = 8;
pub const MAX_ALTERNATIVES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    #[default]
    Spread,
    Pack,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    NoNodesInCluster,
    NoFeasibleNode,
    VmNotFound,
}

/// A placement request.
#[derive(Debug, Clone, Default)]
pub struct PlacementRequest {
    pub vm_id: Option<u32>,
    pub vcpus: u64,
    pub memory: u64,
    pub storage: u64,
    pub policy: SchedPolicy,
    pub priority: u8,
    pub required_tags: BoundedVec<heapless::String<16>, MAX_TAGS>,
    pub forbidden_nodes: BoundedVec<heapless::String<32>, MAX_FORBIDDEN>,
    pub affinity_vms: BoundedVec<u32, MAX_AFFINITY>,
    pub anti_affinity_vms: BoundedVec<u32, MAX_AFFINITY>,
}

impl PlacementRequest {
    pub fn new(vcpus: u64, memory: u64) -> Self {
        PlacementRequest {
            vcpus,
            memory,
            ..PlacementRequest::default()
        }
    }

    pub fn forbid(&mut self, node_name: &str) {
        let mut n = heapless::String::new();
        let _ = n.push_str(node_name);
        let _ = self.forbidden_nodes.push(n);
    }

    pub fn require_tag(&mut self, tag: &str) {
        let mut t = heapless::String::new();
        let _ = t.push_str(tag);
        let _ = self.required_tags.push(t);
    }
}

/// Score breakdown for one node.
#[derive(Debug, Clone, Copy)]
pub struct NodeScore {
    pub node: NodeId,
    pub feasible: bool,
    pub infeasible_reason: &'static str,
    pub cpu_score: u32,
    pub memory_score: u32,
    pub storage_score: u32,
    pub network_score: u32,
    pub affinity_score: u32,
    pub total_score: u32,
}

/// Successful placement.
#[derive(Debug, Clone)]
pub struct PlacementResult {
    pub selected: NodeId,
    pub score: u32,
    pub alternatives: BoundedVec<(NodeId, u32), MAX_ALTERNATIVES>,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub default_policy: SchedPolicy,
    pub enable_overcommit: bool,
    /// Percent: 200 = 2:1 CPU overcommit.
    pub cpu_overcommit_ratio: u64,
    /// Percent: 150 = 1.5:1 memory overcommit.
    pub memory_overcommit_ratio: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            default_policy: SchedPolicy::Spread,
            enable_overcommit: true,
            cpu_overcommit_ratio: 200,
            memory_overcommit_ratio: 150,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    pub total_placements: u64,
    pub failed_placements: u64,
    pub migrations_triggered: u64,
}

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

pub struct Scheduler {
    pub config: SchedulerConfig,
    pub stats: SchedulerStats,
    rng: XorShift,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, seed: u64) -> Self {
        log!(
            "scheduler: initialized (policy=SPREAD, overcommit={})",
            config.enable_overcommit
        );
        Scheduler {
            config,
            stats: SchedulerStats::default(),
            rng: XorShift(seed | 1),
        }
    }

    fn available_vcpus(&self, node: &ClusterNode) -> u64 {
        let mut total = node.resources.cpu.total_threads as u64;
        if self.config.enable_overcommit {
            total = total * self.config.cpu_overcommit_ratio / 100;
        }
        total.saturating_sub(node.vm_count as u64 * VCPUS_PER_VM_ESTIMATE)
    }

    fn available_memory(&self, node: &ClusterNode) -> u64 {
        if self.config.enable_overcommit {
            (node.resources.memory.total_bytes * self.config.memory_overcommit_ratio / 100)
                .saturating_sub(node.resources.memory.used_bytes)
        } else {
            node.resources.memory.free_bytes
        }
    }

    fn feasible<M: PhysMapper>(
        &self,
        node: &ClusterNode,
        request: &PlacementRequest,
        _vms: &VmManager<'_, M>,
    ) -> Result<(), &'static str> {
        if node.state != NodeState::Online {
            return Err("node not online");
        }
        if node.health.score < MIN_HEALTH_SCORE {
            return Err("node unhealthy");
        }
        if request
            .forbidden_nodes
            .iter()
            .any(|f| f.as_str() == node.name.as_str())
        {
            return Err("node forbidden");
        }
        for tag in request.required_tags.iter() {
            if !node.has_tag(tag) {
                return Err("missing required tag");
            }
        }
        if request.vcpus > self.available_vcpus(node) {
            return Err("insufficient cpu");
        }
        if request.memory > self.available_memory(node) {
            return Err("insufficient memory");
        }
        Ok(())
    }

    /// Score one node for a request.
    pub fn score_node<M: PhysMapper>(
        &self,
        node: &ClusterNode,
        request: &PlacementRequest,
        vms: &VmManager<'_, M>,
    ) -> NodeScore {
        let mut score = NodeScore {
            node: node.id,
            feasible: false,
            infeasible_reason: "",
            cpu_score: 0,
            memory_score: 0,
            storage_score: 0,
            network_score: 0,
            affinity_score: 50,
            total_score: 0,
        };
        if let Err(reason) = self.feasible(node, request, vms) {
            score.infeasible_reason = reason;
            return score;
        }
        score.feasible = true;

        let total_cpu = node.resources.cpu.total_threads as u64;
        let used_cpu = node.vm_count as u64 * VCPUS_PER_VM_ESTIMATE;
        if total_cpu > 0 {
            score.cpu_score = (total_cpu.saturating_sub(used_cpu) * 100 / total_cpu) as u32;
        }

        let total_mem = node.resources.memory.total_bytes;
        if total_mem > 0 {
            score.memory_score = (node.resources.memory.free_bytes * 100 / total_mem) as u32;
        }

        let total_storage = node.resources.storage.total_bytes;
        score.storage_score = if total_storage > 0 {
            (node.resources.storage.free_bytes * 100 / total_storage) as u32
        } else {
            100
        };

        score.network_score = if node.health.network_healthy { 100 } else { 0 };

        // Affinity starts neutral; co-located affinity VMs pull the node
        // up, anti-affinity VMs push it down with a floor of zero.
        let mut affinity: i32 = 50;
        for vm_id in request.affinity_vms.iter() {
            if let Some(vm) = vms.find(*vm_id) {
                if vm.host_node == node.id {
                    affinity += 25;
                }
            }
        }
        for vm_id in request.anti_affinity_vms.iter() {
            if let Some(vm) = vms.find(*vm_id) {
                if vm.host_node == node.id {
                    affinity = (affinity - 50).max(0);
                }
            }
        }
        score.affinity_score = affinity.clamp(0, 100) as u32;

        let mut weighted = (score.cpu_score * WEIGHT_CPU
            + score.memory_score * WEIGHT_MEMORY
            + score.storage_score * WEIGHT_STORAGE
            + score.network_score * WEIGHT_NETWORK)
            / 100;

        if request.policy == SchedPolicy::Pack {
            weighted = 100 - weighted.min(100);
        }

        let bonus = (score.affinity_score as i32 - 50).div_euclid(4);
        score.total_score = (weighted as i32 + bonus).clamp(0, 100) as u32;
        score
    }

    /// Filter, score and choose. Records up to three alternatives.
    pub fn schedule<M: PhysMapper>(
        &mut self,
        cluster: &Cluster,
        vms: &VmManager<'_, M>,
        request: &PlacementRequest,
    ) -> Result<PlacementResult, SchedulerError> {
        if cluster.node_count() == 0 {
            self.stats.failed_placements += 1;
            return Err(SchedulerError::NoNodesInCluster);
        }

        let mut feasible: alloc::vec::Vec<NodeScore> = cluster
            .nodes()
            .iter()
            .map(|n| self.score_node(n, request, vms))
            .filter(|s| s.feasible)
            .collect();

        if feasible.is_empty() {
            self.stats.failed_placements += 1;
            log_warn!("scheduler: no feasible node for request");
            return Err(SchedulerError::NoFeasibleNode);
        }

        let best = if request.policy == SchedPolicy::Random {
            let pick = self.rng.next() as usize % feasible.len();
            feasible.swap(0, pick);
            feasible[0]
        } else {
            feasible.sort_by(|a, b| b.total_score.cmp(&a.total_score));
            feasible[0]
        };

        let mut alternatives = BoundedVec::new();
        for s in feasible.iter().skip(1).take(MAX_ALTERNATIVES) {
            let _ = alternatives.push((s.node, s.total_score));
        }

        self.stats.total_placements += 1;
        log!(
            "scheduler: placed on node {} (score={})",
            best.node.0,
            best.total_score
        );
        Ok(PlacementResult {
            selected: best.node,
            score: best.total_score,
            alternatives,
        })
    }

    /// Move one VM from the fullest to the emptiest node when the spread
    /// exceeds the threshold.
    pub fn rebalance<M: PhysMapper>(
        &mut self,
        cluster: &mut Cluster,
        vms: &mut VmManager<'_, M>,
    ) -> Result<bool, SchedulerError> {
        let online: alloc::vec::Vec<(NodeId, u32)> = cluster
            .nodes()
            .iter()
            .filter(|n| n.state == NodeState::Online)
            .map(|n| (n.id, n.vm_count))
            .collect();
        if online.is_empty() {
            return Ok(false);
        }

        let (max_node, max_vms) = *online.iter().max_by_key(|(_, c)| *c).expect("non-empty");
        let (min_node, min_vms) = *online.iter().min_by_key(|(_, c)| *c).expect("non-empty");
        if max_vms <= min_vms + REBALANCE_THRESHOLD {
            return Ok(false);
        }

        log!(
            "scheduler: rebalancing node {} ({} VMs) -> node {} ({} VMs)",
            max_node.0,
            max_vms,
            min_node.0,
            min_vms
        );
        let candidate = vms
            .vms()
            .iter()
            .find(|vm| vm.host_node == max_node && vm.can_migrate())
            .map(|vm| vm.id);
        if let Some(vm_id) = candidate {
            if vms.migrate(vm_id, cluster, min_node).is_ok() {
                self.stats.migrations_triggered += 1;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Move every VM off `node`. VMs with no feasible target are marked
    /// errored so nothing silently stays behind.
    pub fn evacuate_node<M: PhysMapper>(
        &mut self,
        cluster: &mut Cluster,
        vms: &mut VmManager<'_, M>,
        node: NodeId,
    ) -> Result<u32, SchedulerError> {
        let node_name: heapless::String<32> = cluster
            .node(node)
            .ok_or(SchedulerError::NoNodesInCluster)?
            .name
            .clone();
        log!("scheduler: evacuating node {}", node.0);

        let hosted: alloc::vec::Vec<u32> = vms
            .vms()
            .iter()
            .filter(|vm| vm.host_node == node)
            .map(|vm| vm.id)
            .collect();

        let mut moved = 0;
        for vm_id in hosted {
            let (vcpus, memory) = {
                let vm = vms.find(vm_id).ok_or(SchedulerError::VmNotFound)?;
                (vm.config.vcpus as u64, vm.config.memory)
            };
            let mut request = PlacementRequest::new(vcpus, memory);
            request.vm_id = Some(vm_id);
            request.forbid(&node_name);

            match self.schedule(cluster, vms, &request) {
                Ok(result) => {
                    if vms.migrate(vm_id, cluster, result.selected).is_ok() {
                        self.stats.migrations_triggered += 1;
                        moved += 1;
                    } else {
                        let _ = vms.mark_error(vm_id, "evacuation migrate failed");
                    }
                }
                Err(_) => {
                    let _ = vms.mark_error(vm_id, "no feasible node for evacuation");
                }
            }
        }
        Ok(moved)
    }
}
