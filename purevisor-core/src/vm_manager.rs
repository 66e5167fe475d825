//! VM lifecycle management on one node.
//!
//! The manager owns the managed-VM records; a record owns the VMX-level
//! [`Vm`] (EPT + VCPUs) and the guest RAM frames while the VM is started.
//! States: Created → Starting → Running ↔ Paused; Running → Stopping →
//! Stopped; any → Migrating → prior state; failures land in Error.
//! Host-node bookkeeping (VM counts, migrations) is applied to the
//! cluster passed into each operation.

use alloc::boxed::Box;
use alloc::vec::Vec;

use purevisor_hal::memory::{PhysMapper, PhysicalAddress, PAGE_SIZE};

use crate::block::Uuid;
use crate::cluster::{Cluster, NodeId};
use crate::pmm::PhysicalMemoryManager;
use crate::vm::Vm;
use crate::{log, log_error};

/// Guest RAM is carved from the PMM in 2 MiB runs.
const GUEST_CHUNK_ORDER: u32 = 9;
const GUEST_CHUNK_SIZE: u64 = (PAGE_SIZE as u64) << GUEST_CHUNK_ORDER;

/// BIOS-style load address for the boot image.
const BOOT_IMAGE_BASE: u64 = 0x7C00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagedVmState {
    Created,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Migrating,
    Error,
}

impl ManagedVmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagedVmState::Created => "CREATED",
            ManagedVmState::Starting => "STARTING",
            ManagedVmState::Running => "RUNNING",
            ManagedVmState::Paused => "PAUSED",
            ManagedVmState::Stopping => "STOPPING",
            ManagedVmState::Stopped => "STOPPED",
            ManagedVmState::Migrating => "MIGRATING",
            ManagedVmState::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmManagerError {
    VmNotFound,
    /// Operation invalid in the current state
    InvalidState,
    OutOfMemory,
    /// Boot image does not fit in guest memory
    ImageTooLarge,
    NodeNotFound,
}

/// Static configuration of a managed VM.
#[derive(Debug, Clone, Default)]
pub struct VmConfig {
    pub name: heapless::String<64>,
    pub vcpus: u32,
    pub memory: u64,
    pub boot_image: Vec<u8>,
}

impl VmConfig {
    pub fn new(name: &str, vcpus: u32, memory: u64) -> Self {
        let mut n = heapless::String::new();
        let _ = n.push_str(name);
        VmConfig {
            name: n,
            vcpus,
            memory,
            boot_image: Vec::new(),
        }
    }
}

/// State-change notifications.
pub trait VmEvents {
    fn on_state_change(&mut self, _vm: u32, _old: ManagedVmState, _new: ManagedVmState) {}
}

pub struct NullVmEvents;

impl VmEvents for NullVmEvents {}

/// One VM as tracked by the manager.
pub struct ManagedVm<'p, M: PhysMapper> {
    pub id: u32,
    pub uuid: Uuid,
    pub config: VmConfig,
    pub state: ManagedVmState,
    pub host_node: NodeId,
    pub error_msg: Option<&'static str>,
    pub created_ms: u64,
    pub started_ms: u64,
    pub stopped_ms: u64,
    vm: Option<Vm<'p, M>>,
    guest_frames: Vec<PhysicalAddress>,
}

impl<'p, M: PhysMapper> ManagedVm<'p, M> {
    /// The live VMX-level VM while started.
    pub fn vm(&self) -> Option<&Vm<'p, M>> {
        self.vm.as_ref()
    }

    pub fn vm_mut(&mut self) -> Option<&mut Vm<'p, M>> {
        self.vm.as_mut()
    }

    pub fn can_migrate(&self) -> bool {
        matches!(self.state, ManagedVmState::Running | ManagedVmState::Paused)
    }
}

/// Per-node VM manager.
pub struct VmManager<'p, M: PhysMapper> {
    pmm: &'p PhysicalMemoryManager<M>,
    vms: Vec<ManagedVm<'p, M>>,
    next_vm_id: u32,
    pub running_count: u32,
    pub local_node: NodeId,
    events: Box<dyn VmEvents + Send>,
}

impl<'p, M: PhysMapper> VmManager<'p, M> {
    pub fn new(pmm: &'p PhysicalMemoryManager<M>, local_node: NodeId) -> Self {
        Self::with_events(pmm, local_node, Box::new(NullVmEvents))
    }

    pub fn with_events(
        pmm: &'p PhysicalMemoryManager<M>,
        local_node: NodeId,
        events: Box<dyn VmEvents + Send>,
    ) -> Self {
        log!("vm-manager: initialized for node {}", local_node.0);
        VmManager {
            pmm,
            vms: Vec::new(),
            next_vm_id: 1,
            running_count: 0,
            local_node,
            events,
        }
    }

    fn set_state(&mut self, idx: usize, state: ManagedVmState) {
        let old = self.vms[idx].state;
        self.vms[idx].state = state;
        log!(
            "vm '{}': state {} -> {}",
            self.vms[idx].config.name,
            old.as_str(),
            state.as_str()
        );
        self.events.on_state_change(self.vms[idx].id, old, state);
    }

    fn index_of(&self, vm_id: u32) -> Result<usize, VmManagerError> {
        self.vms
            .iter()
            .position(|v| v.id == vm_id)
            .ok_or(VmManagerError::VmNotFound)
    }

    pub fn create(&mut self, config: VmConfig, uuid: Uuid, now_ms: u64) -> u32 {
        let id = self.next_vm_id;
        self.next_vm_id += 1;
        log!(
            "vm: created '{}' (id={}, {} vcpus, {} MiB)",
            config.name,
            id,
            config.vcpus,
            config.memory / (1024 * 1024)
        );
        self.vms.push(ManagedVm {
            id,
            uuid,
            config,
            state: ManagedVmState::Created,
            host_node: self.local_node,
            error_msg: None,
            created_ms: now_ms,
            started_ms: 0,
            stopped_ms: 0,
            vm: None,
            guest_frames: Vec::new(),
        });
        id
    }

    pub fn find(&self, vm_id: u32) -> Option<&ManagedVm<'p, M>> {
        self.vms.iter().find(|v| v.id == vm_id)
    }

    pub fn find_mut(&mut self, vm_id: u32) -> Option<&mut ManagedVm<'p, M>> {
        self.vms.iter_mut().find(|v| v.id == vm_id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ManagedVm<'p, M>> {
        self.vms.iter().find(|v| v.config.name.as_str() == name)
    }

    pub fn vms(&self) -> &[ManagedVm<'p, M>] {
        &self.vms
    }

    pub fn vm_count(&self) -> usize {
        self.vms.len()
    }

    /// Start a VM from Created/Stopped: back guest RAM with PMM runs, map
    /// it through the EPT, load the boot image at 0x7C00 and create the
    /// configured VCPUs.
    pub fn start(&mut self, vm_id: u32, cluster: &mut Cluster, now_ms: u64) -> Result<(), VmManagerError> {
        let idx = self.index_of(vm_id)?;
        if !matches!(
            self.vms[idx].state,
            ManagedVmState::Created | ManagedVmState::Stopped
        ) {
            self.vms[idx].error_msg = Some("not in a startable state");
            return Err(VmManagerError::InvalidState);
        }
        self.set_state(idx, ManagedVmState::Starting);

        match self.instantiate(idx) {
            Ok(()) => {}
            Err(e) => {
                self.teardown(idx);
                self.vms[idx].error_msg = Some("start failed");
                self.set_state(idx, ManagedVmState::Error);
                return Err(e);
            }
        }

        self.vms[idx].started_ms = now_ms;
        self.set_state(idx, ManagedVmState::Running);
        self.running_count += 1;
        let host = self.vms[idx].host_node;
        if let Some(node) = cluster.node_mut(host) {
            node.vm_count += 1;
        }
        Ok(())
    }

    fn instantiate(&mut self, idx: usize) -> Result<(), VmManagerError> {
        let (id, name, vcpus, memory) = {
            let v = &self.vms[idx];
            (
                v.id,
                v.config.name.clone(),
                v.config.vcpus.max(1),
                v.config.memory,
            )
        };
        let mut vm = Vm::new(self.pmm, id, &name).map_err(|_| VmManagerError::OutOfMemory)?;

        let chunks = memory.div_ceil(GUEST_CHUNK_SIZE);
        let mut gpa = 0u64;
        for _ in 0..chunks {
            let frame = match self.pmm.alloc_pages(GUEST_CHUNK_ORDER) {
                Ok(frame) => frame,
                Err(_) => {
                    vm.destroy();
                    return Err(VmManagerError::OutOfMemory);
                }
            };
            self.vms[idx].guest_frames.push(frame);
            if vm.map_memory(gpa, frame, GUEST_CHUNK_SIZE).is_err() {
                vm.destroy();
                return Err(VmManagerError::OutOfMemory);
            }
            gpa += GUEST_CHUNK_SIZE;
        }

        let image = self.vms[idx].config.boot_image.clone();
        if !image.is_empty() {
            if BOOT_IMAGE_BASE + image.len() as u64 > chunks * GUEST_CHUNK_SIZE {
                log_error!("vm '{}': boot image does not fit", name);
                vm.destroy();
                return Err(VmManagerError::ImageTooLarge);
            }
            if vm.write_guest(BOOT_IMAGE_BASE, &image).is_err() {
                vm.destroy();
                return Err(VmManagerError::OutOfMemory);
            }
        }

        for _ in 0..vcpus {
            if vm.add_vcpu().is_err() {
                vm.destroy();
                return Err(VmManagerError::OutOfMemory);
            }
        }

        self.vms[idx].vm = Some(vm);
        Ok(())
    }

    fn teardown(&mut self, idx: usize) {
        if let Some(vm) = self.vms[idx].vm.take() {
            vm.destroy();
        }
        for frame in core::mem::take(&mut self.vms[idx].guest_frames) {
            self.pmm.free_pages(frame, GUEST_CHUNK_ORDER);
        }
    }

    /// Graceful stop. The shutdown request to the guest is best-effort;
    /// the state machine proceeds regardless.
    pub fn stop(&mut self, vm_id: u32, cluster: &mut Cluster, now_ms: u64) -> Result<(), VmManagerError> {
        let idx = self.index_of(vm_id)?;
        if !matches!(
            self.vms[idx].state,
            ManagedVmState::Running | ManagedVmState::Paused
        ) {
            return Err(VmManagerError::InvalidState);
        }
        self.set_state(idx, ManagedVmState::Stopping);
        self.teardown(idx);
        self.vms[idx].stopped_ms = now_ms;
        self.set_state(idx, ManagedVmState::Stopped);
        self.running_count = self.running_count.saturating_sub(1);
        let host = self.vms[idx].host_node;
        if let Some(node) = cluster.node_mut(host) {
            node.vm_count = node.vm_count.saturating_sub(1);
        }
        Ok(())
    }

    /// Unconditional stop.
    pub fn force_stop(&mut self, vm_id: u32, cluster: &mut Cluster, now_ms: u64) -> Result<(), VmManagerError> {
        let idx = self.index_of(vm_id)?;
        if matches!(
            self.vms[idx].state,
            ManagedVmState::Stopped | ManagedVmState::Created
        ) {
            return Ok(());
        }
        let was_counted = matches!(
            self.vms[idx].state,
            ManagedVmState::Running | ManagedVmState::Paused
        );
        self.teardown(idx);
        self.vms[idx].stopped_ms = now_ms;
        self.set_state(idx, ManagedVmState::Stopped);
        if was_counted {
            self.running_count = self.running_count.saturating_sub(1);
            let host = self.vms[idx].host_node;
            if let Some(node) = cluster.node_mut(host) {
                node.vm_count = node.vm_count.saturating_sub(1);
            }
        }
        Ok(())
    }

    pub fn pause(&mut self, vm_id: u32) -> Result<(), VmManagerError> {
        let idx = self.index_of(vm_id)?;
        if self.vms[idx].state != ManagedVmState::Running {
            return Err(VmManagerError::InvalidState);
        }
        self.set_state(idx, ManagedVmState::Paused);
        Ok(())
    }

    pub fn resume(&mut self, vm_id: u32) -> Result<(), VmManagerError> {
        let idx = self.index_of(vm_id)?;
        if self.vms[idx].state != ManagedVmState::Paused {
            return Err(VmManagerError::InvalidState);
        }
        self.set_state(idx, ManagedVmState::Running);
        Ok(())
    }

    pub fn restart(&mut self, vm_id: u32, cluster: &mut Cluster, now_ms: u64) -> Result<(), VmManagerError> {
        if self.stop(vm_id, cluster, now_ms).is_err() {
            self.force_stop(vm_id, cluster, now_ms)?;
        }
        self.start(vm_id, cluster, now_ms)
    }

    /// Destroy a VM record. Running VMs are force-stopped first.
    pub fn destroy(&mut self, vm_id: u32, cluster: &mut Cluster, now_ms: u64) -> Result<(), VmManagerError> {
        let idx = self.index_of(vm_id)?;
        if matches!(
            self.vms[idx].state,
            ManagedVmState::Running | ManagedVmState::Paused
        ) {
            self.force_stop(vm_id, cluster, now_ms)?;
        }
        let idx = self.index_of(vm_id)?;
        self.teardown(idx);
        let vm = self.vms.remove(idx);
        log!("vm: destroyed '{}'", vm.config.name);
        Ok(())
    }

    /// Push a VM into the Error state with a reason the management API can
    /// surface.
    pub fn mark_error(&mut self, vm_id: u32, reason: &'static str) -> Result<(), VmManagerError> {
        let idx = self.index_of(vm_id)?;
        let was_counted = matches!(
            self.vms[idx].state,
            ManagedVmState::Running | ManagedVmState::Paused
        );
        self.vms[idx].error_msg = Some(reason);
        self.set_state(idx, ManagedVmState::Error);
        if was_counted {
            self.running_count = self.running_count.saturating_sub(1);
        }
        Ok(())
    }

    /// Migrate ownership metadata to `target`: the pre-migration state is
    /// preserved and both nodes' VM counts are adjusted. (Memory/state
    /// transfer is the transport's concern, not the scheduler's.)
    pub fn migrate(
        &mut self,
        vm_id: u32,
        cluster: &mut Cluster,
        target: NodeId,
    ) -> Result<(), VmManagerError> {
        let idx = self.index_of(vm_id)?;
        if !self.vms[idx].can_migrate() {
            self.vms[idx].error_msg = Some("not migratable in this state");
            return Err(VmManagerError::InvalidState);
        }
        cluster.node(target).ok_or(VmManagerError::NodeNotFound)?;
        let source = self.vms[idx].host_node;
        if source == target {
            return Ok(());
        }

        let prior = self.vms[idx].state;
        self.set_state(idx, ManagedVmState::Migrating);
        log!(
            "vm '{}': migrating from node {} to node {}",
            self.vms[idx].config.name,
            source.0,
            target.0
        );

        if let Some(node) = cluster.node_mut(source) {
            node.vm_count = node.vm_count.saturating_sub(1);
            node.total_migrations += 1;
        }
        self.vms[idx].host_node = target;
        if let Some(node) = cluster.node_mut(target) {
            node.vm_count += 1;
        }
        self.set_state(idx, prior);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterNode;
    use crate::testutil::TestRam;

    fn cluster_with_node() -> (Cluster, NodeId) {
        let mut cluster = Cluster::new("test", Uuid::from_timestamps(1, 2));
        let mut node = ClusterNode::new("n1", "10.0.0.1", 7000, Uuid::from_timestamps(3, 4));
        node.resources.cpu.total_threads = 8;
        node.resources.memory.total_bytes = 1 << 30;
        node.resources.memory.free_bytes = 1 << 30;
        let id = cluster.add_node(node, 0).unwrap();
        (cluster, id)
    }

    #[test]
    fn lifecycle_create_start_stop() {
        let ram = TestRam::new(64 * 1024 * 1024);
        let pmm = ram.pmm();
        let (mut cluster, node) = cluster_with_node();
        let mut mgr = VmManager::new(&pmm, node);

        let mut config = VmConfig::new("guest0", 1, 4 * 1024 * 1024);
        config.boot_image = alloc::vec![0xF4; 512]; // hlt-filled sector
        let id = mgr.create(config, Uuid::from_timestamps(5, 6), 0);

        assert_eq!(mgr.find(id).unwrap().state, ManagedVmState::Created);
        mgr.start(id, &mut cluster, 100).unwrap();
        assert_eq!(mgr.find(id).unwrap().state, ManagedVmState::Running);
        assert_eq!(mgr.running_count, 1);
        assert_eq!(cluster.node(node).unwrap().vm_count, 1);

        // The boot image landed at 0x7C00.
        let mut sector = [0u8; 4];
        mgr.find(id)
            .unwrap()
            .vm()
            .unwrap()
            .read_guest(0x7C00, &mut sector)
            .unwrap();
        assert_eq!(sector, [0xF4; 4]);

        mgr.stop(id, &mut cluster, 200).unwrap();
        assert_eq!(mgr.find(id).unwrap().state, ManagedVmState::Stopped);
        assert_eq!(mgr.running_count, 0);
        assert_eq!(cluster.node(node).unwrap().vm_count, 0);
    }

    #[test]
    fn pause_resume_are_pure_transitions() {
        let ram = TestRam::new(64 * 1024 * 1024);
        let pmm = ram.pmm();
        let (mut cluster, node) = cluster_with_node();
        let mut mgr = VmManager::new(&pmm, node);

        let id = mgr.create(VmConfig::new("g", 1, 2 << 20), Uuid::from_timestamps(5, 6), 0);
        assert_eq!(mgr.pause(id), Err(VmManagerError::InvalidState));
        mgr.start(id, &mut cluster, 0).unwrap();
        mgr.pause(id).unwrap();
        assert_eq!(mgr.resume(id), Ok(()));
    }

    #[test]
    fn migrate_preserves_state_and_moves_counts() {
        let ram = TestRam::new(64 * 1024 * 1024);
        let pmm = ram.pmm();
        let (mut cluster, n1) = cluster_with_node();
        let mut n2 = ClusterNode::new("n2", "10.0.0.2", 7000, Uuid::from_timestamps(7, 8));
        n2.resources.cpu.total_threads = 8;
        let n2 = cluster.add_node(n2, 0).unwrap();

        let mut mgr = VmManager::new(&pmm, n1);
        let id = mgr.create(VmConfig::new("g", 1, 2 << 20), Uuid::from_timestamps(5, 6), 0);
        mgr.start(id, &mut cluster, 0).unwrap();
        mgr.pause(id).unwrap();

        mgr.migrate(id, &mut cluster, n2).unwrap();
        let vm = mgr.find(id).unwrap();
        assert_eq!(vm.state, ManagedVmState::Paused);
        assert_eq!(vm.host_node, n2);
        assert_eq!(cluster.node(n1).unwrap().vm_count, 0);
        assert_eq!(cluster.node(n2).unwrap().vm_count, 1);
        assert_eq!(cluster.node(n1).unwrap().total_migrations, 1);
    }
}
