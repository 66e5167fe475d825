#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! PureVisor core: the hypervisor and hyperconverged-infrastructure engine.
//!
//! Leaf-first: the physical memory manager and kernel heap bring the host
//! up, the VMX core runs guests over EPT, the block/pool layers provide
//! extent-based storage replicated through Raft, and the cluster/scheduler
//! modules place VMs across nodes.

extern crate alloc;

pub mod log;
pub mod sync;

pub mod pmm;
pub mod heap;

pub mod vcpu;
pub mod vm;
pub mod vmexit;

pub mod block;
pub mod memblk;
pub mod pool;

pub mod raft;
pub mod distributed;

pub mod cluster;
pub mod vm_manager;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testutil;

use purevisor_hal::arch::x86_64::vmx::VmxError;
use purevisor_hal::boot::BootError;
use purevisor_hal::HalError;

/// Top-level error type; module errors convert into it at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurevisorError {
    Hal(HalError),
    Boot(BootError),
    Memory(pmm::PmmError),
    Heap(heap::HeapError),
    Vmx(VmxError),
    Vcpu(vcpu::VcpuError),
    Block(block::BlockError),
    Pool(pool::PoolError),
    Raft(raft::RaftError),
    Cluster(cluster::ClusterError),
    Scheduler(scheduler::SchedulerError),
}

impl From<HalError> for PurevisorError {
    fn from(e: HalError) -> Self {
        PurevisorError::Hal(e)
    }
}

impl From<pmm::PmmError> for PurevisorError {
    fn from(e: pmm::PmmError) -> Self {
        PurevisorError::Memory(e)
    }
}

impl From<heap::HeapError> for PurevisorError {
    fn from(e: heap::HeapError) -> Self {
        PurevisorError::Heap(e)
    }
}

impl From<VmxError> for PurevisorError {
    fn from(e: VmxError) -> Self {
        PurevisorError::Vmx(e)
    }
}

impl From<vcpu::VcpuError> for PurevisorError {
    fn from(e: vcpu::VcpuError) -> Self {
        PurevisorError::Vcpu(e)
    }
}

impl From<block::BlockError> for PurevisorError {
    fn from(e: block::BlockError) -> Self {
        PurevisorError::Block(e)
    }
}

impl From<pool::PoolError> for PurevisorError {
    fn from(e: pool::PoolError) -> Self {
        PurevisorError::Pool(e)
    }
}

impl From<raft::RaftError> for PurevisorError {
    fn from(e: raft::RaftError) -> Self {
        PurevisorError::Raft(e)
    }
}

impl From<cluster::ClusterError> for PurevisorError {
    fn from(e: cluster::ClusterError) -> Self {
        PurevisorError::Cluster(e)
    }
}

impl From<scheduler::SchedulerError> for PurevisorError {
    fn from(e: scheduler::SchedulerError) -> Self {
        PurevisorError::Scheduler(e)
    }
}
