//! x86_64 architecture support: VMX, VMCS, EPT and host paging.

pub mod ept;
pub mod msr;
pub mod paging;
pub mod vmcs;
pub mod vmx;
