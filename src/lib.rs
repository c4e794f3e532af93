//! # Introduction
//! Guest MTRR/PAT virtualization for a hypervisor's shadow/nested paging
//! path.
//!
//! MTRR (Memory Type Range Registers) and PAT (Page Attribute Table) are
//! the two processor mechanisms that decide the cache/memory type applied
//! to a physical address; real CPUs combine them through fixed precedence
//! rules. A hypervisor must emulate that combination for the guest's
//! *virtual* MTRR/PAT state while respecting the *host's* real MTRR state:
//! a cache type mismatch between privilege levels for the same page can
//! cause data corruption or cross-VM leakage through cache aliasing. MTRRs
//! are described in 7.7 Vol 2 of the AMD64 Architecture Programmer's Manual
//! and 12.11 Vol 3A of the Intel Software Developer's Manual.
//!
//! # Getting Started
//!
//! ```no_run
//! use hvm_mtrr::{
//!     get_pat_flags, mtrr_pat_not_equal, GuestMemoryRange, MsrIa32Pat, MtrrPatContext,
//!     MtrrState, VcpuMtrrPat, MTRR_VCNT,
//! };
//!
//! // Once at boot, before any VCPU exists: capture the host's physical
//! // address width and PAT, and snapshot the host MTRR state.
//! let ctx = MtrrPatContext::new(36, MsrIa32Pat::from_bits(0x0007040600070406));
//! let host_mtrr = MtrrState::new(MTRR_VCNT); // populated from hardware MSRs
//!
//! // Per VCPU at VM creation: seed the virtual MTRR state from the guest
//! // physical memory map.
//! let mut vcpu = VcpuMtrrPat::new(MTRR_VCNT);
//! let memory_map = [
//!     GuestMemoryRange::new(0x0, 0x100000, true),
//!     GuestMemoryRange::new(0x100000, 0x3ff00000, true),
//! ];
//! vcpu.mtrr.install_default_layout(&ctx, &memory_map).unwrap();
//!
//! // On the guest MSR-write path: the mutators reject illegal content so
//! // the caller can inject a guest fault.
//! if vcpu.mtrr.def_type_msr_set(0xc06).is_err() {
//!     // inject #GP
//! }
//!
//! // On the shadow page table construction path: derive the PAT/PCD/PWT
//! // bits for the shadow entry.
//! let pte_flags = get_pat_flags(&ctx, &host_mtrr, &vcpu, 0x0, 0x80000, 0x180000);
//! let _ = pte_flags;
//!
//! // On VCPU context switch: decide whether cached shadow mappings stand.
//! let other = VcpuMtrrPat::new(MTRR_VCNT);
//! let must_flush = mtrr_pat_not_equal(&vcpu, &other);
//! let _ = must_flush;
//! ```

#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

pub mod error;
pub mod mtrr;
pub mod pat;
pub mod structs;
mod utils;

pub use error::{MtrrError, MtrrResult};
pub use mtrr::mtrr_pat_not_equal;
pub use pat::{effective_guest_type, get_pat_flags, pat_msr_set, MtrrPatContext, PAGE_PAT, PAGE_PCD, PAGE_PWT};
pub use structs::{
    GuestMemoryRange, MsrIa32MtrrDefType, MsrIa32Pat, MtrrMemoryCacheType, MtrrState, VcpuMtrrPat,
    MSR_IA32_MTRR_DEF_TYPE, MSR_IA32_MTRR_PHYSBASE0, MSR_IA32_MTRR_PHYSMASK0, MSR_IA32_PAT, MTRR_VCNT,
    RESERVED_VARIABLE_MTRRS,
};

#[cfg(test)]
mod tests;
