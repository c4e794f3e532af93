use crate::pat::MtrrPatContext;
use crate::structs::{DEFAULT_PAT, GuestMemoryRange, MTRR_VCNT, VcpuMtrrPat};

mod support;

pub(crate) const TEST_PHYS_ADDR_BITS: u8 = 36;

pub(crate) fn test_context() -> MtrrPatContext {
    MtrrPatContext::new(TEST_PHYS_ADDR_BITS, DEFAULT_PAT)
}

// A small but representative guest physical map: low memory, RAM starting
// exactly at 1 MiB, and one MMIO hole that must stay uncovered.
pub(crate) fn test_memory_map() -> [GuestMemoryRange; 3] {
    [
        GuestMemoryRange::new(0x0, 0xA0000, true),
        GuestMemoryRange::new(0x100000, 0x3FF00000, true),
        GuestMemoryRange::new(0xFEC00000, 0x1000, false),
    ]
}

pub(crate) fn installed_vcpu(ctx: &MtrrPatContext) -> VcpuMtrrPat {
    let mut vcpu = VcpuMtrrPat::new(MTRR_VCNT);
    vcpu.mtrr.install_default_layout(ctx, &test_memory_map()).unwrap();
    vcpu
}
