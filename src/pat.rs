//! PAT virtualization: the MTRR x PAT combination tables, the PAT MSR
//! mutator, and the derivation of host page table flags that reproduce a
//! guest's effective memory type on real hardware.
use crate::error::MtrrError;
use crate::error::MtrrResult;
use crate::structs::MsrIa32Pat;
use crate::structs::MtrrMemoryCacheType;
use crate::structs::MtrrState;
use crate::structs::VcpuMtrrPat;
use log::warn;

/// PWT bit of a page table entry.
pub const PAGE_PWT: u32 = 1 << 3;
/// PCD bit of a page table entry.
pub const PAGE_PCD: u32 = 1 << 4;
/// PAT bit of a 4 KiB leaf page table entry.
pub const PAGE_PAT: u32 = 1 << 7;

pub(crate) const MTRR_NUM_TYPES: usize = 7;
pub(crate) const PAT_TYPE_NUMS: usize = 8;
pub(crate) const MEMORY_NUM_TYPES: usize = 7;
pub(crate) const INVALID_MEM_TYPE: u8 = 0xff;

// PAT entry index to the PTE bit pattern (PAT, PCD, PWT) selecting it.
const PAT_ENTRY_2_PTE_FLAGS: [u32; PAT_TYPE_NUMS] = [
    0,
    PAGE_PWT,
    PAGE_PCD,
    PAGE_PCD | PAGE_PWT,
    PAGE_PAT,
    PAGE_PAT | PAGE_PWT,
    PAGE_PAT | PAGE_PCD,
    PAGE_PAT | PAGE_PCD | PAGE_PWT,
];

// Effective memory type lookup table, indexed by MTRR type then PAT type.
// RS means reserved type (2, 3); the codes are hardcoded here.
const MM_TYPE_TBL: [[u8; PAT_TYPE_NUMS]; MTRR_NUM_TYPES] = [
    /********PAT(UC,WC,RS,RS,WT,WP,WB,UC-)*/
    /*MTRR(UC):(UC,WC,RS,RS,UC,UC,UC,UC)*/
    [0, 1, 2, 2, 0, 0, 0, 0],
    /*MTRR(WC):(UC,WC,RS,RS,UC,UC,WC,WC)*/
    [0, 1, 2, 2, 0, 0, 1, 1],
    /*MTRR(RS):(RS,RS,RS,RS,RS,RS,RS,RS)*/
    [2, 2, 2, 2, 2, 2, 2, 2],
    /*MTRR(RS):(RS,RS,RS,RS,RS,RS,RS,RS)*/
    [2, 2, 2, 2, 2, 2, 2, 2],
    /*MTRR(WT):(UC,WC,RS,RS,WT,WP,WT,UC)*/
    [0, 1, 2, 2, 4, 5, 4, 0],
    /*MTRR(WP):(UC,WC,RS,RS,WT,WP,WP,WC)*/
    [0, 1, 2, 2, 4, 5, 5, 1],
    /*MTRR(WB):(UC,WC,RS,RS,WT,WP,WB,UC)*/
    [0, 1, 2, 2, 4, 5, 6, 0],
];

/// Process-wide, immutable MTRR/PAT derivation context.
///
/// Built once at boot, before any virtual CPU exists, from the host's
/// implemented physical address width and its real PAT register; passed by
/// reference into every per-VCPU validation and resolution call.
#[derive(Debug, Clone)]
pub struct MtrrPatContext {
    phys_addr_bits: u8,
    base_msr_mask: u64,
    mask_msr_mask: u64,
    size_or_mask: u64,
    // Reverse lookup: (host MTRR type, effective type) to the PAT type that
    // reproduces the effective type, built by inverting MM_TYPE_TBL.
    epat_tbl: [[u8; MEMORY_NUM_TYPES]; MTRR_NUM_TYPES],
    // PAT type to the host PAT entry holding it, or INVALID_MEM_TYPE when
    // the host PAT does not contain the type.
    pat_entry_tbl: [u8; PAT_TYPE_NUMS],
}

impl MtrrPatContext {
    /// Builds the context for a host with the given physical address width
    /// and real PAT content.
    pub fn new(phys_addr_bits: u8, host_pat: MsrIa32Pat) -> Self {
        assert!((32..=52).contains(&phys_addr_bits));

        let addr_mask = (1u64 << phys_addr_bits) - 1;

        let mut epat_tbl = [[INVALID_MEM_TYPE; MEMORY_NUM_TYPES]; MTRR_NUM_TYPES];
        for mtrr_type in 0..MTRR_NUM_TYPES {
            for pat_type in 0..PAT_TYPE_NUMS {
                let effective = MM_TYPE_TBL[mtrr_type][pat_type] as usize;
                if effective < MEMORY_NUM_TYPES {
                    epat_tbl[mtrr_type][effective] = pat_type as u8;
                }
            }
        }

        let mut pat_entry_tbl = [INVALID_MEM_TYPE; PAT_TYPE_NUMS];
        for pat_type in 0..PAT_TYPE_NUMS {
            for entry in 0..PAT_TYPE_NUMS {
                if host_pat.entry(entry) as usize == pat_type {
                    pat_entry_tbl[pat_type] = entry as u8;
                    break;
                }
            }
        }

        Self {
            phys_addr_bits,
            base_msr_mask: !addr_mask | 0xf00,
            mask_msr_mask: !addr_mask | 0x7ff,
            size_or_mask: !((1u64 << (phys_addr_bits as u32 - 12)) - 1),
            epat_tbl,
            pat_entry_tbl,
        }
    }

    /// Implemented physical address width in bits.
    pub fn phys_addr_bits(&self) -> u8 {
        self.phys_addr_bits
    }

    /// Mask of implemented physical address bits.
    pub(crate) fn phys_addr_mask(&self) -> u64 {
        (1u64 << self.phys_addr_bits) - 1
    }

    // Reserved bits of a PHYSBASE register.
    pub(crate) fn base_msr_mask(&self) -> u64 {
        self.base_msr_mask
    }

    // Reserved bits of a PHYSMASK register.
    pub(crate) fn mask_msr_mask(&self) -> u64 {
        self.mask_msr_mask
    }

    // Fixed high bits of a page frame mask, above the implemented width.
    pub(crate) fn size_or_mask(&self) -> u64 {
        self.size_or_mask
    }

    /// Returns the PTE bit pattern (PAT, PCD, PWT) selecting the host PAT
    /// entry that holds `pat_type`. Falls back to the Uncacheable entry
    /// when the host PAT does not contain the requested type; a host PAT
    /// covering all types never hits the fallback.
    pub fn pat_type_to_pte_flags(&self, pat_type: MtrrMemoryCacheType) -> u32 {
        let entry = self.pat_entry_tbl[pat_type as usize];

        if entry != INVALID_MEM_TYPE {
            return PAT_ENTRY_2_PTE_FLAGS[entry as usize];
        }

        PAT_ENTRY_2_PTE_FLAGS[self.pat_entry_tbl[MtrrMemoryCacheType::Uncacheable as usize] as usize]
    }
}

/// Applies a guest write to the PAT MSR.
///
/// Each of the 8 type bytes must be PAT-legal; one illegal byte rejects the
/// whole write and leaves the register unchanged.
///
/// - `msr_content` - Raw MSR content.
pub fn pat_msr_set(pat: &mut MsrIa32Pat, msr_content: u64) -> MtrrResult<()> {
    if pat.into_bits() != msr_content {
        for i in 0..PAT_TYPE_NUMS {
            let mem_type = ((msr_content >> (i * 8)) & 0xff) as u8;
            if !MtrrMemoryCacheType::is_pat_legal(mem_type) {
                return Err(MtrrError::InvalidMemoryType);
            }
        }

        *pat = MsrIa32Pat::from_bits(msr_content);
    }

    Ok(())
}

//  Return the PAT type selected by a leaf page table entry's flags.
//  Valid only when paging is enabled; only 4 KiB leaf entries are handled.
pub(crate) fn page_pat_type(pat: MsrIa32Pat, pte_flags: u32) -> u8 {
    // PCD/PWT form bits 1/0 of the PAT entry index, the PAT bit forms bit 2.
    let mut pat_entry = ((pte_flags >> 3) & 0x3) as usize;
    if pte_flags & PAGE_PAT != 0 {
        pat_entry |= 4;
    }

    pat.entry(pat_entry)
}

/// Derives the guest's effective memory type for a leaf page: the PAT type
/// selected by the page table flags combined with the MTRR type resolved
/// for the guest physical address.
///
/// - `state` -     The guest's virtual MTRR state.
/// - `pat` -       The guest's PAT register.
/// - `gpa` -       Guest physical address.
/// - `pte_flags` - Guest leaf page table entry flags.
pub fn effective_guest_type(state: &MtrrState, pat: MsrIa32Pat, gpa: u64, pte_flags: u32) -> MtrrMemoryCacheType {
    let mtrr_type = state.get_mtrr_type(gpa);
    let pat_type = page_pat_type(pat, pte_flags);

    MM_TYPE_TBL[mtrr_type as usize][pat_type as usize].into()
}

/// Computes the PAT/PCD/PWT bits for a shadow page table entry so the
/// effective memory type the guest configured is reproduced under the
/// host's real MTRR state.
///
/// When no host PAT type yields the guest's effective type under the host
/// MTRR type (e.g. the host forces Uncacheable where the guest configured
/// WriteBack), the conflict is logged and the Uncacheable entry is selected
/// instead: correctness over performance, always.
///
/// - `host_mtrr` -  The host's real MTRR state, captured at boot.
/// - `guest` -      The guest VCPU's MTRR/PAT state.
/// - `gl1e_flags` - Guest leaf page table entry flags.
/// - `gpa` -        Guest physical address.
/// - `spa` -        Host (shadow) physical address backing `gpa`.
pub fn get_pat_flags(
    ctx: &MtrrPatContext,
    host_mtrr: &MtrrState,
    guest: &VcpuMtrrPat,
    gl1e_flags: u32,
    gpa: u64,
    spa: u64,
) -> u32 {
    // 1. Effective memory type of the guest physical address, from the
    //    guest MTRR and PAT pair.
    let guest_eff_type = effective_guest_type(&guest.mtrr, guest.pat, gpa, gl1e_flags);

    // 2. Memory type of the host physical address, from the host MTRR.
    let host_mtrr_type = host_mtrr.get_mtrr_type(spa);

    // 3. The PAT type reproducing the guest's effective type under the
    //    host MTRR type.
    let mut pat_type = ctx.epat_tbl[host_mtrr_type as usize][guest_eff_type as usize];
    if pat_type == INVALID_MEM_TYPE {
        warn!(
            "memory type conflict for guest l1e flags {:#x} at gpa {:#x} \
             (effective type {:?}): host mtrr type is {:?}, forcing UC",
            gl1e_flags, gpa, guest_eff_type, host_mtrr_type
        );
        pat_type = MtrrMemoryCacheType::Uncacheable as u8;
    }

    // 4. The PTE flags selecting that type in the host PAT.
    ctx.pat_type_to_pte_flags(pat_type.into())
}
