//! Guest MTRR state: range decoding, overlap detection, MSR mutators, the
//! memory type resolver, the default layout installer and the consistency
//! comparator.
//!
//! Nothing in this module touches hardware. The state being operated on is
//! the *virtual* MTRR state of one guest VCPU, and the same resolver also
//! runs against the host's real MTRR snapshot captured at boot.
#![allow(clippy::needless_range_loop)]
use crate::error::MtrrError;
use crate::error::MtrrResult;
use crate::pat::MtrrPatContext;
use crate::structs::GuestMemoryRange;
use crate::structs::MsrIa32MtrrDefType;
use crate::structs::MsrIa32MtrrPhysbaseRegister;
use crate::structs::MsrIa32MtrrPhysmaskRegister;
use crate::structs::MtrrMemoryCacheType;
use crate::structs::MtrrState;
use crate::structs::VcpuMtrrPat;
use crate::structs::MSR_IA32_MTRR_PHYSBASE0;
use crate::structs::MTRR_DEF_TYPE_ENABLE;
use crate::structs::MTRR_LIB_FIXED_MTRR_TABLE;
use crate::structs::MTRR_NUMBER_OF_FIXED_MTRR;
use crate::structs::MTRR_PHYSMASK_VALID;
use crate::structs::PAGE_SHIFT;
use crate::structs::RESERVED_VARIABLE_MTRRS;
use crate::structs::SIZE_1MB;
use crate::utils::biggest_alignment;
use crate::utils::get_power_of_two_64;
use log::debug;

//  Decode a variable range register pair into an inclusive page frame range.
//
//  Returns (0, 0) when the pair's valid bit is clear, which is also the
//  encoding of a free slot. The mask is completed with the architecturally
//  fixed bits above the implemented physical address width and negated to
//  obtain the range size; this is only correct for a mask describing a
//  power-of-two span, which is not validated here. A non-contiguous mask
//  yields a bogus range but never anything unbounded.
//
//  - `base_msr` - Raw PHYSBASE register content.
//  - `mask_msr` - Raw PHYSMASK register content.
pub(crate) fn get_mtrr_range(ctx: &MtrrPatContext, base_msr: u64, mask_msr: u64) -> (u64, u64) {
    let mask_reg = MsrIa32MtrrPhysmaskRegister::from_bits(mask_msr);
    if !mask_reg.v() {
        // Invalid (i.e. free) range
        return (0, 0);
    }

    let mask = ctx.size_or_mask() | mask_reg.phys_mask();

    // This works correctly if size is a power of two (a contiguous range).
    let size = mask.wrapping_neg();
    let base = MsrIa32MtrrPhysbaseRegister::from_bits(base_msr).phys_base();

    (base, base.wrapping_add(size).wrapping_sub(1))
}

impl MtrrState {
    /// Returns true iff any two valid variable ranges' address spans
    /// intersect.
    ///
    /// O(n²) over at most `capacity` ranges; run once per variable-range
    /// mutation, never on the resolution path.
    pub fn is_var_mtrr_overlapped(&self, ctx: &MtrrPatContext) -> bool {
        for i in 0..self.capacity {
            let pre = &self.variables.mtrr[i];
            if !MsrIa32MtrrPhysmaskRegister::from_bits(pre.mask).v() {
                continue;
            }
            let (base_pre, end_pre) = get_mtrr_range(ctx, pre.base, pre.mask);

            for seg in (i + 1)..self.capacity {
                let cur = &self.variables.mtrr[seg];
                if !MsrIa32MtrrPhysmaskRegister::from_bits(cur.mask).v() {
                    continue;
                }
                let (base, end) = get_mtrr_range(ctx, cur.base, cur.mask);

                if base <= end_pre && base_pre <= end {
                    return true;
                }
            }
        }

        false
    }

    //  Validate one packed row of fixed range types.
    fn check_fixed_row(msr_content: u64) -> MtrrResult<()> {
        for i in 0..8 {
            let mem_type = ((msr_content >> (i * 8)) & 0xff) as u8;
            if !MtrrMemoryCacheType::is_mtrr_legal(mem_type) {
                debug!("invalid fixed range type: {:#x}", mem_type);
                return Err(MtrrError::InvalidMemoryType);
            }
        }
        Ok(())
    }

    /// Applies a guest write to one fixed range MSR.
    ///
    /// Each of the 8 packed type bytes must be an MTRR-legal type; an
    /// illegal byte rejects the whole write and leaves the row unchanged.
    /// The store is skipped when the row already holds the content. Fixed
    /// range writes cannot create variable range overlaps, so `overlapped`
    /// is not recomputed.
    ///
    /// - `row` -         Fixed range MSR index, 0 to 10.
    /// - `msr_content` - Raw MSR content, 8 packed type bytes.
    pub fn fix_range_msr_set(&mut self, row: usize, msr_content: u64) -> MtrrResult<()> {
        if row >= MTRR_NUMBER_OF_FIXED_MTRR {
            return Err(MtrrError::InvalidMsrIndex);
        }

        if self.fixed.mtrr[row] != msr_content {
            Self::check_fixed_row(msr_content)?;
            self.fixed.mtrr[row] = msr_content;
        }

        Ok(())
    }

    /// Applies a guest write to one half of a variable range register pair.
    ///
    /// The MSR index is resolved to a range slot and a base-vs-mask half.
    /// The base half's type byte must be MTRR-legal, and neither half may
    /// set bits reserved by the implemented physical address width. On
    /// acceptance the half register is stored and `overlapped` is
    /// recomputed from the full set.
    ///
    /// - `msr` -         Absolute MSR index, PHYSBASE0-relative.
    /// - `msr_content` - Raw MSR content.
    pub fn var_range_msr_set(&mut self, ctx: &MtrrPatContext, msr: u32, msr_content: u64) -> MtrrResult<()> {
        let index = msr.checked_sub(MSR_IA32_MTRR_PHYSBASE0).ok_or(MtrrError::InvalidMsrIndex)? as usize;
        if index >= self.capacity * 2 {
            return Err(MtrrError::InvalidMsrIndex);
        }

        let slot = index / 2;
        let is_mask = index % 2 == 1;
        let current =
            if is_mask { self.variables.mtrr[slot].mask } else { self.variables.mtrr[slot].base };

        if current != msr_content {
            if !is_mask {
                let mem_type = MsrIa32MtrrPhysbaseRegister::from_bits(msr_content).mem_type();
                if !MtrrMemoryCacheType::is_mtrr_legal(mem_type) {
                    debug!("invalid variable range type: {:#x}", mem_type);
                    return Err(MtrrError::InvalidMemoryType);
                }
            }

            let reserved = if is_mask { ctx.mask_msr_mask() } else { ctx.base_msr_mask() };
            if msr_content & reserved != 0 {
                debug!("invalid msr content: {:#x}", msr_content);
                return Err(MtrrError::ReservedBitsSet);
            }

            if is_mask {
                self.variables.mtrr[slot].mask = msr_content;
            } else {
                self.variables.mtrr[slot].base = msr_content;
            }
        }

        self.overlapped = self.is_var_mtrr_overlapped(ctx);

        Ok(())
    }

    /// Applies a guest write to the DEF_TYPE MSR, installing the enable
    /// bits and the default type.
    ///
    /// - `msr_content` - Raw MSR content.
    pub fn def_type_msr_set(&mut self, msr_content: u64) -> MtrrResult<()> {
        let reg = MsrIa32MtrrDefType::from_bits(msr_content);

        if !MtrrMemoryCacheType::is_mtrr_legal(reg.mem_type()) {
            debug!("invalid MTRR def type: {:#x}", reg.mem_type());
            return Err(MtrrError::InvalidMemoryType);
        }

        if msr_content & !0xcff != 0 {
            debug!("invalid msr content: {:#x}", msr_content);
            return Err(MtrrError::ReservedBitsSet);
        }

        self.def_type = reg;

        Ok(())
    }

    /// Resolves the MTRR memory type for a physical address.
    ///
    /// Precedence: global disable returns Uncacheable unconditionally;
    /// fixed ranges strictly dominate below 1 MiB when enabled; otherwise
    /// all valid variable ranges are matched. With no match the default
    /// type applies. Overlapping matches resolve per the architectural
    /// rules: all identical yields that type, any Uncacheable yields
    /// Uncacheable, WriteThrough mixed with only WriteBack yields
    /// WriteThrough. Any other combination is architecturally undefined;
    /// the last scanned match is returned as a deterministic fallback.
    ///
    /// - `pa` - The physical address to resolve.
    pub fn get_mtrr_type(&self, pa: u64) -> MtrrMemoryCacheType {
        if !self.def_type.e() {
            return MtrrMemoryCacheType::Uncacheable;
        }

        if pa < SIZE_1MB && self.def_type.fe() {
            // Fixed range MTRR takes effect, at the granularity of its zone.
            for (index, entry) in MTRR_LIB_FIXED_MTRR_TABLE.iter().enumerate() {
                if pa >= entry.base_address as u64 && pa < entry.base_address as u64 + entry.length as u64 * 8 {
                    let sub_index = (pa - entry.base_address as u64) / entry.length as u64;
                    return (((self.fixed.mtrr[index] >> (sub_index * 8)) & 0xff) as u8).into();
                }
            }
        }

        // Match against the variable ranges.
        let mut overlap_types: u8 = 0;
        let mut last_match: u8 = 0;

        for seg in 0..self.capacity {
            let entry = &self.variables.mtrr[seg];
            if !MsrIa32MtrrPhysmaskRegister::from_bits(entry.mask).v() {
                continue;
            }

            if (pa & entry.mask) >> PAGE_SHIFT == (entry.base & entry.mask) >> PAGE_SHIFT {
                let mem_type = MsrIa32MtrrPhysbaseRegister::from_bits(entry.base).mem_type();
                if self.overlapped {
                    overlap_types |= 1 << mem_type;
                    last_match = mem_type;
                } else {
                    // If no overlap, return the found one
                    return mem_type.into();
                }
            }
        }

        // Overlapped or not found.
        if overlap_types == 0 {
            return self.def_type.mem_type().into();
        }

        if overlap_types & !(1u8 << last_match) == 0 {
            // Covers both a single match and two or more identical matches.
            return last_match.into();
        }

        if overlap_types & (1 << MtrrMemoryCacheType::Uncacheable as u8) != 0 {
            // Two or more match, one is UC.
            return MtrrMemoryCacheType::Uncacheable;
        }

        if overlap_types & !((1 << MtrrMemoryCacheType::WriteThrough as u8) | (1 << MtrrMemoryCacheType::WriteBack as u8)) == 0 {
            // Two or more match, WT and WB.
            return MtrrMemoryCacheType::WriteThrough;
        }

        // Behaviour is undefined; return the last overlapped type.
        last_match.into()
    }

    //  Program one variable range slot through the MSR mutators.
    //
    //  - `reg` -      The range slot to program.
    //  - `base_pfn` - First page frame of the range.
    //  - `size_pfn` - Range size in page frames; a power of two.
    //  - `mem_type` - The memory type to install.
    fn set_var_mtrr(
        &mut self,
        ctx: &MtrrPatContext,
        reg: usize,
        base_pfn: u64,
        size_pfn: u64,
        mem_type: MtrrMemoryCacheType,
    ) -> MtrrResult<()> {
        let base_msr = MSR_IA32_MTRR_PHYSBASE0 + 2 * reg as u32;
        let mask_msr = base_msr + 1;

        if size_pfn == 0 {
            // The valid bit lives in the mask, so clearing the mask
            // register is enough to free the slot.
            return self.var_range_msr_set(ctx, mask_msr, 0);
        }

        let addr_mask = ctx.phys_addr_mask() & !((1u64 << PAGE_SHIFT) - 1);
        let base = ((base_pfn << PAGE_SHIFT) & addr_mask) | mem_type as u64;
        let mask = ((size_pfn.wrapping_neg() << PAGE_SHIFT) & addr_mask) | MTRR_PHYSMASK_VALID;

        self.var_range_msr_set(ctx, base_msr, base)?;
        self.var_range_msr_set(ctx, mask_msr, mask)
    }

    //  Cover [start_pfn, start_pfn + size_pfn) with variable ranges of one
    //  type, splitting into the largest power-of-two, naturally aligned
    //  chunks that fit. Chunk alignment follows the lowest set bit of the
    //  current start, chunk size the highest set bit of the remaining
    //  length. Stops when the reserved variable range budget is exhausted.
    //
    //  Returns the next free range slot.
    fn range_to_mtrr(
        &mut self,
        ctx: &MtrrPatContext,
        mut reg: usize,
        mut start_pfn: u64,
        mut size_pfn: u64,
        mem_type: MtrrMemoryCacheType,
    ) -> MtrrResult<usize> {
        let budget = self.capacity.saturating_sub(RESERVED_VARIABLE_MTRRS);

        if size_pfn == 0 || reg >= budget {
            return Ok(reg);
        }

        while size_pfn != 0 {
            let max_align = biggest_alignment(start_pfn, 1u64 << 32);
            let chunk = max_align.min(get_power_of_two_64(size_pfn));

            self.set_var_mtrr(ctx, reg, start_pfn, chunk, mem_type)?;
            reg += 1;

            start_pfn += chunk;
            size_pfn -= chunk;

            if reg >= budget {
                break;
            }
        }

        Ok(reg)
    }

    //  Seed the fixed ranges: 0 to 640 KiB WriteBack, the VGA hole from
    //  640 KiB to 768 KiB WriteCombining, the rest Uncacheable.
    fn setup_fixed_ranges(&mut self) -> MtrrResult<()> {
        self.fix_range_msr_set(0, 0x0606060606060606)?;
        self.fix_range_msr_set(1, 0x0606060606060606)?;
        self.fix_range_msr_set(2, 0x0101010101010101)?;
        for row in 3..MTRR_NUMBER_OF_FIXED_MTRR {
            self.fix_range_msr_set(row, 0)?;
        }
        Ok(())
    }

    //  Seed variable ranges covering guest RAM at or above 1 MiB as
    //  WriteBack. A region starting exactly at 1 MiB is extended down to 0
    //  so low memory and the region share one naturally aligned span.
    fn setup_variable_ranges(&mut self, ctx: &MtrrPatContext, memory_map: &[GuestMemoryRange]) -> MtrrResult<()> {
        let mut reg = 0;

        for region in memory_map {
            if !region.is_ram || region.address < SIZE_1MB {
                continue;
            }

            let (addr, size) = if region.address == SIZE_1MB {
                (0, region.size + SIZE_1MB)
            } else {
                (region.address, region.size)
            };

            reg = self.range_to_mtrr(ctx, reg, addr >> PAGE_SHIFT, size >> PAGE_SHIFT, MtrrMemoryCacheType::WriteBack)?;

            if reg >= self.capacity.saturating_sub(RESERVED_VARIABLE_MTRRS) {
                break;
            }
        }

        Ok(())
    }

    /// Installs the default memory type layout for a freshly created VCPU:
    /// fixed ranges for low memory, WriteBack variable ranges covering the
    /// guest's RAM map, then MTRR globally enabled with default type
    /// Uncacheable.
    ///
    /// Idempotent: a completed install is flagged and repeat calls return
    /// without touching state.
    ///
    /// - `memory_map` - Guest physical memory map, ordered by address.
    pub fn install_default_layout(&mut self, ctx: &MtrrPatContext, memory_map: &[GuestMemoryRange]) -> MtrrResult<()> {
        if self.initialized {
            return Ok(());
        }

        self.setup_fixed_ranges()?;
        self.setup_variable_ranges(ctx, memory_map)?;
        self.def_type_msr_set(MTRR_DEF_TYPE_ENABLE)?;

        self.initialized = true;

        Ok(())
    }

    /// Pretty-prints the full MTRR state. Debug aid, `std` builds only.
    #[cfg(feature = "std")]
    pub fn debug_print_all(&self) {
        println!("MTRR Settings:");
        println!("=============");
        println!("MTRR Default Type: {:#016x}", self.def_type.into_bits());
        for index in 0..MTRR_NUMBER_OF_FIXED_MTRR {
            println!("Fixed MTRR[{:02}]   : {:#016x}", index, self.fixed.mtrr[index]);
        }
        for index in 0..self.capacity {
            let entry = &self.variables.mtrr[index];
            println!("Variable MTRR[{:02}]: Base={:#016x} Mask={:#016x}", index, entry.base, entry.mask);
        }
        println!("Overlapped       : {}", self.overlapped);
    }
}

/// Deep-compares two VCPUs' MTRR/PAT state.
///
/// Returns true when the fixed ranges differ, the variable ranges differ
/// within capacity, the default type AND the enable bits both differ, or
/// the PAT registers differ. Callers use this to decide whether cached
/// shadow mappings must be dropped when switching VCPU context.
pub fn mtrr_pat_not_equal(a: &VcpuMtrrPat, b: &VcpuMtrrPat) -> bool {
    let (ma, mb) = (&a.mtrr, &b.mtrr);

    // Test fixed ranges.
    if ma.fixed != mb.fixed {
        return true;
    }

    // Test variable ranges, only up to capacity.
    let count = ma.capacity.min(mb.capacity);
    if ma.variables.mtrr[..count] != mb.variables.mtrr[..count] {
        return true;
    }

    // Test the default type MSR. Counts as different only when the type
    // and the enable bits both differ.
    if ma.def_type.mem_type() != mb.def_type.mem_type()
        && (ma.def_type.fe(), ma.def_type.e()) != (mb.def_type.fe(), mb.def_type.e())
    {
        return true;
    }

    // Test PAT.
    a.pat != b.pat
}
