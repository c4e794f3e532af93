use bitfield_struct::bitfield;

//
// public structs/definitions
//

// Structure to describe a fixed-range MTRR register
#[repr(C)]
pub struct FixedMtrr {
    pub msr: u32,
    pub base_address: u32,
    pub length: u32,
}

// Structure to hold base and mask pair for a variable-range MTRR register.
// Both halves hold raw MSR content; decoding happens in the resolver.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MtrrVariableSetting {
    pub base: u64,
    pub mask: u64,
}

// Array for variable MTRRs
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MtrrVariableSettings {
    pub mtrr: [MtrrVariableSetting; MTRR_NUMBER_OF_VARIABLE_MTRR],
}

// Array for fixed MTRRs, one packed u64 row per fixed-range MSR
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MtrrFixedSettings {
    pub mtrr: [u64; MTRR_NUMBER_OF_FIXED_MTRR],
}

// MSR_IA32_MTRR_DEF_TYPE register layout.
//
// The type field is modeled as the full low byte rather than the
// architectural 3 bits: the reserved-bit mask of the register permits bits
// 7:0, and an out-of-range value in those bits must be rejected as an
// invalid type, not as a reserved-bit violation.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct MsrIa32MtrrDefType {
    #[bits(8)]
    pub mem_type: u8, // [Bits 7:0] Default Memory Type
    #[bits(2)]
    pub reserved1: u8, // [Bits 9:8] Reserved
    #[bits(1)]
    pub fe: bool, // [Bit 10] Fixed Range MTRR Enable
    #[bits(1)]
    pub e: bool, // [Bit 11] MTRR Enable
    #[bits(52)]
    pub reserved2: u64, // [Bits 63:12] Reserved
}

#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct MsrIa32MtrrPhysbaseRegister {
    #[bits(8)]
    pub mem_type: u8, // [Bits 7:0] Type. Specifies memory type of the range.
    #[bits(4)]
    pub reserved1: u8, // [Bits 11:8] Reserved.
    #[bits(52)]
    pub phys_base: u64, // [Bits MAXPHYSADDR:12] PhysBase, page frame number.
}

#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct MsrIa32MtrrPhysmaskRegister {
    #[bits(11)]
    pub reserved1: u16, // [Bits 10:0] Reserved.
    #[bits(1)]
    pub v: bool, // [Bit 11] Valid.
    #[bits(52)]
    pub phys_mask: u64, // [Bits MAXPHYSADDR:12] PhysMask, page frame mask.
}

// MSR_IA32_PAT register layout: 8 page attribute fields, one per PAT entry.
// Only the low 3 bits of each field are architecturally meaningful.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct MsrIa32Pat {
    #[bits(8)]
    pub pa0: u8,
    #[bits(8)]
    pub pa1: u8,
    #[bits(8)]
    pub pa2: u8,
    #[bits(8)]
    pub pa3: u8,
    #[bits(8)]
    pub pa4: u8,
    #[bits(8)]
    pub pa5: u8,
    #[bits(8)]
    pub pa6: u8,
    #[bits(8)]
    pub pa7: u8,
}

impl MsrIa32Pat {
    /// Returns the type code held in the given PAT entry (PAn field).
    pub fn entry(&self, index: usize) -> u8 {
        ((self.into_bits() >> ((index & 7) << 3)) & 0xff) as u8
    }
}

/// Architectural default PAT content installed at VCPU reset:
/// WB, WT, UC-, UC, WB, WT, UC-, UC.
pub const DEFAULT_PAT: MsrIa32Pat = MsrIa32Pat::from_bits(0x0007040600070406);

#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MtrrMemoryCacheType {
    #[default]
    Uncacheable = 0,
    WriteCombining = 1,
    Reserved1 = 2,
    Reserved2 = 3,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
    UncacheableMinus = 7,
}

impl From<u8> for MtrrMemoryCacheType {
    fn from(value: u8) -> Self {
        match value {
            0 => MtrrMemoryCacheType::Uncacheable,
            1 => MtrrMemoryCacheType::WriteCombining,
            2 => MtrrMemoryCacheType::Reserved1,
            3 => MtrrMemoryCacheType::Reserved2,
            4 => MtrrMemoryCacheType::WriteThrough,
            5 => MtrrMemoryCacheType::WriteProtected,
            6 => MtrrMemoryCacheType::WriteBack,
            7 => MtrrMemoryCacheType::UncacheableMinus,
            _ => panic!("Invalid MTRR_MEMORY_CACHE_TYPE value: {}", value),
        }
    }
}

impl MtrrMemoryCacheType {
    /// Returns true when the byte encodes a type an MTRR register may hold.
    pub fn is_mtrr_legal(value: u8) -> bool {
        matches!(value, 0 | 1 | 4 | 5 | 6)
    }

    /// Returns true when the byte encodes a type a PAT entry may hold.
    /// PAT additionally allows UC- (7); the reserved codes 2 and 3 stay
    /// illegal.
    pub fn is_pat_legal(value: u8) -> bool {
        matches!(value, 0 | 1 | 4 | 5 | 6 | 7)
    }
}

/// One entry of the guest physical memory map supplied at VM creation.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GuestMemoryRange {
    pub address: u64,
    pub size: u64,
    pub is_ram: bool,
}

impl GuestMemoryRange {
    pub fn new(address: u64, size: u64, is_ram: bool) -> Self {
        Self { address, size, is_ram }
    }
}

/// Virtual MTRR state owned exclusively by one virtual CPU.
///
/// Mutated only through the MSR mutators (guest MSR-write emulation) or the
/// default layout installer. `overlapped` is derived state, recomputed after
/// every variable-range mutation; fixed-range and default-type writes cannot
/// create overlaps and leave it untouched.
///
/// The register fields are public so a host-side snapshot can be populated
/// from raw MSR reads. Every type byte stored through them must be an
/// MTRR-legal type, the same precondition the mutators enforce; the
/// resolver panics on reserved or out-of-range type codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtrrState {
    pub fixed: MtrrFixedSettings,
    pub variables: MtrrVariableSettings,
    pub def_type: MsrIa32MtrrDefType,
    pub(crate) overlapped: bool,
    pub(crate) capacity: usize,
    pub(crate) initialized: bool,
}

impl MtrrState {
    /// Creates a zeroed MTRR state with the given number of usable variable
    /// range slots. MTRR starts globally disabled; every resolution returns
    /// Uncacheable until the default layout is installed or the guest
    /// enables it.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity <= MTRR_NUMBER_OF_VARIABLE_MTRR);
        Self {
            fixed: MtrrFixedSettings::default(),
            variables: MtrrVariableSettings::default(),
            def_type: MsrIa32MtrrDefType::default(),
            overlapped: false,
            capacity,
            initialized: false,
        }
    }

    /// Number of usable variable range slots; fixed at construction.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True iff any two configured variable ranges intersect.
    pub fn overlapped(&self) -> bool {
        self.overlapped
    }

    /// True once the default layout installer has completed for this state.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

impl Default for MtrrState {
    fn default() -> Self {
        Self::new(MTRR_VCNT)
    }
}

/// Per-VCPU MTRR state and PAT register pair. The two have independent
/// lifecycles architecturally but are always read together when deriving an
/// effective memory type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcpuMtrrPat {
    pub mtrr: MtrrState,
    pub pat: MsrIa32Pat,
}

impl VcpuMtrrPat {
    /// Creates the state pair for a new virtual CPU: zeroed, disabled MTRR
    /// state and the architectural default PAT.
    pub fn new(capacity: usize) -> Self {
        Self { mtrr: MtrrState::new(capacity), pat: DEFAULT_PAT }
    }

    /// Resets to the post-construction state, preserving capacity.
    pub fn reset(&mut self) {
        let capacity = self.mtrr.capacity;
        self.mtrr = MtrrState::new(capacity);
        self.pat = DEFAULT_PAT;
    }
}

impl Default for VcpuMtrrPat {
    fn default() -> Self {
        Self::new(MTRR_VCNT)
    }
}

//
// structs/definitions internal to the MTRR library
//

/// MSR index of IA32_MTRR_DEF_TYPE, for the caller's MSR dispatch.
pub const MSR_IA32_MTRR_DEF_TYPE: u32 = 0x000002FF;
/// MSR index of IA32_PAT, for the caller's MSR dispatch.
pub const MSR_IA32_PAT: u32 = 0x00000277;
pub const MTRR_NUMBER_OF_VARIABLE_MTRR: usize = 32;
pub const MTRR_NUMBER_OF_FIXED_MTRR: usize = 11;

/// Variable range count reported to guests by default.
pub const MTRR_VCNT: usize = 8;

/// Variable range slots the default layout installer leaves free for the
/// guest OS, by convention.
pub const RESERVED_VARIABLE_MTRRS: usize = 2;

pub(crate) const SIZE_1MB: u64 = 0x00100000;
pub(crate) const SIZE_64KB: u32 = 0x00010000;
pub(crate) const SIZE_16KB: u32 = 0x00004000;
pub(crate) const SIZE_4KB: u32 = 0x00001000;
pub(crate) const PAGE_SHIFT: u32 = 12;

/// DEF_TYPE content written by the installer: default type UC, fixed and
/// global enables set.
pub(crate) const MTRR_DEF_TYPE_ENABLE: u64 = 0xc00;

// Valid bit of a PHYSMASK register.
pub(crate) const MTRR_PHYSMASK_VALID: u64 = 1 << 11;

// Fixed MTRR msr
pub(crate) const MSR_IA32_MTRR_FIX64K_00000: u32 = 0x00000250;
pub(crate) const MSR_IA32_MTRR_FIX16K_80000: u32 = 0x00000258;
pub(crate) const MSR_IA32_MTRR_FIX16K_A0000: u32 = 0x00000259;
pub(crate) const MSR_IA32_MTRR_FIX4K_C0000: u32 = 0x00000268;
pub(crate) const MSR_IA32_MTRR_FIX4K_C8000: u32 = 0x00000269;
pub(crate) const MSR_IA32_MTRR_FIX4K_D0000: u32 = 0x0000026A;
pub(crate) const MSR_IA32_MTRR_FIX4K_D8000: u32 = 0x0000026B;
pub(crate) const MSR_IA32_MTRR_FIX4K_E0000: u32 = 0x0000026C;
pub(crate) const MSR_IA32_MTRR_FIX4K_E8000: u32 = 0x0000026D;
pub(crate) const MSR_IA32_MTRR_FIX4K_F0000: u32 = 0x0000026E;
pub(crate) const MSR_IA32_MTRR_FIX4K_F8000: u32 = 0x0000026F;

// Table for fixed MTRRs: 64 KiB granularity below 512 KiB, 16 KiB up to
// 768 KiB, 4 KiB up to 1 MiB. Each row covers 8 * length bytes.
pub(crate) const MTRR_LIB_FIXED_MTRR_TABLE: [FixedMtrr; MTRR_NUMBER_OF_FIXED_MTRR] = [
    FixedMtrr { msr: MSR_IA32_MTRR_FIX64K_00000, base_address: 0, length: SIZE_64KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX16K_80000, base_address: 0x80000, length: SIZE_16KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX16K_A0000, base_address: 0xA0000, length: SIZE_16KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX4K_C0000, base_address: 0xC0000, length: SIZE_4KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX4K_C8000, base_address: 0xC8000, length: SIZE_4KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX4K_D0000, base_address: 0xD0000, length: SIZE_4KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX4K_D8000, base_address: 0xD8000, length: SIZE_4KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX4K_E0000, base_address: 0xE0000, length: SIZE_4KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX4K_E8000, base_address: 0xE8000, length: SIZE_4KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX4K_F0000, base_address: 0xF0000, length: SIZE_4KB },
    FixedMtrr { msr: MSR_IA32_MTRR_FIX4K_F8000, base_address: 0xF8000, length: SIZE_4KB },
];

// Variable MTRR msr
pub const MSR_IA32_MTRR_PHYSBASE0: u32 = 0x00000200;
pub const MSR_IA32_MTRR_PHYSMASK0: u32 = 0x00000201;
