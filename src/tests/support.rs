//! Test support utilities and helpers for MTRR/PAT unit tests.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0

use crate::pat::MtrrPatContext;
use crate::structs::{
    MSR_IA32_MTRR_PHYSBASE0, MSR_IA32_MTRR_PHYSMASK0, MTRR_PHYSMASK_VALID, MtrrMemoryCacheType, MtrrState,
};
use std::sync::{Mutex, OnceLock};

/// Logger capturing warning messages for assertion.
pub(crate) struct CapturingLogger {
    records: Mutex<Vec<String>>,
}

impl CapturingLogger {
    pub(crate) fn clear(&self) {
        self.records.lock().unwrap().clear();
    }

    pub(crate) fn contains(&self, needle: &str) -> bool {
        self.records.lock().unwrap().iter().any(|message| message.contains(needle))
    }
}

impl log::Log for CapturingLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Warn
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            self.records.lock().unwrap().push(format!("{}", record.args()));
        }
    }

    fn flush(&self) {}
}

/// Installs the capturing logger once per test process and returns it.
pub(crate) fn captured_warnings() -> &'static CapturingLogger {
    static LOGGER: OnceLock<CapturingLogger> = OnceLock::new();
    let logger = LOGGER.get_or_init(|| CapturingLogger { records: Mutex::new(Vec::new()) });
    let _ = log::set_logger(logger);
    log::set_max_level(log::LevelFilter::Warn);
    logger
}

/// Builds raw PHYSBASE content for a naturally aligned range base.
pub(crate) fn make_base(address: u64, mem_type: MtrrMemoryCacheType) -> u64 {
    (address & !0xfff) | mem_type as u64
}

/// Builds raw PHYSMASK content covering `size` bytes (a power of two),
/// valid bit set.
pub(crate) fn make_mask(ctx: &MtrrPatContext, size: u64) -> u64 {
    let addr_mask = (1u64 << ctx.phys_addr_bits()) - 1;
    (size.wrapping_neg() & addr_mask & !0xfff) | MTRR_PHYSMASK_VALID
}

/// Writes both halves of a variable range pair through the MSR mutator,
/// panicking on rejection.
pub(crate) fn set_range(state: &mut MtrrState, ctx: &MtrrPatContext, slot: u32, base: u64, mask: u64) {
    state.var_range_msr_set(ctx, MSR_IA32_MTRR_PHYSBASE0 + 2 * slot, base).unwrap();
    state.var_range_msr_set(ctx, MSR_IA32_MTRR_PHYSMASK0 + 2 * slot, mask).unwrap();
}

/// Reference overlap check: decodes every valid pair into a byte-granular
/// inclusive span straight from the raw registers and intersects all pairs.
/// Kept deliberately separate from the page-frame arithmetic the production
/// detector uses.
pub(crate) fn brute_force_overlapped(ctx: &MtrrPatContext, state: &MtrrState) -> bool {
    let full_mask = (1u64 << ctx.phys_addr_bits()) - 1;
    let addr_mask = full_mask & !0xfff;

    let mut spans: Vec<(u64, u64)> = Vec::new();
    for index in 0..state.capacity() {
        let entry = &state.variables.mtrr[index];
        if entry.mask & MTRR_PHYSMASK_VALID == 0 {
            continue;
        }
        let size = (!(entry.mask & addr_mask) & full_mask) + 1;
        let start = entry.base & addr_mask;
        spans.push((start, start + size - 1));
    }

    for (i, &(start_a, end_a)) in spans.iter().enumerate() {
        for &(start_b, end_b) in &spans[i + 1..] {
            if start_b <= end_a && start_a <= end_b {
                return true;
            }
        }
    }

    false
}
