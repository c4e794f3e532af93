//! Error types and result aliases for the MTRR/PAT virtualization library.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
pub type MtrrResult<T> = Result<T, MtrrError>;

/// MTRR/PAT error types
///
/// Every variant maps to an architecturally invalid guest MSR write. The
/// caller decides whether a rejected write becomes a guest-visible fault;
/// none of these are fatal to the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtrrError {
    /// A type byte is not an architecturally valid memory type for the
    /// register being written
    InvalidMemoryType,
    /// Reserved bits of the MSR content are set
    ReservedBitsSet,
    /// The MSR index does not resolve to a register this state implements
    InvalidMsrIndex,
}
