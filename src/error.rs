//! Error taxonomy for the storage stack.
//!
//! Hardware trouble (I/O failures, uncorrectable ECC, blocks going bad) is
//! reported up the call chain so the caller can retire blocks or fail the
//! request. Protocol violations, i.e. using the device in a way NAND
//! physically cannot honor, mean the *caller* is broken, and the operation is
//! refused without touching the hardware. A freestanding
//! integration may choose to treat [`FtlError::Protocol`] as fatal; a hosted
//! one can surface it like any other error.

use thiserror::Error;

/// Ways a caller can violate the NAND access protocol.
///
/// None of these indicate device trouble; continuing as if the operation had
/// succeeded risks silent data corruption, so they are always refused.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Block index beyond the end of the device.
    #[error("block {0} out of range")]
    BlockOutOfRange(u32),

    /// Page index beyond the end of the device.
    #[error("page {0} out of range")]
    PageOutOfRange(u32),

    /// Pages of a block must be programmed in strictly increasing order;
    /// reprogramming requires an erase first.
    #[error("block {block}: page {page} programmed out of order (next writable is {next})")]
    ProgramOrder { block: u32, page: u32, next: u32 },

    /// The block has been retired and must no longer be erased or programmed.
    #[error("block {0} is retired")]
    WornBlock(u32),

    /// A page-level read must stay within one page.
    #[error("read of {length} bytes at column {offset} exceeds the page")]
    ReadBounds { offset: usize, length: usize },

    /// Address translation hit a block whose remap entry was never resolved.
    #[error("block {0} has no resolved mapping")]
    Unmapped(u32),
}

/// Errors reported by the storage stack.
#[derive(Debug, Error)]
pub enum FtlError {
    /// Caller-side contract breach; see [`Violation`].
    #[error("protocol violation: {0}")]
    Protocol(#[from] Violation),

    /// The transport or the chip reported a failure.
    #[error("i/o failure at byte address {addr:#x}")]
    Io { addr: u64 },

    /// A read came back with errors the ECC could not correct. The data may
    /// merely be stale garbage (e.g. an interrupted program), so this is kept
    /// distinct from [`FtlError::Io`].
    #[error("uncorrectable ECC error on page {page}")]
    Ecc { page: u32 },

    /// A program or erase failed in a way that means the block should be
    /// retired by the mapping layer.
    #[error("block {block} failed and should be retired")]
    BadBlock { block: u32 },

    /// Address or length not aligned to the required page/block granularity.
    #[error("address or length not aligned to the device granularity")]
    Misaligned,

    /// Address, sector, or range outside the addressable span.
    #[error("address out of range")]
    OutOfRange,

    /// The partition was not opened with the capability this call needs.
    #[error("operation not permitted by partition access flags")]
    NoAccess,

    /// No usable erase blocks remain for the requested operation.
    #[error("no usable space left on the device")]
    Full,

    /// On-flash metadata failed magic/CRC/consistency validation.
    #[error("on-flash metadata failed validation")]
    CorruptMeta,

    /// No partition registered under this name.
    #[error("no partition named {0:?}")]
    UnknownPartition(String),

    /// The device or configuration cannot support the request.
    #[error("{0}")]
    Unsupported(&'static str),
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = FtlError> = std::result::Result<T, E>;
