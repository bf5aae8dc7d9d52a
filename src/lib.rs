//! SPI-NAND flash translation and wear-leveling.
//!
//! The stack, bottom to top:
//!
//! - [`nand`]: the raw device interface ([`nand::RawNand`]), with a Linux MTD
//!   backend and an in-memory simulator.
//! - [`remap`]: the bad-block remap table for byte-addressed partitions.
//! - [`mini`]: the minimal byte-addressed FTL built on the remap table.
//! - [`wear`]: the wear-leveling page store and the log-structured sector map
//!   with garbage collection and crash-safe resume.
//! - [`part`] and [`blockdev`]: partition tables and the block-device shim
//!   that exposes both translation paths under one mutex.

pub mod blockdev;
pub mod error;
pub mod mini;
pub mod nand;
pub mod part;
pub mod remap;
pub mod wear;

pub use error::{FtlError, Violation};
