//! Slipstream Core - Shared types, hashing primitives, and configuration
//!
//! This crate contains the foundational types used across all slipstream
//! components. It has no dependencies on persistence or filesystem-walking
//! code; everything here is cheap to construct and safe to share.

pub mod bloom;
pub mod config;
pub mod error;
pub mod path;
pub mod text;
pub mod tth;
pub mod types;

pub use bloom::NameBloom;
pub use config::{Config, HashingConfig, MonitoringConfig, ShareConfig, UploadConfig};
pub use error::*;
pub use tth::{Cid, TigerTree, TigerTreeHasher, TthValue};
pub use types::*;

/// Smallest tree block size in bytes (64 KiB)
pub const MIN_BLOCK_SIZE: u64 = 64 * 1024;

/// Maximum number of leaves kept for a stored tree
pub const MAX_TREE_LEAVES: u64 = 1024;

/// Read granularity used while hashing (512 KiB)
pub const HASH_CHUNK_SIZE: usize = 512 * 1024;

/// Requests at or below this size qualify for a small-file slot
pub const SMALL_FILE_SIZE: i64 = 65_792;

/// Record format version for the hashed-file stores
pub const STORE_VERSION: u8 = 1;

/// ADC path separator; local separators are converted at the boundary
pub const ADC_SEPARATOR: char = '/';

/// Version string advertised in generated file lists
pub const LIST_GENERATOR: &str = concat!("slipstream ", env!("CARGO_PKG_VERSION"));
