//! Core domain types and shared logic for the silo storage pool.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Content hashes and the sharded blob path scheme
//! - Deterministic shortening of over-long object names
//! - The PNG canonicalizer that strips volatile metadata before hashing
//! - Application configuration

pub mod canonical;
pub mod config;
pub mod error;
pub mod hash;
pub mod name;
pub mod png;

pub use canonical::canonicalize;
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher, CONTENT_HASH_LEN};
pub use name::{to_short_name, MAX_NAME_BYTES};

/// Payloads at or below this size are buffered in memory; larger ones
/// spill to a temporary file.
pub const SPOOL_MEMORY_LIMIT: usize = 8192;
