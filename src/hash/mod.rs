//! Content hashing (BLAKE3)
//!
//! This module provides:
//! - Size-tiered file hashing (whole-read, chunked, sampled, memory-mapped)
//! - Full-content hashing for integrity checks
//! - Metadata hashing and the two-tier change check
//! - A cross-thread memoization map shared by one build
//!
//! SIMD dispatch (AVX-512 / AVX2 / NEON / SSE2 / portable) is internal to
//! the `blake3` crate and selected at runtime from detected CPU features;
//! nothing here needs to care.

mod content;
mod memo;

pub use content::{
    digest_eq, hash_file, hash_file_complete, hash_file_two_tier, hash_metadata, hash_string,
    hash_strings, TwoTierHash,
};
pub use memo::HashMemo;
