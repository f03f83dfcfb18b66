//! Idempotent repositories
//!
//! Storage for "already seen" message keys, used by the idempotent consumer to
//! drop duplicates. Two backends ship with the crate:
//! - `MemoryIdempotentRepository`: bounded in-process cache
//! - `FileIdempotentRepository`: the same cache persisted as one key per line

pub mod file;
pub mod memory;
pub mod repository;

mod cache;

pub use file::FileIdempotentRepository;
pub use memory::MemoryIdempotentRepository;
pub use repository::IdempotentRepository;

/// Default number of keys kept before the oldest are evicted.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 1000;
