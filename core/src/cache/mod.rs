//! The two storage tiers: an in-process LRU and a persistent on-disk store.

pub mod disk;
pub mod memory;

pub use disk::PersistentStore;
pub use memory::MemoryCache;

pub type Result<T> = crate::Result<T>;
