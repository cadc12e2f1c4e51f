//! Registry directory storage.

mod memory;

pub use memory::MemoryRegistry;
