//! Backing stores the adapters can be pointed at.

pub mod memory;

pub use memory::{MemoryNativeClient, MemoryStore, MemoryWebClient, StoreOperation};
