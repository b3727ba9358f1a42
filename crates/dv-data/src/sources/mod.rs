pub mod memory_source;

pub use memory_source::{AppliedFilter, MemorySource};
