pub mod memory;
pub mod types;

pub use memory::MemoryRegistry;
pub use types::{ActionRegistry, RegistryError, RegistryEvent, WatchStream};
