pub mod memory;
pub mod types;

pub use memory::MemoryDirectory;
pub use types::{Directory, DirectoryEvent, DirectorySnapshot, EventStream};
