//! Authoritative resource store abstraction.

mod error;
mod event;
mod memory;
mod traits;

pub use error::{Result, StoreError};
pub use event::WatchEvent;
pub use memory::MemoryStore;
pub use traits::{LabelSelector, ResourceStore};
