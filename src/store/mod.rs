//! Abstract persistence and caching collaborators, plus in-memory defaults.

pub mod cache;
pub mod memory;
pub mod traits;

pub use cache::{Cache, CacheKey, CacheKeyspace, MemoryCache};
pub use memory::MemoryStore;
pub use traits::{ExecutionStore, ServerStore, ToolStore};

#[cfg(test)]
pub use cache::MockCache;
#[cfg(test)]
pub use traits::{MockExecutionStore, MockServerStore, MockToolStore};
