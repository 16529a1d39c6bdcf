pub mod backlog;
pub mod breaker;
pub mod coalesce;
pub mod disposer;
pub mod fallback;
pub mod memory;
pub mod merge;
pub mod reconcile;
pub mod remote;

pub use backlog::Backlog;
pub use breaker::{BreakerState, CircuitBreaker};
pub use coalesce::{FieldGroup, WriteCoalescer, WriteKey};
pub use disposer::Disposer;
pub use fallback::{FallbackStore, FileFallback, ScopedFallback};
pub use memory::{MemoryFallback, MemoryRemote};
pub use remote::{CollectionSnapshot, Fields, RawDocument, RemoteStore, RemoteWrite};
