//! V8-isolate based multi-tenant execution engine.
//!
//! [`engine::Engine`] is the facade embedders drive; everything else is an
//! implementation detail reachable through it, following the grounding
//! codebase's convention of a thin `lib.rs` that declares modules and
//! re-exports the handful of types callers actually need.

pub mod bridge;
pub mod config;
pub mod context;
pub mod engine;
pub mod invalidation;
pub mod isolate;
pub mod module_loader;
pub mod pool;
pub mod telemetry;
pub mod vfs;

pub use bridge::KvStore;
pub use config::EngineConfig;
pub use context::{RequestEnvelope, ResponseEnvelope};
pub use engine::{Engine, FunctionMetadata, MetadataStore};
pub use invalidation::{CacheInvalidationListener, InvalidationPayload, NotificationSource};
pub use pool::{IsolatePool, PoolMetrics};
pub use rt_errors::{ErrorCode, RuntimeError};
