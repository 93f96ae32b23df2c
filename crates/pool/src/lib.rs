pub mod engine;
pub mod pool;

pub use engine::{EngineHandle, EngineVariant, SessionFactory};
pub use pool::{SessionLease, SessionPool, UsageMetrics};
