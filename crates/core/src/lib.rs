pub mod config;
pub mod error;
pub mod paths;
pub mod types;

pub use config::{CacheConfig, Config, PoolConfig, StoreConfig, SyncConfig};
pub use error::{Error, Result};
pub use paths::Paths;
