//! The boundary to the automation layer. The pool only ever sees sessions
//! through these capability traits; engine internals stay opaque.

use async_trait::async_trait;
use pagevault_core::Result;
use serde::{Deserialize, Serialize};

/// Supported browser engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineVariant {
    Chrome,
    Edge,
    Firefox,
}

impl EngineVariant {
    pub const ALL: [EngineVariant; 3] =
        [EngineVariant::Chrome, EngineVariant::Edge, EngineVariant::Firefox];

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "firefox" | "ff" => Self::Firefox,
            "edge" | "msedge" => Self::Edge,
            _ => Self::Chrome,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Edge => "edge",
            Self::Firefox => "firefox",
        }
    }
}

/// Live automation session owned by a pool slot. Health and memory figures
/// come from the automation layer; the pool never looks past this trait.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// Liveness signal. An unhealthy session is destroyed, never reused.
    fn is_healthy(&self) -> bool;

    /// Rough resident-memory estimate for usage accounting.
    fn memory_estimate_bytes(&self) -> u64;

    /// Tear down the underlying engine process. Idempotent.
    async fn dispose(&mut self);
}

/// Launches engine sessions on behalf of the pool.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, tenant_id: &str, variant: EngineVariant)
        -> Result<Box<dyn EngineHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_parsing_defaults_to_chrome() {
        assert_eq!(EngineVariant::from_str("firefox"), EngineVariant::Firefox);
        assert_eq!(EngineVariant::from_str("ff"), EngineVariant::Firefox);
        assert_eq!(EngineVariant::from_str("msedge"), EngineVariant::Edge);
        assert_eq!(EngineVariant::from_str("chrome"), EngineVariant::Chrome);
        assert_eq!(EngineVariant::from_str("anything"), EngineVariant::Chrome);
    }
}
