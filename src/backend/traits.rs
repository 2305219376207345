//! LLM Backend Capability Contract
//!
//! Trait definitions for inference backends. This abstraction allows the
//! dispatcher to rotate across independently-owned providers (GLM, Baichuan,
//! Ollama, etc.) without knowing anything about their wire protocols.
//!
//! # Design Philosophy
//!
//! A backend only has to provide two operations:
//! - a synchronous-style call that returns the full completion text
//! - a lazy call that produces text fragments as they arrive
//!
//! Everything else (selection, health accounting, telemetry) lives in the
//! dispatcher, outside the adapter.

use async_trait::async_trait;
use tokio::sync::mpsc;

// ============================================================================
// Backend Identity
// ============================================================================

/// Stable identity of a backend, used for health reporting and telemetry.
///
/// Created once at pool-build time and shared read-only afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BackendIdentity {
    /// Backend name as registered (e.g. "glm4")
    pub name: String,
    /// Model/API version reported alongside the name (e.g. "glm-4")
    pub version: String,
}

impl BackendIdentity {
    /// Create a new identity
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for BackendIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

// ============================================================================
// Stream Fragments
// ============================================================================

/// Events produced by a backend's lazy call
#[derive(Clone, Debug)]
pub enum StreamFragment {
    /// A fragment of response text
    Text(String),
    /// The sequence completed successfully
    Complete,
    /// The sequence failed partway through
    Error(String),
}

// ============================================================================
// Backend Trait
// ============================================================================

/// The minimal contract any inference backend must satisfy.
///
/// Implementations handle provider-specific details (endpoints, auth, wire
/// formats). Both operations may fail with a backend-specific error; the
/// dispatcher re-raises those errors verbatim after recording the failure.
#[async_trait]
pub trait LmBackend: Send + Sync {
    /// Stable identity used for reporting
    fn identity(&self) -> &BackendIdentity;

    /// Send a prompt and wait for the complete response text
    async fn invoke(&self, prompt: &str) -> anyhow::Result<String>;

    /// Send a prompt and receive response fragments as they arrive.
    ///
    /// The channel closes after a [`StreamFragment::Complete`] or
    /// [`StreamFragment::Error`]. Dropping the receiver is the cancellation
    /// signal: the producing task stops at its next send.
    async fn stream(&self, prompt: &str) -> anyhow::Result<mpsc::Receiver<StreamFragment>>;
}

impl std::fmt::Debug for dyn LmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmBackend")
            .field("identity", self.identity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_display() {
        let id = BackendIdentity::new("glm4", "glm-4");
        assert_eq!(id.to_string(), "glm4/glm-4");
    }
}
