//! Backend Constructor Registry
//!
//! String-keyed registry of backend constructors. The pool builder resolves
//! configuration identifiers through this map, so adding a provider is a
//! registration, not an edit to the dispatcher.
//!
//! # Usage
//!
//! ```ignore
//! let registry = BackendRegistry::builtin();
//! registry.register("my-proxy", |credential| { ... });
//!
//! let backend = registry.build("glm4", None)?;
//! ```

use std::sync::Arc;

use dashmap::DashMap;

use super::openai_compat::OpenAiCompatBackend;
use super::traits::{BackendIdentity, LmBackend};
use crate::config::ConfigError;

/// Constructor signature: inline credential (if configured) to a ready backend
pub type BackendFactory =
    Arc<dyn Fn(Option<&str>) -> Result<Arc<dyn LmBackend>, ConfigError> + Send + Sync>;

/// Registry of named backend constructors
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: Arc<DashMap<String, BackendFactory>>,
}

impl BackendRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the well-known provider identifiers registered:
    /// `glm4` and `baichuan` (credential required, inline or via their
    /// provider environment variables) and `ollama` (no credential).
    #[must_use]
    pub fn builtin() -> Self {
        let registry = Self::new();

        registry.register("glm4", |credential| {
            openai_compat(
                BackendIdentity::new("glm4", "glm-4"),
                "https://open.bigmodel.cn/api/paas/v4",
                "glm-4",
                require_credential("glm4", "ZHIPU_API_KEY", credential)?,
            )
        });

        registry.register("baichuan", |credential| {
            openai_compat(
                BackendIdentity::new("baichuan", "Baichuan2-Turbo"),
                "https://api.baichuan-ai.com/v1",
                "Baichuan2-Turbo",
                require_credential("baichuan", "BAICHUAN_API_KEY", credential)?,
            )
        });

        registry.register("ollama", |_credential| {
            let base = std::env::var("OLLAMA_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:11434/v1".to_string());
            let model =
                std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3.2".to_string());
            let identity = BackendIdentity::new("ollama", model.clone());
            OpenAiCompatBackend::new(identity, base, model, None)
                .map(|b| Arc::new(b) as Arc<dyn LmBackend>)
                .map_err(|source| ConfigError::Construction {
                    backend: "ollama".to_string(),
                    source,
                })
        });

        registry
    }

    /// Register a constructor under an identifier, replacing any previous one
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(Option<&str>) -> Result<Arc<dyn LmBackend>, ConfigError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Whether an identifier has a registered constructor
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Construct a backend by identifier.
    ///
    /// An unregistered identifier is a fatal configuration error.
    pub fn build(
        &self,
        name: &str,
        credential: Option<&str>,
    ) -> Result<Arc<dyn LmBackend>, ConfigError> {
        let factory = self
            .factories
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ConfigError::UnknownBackend(name.to_string()))?;
        (*factory)(credential)
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("BackendRegistry")
            .field("backends", &names)
            .finish()
    }
}

/// Resolve a required credential: inline value first, then the provider's
/// environment variable.
fn require_credential(
    backend: &str,
    env_var: &'static str,
    inline: Option<&str>,
) -> Result<String, ConfigError> {
    inline
        .map(str::to_string)
        .or_else(|| std::env::var(env_var).ok())
        .ok_or(ConfigError::MissingCredential {
            backend: backend.to_string(),
            env_var,
        })
}

fn openai_compat(
    identity: BackendIdentity,
    base_url: &str,
    model: &str,
    api_key: String,
) -> Result<Arc<dyn LmBackend>, ConfigError> {
    let backend_name = identity.name.clone();
    OpenAiCompatBackend::new(identity, base_url, model, Some(api_key))
        .map(|b| Arc::new(b) as Arc<dyn LmBackend>)
        .map_err(|source| ConfigError::Construction {
            backend: backend_name,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_identifier_is_fatal() {
        let registry = BackendRegistry::builtin();
        let err = registry.build("gpt-imaginary", None).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBackend(name) if name == "gpt-imaginary"));
    }

    #[test]
    fn test_inline_credential_satisfies_requirement() {
        let registry = BackendRegistry::builtin();
        let backend = registry.build("glm4", Some("sk-test")).unwrap();
        assert_eq!(backend.identity().name, "glm4");
    }

    #[test]
    fn test_custom_registration_overrides() {
        let registry = BackendRegistry::new();
        assert!(!registry.contains("glm4"));

        registry.register("glm4", |_| {
            Err(ConfigError::UnknownBackend("stub".to_string()))
        });
        assert!(registry.contains("glm4"));
    }
}
