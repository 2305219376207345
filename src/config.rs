//! Pool Configuration
//!
//! Environment-driven configuration for the backend pool, loaded at startup
//! or whenever the pool is rebuilt.
//!
//! # Environment Variables
//!
//! - `DISPATCH_BACKENDS`: ordered comma list of backend identifiers, each
//!   `name` or `name:credential` (e.g. `glm4,baichuan:sk-abc`)
//! - `DISPATCH_BACKEND_ALLOW`: optional comma allow-list; identifiers outside
//!   it are filtered out before instantiation
//!
//! Parsing is pure, so rebuilding a pool from the same environment is
//! idempotent. Unknown identifiers and missing credentials are fatal at
//! pool-build time, not at call time.

use std::collections::HashSet;

use thiserror::Error;

/// Environment variable naming the ordered backend list
pub const BACKENDS_ENV: &str = "DISPATCH_BACKENDS";

/// Environment variable naming the optional allow-list
pub const ALLOW_ENV: &str = "DISPATCH_BACKEND_ALLOW";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while building a backend pool
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An identifier with no registered constructor
    #[error("Unknown backend identifier: {0}")]
    UnknownBackend(String),

    /// A backend requiring a credential got none (neither inline nor from its
    /// well-known environment variable)
    #[error("Backend {backend} requires a credential (set {env_var} or use {backend}:<credential>)")]
    MissingCredential {
        /// The backend identifier
        backend: String,
        /// The environment variable that would supply the credential
        env_var: &'static str,
    },

    /// A registered constructor failed
    #[error("Failed to construct backend {backend}: {source}")]
    Construction {
        /// The backend identifier
        backend: String,
        /// The underlying construction error
        source: anyhow::Error,
    },
}

// =============================================================================
// Pool Configuration
// =============================================================================

/// One configured backend: an identifier with an optional inline credential
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendEntry {
    /// Registered backend identifier
    pub name: String,
    /// Inline credential from `name:credential`, if any
    pub credential: Option<String>,
}

/// Ordered backend list plus an optional allow-list
#[derive(Clone, Debug, Default)]
pub struct PoolConfig {
    /// Backends to instantiate, in rotation order
    pub entries: Vec<BackendEntry>,
    /// When set, only these identifiers are instantiated
    pub allow_list: Option<HashSet<String>>,
}

impl PoolConfig {
    /// Parse a backend list (`name` or `name:credential`, comma separated)
    /// and an optional allow-list.
    #[must_use]
    pub fn parse(backends: &str, allow: Option<&str>) -> Self {
        let entries = backends
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|spec| {
                // Split only on the first colon; credentials may contain more
                match spec.split_once(':') {
                    Some((name, credential)) => BackendEntry {
                        name: name.to_string(),
                        credential: Some(credential.to_string()),
                    },
                    None => BackendEntry {
                        name: spec.to_string(),
                        credential: None,
                    },
                }
            })
            .collect();

        let allow_list = allow.map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        });

        Self {
            entries,
            allow_list,
        }
    }

    /// Load configuration from the process environment.
    ///
    /// Missing `DISPATCH_BACKENDS` yields an empty entry list; whether that
    /// is an error is decided at selection time, not here.
    #[must_use]
    pub fn from_env() -> Self {
        let backends = std::env::var(BACKENDS_ENV).unwrap_or_default();
        let allow = std::env::var(ALLOW_ENV).ok();
        Self::parse(&backends, allow.as_deref())
    }

    /// Entries surviving the allow-list filter, in configured order
    pub fn allowed_entries(&self) -> impl Iterator<Item = &BackendEntry> {
        self.entries.iter().filter(move |entry| {
            self.allow_list
                .as_ref()
                .is_none_or(|allow| allow.contains(&entry.name))
        })
    }
}
