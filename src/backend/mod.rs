//! Inference Backend Abstraction
//!
//! The capability contract every backend adapter implements
//! ([`LmBackend`]), the string-keyed constructor registry used at pool-build
//! time ([`BackendRegistry`]), and one concrete HTTP adapter for
//! OpenAI-compatible providers.

pub mod openai_compat;
pub mod registry;
pub mod traits;

pub use openai_compat::OpenAiCompatBackend;
pub use registry::{BackendFactory, BackendRegistry};
pub use traits::{BackendIdentity, LmBackend, StreamFragment};
