//! Dispatch Core - Adaptive Multi-Backend LLM Dispatch
//!
//! This crate routes inference calls across a pool of heterogeneous,
//! independently-owned backend services. Each call picks a healthy backend
//! from rolling health signals, and per-call telemetry is recorded for later
//! accounting. It is pure dispatch logic: no retrieval pipeline, no prompt
//! construction, no web surface.
//!
//! # Architecture
//!
//! ```text
//! caller
//!   |            (ambient CallContext bound per unit of work)
//!   v
//! +-------------+   next()   +--------------------+
//! | Dispatcher  | ---------> | RoundRobinBalancer |
//! | invoke/     |            |  cursor + meters   |
//! | stream      |            +--------------------+
//! +------+------+
//!        | call
//!        v
//! +-------------+  success/failure  +---------------+
//! |  LmBackend  | ----------------> | BackendMeter  |
//! +-------------+                   +---------------+
//!        |
//!        +--> InvocationRecord --> RecordSink (external storage)
//! ```
//!
//! # Key Types
//!
//! - [`Dispatcher`]: the public entry point (`invoke`, `stream`)
//! - [`LmBackend`]: the minimal capability contract a backend implements
//! - [`BackendPool`] / [`RoundRobinBalancer`]: rotation-ordered, health-aware
//!   backend selection
//! - [`BackendMeter`]: rolling per-backend health signals
//! - [`CallContext`]: ambient per-unit-of-work identity for telemetry
//! - [`InvocationRecord`] / [`RecordSink`]: the durable per-call telemetry row
//!   and its storage boundary
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use dispatch_core::{
//!     BackendPool, BackendRegistry, CallContext, Dispatcher, PoolConfig, Purpose,
//! };
//!
//! let registry = BackendRegistry::builtin();
//! let pool = BackendPool::build(&PoolConfig::from_env(), &registry)?;
//! let dispatcher = Dispatcher::new(Arc::new(pool));
//!
//! let ctx = CallContext::new("user-7", Purpose::Chat).with_session("s-42");
//! let answer = ctx.scope(dispatcher.invoke("What changed last quarter?")).await?;
//! ```
//!
//! # Concurrency
//!
//! The pool, the rotation cursor, and every meter are shared mutable state
//! across all concurrent callers. Each meter and the cursor are serialized by
//! their own mutex; the active pool sits behind a read-write swap point so it
//! can be rebuilt and replaced without a restart.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod routing;
pub mod telemetry;

// Re-exports for convenience
pub use backend::{
    BackendIdentity, BackendRegistry, LmBackend, OpenAiCompatBackend, StreamFragment,
};
pub use config::{BackendEntry, ConfigError, PoolConfig};
pub use context::{CallContext, Purpose};
pub use dispatch::{DispatchError, DispatchStream, Dispatcher};
pub use routing::{BackendMeter, BackendPool, MeterSnapshot, PoolMember, RoundRobinBalancer};
pub use telemetry::{estimate_tokens, CallKind, InvocationRecord, MemorySink, RecordSink};
