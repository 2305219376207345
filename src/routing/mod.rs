//! Backend Selection and Health Accounting
//!
//! The rolling per-backend health meter and the health-aware round-robin
//! balancer that picks the next backend for a call.
//!
//! ```text
//! +--------------+     next()      +---------------------+
//! |  Dispatcher  | --------------> | RoundRobinBalancer  |
//! +--------------+                 +----------+----------+
//!                                             |
//!                                     reads snapshots
//!                                             v
//!                                  +---------------------+
//!                                  | BackendMeter (x N)  |
//!                                  +---------------------+
//! ```
//!
//! Meters are mutated only by the recording step after a call completes or
//! fails; selection reads them and mutates nothing but its own cursor.

pub mod balancer;
pub mod health;

pub use balancer::{BackendPool, PoolMember, RoundRobinBalancer};
pub use health::{BackendMeter, MeterSnapshot};
