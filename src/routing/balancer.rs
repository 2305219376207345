//! Health-Aware Round-Robin Balancer
//!
//! Owns the ordered pool of (backend, meter) pairs and the rotation cursor,
//! and picks the next backend for a call.
//!
//! # Selection Algorithm
//!
//! The cursor advances by one (wrapping) before inspecting, then scans
//! forward for up to `pool_size` attempts looking for a member whose meter is
//! not overloaded. The scan stops at the first fit; when every member is
//! overloaded it degrades to the last member inspected instead of failing the
//! call. Worst case is O(pool size): no infinite loop, and every member gets
//! a cursor turn eventually. Tie-break is pure rotation order.

use std::sync::Arc;

use parking_lot::Mutex;

use super::health::BackendMeter;
use crate::backend::{BackendRegistry, LmBackend};
use crate::config::{ConfigError, PoolConfig};
use crate::dispatch::DispatchError;

// ============================================================================
// Pool Member
// ============================================================================

/// One backend paired with its health meter
pub struct PoolMember {
    /// The backend handle, shared read-only by all callers
    pub backend: Arc<dyn LmBackend>,
    /// Rolling health signals for this backend
    pub meter: BackendMeter,
}

impl PoolMember {
    /// Pair a backend with a fresh meter
    #[must_use]
    pub fn new(backend: Arc<dyn LmBackend>) -> Self {
        Self {
            backend,
            meter: BackendMeter::new(),
        }
    }
}

impl std::fmt::Debug for PoolMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolMember")
            .field("backend", &self.backend.identity())
            .field("meter", &self.meter.snapshot())
            .finish()
    }
}

// ============================================================================
// Round-Robin Balancer
// ============================================================================

/// Rotation-ordered selector over the pool members.
///
/// The member list is fixed after construction; only the cursor mutates, and
/// it is serialized by its own mutex so concurrent callers cannot
/// double-advance it.
pub struct RoundRobinBalancer {
    members: Vec<Arc<PoolMember>>,
    cursor: Mutex<usize>,
}

impl RoundRobinBalancer {
    /// Build a balancer over an ordered member list
    #[must_use]
    pub fn new(members: Vec<Arc<PoolMember>>) -> Self {
        Self {
            members,
            cursor: Mutex::new(0),
        }
    }

    /// Number of members in the pool
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the pool has no members
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// All members, in rotation order
    #[must_use]
    pub fn members(&self) -> &[Arc<PoolMember>] {
        &self.members
    }

    /// Choose the next backend to use.
    ///
    /// Never blocks and never errors on overload; only an empty pool is a
    /// failure. When every member is overloaded the last member inspected is
    /// returned as the least-bad choice.
    pub fn next(&self) -> Result<Arc<PoolMember>, DispatchError> {
        if self.members.is_empty() {
            return Err(DispatchError::NoBackendConfigured);
        }

        let mut cursor = self.cursor.lock();
        let pool_size = self.members.len();

        let mut index = (*cursor + 1) % pool_size;

        for attempt in 0..pool_size {
            let candidate = &self.members[index];
            let snapshot = candidate.meter.snapshot();

            if !snapshot.is_overloaded() {
                break;
            }

            tracing::warn!(
                backend = %candidate.backend.identity(),
                consecutive_failures = snapshot.consecutive_failures,
                calls_last_60s = snapshot.calls_last_60s,
                calls_last_600s = snapshot.calls_last_600s,
                avg_latency_ms = snapshot.average_latency.as_millis() as u64,
                "Skipping overloaded backend"
            );

            if attempt + 1 < pool_size {
                index = (index + 1) % pool_size;
            }
        }

        *cursor = index;
        Ok(self.members[index].clone())
    }
}

impl std::fmt::Debug for RoundRobinBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundRobinBalancer")
            .field("members", &self.members)
            .field("cursor", &*self.cursor.lock())
            .finish()
    }
}

// ============================================================================
// Backend Pool
// ============================================================================

/// A built pool of backends, replaceable in the dispatcher as a unit
pub struct BackendPool {
    balancer: RoundRobinBalancer,
}

impl BackendPool {
    /// Build a pool from configuration, resolving identifiers through the
    /// registry.
    ///
    /// Entries outside the allow-list are filtered out; an unknown identifier
    /// or a missing required credential is fatal here, before any call is
    /// dispatched. Building twice from the same inputs yields an equivalent
    /// pool, so rebuilds are safe.
    pub fn build(config: &PoolConfig, registry: &BackendRegistry) -> Result<Self, ConfigError> {
        let mut members = Vec::new();

        for entry in config.allowed_entries() {
            let backend = registry.build(&entry.name, entry.credential.as_deref())?;
            tracing::info!(backend = %backend.identity(), "Registered pool backend");
            members.push(Arc::new(PoolMember::new(backend)));
        }

        tracing::info!(pool_size = members.len(), "Backend pool built");
        Ok(Self::from_members(members))
    }

    /// Build a pool directly from members (tests, embedders with their own
    /// construction path)
    #[must_use]
    pub fn from_members(members: Vec<Arc<PoolMember>>) -> Self {
        Self {
            balancer: RoundRobinBalancer::new(members),
        }
    }

    /// The balancer owning the rotation cursor
    #[must_use]
    pub fn balancer(&self) -> &RoundRobinBalancer {
        &self.balancer
    }

    /// Choose the next backend for a call
    pub fn next(&self) -> Result<Arc<PoolMember>, DispatchError> {
        self.balancer.next()
    }
}

impl std::fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendPool")
            .field("size", &self.balancer.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendIdentity, StreamFragment};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    /// Backend stub: selection tests never invoke it
    struct InertBackend {
        identity: BackendIdentity,
    }

    impl InertBackend {
        fn member(name: &str) -> Arc<PoolMember> {
            Arc::new(PoolMember::new(Arc::new(Self {
                identity: BackendIdentity::new(name, "v1"),
            })))
        }
    }

    #[async_trait]
    impl crate::backend::LmBackend for InertBackend {
        fn identity(&self) -> &BackendIdentity {
            &self.identity
        }

        async fn invoke(&self, _prompt: &str) -> anyhow::Result<String> {
            unreachable!("selection tests do not invoke backends")
        }

        async fn stream(
            &self,
            _prompt: &str,
        ) -> anyhow::Result<mpsc::Receiver<StreamFragment>> {
            unreachable!("selection tests do not invoke backends")
        }
    }

    fn pool(names: &[&str]) -> RoundRobinBalancer {
        RoundRobinBalancer::new(names.iter().map(|n| InertBackend::member(n)).collect())
    }

    fn selected(balancer: &RoundRobinBalancer) -> String {
        balancer.next().unwrap().backend.identity().name.clone()
    }

    #[test]
    fn test_empty_pool_is_a_defined_failure() {
        let balancer = pool(&[]);
        assert!(matches!(
            balancer.next(),
            Err(DispatchError::NoBackendConfigured)
        ));
    }

    #[test]
    fn test_healthy_pool_rotates_each_backend_once() {
        let balancer = pool(&["a", "b", "c"]);

        // Cursor starts at 0 and advances before inspecting
        assert_eq!(selected(&balancer), "b");
        assert_eq!(selected(&balancer), "c");
        assert_eq!(selected(&balancer), "a");
        // Next cycle continues from the position after the last selection
        assert_eq!(selected(&balancer), "b");
    }

    #[test]
    fn test_failing_backend_is_skipped() {
        let balancer = pool(&["a", "b", "c"]);

        // Two consecutive failures make "b" ineligible
        balancer.members()[1].meter.record_failure();
        balancer.members()[1].meter.record_failure();

        assert_eq!(selected(&balancer), "c");
        assert_eq!(selected(&balancer), "a");
        assert_eq!(selected(&balancer), "c");

        // One success resets the streak and "b" is selectable again
        balancer.members()[1].meter.record_success(Duration::from_millis(50));
        assert_eq!(selected(&balancer), "a");
        assert_eq!(selected(&balancer), "b");
    }

    #[test]
    fn test_failing_backend_recovers_after_window() {
        let balancer = pool(&["a", "b"]);
        let start = Instant::now();

        balancer.members()[0].meter.record_failure_at(start);
        balancer.members()[0].meter.record_failure_at(start);
        assert!(balancer.members()[0].meter.snapshot_at(start).is_overloaded());

        // Five minutes of silence and the streak no longer disqualifies it
        let later = start + Duration::from_secs(301);
        assert!(!balancer.members()[0].meter.snapshot_at(later).is_overloaded());
    }

    #[test]
    fn test_all_overloaded_returns_last_inspected() {
        let balancer = pool(&["a", "b", "c"]);

        for member in balancer.members() {
            member.meter.record_failure();
            member.meter.record_failure();
        }

        // Scan starts at "b", inspects b, c, a; the last inspected wins
        assert_eq!(selected(&balancer), "a");
        // And selection keeps returning without blocking or erroring
        balancer.next().unwrap();
        balancer.next().unwrap();
    }

    #[test]
    fn test_single_backend_pool() {
        let balancer = pool(&["only"]);

        assert_eq!(selected(&balancer), "only");
        balancer.members()[0].meter.record_failure();
        balancer.members()[0].meter.record_failure();
        // Degrades to the only candidate rather than failing
        assert_eq!(selected(&balancer), "only");
    }

    #[test]
    fn test_concurrent_selection_never_double_counts() {
        use std::collections::HashMap;
        use std::sync::Mutex as StdMutex;
        use std::thread;

        let balancer = Arc::new(pool(&["a", "b", "c", "d"]));
        let counts: Arc<StdMutex<HashMap<String, usize>>> = Arc::default();
        let mut handles = vec![];

        for _ in 0..4 {
            let b = balancer.clone();
            let c = counts.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let name = b.next().unwrap().backend.identity().name.clone();
                    *c.lock().unwrap().entry(name).or_default() += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // 400 selections over 4 healthy members: exact rotation fairness
        let counts = counts.lock().unwrap();
        assert_eq!(counts.values().sum::<usize>(), 400);
        for name in ["a", "b", "c", "d"] {
            assert_eq!(counts[name], 100);
        }
    }
}
