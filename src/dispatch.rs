//! Dispatch Facade
//!
//! The public entry point for inference calls. Wraps backend selection,
//! timing, error containment, health bookkeeping, and telemetry recording
//! behind two operations: [`Dispatcher::invoke`] and [`Dispatcher::stream`].
//!
//! # Error Containment
//!
//! Health bookkeeping and telemetry are side channels. A backend error is
//! recorded against that backend's meter and then re-raised verbatim; the
//! dispatcher never masks, retries, or times out a backend call on its own.
//! A telemetry persistence failure is logged and swallowed.
//!
//! # Streaming Semantics
//!
//! [`DispatchStream`] forwards fragments single-pass as the consumer drains
//! them. Success is recorded (and the invocation record persisted) only once
//! the underlying sequence is fully exhausted. A consumer that abandons the
//! stream early leaves no health or telemetry trace for that call; a
//! mid-sequence backend error records one failure and surfaces at the failing
//! fragment. Fragments already yielded are never retracted.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::backend::StreamFragment;
use crate::context::CallContext;
use crate::routing::{BackendPool, PoolMember};
use crate::telemetry::{estimate_tokens, CallKind, InvocationRecord, RecordSink};

// =============================================================================
// Error Types
// =============================================================================

/// Errors surfaced by the dispatch facade
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Selection was attempted on an empty pool
    #[error("No backend configured")]
    NoBackendConfigured,

    /// The selected backend failed; the original error is passed through
    /// unchanged
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Adaptive multi-backend request dispatcher.
///
/// Holds the active [`BackendPool`] behind a swap point so a freshly built
/// pool can replace the current one without a restart; in-flight calls keep
/// the pool snapshot they selected from.
pub struct Dispatcher {
    pool: RwLock<Arc<BackendPool>>,
    sink: Option<Arc<dyn RecordSink>>,
}

impl Dispatcher {
    /// Create a dispatcher over a built pool, with no telemetry sink
    #[must_use]
    pub fn new(pool: Arc<BackendPool>) -> Self {
        Self {
            pool: RwLock::new(pool),
            sink: None,
        }
    }

    /// Attach the sink invocation records are persisted through
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Snapshot of the currently active pool
    #[must_use]
    pub fn pool(&self) -> Arc<BackendPool> {
        self.pool.read().clone()
    }

    /// Atomically replace the active pool.
    ///
    /// Only one pool is active at a time; calls already dispatched keep using
    /// the members they selected.
    pub fn swap_pool(&self, pool: Arc<BackendPool>) {
        let size = pool.balancer().len();
        *self.pool.write() = pool;
        tracing::info!(pool_size = size, "Swapped in rebuilt backend pool");
    }

    /// Send a prompt to the next healthy backend and wait for the full
    /// response text.
    ///
    /// On success the backend's meter records the elapsed time and an
    /// invocation record is persisted under the ambient [`CallContext`] (when
    /// one is bound). On failure the meter records a failure and the
    /// backend's error is returned unchanged.
    pub async fn invoke(&self, prompt: &str) -> Result<String, DispatchError> {
        let member = self.pool().next()?;
        let context = CallContext::current();
        let started_at = Utc::now();
        let start = Instant::now();

        match member.backend.invoke(prompt).await {
            Ok(text) => {
                let elapsed = start.elapsed();
                member.meter.record_success(elapsed);

                self.persist(build_record(
                    context,
                    CallKind::Invoke,
                    started_at,
                    elapsed,
                    &member,
                    prompt,
                    &text,
                ))
                .await;

                Ok(text)
            }
            Err(e) => {
                member.meter.record_failure();
                tracing::warn!(
                    backend = %member.backend.identity(),
                    error = %e,
                    "Backend invocation failed"
                );
                Err(DispatchError::Backend(e))
            }
        }
    }

    /// Begin a streaming call against the next healthy backend.
    ///
    /// An error starting the stream is recorded as a failure and returned
    /// unchanged. The returned [`DispatchStream`] performs all remaining
    /// bookkeeping as the consumer drains it.
    pub async fn stream(&self, prompt: &str) -> Result<DispatchStream, DispatchError> {
        let member = self.pool().next()?;
        let context = CallContext::current();
        let started_at = Utc::now();
        let start = Instant::now();

        match member.backend.stream(prompt).await {
            Ok(receiver) => Ok(DispatchStream {
                receiver,
                member,
                context,
                sink: self.sink.clone(),
                started_at,
                start,
                input_tokens: estimate_tokens(prompt),
                collected: String::new(),
                terminal: false,
            }),
            Err(e) => {
                member.meter.record_failure();
                tracing::warn!(
                    backend = %member.backend.identity(),
                    error = %e,
                    "Backend stream start failed"
                );
                Err(DispatchError::Backend(e))
            }
        }
    }

    /// Persist a record if context and sink allow; never fails the call
    async fn persist(&self, record: Option<InvocationRecord>) {
        let (Some(sink), Some(record)) = (self.sink.as_ref(), record) else {
            return;
        };
        if let Err(e) = sink.persist(record).await {
            tracing::warn!(error = %e, "Failed to persist invocation record");
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pool", &*self.pool.read())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

/// Build the record for a completed call, or `None` (with a diagnostic) when
/// no context is bound
fn build_record(
    context: Option<CallContext>,
    call_kind: CallKind,
    started_at: DateTime<Utc>,
    elapsed: Duration,
    member: &PoolMember,
    prompt: &str,
    output: &str,
) -> Option<InvocationRecord> {
    let Some(context) = context else {
        tracing::debug!("No call context bound; skipping invocation record");
        return None;
    };

    Some(InvocationRecord {
        caller_id: context.caller_id,
        hint: context.hint,
        correlation_id: context.correlation_id,
        session_id: context.session_id,
        parent_message_id: context.parent_message_id,
        purpose: context.purpose,
        call_kind,
        started_at,
        elapsed,
        backend_name: member.backend.identity().to_string(),
        input_tokens: estimate_tokens(prompt),
        output_tokens: estimate_tokens(output),
    })
}

// =============================================================================
// Dispatch Stream
// =============================================================================

/// Lazy, ordered, single-pass sequence of response fragments.
///
/// Not restartable. Dropping it before exhaustion abandons the call: no
/// success and no failure is recorded, and no invocation record is written.
pub struct DispatchStream {
    receiver: mpsc::Receiver<StreamFragment>,
    member: Arc<PoolMember>,
    context: Option<CallContext>,
    sink: Option<Arc<dyn RecordSink>>,
    started_at: DateTime<Utc>,
    start: Instant,
    input_tokens: u32,
    collected: String,
    terminal: bool,
}

impl DispatchStream {
    /// Identity of the backend serving this stream
    #[must_use]
    pub fn backend_name(&self) -> String {
        self.member.backend.identity().to_string()
    }

    /// Sequence exhausted: record one success and hand the record off
    fn complete(&mut self) {
        self.terminal = true;
        let elapsed = self.start.elapsed();
        self.member.meter.record_success(elapsed);

        let Some(context) = self.context.take() else {
            tracing::debug!("No call context bound; skipping invocation record");
            return;
        };
        let Some(sink) = self.sink.take() else {
            return;
        };

        let record = InvocationRecord {
            caller_id: context.caller_id,
            hint: context.hint,
            correlation_id: context.correlation_id,
            session_id: context.session_id,
            parent_message_id: context.parent_message_id,
            purpose: context.purpose,
            call_kind: CallKind::Stream,
            started_at: self.started_at,
            elapsed,
            backend_name: self.member.backend.identity().to_string(),
            input_tokens: self.input_tokens,
            output_tokens: estimate_tokens(&self.collected),
        };

        // The meter update above is immediate; the write itself must not
        // block the consumer's final poll.
        tokio::spawn(async move {
            if let Err(e) = sink.persist(record).await {
                tracing::warn!(error = %e, "Failed to persist invocation record");
            }
        });
    }

    /// Sequence failed mid-way: record one failure
    fn fail(&mut self, message: &str) {
        self.terminal = true;
        self.member.meter.record_failure();
        tracing::warn!(
            backend = %self.member.backend.identity(),
            error = message,
            "Backend stream failed mid-sequence"
        );
    }
}

impl Stream for DispatchStream {
    type Item = anyhow::Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.terminal {
            return Poll::Ready(None);
        }

        match this.receiver.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(StreamFragment::Text(text))) => {
                this.collected.push_str(&text);
                Poll::Ready(Some(Ok(text)))
            }
            Poll::Ready(Some(StreamFragment::Complete)) | Poll::Ready(None) => {
                this.complete();
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamFragment::Error(message))) => {
                this.fail(&message);
                Poll::Ready(Some(Err(anyhow::anyhow!(message))))
            }
        }
    }
}

impl std::fmt::Debug for DispatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchStream")
            .field("backend", &self.member.backend.identity())
            .field("terminal", &self.terminal)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendIdentity, LmBackend};
    use crate::context::Purpose;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    /// Backend answering every invoke with a fixed reply
    struct EchoBackend {
        identity: BackendIdentity,
    }

    #[async_trait]
    impl LmBackend for EchoBackend {
        fn identity(&self) -> &BackendIdentity {
            &self.identity
        }

        async fn invoke(&self, prompt: &str) -> anyhow::Result<String> {
            Ok(format!("echo: {prompt}"))
        }

        async fn stream(
            &self,
            _prompt: &str,
        ) -> anyhow::Result<mpsc::Receiver<StreamFragment>> {
            let (tx, rx) = mpsc::channel(4);
            tx.send(StreamFragment::Complete).await?;
            Ok(rx)
        }
    }

    /// Sink whose writes always fail
    struct FailingSink;

    #[async_trait]
    impl RecordSink for FailingSink {
        async fn persist(&self, _record: InvocationRecord) -> anyhow::Result<()> {
            anyhow::bail!("storage offline")
        }
    }

    fn echo_pool() -> Arc<BackendPool> {
        let member = PoolMember::new(Arc::new(EchoBackend {
            identity: BackendIdentity::new("echo", "v1"),
        }));
        Arc::new(BackendPool::from_members(vec![Arc::new(member)]))
    }

    #[tokio::test]
    async fn test_empty_pool_invoke_fails_distinctly() {
        let dispatcher = Dispatcher::new(Arc::new(BackendPool::from_members(vec![])));

        let err = dispatcher.invoke("hello").await.unwrap_err();
        assert!(matches!(err, DispatchError::NoBackendConfigured));
    }

    #[tokio::test]
    async fn test_persist_failure_does_not_fail_the_call() {
        let dispatcher = Dispatcher::new(echo_pool()).with_sink(Arc::new(FailingSink));

        let text = CallContext::new("user", Purpose::Test)
            .scope(dispatcher.invoke("hello"))
            .await
            .unwrap();

        assert_eq!(text, "echo: hello");
    }

    #[tokio::test]
    async fn test_swap_pool_replaces_active_pool() {
        let dispatcher = Dispatcher::new(Arc::new(BackendPool::from_members(vec![])));
        assert!(dispatcher.invoke("x").await.is_err());

        dispatcher.swap_pool(echo_pool());
        assert_eq!(dispatcher.invoke("x").await.unwrap(), "echo: x");
    }
}
