//! Invocation Telemetry
//!
//! The durable per-call record written after a completed call, the sink
//! boundary it is written through, and the token estimation used for its
//! input/output counts.
//!
//! Telemetry is a best-effort side channel: persistence failures are logged
//! and swallowed, and never change whether the call itself appears to succeed
//! or fail. Records are written once per completed call, immediately, with no
//! batching; the storage schema belongs to whatever implements [`RecordSink`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::context::Purpose;

// ============================================================================
// Call Kind
// ============================================================================

/// Whether a call was single-shot or streaming
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    /// `invoke`: one prompt, one complete response
    Invoke,
    /// `stream`: one prompt, a drained fragment sequence
    Stream,
}

// ============================================================================
// Invocation Record
// ============================================================================

/// Immutable telemetry row for one completed call.
///
/// Created once per successful call, never updated.
#[derive(Clone, Debug, Serialize)]
pub struct InvocationRecord {
    /// Who issued the call
    pub caller_id: String,
    /// Free-text hint from the call context, if any
    pub hint: Option<String>,
    /// Correlation id of the unit of work
    pub correlation_id: Uuid,
    /// Session the call belonged to, if any
    pub session_id: Option<String>,
    /// Message the call responded to, if any
    pub parent_message_id: Option<String>,
    /// Why the call was issued
    pub purpose: Purpose,
    /// Single-shot or streaming
    pub call_kind: CallKind,
    /// Wall-clock start of the call
    pub started_at: DateTime<Utc>,
    /// Time from dispatch to completion
    pub elapsed: Duration,
    /// Identity of the backend that served the call
    pub backend_name: String,
    /// Estimated token count of the prompt
    pub input_tokens: u32,
    /// Estimated token count of the full response text
    pub output_tokens: u32,
}

// ============================================================================
// Record Sink
// ============================================================================

/// Durable storage boundary for invocation records.
///
/// Implementations own the schema. The dispatcher persists synchronously with
/// respect to call completion and treats errors as log-and-swallow.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Persist one record
    async fn persist(&self, record: InvocationRecord) -> anyhow::Result<()>;
}

/// In-process sink retaining records in memory.
///
/// Used by tests and by embedders that aggregate records themselves.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<InvocationRecord>>,
}

impl MemorySink {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything persisted so far
    #[must_use]
    pub fn records(&self) -> Vec<InvocationRecord> {
        self.records.lock().clone()
    }

    /// Number of records persisted so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing has been persisted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn persist(&self, record: InvocationRecord) -> anyhow::Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

// ============================================================================
// Token Estimation
// ============================================================================

/// Estimate the token count of a text.
///
/// Coarse heuristic (~4 characters per token) adequate for accounting; exact
/// counts would require the backend's own tokenizer.
#[must_use]
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    chars.div_ceil(4) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[tokio::test]
    async fn test_memory_sink_retains_records() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());

        sink.persist(InvocationRecord {
            caller_id: "u".to_string(),
            hint: None,
            correlation_id: Uuid::new_v4(),
            session_id: None,
            parent_message_id: None,
            purpose: Purpose::Test,
            call_kind: CallKind::Invoke,
            started_at: Utc::now(),
            elapsed: Duration::from_millis(5),
            backend_name: "glm4".to_string(),
            input_tokens: 3,
            output_tokens: 7,
        })
        .await
        .unwrap();

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.records()[0].backend_name, "glm4");
    }
}
