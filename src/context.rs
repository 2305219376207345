//! Ambient Call Context
//!
//! Call-scoped identity and metadata made available to the telemetry
//! recording step without being threaded through every signature between the
//! caller and the dispatcher.
//!
//! # Propagation Model
//!
//! The context is bound to one logical unit of work (e.g. one incoming chat
//! turn) by running that unit inside [`CallContext::scope`], which uses
//! `tokio::task_local!` scoping. Unlike raw thread-local storage, a scoped
//! task-local cannot leak across unrelated tasks when the runtime migrates
//! work between threads. Nested scopes replace the outer binding; there is no
//! explicit unbind.
//!
//! Dispatching with no context bound is not an error: the invocation record
//! is skipped and a diagnostic is emitted.
//!
//! # Usage
//!
//! ```ignore
//! let ctx = CallContext::new("user-7", Purpose::Chat)
//!     .with_session("session-42")
//!     .with_hint("follow-up question about quarterly numbers");
//!
//! CallContext::scope(ctx, async {
//!     dispatcher.invoke("...").await
//! }).await?;
//! ```

use std::future::Future;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum retained length of the free-text hint, in characters
pub const HINT_MAX_CHARS: usize = 100;

tokio::task_local! {
    static CALL_CONTEXT: CallContext;
}

// ============================================================================
// Purpose
// ============================================================================

/// Why a dispatch call was issued, for telemetry attribution
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    /// A conversational turn in a chat session
    Chat,
    /// An ad-hoc search issued by a user
    Search,
    /// A retrieval-time or other system-initiated call
    #[default]
    System,
    /// A test invocation
    Test,
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Chat => "chat",
            Self::Search => "search",
            Self::System => "system",
            Self::Test => "test",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Call Context
// ============================================================================

/// Ambient per-unit-of-work identity and metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallContext {
    /// Who issued the call
    pub caller_id: String,
    /// Fresh per-binding id correlating every dispatch in this unit of work
    pub correlation_id: Uuid,
    /// Conversation/session the call belongs to, if any
    pub session_id: Option<String>,
    /// Message this call is responding to, if any
    pub parent_message_id: Option<String>,
    /// Why the call was issued
    pub purpose: Purpose,
    /// Free-text hint, truncated to [`HINT_MAX_CHARS`]
    pub hint: Option<String>,
}

impl CallContext {
    /// Create a context with a fresh correlation id
    pub fn new(caller_id: impl Into<String>, purpose: Purpose) -> Self {
        Self {
            caller_id: caller_id.into(),
            correlation_id: Uuid::new_v4(),
            session_id: None,
            parent_message_id: None,
            purpose,
            hint: None,
        }
    }

    /// Attach a session id
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Attach a parent message id
    #[must_use]
    pub fn with_parent_message(mut self, parent_message_id: impl Into<String>) -> Self {
        self.parent_message_id = Some(parent_message_id.into());
        self
    }

    /// Attach a free-text hint, truncated to [`HINT_MAX_CHARS`] characters
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        let hint: String = hint.into();
        self.hint = Some(hint.chars().take(HINT_MAX_CHARS).collect());
        self
    }

    /// Run a future with this context bound as the ambient context.
    ///
    /// Every dispatch call made inside the future (on the same logical task)
    /// sees this context via [`CallContext::current`]. Rebinding inside the
    /// scope replaces, never merges.
    pub async fn scope<F>(self, future: F) -> F::Output
    where
        F: Future,
    {
        CALL_CONTEXT.scope(self, future).await
    }

    /// The currently bound context, or `None` outside any scope
    #[must_use]
    pub fn current() -> Option<Self> {
        CALL_CONTEXT.try_with(Clone::clone).ok()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_unbound_context_is_none() {
        assert_eq!(CallContext::current(), None);
    }

    #[tokio::test]
    async fn test_scope_binds_and_ends() {
        let ctx = CallContext::new("user-1", Purpose::Chat).with_session("s-1");

        let seen = ctx
            .clone()
            .scope(async { CallContext::current() })
            .await
            .unwrap();

        assert_eq!(seen.caller_id, "user-1");
        assert_eq!(seen.session_id, Some("s-1".to_string()));
        assert_eq!(seen.correlation_id, ctx.correlation_id);

        // Outside the scope the binding is gone
        assert_eq!(CallContext::current(), None);
    }

    #[tokio::test]
    async fn test_nested_scope_replaces_not_merges() {
        let outer = CallContext::new("outer", Purpose::Chat).with_session("s-outer");
        let inner = CallContext::new("inner", Purpose::Test);

        outer
            .scope(async {
                let seen = inner
                    .scope(async { CallContext::current().unwrap() })
                    .await;
                assert_eq!(seen.caller_id, "inner");
                // Replaced wholesale: the outer session id does not bleed in
                assert_eq!(seen.session_id, None);

                assert_eq!(CallContext::current().unwrap().caller_id, "outer");
            })
            .await;
    }

    #[tokio::test]
    async fn test_context_does_not_leak_to_spawned_tasks() {
        let ctx = CallContext::new("user-1", Purpose::Chat);

        ctx.scope(async {
            let handle = tokio::spawn(async { CallContext::current() });
            assert_eq!(handle.await.unwrap(), None);
        })
        .await;
    }

    #[test]
    fn test_hint_truncated_to_bound() {
        let long = "x".repeat(500);
        let ctx = CallContext::new("u", Purpose::Search).with_hint(long);
        assert_eq!(ctx.hint.unwrap().chars().count(), HINT_MAX_CHARS);
    }

    #[test]
    fn test_each_binding_gets_fresh_correlation_id() {
        let a = CallContext::new("u", Purpose::System);
        let b = CallContext::new("u", Purpose::System);
        assert_ne!(a.correlation_id, b.correlation_id);
    }
}
