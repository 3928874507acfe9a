//! Structured audit events emitted during orchestration.
//!
//! The engine never persists these; an [`AuditSink`] hands them to whatever
//! stores them. [`TracingAuditSink`] writes them to the `audit` log target.

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::playbook::RecoveryAction;
use crate::recovery::ActionStage;

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditKind {
    /// Breaker refused the attempt
    CircuitBlocked {
        /// Breaker key
        circuit_key: String,
        /// Breaker reason
        reason: String,
        /// Seconds until the breaker admits a trial
        retry_after_secs: Option<u64>,
    },
    /// Action about to run
    ActionAttempted {
        /// Primary or fallback
        stage: ActionStage,
        /// Action id
        action: RecoveryAction,
    },
    /// Action (and verification) succeeded
    ActionSucceeded {
        /// Primary or fallback
        stage: ActionStage,
        /// Action id
        action: RecoveryAction,
        /// Executor message
        message: String,
        /// Duration including verification
        duration_ms: u64,
    },
    /// Action or its verification failed
    ActionFailed {
        /// Primary or fallback
        stage: ActionStage,
        /// Action id
        action: RecoveryAction,
        /// Failure reason
        message: String,
        /// Duration including verification
        duration_ms: u64,
    },
    /// Fallback chosen after the primary failed
    FallbackUsed {
        /// Fallback as configured (action id or classification)
        target: String,
    },
    /// Chained classification started
    ChainTriggered {
        /// Classification being orchestrated next
        chained: String,
        /// Chain steps left after this one
        depth_remaining: u32,
    },
}

impl AuditKind {
    /// Event name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CircuitBlocked { .. } => "circuit_blocked",
            Self::ActionAttempted { .. } => "action_attempted",
            Self::ActionSucceeded { .. } => "action_succeeded",
            Self::ActionFailed { .. } => "action_failed",
            Self::FallbackUsed { .. } => "fallback_used",
            Self::ChainTriggered { .. } => "chain_triggered",
        }
    }
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    /// Orchestration call the event belongs to
    pub execution_id: Uuid,
    /// Classification being recovered
    pub classification: String,
    /// Emission time
    pub at: DateTime<Utc>,
    /// Event payload
    #[serde(flatten)]
    pub kind: AuditKind,
}

impl AuditEvent {
    /// Event stamped with the current time
    #[must_use]
    pub fn now(execution_id: Uuid, classification: &str, kind: AuditKind) -> Self {
        Self {
            execution_id,
            classification: classification.to_string(),
            at: Utc::now(),
            kind,
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.kind.name(), self.execution_id, self.classification)
    }
}

/// Receiver of audit events. Must not block.
pub trait AuditSink: Send + Sync {
    /// Accept one event
    fn emit(&self, event: AuditEvent);
}

/// Writes events as structured log lines on the `audit` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        info!(
            target: "audit",
            event = event.kind.name(),
            execution_id = %event.execution_id,
            classification = %event.classification,
            payload = %payload,
            "audit"
        );
    }
}

/// Keeps events in memory; used by tests and the CLI `recover` command
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event so far
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Event names in emission order
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.kind.name()).collect()
    }

    /// Drop recorded events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}
