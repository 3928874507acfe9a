//! Structured outcome of one orchestration call

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::snapshot::RecoverySnapshot;
use crate::failsafe::CircuitStatus;
use crate::playbook::RecoveryAction;

/// Why an orchestration call ended the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Action (and health check, when required) succeeded
    Recovered,
    /// No playbook for the classification
    NoPlaybook,
    /// Circuit breaker refused the attempt
    CircuitOpen,
    /// Remote action failed or timed out
    ActionFailed,
    /// Action reported success but the resource did not verify healthy
    VerificationFailed,
    /// Playbook references an action that is not implemented
    UnsupportedAction,
    /// Caller cancelled or the request deadline passed
    Cancelled,
}

impl RecoveryOutcome {
    /// Whether the outcome counts against the circuit breaker
    #[must_use]
    pub fn counts_as_failure(self) -> bool {
        matches!(
            self,
            Self::ActionFailed | Self::VerificationFailed | Self::Cancelled
        )
    }
}

/// Which step of the orchestration an action belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStage {
    /// Playbook's primary action
    Primary,
    /// Fallback after the primary failed
    Fallback,
}

/// One action attempted during orchestration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionAttempt {
    /// Step this action ran in
    pub stage: ActionStage,
    /// Action identifier
    pub action: RecoveryAction,
    /// Action call succeeded
    pub success: bool,
    /// Health verification result, when one ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
    /// Executor or verifier message
    pub message: String,
    /// Wall time of action plus verification
    pub duration_ms: u64,
}

/// Result of one orchestration call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Correlation id for logs and audit events
    pub execution_id: Uuid,
    /// Classification that was orchestrated
    pub classification: String,
    /// Overall success
    pub success: bool,
    /// Outcome category
    pub outcome: RecoveryOutcome,
    /// Human-readable explanation
    pub message: String,
    /// Actions in the order they ran
    pub actions: Vec<ActionAttempt>,
    /// Health check of the final action passed
    pub health_check_passed: bool,
    /// Breaker state after the outcome was recorded
    pub circuit_breaker: Option<CircuitStatus>,
    /// Total wall time, including any chained orchestration
    pub elapsed_ms: u64,
    /// Fallback action ran
    pub fallback_used: bool,
    /// Chained classification ran
    pub chain_triggered: bool,
    /// Result of the chained orchestration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<Box<ExecutionResult>>,
    /// Configuration captured before acting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<RecoverySnapshot>,
    /// Identifiers produced by actions (`new_run_id`, `target_workers`, ...)
    pub metadata: Map<String, Value>,
}

impl ExecutionResult {
    pub(crate) fn new(classification: &str) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            classification: classification.to_string(),
            success: false,
            outcome: RecoveryOutcome::ActionFailed,
            message: String::new(),
            actions: Vec::new(),
            health_check_passed: false,
            circuit_breaker: None,
            elapsed_ms: 0,
            fallback_used: false,
            chain_triggered: false,
            chain: None,
            snapshot: None,
            metadata: Map::new(),
        }
    }

    pub(crate) fn finish(mut self, outcome: RecoveryOutcome, message: impl Into<String>) -> Self {
        self.outcome = outcome;
        self.success = outcome == RecoveryOutcome::Recovered;
        self.message = message.into();
        self
    }

    /// Actions that ran in `stage`
    pub fn actions_in(&self, stage: ActionStage) -> impl Iterator<Item = &ActionAttempt> {
        self.actions.iter().filter(move |a| a.stage == stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_sets_success_only_for_recovered() {
        let ok = ExecutionResult::new("A").finish(RecoveryOutcome::Recovered, "done");
        assert!(ok.success);
        let blocked = ExecutionResult::new("A").finish(RecoveryOutcome::CircuitOpen, "blocked");
        assert!(!blocked.success);
        assert_eq!(blocked.message, "blocked");
    }

    #[test]
    fn breaker_relevant_outcomes() {
        assert!(RecoveryOutcome::ActionFailed.counts_as_failure());
        assert!(RecoveryOutcome::VerificationFailed.counts_as_failure());
        assert!(RecoveryOutcome::Cancelled.counts_as_failure());
        assert!(!RecoveryOutcome::NoPlaybook.counts_as_failure());
        assert!(!RecoveryOutcome::CircuitOpen.counts_as_failure());
        assert!(!RecoveryOutcome::UnsupportedAction.counts_as_failure());
    }

    #[test]
    fn serializes_without_empty_chain() {
        let result = ExecutionResult::new("A").finish(RecoveryOutcome::NoPlaybook, "none");
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["outcome"], "no_playbook");
        assert!(v.get("chain").is_none());
        assert!(v.get("snapshot").is_none());
    }
}
