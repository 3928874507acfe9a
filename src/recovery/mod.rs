//! Recovery engine: action execution, health verification, snapshots, and
//! the orchestrator that sequences them.

pub mod executor;
pub mod health;
pub mod orchestrator;
pub mod result;
pub mod snapshot;

pub use executor::{ActionContext, ActionExecutor, ActionOutcome, parse_library_spec, scale_target};
pub use health::{CheckKind, HealthReport, HealthStatus, HealthVerifier};
pub use orchestrator::{Orchestrator, RecoveryRequest};
pub use result::{ActionAttempt, ActionStage, ExecutionResult, RecoveryOutcome};
pub use snapshot::{RecoverySnapshot, SNAPSHOTS_PER_RESOURCE, SnapshotStore};
