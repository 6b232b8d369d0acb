//! CloudFormation Status Mapping
//!
//! Folds the provider's stack statuses into the three protocol states.

use super::types::OperationState;

/// Status reported once a stack deletion has finished
pub const DELETE_COMPLETE: &str = "DELETE_COMPLETE";

/// Coarse classification of a raw CloudFormation stack status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackPhase {
    /// `*_IN_PROGRESS`, including rollbacks and cleanups still running
    InProgress,
    /// `*_COMPLETE` without a rollback
    Complete,
    /// `*_FAILED`
    Failed,
    /// `*ROLLBACK_COMPLETE`: the requested change was undone
    RolledBack,
    /// Anything else
    Unknown,
}

impl StackPhase {
    pub fn parse(status: &str) -> Self {
        if status.ends_with("_IN_PROGRESS") {
            StackPhase::InProgress
        } else if status.ends_with("_FAILED") {
            StackPhase::Failed
        } else if status.ends_with("ROLLBACK_COMPLETE") {
            StackPhase::RolledBack
        } else if status.ends_with("_COMPLETE") {
            StackPhase::Complete
        } else {
            StackPhase::Unknown
        }
    }

    /// Protocol state for this phase. Unknown statuses are reported as in
    /// progress so the platform keeps polling.
    pub fn operation_state(self) -> OperationState {
        match self {
            StackPhase::InProgress | StackPhase::Unknown => OperationState::InProgress,
            StackPhase::Failed | StackPhase::RolledBack => OperationState::Failed,
            StackPhase::Complete => OperationState::Succeeded,
        }
    }
}
