//! Execution state machine
//!
//! `pending -> in_progress -> {completed | failed | cancelled}`. A pending
//! execution may also fail (supervisor capture) or be cancelled before it
//! starts. No transition leaves a terminal state.

use crate::error::StateMachineError;
use crate::types::ExecutionStatus;

/// Validates a status transition.
///
/// A self-transition is not a transition and is rejected like any other
/// pair missing from the table.
pub fn validate_transition(
    from: ExecutionStatus,
    to: ExecutionStatus,
) -> Result<(), StateMachineError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

/// Statuses reachable in one step from `from`
#[must_use]
pub fn allowed_transitions(from: ExecutionStatus) -> Vec<ExecutionStatus> {
    use ExecutionStatus::{Cancelled, Completed, Failed, InProgress, Pending};
    match from {
        Pending => vec![InProgress, Failed, Cancelled],
        InProgress => vec![Completed, Failed, Cancelled],
        Completed | Failed | Cancelled => vec![],
    }
}

fn allowed(from: ExecutionStatus, to: ExecutionStatus) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}
