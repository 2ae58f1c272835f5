use rollback_core::state_machine::{allowed_transitions, validate_transition};
use rollback_core::ExecutionStatus;
use proptest::prelude::*;

fn any_status() -> impl Strategy<Value = ExecutionStatus> {
    prop_oneof![
        Just(ExecutionStatus::Pending),
        Just(ExecutionStatus::InProgress),
        Just(ExecutionStatus::Completed),
        Just(ExecutionStatus::Failed),
        Just(ExecutionStatus::Cancelled),
    ]
}

#[test]
fn test_pending_transitions() {
    assert!(validate_transition(ExecutionStatus::Pending, ExecutionStatus::InProgress).is_ok());
    assert!(validate_transition(ExecutionStatus::Pending, ExecutionStatus::Cancelled).is_ok());
    assert!(validate_transition(ExecutionStatus::Pending, ExecutionStatus::Failed).is_ok());

    assert!(validate_transition(ExecutionStatus::Pending, ExecutionStatus::Completed).is_err());
}

#[test]
fn test_in_progress_transitions() {
    for to in [
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::Cancelled,
    ] {
        assert!(validate_transition(ExecutionStatus::InProgress, to).is_ok());
    }
    assert!(validate_transition(ExecutionStatus::InProgress, ExecutionStatus::Pending).is_err());
}

proptest! {
    #[test]
    fn prop_transitions_match_allowed_table(from in any_status(), to in any_status()) {
        let res = validate_transition(from, to);
        let allowed = allowed_transitions(from);

        if res.is_ok() {
            prop_assert!(allowed.contains(&to));
        } else {
            prop_assert!(!allowed.contains(&to));
        }
    }

    #[test]
    fn prop_terminal_states_never_leave(from in any_status(), to in any_status()) {
        if from.is_terminal() {
            prop_assert!(validate_transition(from, to).is_err());
        }
    }

    #[test]
    fn prop_walks_end_in_terminal_or_stall(path in prop::collection::vec(any_status(), 1..12)) {
        let mut current = ExecutionStatus::Pending;
        for next in path {
            if validate_transition(current, next).is_ok() {
                prop_assert!(!current.is_terminal());
                current = next;
            }
        }
        if current.is_terminal() {
            prop_assert!(allowed_transitions(current).is_empty());
        }
    }
}
