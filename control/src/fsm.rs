//! Workspace lifecycle transition tables.
//!
//! The read phase of every reconcile re-checks these tables under a
//! transaction; services consult them before enqueueing so invalid
//! requests fail fast with `PreconditionFailed` instead of producing a
//! doomed task.

use crate::models::{TaskKind, WorkspaceStatus};

/// States a workspace must be in for `kind` to be accepted.
pub fn valid_from(kind: TaskKind) -> &'static [WorkspaceStatus] {
    use WorkspaceStatus::*;
    match kind {
        TaskKind::Create => &[PendingCreation],
        TaskKind::SetupHnc => &[ConfiguringHnc],
        TaskKind::Start => &[Stopped],
        TaskKind::Stop => &[Running],
        TaskKind::UpdatePlan => &[Running],
        TaskKind::UpdateNodes => &[Running],
        TaskKind::Upgrade => &[Running],
        TaskKind::Backup => &[Running],
        TaskKind::Restore => &[Running],
        // DELETE is accepted from any non-terminal state.
        TaskKind::Delete => &[
            PendingCreation,
            ConfiguringHnc,
            Running,
            UpdatingPlan,
            UpdatingNodes,
            Starting,
            Stopping,
            Stopped,
            Upgrading,
            BackingUp,
            Restoring,
            Error,
            Unknown,
        ],
        // Project/application kinds gate on the workspace serving traffic.
        TaskKind::ProjectCreate
        | TaskKind::ProjectDelete
        | TaskKind::AppDeploy
        | TaskKind::AppDelete
        | TaskKind::CronjobExecution
        | TaskKind::FunctionBuild => &[Running],
    }
}

/// Status the workspace shows while the task's external phase is running.
pub fn in_progress(kind: TaskKind) -> Option<WorkspaceStatus> {
    use WorkspaceStatus::*;
    match kind {
        TaskKind::Create => Some(PendingCreation),
        TaskKind::SetupHnc => Some(ConfiguringHnc),
        TaskKind::Start => Some(Starting),
        TaskKind::Stop => Some(Stopping),
        TaskKind::UpdatePlan => Some(UpdatingPlan),
        TaskKind::UpdateNodes => Some(UpdatingNodes),
        TaskKind::Upgrade => Some(Upgrading),
        TaskKind::Backup => Some(BackingUp),
        TaskKind::Restore => Some(Restoring),
        TaskKind::Delete => Some(Deleting),
        _ => None,
    }
}

/// Workspace status on successful completion. `None` means the row is
/// removed (successful DELETE leaves a tombstone-free store).
pub fn on_success(kind: TaskKind) -> Option<WorkspaceStatus> {
    use WorkspaceStatus::*;
    match kind {
        TaskKind::Create => Some(ConfiguringHnc),
        TaskKind::SetupHnc => Some(Running),
        TaskKind::Start => Some(Running),
        TaskKind::Stop => Some(Stopped),
        TaskKind::UpdatePlan => Some(Running),
        TaskKind::UpdateNodes => Some(Running),
        TaskKind::Upgrade => Some(Running),
        TaskKind::Backup => Some(Running),
        TaskKind::Restore => Some(Running),
        TaskKind::Delete => None,
        _ => None,
    }
}

/// Workspace status after the task exhausts retries. Backups are
/// non-fatal: the workspace stays serviceable.
pub fn on_failure(kind: TaskKind) -> WorkspaceStatus {
    match kind {
        TaskKind::Backup => WorkspaceStatus::Running,
        _ => WorkspaceStatus::Error,
    }
}

/// Stable status to restore when a task is cancelled before its first
/// external mutation.
pub fn stable_rollback(kind: TaskKind) -> Option<WorkspaceStatus> {
    use WorkspaceStatus::*;
    match kind {
        TaskKind::Create => Some(PendingCreation),
        TaskKind::SetupHnc => Some(ConfiguringHnc),
        TaskKind::Start => Some(Stopped),
        TaskKind::Stop => Some(Running),
        TaskKind::UpdatePlan
        | TaskKind::UpdateNodes
        | TaskKind::Upgrade
        | TaskKind::Backup
        | TaskKind::Restore => Some(Running),
        TaskKind::Delete => None,
        _ => None,
    }
}

/// Whether `kind` may be enqueued for a workspace currently in `status`.
/// From ERROR only the kind that failed (recovery) or DELETE is allowed.
pub fn may_enqueue(
    status: WorkspaceStatus,
    error_task_kind: Option<TaskKind>,
    kind: TaskKind,
) -> bool {
    if status == WorkspaceStatus::Error {
        return kind == TaskKind::Delete || Some(kind) == error_task_kind;
    }
    valid_from(kind).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskKind::*, WorkspaceStatus::*};

    #[test]
    fn transition_table_matches_lifecycle() {
        assert_eq!(valid_from(Create), &[PendingCreation]);
        assert_eq!(on_success(Create), Some(ConfiguringHnc));
        assert_eq!(on_success(SetupHnc), Some(Running));
        assert_eq!(on_success(Start), Some(Running));
        assert_eq!(on_success(Stop), Some(Stopped));
        assert_eq!(on_success(Delete), None);
        assert_eq!(on_failure(Backup), Running);
        assert_eq!(on_failure(Upgrade), Error);
    }

    #[test]
    fn delete_is_valid_from_every_non_terminal_state() {
        for status in crate::models::WorkspaceStatus::ALL {
            if *status == Deleting {
                continue;
            }
            assert!(
                valid_from(Delete).contains(status),
                "DELETE should be accepted from {status}"
            );
        }
    }

    #[test]
    fn invalid_from_state_is_rejected() {
        assert!(!valid_from(Start).contains(&Running));
        assert!(!valid_from(Stop).contains(&Stopped));
        assert!(!valid_from(Upgrade).contains(&Stopped));
        assert!(!valid_from(ProjectCreate).contains(&Stopped));
    }

    #[test]
    fn error_state_admits_only_recovery_or_delete() {
        assert!(may_enqueue(Error, Some(Upgrade), Upgrade));
        assert!(may_enqueue(Error, Some(Upgrade), Delete));
        assert!(!may_enqueue(Error, Some(Upgrade), Stop));
        assert!(!may_enqueue(Error, None, Backup));
    }

    #[test]
    fn every_workspace_kind_has_consistent_rollback() {
        // The pre-mutation rollback state must be one of the states the
        // kind is accepted from, so a cancelled task never strands the
        // workspace somewhere the same request could not reach again.
        for kind in [
            Create, SetupHnc, Start, Stop, UpdatePlan, UpdateNodes, Upgrade, Backup, Restore,
        ] {
            let rollback = stable_rollback(kind).unwrap();
            assert!(
                valid_from(kind).contains(&rollback),
                "{kind}: rollback {rollback} not in valid_from"
            );
        }
    }

    #[test]
    fn in_progress_states_cover_all_workspace_kinds() {
        for kind in [
            Create, SetupHnc, Start, Stop, UpdatePlan, UpdateNodes, Upgrade, Backup, Restore,
            Delete,
        ] {
            assert!(in_progress(kind).is_some(), "{kind}");
        }
        assert!(in_progress(AppDeploy).is_none());
    }
}
