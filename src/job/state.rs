use chrono::{DateTime, Utc};
use thiserror::Error;

use super::record::{Job, JobOutcome, JobStatus};

/// Changes applied to a job together with a status transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPatch {
    pub outcome: Option<JobOutcome>,
    pub warning: Option<String>,
}

impl StatusPatch {
    pub fn outcome(outcome: JobOutcome) -> Self {
        Self {
            outcome: Some(outcome),
            warning: None,
        }
    }

    pub fn warning(warning: impl Into<String>) -> Self {
        Self {
            outcome: None,
            warning: Some(warning.into()),
        }
    }
}

/// A transition that would move a job backwards or out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// The job status lattice.
///
/// Only forward moves are legal:
/// `Queued → Processing`, `Queued → Cancelled`, `Processing → {Succeeded,
/// Failed, Cancelled}`. `Processing → Processing` is accepted as an
/// annotation that changes no status (used for soft-timeout warnings).
pub struct StateMachine;

impl StateMachine {
    pub fn allows(from: JobStatus, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (from, to),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Processing)
                | (Processing, Succeeded)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }

    /// Move `job` to `to`, stamping timestamps and applying `patch`.
    pub fn apply(
        job: &mut Job,
        to: JobStatus,
        patch: StatusPatch,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        let from = job.status;
        if !Self::allows(from, to) {
            return Err(InvalidTransition { from, to });
        }

        if from == JobStatus::Queued && to == JobStatus::Processing {
            job.started_at = Some(now);
        }
        if to.is_terminal() {
            job.finished_at = Some(now);
        }
        if let Some(outcome) = patch.outcome {
            job.outcome = Some(outcome);
        }
        if let Some(warning) = patch.warning {
            job.warning = Some(warning);
        }
        job.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactRef;
    use crate::job::{FailureKind, JobId, JobOptions};
    use chrono::Duration;

    fn make_job() -> Job {
        Job::new(
            JobId::new(),
            ArtifactRef::new("/tmp/x.mp3"),
            String::new(),
            0,
            JobOptions::default(),
            Duration::hours(1),
        )
    }

    #[test]
    fn happy_path_walks_forward() {
        let mut job = make_job();
        let now = Utc::now();

        StateMachine::apply(&mut job, JobStatus::Processing, StatusPatch::default(), now).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.started_at, Some(now));

        let outcome = JobOutcome::Failure(FailureKind::Engine("bad audio".into()));
        StateMachine::apply(&mut job, JobStatus::Failed, StatusPatch::outcome(outcome.clone()), now)
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.finished_at, Some(now));
        assert_eq!(job.outcome, Some(outcome));
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [JobStatus::Succeeded, JobStatus::Failed, JobStatus::Cancelled] {
            for next in JobStatus::ALL {
                assert!(
                    !StateMachine::allows(terminal, next),
                    "{terminal} -> {next} must be rejected"
                );
            }
        }
    }

    #[test]
    fn no_backwards_moves() {
        assert!(!StateMachine::allows(JobStatus::Processing, JobStatus::Queued));
        assert!(!StateMachine::allows(JobStatus::Queued, JobStatus::Queued));
        assert!(!StateMachine::allows(JobStatus::Queued, JobStatus::Succeeded));
        assert!(!StateMachine::allows(JobStatus::Queued, JobStatus::Failed));
    }

    #[test]
    fn queued_job_can_be_cancelled_directly() {
        let mut job = make_job();
        StateMachine::apply(&mut job, JobStatus::Cancelled, StatusPatch::default(), Utc::now())
            .unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn rejected_transition_leaves_job_untouched() {
        let mut job = make_job();
        let err = StateMachine::apply(&mut job, JobStatus::Succeeded, StatusPatch::default(), Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            InvalidTransition {
                from: JobStatus::Queued,
                to: JobStatus::Succeeded
            }
        );
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.finished_at.is_none());
    }

    #[test]
    fn processing_annotation_keeps_status() {
        let mut job = make_job();
        let now = Utc::now();
        StateMachine::apply(&mut job, JobStatus::Processing, StatusPatch::default(), now).unwrap();
        StateMachine::apply(
            &mut job,
            JobStatus::Processing,
            StatusPatch::warning("still running"),
            now,
        )
        .unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.warning.as_deref(), Some("still running"));
        assert_eq!(job.started_at, Some(now));
    }
}
