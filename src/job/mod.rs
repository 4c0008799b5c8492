mod record;
mod state;

pub use record::{
    FailureKind, Job, JobId, JobOptions, JobOutcome, JobStatus, Segment, Transcript, WorkItem,
};
pub use state::{InvalidTransition, StateMachine, StatusPatch};
