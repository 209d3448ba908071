use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Time-ordered job identifier, rendered as 20 base32 characters.
pub type JobId = xid::Id;

/// Parse a client-supplied job id, mapping malformed input to [`Error::InvalidId`].
pub fn parse_id(id: &str) -> Result<JobId> {
    id.parse::<JobId>()
        .map_err(|_| Error::InvalidId(id.to_string()))
}

/// The lifecycle state of a job. A job is `Running` from the moment its
/// container launches until the reaper observes the child exit, after which
/// it holds exactly one of the terminal variants forever.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    /// The child exited with status 0.
    Finished,
    /// The child exited nonzero, or the wait itself failed.
    Failed { exit: i32, msg: String },
    /// The child was killed by a signal.
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    /// Exit code recorded for the job. `-1` is the kernel's killed-by-signal
    /// sentinel; running jobs have no exit code yet.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            JobStatus::Running => None,
            JobStatus::Finished => Some(0),
            JobStatus::Failed { exit, .. } => Some(*exit),
            JobStatus::Stopped => Some(-1),
        }
    }

    pub fn error_msg(&self) -> Option<&str> {
        match self {
            JobStatus::Failed { msg, .. } => Some(msg),
            _ => None,
        }
    }
}

/// A point-in-time snapshot of a job, safe to hand across the RPC boundary.
#[derive(Clone, Debug)]
pub struct JobInfo {
    pub id: JobId,
    pub status: JobStatus,
    pub command: String,
    pub args: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

struct JobState {
    status: JobStatus,
    ended_at: Option<DateTime<Utc>>,
}

/// The lifecycle record of one user command.
///
/// Owned by the [`Manager`](crate::manager::Manager); mutated only by the
/// per-job reaper task or by an explicit stop. The watch channel flips to
/// `true` exactly once, when the job reaches a terminal state, and is what
/// tail readers block on.
pub struct Job {
    id: JobId,
    command: String,
    args: Vec<String>,
    started_at: DateTime<Utc>,
    pid: Pid,
    output_path: PathBuf,
    state: Mutex<JobState>,
    done: watch::Sender<bool>,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        command: String,
        args: Vec<String>,
        pid: Pid,
        output_path: PathBuf,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            id,
            command,
            args,
            started_at: Utc::now(),
            pid,
            output_path,
            state: Mutex::new(JobState {
                status: JobStatus::Running,
                ended_at: None,
            }),
            done,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub(crate) fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn finished(&self) -> bool {
        self.state.lock().unwrap().status.is_terminal()
    }

    pub fn info(&self) -> JobInfo {
        let state = self.state.lock().unwrap();
        JobInfo {
            id: self.id,
            status: state.status.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            started_at: self.started_at,
            ended_at: state.ended_at,
        }
    }

    /// Receiver that observes the transition to a terminal state.
    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    /// Record the terminal state. A job becomes terminal at most once; later
    /// calls are ignored so the first observation wins.
    pub(crate) fn set_terminal(&self, status: JobStatus) {
        debug_assert!(status.is_terminal());
        let mut state = self.state.lock().unwrap();
        if state.status.is_terminal() {
            return;
        }
        state.status = status;
        state.ended_at = Some(Utc::now());
        drop(state);
        let _ = self.done.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_round_trips_through_render() {
        let id = xid::new();
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 20);
        assert_eq!(parse_id(&rendered).expect("parse err"), id);
    }

    #[test]
    fn malformed_ids_are_rejected() {
        for bad in ["", "short", "!!!!!!!!!!!!!!!!!!!!", "c0123456789012345678901"] {
            assert!(matches!(parse_id(bad), Err(Error::InvalidId(_))));
        }
    }

    #[test]
    fn terminal_state_is_set_once() {
        let job = Job::new(
            xid::new(),
            "sleep".into(),
            vec!["5".into()],
            Pid::from_raw(1),
            PathBuf::from("/tmp/out"),
        );
        assert!(!job.finished());
        job.set_terminal(JobStatus::Stopped);
        job.set_terminal(JobStatus::Finished);
        let info = job.info();
        assert_eq!(info.status, JobStatus::Stopped);
        assert!(info.ended_at.expect("ended_at missing") >= info.started_at);
    }

    #[test]
    fn exit_codes_follow_status() {
        assert_eq!(JobStatus::Running.exit_code(), None);
        assert_eq!(JobStatus::Finished.exit_code(), Some(0));
        assert_eq!(JobStatus::Stopped.exit_code(), Some(-1));
        let failed = JobStatus::Failed {
            exit: 7,
            msg: "exited with status 7".into(),
        };
        assert_eq!(failed.exit_code(), Some(7));
        assert_eq!(failed.error_msg(), Some("exited with status 7"));
    }
}
