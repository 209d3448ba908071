//! The job manager: owns the registry of jobs, spawns one container per
//! start request, and transitions job state from a per-job reaper task.
//!
//! The registry mutex is only ever held across map lookups and pointer
//! updates; file I/O and process waits happen outside it.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nix::libc;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tracing::{info, instrument};

use crate::container::{network, Container, JobLimits, Runtime};
use crate::error::{Error, Result};
use crate::images::Store;
use crate::job::{parse_id, Job, JobInfo, JobStatus};
use crate::tail::TailReader;

/// The capability set the RPC layer needs from a manager. Kept as a trait
/// so service tests can substitute an implementation that does not require
/// a kernel.
#[async_trait]
pub trait JobManager: Send + Sync + 'static {
    async fn start(&self, command: String, args: Vec<String>) -> Result<JobInfo>;
    async fn stop(&self, id: &str) -> Result<JobInfo>;
    async fn status(&self, id: &str) -> Result<JobInfo>;
    async fn output(&self, id: &str) -> Result<TailReader>;
}

pub struct ManagerConfig {
    pub output_path: PathBuf,
    pub lib_path: PathBuf,
    pub run_path: PathBuf,
    pub tmp_path: PathBuf,
    /// Image every job container is built from, e.g. `alpine:latest`.
    pub image: String,
    pub limits: JobLimits,
}

pub struct Manager {
    jobs: Mutex<HashMap<crate::job::JobId, Arc<Job>>>,
    runtime: Arc<Runtime>,
    output_dir: PathBuf,
    image: String,
    limits: JobLimits,
}

impl Manager {
    /// Set up the on-disk roots, the image store, and the host bridge.
    pub async fn new(config: ManagerConfig) -> Result<Self> {
        config.limits.validate()?;
        fs::create_dir_all(&config.output_path).map_err(|err| {
            Error::io(
                format!("unable to create '{}'", config.output_path.display()),
                err,
            )
        })?;

        let store = Arc::new(Store::new(&config.lib_path, &config.tmp_path)?);
        let runtime = Arc::new(Runtime::new(
            config.lib_path,
            config.run_path,
            config.tmp_path,
            store,
        )?);
        network::ensure_bridge().await?;

        Ok(Self {
            jobs: Mutex::new(HashMap::new()),
            runtime,
            output_dir: config.output_path,
            image: config.image,
            limits: config.limits,
        })
    }

    /// Launch `command` in a fresh container and register the running job.
    /// The returned job is already observable through every other
    /// operation.
    #[instrument(skip(self))]
    pub async fn start_job(&self, command: String, args: Vec<String>) -> Result<Arc<Job>> {
        let id = xid::new();
        let job_dir = self.output_dir.join(id.to_string());
        fs::create_dir_all(&job_dir)
            .map_err(|err| {
                Error::io(format!("unable to create '{}'", job_dir.display()), err).launch()
            })?;
        let stdout = open_output(&job_dir.join("output")).map_err(Error::launch)?;
        let stderr = open_output(&job_dir.join("error")).map_err(Error::launch)?;

        let image = self
            .runtime
            .store()
            .get_image(&self.image)
            .await
            .map_err(Error::launch)?;
        let container = self
            .runtime
            .prepare(&image, &id.to_string())
            .await
            .map_err(Error::launch)?;
        let pid = match self
            .runtime
            .launch(&container, &command, &args, &self.limits, &stdout, &stderr)
        {
            Ok(pid) => pid,
            Err(err) => {
                self.runtime.cleanup(&container);
                return Err(err.launch());
            }
        };

        let job = Arc::new(Job::new(id, command, args, pid, job_dir.join("output")));
        self.jobs.lock().unwrap().insert(id, job.clone());
        info!(job = %id, pid = pid.as_raw(), "job started");

        self.spawn_reaper(job.clone(), container, stdout, stderr);
        Ok(job)
    }

    /// One task per job: wait for the child, record the terminal state,
    /// close the output files, then tear the container down. State is
    /// terminal before any cleanup starts.
    fn spawn_reaper(
        &self,
        job: Arc<Job>,
        container: Container,
        stdout: fs::File,
        stderr: fs::File,
    ) {
        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            let status = await_exit(job.pid()).await;
            info!(job = %job.id(), status = ?status, "job finished");
            job.set_terminal(status);
            drop(stdout);
            drop(stderr);
            runtime.cleanup(&container);
        });
    }

    /// SIGKILL the job's container and wait for the reaper to record the
    /// terminal state. Stopping an already-terminal job is idempotent and
    /// returns its current info.
    #[instrument(skip(self))]
    pub async fn stop_job(&self, id: &str) -> Result<JobInfo> {
        let job = self.get(id)?;
        if job.finished() {
            return Ok(job.info());
        }

        // ESRCH means the reaper beat us to it; the wait below settles it
        if let Err(err) = kill(job.pid(), Signal::SIGKILL) {
            if err != nix::errno::Errno::ESRCH {
                return Err(Error::syscall("kill", err));
            }
        }

        let mut done = job.subscribe();
        let _ = done.wait_for(|terminal| *terminal).await;
        Ok(job.info())
    }

    pub fn job_status(&self, id: &str) -> Result<JobInfo> {
        Ok(self.get(id)?.info())
    }

    /// An independent tail reader over the job's output file.
    pub async fn job_output(&self, id: &str) -> Result<TailReader> {
        let job = self.get(id)?;
        TailReader::open(job.output_path(), job.subscribe()).await
    }

    fn get(&self, id: &str) -> Result<Arc<Job>> {
        let parsed = parse_id(id)?;
        self.jobs
            .lock()
            .unwrap()
            .get(&parsed)
            .cloned()
            .ok_or_else(|| Error::NoSuchJob(id.to_string()))
    }
}

#[async_trait]
impl JobManager for Manager {
    async fn start(&self, command: String, args: Vec<String>) -> Result<JobInfo> {
        Ok(self.start_job(command, args).await?.info())
    }

    async fn stop(&self, id: &str) -> Result<JobInfo> {
        self.stop_job(id).await
    }

    async fn status(&self, id: &str) -> Result<JobInfo> {
        self.job_status(id)
    }

    async fn output(&self, id: &str) -> Result<TailReader> {
        self.job_output(id).await
    }
}

/// `O_CREATE|O_WRONLY|O_TRUNC|O_SYNC`, mode 0644, like the job output
/// contract requires.
fn open_output(path: &Path) -> Result<fs::File> {
    fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .custom_flags(libc::O_SYNC)
        .mode(0o644)
        .open(path)
        .map_err(|err| Error::io(format!("unable to create '{}'", path.display()), err))
}

/// Block (on the blocking pool) until the container child exits and map
/// the result onto the job state machine. Shared by the per-job reaper and
/// the server's one-shot `run` path.
pub async fn await_exit(pid: Pid) -> JobStatus {
    match tokio::task::spawn_blocking(move || waitpid(pid, None)).await {
        Ok(wait_result) => classify_exit(wait_result),
        Err(join_err) => JobStatus::Failed {
            exit: -1,
            msg: format!("unable to wait for job process: {join_err}"),
        },
    }
}

/// Map a child wait result onto the job state machine: zero exit is
/// `Finished`, nonzero is `Failed` with a synthetic message, a signal death
/// is `Stopped`, and a failed wait is `Failed` with the OS error.
fn classify_exit(wait: nix::Result<WaitStatus>) -> JobStatus {
    match wait {
        Ok(WaitStatus::Exited(_, 0)) => JobStatus::Finished,
        Ok(WaitStatus::Exited(_, code)) => JobStatus::Failed {
            exit: code,
            msg: format!("exited with status {code}"),
        },
        Ok(WaitStatus::Signaled(..)) => JobStatus::Stopped,
        Ok(other) => JobStatus::Failed {
            exit: -1,
            msg: format!("unexpected wait status: {other:?}"),
        },
        Err(errno) => JobStatus::Failed {
            exit: -1,
            msg: format!("unable to wait for job process: {errno}"),
        },
    }
}
