//! The RPC surface: validate, authorize, delegate to the manager, map the
//! result onto the wire.
//!
//! Scope rules: `start` needs no scope and records the caller as the job's
//! owner; `stop`/`status`/`output` require either `Super` or ownership.
//! Own-scoped callers asking about someone else's job get `NotFound`, never
//! `PermissionDenied`, so job ids don't leak existence.

pub mod authz;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use joblib::{JobInfo, JobManager};
use protobuf::workernator_server::Workernator;
use protobuf::{
    Job, JobStartRequest, JobStatusRequest, JobStopRequest, OutputJobRequest, OutputJobResponse,
};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Code, Request, Response, Status};
use tracing::{error, info, warn};

use self::authz::{Acl, Method, Permission};
use crate::interceptors::cert::UserExtension;

/// Buffered chunks between the pump task and the wire.
const OUTPUT_CHANNEL_DEPTH: usize = 16;

pub struct WorkernatorService<M> {
    manager: M,
    acl: Acl,
    /// `username → set<JobID>`: append-only owner index backing Own-scope
    /// checks.
    user_jobs: Mutex<HashMap<String, HashSet<String>>>,
}

struct Grant {
    username: String,
    permission: Permission,
}

impl<M: JobManager> WorkernatorService<M> {
    pub fn new(manager: M, acl: Acl) -> Self {
        Self {
            manager,
            acl,
            user_jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Per-method authorization: the interceptor already verified the user
    /// exists; here their level for this method must be above `None`.
    fn authorize<T>(&self, req: &Request<T>, method: Method) -> Result<Grant, Status> {
        let ext = req
            .extensions()
            .get::<UserExtension>()
            .ok_or_else(|| Status::unauthenticated("request missing identity"))?;
        match self.acl.permission(&ext.username, method) {
            Permission::None => {
                warn!(user = %ext.username, %method, "user does not have permission to use rpc method");
                Err(Status::unauthenticated(format!(
                    "user cannot call '{method}'"
                )))
            }
            permission => Ok(Grant {
                username: ext.username.clone(),
                permission,
            }),
        }
    }

    fn check_scope(&self, grant: &Grant, id: &str) -> Result<(), Status> {
        if grant.permission == Permission::Super {
            return Ok(());
        }
        let owned = self
            .user_jobs
            .lock()
            .unwrap()
            .get(&grant.username)
            .map(|jobs| jobs.contains(id))
            .unwrap_or(false);
        if owned {
            Ok(())
        } else {
            // deliberately indistinguishable from a job that doesn't exist
            Err(Status::not_found(format!("no job found for id '{id}'")))
        }
    }

    fn record_owner(&self, username: &str, id: &str) {
        self.user_jobs
            .lock()
            .unwrap()
            .entry(username.to_string())
            .or_default()
            .insert(id.to_string());
    }
}

#[tonic::async_trait]
impl<M: JobManager> Workernator for WorkernatorService<M> {
    type OutputStream = ReceiverStream<Result<OutputJobResponse, Status>>;

    async fn start(&self, req: Request<JobStartRequest>) -> Result<Response<Job>, Status> {
        let grant = self.authorize(&req, Method::Start)?;
        let JobStartRequest { command, arguments } = req.into_inner();

        let result = guarded(async {
            self.manager
                .start(command, arguments)
                .await
                .map_err(to_status)
        })
        .await;

        match result {
            Ok(job) => {
                self.record_owner(&grant.username, &job.id.to_string());
                info!(user = %grant.username, job = %job.id, "job started");
                Ok(Response::new(job_to_proto(&job)))
            }
            Err(status) => {
                log_status(Method::Start, &status);
                Err(status)
            }
        }
    }

    async fn stop(&self, req: Request<JobStopRequest>) -> Result<Response<Job>, Status> {
        let grant = self.authorize(&req, Method::Stop)?;
        let id = req.into_inner().id;
        validate_id(&id)?;
        self.check_scope(&grant, &id)?;

        let result = guarded(async { self.manager.stop(&id).await.map_err(to_status) }).await;
        match result {
            Ok(job) => {
                info!(user = %grant.username, job = %id, "job stopped");
                Ok(Response::new(job_to_proto(&job)))
            }
            Err(status) => {
                log_status(Method::Stop, &status);
                Err(status)
            }
        }
    }

    async fn status(&self, req: Request<JobStatusRequest>) -> Result<Response<Job>, Status> {
        let grant = self.authorize(&req, Method::Status)?;
        let id = req.into_inner().id;
        validate_id(&id)?;
        self.check_scope(&grant, &id)?;

        let result = guarded(async { self.manager.status(&id).await.map_err(to_status) }).await;
        match result {
            Ok(job) => Ok(Response::new(job_to_proto(&job))),
            Err(status) => {
                log_status(Method::Status, &status);
                Err(status)
            }
        }
    }

    async fn output(
        &self,
        req: Request<OutputJobRequest>,
    ) -> Result<Response<Self::OutputStream>, Status> {
        let grant = self.authorize(&req, Method::Output)?;
        let id = req.into_inner().id;
        validate_id(&id)?;
        self.check_scope(&grant, &id)?;

        let reader = guarded(async { self.manager.output(&id).await.map_err(to_status) }).await;
        let mut reader = match reader {
            Ok(reader) => reader,
            Err(status) => {
                log_status(Method::Output, &status);
                return Err(status);
            }
        };

        info!(user = %grant.username, job = %id, "streaming job output");
        let (tx, rx) = tokio::sync::mpsc::channel(OUTPUT_CHANNEL_DEPTH);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    chunk = reader.next_chunk() => match chunk {
                        Some(Ok(data)) => {
                            let response = OutputJobResponse { data: data.to_vec() };
                            if tx.send(Ok(response)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            let status =
                                Status::internal(format!("unable to read job output: {err}"));
                            let _ = tx.send(Err(status)).await;
                            break;
                        }
                        None => break,
                    },
                    // client cancelled or disconnected: drop the reader so
                    // its idle poll doesn't outlive the stream
                    _ = tx.closed() => break,
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Convert a handler future's panic into `Internal` instead of tearing down
/// the connection.
async fn guarded<T>(fut: impl Future<Output = Result<T, Status>>) -> Result<T, Status> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            error!("caught panic during call");
            Err(Status::internal("panic during call"))
        }
    }
}

fn validate_id(id: &str) -> Result<(), Status> {
    joblib::job::parse_id(id).map(|_| ()).map_err(to_status)
}

fn to_status(err: joblib::Error) -> Status {
    match &err {
        joblib::Error::InvalidId(_) => Status::invalid_argument(err.to_string()),
        joblib::Error::NoSuchJob(_) => Status::not_found(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

/// Log rejected calls at a level matching who caused them: client mistakes
/// are warnings, server-side failures are errors.
fn log_status(method: Method, status: &Status) {
    match status.code() {
        Code::InvalidArgument
        | Code::PermissionDenied
        | Code::Unauthenticated
        | Code::FailedPrecondition
        | Code::OutOfRange
        | Code::Aborted
        | Code::Cancelled => {
            warn!(%method, code = ?status.code(), msg = %status.message(), "rpc rejected")
        }
        _ => error!(%method, code = ?status.code(), msg = %status.message(), "rpc failed"),
    }
}

pub fn job_to_proto(info: &JobInfo) -> Job {
    let status = match info.status {
        joblib::JobStatus::Running => protobuf::JobStatus::Running,
        joblib::JobStatus::Failed { .. } => protobuf::JobStatus::Failed,
        joblib::JobStatus::Finished => protobuf::JobStatus::Finished,
        joblib::JobStatus::Stopped => protobuf::JobStatus::Stopped,
    };
    Job {
        id: info.id.to_string(),
        status: status as i32,
        command: info.command.clone(),
        args: info.args.clone(),
        error_msg: info.status.error_msg().unwrap_or_default().to_string(),
        started_at: Some(to_timestamp(info.started_at)),
        ended_at: info.ended_at.map(to_timestamp),
    }
}

fn to_timestamp(at: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use joblib::{Error as JobError, JobStatus, TailReader};
    use std::io::Write;
    use tokio::sync::watch;
    use tokio_stream::StreamExt;

    /// Kernel-free manager: jobs are plain records, output is a fixed file.
    struct MockManager {
        jobs: Mutex<HashMap<String, JobInfo>>,
        output_dir: tempfile::TempDir,
    }

    impl MockManager {
        fn new() -> Self {
            Self {
                jobs: Mutex::new(HashMap::new()),
                output_dir: tempfile::tempdir().expect("tempdir"),
            }
        }

        fn lookup(&self, id: &str) -> joblib::Result<JobInfo> {
            joblib::job::parse_id(id)?;
            self.jobs
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| JobError::NoSuchJob(id.to_string()))
        }
    }

    #[async_trait]
    impl JobManager for MockManager {
        async fn start(&self, command: String, args: Vec<String>) -> joblib::Result<JobInfo> {
            let info = JobInfo {
                id: xid::new(),
                status: JobStatus::Running,
                command,
                args,
                started_at: Utc::now(),
                ended_at: None,
            };
            self.jobs
                .lock()
                .unwrap()
                .insert(info.id.to_string(), info.clone());
            Ok(info)
        }

        async fn stop(&self, id: &str) -> joblib::Result<JobInfo> {
            let mut info = self.lookup(id)?;
            if !info.status.is_terminal() {
                info.status = JobStatus::Stopped;
                info.ended_at = Some(Utc::now());
                self.jobs
                    .lock()
                    .unwrap()
                    .insert(id.to_string(), info.clone());
            }
            Ok(info)
        }

        async fn status(&self, id: &str) -> joblib::Result<JobInfo> {
            self.lookup(id)
        }

        async fn output(&self, id: &str) -> joblib::Result<TailReader> {
            self.lookup(id)?;
            let path = self.output_dir.path().join(id);
            let mut file = std::fs::File::create(&path).expect("create output");
            file.write_all(b"hello\n").expect("write output");
            let (_terminal, rx) = watch::channel(true);
            TailReader::open(&path, rx).await
        }
    }

    fn acl_json(json: &str) -> Acl {
        serde_json::from_str(json).expect("acl fixture")
    }

    fn service(acl: &str) -> WorkernatorService<MockManager> {
        WorkernatorService::new(MockManager::new(), acl_json(acl))
    }

    fn request_as<T>(username: &str, message: T) -> Request<T> {
        let mut req = Request::new(message);
        req.extensions_mut().insert(UserExtension {
            username: username.to_string(),
        });
        req
    }

    async fn start_job<M: JobManager>(svc: &WorkernatorService<M>, user: &str) -> String {
        let response = svc
            .start(request_as(
                user,
                JobStartRequest {
                    command: "/bin/echo".into(),
                    arguments: vec!["hello".into()],
                },
            ))
            .await
            .expect("start job");
        response.into_inner().id
    }

    #[tokio::test]
    async fn start_returns_a_running_job_with_valid_id() {
        let svc = service(r#"{"admin": {"start": 100}}"#);
        let response = svc
            .start(request_as(
                "admin",
                JobStartRequest {
                    command: "/bin/echo".into(),
                    arguments: vec!["hello".into()],
                },
            ))
            .await
            .expect("start")
            .into_inner();
        assert_eq!(response.status, protobuf::JobStatus::Running as i32);
        assert_eq!(response.command, "/bin/echo");
        assert!(joblib::job::parse_id(&response.id).is_ok());
        assert!(response.started_at.is_some());
        assert!(response.ended_at.is_none());
    }

    #[tokio::test]
    async fn none_permission_is_unauthenticated() {
        let svc = service(r#"{"alice": {"start": 0, "status": 1}}"#);
        let err = svc
            .start(request_as(
                "alice",
                JobStartRequest {
                    command: "/bin/true".into(),
                    arguments: vec![],
                },
            ))
            .await
            .expect_err("start must be denied");
        assert_eq!(err.code(), Code::Unauthenticated);

        // a user absent from the ACL is equally denied
        let err = svc
            .status(request_as(
                "mallory",
                JobStatusRequest {
                    id: xid::new().to_string(),
                },
            ))
            .await
            .expect_err("status must be denied");
        assert_eq!(err.code(), Code::Unauthenticated);
    }

    #[tokio::test]
    async fn missing_identity_is_unauthenticated() {
        let svc = service(r#"{"alice": {"start": 1}}"#);
        let err = svc
            .start(Request::new(JobStartRequest {
                command: "/bin/true".into(),
                arguments: vec![],
            }))
            .await
            .expect_err("anonymous start must fail");
        assert_eq!(err.code(), Code::Unauthenticated);
    }

    #[tokio::test]
    async fn own_scope_hides_foreign_jobs() {
        let svc = service(
            r#"{"alice": {"start": 1, "status": 1}, "bob": {"start": 1, "status": 1}}"#,
        );
        let job_id = start_job(&svc, "alice").await;

        let err = svc
            .status(request_as("bob", JobStatusRequest { id: job_id.clone() }))
            .await
            .expect_err("bob must not see alice's job");
        assert_eq!(err.code(), Code::NotFound);

        let job = svc
            .status(request_as("alice", JobStatusRequest { id: job_id.clone() }))
            .await
            .expect("alice sees her own job")
            .into_inner();
        assert_eq!(job.id, job_id);
    }

    #[tokio::test]
    async fn super_scope_sees_every_job() {
        let svc = service(r#"{"alice": {"start": 1}, "admin": {"status": 100}}"#);
        let job_id = start_job(&svc, "alice").await;

        let job = svc
            .status(request_as("admin", JobStatusRequest { id: job_id.clone() }))
            .await
            .expect("admin sees any job")
            .into_inner();
        assert_eq!(job.id, job_id);
    }

    #[tokio::test]
    async fn malformed_ids_are_invalid_argument() {
        let svc = service(r#"{"admin": {"status": 100, "stop": 100}}"#);
        for bad in ["", "not-an-id", "!!!!"] {
            let err = svc
                .status(request_as("admin", JobStatusRequest { id: bad.into() }))
                .await
                .expect_err("malformed id must fail");
            assert_eq!(err.code(), Code::InvalidArgument);
        }
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let svc = service(r#"{"admin": {"stop": 100}}"#);
        let err = svc
            .stop(request_as(
                "admin",
                JobStopRequest {
                    id: xid::new().to_string(),
                },
            ))
            .await
            .expect_err("unknown job must fail");
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let svc = service(r#"{"admin": {"start": 100, "stop": 100}}"#);
        let job_id = start_job(&svc, "admin").await;

        let first = svc
            .stop(request_as("admin", JobStopRequest { id: job_id.clone() }))
            .await
            .expect("first stop")
            .into_inner();
        assert_eq!(first.status, protobuf::JobStatus::Stopped as i32);

        let second = svc
            .stop(request_as("admin", JobStopRequest { id: job_id }))
            .await
            .expect("second stop succeeds without error")
            .into_inner();
        assert_eq!(second.status, protobuf::JobStatus::Stopped as i32);
    }

    #[tokio::test]
    async fn output_streams_the_job_bytes() {
        let svc = service(r#"{"admin": {"start": 100, "output": 100}}"#);
        let job_id = start_job(&svc, "admin").await;

        let mut stream = svc
            .output(request_as("admin", OutputJobRequest { id: job_id }))
            .await
            .expect("output stream")
            .into_inner();

        let mut received = Vec::new();
        while let Some(chunk) = stream.next().await {
            received.extend_from_slice(&chunk.expect("chunk").data);
        }
        assert_eq!(received, b"hello\n");
    }

    #[test]
    fn proto_round_trip_preserves_fields() {
        let info = JobInfo {
            id: xid::new(),
            status: JobStatus::Failed {
                exit: 7,
                msg: "exited with status 7".into(),
            },
            command: "/bin/sh".into(),
            args: vec!["-c".into(), "exit 7".into()],
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
        };
        let wire = job_to_proto(&info);

        assert_eq!(wire.id, info.id.to_string());
        assert_eq!(wire.status, protobuf::JobStatus::Failed as i32);
        assert_eq!(wire.command, info.command);
        assert_eq!(wire.args, info.args);
        assert_eq!(wire.error_msg, "exited with status 7");

        let started = wire.started_at.expect("started_at");
        assert_eq!(started.seconds, info.started_at.timestamp());
        assert_eq!(
            started.nanos as u32,
            info.started_at.timestamp_subsec_nanos()
        );
        let ended = wire.ended_at.expect("ended_at");
        assert_eq!(ended.seconds, info.ended_at.expect("ended").timestamp());
    }
}
