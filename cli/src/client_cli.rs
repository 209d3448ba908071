use std::io::Write;
use std::path::Path;

use anyhow::Context;
use chrono::DateTime;
use protobuf::workernator_client::WorkernatorClient;
use protobuf::{
    Job, JobStartRequest, JobStatusRequest, JobStopRequest, OutputJobRequest, OutputJobResponse,
};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tonic::Request;

/// A thin wrapper over the generated client that owns the mTLS channel and
/// renders responses for the terminal.
pub struct ClientCli {
    inner: WorkernatorClient<Channel>,
}

impl ClientCli {
    pub async fn connect(
        server_addr: &str,
        domain: &str,
        cert: &Path,
        key: &Path,
        ca: &Path,
    ) -> anyhow::Result<Self> {
        let ca_pem = tokio::fs::read(ca)
            .await
            .with_context(|| format!("unable to read '{}'", ca.display()))?;
        let cert_pem = tokio::fs::read(cert)
            .await
            .with_context(|| format!("unable to read '{}'", cert.display()))?;
        let key_pem = tokio::fs::read(key)
            .await
            .with_context(|| format!("unable to read '{}'", key.display()))?;

        let tls = ClientTlsConfig::new()
            .domain_name(domain)
            .ca_certificate(Certificate::from_pem(ca_pem))
            .identity(Identity::from_pem(cert_pem, key_pem));

        let channel = Channel::from_shared(format!("https://{server_addr}"))
            .context("unable to parse server address")?
            .tls_config(tls)
            .context("unable to apply tls config")?
            .connect()
            .await
            .context("unable to connect to server")?;

        Ok(Self {
            inner: WorkernatorClient::new(channel),
        })
    }

    pub async fn start(&mut self, command: String, arguments: Vec<String>) -> anyhow::Result<()> {
        let response = self
            .inner
            .start(Request::new(JobStartRequest { command, arguments }))
            .await?;
        print_job(&response.into_inner());
        Ok(())
    }

    pub async fn stop(&mut self, id: String) -> anyhow::Result<()> {
        let response = self.inner.stop(Request::new(JobStopRequest { id })).await?;
        print_job(&response.into_inner());
        Ok(())
    }

    pub async fn status(&mut self, id: String) -> anyhow::Result<()> {
        let response = self
            .inner
            .status(Request::new(JobStatusRequest { id }))
            .await?;
        print_job(&response.into_inner());
        Ok(())
    }

    /// Stream the job's output to stdout until the server signals end of
    /// stream. A broken pipe (e.g. piping into `head`) ends it quietly.
    pub async fn output(&mut self, id: String) -> anyhow::Result<()> {
        let response = self
            .inner
            .output(Request::new(OutputJobRequest { id }))
            .await?;
        let mut stream = response.into_inner();
        let mut stdout = std::io::stdout();
        while let Some(OutputJobResponse { data }) = stream.message().await? {
            if let Err(err) = stdout.write_all(&data) {
                if err.kind() == std::io::ErrorKind::BrokenPipe {
                    break;
                }
                let _ = writeln!(std::io::stderr(), "{err}");
            }
        }
        Ok(())
    }
}

fn print_job(job: &Job) {
    println!("job:     {}", job.id);
    println!("status:  {}", status_name(job.status));
    println!("command: {} {}", job.command, job.args.join(" "));
    if let Some(started) = &job.started_at {
        println!("started: {}", format_time(started));
    }
    if let Some(ended) = &job.ended_at {
        println!("ended:   {}", format_time(ended));
    }
    if !job.error_msg.is_empty() {
        println!("error:   {}", job.error_msg);
    }
}

fn status_name(code: i32) -> &'static str {
    match protobuf::JobStatus::try_from(code) {
        Ok(protobuf::JobStatus::Running) => "running",
        Ok(protobuf::JobStatus::Failed) => "failed",
        Ok(protobuf::JobStatus::Finished) => "finished",
        Ok(protobuf::JobStatus::Stopped) => "stopped",
        Ok(protobuf::JobStatus::Unknown) | Err(_) => "unknown",
    }
}

fn format_time(ts: &prost_types::Timestamp) -> String {
    DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32)
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "<invalid timestamp>".to_string())
}
