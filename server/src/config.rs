//! Server configuration: a JSON file with the keys below, validated before
//! anything listens on the network. Validation failures are fatal.

use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use joblib::container::JobLimits;
use serde::Deserialize;

use crate::services::jobservice::authz::Acl;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    /// Decimal TCP port in `[1, 65535]`.
    pub port: String,
    /// PEM-encoded server certificate.
    pub cert_path: PathBuf,
    /// PEM-encoded EC private key for the server certificate.
    pub key_path: PathBuf,
    /// PEM-encoded CA bundle client certificates must chain to.
    pub chain_path: PathBuf,
    #[serde(rename = "ACL")]
    pub acl: Acl,
    /// Directory for per-job output files.
    pub output_path: PathBuf,
    /// Image store root (`images.json` and `images/`).
    pub lib_path: PathBuf,
    /// Runtime root (`containers/` and `net-ns/`).
    pub run_path: PathBuf,
    /// Scratch root for image downloads.
    pub tmp_path: PathBuf,
    /// Image every job runs in.
    #[serde(default = "default_image")]
    pub image: String,
    /// Optional cgroup limits applied to every job.
    #[serde(default)]
    pub limits: JobLimits,
}

fn default_image() -> String {
    "alpine:latest".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, String> {
        let bytes = fs::read(path)
            .map_err(|err| format!("unable to read config '{}': {err}", path.display()))?;
        let config: Config = serde_json::from_slice(&bytes)
            .map_err(|err| format!("unable to decode config '{}': {err}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_port(&self.port).map_err(|err| format!("invalid port: {err}"))?;
        validate_cert(&self.cert_path).map_err(|err| format!("invalid certificate: {err}"))?;
        validate_key(&self.key_path).map_err(|err| format!("invalid key: {err}"))?;
        validate_cert(&self.chain_path)
            .map_err(|err| format!("invalid ca chain certificate: {err}"))?;
        self.acl.validate()?;
        self.limits
            .validate()
            .map_err(|err| format!("invalid limits: {err}"))?;
        Ok(())
    }
}

fn validate_port(port: &str) -> Result<(), String> {
    let port = port.trim();
    if port.is_empty() {
        return Err("port can't be empty".into());
    }
    let number: u32 = port
        .parse()
        .map_err(|err| format!("unable to parse port number: {err}"))?;
    if !(1..=65_535).contains(&number) {
        return Err("port number must be between 1 and 65,535".into());
    }
    Ok(())
}

fn open_pem(path: &Path) -> Result<BufReader<fs::File>, String> {
    if path.as_os_str().is_empty() {
        return Err("path can't be blank".into());
    }
    let meta = fs::metadata(path).map_err(|_| format!("no file found at '{}'", path.display()))?;
    if meta.is_dir() {
        return Err(format!("'{}' is a directory, not a file", path.display()));
    }
    let file = fs::File::open(path)
        .map_err(|err| format!("unable to open '{}': {err}", path.display()))?;
    Ok(BufReader::new(file))
}

/// The file must hold at least one PEM certificate.
fn validate_cert(path: &Path) -> Result<(), String> {
    let mut reader = open_pem(path)?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|err| format!("unable to parse '{}': {err}", path.display()))?;
    if certs.is_empty() {
        return Err(format!("no certificates found in '{}'", path.display()));
    }
    Ok(())
}

/// The file must hold a PEM EC private key (SEC1 or PKCS#8).
fn validate_key(path: &Path) -> Result<(), String> {
    let mut reader = open_pem(path)?;
    match rustls_pemfile::read_one(&mut reader) {
        Ok(Some(rustls_pemfile::Item::Sec1Key(_))) => Ok(()),
        Ok(Some(rustls_pemfile::Item::Pkcs8Key(_))) => Ok(()),
        Ok(_) => Err(format!("no private key found in '{}'", path.display())),
        Err(err) => Err(format!("unable to parse '{}': {err}", path.display())),
    }
}
