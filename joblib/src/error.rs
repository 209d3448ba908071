use std::io;
use std::result;

use thiserror::Error;

pub type Result<T> = result::Result<T, Error>;

/// Errors produced by the job library.
///
/// `InvalidId` and `NoSuchJob` are client errors and cross the wire as-is;
/// everything else is a server-side failure and surfaces as `Internal`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("'{0}' is not a valid job id")]
    InvalidId(String),

    #[error("no job found for id '{0}'")]
    NoSuchJob(String),

    /// Failure before the child process started running.
    #[error("unable to launch container: {0}")]
    ContainerLaunch(#[source] Box<Error>),

    #[error("invalid image source '{0}'")]
    InvalidSource(String),

    #[error("unable to fetch image '{reference}': {reason}")]
    ImageFetch { reference: String, reason: String },

    #[error("malformed image '{reference}': {reason}")]
    MalformedImage { reference: String, reason: String },

    #[error("unsupported image '{reference}': {reason}")]
    UnsupportedImage { reference: String, reason: String },

    #[error("path traversal detected in tarball entry '{0}'")]
    PathTraversal(String),

    #[error("invalid resource limit: {0}")]
    InvalidLimit(String),

    #[error("{op} failed: {source}")]
    Syscall {
        op: String,
        #[source]
        source: nix::Error,
    },

    #[error("netlink {op} failed: {reason}")]
    Netlink { op: String, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn syscall(op: impl Into<String>, source: nix::Error) -> Self {
        Error::Syscall {
            op: op.into(),
            source,
        }
    }

    pub(crate) fn netlink(op: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Error::Netlink {
            op: op.into(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn launch(self) -> Self {
        Error::ContainerLaunch(Box::new(self))
    }
}
