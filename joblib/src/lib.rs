//! Job execution library for the workernator server.
//!
//! Four pieces fit together here: the [`images::Store`] pulls and caches
//! OCI images, the [`container::Runtime`] turns one into an isolated
//! container (namespaces, cgroups v2, overlayfs, veth networking), the
//! [`manager::Manager`] owns job lifecycles and their output files, and
//! [`tail::TailReader`] follows a still-growing output file for any number
//! of concurrent viewers.

pub mod container;
pub mod error;
pub mod images;
pub mod job;
pub mod manager;
pub mod tail;

pub use error::{Error, Result};
pub use job::{Job, JobId, JobInfo, JobStatus};
pub use manager::{JobManager, Manager, ManagerConfig};
pub use tail::TailReader;
