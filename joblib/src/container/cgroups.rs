//! Cgroups v2 enforcement under `/sys/fs/cgroup/workernator/<id>/`.
//!
//! Runs inside the child before the user command execs: the child creates
//! its own cgroup, writes itself into `cgroup.procs`, and applies whatever
//! limits were requested. Every limit is optional; absent means skip.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const CGROUP_BASE: &str = "/sys/fs/cgroup/workernator";

/// Resource limits applied to every job container. All fields optional.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct JobLimits {
    /// `pids.max`
    pub pid_limit: Option<i64>,
    /// `memory.max` in megabytes; `memory.high` is set to half of it.
    pub memory_mb: Option<i64>,
    /// `cpu.weight`, must be within `[1, 10000]`.
    pub cpu_weight: Option<u64>,
    /// `cpu.max` quota in microseconds; requires `cpu_period` and must be at
    /// least as large as it.
    pub cpu_max: Option<u64>,
    /// `cpu.max` period in microseconds.
    pub cpu_period: Option<u64>,
    /// Read and write bytes-per-second for `io.max`; applied per block
    /// device together with `io_iops`.
    pub io_bps: Option<u64>,
    /// Read and write IOPS for `io.max`.
    pub io_iops: Option<u64>,
}

impl JobLimits {
    pub fn validate(&self) -> Result<()> {
        if let Some(weight) = self.cpu_weight {
            if !(1..=10_000).contains(&weight) {
                return Err(Error::InvalidLimit(format!(
                    "cpu weight must be within [1, 10000], got {weight}"
                )));
            }
        }
        match (self.cpu_max, self.cpu_period) {
            (Some(max), Some(period)) if max < period => {
                return Err(Error::InvalidLimit(format!(
                    "cpu max must be at least the period, got max {max}, period {period}"
                )));
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(Error::InvalidLimit(
                    "cpu max and cpu period must be set together".into(),
                ));
            }
            _ => {}
        }
        if let (Some(_), None) | (None, Some(_)) = (self.io_bps, self.io_iops) {
            return Err(Error::InvalidLimit(
                "io bps and io iops must be set together".into(),
            ));
        }
        Ok(())
    }
}

fn cgroup_dir(id: &str) -> PathBuf {
    Path::new(CGROUP_BASE).join(id)
}

fn write_file(path: PathBuf, content: &str) -> Result<()> {
    fs::write(&path, content)
        .map_err(|err| Error::io(format!("unable to write '{}'", path.display()), err))
}

/// Create the container cgroup, move the calling process into it, and apply
/// `limits`. Controllers are delegated through the shared
/// `cgroup.subtree_control` first.
pub fn enter(id: &str, limits: &JobLimits) -> Result<()> {
    limits.validate()?;

    fs::create_dir_all(CGROUP_BASE)
        .map_err(|err| Error::io(format!("unable to create '{CGROUP_BASE}'"), err))?;
    write_file(
        Path::new(CGROUP_BASE).join("cgroup.subtree_control"),
        "+cpu +memory +io +pids",
    )?;

    let dir = cgroup_dir(id);
    fs::create_dir_all(&dir)
        .map_err(|err| Error::io(format!("unable to create '{}'", dir.display()), err))?;
    write_file(dir.join("cgroup.procs"), &std::process::id().to_string())?;

    apply(&dir, limits)
}

fn apply(dir: &Path, limits: &JobLimits) -> Result<()> {
    if let Some(pids) = limits.pid_limit {
        write_file(dir.join("pids.max"), &pids.to_string())?;
    }
    if let Some(limit_mb) = limits.memory_mb {
        write_file(dir.join("memory.max"), &format!("{limit_mb}M"))?;
        write_file(dir.join("memory.high"), &format!("{}M", limit_mb / 2))?;
    }
    if let Some(weight) = limits.cpu_weight {
        write_file(dir.join("cpu.weight"), &weight.to_string())?;
    }
    if let (Some(max), Some(period)) = (limits.cpu_max, limits.cpu_period) {
        write_file(dir.join("cpu.max"), &format!("{max} {period}"))?;
    }
    if let (Some(bps), Some(iops)) = (limits.io_bps, limits.io_iops) {
        let partitions = fs::read_to_string("/proc/partitions")
            .map_err(|err| Error::io("unable to read /proc/partitions", err))?;
        for device in block_devices(&partitions) {
            write_file(
                dir.join("io.max"),
                &format!("{device} rbps={bps} wbps={bps} riops={iops} wiops={iops}"),
            )?;
        }
    }
    Ok(())
}

/// Remove the container's cgroup directory. Must happen after every process
/// in it has been reaped.
pub fn remove(id: &str) -> std::io::Result<()> {
    fs::remove_dir(cgroup_dir(id))
}

/// `major:minor` pairs from `/proc/partitions` content, skipping the header.
fn block_devices(partitions: &str) -> Vec<String> {
    partitions
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [major, minor, _, _] if major.chars().all(|c| c.is_ascii_digit()) => {
                    Some(format!("{major}:{minor}"))
                }
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_weight_range_is_enforced() {
        for weight in [0, 10_001] {
            let limits = JobLimits {
                cpu_weight: Some(weight),
                ..Default::default()
            };
            assert!(matches!(limits.validate(), Err(Error::InvalidLimit(_))));
        }
        for weight in [1, 100, 10_000] {
            let limits = JobLimits {
                cpu_weight: Some(weight),
                ..Default::default()
            };
            assert!(limits.validate().is_ok());
        }
    }

    #[test]
    fn cpu_bandwidth_requires_max_at_least_period() {
        let bad = JobLimits {
            cpu_max: Some(50_000),
            cpu_period: Some(100_000),
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(Error::InvalidLimit(_))));

        let good = JobLimits {
            cpu_max: Some(200_000),
            cpu_period: Some(100_000),
            ..Default::default()
        };
        assert!(good.validate().is_ok());

        let half = JobLimits {
            cpu_max: Some(200_000),
            ..Default::default()
        };
        assert!(matches!(half.validate(), Err(Error::InvalidLimit(_))));
    }

    #[test]
    fn io_limits_are_all_or_nothing() {
        let bps_only = JobLimits {
            io_bps: Some(1_000_000),
            ..Default::default()
        };
        assert!(matches!(bps_only.validate(), Err(Error::InvalidLimit(_))));

        let iops_only = JobLimits {
            io_iops: Some(500),
            ..Default::default()
        };
        assert!(matches!(iops_only.validate(), Err(Error::InvalidLimit(_))));

        let both = JobLimits {
            io_bps: Some(1_000_000),
            io_iops: Some(500),
            ..Default::default()
        };
        assert!(both.validate().is_ok());
    }

    #[test]
    fn empty_limits_are_valid() {
        assert!(JobLimits::default().validate().is_ok());
    }

    #[test]
    fn block_devices_come_from_partition_lines() {
        let sample = "\
major minor  #blocks  name

   8        0  500107608 sda
   8        1     524288 sda1
 259        0  250059096 nvme0n1
";
        assert_eq!(block_devices(sample), vec!["8:0", "8:1", "259:0"]);
    }
}
