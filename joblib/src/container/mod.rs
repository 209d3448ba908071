//! Container construction and teardown.
//!
//! A container is built from a cached image: a per-container directory with
//! an overlay mount of the image layers, a veth pair bridged to the host,
//! and a re-execed child in fresh user/pid/mount/uts/ipc/net/cgroup
//! namespaces. The "call self as a helper" pattern carries the sentinel
//! subcommand names below; the server binary dispatches on them before the
//! async runtime starts.

pub mod cgroups;
pub mod child;
pub mod network;

pub use cgroups::JobLimits;
pub use child::ChildSpec;

use std::ffi::CString;
use std::fs;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::libc;
use nix::mount::{mount, umount, MsFlags};
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{getgid, getuid, Pid};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::images::{Image, Store};

/// Sentinel argv[1] for the namespaced child.
pub const CHILD_MODE: &str = "child-mode";
/// Sentinel argv[1] for the network-namespace helper.
pub const SETUP_NET_NS: &str = "setup-net-ns";
/// Sentinel argv[1] for the veth helper.
pub const SETUP_VETH: &str = "setup-veth";

const ID_TOKEN: &str = "%%CONTAINERID%%";
const CLONE_STACK_SIZE: usize = 1024 * 1024;

/// Replace the literal `%%CONTAINERID%%` token with the container's id.
pub(crate) fn substitute(value: &str, id: &str) -> String {
    value.replace(ID_TOKEN, id)
}

pub(crate) fn container_dir(run: &Path, id: &str) -> PathBuf {
    run.join("containers").join(id)
}

pub(crate) fn fs_home(run: &Path, id: &str) -> PathBuf {
    container_dir(run, id).join("fs")
}

pub(crate) fn mount_point(run: &Path, id: &str) -> PathBuf {
    fs_home(run, id).join("mnt")
}

/// The in-flight execution vehicle of one job: its directories, overlay
/// mount, and veth pair all key off the job id.
pub struct Container {
    id: String,
    image: Image,
}

impl Container {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Builds, launches, and tears down containers. One instance per manager.
pub struct Runtime {
    lib: PathBuf,
    run: PathBuf,
    tmp: PathBuf,
    store: Arc<Store>,
}

impl Runtime {
    pub fn new(
        lib: impl Into<PathBuf>,
        run: impl Into<PathBuf>,
        tmp: impl Into<PathBuf>,
        store: Arc<Store>,
    ) -> Result<Self> {
        let runtime = Self {
            lib: lib.into(),
            run: run.into(),
            tmp: tmp.into(),
            store,
        };
        for dir in [&runtime.run, &runtime.run.join("containers")] {
            fs::create_dir_all(dir)
                .map_err(|err| Error::io(format!("unable to create '{}'", dir.display()), err))?;
        }
        Ok(runtime)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Build everything the child will need: directory layout, overlay
    /// mount, host-side veth, and the two helper re-execs that populate the
    /// bind-mounted network namespace.
    pub async fn prepare(&self, image: &Image, id: &str) -> Result<Container> {
        let container = Container {
            id: id.to_string(),
            image: image.clone(),
        };
        self.create_directories(&container)?;
        self.mount_overlay(&container)?;
        network::setup_host_veth(&container.id).await?;
        self.run_helper(SETUP_NET_NS, &container.id).await?;
        self.run_helper(SETUP_VETH, &container.id).await?;
        Ok(container)
    }

    fn create_directories(&self, container: &Container) -> Result<()> {
        let home = fs_home(&self.run, &container.id);
        for dir in ["mnt", "upper", "work"] {
            let path = home.join(dir);
            fs::create_dir_all(&path)
                .map_err(|err| Error::io(format!("unable to create '{}'", path.display()), err))?;
        }
        Ok(())
    }

    fn mount_overlay(&self, container: &Container) -> Result<()> {
        let image_dir = self.store.image_dir(container.image.short_sha());
        let home = fs_home(&self.run, &container.id);
        let options = overlay_options(&image_dir, &container.image.layers, &home);

        mount(
            Some("none"),
            &home.join("mnt"),
            Some("overlay"),
            MsFlags::MS_NODEV,
            Some(options.as_str()),
        )
        .map_err(|err| Error::syscall("mount overlay", err))?;

        // keep our mounts from leaking into peers once namespaces unshare
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|err| Error::syscall("remount / private", err))
    }

    async fn run_helper(&self, sentinel: &str, id: &str) -> Result<()> {
        let output = tokio::process::Command::new("/proc/self/exe")
            .arg(sentinel)
            .arg(&self.lib)
            .arg(&self.run)
            .arg(&self.tmp)
            .arg(id)
            .output()
            .await
            .map_err(|err| Error::io(format!("unable to run '{sentinel}' helper"), err))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(helper = sentinel, %stderr, "helper command failed");
            return Err(Error::Netlink {
                op: format!("'{sentinel}' helper"),
                reason: stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Clone the child into its namespaces and exec `/proc/self/exe
    /// child-mode …`. The parent writes the uid/gid maps, then releases the
    /// child through a sync pipe; job stdout/stderr land on the two supplied
    /// descriptors.
    pub fn launch(
        &self,
        container: &Container,
        command: &str,
        args: &[String],
        limits: &JobLimits,
        stdout: &impl AsRawFd,
        stderr: &impl AsRawFd,
    ) -> Result<Pid> {
        let exe = cstr("/proc/self/exe")?;
        let mut argv = vec![exe.clone(), cstr(CHILD_MODE)?];
        for flag in limit_args(limits) {
            argv.push(cstr(&flag)?);
        }
        let mut tail: Vec<String> = vec![
            self.lib.display().to_string(),
            self.run.display().to_string(),
            self.tmp.display().to_string(),
            container.id.clone(),
            command.to_string(),
        ];
        tail.extend(args.iter().cloned());
        for value in &tail {
            argv.push(cstr(value)?);
        }

        let (sync_read, sync_write) =
            nix::unistd::pipe().map_err(|err| Error::syscall("pipe", err))?;
        let sync_fd = sync_read.as_raw_fd();
        let stdout_fd = stdout.as_raw_fd();
        let stderr_fd = stderr.as_raw_fd();

        let mut stack = vec![0u8; CLONE_STACK_SIZE];
        let cb = Box::new(move || -> isize {
            if nix::sys::prctl::set_pdeathsig(Signal::SIGTERM).is_err() {
                return 127;
            }
            // block until the parent has written our uid/gid maps
            let mut byte = [0u8; 1];
            unsafe {
                libc::read(sync_fd, byte.as_mut_ptr() as *mut libc::c_void, 1);
                if libc::dup2(stdout_fd, 1) < 0 || libc::dup2(stderr_fd, 2) < 0 {
                    return 126;
                }
            }
            raise_ambient_caps();
            let _ = nix::unistd::execv(&exe, &argv);
            127
        });

        let flags = CloneFlags::CLONE_NEWUSER
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWNET
            | CloneFlags::CLONE_NEWCGROUP;
        let pid = unsafe { clone(cb, &mut stack, flags, Some(libc::SIGCHLD)) }
            .map_err(|err| Error::syscall("clone", err))?;
        drop(sync_read);

        if let Err(err) = write_id_maps(pid) {
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
            return Err(err);
        }
        unsafe {
            libc::write(sync_write.as_raw_fd(), b"1".as_ptr() as *const libc::c_void, 1);
        }
        drop(sync_write);

        debug!(container = %container.id, pid = pid.as_raw(), "container launched");
        Ok(pid)
    }

    /// Tear down everything `prepare` and `launch` created, in dependency
    /// order: network namespace, overlay, cgroup, then the directory tree.
    /// Failures are logged and skipped so one stuck mount cannot leak the
    /// rest.
    pub fn cleanup(&self, container: &Container) {
        let id = &container.id;

        let ns_mount = network::net_ns_mount(&self.run, id);
        if let Err(err) = umount(&ns_mount) {
            warn!(container = %id, %err, "unable to unmount network namespace");
        }
        let mnt = mount_point(&self.run, id);
        if let Err(err) = umount(&mnt) {
            warn!(container = %id, %err, "unable to unmount container filesystem");
        }
        if let Err(err) = cgroups::remove(id) {
            warn!(container = %id, %err, "unable to remove container cgroup");
        }
        if let Err(err) = fs::remove_dir_all(container_dir(&self.run, id)) {
            warn!(container = %id, %err, "unable to remove container directory");
        }
    }
}

/// Overlay mount options: topmost layer first, per overlayfs lowerdir
/// semantics, with the writable upper/work pair beside the mount point.
fn overlay_options(image_dir: &Path, layers: &[String], fs_home: &Path) -> String {
    let mut lower: Vec<String> = Vec::with_capacity(layers.len());
    for layer in layers {
        lower.insert(
            0,
            image_dir.join(&layer[..12]).join("fs").display().to_string(),
        );
    }
    format!(
        "lowerdir={},upperdir={}/upper,workdir={}/work",
        lower.join(":"),
        fs_home.display(),
        fs_home.display()
    )
}

/// Flags the child-mode sentinel understands; only requested limits appear.
fn limit_args(limits: &JobLimits) -> Vec<String> {
    let mut args = Vec::new();
    let mut push = |flag: &str, value: String| {
        args.push(flag.to_string());
        args.push(value);
    };
    if let Some(pids) = limits.pid_limit {
        push("--pid-limit", pids.to_string());
    }
    if let Some(mb) = limits.memory_mb {
        push("--mem-limit", mb.to_string());
    }
    if let Some(weight) = limits.cpu_weight {
        push("--cpu-weight", weight.to_string());
    }
    if let Some(max) = limits.cpu_max {
        push("--cpu-max", max.to_string());
    }
    if let Some(period) = limits.cpu_period {
        push("--cpu-period", period.to_string());
    }
    if let Some(bps) = limits.io_bps {
        push("--io-bps", bps.to_string());
    }
    if let Some(iops) = limits.io_iops {
        push("--io-iops", iops.to_string());
    }
    args
}

fn write_id_maps(pid: Pid) -> Result<()> {
    let proc_dir = PathBuf::from(format!("/proc/{pid}"));
    let write = |file: &str, content: String| {
        fs::write(proc_dir.join(file), content)
            .map_err(|err| Error::io(format!("unable to write {file} for pid {pid}"), err))
    };
    write("uid_map", format!("0 {} 1\n", getuid().as_raw()))?;
    write("setgroups", "allow\n".to_string())?;
    write("gid_map", format!("0 {} 1\n", getgid().as_raw()))?;
    Ok(())
}

/// Give the child the capabilities it needs across the exec: mknod for the
/// device nodes, setuid/setgid for the user command, net-bind for servers.
fn raise_ambient_caps() {
    use caps::{CapSet, Capability};
    for cap in [
        Capability::CAP_SETGID,
        Capability::CAP_SETUID,
        Capability::CAP_NET_BIND_SERVICE,
        Capability::CAP_MKNOD,
    ] {
        let _ = caps::raise(None, CapSet::Inheritable, cap);
        let _ = caps::raise(None, CapSet::Ambient, cap);
    }
}

fn cstr(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| {
        Error::io(
            format!("'{value}' contains an interior NUL byte"),
            std::io::Error::from(std::io::ErrorKind::InvalidInput),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_stacks_layers_topmost_first() {
        let image_dir = Path::new("/var/lib/workernator/images/aaaaaaaaaaaa");
        let home = Path::new("/var/run/workernator/containers/job1/fs");
        let layers = vec![
            format!("{}/layer.tar", "1".repeat(64)),
            format!("{}/layer.tar", "2".repeat(64)),
        ];
        let options = overlay_options(image_dir, &layers, home);
        assert_eq!(
            options,
            "lowerdir=/var/lib/workernator/images/aaaaaaaaaaaa/222222222222/fs\
             :/var/lib/workernator/images/aaaaaaaaaaaa/111111111111/fs\
             ,upperdir=/var/run/workernator/containers/job1/fs/upper\
             ,workdir=/var/run/workernator/containers/job1/fs/work"
        );
    }

    #[test]
    fn only_requested_limits_become_flags() {
        assert!(limit_args(&JobLimits::default()).is_empty());

        let limits = JobLimits {
            pid_limit: Some(64),
            memory_mb: Some(128),
            cpu_weight: None,
            cpu_max: Some(200_000),
            cpu_period: Some(100_000),
            io_bps: None,
            io_iops: None,
        };
        assert_eq!(
            limit_args(&limits),
            vec![
                "--pid-limit",
                "64",
                "--mem-limit",
                "128",
                "--cpu-max",
                "200000",
                "--cpu-period",
                "100000",
            ]
        );
    }

    #[test]
    fn container_id_token_is_substituted() {
        assert_eq!(
            substitute("prefix-%%CONTAINERID%%-suffix", "abc123"),
            "prefix-abc123-suffix"
        );
        assert_eq!(substitute("no token", "abc123"), "no token");
    }

    #[test]
    fn container_paths_hang_off_the_run_dir() {
        let run = Path::new("/var/run/workernator");
        assert_eq!(
            mount_point(run, "job1"),
            PathBuf::from("/var/run/workernator/containers/job1/fs/mnt")
        );
    }
}
