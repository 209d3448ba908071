//! The re-execed process inside the new namespaces.
//!
//! Runs between clone and the exec of the user command: hostname, cgroups,
//! DNS, the special filesystems, pivot_root, and finally `execvpe`. Any
//! failure here aborts the launch; on success this function never returns.

use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chdir, execvpe, pivot_root, sethostname};

use crate::container::cgroups::{self, JobLimits};
use crate::container::{mount_point, substitute};
use crate::error::{Error, Result};

const CONTAINER_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Everything the child-mode process needs, decoded from its argv.
#[derive(Debug)]
pub struct ChildSpec {
    pub lib: PathBuf,
    pub run: PathBuf,
    pub tmp: PathBuf,
    pub id: String,
    pub limits: JobLimits,
    pub command: String,
    pub args: Vec<String>,
}

/// Perform the in-namespace setup steps in order, then exec the user
/// command. Only returns on error.
pub fn run(spec: &ChildSpec) -> Result<()> {
    let mnt = mount_point(&spec.run, &spec.id);

    sethostname(format!("workernator-{}", spec.id))
        .map_err(|err| Error::syscall("sethostname", err))?;
    cgroups::enter(&spec.id, &spec.limits)?;
    copy_nameserver_config(&mnt)?;
    mount_proc(&mnt)?;
    mount_special_dirs(&mnt)?;
    enter_root(&mnt)?;
    exec_command(spec)
}

/// Copy the host's DNS configuration into the container's future
/// `/etc/resolv.conf`. Nothing to copy is not an error.
fn copy_nameserver_config(mnt: &Path) -> Result<()> {
    const CANDIDATES: [&str; 2] = ["/var/run/systemd/resolve/resolv.conf", "/etc/resolv.conf"];

    for candidate in CANDIDATES {
        if !Path::new(candidate).exists() {
            continue;
        }
        let target = mnt.join("etc/resolv.conf");
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| Error::io("unable to create /etc in container", err))?;
        }
        fs::copy(candidate, &target)
            .map_err(|err| Error::io(format!("unable to copy '{candidate}'"), err))?;
        return Ok(());
    }
    Ok(())
}

fn mount_proc(mnt: &Path) -> Result<()> {
    let target = mnt.join("proc");
    fs::create_dir_all(&target)
        .map_err(|err| Error::io(format!("unable to create '{}'", target.display()), err))?;
    mount(
        Some("proc"),
        &target,
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|err| Error::syscall("mount proc", err))
}

/// Mount sysfs, /dev (with pts), /tmp when the image lacks one, then create
/// the stdio symlinks and the standard character devices.
fn mount_special_dirs(mnt: &Path) -> Result<()> {
    struct Special {
        source: &'static str,
        target: &'static str,
        fstype: &'static str,
        flags: MsFlags,
        options: Option<&'static str>,
    }

    let mut mounts = vec![
        Special {
            source: "sysfs",
            target: "sys",
            fstype: "sysfs",
            flags: MsFlags::empty(),
            options: None,
        },
        Special {
            source: "tmpfs",
            target: "dev",
            fstype: "tmpfs",
            flags: MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
            options: Some("mode=755"),
        },
        Special {
            source: "devpts",
            target: "dev/pts",
            fstype: "devpts",
            flags: MsFlags::empty(),
            options: None,
        },
    ];
    if !mnt.join("tmp").exists() {
        mounts.push(Special {
            source: "tmpfs",
            target: "tmp",
            fstype: "tmpfs",
            flags: MsFlags::empty(),
            options: None,
        });
    }

    for special in &mounts {
        let target = mnt.join(special.target);
        fs::create_dir_all(&target)
            .map_err(|err| Error::io(format!("unable to create '{}'", target.display()), err))?;
        mount(
            Some(special.source),
            &target,
            Some(special.fstype),
            special.flags,
            special.options,
        )
        .map_err(|err| Error::syscall(format!("mount {}", special.fstype), err))?;
    }

    for (i, name) in ["stdin", "stdout", "stderr"].into_iter().enumerate() {
        let source = format!("/proc/self/fd/{i}");
        let target = mnt.join("dev").join(name);
        std::os::unix::fs::symlink(&source, &target).map_err(|err| {
            Error::io(format!("unable to symlink '{source}' to '{}'", target.display()), err)
        })?;
    }

    let devices: [(&str, u64, u64); 7] = [
        ("null", 1, 3),
        ("zero", 1, 5),
        ("random", 1, 8),
        ("urandom", 1, 9),
        ("console", 136, 1),
        ("tty", 5, 0),
        ("full", 1, 7),
    ];
    for (name, major, minor) in devices {
        // absolute path under the future root; never through a symlink
        let path = mnt.join("dev").join(name);
        mknod(
            &path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o666),
            makedev(major, minor),
        )
        .map_err(|err| Error::syscall(format!("mknod /dev/{name}"), err))?;
    }

    Ok(())
}

/// Swap the mount namespace's root for the overlay and drop the old one.
fn enter_root(mnt: &Path) -> Result<()> {
    // pivot_root requires the new root to be a mount point distinct from
    // the current root's filesystem, hence the recursive self bind-mount
    mount(
        Some(mnt),
        mnt,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|err| Error::syscall("bind mount new root", err))?;

    let put_old = mnt.join(".pivot_root");
    fs::create_dir_all(&put_old)
        .map_err(|err| Error::io("unable to create .pivot_root", err))?;
    pivot_root(mnt, &put_old).map_err(|err| Error::syscall("pivot_root", err))?;
    chdir("/").map_err(|err| Error::syscall("chdir", err))?;
    umount2("/.pivot_root", MntFlags::MNT_DETACH)
        .map_err(|err| Error::syscall("umount old root", err))?;
    fs::remove_dir_all("/.pivot_root")
        .map_err(|err| Error::io("unable to remove .pivot_root", err))?;
    Ok(())
}

fn exec_command(spec: &ChildSpec) -> Result<()> {
    let command = substitute(&spec.command, &spec.id);
    let mut argv = vec![cstring(&command)?];
    for arg in &spec.args {
        argv.push(cstring(&substitute(arg, &spec.id))?);
    }
    let env = [cstring(CONTAINER_PATH)?];

    let err = match execvpe(&argv[0], &argv, &env) {
        Err(err) => err,
        Ok(infallible) => match infallible {},
    };
    Err(Error::syscall(format!("exec '{command}'"), err))
}

fn cstring(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| {
        Error::io(
            format!("'{value}' contains an interior NUL byte"),
            std::io::Error::from(std::io::ErrorKind::InvalidInput),
        )
    })
}
