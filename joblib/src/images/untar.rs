use std::fs;
use std::io::Read;
use std::os::unix::fs::{symlink, OpenOptionsExt};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::debug;

use crate::error::{Error, Result};

/// Extract a tarball into `output`, honoring directories, regular files,
/// symlinks, and hardlinks. Hardlinks are recorded and created in a second
/// pass, after every regular file exists. Entries whose reconstructed path
/// would escape `output` fail the whole extraction.
///
/// Gzip compression is detected by the `.tar.gz` suffix only.
pub fn untar(tarball: &Path, output: &Path) -> Result<()> {
    let file = fs::File::open(tarball)
        .map_err(|err| Error::io(format!("unable to open tarball '{}'", tarball.display()), err))?;

    let reader: Box<dyn Read> = if tarball
        .to_string_lossy()
        .ends_with(".tar.gz")
    {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut archive = Archive::new(reader);
    let mut hard_links: Vec<(PathBuf, PathBuf)> = Vec::new();

    for entry in archive
        .entries()
        .map_err(|err| Error::io("unable to read tarball entries", err))?
    {
        let mut entry = entry.map_err(|err| Error::io("unable to read tarball entry", err))?;
        let name = entry
            .path()
            .map_err(|err| Error::io("unable to read entry path", err))?
            .into_owned();
        let dest = output.join(safe_relative(&name)?);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&dest).map_err(|err| {
                    Error::io(format!("unable to create directory '{}'", dest.display()), err)
                })?;
            }
            EntryType::Link => {
                let target = entry
                    .link_name()
                    .map_err(|err| Error::io("unable to read hardlink target", err))?
                    .ok_or_else(|| Error::PathTraversal(name.display().to_string()))?;
                let target = output.join(safe_relative(&target)?);
                hard_links.push((dest, target));
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|err| Error::io("unable to read symlink target", err))?
                    .ok_or_else(|| Error::PathTraversal(name.display().to_string()))?;
                match symlink(&target, &dest) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(err) => {
                        return Err(Error::io(
                            format!("unable to create symlink '{}'", dest.display()),
                            err,
                        ))
                    }
                }
            }
            EntryType::Regular => {
                if let Some(parent) = dest.parent() {
                    if !parent.exists() {
                        fs::create_dir_all(parent).map_err(|err| {
                            Error::io(
                                format!("unable to create directory '{}'", parent.display()),
                                err,
                            )
                        })?;
                    }
                }
                let mode = entry.header().mode().unwrap_or(0o644);
                let mut file = fs::OpenOptions::new()
                    .create(true)
                    .truncate(true)
                    .write(true)
                    .mode(mode)
                    .open(&dest)
                    .map_err(|err| {
                        Error::io(format!("unable to open output '{}'", dest.display()), err)
                    })?;
                std::io::copy(&mut entry, &mut file).map_err(|err| {
                    Error::io(format!("unable to write '{}'", dest.display()), err)
                })?;
            }
            other => {
                debug!(entry = %name.display(), kind = ?other, "skipping unhandled tarball entry");
            }
        }
    }

    for (link, target) in hard_links {
        fs::hard_link(&target, &link).map_err(|err| {
            Error::io(
                format!(
                    "unable to link '{}' to '{}'",
                    link.display(),
                    target.display()
                ),
                err,
            )
        })?;
    }

    Ok(())
}

/// Reject absolute paths and any `..` component so a crafted archive cannot
/// write outside the extraction root.
fn safe_relative(path: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathTraversal(path.display().to_string()))
            }
        }
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn file_entry(builder: &mut tar::Builder<Vec<u8>>, path: &str, content: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder
            .append_data(&mut header, path, content)
            .expect("append");
    }

    fn write_tar(dir: &Path, name: &str, build: impl FnOnce(&mut tar::Builder<Vec<u8>>)) -> PathBuf {
        let mut builder = tar::Builder::new(Vec::new());
        build(&mut builder);
        let bytes = builder.into_inner().expect("finish tar");
        let path = dir.join(name);
        if name.ends_with(".tar.gz") {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&bytes).expect("gzip");
            fs::write(&path, encoder.finish().expect("gzip finish")).expect("write");
        } else {
            fs::write(&path, bytes).expect("write");
        }
        path
    }

    #[test]
    fn extracts_files_dirs_and_links() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tarball = write_tar(dir.path(), "layer.tar", |builder| {
            let mut header = tar::Header::new_gnu();
            header.set_size(0);
            header.set_mode(0o755);
            header.set_entry_type(EntryType::Directory);
            header.set_cksum();
            builder.append_data(&mut header, "bin/", &[][..]).expect("dir");

            file_entry(builder, "bin/sh", b"#!/bin/sh\n");
            // nested file with no explicit parent directory entry
            file_entry(builder, "etc/config/settings", b"x=1\n");

            let mut header = tar::Header::new_gnu();
            header.set_size(0);
            header.set_entry_type(EntryType::Link);
            header.set_cksum();
            builder
                .append_link(&mut header, "bin/ash", "bin/sh")
                .expect("hardlink");

            let mut header = tar::Header::new_gnu();
            header.set_size(0);
            header.set_entry_type(EntryType::Symlink);
            header.set_cksum();
            builder
                .append_link(&mut header, "bin/lnk", "sh")
                .expect("symlink");
        });

        let out = dir.path().join("fs");
        fs::create_dir(&out).expect("mkdir");
        untar(&tarball, &out).expect("untar");

        assert_eq!(fs::read(out.join("bin/sh")).expect("read"), b"#!/bin/sh\n");
        assert_eq!(fs::read(out.join("etc/config/settings")).expect("read"), b"x=1\n");
        assert_eq!(fs::read(out.join("bin/ash")).expect("hardlink read"), b"#!/bin/sh\n");
        assert!(fs::symlink_metadata(out.join("bin/lnk"))
            .expect("symlink meta")
            .file_type()
            .is_symlink());
    }

    #[test]
    fn gzipped_tarballs_are_detected_by_suffix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tarball = write_tar(dir.path(), "layer.tar.gz", |builder| {
            file_entry(builder, "hello", b"world\n");
        });
        let out = dir.path().join("fs");
        fs::create_dir(&out).expect("mkdir");
        untar(&tarball, &out).expect("untar");
        assert_eq!(fs::read(out.join("hello")).expect("read"), b"world\n");
    }

    #[test]
    fn rejects_path_traversal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tarball = write_tar(dir.path(), "evil.tar", |builder| {
            // `tar::Builder::append_data` validates the path and refuses `..`
            // components, so the malicious header is built by hand here to
            // exercise the extractor's own traversal check.
            let content: &[u8] = b"escape\n";
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(EntryType::Regular);
            let name = b"../x";
            header.as_old_mut().name[..name.len()].copy_from_slice(name);
            header.set_cksum();
            builder.append(&header, content).expect("append");
        });
        let out = dir.path().join("fs");
        fs::create_dir(&out).expect("mkdir");
        let err = untar(&tarball, &out).expect_err("traversal must be rejected");
        assert!(matches!(err, Error::PathTraversal(_)));
        assert!(!dir.path().join("x").exists());
    }
}
