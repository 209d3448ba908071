//! OCI image acquisition and layer caching.
//!
//! Images are cached under `<lib>/images/<shortSHA>/` keyed by the config
//! digest, with `<lib>/images.json` holding the persisted mapping from
//! user-facing `distribution:tag` names to content digests. Pulled images
//! are first written to a scratch directory as a legacy single-file tarball
//! (`package.tar`), then unpacked layer by layer.

mod untar;

pub use untar::untar;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

const DEFAULT_TAG: &str = "latest";
const PACKAGE_FILE_NAME: &str = "package.tar";

/// How many digest characters key the on-disk image directories.
const SHORT_SHA_LEN: usize = 12;

/// A cached OCI v1 image, ready for container construction.
#[derive(Clone, Debug)]
pub struct Image {
    pub distribution: String,
    pub tag: String,
    /// Full config digest (hex, no `sha256:` prefix).
    pub sha: String,
    /// Layer entries from the legacy manifest, in manifest order
    /// (bottom-most first).
    pub layers: Vec<String>,
}

impl Image {
    pub fn source(&self) -> String {
        format!("{}:{}", self.distribution, self.tag)
    }

    pub fn short_sha(&self) -> &str {
        short_sha(&self.sha)
    }
}

fn short_sha(sha: &str) -> &str {
    if sha.len() < SHORT_SHA_LEN {
        sha
    } else {
        &sha[..SHORT_SHA_LEN]
    }
}

/// Legacy (docker-save style) image manifest: a single-element array with
/// the config file name and the ordered layer tarball paths.
#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags")]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

type LegacyManifest = Vec<ManifestEntry>;

type ImageIndex = HashMap<String, HashMap<String, String>>;

/// The image store: pulls images by `distribution:tag`, deduplicates them by
/// config digest, and exposes the extracted layer directories for overlay
/// mounting. Repeated pulls of a cached `(distribution, tag)` never touch
/// the network again.
pub struct Store {
    lib: PathBuf,
    tmp: PathBuf,
    index: RwLock<ImageIndex>,
}

impl Store {
    /// Load (or create) the store rooted at `lib`, with `tmp` as the scratch
    /// root for in-flight downloads.
    pub fn new(lib: impl Into<PathBuf>, tmp: impl Into<PathBuf>) -> Result<Self> {
        let lib = lib.into();
        let tmp = tmp.into();
        for dir in [&lib, &tmp, &lib.join("images")] {
            fs::create_dir_all(dir)
                .map_err(|err| Error::io(format!("unable to create '{}'", dir.display()), err))?;
        }

        let index_path = lib.join("images.json");
        let index = match fs::read(&index_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
                Error::io(
                    format!("unable to decode index '{}'", index_path.display()),
                    err.into(),
                )
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ImageIndex::new(),
            Err(err) => {
                return Err(Error::io(
                    format!("unable to read index '{}'", index_path.display()),
                    err,
                ))
            }
        };

        Ok(Self {
            lib,
            tmp,
            index: RwLock::new(index),
        })
    }

    /// Resolve `source` (`dist` or `dist:tag`, tag defaulting to `latest`)
    /// to a cached image, pulling it from the registry if necessary.
    pub async fn get_image(&self, source: &str) -> Result<Image> {
        let (dist, tag) = parse_source(source)?;

        if let Some(sha) = self.cached_sha(&dist, &tag) {
            debug!(%dist, %tag, sha = short_sha(&sha), "image already cached");
            return self.load_by_sha(&dist, &tag, &sha);
        }

        let reference: Reference = format!("{dist}:{tag}")
            .parse()
            .map_err(|_| Error::InvalidSource(source.to_string()))?;
        let client = Client::new(ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        });
        let auth = RegistryAuth::Anonymous;

        let (manifest, _manifest_digest) = client
            .pull_manifest(&reference, &auth)
            .await
            .map_err(|err| Error::ImageFetch {
                reference: reference.to_string(),
                reason: err.to_string(),
            })?;
        let manifest = match manifest {
            OciManifest::Image(manifest) => manifest,
            OciManifest::ImageIndex(_) => {
                return Err(Error::UnsupportedImage {
                    reference: reference.to_string(),
                    reason: "cannot handle multi-manifest images".into(),
                })
            }
        };
        let sha = digest_hex(&manifest.config.digest).to_string();

        if self.sha_known(&dist, &sha) {
            // same content under a new tag: record the alias, skip the download
            info!(%dist, %tag, sha = short_sha(&sha), "digest already present, recording alias");
            self.record(&dist, &tag, &sha)?;
            return self.load_by_sha(&dist, &tag, &sha);
        }

        info!(%dist, %tag, sha = short_sha(&sha), "downloading image");
        self.download(&client, &reference, &manifest, &dist, &tag, &sha)
            .await?;
        self.record(&dist, &tag, &sha)?;
        self.load_by_sha(&dist, &tag, &sha)
    }

    /// Absolute path of the cached image directory for `short`.
    pub fn image_dir(&self, short: &str) -> PathBuf {
        self.lib.join("images").join(short)
    }

    fn manifest_path(&self, short: &str) -> PathBuf {
        self.image_dir(short).join("manifest.json")
    }

    fn index_path(&self) -> PathBuf {
        self.lib.join("images.json")
    }

    fn cached_sha(&self, dist: &str, tag: &str) -> Option<String> {
        let index = self.index.read().unwrap();
        index.get(dist).and_then(|tags| tags.get(tag)).cloned()
    }

    fn sha_known(&self, dist: &str, sha: &str) -> bool {
        let index = self.index.read().unwrap();
        index
            .get(dist)
            .map(|tags| tags.values().any(|known| known == sha))
            .unwrap_or(false)
    }

    /// Record `(dist, tag) -> sha` and flush the whole index to disk under
    /// the write lock.
    fn record(&self, dist: &str, tag: &str, sha: &str) -> Result<()> {
        let mut index = self.index.write().unwrap();
        index
            .entry(dist.to_string())
            .or_default()
            .insert(tag.to_string(), sha.to_string());
        let bytes = serde_json::to_vec(&*index)
            .map_err(|err| Error::io("unable to encode image index", err.into()))?;
        fs::write(self.index_path(), bytes).map_err(|err| {
            Error::io(
                format!("unable to write index '{}'", self.index_path().display()),
                err,
            )
        })
    }

    fn load_by_sha(&self, dist: &str, tag: &str, sha: &str) -> Result<Image> {
        let manifest = parse_manifest(&self.manifest_path(short_sha(sha)), &format!("{dist}:{tag}"))?;
        Ok(Image {
            distribution: dist.to_string(),
            tag: tag.to_string(),
            sha: sha.to_string(),
            layers: manifest[0].layers.clone(),
        })
    }

    /// Download the image as a legacy single-file tarball into scratch,
    /// extract it, and move the pieces into their cached locations.
    async fn download(
        &self,
        client: &Client,
        reference: &Reference,
        manifest: &OciImageManifest,
        dist: &str,
        tag: &str,
        sha: &str,
    ) -> Result<()> {
        if manifest.layers.is_empty() {
            return Err(Error::MalformedImage {
                reference: reference.to_string(),
                reason: "no layers in image manifest".into(),
            });
        }

        let scratch = self.tmp.join(short_sha(sha));
        fs::create_dir_all(&scratch).map_err(|err| {
            Error::io(
                format!("unable to create scratch directory '{}'", scratch.display()),
                err,
            )
        })?;

        let fetch = |err: oci_distribution::errors::OciDistributionError| Error::ImageFetch {
            reference: reference.to_string(),
            reason: err.to_string(),
        };

        let mut config = Vec::new();
        client
            .pull_blob(reference, &manifest.config, &mut config)
            .await
            .map_err(fetch)?;

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for descriptor in &manifest.layers {
            let mut data = Vec::new();
            client
                .pull_blob(reference, descriptor, &mut data)
                .await
                .map_err(fetch)?;
            let gz = descriptor.media_type.contains("gzip");
            layers.push((digest_hex(&descriptor.digest).to_string(), gz, data));
        }

        let source = format!("{dist}:{tag}");
        save_legacy(&scratch, &source, sha, &config, &layers)?;
        untar(&scratch.join(PACKAGE_FILE_NAME), &scratch)?;
        self.process_layers(&scratch, &source, sha)?;

        if let Err(err) = fs::remove_dir_all(&scratch) {
            debug!(scratch = %scratch.display(), %err, "unable to clean up scratch directory");
        }
        Ok(())
    }

    /// Extract every layer listed in the scratch manifest into the image
    /// cache and copy the manifest and config blob alongside them.
    fn process_layers(&self, scratch: &Path, source: &str, sha: &str) -> Result<()> {
        let manifest_path = scratch.join("manifest.json");
        let manifest = parse_manifest(&manifest_path, source)?;

        let image_dir = self.image_dir(short_sha(sha));
        fs::create_dir_all(&image_dir).map_err(|err| {
            Error::io(
                format!("unable to create image directory '{}'", image_dir.display()),
                err,
            )
        })?;

        for layer in &manifest[0].layers {
            let layer_dir = image_dir.join(&layer[..SHORT_SHA_LEN]).join("fs");
            fs::create_dir_all(&layer_dir).map_err(|err| {
                Error::io(
                    format!("unable to create layer directory '{}'", layer_dir.display()),
                    err,
                )
            })?;
            untar(&scratch.join(layer), &layer_dir)?;
        }

        let copy = |from: PathBuf, to: PathBuf| -> Result<()> {
            fs::copy(&from, &to)
                .map(|_| ())
                .map_err(|err| {
                    Error::io(
                        format!("unable to copy '{}' to '{}'", from.display(), to.display()),
                        err,
                    )
                })
        };
        copy(manifest_path, self.manifest_path(short_sha(sha)))?;
        copy(
            scratch.join(format!("{sha}.json")),
            image_dir.join(format!("{}.json", short_sha(sha))),
        )?;
        Ok(())
    }
}

/// Write the pulled blobs as a legacy single-file image tarball
/// (`package.tar`) in the scratch directory: `manifest.json`, the config
/// blob as `<sha>.json`, and each layer at `<digest>/layer.tar[.gz]`.
fn save_legacy(
    scratch: &Path,
    source: &str,
    sha: &str,
    config: &[u8],
    layers: &[(String, bool, Vec<u8>)],
) -> Result<()> {
    let config_name = format!("{sha}.json");
    let layer_names: Vec<String> = layers
        .iter()
        .map(|(digest, gz, _)| {
            if *gz {
                format!("{digest}/layer.tar.gz")
            } else {
                format!("{digest}/layer.tar")
            }
        })
        .collect();

    let manifest = vec![ManifestEntry {
        config: config_name.clone(),
        repo_tags: vec![source.to_string()],
        layers: layer_names.clone(),
    }];
    let manifest_bytes = serde_json::to_vec(&manifest)
        .map_err(|err| Error::io("unable to encode legacy manifest", err.into()))?;

    let package_path = scratch.join(PACKAGE_FILE_NAME);
    let package = fs::File::create(&package_path).map_err(|err| {
        Error::io(
            format!("unable to create '{}'", package_path.display()),
            err,
        )
    })?;
    let mut builder = tar::Builder::new(package);

    let mut append = |name: &str, data: &[u8]| -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, data)
            .map_err(|err| Error::io(format!("unable to append '{name}' to package"), err))
    };

    append("manifest.json", &manifest_bytes)?;
    append(&config_name, config)?;
    for (name, (_, _, data)) in layer_names.iter().zip(layers) {
        append(name, data)?;
    }

    builder
        .into_inner()
        .and_then(|file| file.sync_all())
        .map_err(|err| Error::io("unable to finish package tarball", err))?;
    Ok(())
}

/// Split an image source into `(distribution, tag)`, with the tag
/// defaulting to `latest`. A `:` with nothing after it is malformed.
pub fn parse_source(source: &str) -> Result<(String, String)> {
    if source.is_empty() {
        return Err(Error::InvalidSource(source.to_string()));
    }
    match source.split_once(':') {
        None => Ok((source.to_string(), DEFAULT_TAG.to_string())),
        Some((_, "")) | Some(("", _)) => Err(Error::InvalidSource(source.to_string())),
        Some((dist, tag)) => Ok((dist.to_string(), tag.to_string())),
    }
}

/// Parse and validate a legacy manifest: exactly one entry, at least one
/// layer.
fn parse_manifest(path: &Path, reference: &str) -> Result<LegacyManifest> {
    let bytes = fs::read(path).map_err(|err| {
        Error::io(format!("unable to open manifest '{}'", path.display()), err)
    })?;
    let manifest: LegacyManifest = serde_json::from_slice(&bytes).map_err(|err| {
        Error::io(
            format!("unable to decode manifest '{}'", path.display()),
            err.into(),
        )
    })?;
    validate_manifest(&manifest, reference)?;
    Ok(manifest)
}

fn validate_manifest(manifest: &LegacyManifest, reference: &str) -> Result<()> {
    if manifest.len() > 1 {
        return Err(Error::UnsupportedImage {
            reference: reference.to_string(),
            reason: "cannot handle multi-manifest images".into(),
        });
    }
    if manifest.is_empty() || manifest[0].layers.is_empty() {
        return Err(Error::MalformedImage {
            reference: reference.to_string(),
            reason: "no layers in image manifest".into(),
        });
    }
    Ok(())
}

fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_parsing() {
        assert_eq!(
            parse_source("alpine").expect("bare dist"),
            ("alpine".into(), "latest".into())
        );
        assert_eq!(
            parse_source("alpine:3.18").expect("dist and tag"),
            ("alpine".into(), "3.18".into())
        );
        assert!(matches!(parse_source(""), Err(Error::InvalidSource(_))));
        assert!(matches!(parse_source("alpine:"), Err(Error::InvalidSource(_))));
        assert!(matches!(parse_source(":latest"), Err(Error::InvalidSource(_))));
    }

    #[test]
    fn manifest_validation() {
        let entry = |layers: Vec<&str>| ManifestEntry {
            config: "abc.json".into(),
            repo_tags: vec!["alpine:latest".into()],
            layers: layers.into_iter().map(String::from).collect(),
        };

        assert!(validate_manifest(&vec![entry(vec!["aaa/layer.tar"])], "x").is_ok());
        assert!(matches!(
            validate_manifest(&vec![], "x"),
            Err(Error::MalformedImage { .. })
        ));
        assert!(matches!(
            validate_manifest(&vec![entry(vec![])], "x"),
            Err(Error::MalformedImage { .. })
        ));
        assert!(matches!(
            validate_manifest(&vec![entry(vec!["a"]), entry(vec!["b"])], "x"),
            Err(Error::UnsupportedImage { .. })
        ));
    }

    #[test]
    fn digest_prefix_is_stripped() {
        assert_eq!(digest_hex("sha256:abcdef"), "abcdef");
        assert_eq!(digest_hex("abcdef"), "abcdef");
    }

    #[test]
    fn index_survives_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lib = dir.path().join("lib");
        let tmp = dir.path().join("tmp");
        {
            let store = Store::new(&lib, &tmp).expect("store");
            store
                .record("alpine", "latest", "aaaaaaaaaaaabbbbbbbbbbbb")
                .expect("record");
            store
                .record("alpine", "3.18", "aaaaaaaaaaaabbbbbbbbbbbb")
                .expect("record alias");
        }
        let store = Store::new(&lib, &tmp).expect("reload");
        assert_eq!(
            store.cached_sha("alpine", "latest").as_deref(),
            Some("aaaaaaaaaaaabbbbbbbbbbbb")
        );
        assert!(store.sha_known("alpine", "aaaaaaaaaaaabbbbbbbbbbbb"));
        assert!(!store.sha_known("debian", "aaaaaaaaaaaabbbbbbbbbbbb"));
        assert_eq!(store.cached_sha("alpine", "edge"), None);
    }

    #[tokio::test]
    async fn cached_images_resolve_without_refetching() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path().join("lib"), dir.path().join("tmp")).expect("store");

        // lay down a cached image by hand: index entry plus manifest.json
        let sha = "0123456789abcdef0123456789abcdef";
        let layer = format!("{}/layer.tar", "a".repeat(64));
        let image_dir = store.image_dir(short_sha(sha));
        fs::create_dir_all(&image_dir).expect("image dir");
        let manifest = vec![ManifestEntry {
            config: format!("{}.json", short_sha(sha)),
            repo_tags: vec!["alpine:3.18".into()],
            layers: vec![layer.clone()],
        }];
        fs::write(
            image_dir.join("manifest.json"),
            serde_json::to_vec(&manifest).expect("encode"),
        )
        .expect("write manifest");
        store.record("alpine", "3.18", sha).expect("record");

        // no registry is reachable from here, so both calls must hit the cache
        let first = store.get_image("alpine:3.18").await.expect("first");
        let second = store.get_image("alpine:3.18").await.expect("second");
        assert_eq!(first.sha, sha);
        assert_eq!(first.sha, second.sha);
        assert_eq!(first.layers, vec![layer]);
        assert_eq!(first.short_sha(), "0123456789ab");
    }

    #[test]
    fn legacy_package_round_trips_through_untar() {
        let dir = tempfile::tempdir().expect("tempdir");

        // a one-file rootfs slice as the single layer
        let mut layer = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        let content = b"root:x:0:0::/root:/bin/sh\n";
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        layer
            .append_data(&mut header, "etc/passwd", &content[..])
            .expect("layer entry");
        let layer_bytes = layer.into_inner().expect("layer");

        let sha = "deadbeefdeadbeefdeadbeef";
        let digest = "f".repeat(64);
        save_legacy(
            dir.path(),
            "alpine:latest",
            sha,
            b"{\"architecture\":\"amd64\"}",
            &[(digest.clone(), false, layer_bytes)],
        )
        .expect("save");

        let out = dir.path().join("unpacked");
        fs::create_dir(&out).expect("mkdir");
        untar(&dir.path().join(PACKAGE_FILE_NAME), &out).expect("untar package");

        let manifest = parse_manifest(&out.join("manifest.json"), "alpine:latest").expect("manifest");
        assert_eq!(manifest[0].config, format!("{sha}.json"));
        assert_eq!(manifest[0].layers, vec![format!("{digest}/layer.tar")]);
        assert!(out.join(format!("{sha}.json")).exists());

        let fs_dir = out.join("layerfs");
        fs::create_dir(&fs_dir).expect("mkdir");
        untar(&out.join(&manifest[0].layers[0]), &fs_dir).expect("untar layer");
        assert_eq!(
            fs::read(fs_dir.join("etc/passwd")).expect("read"),
            content
        );
    }
}
