//! Tarball acquisition pipeline.
//!
//! Three strategies race to put a tarball on disk: registry metadata plus an
//! HTTP download, `<pm> view <spec> dist.tarball` plus an HTTP download, and
//! `<pm> pack <spec>`. The winner is extracted and the manifest-selected
//! entry point is read. Each attempt gets its own [`TempWorkspace`], shared
//! with every strategy so a detached loser keeps the directory alive until it
//! finishes.

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::ResolverConfig;
use crate::error::{AggregateError, FetchError, Result};
use crate::integrity::ExpectedDigest;
use crate::manifest::PackageManifest;
use crate::process::{run_checked, CommandRunner};
use crate::race::{race_ok, Candidate};
use crate::request::{sanitize, FetchPolicy};
use crate::transport::HttpClient;
use crate::workspace::TempWorkspace;

pub const STRATEGY_REGISTRY: &str = "registry";
pub const STRATEGY_PACKAGE_MANAGER: &str = "package-manager";
pub const STRATEGY_PACK: &str = "pack";

/// Where a registry says the tarball lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarballRef {
    pub url: String,
    pub digest: Option<ExpectedDigest>,
}

#[derive(Debug, Deserialize)]
struct DistMetadata {
    #[serde(default)]
    tarball: String,
    integrity: Option<String>,
    shasum: Option<String>,
}

/// Parse registry metadata, tolerating JSON5.
///
/// Accepts a packument (`dist-tags.latest` + `versions[latest].dist`) or a
/// single version document (`dist`).
pub fn parse_tarball_ref(body: &str) -> Result<TarballRef> {
    let doc: Value = match serde_json::from_str(body) {
        Ok(doc) => doc,
        Err(json_err) => json5::from_str(body).map_err(|e| {
            debug!("Metadata is neither JSON ({}) nor JSON5 ({})", json_err, e);
            FetchError::Json5(e.to_string())
        })?,
    };

    let dist = match doc.get("dist-tags") {
        Some(tags) => {
            let latest = tags
                .get("latest")
                .and_then(Value::as_str)
                .ok_or_else(|| FetchError::Other("metadata has no latest dist-tag".into()))?;
            doc.get("versions")
                .and_then(|v| v.get(latest))
                .and_then(|v| v.get("dist"))
                .ok_or_else(|| FetchError::Other(format!("metadata has no dist for {}", latest)))?
        }
        None => doc
            .get("dist")
            .ok_or_else(|| FetchError::Other("metadata has no dist".into()))?,
    };

    let dist: DistMetadata = serde_json::from_value(dist.clone())?;
    let url = dist.tarball.trim();
    if url.is_empty() {
        return Err(FetchError::EmptyTarballUrl("registry metadata".into()));
    }

    Ok(TarballRef {
        url: url.to_string(),
        digest: ExpectedDigest::from_dist(dist.integrity.as_deref(), dist.shasum.as_deref()),
    })
}

/// Locates, downloads and extracts package tarballs.
#[derive(Clone)]
pub struct TarballPipeline {
    http: HttpClient,
    runner: Arc<dyn CommandRunner>,
    registries: Arc<[String]>,
    package_manager: String,
    temp_root: PathBuf,
}

impl TarballPipeline {
    pub fn new(http: HttpClient, runner: Arc<dyn CommandRunner>, config: &ResolverConfig) -> Self {
        Self {
            http,
            runner,
            registries: config.registry_mirrors.clone().into(),
            package_manager: config.package_manager.clone(),
            temp_root: config.temp_root(),
        }
    }

    /// Resolve `name@version` to the text of its entry point for `output`.
    #[instrument(skip(self, policy))]
    pub async fn acquire(
        &self,
        name: &str,
        version: &str,
        output: Option<&str>,
        policy: FetchPolicy,
    ) -> Result<String> {
        let spec = format!("{}@{}", name, version);
        let dir_name = sanitize(&spec);
        let attempts = policy.attempts();
        let mut last = AggregateError::new();

        for attempt in 1..=attempts {
            let workspace = Arc::new(TempWorkspace::create(&self.temp_root, &dir_name).await?);

            match self.locate(name, version, &workspace, policy).await {
                Ok(tgz) => {
                    info!("Tarball for {} ready at {}", spec, tgz.display());
                    return read_entry_point(&workspace, &tgz, output).await;
                }
                Err(agg) => {
                    warn!(
                        "Tarball attempt {}/{} for {} failed: {}",
                        attempt, attempts, spec, agg
                    );
                    last = agg;
                }
            }
        }

        Err(FetchError::TarballAcquisition {
            package: spec,
            attempts,
            last,
        })
    }

    /// Race the three strategies for a tarball path.
    async fn locate(
        &self,
        name: &str,
        version: &str,
        workspace: &Arc<TempWorkspace>,
        policy: FetchPolicy,
    ) -> std::result::Result<PathBuf, AggregateError> {
        let spec = format!("{}@{}", name, version);
        let timeout = policy.timeout;
        let file_stem = sanitize(name);

        let registry = {
            let this = self.clone();
            let ws = Arc::clone(workspace);
            let (name, version, spec, stem) =
                (name.to_string(), version.to_string(), spec.clone(), file_stem.clone());
            async move {
                let dir = ws.subdir("http").await?;
                let tarball = this.tarball_from_registries(&name, &version, timeout).await?;
                let dest = dir.join(format!("{}-{}.tgz", stem, version));
                this.download_verified(&spec, &tarball, &dest, timeout).await?;
                Ok::<_, FetchError>(dest)
            }
        };

        let package_manager = {
            let this = self.clone();
            let ws = Arc::clone(workspace);
            let (spec, stem) = (spec.clone(), file_stem.clone());
            async move {
                let dir = ws.subdir("npm").await?;
                let url = this.tarball_from_package_manager(&spec, timeout).await?;
                let dest = dir.join(format!("{}.tgz", stem));
                this.http.download_to(&url, &dest, timeout).await?;
                Ok::<_, FetchError>(dest)
            }
        };

        let pack = {
            let this = self.clone();
            let ws = Arc::clone(workspace);
            let (spec, stem) = (spec.clone(), file_stem.clone());
            async move {
                let dir = ws.subdir("pack").await?;
                this.pack(&spec, &stem, &dir, timeout).await
            }
        };

        race_ok(vec![
            Candidate::new(STRATEGY_REGISTRY, registry),
            Candidate::new(STRATEGY_PACKAGE_MANAGER, package_manager),
            Candidate::new(STRATEGY_PACK, pack),
        ])
        .await
    }

    /// Race every registry mirror for the tarball reference.
    async fn tarball_from_registries(&self, name: &str, version: &str, timeout: Duration) -> Result<TarballRef> {
        let candidates = self
            .registries
            .iter()
            .map(|registry| {
                let url = format!("{}/{}/{}", registry.trim_end_matches('/'), name, version);
                let http = self.http.clone();
                let label = url.clone();
                Candidate::new(label, async move {
                    let body = http.get_metadata(&url, "application/json", timeout).await?;
                    parse_tarball_ref(&body)
                })
            })
            .collect();

        Ok(race_ok(candidates).await?)
    }

    async fn download_verified(&self, spec: &str, tarball: &TarballRef, dest: &Path, timeout: Duration) -> Result<()> {
        self.http.download_to(&tarball.url, dest, timeout).await?;

        if let Some(digest) = &tarball.digest {
            let data = tokio::fs::read(dest).await?;
            digest.verify(spec, &data)?;
        }
        Ok(())
    }

    /// `<pm> view <spec> dist.tarball`
    async fn tarball_from_package_manager(&self, spec: &str, timeout: Duration) -> Result<String> {
        let args = vec!["view".to_string(), spec.to_string(), "dist.tarball".to_string()];
        let output = with_timeout(
            timeout,
            run_checked(self.runner.as_ref(), &self.package_manager, &args, None),
        )
        .await?;

        let url = output.stdout.trim();
        if url.is_empty() {
            return Err(FetchError::EmptyTarballUrl(spec.to_string()));
        }

        let parsed = url::Url::parse(url)
            .map_err(|e| FetchError::Other(format!("invalid tarball URL '{}': {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::Other(format!("unsupported tarball URL '{}'", url)));
        }

        Ok(url.to_string())
    }

    /// `<pm> pack <spec>` inside `dir`, then find the produced archive.
    async fn pack(&self, spec: &str, stem: &str, dir: &Path, timeout: Duration) -> Result<PathBuf> {
        let args = vec!["pack".to_string(), spec.to_string()];
        with_timeout(
            timeout,
            run_checked(self.runner.as_ref(), &self.package_manager, &args, Some(dir)),
        )
        .await?;

        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.contains(stem) && file_name.ends_with(".tgz") {
                return Ok(entry.path());
            }
        }

        Err(FetchError::TarballNotFound {
            package: spec.to_string(),
            dir: dir.to_path_buf(),
        })
    }
}

async fn with_timeout<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| FetchError::Timeout(timeout.as_millis() as u64))?
}

/// Extract `tgz` into the workspace and read the selected entry point.
async fn read_entry_point(workspace: &TempWorkspace, tgz: &Path, output: Option<&str>) -> Result<String> {
    let package_dir = workspace.package_dir();

    {
        let archive = tgz.to_path_buf();
        let dest = package_dir.clone();
        tokio::task::spawn_blocking(move || extract_tarball(&archive, &dest))
            .await
            .map_err(|e| FetchError::Extraction {
                path: tgz.to_path_buf(),
                reason: e.to_string(),
            })??;
    }

    let manifest = PackageManifest::read(package_dir.join("package.json"))?;
    let entry = manifest.entry_point(output);
    let path = entry_path(&package_dir, &entry)?;
    debug!("Reading entry point {}", path.display());

    tokio::fs::read_to_string(&path)
        .await
        .map_err(|source| FetchError::EntryPointRead { path, source })
}

/// Join a manifest entry onto the package directory without leaving it.
fn entry_path(package_dir: &Path, entry: &str) -> Result<PathBuf> {
    let relative = Path::new(entry.trim_start_matches('/'));
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        let path = package_dir.join(relative);
        return Err(FetchError::EntryPointRead {
            path,
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("entry point {} leaves the package directory", entry),
            ),
        });
    }
    Ok(package_dir.join(relative))
}

/// Unpack a gzipped tarball into `dest_path`, dropping the top-level directory.
pub fn extract_tarball(tarball_path: &Path, dest_path: &Path) -> Result<()> {
    use flate2::read::GzDecoder;
    use tar::Archive;

    debug!(
        "Extracting {} to {}",
        tarball_path.display(),
        dest_path.display()
    );

    let extraction_error = |reason: String| FetchError::Extraction {
        path: tarball_path.to_path_buf(),
        reason,
    };

    let file = std::fs::File::open(tarball_path).map_err(|e| extraction_error(e.to_string()))?;
    let mut archive = Archive::new(GzDecoder::new(file));

    std::fs::create_dir_all(dest_path)?;

    let entries = archive.entries().map_err(|e| extraction_error(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| extraction_error(e.to_string()))?;
        let path = entry.path().map_err(|e| extraction_error(e.to_string()))?;

        let stripped_path: PathBuf = path.components().skip(1).collect();
        if stripped_path.as_os_str().is_empty() {
            continue;
        }
        if stripped_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            warn!("Skipping suspicious archive entry {}", stripped_path.display());
            continue;
        }

        let dest_file = dest_path.join(&stripped_path);

        if let Some(parent) = dest_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        entry
            .unpack(&dest_file)
            .map_err(|e| extraction_error(e.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_path_stays_inside_package() {
        let dir = Path::new("/tmp/ws/package");
        assert_eq!(entry_path(dir, "./lib/index.js").unwrap(), dir.join("./lib/index.js"));
        assert_eq!(entry_path(dir, "/index.js").unwrap(), dir.join("index.js"));

        for entry in ["../secret.js", "lib/../../secret.js"] {
            match entry_path(dir, entry) {
                Err(FetchError::EntryPointRead { source, .. }) => {
                    assert_eq!(source.kind(), std::io::ErrorKind::InvalidInput)
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_parse_version_document() {
        let tarball = parse_tarball_ref(
            r#"{"name":"left-pad","version":"1.3.0","dist":{"tarball":"https://r.test/left-pad-1.3.0.tgz","shasum":"abc"}}"#,
        )
        .unwrap();
        assert_eq!(tarball.url, "https://r.test/left-pad-1.3.0.tgz");
        assert_eq!(tarball.digest, Some(ExpectedDigest::Shasum("abc".into())));
    }

    #[test]
    fn test_parse_packument_uses_latest() {
        let tarball = parse_tarball_ref(
            r#"{
                "dist-tags": {"latest": "2.0.0"},
                "versions": {
                    "1.0.0": {"dist": {"tarball": "https://r.test/a-1.0.0.tgz"}},
                    "2.0.0": {"dist": {"tarball": "https://r.test/a-2.0.0.tgz", "integrity": "sha512-xyz"}}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(tarball.url, "https://r.test/a-2.0.0.tgz");
        assert_eq!(tarball.digest, Some(ExpectedDigest::Sri("sha512-xyz".into())));
    }

    #[test]
    fn test_parse_json5_metadata() {
        let tarball = parse_tarball_ref(
            "{ // mirror output\n  dist: { tarball: 'https://r.test/a-1.0.0.tgz', },\n}",
        )
        .unwrap();
        assert_eq!(tarball.url, "https://r.test/a-1.0.0.tgz");
        assert_eq!(tarball.digest, None);
    }

    #[test]
    fn test_blank_tarball_is_a_failure() {
        let err = parse_tarball_ref(r#"{"dist":{"tarball":"  "}}"#).unwrap_err();
        assert!(matches!(err, FetchError::EmptyTarballUrl(_)));
        assert!(parse_tarball_ref("not metadata at all").is_err());
    }
}
