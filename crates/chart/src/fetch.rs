//! Chart reference resolution
//!
//! A [`ChartReference`] names a chart in one of three ways:
//!
//! - `path`: a local chart directory or `.tgz` archive (wins when set)
//! - `repository: file:///dir`: `<dir>/<name>-<version>.tgz`,
//!   `<dir>/<name>-<version>/` or `<dir>/<name>/`, first match wins
//! - `repository: https://...`: a chart repository; the archive URL is read
//!   from `index.yaml`, downloaded and unpacked into the cache directory

use crate::error::ChartError;
use crate::loader::{self, Chart};
use crds::ChartReference;
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// `index.yaml` of a chart repository
#[derive(Debug, Default, Deserialize)]
struct RepositoryIndex {
    #[serde(default)]
    entries: HashMap<String, Vec<IndexEntry>>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    #[serde(default)]
    version: String,
    #[serde(default)]
    urls: Vec<String>,
}

/// Resolves chart references to loaded charts
#[derive(Debug, Clone)]
pub struct ChartFetcher {
    cache_dir: PathBuf,
    http: reqwest::Client,
}

impl ChartFetcher {
    /// Creates a fetcher unpacking archives below `cache_dir`
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Locates, downloads if needed, and loads the referenced chart
    pub async fn fetch(&self, reference: &ChartReference) -> Result<Chart, ChartError> {
        if let Some(path) = reference.path.as_deref().filter(|p| !p.is_empty()) {
            let path = PathBuf::from(path.strip_prefix("file://").unwrap_or(path));
            let fetcher = self.clone();
            return blocking(move || fetcher.load_local(&path)).await;
        }

        if reference.name.is_empty() {
            return Err(ChartError::InvalidReference(
                "chart.name is required when chart.path is not set".to_string(),
            ));
        }

        let repository = reference.repository.trim_end_matches('/');
        let local_dir = repository
            .strip_prefix("file://")
            .or_else(|| repository.starts_with('/').then_some(repository));
        if let Some(dir) = local_dir {
            let dir = PathBuf::from(dir);
            let fetcher = self.clone();
            let reference = reference.clone();
            blocking(move || fetcher.fetch_from_directory(&dir, &reference)).await
        } else if repository.starts_with("https://") || repository.starts_with("http://") {
            self.fetch_from_repository(repository, reference).await
        } else if repository.is_empty() {
            Err(ChartError::InvalidReference(format!(
                "chart {} has neither a path nor a repository",
                reference.name
            )))
        } else {
            Err(ChartError::InvalidReference(format!(
                "unsupported chart repository {repository}"
            )))
        }
    }

    fn load_local(&self, path: &Path) -> Result<Chart, ChartError> {
        if path.is_dir() {
            return loader::load_dir(path);
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if path.is_file() && (file_name.ends_with(".tgz") || file_name.ends_with(".tar.gz")) {
            let stem = file_name.trim_end_matches(".tgz").trim_end_matches(".tar.gz");
            let file = fs::File::open(path).map_err(|e| ChartError::io(path, e))?;
            // The archive may have changed since the last unpack
            return unpack(file, &self.cache_dir, &self.cache_dir.join(stem), Publish::Replace);
        }
        Err(ChartError::InvalidReference(format!(
            "{} is not a chart directory or archive",
            path.display()
        )))
    }

    fn fetch_from_directory(&self, dir: &Path, reference: &ChartReference) -> Result<Chart, ChartError> {
        let name = &reference.name;
        let version = &reference.version;
        let mut candidates = Vec::new();
        if !version.is_empty() {
            candidates.push(dir.join(format!("{name}-{version}.tgz")));
            candidates.push(dir.join(format!("{name}-{version}")));
        }
        candidates.push(dir.join(name));

        for candidate in candidates {
            if !candidate.exists() {
                continue;
            }
            debug!("Loading chart {} from {}", name, candidate.display());
            let chart = self.load_local(&candidate)?;
            if version.is_empty() || chart.metadata.version.is_empty() || &chart.metadata.version == version {
                return Ok(chart);
            }
            debug!(
                "Chart at {} has version {}, want {}",
                candidate.display(),
                chart.metadata.version,
                version
            );
        }

        Err(ChartError::NotFound {
            name: name.clone(),
            version: version.clone(),
            location: dir.display().to_string(),
        })
    }

    async fn fetch_from_repository(&self, repository: &str, reference: &ChartReference) -> Result<Chart, ChartError> {
        let index_url = format!("{repository}/index.yaml");
        let index_text = self.get(&index_url).await?.text().await.map_err(|source| ChartError::Http {
            url: index_url.clone(),
            source,
        })?;
        let index: RepositoryIndex = serde_yaml::from_str(&index_text).map_err(|source| ChartError::InvalidYaml {
            path: index_url.clone(),
            source,
        })?;

        let not_found = || ChartError::NotFound {
            name: reference.name.clone(),
            version: reference.version.clone(),
            location: repository.to_string(),
        };
        let entry = index
            .entries
            .get(&reference.name)
            .and_then(|versions| {
                versions
                    .iter()
                    .find(|e| reference.version.is_empty() || e.version == reference.version)
            })
            .ok_or_else(not_found)?;
        let archive_url = entry.urls.first().ok_or_else(not_found)?;
        let archive_url = if archive_url.contains("://") {
            archive_url.clone()
        } else {
            format!("{repository}/{}", archive_url.trim_start_matches('/'))
        };

        let destination = self.cache_dir.join(format!("{}-{}", reference.name, entry.version));
        let cached = destination.clone();
        let chart = blocking(move || match find_chart_root(&cached) {
            Some(root) => {
                debug!("Using cached chart {}", root.display());
                loader::load_dir(&root).map(Some)
            }
            None => Ok(None),
        })
        .await?;
        if let Some(chart) = chart {
            return Ok(chart);
        }

        info!("Downloading chart {} {} from {}", reference.name, entry.version, archive_url);
        let bytes = self
            .get(&archive_url)
            .await?
            .bytes()
            .await
            .map_err(|source| ChartError::Http {
                url: archive_url.clone(),
                source,
            })?;
        let cache_dir = self.cache_dir.clone();
        blocking(move || unpack(&bytes[..], &cache_dir, &destination, Publish::KeepExisting)).await
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, ChartError> {
        self.http
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|source| ChartError::Http {
                url: url.to_string(),
                source,
            })
    }
}

/// What to do when the unpack destination already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Publish {
    /// Drop the old contents first
    Replace,
    /// Keep whatever another unpack published there
    KeepExisting,
}

/// Runs filesystem and archive work off the async workers
async fn blocking<T, F>(work: F) -> Result<T, ChartError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ChartError> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

/// Unpacks a gzipped tar archive and loads the chart inside it.
///
/// The archive goes into a fresh staging directory under `cache_dir` and is
/// loaded from there, then renamed to `destination`. A reader of
/// `destination` therefore never sees a partially unpacked chart.
fn unpack(reader: impl Read, cache_dir: &Path, destination: &Path, publish: Publish) -> Result<Chart, ChartError> {
    fs::create_dir_all(cache_dir).map_err(|e| ChartError::io(cache_dir, e))?;
    let staging = TempDir::new_in(cache_dir).map_err(|e| ChartError::io(cache_dir, e))?;
    tar::Archive::new(GzDecoder::new(reader))
        .unpack(staging.path())
        .map_err(|e| ChartError::io(staging.path(), e))?;

    let relative = find_chart_root(staging.path())
        .and_then(|root| root.strip_prefix(staging.path()).ok().map(Path::to_path_buf))
        .unwrap_or_default();
    let mut chart = loader::load_dir(&staging.path().join(&relative))?;

    if publish == Publish::Replace {
        // Moved aside in one step, then deleted when `retired` drops
        let retired = TempDir::new_in(cache_dir).map_err(|e| ChartError::io(cache_dir, e))?;
        match fs::rename(destination, retired.path().join("chart")) {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(ChartError::io(destination, e)),
            _ => {}
        }
    }
    match fs::rename(staging.path(), destination) {
        Ok(()) => debug!("Unpacked chart into {}", destination.display()),
        // Lost a race with a concurrent unpack of the same archive
        Err(e) => debug!("Chart cache {} left as is: {}", destination.display(), e),
    }
    chart.root = destination.join(relative);
    Ok(chart)
}

/// `dir` itself or its first subdirectory holding a `Chart.yaml`
fn find_chart_root(dir: &Path) -> Option<PathBuf> {
    if dir.join("Chart.yaml").is_file() {
        return Some(dir.to_path_buf());
    }
    let mut subdirs: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.join("Chart.yaml").is_file())
        .collect();
    subdirs.sort();
    subdirs.into_iter().next()
}
