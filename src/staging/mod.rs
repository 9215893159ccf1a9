//! Staging — moves declared files between a task's working directory and
//! remote object storage.
//!
//! Every local path is checked for confinement before the first transfer,
//! so a bad mapping never causes partial filesystem or network activity.
//! - `stage_in` is all-or-nothing: the first failed fetch aborts.
//! - `stage_out` is best-effort: each item is reported, none is fatal.

pub mod local;
pub mod memory;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{EnvelopeError, StagingError};
use crate::task::{FileMapping, ObjectUri, confined_path};

pub use local::LocalObjectStore;
pub use memory::InMemoryObjectStore;
pub use store::{ObjectStore, StoreRouter};

/// Outcome of one `stage_out` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StageOutReport {
    /// Remote URIs written.
    pub uploaded: Vec<String>,
    /// Declared local paths that did not exist after the script ran.
    pub missing: Vec<String>,
    /// (local path, reason) for uploads that failed.
    pub failed: Vec<(String, String)>,
}

impl StageOutReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.failed.is_empty()
    }
}

/// A mapping whose local side passed confinement and remote side parsed.
struct Resolved<'a> {
    mapping: &'a FileMapping,
    relative: PathBuf,
    uri: ObjectUri,
}

fn resolve_all(mappings: &[FileMapping]) -> Result<Vec<Resolved<'_>>, EnvelopeError> {
    mappings
        .iter()
        .map(|mapping| {
            Ok::<_, EnvelopeError>(Resolved {
                mapping,
                relative: confined_path(mapping.local())?,
                uri: mapping.remote().parse()?,
            })
        })
        .collect()
}

/// Staging protocol over an object store.
#[derive(Clone)]
pub struct Stager {
    store: Arc<dyn ObjectStore>,
    transfer_timeout: Duration,
}

impl Stager {
    pub fn new(store: Arc<dyn ObjectStore>, transfer_timeout: Duration) -> Self {
        Self {
            store,
            transfer_timeout,
        }
    }

    /// Fetch every input into `working_dir`. Fails on the first error.
    pub async fn stage_in(
        &self,
        working_dir: &Path,
        inputs: &[FileMapping],
    ) -> Result<(), StagingError> {
        let resolved = resolve_all(inputs)?;

        for item in resolved {
            let target = working_dir.join(&item.relative);
            let data = tokio::time::timeout(self.transfer_timeout, self.store.get(&item.uri))
                .await
                .map_err(|_| StagingError::Timeout {
                    uri: item.uri.to_string(),
                    timeout: self.transfer_timeout,
                })??;

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&target, &data).await?;
            debug!(
                path = %item.mapping.local(),
                uri = %item.uri,
                bytes = data.len(),
                "Staged input"
            );
        }
        Ok(())
    }

    /// Upload every declared output that exists. Directories are uploaded
    /// recursively under the remote prefix.
    pub async fn stage_out(
        &self,
        working_dir: &Path,
        outputs: &[FileMapping],
    ) -> Result<StageOutReport, StagingError> {
        let resolved = resolve_all(outputs)?;
        let root = fs::canonicalize(working_dir).await?;
        let mut report = StageOutReport::default();

        for item in resolved {
            let local = item.mapping.local().to_string();
            let path = root.join(&item.relative);

            let canonical = match fs::canonicalize(&path).await {
                Ok(p) => p,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(path = %local, "Declared output missing, skipping");
                    report.missing.push(local);
                    continue;
                }
                Err(e) => {
                    warn!(path = %local, error = %e, "Cannot resolve output");
                    report.failed.push((local, e.to_string()));
                    continue;
                }
            };
            if !canonical.starts_with(&root) {
                warn!(path = %local, "Output resolves outside the working directory, skipping");
                report
                    .failed
                    .push((local, "escapes working directory".to_string()));
                continue;
            }

            let files = match collect_files(&canonical).await {
                Ok(files) => files,
                Err(e) => {
                    warn!(path = %local, error = %e, "Cannot list output");
                    report.failed.push((local, e.to_string()));
                    continue;
                }
            };

            for (file, suffix) in files {
                let uri = match &suffix {
                    Some(rel) => item.uri.join(rel),
                    None => item.uri.clone(),
                };
                match self.upload(&file, &uri).await {
                    Ok(bytes) => {
                        debug!(path = %file.display(), uri = %uri, bytes, "Uploaded output");
                        report.uploaded.push(uri.to_string());
                    }
                    Err(e) => {
                        warn!(path = %file.display(), uri = %uri, error = %e, "Output upload failed");
                        report.failed.push((local.clone(), e.to_string()));
                    }
                }
            }
        }

        info!(
            uploaded = report.uploaded.len(),
            missing = report.missing.len(),
            failed = report.failed.len(),
            "Output staging finished"
        );
        Ok(report)
    }

    async fn upload(&self, file: &Path, uri: &ObjectUri) -> Result<usize, StagingError> {
        let data = fs::read(file).await?;
        let bytes = data.len();
        tokio::time::timeout(self.transfer_timeout, self.store.put(uri, data))
            .await
            .map_err(|_| StagingError::Timeout {
                uri: uri.to_string(),
                timeout: self.transfer_timeout,
            })??;
        Ok(bytes)
    }
}

/// Files under `path` with their '/'-joined path relative to it.
/// A plain file yields itself with no suffix. Symlinks inside directories
/// are not followed.
async fn collect_files(path: &Path) -> std::io::Result<Vec<(PathBuf, Option<String>)>> {
    let metadata = fs::metadata(path).await?;
    if !metadata.is_dir() {
        return Ok(vec![(path.to_path_buf(), None)]);
    }

    let mut files = Vec::new();
    let mut pending = vec![(path.to_path_buf(), String::new())];
    while let Some((dir, prefix)) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push((entry.path(), rel));
            } else if file_type.is_file() {
                files.push((entry.path(), Some(rel)));
            }
        }
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}
