//! Directory-backed object store for `file://bucket/key` URIs.
//!
//! Each bucket is a directory under the store root.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;

use crate::error::StagingError;
use crate::staging::store::ObjectStore;
use crate::task::{ObjectUri, confined_path};

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, uri: &ObjectUri) -> Result<PathBuf, StagingError> {
        let bucket = confined_path(uri.bucket())?;
        let key = confined_path(uri.key())?;
        Ok(self.root.join(bucket).join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, uri: &ObjectUri) -> Result<Vec<u8>, StagingError> {
        let path = self.object_path(uri)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StagingError::ObjectNotFound {
                    uri: uri.to_string(),
                })
            }
            Err(e) => Err(StagingError::Transfer {
                uri: uri.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn put(&self, uri: &ObjectUri, data: Vec<u8>) -> Result<(), StagingError> {
        let path = self.object_path(uri)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        Ok(())
    }
}
