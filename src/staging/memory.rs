//! In-memory object store for `mem://` URIs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StagingError;
use crate::staging::store::ObjectStore;
use crate::task::ObjectUri;

/// Objects keyed by (bucket, key).
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly, bypassing URI parsing.
    pub async fn insert(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>) {
        self.objects
            .write()
            .await
            .insert((bucket.to_string(), key.to_string()), data.into());
    }

    /// Read an object as UTF-8 text, if present.
    pub async fn get_text(&self, bucket: &str, key: &str) -> Option<String> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }

    /// All keys in `bucket`, sorted.
    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .await
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, uri: &ObjectUri) -> Result<Vec<u8>, StagingError> {
        self.objects
            .read()
            .await
            .get(&(uri.bucket().to_string(), uri.key().to_string()))
            .cloned()
            .ok_or_else(|| StagingError::ObjectNotFound {
                uri: uri.to_string(),
            })
    }

    async fn put(&self, uri: &ObjectUri, data: Vec<u8>) -> Result<(), StagingError> {
        if uri.key().is_empty() {
            return Err(StagingError::Transfer {
                uri: uri.to_string(),
                reason: "object key is empty".to_string(),
            });
        }
        self.objects
            .write()
            .await
            .insert((uri.bucket().to_string(), uri.key().to_string()), data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get() {
        let store = InMemoryObjectStore::new();
        let uri: ObjectUri = "mem://bucket/a/b.txt".parse().unwrap();
        store.put(&uri, b"hello".to_vec()).await.unwrap();
        assert_eq!(store.get(&uri).await.unwrap(), b"hello");
        assert_eq!(store.keys("bucket").await, vec!["a/b.txt"]);
    }

    #[tokio::test]
    async fn missing_object() {
        let store = InMemoryObjectStore::new();
        let uri: ObjectUri = "mem://bucket/nope".parse().unwrap();
        assert!(matches!(
            store.get(&uri).await,
            Err(StagingError::ObjectNotFound { .. })
        ));
    }
}
