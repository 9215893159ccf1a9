//! Object store interface and scheme routing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StagingError;
use crate::task::ObjectUri;

/// Minimal object storage used by staging.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a whole object.
    async fn get(&self, uri: &ObjectUri) -> Result<Vec<u8>, StagingError>;

    /// Create or replace an object.
    async fn put(&self, uri: &ObjectUri, data: Vec<u8>) -> Result<(), StagingError>;
}

/// Dispatches to a backend by URI scheme.
#[derive(Default, Clone)]
pub struct StoreRouter {
    backends: HashMap<String, Arc<dyn ObjectStore>>,
}

impl StoreRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, scheme: &str, store: Arc<dyn ObjectStore>) -> Self {
        self.backends.insert(scheme.to_ascii_lowercase(), store);
        self
    }

    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    fn backend(&self, uri: &ObjectUri) -> Result<&Arc<dyn ObjectStore>, StagingError> {
        self.backends
            .get(uri.scheme())
            .ok_or_else(|| StagingError::UnsupportedScheme(uri.scheme().to_string()))
    }
}

#[async_trait]
impl ObjectStore for StoreRouter {
    async fn get(&self, uri: &ObjectUri) -> Result<Vec<u8>, StagingError> {
        self.backend(uri)?.get(uri).await
    }

    async fn put(&self, uri: &ObjectUri, data: Vec<u8>) -> Result<(), StagingError> {
        self.backend(uri)?.put(uri, data).await
    }
}
