//! Remote object URIs of the form `scheme://bucket/key`.

use std::fmt;
use std::str::FromStr;

use crate::error::EnvelopeError;

/// A parsed remote object location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectUri {
    scheme: String,
    bucket: String,
    key: String,
}

impl ObjectUri {
    pub fn new(
        scheme: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Object key inside the bucket, without a leading slash. May be empty
    /// when the URI names a bucket root (valid only as an upload prefix).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// A child object of this URI, treating the key as a prefix.
    pub fn join(&self, relative: &str) -> Self {
        let relative = relative.trim_start_matches('/');
        let key = if self.key.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.key.trim_end_matches('/'), relative)
        };
        Self::new(self.scheme.clone(), self.bucket.clone(), key)
    }
}

impl FromStr for ObjectUri {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| EnvelopeError::InvalidUri {
            uri: s.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = s.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        {
            return Err(invalid("bad scheme"));
        }

        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(invalid("missing bucket"));
        }
        if key.split('/').any(|seg| seg == "..") {
            return Err(invalid("key contains '..'"));
        }

        Ok(Self::new(scheme.to_ascii_lowercase(), bucket, key))
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}
