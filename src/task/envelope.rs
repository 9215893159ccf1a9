//! Task envelope — the unit of work carried through the broker.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;
use crate::task::uri::ObjectUri;

/// A (local relative path, remote URI) pair.
///
/// Serialized as a two-element array so the wire format stays
/// `[["in.txt", "mem://bucket/seed.txt"]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMapping(pub String, pub String);

impl FileMapping {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self(local.into(), remote.into())
    }

    pub fn local(&self) -> &str {
        &self.0
    }

    pub fn remote(&self) -> &str {
        &self.1
    }
}

impl<L: Into<String>, R: Into<String>> From<(L, R)> for FileMapping {
    fn from((local, remote): (L, R)) -> Self {
        Self::new(local, remote)
    }
}

/// Serialized task description: a shell script plus staged files.
///
/// Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub script: String,
    #[serde(default)]
    pub inputs: Vec<FileMapping>,
    #[serde(default)]
    pub outputs: Vec<FileMapping>,
}

impl TaskEnvelope {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_input(mut self, local: impl Into<String>, remote: impl Into<String>) -> Self {
        self.inputs.push(FileMapping::new(local, remote));
        self
    }

    pub fn with_output(mut self, local: impl Into<String>, remote: impl Into<String>) -> Self {
        self.outputs.push(FileMapping::new(local, remote));
        self
    }

    /// Check every mapping: local paths confined, remote URIs parseable.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        for mapping in self.inputs.iter().chain(self.outputs.iter()) {
            confined_path(mapping.local())?;
            mapping.remote().parse::<ObjectUri>()?;
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and validate a broker payload.
    pub fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self = serde_json::from_slice(payload)?;
        envelope.validate()?;
        Ok(envelope)
    }
}

/// Check that `local` is a relative path that cannot leave its base directory.
///
/// Purely lexical; never touches the filesystem.
pub fn confined_path(local: &str) -> Result<PathBuf, EnvelopeError> {
    if local.trim().is_empty() {
        return Err(EnvelopeError::EmptyPath);
    }

    let path = Path::new(local);
    let mut confined = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => confined.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(EnvelopeError::Traversal(local.to_string())),
            Component::RootDir | Component::Prefix(_) => {
                return Err(EnvelopeError::AbsolutePath(local.to_string()));
            }
        }
    }

    if confined.as_os_str().is_empty() {
        return Err(EnvelopeError::EmptyPath);
    }
    Ok(confined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_uses_pairs() {
        let envelope = TaskEnvelope::new("wc in.txt > out.txt")
            .with_input("in.txt", "mem://bucket/seed.txt")
            .with_output("out.txt", "mem://bucket/result.txt");
        let json: serde_json::Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "script": "wc in.txt > out.txt",
                "inputs": [["in.txt", "mem://bucket/seed.txt"]],
                "outputs": [["out.txt", "mem://bucket/result.txt"]],
            })
        );
    }

    #[test]
    fn decode_accepts_missing_mappings() {
        let envelope = TaskEnvelope::decode(br#"{"script": "true"}"#).unwrap();
        assert!(envelope.inputs.is_empty());
        assert!(envelope.outputs.is_empty());
    }

    #[test]
    fn decode_rejects_traversal() {
        let payload = br#"{"script": "true", "inputs": [["../etc/passwd", "mem://b/k"]], "outputs": []}"#;
        assert!(matches!(
            TaskEnvelope::decode(payload),
            Err(EnvelopeError::Traversal(_))
        ));
    }

    #[test]
    fn confined_path_cases() {
        assert_eq!(confined_path("a/./b.txt").unwrap(), PathBuf::from("a/b.txt"));
        assert!(matches!(confined_path("a/../../x"), Err(EnvelopeError::Traversal(_))));
        assert!(matches!(confined_path("a/.."), Err(EnvelopeError::Traversal(_))));
        assert!(matches!(confined_path("/abs"), Err(EnvelopeError::AbsolutePath(_))));
        assert!(matches!(confined_path(""), Err(EnvelopeError::EmptyPath)));
        assert!(matches!(confined_path("."), Err(EnvelopeError::EmptyPath)));
    }

    #[test]
    fn validate_rejects_bad_uri() {
        let envelope = TaskEnvelope::new("true").with_output("out", "not-a-uri");
        assert!(matches!(
            envelope.validate(),
            Err(EnvelopeError::InvalidUri { .. })
        ));
    }
}
