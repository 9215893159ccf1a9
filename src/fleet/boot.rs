//! Instance boot contract.
//!
//! The engine writes these keys into the instance template metadata; each
//! instance exposes them to the worker as `TURBINE_*` environment variables.

use std::collections::BTreeMap;

use crate::config::parse_bool;
use crate::error::ConfigError;
use crate::queue::QueueResource;

pub const META_FLEET: &str = "turbine-fleet";
pub const META_GROUP: &str = "turbine-group";
pub const META_TOPIC: &str = "turbine-topic";
pub const META_SUBSCRIPTION: &str = "turbine-subscription";
pub const META_DELETE_WHEN_DONE: &str = "turbine-delete-when-done";

/// What a worker needs to know about itself at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerBoot {
    /// Engine name; tags every log line.
    pub fleet: String,
    pub group: String,
    pub instance: String,
    pub queue: QueueResource,
    pub delete_when_done: bool,
}

impl WorkerBoot {
    /// Metadata map stored on the instance template. The instance name is
    /// not part of it; each instance learns its own name at boot.
    pub fn to_metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (META_FLEET.to_string(), self.fleet.clone()),
            (META_GROUP.to_string(), self.group.clone()),
            (META_TOPIC.to_string(), self.queue.topic.clone()),
            (META_SUBSCRIPTION.to_string(), self.queue.subscription.clone()),
            (
                META_DELETE_WHEN_DONE.to_string(),
                self.delete_when_done.to_string(),
            ),
        ])
    }

    pub fn from_metadata(
        metadata: &BTreeMap<String, String>,
        instance: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            metadata
                .get(key)
                .cloned()
                .ok_or_else(|| ConfigError::MissingMetadata(key.to_string()))
        };
        Self::assemble(
            get(META_FLEET)?,
            get(META_GROUP)?,
            instance.into(),
            get(META_TOPIC)?,
            get(META_SUBSCRIPTION)?,
            metadata.get(META_DELETE_WHEN_DONE).map(String::as_str),
        )
    }

    /// Read `TURBINE_FLEET`, `TURBINE_GROUP`, `TURBINE_INSTANCE`,
    /// `TURBINE_TOPIC`, `TURBINE_SUBSCRIPTION` and `TURBINE_DELETE_WHEN_DONE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let get = |key: &str| {
            std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
        };
        let delete_when_done = std::env::var("TURBINE_DELETE_WHEN_DONE").ok();
        Self::assemble(
            get("TURBINE_FLEET")?,
            get("TURBINE_GROUP")?,
            get("TURBINE_INSTANCE")?,
            get("TURBINE_TOPIC")?,
            get("TURBINE_SUBSCRIPTION")?,
            delete_when_done.as_deref(),
        )
    }

    fn assemble(
        fleet: String,
        group: String,
        instance: String,
        topic: String,
        subscription: String,
        delete_when_done: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let delete_when_done = match delete_when_done {
            None => true,
            Some(raw) => parse_bool(raw).ok_or_else(|| ConfigError::InvalidValue {
                key: META_DELETE_WHEN_DONE.to_string(),
                message: format!("expected a boolean, got {raw:?}"),
            })?,
        };
        Ok(Self {
            fleet,
            group,
            instance,
            queue: QueueResource {
                topic,
                subscription,
            },
            delete_when_done,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot() -> WorkerBoot {
        WorkerBoot {
            fleet: "demo".into(),
            group: "demo-group".into(),
            instance: String::new(),
            queue: QueueResource::for_name("demo"),
            delete_when_done: false,
        }
    }

    #[test]
    fn metadata_carries_queue_and_flag() {
        let meta = boot().to_metadata();
        assert_eq!(meta[META_TOPIC], "demo-topic");
        assert_eq!(meta[META_SUBSCRIPTION], "demo-sub");
        assert_eq!(meta[META_DELETE_WHEN_DONE], "false");

        let parsed = WorkerBoot::from_metadata(&meta, "demo-group-0").unwrap();
        assert_eq!(parsed.instance, "demo-group-0");
        assert_eq!(parsed.queue, QueueResource::for_name("demo"));
        assert!(!parsed.delete_when_done);
    }

    #[test]
    fn delete_when_done_defaults_to_true() {
        let mut meta = boot().to_metadata();
        meta.remove(META_DELETE_WHEN_DONE);
        assert!(WorkerBoot::from_metadata(&meta, "i").unwrap().delete_when_done);
    }

    #[test]
    fn missing_key_is_reported() {
        let mut meta = boot().to_metadata();
        meta.remove(META_SUBSCRIPTION);
        let err = WorkerBoot::from_metadata(&meta, "i").unwrap_err();
        assert!(matches!(err, ConfigError::MissingMetadata(k) if k == META_SUBSCRIPTION));
    }

    #[test]
    fn bad_flag_is_rejected() {
        let mut meta = boot().to_metadata();
        meta.insert(META_DELETE_WHEN_DONE.into(), "sometimes".into());
        assert!(matches!(
            WorkerBoot::from_metadata(&meta, "i"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
