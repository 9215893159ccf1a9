//! Compute fleet — the elastic group of instances running worker agents.
//!
//! - `boot` — metadata contract between the engine and a booting instance
//! - `local` — in-process fleet running each instance as a tokio task
//!
//! Membership changes come in two distinct flavours on `ComputeFleet`:
//! `delete_self` (voluntary: the group's target size shrinks by one) and
//! `replace_instance` (involuntary loss: auto-healing keeps the target).

pub mod boot;
pub mod local;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FleetError;

pub use boot::WorkerBoot;
pub use local::LocalFleet;

/// A GPU or other accelerator attached to every instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accelerator {
    pub kind: String,
    pub count: u32,
}

/// Everything needed to boot one worker instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceTemplate {
    pub name: String,
    pub image: String,
    pub machine_type: String,
    pub preemptible: bool,
    pub accelerators: Vec<Accelerator>,
    /// Entry point; replaces whatever default the image declares.
    pub command: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Elastic group request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    pub name: String,
    pub template: String,
    pub target_size: u32,
    /// Replace instances lost involuntarily (preemption, crash).
    pub auto_healing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    /// The worker process exited but the instance was not deleted.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub name: String,
    pub status: InstanceStatus,
}

/// Point-in-time view of a group. Not atomic with concurrent scale changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetStatus {
    pub group: String,
    pub target_size: u32,
    pub instances: Vec<InstanceInfo>,
    pub observed_at: DateTime<Utc>,
}

impl FleetStatus {
    pub fn running(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Running)
            .count()
    }
}

/// Compute-fleet control plane.
#[async_trait]
pub trait ComputeFleet: Send + Sync {
    async fn create_template(&self, template: &InstanceTemplate) -> Result<(), FleetError>;

    /// Fails while a group still uses the template.
    async fn delete_template(&self, name: &str) -> Result<(), FleetError>;

    /// Create a group and boot `target_size` instances from its template.
    async fn create_group(&self, spec: &GroupSpec) -> Result<(), FleetError>;

    /// Delete a group and all of its instances.
    async fn delete_group(&self, name: &str) -> Result<(), FleetError>;

    /// `None` when the group does not exist.
    async fn describe_group(&self, name: &str) -> Result<Option<FleetStatus>, FleetError>;

    /// Voluntary scale-down: remove `instance` and lower the target size by one.
    async fn delete_self(&self, group: &str, instance: &str) -> Result<(), FleetError>;

    /// Involuntary loss: drop `instance` and, with auto-healing, boot a
    /// replacement so the target size is unchanged.
    async fn replace_instance(&self, group: &str, instance: &str) -> Result<(), FleetError>;
}
