//! Fleet controller.
//!
//! An `Engine` owns one queue resource and at most one instance group, both
//! named after the engine. Submitting tasks and scaling the fleet are
//! independent: tasks can be queued before, during or after a fleet runs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{ConfigError, FleetError, Result};
use crate::fleet::{Accelerator, ComputeFleet, FleetStatus, GroupSpec, InstanceTemplate, WorkerBoot};
use crate::queue::{Broker, QueueClient, QueueResource};
use crate::task::{FileMapping, TaskEnvelope};

/// Parameters for `Engine::start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub count: u32,
    pub machine_type: String,
    pub preemptible: bool,
    pub accelerators: Vec<Accelerator>,
    /// Workers delete their own instance once the queue is drained.
    pub delete_when_done: bool,
}

impl StartRequest {
    pub fn new(count: u32, machine_type: impl Into<String>) -> Self {
        Self {
            count,
            machine_type: machine_type.into(),
            preemptible: false,
            accelerators: Vec::new(),
            delete_when_done: true,
        }
    }

    pub fn preemptible(mut self, preemptible: bool) -> Self {
        self.preemptible = preemptible;
        self
    }

    pub fn with_accelerator(mut self, kind: impl Into<String>, count: u32) -> Self {
        self.accelerators.push(Accelerator {
            kind: kind.into(),
            count,
        });
        self
    }

    pub fn delete_when_done(mut self, delete_when_done: bool) -> Self {
        self.delete_when_done = delete_when_done;
        self
    }
}

pub struct Engine {
    name: String,
    image: String,
    config: EngineConfig,
    queue: QueueClient,
    fleet: Arc<dyn ComputeFleet>,
}

impl Engine {
    /// Create the engine and provision its queue resource. Provisioning is
    /// idempotent: an engine re-created under the same name reuses the
    /// existing topic and subscription.
    pub async fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        broker: Arc<dyn Broker>,
        fleet: Arc<dyn ComputeFleet>,
        config: EngineConfig,
    ) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;

        let queue = QueueClient::new(broker, QueueResource::for_name(&name), config.retry);
        queue.provision(&config.redelivery).await?;

        let engine = Self {
            name,
            image: image.into(),
            config,
            queue,
            fleet,
        };
        info!(engine = %engine.name, image = %engine.image, "Engine ready");
        Ok(engine)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn queue(&self) -> &QueueClient {
        &self.queue
    }

    pub fn template_name(&self) -> String {
        format!("{}-template", self.name)
    }

    pub fn group_name(&self) -> String {
        format!("{}-group", self.name)
    }

    /// Queue one task. Paths and URIs are validated before anything is
    /// published. Returns the broker message id.
    pub async fn add_task<I, O>(
        &self,
        script: impl Into<String>,
        inputs: I,
        outputs: O,
    ) -> Result<String>
    where
        I: IntoIterator,
        I::Item: Into<FileMapping>,
        O: IntoIterator,
        O::Item: Into<FileMapping>,
    {
        let envelope = TaskEnvelope {
            script: script.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
        };
        self.submit(&envelope).await
    }

    /// Queue a prepared envelope.
    pub async fn submit(&self, envelope: &TaskEnvelope) -> Result<String> {
        envelope.validate()?;
        let id = self.queue.publish(envelope).await?;
        debug!(message_id = %id, "Task queued");
        Ok(id)
    }

    /// Queue many envelopes. Stops at the first failure; envelopes before it
    /// stay queued.
    pub async fn add_tasks(
        &self,
        envelopes: impl IntoIterator<Item = TaskEnvelope>,
    ) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for envelope in envelopes {
            ids.push(self.submit(&envelope).await?);
        }
        info!(count = ids.len(), "Tasks queued");
        Ok(ids)
    }

    /// Create the instance template and an auto-healing group of
    /// `request.count` workers. Partially created resources are not rolled
    /// back on failure; `stop()` removes whatever exists.
    pub async fn start(&self, request: &StartRequest) -> Result<()> {
        if request.count == 0 {
            return Err(FleetError::InvalidRequest(
                "worker count must be at least 1".to_string(),
            )
            .into());
        }

        let group = self.group_name();
        let boot = WorkerBoot {
            fleet: self.name.clone(),
            group: group.clone(),
            instance: String::new(),
            queue: self.queue.resource().clone(),
            delete_when_done: request.delete_when_done,
        };
        let template = InstanceTemplate {
            name: self.template_name(),
            image: self.image.clone(),
            machine_type: request.machine_type.clone(),
            preemptible: request.preemptible,
            accelerators: request.accelerators.clone(),
            command: self.config.worker_command.clone(),
            metadata: boot.to_metadata(),
        };
        self.fleet.create_template(&template).await?;

        self.fleet
            .create_group(&GroupSpec {
                name: group.clone(),
                template: template.name.clone(),
                target_size: request.count,
                auto_healing: true,
            })
            .await?;

        info!(
            group = %group,
            count = request.count,
            machine_type = %request.machine_type,
            preemptible = request.preemptible,
            delete_when_done = request.delete_when_done,
            "Fleet started"
        );
        Ok(())
    }

    /// Snapshot of the group, `None` when no fleet is running.
    pub async fn workers(&self) -> Result<Option<FleetStatus>> {
        Ok(self.fleet.describe_group(&self.group_name()).await?)
    }

    /// Delete the group and its template. Queued messages are untouched.
    /// Safe to call when nothing is running.
    pub async fn stop(&self) -> Result<()> {
        let group = self.group_name();
        match self.fleet.delete_group(&group).await {
            Ok(()) => info!(group = %group, "Fleet stopped"),
            Err(FleetError::GroupNotFound(_)) => debug!(group = %group, "No fleet running"),
            Err(e) => return Err(e.into()),
        }

        let template = self.template_name();
        match self.fleet.delete_template(&template).await {
            Ok(()) => debug!(template = %template, "Deleted template"),
            Err(FleetError::TemplateNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Delete the subscription and then the topic. Rejected while the
    /// group still exists.
    pub async fn cleanup(&self) -> Result<()> {
        if let Some(status) = self.workers().await? {
            return Err(FleetError::LiveWorkers {
                group: status.group,
                count: status.instances.len(),
            }
            .into());
        }
        self.queue.teardown().await?;
        info!(engine = %self.name, "Queue resources removed");
        Ok(())
    }

    /// Poll `workers()` until the group is gone or scaled to zero.
    /// Returns `false` if `timeout` passes first.
    pub async fn wait_until_drained(&self, poll: Duration, timeout: Duration) -> Result<bool> {
        let wait = async {
            loop {
                match self.workers().await? {
                    None => return Ok::<_, crate::error::Error>(()),
                    Some(status) if status.target_size == 0 && status.instances.is_empty() => {
                        return Ok(());
                    }
                    Some(status) => {
                        debug!(
                            target_size = status.target_size,
                            running = status.running(),
                            "Waiting for fleet to drain"
                        );
                    }
                }
                tokio::time::sleep(poll).await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result.map(|()| true),
            Err(_) => Ok(false),
        }
    }
}

/// Engine names become resource names: lowercase letters, digits and '-',
/// starting with a letter.
fn validate_name(name: &str) -> std::result::Result<(), ConfigError> {
    let valid = name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            key: "name".to_string(),
            message: format!("{name:?} must be lowercase letters, digits and '-'"),
        })
    }
}
