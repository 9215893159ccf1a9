//! In-process compute fleet.
//!
//! Each instance is a tokio task running a `WorkerAgent` against a shared
//! broker and object store. Aborting the task is how an instance is lost
//! involuntarily: the agent's lease keeper and script child die with it.
//! Every instance has a watcher; when an instance stops without deleting
//! itself and the group auto-heals, the watcher boots a replacement.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::RwLock;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::WorkerConfig;
use crate::error::FleetError;
use crate::fleet::{
    ComputeFleet, FleetStatus, GroupSpec, InstanceInfo, InstanceStatus, InstanceTemplate,
    WorkerBoot,
};
use crate::queue::{Broker, QueueClient};
use crate::staging::{ObjectStore, Stager};
use crate::worker::{AgentExit, WorkerAgent, WorkerDeps};

/// Delay before a stopped instance is replaced.
const HEAL_DELAY: Duration = Duration::from_millis(500);

/// Agent task of one instance and the watcher awaiting it.
struct Instance {
    agent: AbortHandle,
    watcher: JoinHandle<()>,
}

/// A running group and the tasks backing its instances.
struct TrackedGroup {
    spec: GroupSpec,
    instances: BTreeMap<String, Instance>,
    next_index: u64,
}

#[derive(Default)]
struct FleetState {
    templates: HashMap<String, InstanceTemplate>,
    groups: HashMap<String, TrackedGroup>,
}

/// Fleet whose instances are tokio tasks in this process.
pub struct LocalFleet {
    this: Weak<LocalFleet>,
    broker: Arc<dyn Broker>,
    store: Arc<dyn ObjectStore>,
    worker: WorkerConfig,
    state: RwLock<FleetState>,
}

impl LocalFleet {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn ObjectStore>,
        worker: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            broker,
            store,
            worker,
            state: RwLock::new(FleetState::default()),
        })
    }

    /// Stored copy of a template, as an instance would boot from it.
    pub async fn template(&self, name: &str) -> Option<InstanceTemplate> {
        self.state.read().await.templates.get(name).cloned()
    }

    /// Simulate preemption: kill the instance's task without going through
    /// the control plane. The group finds out from the instance's watcher.
    pub async fn kill_instance(&self, group: &str, instance: &str) -> Result<(), FleetError> {
        let state = self.state.read().await;
        let tracked = state
            .groups
            .get(group)
            .ok_or_else(|| FleetError::GroupNotFound(group.to_string()))?;
        let member = tracked
            .instances
            .get(instance)
            .ok_or_else(|| FleetError::UnknownInstance {
                group: group.to_string(),
                instance: instance.to_string(),
            })?;
        member.agent.abort();
        warn!(group = %group, instance = %instance, "Instance killed");
        Ok(())
    }

    /// Called by an instance's watcher once its agent task has ended. An
    /// instance still listed in its group stopped without deleting itself;
    /// auto-healing groups replace it after `HEAL_DELAY`.
    async fn instance_stopped(&self, group: &str, instance: &str) {
        let auto_healing = {
            let state = self.state.read().await;
            match state.groups.get(group) {
                Some(tracked) if tracked.instances.contains_key(instance) => {
                    tracked.spec.auto_healing
                }
                _ => return,
            }
        };
        if !auto_healing {
            warn!(group = %group, instance = %instance, "Instance stopped, auto-healing disabled");
            return;
        }
        warn!(group = %group, instance = %instance, "Instance stopped unexpectedly, replacing");
        tokio::time::sleep(HEAL_DELAY).await;

        let mut state = self.state.write().await;
        let FleetState { templates, groups } = &mut *state;
        let Some(tracked) = groups.get_mut(group) else {
            return;
        };
        if tracked.instances.remove(instance).is_none() {
            return;
        }
        let Some(template) = templates.get(&tracked.spec.template) else {
            error!(group = %group, template = %tracked.spec.template, "Template gone, cannot heal");
            return;
        };
        match self.boot_instance(tracked, template) {
            Ok(replacement) => info!(
                group = %group,
                lost = %instance,
                replacement = %replacement,
                "Instance healed"
            ),
            Err(e) => error!(group = %group, error = %e, "Failed to boot replacement instance"),
        }
    }

    /// Boot one instance of `group` from `template`.
    fn boot_instance(
        &self,
        group: &mut TrackedGroup,
        template: &InstanceTemplate,
    ) -> Result<String, FleetError> {
        let name = format!("{}-{}", group.spec.name, group.next_index);
        let boot = WorkerBoot::from_metadata(&template.metadata, name.clone())
            .map_err(|e| FleetError::InvalidRequest(e.to_string()))?;
        let fleet: Arc<dyn ComputeFleet> = self
            .this
            .upgrade()
            .ok_or_else(|| FleetError::ControlPlane("fleet is shutting down".to_string()))?;
        group.next_index += 1;

        let deps = WorkerDeps {
            queue: QueueClient::new(self.broker.clone(), boot.queue.clone(), self.worker.retry),
            stager: Stager::new(self.store.clone(), self.worker.transfer_timeout),
            fleet,
        };
        let config = self.worker.clone();
        debug!(
            instance = %name,
            image = %template.image,
            command = ?template.command,
            "Booting instance"
        );

        let span = info_span!("instance", name = %name);
        let agent = tokio::spawn(
            async move {
                let mut agent = WorkerAgent::new(boot, config, deps);
                match agent.run().await {
                    Ok(AgentExit::SelfTerminated) => info!("Worker exited after self-termination"),
                    Err(e) => error!(error = %e, "Worker exited with error"),
                }
            }
            .instrument(span),
        );

        let abort = agent.abort_handle();
        let this = self.this.clone();
        let (group_name, instance) = (group.spec.name.clone(), name.clone());
        let watcher = tokio::spawn(async move {
            if let Err(e) = agent.await {
                debug!(instance = %instance, cancelled = e.is_cancelled(), "Instance task ended");
            }
            if let Some(fleet) = this.upgrade() {
                fleet.instance_stopped(&group_name, &instance).await;
            }
        });
        group.instances.insert(
            name.clone(),
            Instance {
                agent: abort,
                watcher,
            },
        );
        Ok(name)
    }
}

#[async_trait]
impl ComputeFleet for LocalFleet {
    async fn create_template(&self, template: &InstanceTemplate) -> Result<(), FleetError> {
        let mut state = self.state.write().await;
        if state.templates.contains_key(&template.name) {
            return Err(FleetError::TemplateExists(template.name.clone()));
        }
        state
            .templates
            .insert(template.name.clone(), template.clone());
        info!(template = %template.name, machine_type = %template.machine_type, "Created instance template");
        Ok(())
    }

    async fn delete_template(&self, name: &str) -> Result<(), FleetError> {
        let mut state = self.state.write().await;
        if let Some(group) = state.groups.values().find(|g| g.spec.template == name) {
            return Err(FleetError::InvalidRequest(format!(
                "template {name} is in use by group {}",
                group.spec.name
            )));
        }
        state
            .templates
            .remove(name)
            .ok_or_else(|| FleetError::TemplateNotFound(name.to_string()))?;
        info!(template = %name, "Deleted instance template");
        Ok(())
    }

    async fn create_group(&self, spec: &GroupSpec) -> Result<(), FleetError> {
        let mut state = self.state.write().await;
        let FleetState { templates, groups } = &mut *state;
        if groups.contains_key(&spec.name) {
            return Err(FleetError::GroupExists(spec.name.clone()));
        }
        let template = templates
            .get(&spec.template)
            .ok_or_else(|| FleetError::TemplateNotFound(spec.template.clone()))?;

        let mut group = TrackedGroup {
            spec: spec.clone(),
            instances: BTreeMap::new(),
            next_index: 0,
        };
        for _ in 0..spec.target_size {
            if let Err(e) = self.boot_instance(&mut group, template) {
                for member in group.instances.values() {
                    member.agent.abort();
                }
                return Err(e);
            }
        }
        info!(group = %spec.name, target_size = spec.target_size, "Created instance group");
        groups.insert(spec.name.clone(), group);
        Ok(())
    }

    async fn delete_group(&self, name: &str) -> Result<(), FleetError> {
        let group = self
            .state
            .write()
            .await
            .groups
            .remove(name)
            .ok_or_else(|| FleetError::GroupNotFound(name.to_string()))?;

        let watchers: Vec<_> = group
            .instances
            .into_values()
            .map(|member| {
                member.agent.abort();
                member.watcher
            })
            .collect();
        let count = watchers.len();
        // Watchers return once their agent has stopped and the group is gone
        join_all(watchers).await;
        info!(group = %name, instances = count, "Deleted instance group");
        Ok(())
    }

    async fn describe_group(&self, name: &str) -> Result<Option<FleetStatus>, FleetError> {
        let state = self.state.read().await;
        Ok(state.groups.get(name).map(|group| FleetStatus {
            group: name.to_string(),
            target_size: group.spec.target_size,
            instances: group
                .instances
                .iter()
                .map(|(name, member)| InstanceInfo {
                    name: name.clone(),
                    status: if member.agent.is_finished() {
                        InstanceStatus::Stopped
                    } else {
                        InstanceStatus::Running
                    },
                })
                .collect(),
            observed_at: Utc::now(),
        }))
    }

    async fn delete_self(&self, group: &str, instance: &str) -> Result<(), FleetError> {
        let mut state = self.state.write().await;
        let tracked = state
            .groups
            .get_mut(group)
            .ok_or_else(|| FleetError::GroupNotFound(group.to_string()))?;
        // The caller is the instance's own task; detach rather than abort it.
        tracked
            .instances
            .remove(instance)
            .ok_or_else(|| FleetError::UnknownInstance {
                group: group.to_string(),
                instance: instance.to_string(),
            })?;
        tracked.spec.target_size = tracked.spec.target_size.saturating_sub(1);
        info!(
            group = %group,
            instance = %instance,
            target_size = tracked.spec.target_size,
            "Instance deleted itself"
        );
        Ok(())
    }

    async fn replace_instance(&self, group: &str, instance: &str) -> Result<(), FleetError> {
        let mut state = self.state.write().await;
        let FleetState { templates, groups } = &mut *state;
        let tracked = groups
            .get_mut(group)
            .ok_or_else(|| FleetError::GroupNotFound(group.to_string()))?;
        let member = tracked
            .instances
            .remove(instance)
            .ok_or_else(|| FleetError::UnknownInstance {
                group: group.to_string(),
                instance: instance.to_string(),
            })?;
        member.agent.abort();

        if !tracked.spec.auto_healing {
            warn!(group = %group, instance = %instance, "Instance lost, auto-healing disabled");
            return Ok(());
        }
        let template = templates
            .get(&tracked.spec.template)
            .ok_or_else(|| FleetError::TemplateNotFound(tracked.spec.template.clone()))?;
        let replacement = self.boot_instance(tracked, template)?;
        info!(
            group = %group,
            lost = %instance,
            replacement = %replacement,
            "Instance replaced"
        );
        Ok(())
    }
}
