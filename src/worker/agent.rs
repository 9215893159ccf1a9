//! Per-instance worker control loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::Error;
use crate::fleet::{ComputeFleet, WorkerBoot};
use crate::queue::{Delivery, Lease, QueueClient};
use crate::staging::{StageOutReport, Stager};
use crate::worker::exec::ScriptRunner;
use crate::worker::lease::LeaseKeeper;
use crate::worker::state::{AgentState, AgentStatus};

/// Shared dependencies for a worker agent.
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: QueueClient,
    pub stager: Stager,
    pub fleet: Arc<dyn ComputeFleet>,
}

/// How one task attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Script ran, outputs were staged (best-effort) and the lease acknowledged.
    Acknowledged {
        exit_code: Option<i32>,
        outputs: StageOutReport,
    },
    /// Lease left to lapse; the broker will redeliver.
    Abandoned { reason: String },
}

/// Result of one pull from the subscription.
enum Pulled {
    Message(Delivery),
    Empty,
    /// The broker could not be reached; says nothing about the queue.
    Unreachable,
}

/// Result of the empty-queue confirmation protocol.
enum Drain {
    /// Every check saw an empty queue.
    Confirmed,
    /// Work showed up during a check.
    Interrupted(Delivery),
    /// Depth is non-zero but nothing was pullable: a peer holds a lease.
    PeerBusy,
    /// A check could not reach the broker.
    Unconfirmed,
}

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// The instance asked the fleet to delete it.
    SelfTerminated,
}

/// Worker that pulls and executes tasks until the queue is drained.
pub struct WorkerAgent {
    boot: WorkerBoot,
    config: WorkerConfig,
    deps: WorkerDeps,
    runner: ScriptRunner,
    status: AgentStatus,
}

impl WorkerAgent {
    pub fn new(boot: WorkerBoot, config: WorkerConfig, deps: WorkerDeps) -> Self {
        let runner = ScriptRunner::new(config.script_timeout);
        Self {
            boot,
            config,
            deps,
            runner,
            status: AgentStatus::new(),
        }
    }

    pub fn status(&self) -> &AgentStatus {
        &self.status
    }

    pub fn boot(&self) -> &WorkerBoot {
        &self.boot
    }

    fn queue(&self) -> &QueueClient {
        &self.deps.queue
    }

    fn enter(&mut self, state: AgentState, reason: Option<String>) {
        if let Err(e) = self.status.transition_to(state, reason) {
            error!(error = %e, "Invalid worker state transition");
        }
    }

    /// Run until self-termination. Returns an error only when the queue
    /// itself is gone or permanently failing.
    pub async fn run(&mut self) -> Result<AgentExit, Error> {
        let span = info_span!(
            "worker",
            fleet = %self.boot.fleet,
            instance = %self.boot.instance
        );
        self.run_loop().instrument(span).await
    }

    async fn run_loop(&mut self) -> Result<AgentExit, Error> {
        info!(
            subscription = %self.queue().resource().subscription,
            delete_when_done = self.boot.delete_when_done,
            "Worker started"
        );

        loop {
            match self.pull(self.config.pull_wait).await? {
                Pulled::Message(delivery) => {
                    self.process(delivery).await;
                    continue;
                }
                Pulled::Unreachable => {
                    tokio::time::sleep(self.config.pull_wait).await;
                    continue;
                }
                Pulled::Empty => {}
            }

            if !self.boot.delete_when_done {
                continue;
            }

            match self.confirm_drained().await? {
                Drain::Confirmed => {
                    if self.terminate().await {
                        return Ok(AgentExit::SelfTerminated);
                    }
                }
                Drain::Interrupted(delivery) => {
                    info!("Work arrived during drain checks, termination aborted");
                    self.process(delivery).await;
                }
                Drain::PeerBusy => {
                    debug!("Queue not empty but nothing pullable, staying up");
                }
                Drain::Unconfirmed => {
                    debug!("Drain checks could not reach the broker, staying up");
                }
            }
        }
    }

    /// One pull. Broker outages come back as `Unreachable`; only a missing
    /// subscription or another permanent error fails.
    async fn pull(&self, max_wait: Duration) -> Result<Pulled, Error> {
        match self.queue().pull(max_wait).await {
            Ok(Some(delivery)) => Ok(Pulled::Message(delivery)),
            Ok(None) => Ok(Pulled::Empty),
            Err(e) if e.is_outage() => {
                warn!(error = %e, "Pull failed");
                Ok(Pulled::Unreachable)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Empty-queue confirmation: `confirmations` checks spaced by the grace
    /// interval, each requiring zero depth and an empty pull. Any check that
    /// cannot reach the broker ends the protocol unconfirmed.
    async fn confirm_drained(&mut self) -> Result<Drain, Error> {
        let policy = self.config.termination;
        for check in 1..=policy.confirmations.max(1) {
            tokio::time::sleep(policy.grace_interval).await;

            let depth = match self.queue().approximate_depth().await {
                Ok(depth) => depth,
                Err(e) if e.is_outage() => {
                    warn!(error = %e, "Depth check failed");
                    return Ok(Drain::Unconfirmed);
                }
                Err(e) => return Err(e.into()),
            };
            match self.pull(Duration::ZERO).await? {
                Pulled::Message(delivery) => return Ok(Drain::Interrupted(delivery)),
                Pulled::Unreachable => return Ok(Drain::Unconfirmed),
                Pulled::Empty => {}
            }
            if depth > 0 {
                return Ok(Drain::PeerBusy);
            }
            debug!(check, of = policy.confirmations, "Queue still empty");
        }
        Ok(Drain::Confirmed)
    }

    /// Ask the fleet to delete this instance. `false` if it refused.
    async fn terminate(&mut self) -> bool {
        self.enter(
            AgentState::Terminating,
            Some("queue drained".to_string()),
        );
        info!(group = %self.boot.group, "Queue drained, requesting instance deletion");

        match self
            .deps
            .fleet
            .delete_self(&self.boot.group, &self.boot.instance)
            .await
        {
            Ok(()) => {
                self.enter(AgentState::Terminated, None);
                info!("Instance deletion accepted");
                true
            }
            Err(e) => {
                warn!(error = %e, "Instance deletion refused, returning to idle");
                self.enter(AgentState::Idle, Some(e.to_string()));
                false
            }
        }
    }

    /// Run one full attempt for a leased message:
    /// stage in, execute, stage out, settle.
    pub async fn process(&mut self, delivery: Delivery) -> AttemptOutcome {
        let span = info_span!(
            "task",
            message_id = %delivery.lease.message_id,
            attempt = delivery.lease.delivery_attempt
        );
        self.process_inner(delivery).instrument(span).await
    }

    async fn process_inner(&mut self, delivery: Delivery) -> AttemptOutcome {
        let lease = delivery.lease.clone();
        if lease.delivery_attempt > 1 {
            warn!("Redelivered message, previous attempt did not complete");
        }
        info!("Task started");
        self.enter(AgentState::StagingIn, None);

        let keeper = LeaseKeeper::spawn(
            self.queue().clone(),
            lease.clone(),
            self.config.lease_extension_interval,
            self.config.lease_extension,
        );

        let workdir = self.working_dir(&lease);
        let outcome = self.attempt(&delivery, &workdir).await;

        if keeper.is_lost() {
            warn!("Lease was lost during the attempt, ack will likely be rejected");
        }
        drop(keeper);
        let outcome = match outcome {
            Ok((exit_code, outputs)) => match self.queue().ack(&lease).await {
                Ok(()) => {
                    self.status.acknowledged += 1;
                    AttemptOutcome::Acknowledged { exit_code, outputs }
                }
                Err(e) => {
                    warn!(error = %e, "Acknowledgement failed, message will be redelivered");
                    AttemptOutcome::Abandoned {
                        reason: format!("ack failed: {e}"),
                    }
                }
            },
            Err(reason) => {
                warn!(reason = %reason, "Attempt abandoned, leaving lease to lapse");
                AttemptOutcome::Abandoned { reason }
            }
        };

        if let Err(e) = fs::remove_dir_all(&workdir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %workdir.display(), error = %e, "Failed to remove working directory");
            }
        }

        match &outcome {
            AttemptOutcome::Acknowledged { exit_code, .. } => {
                info!(exit_code = ?exit_code, "Task finished");
            }
            AttemptOutcome::Abandoned { .. } => info!("Task attempt ended without ack"),
        }
        self.enter(AgentState::Idle, None);
        outcome
    }

    /// Stage in, execute, stage out. `Err` carries the reason the attempt
    /// must not be acknowledged; state is left at Completing either way.
    async fn attempt(
        &mut self,
        delivery: &Delivery,
        workdir: &Path,
    ) -> Result<(Option<i32>, StageOutReport), String> {
        let envelope = match delivery.envelope() {
            Ok(envelope) => envelope,
            Err(e) => return Err(self.abandon(format!("malformed envelope: {e}"))),
        };

        if let Err(e) = fs::create_dir_all(workdir).await {
            return Err(self.abandon(format!("cannot create working directory: {e}")));
        }
        if let Err(e) = self.deps.stager.stage_in(workdir, &envelope.inputs).await {
            error!(error = %e, "Input staging failed");
            return Err(self.abandon(format!("stage-in failed: {e}")));
        }

        self.enter(AgentState::Executing, None);
        let output = match self.runner.run(&envelope.script, workdir).await {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, "Script did not complete");
                return Err(self.abandon(format!("execution failed: {e}")));
            }
        };
        if !output.stdout.is_empty() {
            info!(stream = "stdout", "{}", output.stdout);
        }
        if !output.stderr.is_empty() {
            warn!(stream = "stderr", "{}", output.stderr);
        }
        if output.success() {
            info!(duration_ms = output.duration.as_millis() as u64, "Script succeeded");
        } else {
            warn!(
                exit_code = ?output.exit_code,
                duration_ms = output.duration.as_millis() as u64,
                "Script exited unsuccessfully"
            );
        }

        self.enter(AgentState::StagingOut, None);
        let outputs = match self.deps.stager.stage_out(workdir, &envelope.outputs).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Output staging failed");
                StageOutReport {
                    failed: vec![(String::new(), e.to_string())],
                    ..Default::default()
                }
            }
        };

        self.enter(AgentState::Completing, None);
        Ok((output.exit_code, outputs))
    }

    fn abandon(&mut self, reason: String) -> String {
        self.enter(AgentState::Completing, Some(reason.clone()));
        reason
    }

    /// Fresh per-attempt directory; never reused across attempts.
    fn working_dir(&self, lease: &Lease) -> PathBuf {
        self.config.scratch_root.join(format!(
            "{}-{}-{}",
            lease.message_id,
            lease.delivery_attempt,
            Uuid::new_v4().simple()
        ))
    }
}
