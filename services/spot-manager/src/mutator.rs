//! Launch configuration swap and instance replacement.
//!
//! A transition runs in six steps:
//!
//! 1. Create a launch configuration cloned from the current one with the
//!    target purchasing option.
//! 2. Point the group at it. Nothing else happens unless this succeeds.
//! 3. Wait until the group reports the new configuration and no scaling
//!    activity is running.
//! 4. Stop here for the instance replacement part if the group is tagged
//!    not-terminate.
//! 5. Terminate old instances one at a time, waiting for the group to get
//!    back to its desired capacity after each.
//! 6. Delete the old configuration.
//!
//! Once step 2 has succeeded the group is in its new mode no matter what
//! happens afterwards; anything left behind is reported as
//! [`PendingCleanup`] and handled by a later [`AsgMutator::sweep`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use spotter_cloud::{
    AutoScalingGroup, CloudApi, CloudError, CloudResult, LaunchConfiguration, LifecycleState,
    ScalingActivity,
};
use spotter_id::{AsgName, InstanceId, LaunchConfigName};
use spotter_reconcile::{poll_until, retry, BackoffPolicy, Clock, PollError, RetryPolicy, Retryable};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::engine::{CleanupPlan, TransitionPlan};

/// Retry and wait budgets for mutations.
#[derive(Debug, Clone)]
pub struct MutatorConfig {
    /// Policy for individual cloud calls.
    pub call_retry: RetryPolicy,

    /// How long to wait for the group to report a new configuration.
    pub confirm: RetryPolicy,

    /// How long to wait for capacity after each termination.
    pub capacity: RetryPolicy,
}

impl Default for MutatorConfig {
    fn default() -> Self {
        Self {
            call_retry: RetryPolicy {
                max_attempts: 5,
                backoff: BackoffPolicy::default(),
            },
            confirm: RetryPolicy {
                max_attempts: 20,
                backoff: BackoffPolicy {
                    base: Duration::from_secs(5),
                    max: Duration::from_secs(30),
                    jitter: 0.1,
                },
            },
            capacity: RetryPolicy {
                max_attempts: 40,
                backoff: BackoffPolicy {
                    base: Duration::from_secs(10),
                    max: Duration::from_secs(60),
                    jitter: 0.1,
                },
            },
        }
    }
}

/// Work a partial transition left behind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingCleanup {
    /// Configuration the group was switched to.
    pub launch_config: LaunchConfigName,

    /// Superseded configuration that still has to be deleted.
    pub orphan: Option<LaunchConfigName>,

    /// Instances still running from a superseded configuration.
    pub stragglers: Vec<InstanceId>,
}

impl PendingCleanup {
    fn collect(
        launch_config: &LaunchConfigName,
        orphan: Option<LaunchConfigName>,
        stragglers: Vec<InstanceId>,
    ) -> Option<Self> {
        if orphan.is_none() && stragglers.is_empty() {
            return None;
        }
        Some(Self {
            launch_config: launch_config.clone(),
            orphan,
            stragglers,
        })
    }
}

/// Result of a transition that got past the group update.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    /// Configuration the group now references.
    pub launch_config: LaunchConfigName,

    /// Leftovers of a partial transition.
    pub cleanup: Option<PendingCleanup>,
}

impl TransitionOutcome {
    pub fn is_partial(&self) -> bool {
        self.cleanup.is_some()
    }
}

/// A transition or sweep that failed before changing the group.
#[derive(Debug, Error)]
pub enum MutationError {
    #[error("{operation} failed: {source}")]
    Cloud {
        operation: &'static str,
        #[source]
        source: CloudError,
    },

    #[error("autoscaling group {0} has no launch configuration")]
    NoLaunchConfiguration(AsgName),

    #[error("mutation task failed: {0}")]
    Task(String),
}

impl MutationError {
    pub fn is_permission(&self) -> bool {
        matches!(self, MutationError::Cloud { source, .. } if source.is_permission())
    }

    fn cloud(operation: &'static str) -> impl FnOnce(CloudError) -> Self {
        move |source| MutationError::Cloud { operation, source }
    }
}

/// Executes transitions and straggler sweeps against the cloud.
pub struct AsgMutator {
    cloud: Arc<dyn CloudApi>,
    clock: Arc<dyn Clock>,
    config: MutatorConfig,
    shutdown: watch::Receiver<bool>,
}

impl AsgMutator {
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        clock: Arc<dyn Clock>,
        config: MutatorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cloud,
            clock,
            config,
            shutdown,
        }
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, MutationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CloudResult<T>>,
    {
        retry(&self.config.call_retry, self.clock.as_ref(), operation, op)
            .await
            .map_err(MutationError::cloud(operation))
    }

    /// Run the transition protocol for one group.
    #[instrument(skip_all, fields(asg = %plan.asg, target = %plan.target))]
    pub async fn transition(&self, plan: &TransitionPlan) -> Result<TransitionOutcome, MutationError> {
        let cloud = self.cloud.as_ref();
        let name = &plan.asg;

        // Step 1: clone the current configuration.
        let asg = self
            .call("describe_auto_scaling_group", move || {
                cloud.describe_auto_scaling_group(name)
            })
            .await?;
        let old_name = asg
            .launch_configuration_name
            .clone()
            .ok_or_else(|| MutationError::NoLaunchConfiguration(name.clone()))?;
        let old_ref = &old_name;
        let current = self
            .call("describe_launch_configuration", move || {
                cloud.describe_launch_configuration(old_ref)
            })
            .await?;

        let new_config = current.derive(old_name.successor(), plan.target, plan.bid);
        let new_name = new_config.name.clone();
        self.create_launch_configuration(&new_config).await?;

        // Step 2: switch the group over.
        let new_ref = &new_name;
        if let Err(e) = self
            .call("update_auto_scaling_group", move || {
                cloud.update_auto_scaling_group(name, new_ref)
            })
            .await
        {
            warn!(launch_config = %new_name, error = %e, "Group update failed, removing new configuration");
            if let Err(cleanup) = cloud.delete_launch_configuration(&new_name).await {
                warn!(launch_config = %new_name, error = %cleanup, "Failed to remove unused configuration");
            }
            return Err(e);
        }
        info!(from = %old_name, to = %new_name, "Group now references new launch configuration");

        // Step 3: wait for the change to be visible.
        let confirmed = match self.await_launch_config(name, &new_name).await {
            Ok(asg) => asg,
            Err(reason) => {
                warn!(launch_config = %new_name, reason = %reason, "New configuration not confirmed, keeping old one");
                let stragglers = if plan.not_terminate {
                    Vec::new()
                } else {
                    outdated_instances(&asg, &new_name)
                };
                return Ok(TransitionOutcome {
                    cleanup: PendingCleanup::collect(&new_name, Some(old_name), stragglers),
                    launch_config: new_name,
                });
            }
        };

        if self.shutting_down() {
            info!("Shutdown requested, stopping after confirmation");
            let stragglers = if plan.not_terminate {
                Vec::new()
            } else {
                outdated_instances(&confirmed, &new_name)
            };
            return Ok(TransitionOutcome {
                cleanup: PendingCleanup::collect(&new_name, Some(old_name), stragglers),
                launch_config: new_name,
            });
        }

        // Steps 4 and 5: replace old instances unless told not to.
        let stragglers = if plan.not_terminate {
            info!("Group is tagged not-terminate, leaving existing instances running");
            Vec::new()
        } else {
            self.replace_instances(name, outdated_instances(&confirmed, &new_name))
                .await
        };

        // Step 6: drop the old configuration once nothing runs from it.
        let orphan = if stragglers.is_empty() {
            self.delete_launch_configuration(&old_name).await
        } else {
            Some(old_name)
        };

        let outcome = TransitionOutcome {
            cleanup: PendingCleanup::collect(&new_name, orphan, stragglers),
            launch_config: new_name,
        };
        if let Some(cleanup) = &outcome.cleanup {
            warn!(
                stragglers = cleanup.stragglers.len(),
                orphan = ?cleanup.orphan,
                "Transition finished partially"
            );
        } else {
            info!("Transition complete");
        }
        Ok(outcome)
    }

    /// Finish the work a partial transition left behind.
    ///
    /// Returns what is still outstanding, or `None` once everything is done.
    /// Instances are re-checked against the group's configuration rather
    /// than taken from the recorded straggler list.
    #[instrument(skip_all, fields(asg = %plan.asg))]
    pub async fn sweep(&self, plan: &CleanupPlan) -> Result<Option<PendingCleanup>, MutationError> {
        let cloud = self.cloud.as_ref();
        let name = &plan.asg;
        let expected = &plan.cleanup.launch_config;

        let asg = self
            .call("describe_auto_scaling_group", move || {
                cloud.describe_auto_scaling_group(name)
            })
            .await?;
        if asg.launch_configuration_name.as_ref() != Some(expected) {
            warn!(
                expected = %expected,
                actual = ?asg.launch_configuration_name,
                "Group no longer references the expected configuration, dropping cleanup"
            );
            return Ok(None);
        }

        let stragglers = if plan.not_terminate {
            Vec::new()
        } else {
            let outdated = outdated_instances(&asg, expected);
            if !outdated.is_empty() {
                info!(stragglers = outdated.len(), "Replacing straggler instances");
            }
            self.replace_instances(name, outdated).await
        };

        let orphan = match &plan.cleanup.orphan {
            // The group went back to this configuration, it is no orphan.
            Some(orphan) if orphan == expected => None,
            Some(orphan) if stragglers.is_empty() => {
                self.delete_launch_configuration(orphan).await
            }
            other => other.clone(),
        };

        let remaining = PendingCleanup::collect(expected, orphan, stragglers);
        if remaining.is_none() {
            info!("Cleanup complete");
        }
        Ok(remaining)
    }

    async fn create_launch_configuration(
        &self,
        config: &LaunchConfiguration,
    ) -> Result<(), MutationError> {
        let cloud = self.cloud.as_ref();
        let created = self
            .call("create_launch_configuration", move || {
                cloud.create_launch_configuration(config)
            })
            .await;

        match created {
            Ok(()) => {
                info!(launch_config = %config.name, option = %config.purchase_option(), "Created launch configuration");
                Ok(())
            }
            Err(MutationError::Cloud { source, .. }) if source.is_already_exists() => {
                self.reuse_launch_configuration(config).await
            }
            Err(e) => Err(e),
        }
    }

    /// A configuration with the successor name is left over from an earlier
    /// attempt. Keep it if it launches the right kind of capacity, otherwise
    /// replace it.
    async fn reuse_launch_configuration(
        &self,
        config: &LaunchConfiguration,
    ) -> Result<(), MutationError> {
        let cloud = self.cloud.as_ref();
        let name = &config.name;
        let existing = self
            .call("describe_launch_configuration", move || {
                cloud.describe_launch_configuration(name)
            })
            .await?;

        if existing.purchase_option() == config.purchase_option() {
            info!(launch_config = %name, "Reusing existing launch configuration");
            return Ok(());
        }

        warn!(
            launch_config = %name,
            found = %existing.purchase_option(),
            wanted = %config.purchase_option(),
            "Existing launch configuration has the wrong purchasing option, replacing"
        );
        self.call("delete_launch_configuration", move || {
            cloud.delete_launch_configuration(name)
        })
        .await?;
        self.call("create_launch_configuration", move || {
            cloud.create_launch_configuration(config)
        })
        .await
    }

    /// Delete a superseded configuration. Returns it back if it could not be
    /// deleted.
    async fn delete_launch_configuration(&self, name: &LaunchConfigName) -> Option<LaunchConfigName> {
        let cloud = self.cloud.as_ref();
        match self
            .call("delete_launch_configuration", move || {
                cloud.delete_launch_configuration(name)
            })
            .await
        {
            Ok(()) => {
                info!(launch_config = %name, "Deleted old launch configuration");
                None
            }
            Err(MutationError::Cloud { source, .. }) if source.is_not_found() => None,
            Err(e) => {
                warn!(launch_config = %name, error = %e, "Failed to delete old launch configuration");
                Some(name.clone())
            }
        }
    }

    /// Poll until the group references `expected` with no scaling activity
    /// running.
    async fn await_launch_config(
        &self,
        name: &AsgName,
        expected: &LaunchConfigName,
    ) -> Result<AutoScalingGroup, String> {
        let cloud = self.cloud.as_ref();
        let latest = std::sync::Mutex::new(None);
        let latest_ref = &latest;

        let confirmed = poll_until(
            &self.config.confirm,
            self.clock.as_ref(),
            "launch configuration propagation",
            move || async move {
                let Some(asg) = transient(cloud.describe_auto_scaling_group(name).await)? else {
                    return Ok(false);
                };
                if asg.launch_configuration_name.as_ref() != Some(expected) {
                    return Ok(false);
                }
                let idle = settled(cloud, name).await?;
                if idle {
                    *latest_ref.lock().unwrap_or_else(|e| e.into_inner()) = Some(asg);
                }
                Ok::<bool, CloudError>(idle)
            },
        )
        .await;

        match confirmed {
            Ok(checks) => {
                debug!(checks, "Launch configuration confirmed");
                latest
                    .into_inner()
                    .unwrap_or_else(|e| e.into_inner())
                    .ok_or_else(|| "confirmed without a group snapshot".to_string())
            }
            Err(PollError::Timeout { attempts, .. }) => {
                Err(format!("not visible after {attempts} checks"))
            }
            Err(PollError::Check(e)) => Err(e.to_string()),
        }
    }

    /// Terminate `targets` one at a time. Returns the instances that were
    /// not replaced.
    async fn replace_instances(&self, name: &AsgName, targets: Vec<InstanceId>) -> Vec<InstanceId> {
        let cloud = self.cloud.as_ref();

        for (idx, instance_id) in targets.iter().enumerate() {
            if self.shutting_down() {
                info!(remaining = targets.len() - idx, "Shutdown requested, stopping replacement");
                return targets[idx..].to_vec();
            }

            let terminated = self
                .call("terminate_instance_in_auto_scaling_group", move || {
                    cloud.terminate_instance_in_auto_scaling_group(instance_id, false)
                })
                .await;
            match terminated {
                Ok(()) => info!(instance_id = %instance_id, "Terminated instance"),
                Err(MutationError::Cloud { source, .. }) if source.is_not_found() => {
                    debug!(instance_id = %instance_id, "Instance already gone");
                    continue;
                }
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "Failed to terminate instance");
                    return targets[idx..].to_vec();
                }
            }

            if let Err(reason) = self.await_capacity(name).await {
                warn!(reason = %reason, "Group did not return to desired capacity, pausing replacement");
                return targets[idx + 1..].to_vec();
            }
        }

        Vec::new()
    }

    async fn await_capacity(&self, name: &AsgName) -> Result<(), String> {
        let cloud = self.cloud.as_ref();
        let result = poll_until(
            &self.config.capacity,
            self.clock.as_ref(),
            "desired capacity",
            move || async move {
                let Some(asg) = transient(cloud.describe_auto_scaling_group(name).await)? else {
                    return Ok(false);
                };
                if !asg.at_capacity() {
                    return Ok(false);
                }
                Ok::<bool, CloudError>(settled(cloud, name).await?)
            },
        )
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(PollError::Timeout { attempts, .. }) => Err(format!("still short after {attempts} checks")),
            Err(PollError::Check(e)) => Err(e.to_string()),
        }
    }
}

/// Whether the group has no scaling activity running. Transient failures
/// count as "not yet".
async fn settled(cloud: &dyn CloudApi, name: &AsgName) -> Result<bool, CloudError> {
    match transient(cloud.describe_scaling_activities(name).await)? {
        Some(activities) => Ok(!activities.iter().any(ScalingActivity::is_in_progress)),
        None => Ok(false),
    }
}

/// Map retryable errors to `None` so polling loops keep going.
fn transient<T>(result: CloudResult<T>) -> Result<Option<T>, CloudError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_retryable() => {
            debug!(error = %e, "Transient failure while polling");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Live instances not launched from `current`.
fn outdated_instances(asg: &AutoScalingGroup, current: &LaunchConfigName) -> Vec<InstanceId> {
    asg.instances
        .iter()
        .filter(|i| i.launch_configuration_name.as_ref() != Some(current))
        .filter(|i| {
            !matches!(
                i.lifecycle_state,
                LifecycleState::Terminating | LifecycleState::Terminated
            )
        })
        .map(|i| i.instance_id.clone())
        .collect()
}
