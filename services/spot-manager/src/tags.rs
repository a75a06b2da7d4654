//! Tag policy resolution.
//!
//! Tag values are opaque strings set by operators. They are parsed into a
//! closed [`Policy`] here and nowhere else; anything unrecognized maps to
//! [`Policy::Unmanaged`].

use std::sync::Arc;

use serde::Serialize;
use spotter_cloud::{AutoScalingGroup, CloudApi, CloudError, PurchaseOption};
use spotter_id::{AsgName, LaunchConfigName};
use spotter_reconcile::{retry, Clock, RetryPolicy};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Tag whose value must equal the cluster name for a group to be considered.
pub const CLUSTER_TAG: &str = "KubernetesCluster";

/// Management policy tag.
pub const POLICY_TAG: &str = "k8s-minion-manager";

/// Suppresses termination of existing instances during a transition.
pub const NOT_TERMINATE_TAG: &str = "k8s-minion-manager/not-terminate";

/// Management policy for a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    UseSpot,
    NoSpot,
    Unmanaged,
}

impl Policy {
    /// Parse the management tag value. Absent or unrecognized values are
    /// `Unmanaged`.
    pub fn from_tag(value: Option<&str>) -> Self {
        match value {
            Some("use-spot") => Policy::UseSpot,
            Some("no-spot") => Policy::NoSpot,
            _ => Policy::Unmanaged,
        }
    }

    pub fn is_managed(&self) -> bool {
        !matches!(self, Policy::Unmanaged)
    }
}

/// Parse the not-terminate tag. Only the exact string `"true"` enables it.
pub fn parse_not_terminate(value: Option<&str>) -> bool {
    value == Some("true")
}

/// Live launch configuration of a managed group.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSnapshot {
    pub name: LaunchConfigName,
    pub instance_type: String,
    pub purchase_option: PurchaseOption,
}

/// One candidate group as seen by a tag refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedAsg {
    pub name: AsgName,
    pub policy: Policy,
    pub not_terminate: bool,
    pub zones: Vec<String>,

    /// Present for managed groups only.
    pub launch: Option<LaunchSnapshot>,

    /// Managed, but its launch configuration could not be read this cycle.
    /// The group is still listed, so whatever is known about it stays.
    pub unresolved: bool,
}

/// Errors that abort a whole tag refresh.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("failed to list autoscaling groups: {0}")]
    ListGroups(#[source] CloudError),
}

impl RefreshError {
    pub fn is_permission(&self) -> bool {
        match self {
            RefreshError::ListGroups(e) => e.is_permission(),
        }
    }
}

/// Lists candidate groups and resolves their policy tags.
///
/// Read-only: never mutates cloud state.
pub struct TagPolicyResolver {
    cloud: Arc<dyn CloudApi>,
    clock: Arc<dyn Clock>,
    cluster_name: String,
    retry: RetryPolicy,
}

impl TagPolicyResolver {
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        clock: Arc<dyn Clock>,
        cluster_name: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            cloud,
            clock,
            cluster_name: cluster_name.into(),
            retry,
        }
    }

    /// List candidate groups with their policies.
    ///
    /// Fails only if the group listing fails. A group whose launch
    /// configuration cannot be described is returned marked
    /// [`unresolved`](ObservedAsg::unresolved) for this cycle.
    #[instrument(skip(self), fields(cluster = %self.cluster_name))]
    pub async fn refresh(&self) -> Result<Vec<ObservedAsg>, RefreshError> {
        let cloud = self.cloud.as_ref();
        let groups = retry(&self.retry, self.clock.as_ref(), "describe_auto_scaling_groups", move || {
            cloud.describe_auto_scaling_groups()
        })
        .await
        .map_err(RefreshError::ListGroups)?;

        let mut observed = Vec::new();
        for asg in groups.iter().filter(|a| self.is_candidate(a)) {
            observed.push(self.observe(asg).await);
        }

        debug!(
            listed = groups.len(),
            candidates = observed.len(),
            managed = observed.iter().filter(|o| o.policy.is_managed()).count(),
            unresolved = observed.iter().filter(|o| o.unresolved).count(),
            "Tag refresh complete"
        );
        Ok(observed)
    }

    fn is_candidate(&self, asg: &AutoScalingGroup) -> bool {
        asg.tag(CLUSTER_TAG) == Some(self.cluster_name.as_str())
    }

    async fn observe(&self, asg: &AutoScalingGroup) -> ObservedAsg {
        let policy = Policy::from_tag(asg.tag(POLICY_TAG));
        let mut observed = ObservedAsg {
            name: asg.name.clone(),
            policy,
            not_terminate: parse_not_terminate(asg.tag(NOT_TERMINATE_TAG)),
            zones: asg.availability_zones.clone(),
            launch: None,
            unresolved: false,
        };

        if !policy.is_managed() {
            return observed;
        }

        let Some(lc_name) = asg.launch_configuration_name.as_ref() else {
            warn!(asg = %asg.name, "Managed group has no launch configuration, skipping");
            observed.unresolved = true;
            return observed;
        };

        let cloud = self.cloud.as_ref();
        match retry(&self.retry, self.clock.as_ref(), "describe_launch_configuration", move || {
            cloud.describe_launch_configuration(lc_name)
        })
        .await
        {
            Ok(config) => {
                observed.launch = Some(LaunchSnapshot {
                    name: config.name.clone(),
                    instance_type: config.instance_type.clone(),
                    purchase_option: config.purchase_option(),
                });
            }
            Err(e) => {
                warn!(
                    asg = %asg.name,
                    launch_config = %lc_name,
                    permission = e.is_permission(),
                    error = %e,
                    "Failed to describe launch configuration, skipping group this cycle"
                );
                observed.unresolved = true;
            }
        }
        observed
    }
}
