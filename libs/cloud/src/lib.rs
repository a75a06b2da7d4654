//! # spotter-cloud
//!
//! The slice of a cloud provider's API the spot manager depends on.
//!
//! ## Modules
//!
//! - `types`: autoscaling groups, launch configurations, scaling activities,
//!   spot price records
//! - `error`: [`CloudError`] and its retry/permission classification
//! - `memory`: [`InMemoryCloud`], a complete in-process implementation used
//!   by tests and development mode
//!
//! A provider SDK binding implements [`CloudApi`]; nothing else in the
//! workspace talks to the provider directly.

use async_trait::async_trait;

mod error;
pub mod memory;
pub mod types;

pub use error::{CloudError, CloudResult, ResourceKind};
pub use memory::{CloudCall, InMemoryCloud, Operation, Seed};
pub use types::*;

use spotter_id::{AsgName, InstanceId, LaunchConfigName};

/// Cloud control-plane operations.
///
/// All calls are network-bound and may fail transiently; callers wrap them in
/// a retry policy.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// List every autoscaling group visible to the caller, with tags.
    async fn describe_auto_scaling_groups(&self) -> CloudResult<Vec<AutoScalingGroup>>;

    /// Describe one autoscaling group.
    async fn describe_auto_scaling_group(&self, name: &AsgName) -> CloudResult<AutoScalingGroup>;

    /// Describe one launch configuration.
    async fn describe_launch_configuration(
        &self,
        name: &LaunchConfigName,
    ) -> CloudResult<LaunchConfiguration>;

    /// Create a launch configuration. Fails with `AlreadyExists` if the name
    /// is taken.
    async fn create_launch_configuration(&self, config: &LaunchConfiguration) -> CloudResult<()>;

    /// Delete a launch configuration. Fails with `InUse` while any group
    /// references it.
    async fn delete_launch_configuration(&self, name: &LaunchConfigName) -> CloudResult<()>;

    /// Point an autoscaling group at a launch configuration.
    async fn update_auto_scaling_group(
        &self,
        name: &AsgName,
        launch_config: &LaunchConfigName,
    ) -> CloudResult<()>;

    /// Recent scaling activities for a group, newest first.
    async fn describe_scaling_activities(&self, name: &AsgName)
        -> CloudResult<Vec<ScalingActivity>>;

    /// Terminate one instance that belongs to an autoscaling group.
    async fn terminate_instance_in_auto_scaling_group(
        &self,
        instance_id: &InstanceId,
        should_decrement_desired_capacity: bool,
    ) -> CloudResult<()>;

    /// Most recent spot price for an instance type in a zone.
    async fn spot_price(
        &self,
        instance_type: &str,
        availability_zone: &str,
    ) -> CloudResult<Option<SpotPriceRecord>>;

    /// On-demand list price for an instance type in the configured region.
    async fn on_demand_price(&self, instance_type: &str) -> CloudResult<Option<f64>>;
}
