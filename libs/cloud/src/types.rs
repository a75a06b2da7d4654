//! Cloud resource types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spotter_id::{AsgName, InstanceId, LaunchConfigName};

// =============================================================================
// Autoscaling Groups
// =============================================================================

/// An autoscaling group as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoScalingGroup {
    pub name: AsgName,

    /// Launch configuration new instances are created from. Groups driven by
    /// launch templates have none and are never managed.
    #[serde(default)]
    pub launch_configuration_name: Option<LaunchConfigName>,

    pub availability_zones: Vec<String>,

    pub desired_capacity: u32,

    #[serde(default)]
    pub instances: Vec<AsgInstance>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl AutoScalingGroup {
    /// Value of a tag, if present.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Instances that are in service and healthy.
    pub fn healthy_in_service(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| i.lifecycle_state == LifecycleState::InService && i.health == HealthStatus::Healthy)
            .count()
    }

    /// Whether the group currently runs at least its desired capacity of
    /// healthy instances.
    pub fn at_capacity(&self) -> bool {
        self.healthy_in_service() >= self.desired_capacity as usize
    }
}

/// An instance as seen through its autoscaling group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsgInstance {
    pub instance_id: InstanceId,

    /// Launch configuration the instance was created from. `None` when the
    /// configuration has since been deleted.
    #[serde(default)]
    pub launch_configuration_name: Option<LaunchConfigName>,

    pub availability_zone: String,

    pub lifecycle_state: LifecycleState,

    pub health: HealthStatus,

    pub purchase_option: PurchaseOption,
}

/// Instance lifecycle state within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    InService,
    Terminating,
    Terminated,
}

/// Group-reported instance health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

// =============================================================================
// Launch Configurations
// =============================================================================

/// How instances are paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PurchaseOption {
    OnDemand,
    Spot,
}

impl std::fmt::Display for PurchaseOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PurchaseOption::OnDemand => write!(f, "on-demand"),
            PurchaseOption::Spot => write!(f, "spot"),
        }
    }
}

/// Block device attached at launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDeviceMapping {
    pub device_name: String,

    #[serde(default)]
    pub volume_size_gib: Option<u32>,

    #[serde(default)]
    pub volume_type: Option<String>,

    #[serde(default)]
    pub delete_on_termination: bool,
}

/// Template an autoscaling group launches instances from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchConfiguration {
    pub name: LaunchConfigName,

    pub image_id: String,

    pub instance_type: String,

    #[serde(default)]
    pub key_name: Option<String>,

    #[serde(default)]
    pub security_groups: Vec<String>,

    /// Base64-encoded user data.
    #[serde(default)]
    pub user_data: Option<String>,

    #[serde(default)]
    pub iam_instance_profile: Option<String>,

    #[serde(default)]
    pub block_device_mappings: Vec<BlockDeviceMapping>,

    #[serde(default)]
    pub instance_monitoring: bool,

    #[serde(default)]
    pub ebs_optimized: bool,

    #[serde(default)]
    pub associate_public_ip_address: Option<bool>,

    /// Maximum spot bid. Present only for spot configurations.
    #[serde(default)]
    pub spot_price: Option<f64>,
}

impl LaunchConfiguration {
    /// Purchasing option instances launched from this configuration use.
    pub fn purchase_option(&self) -> PurchaseOption {
        if self.spot_price.is_some() {
            PurchaseOption::Spot
        } else {
            PurchaseOption::OnDemand
        }
    }

    /// Copy of this configuration under a new name with a different
    /// purchasing option. Everything else is carried over unchanged.
    ///
    /// `bid` is the spot maximum price and is ignored for on-demand.
    pub fn derive(&self, name: LaunchConfigName, option: PurchaseOption, bid: Option<f64>) -> Self {
        let spot_price = match option {
            PurchaseOption::Spot => bid,
            PurchaseOption::OnDemand => None,
        };

        Self {
            name,
            spot_price,
            ..self.clone()
        }
    }
}

// =============================================================================
// Scaling Activities
// =============================================================================

/// Outcome of a scaling activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    InProgress,
    Successful,
    Failed,
    Cancelled,
}

/// A scaling activity (launch or terminate) recorded by a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingActivity {
    pub activity_id: String,

    pub description: String,

    pub status: ActivityStatus,

    /// Percent complete, 0-100.
    pub progress: u8,

    #[serde(default)]
    pub status_message: Option<String>,

    pub start_time: DateTime<Utc>,
}

impl ScalingActivity {
    /// Whether the activity is still running.
    pub fn is_in_progress(&self) -> bool {
        self.status == ActivityStatus::InProgress && self.progress < 100
    }
}

// =============================================================================
// Pricing
// =============================================================================

/// One spot price history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotPriceRecord {
    pub instance_type: String,

    pub availability_zone: String,

    /// Hourly price in USD.
    pub price: f64,

    pub timestamp: DateTime<Utc>,
}
