//! # spotter-testing
//!
//! Fixtures shared by the workspace's tests: builders for autoscaling groups
//! and launch configurations, and a [`Fixture`] that pairs an
//! [`InMemoryCloud`] with a [`ManualClock`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use spotter_cloud::{AutoScalingGroup, InMemoryCloud, LaunchConfiguration};
use spotter_id::{AsgName, LaunchConfigName};
use spotter_reconcile::ManualClock;

/// Cluster every fixture group is tagged with.
pub const CLUSTER: &str = "prod";

/// Instance type every fixture launch configuration uses.
pub const INSTANCE_TYPE: &str = "m5.large";

/// Default availability zone.
pub const ZONE: &str = "us-west-2a";

pub const CLUSTER_TAG: &str = "KubernetesCluster";
pub const POLICY_TAG: &str = "k8s-minion-manager";
pub const NOT_TERMINATE_TAG: &str = "k8s-minion-manager/not-terminate";

pub fn asg_name(name: &str) -> AsgName {
    AsgName::parse(name).expect("fixture asg name")
}

pub fn lc_name(name: &str) -> LaunchConfigName {
    LaunchConfigName::parse(name).expect("fixture launch configuration name")
}

// =============================================================================
// Launch Configurations
// =============================================================================

/// Builder for [`LaunchConfiguration`].
#[derive(Debug, Clone)]
pub struct LaunchConfigBuilder {
    config: LaunchConfiguration,
}

impl LaunchConfigBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            config: LaunchConfiguration {
                name: lc_name(name),
                image_id: "ami-0abcdef1234567890".to_string(),
                instance_type: INSTANCE_TYPE.to_string(),
                key_name: Some("ops".to_string()),
                security_groups: vec!["sg-nodes".to_string()],
                user_data: Some("IyEvYmluL2Jhc2gK".to_string()),
                iam_instance_profile: Some("nodes".to_string()),
                block_device_mappings: vec![],
                instance_monitoring: true,
                ebs_optimized: false,
                associate_public_ip_address: None,
                spot_price: None,
            },
        }
    }

    pub fn instance_type(mut self, instance_type: &str) -> Self {
        self.config.instance_type = instance_type.to_string();
        self
    }

    /// Make this a spot configuration with the given bid.
    pub fn spot(mut self, bid: f64) -> Self {
        self.config.spot_price = Some(bid);
        self
    }

    pub fn build(self) -> LaunchConfiguration {
        self.config
    }
}

// =============================================================================
// Autoscaling Groups
// =============================================================================

/// Builder for [`AutoScalingGroup`]. Groups start tagged into [`CLUSTER`]
/// with no policy tag.
#[derive(Debug, Clone)]
pub struct AsgBuilder {
    asg: AutoScalingGroup,
}

impl AsgBuilder {
    pub fn new(name: &str) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert(CLUSTER_TAG.to_string(), CLUSTER.to_string());

        Self {
            asg: AutoScalingGroup {
                name: asg_name(name),
                launch_configuration_name: Some(lc_name(&format!("{name}-lc"))),
                availability_zones: vec![ZONE.to_string()],
                desired_capacity: 2,
                instances: vec![],
                tags,
            },
        }
    }

    pub fn launch_config(mut self, name: &str) -> Self {
        self.asg.launch_configuration_name = Some(lc_name(name));
        self
    }

    pub fn zones(mut self, zones: &[&str]) -> Self {
        self.asg.availability_zones = zones.iter().map(|z| z.to_string()).collect();
        self
    }

    pub fn desired(mut self, capacity: u32) -> Self {
        self.asg.desired_capacity = capacity;
        self
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.asg.tags.insert(key.to_string(), value.to_string());
        self
    }

    /// Set the management policy tag.
    pub fn policy(self, value: &str) -> Self {
        self.tag(POLICY_TAG, value)
    }

    pub fn not_terminate(self) -> Self {
        self.tag(NOT_TERMINATE_TAG, "true")
    }

    pub fn cluster(self, cluster: &str) -> Self {
        self.tag(CLUSTER_TAG, cluster)
    }

    pub fn without_cluster_tag(mut self) -> Self {
        self.asg.tags.remove(CLUSTER_TAG);
        self
    }

    pub fn build(self) -> AutoScalingGroup {
        self.asg
    }
}

// =============================================================================
// Fixture
// =============================================================================

/// An in-memory cloud and a manual clock starting at a fixed instant.
pub struct Fixture {
    pub cloud: Arc<InMemoryCloud>,
    pub clock: Arc<ManualClock>,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixture {
    pub fn new() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("fixed start time");
        Self {
            cloud: Arc::new(InMemoryCloud::new()),
            clock: Arc::new(ManualClock::new(start)),
        }
    }

    /// Insert a group together with its launch configuration and launch its
    /// desired capacity. `spot_bid` makes the configuration a spot one.
    pub fn add_asg(&self, builder: AsgBuilder, spot_bid: Option<f64>) -> AsgName {
        let asg = builder.build();
        let name = asg.name.clone();
        let desired = asg.desired_capacity as usize;

        if let Some(lc) = &asg.launch_configuration_name {
            let mut config = LaunchConfigBuilder::new(lc.as_str());
            if let Some(bid) = spot_bid {
                config = config.spot(bid);
            }
            self.cloud.insert_launch_configuration(config.build());
        }
        self.cloud.insert_asg(asg);
        self.cloud.launch_instances(&name, desired);
        name
    }

    /// Set the spot price in every given zone and the on-demand price for
    /// [`INSTANCE_TYPE`].
    pub fn set_prices(&self, zones: &[&str], spot: f64, on_demand: f64) {
        for zone in zones {
            self.cloud.set_spot_price(INSTANCE_TYPE, zone, spot);
        }
        self.cloud.set_on_demand_price(INSTANCE_TYPE, on_demand);
    }
}
