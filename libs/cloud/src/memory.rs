//! In-memory cloud implementation.
//!
//! Behaves like the provider in the ways the reconciliation loop cares
//! about: launch configuration names are unique, referenced configurations
//! cannot be deleted, group updates can lag behind reads, and terminating an
//! instance makes the group launch a replacement from its current
//! configuration. Every call is recorded, and failures can be injected per
//! operation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use spotter_id::{AsgName, InstanceId, LaunchConfigName};
use tracing::debug;

use crate::error::{CloudError, CloudResult, ResourceKind};
use crate::types::{
    ActivityStatus, AsgInstance, AutoScalingGroup, HealthStatus, LaunchConfiguration,
    LifecycleState, PurchaseOption, ScalingActivity, SpotPriceRecord,
};
use crate::CloudApi;

/// Cloud operations, for fault injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    DescribeAutoScalingGroups,
    DescribeAutoScalingGroup,
    DescribeLaunchConfiguration,
    CreateLaunchConfiguration,
    DeleteLaunchConfiguration,
    UpdateAutoScalingGroup,
    DescribeScalingActivities,
    TerminateInstance,
    SpotPrice,
    OnDemandPrice,
}

impl Operation {
    /// Whether the operation changes cloud state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Operation::CreateLaunchConfiguration
                | Operation::DeleteLaunchConfiguration
                | Operation::UpdateAutoScalingGroup
                | Operation::TerminateInstance
        )
    }
}

/// A recorded call with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum CloudCall {
    DescribeAutoScalingGroups,
    DescribeAutoScalingGroup(AsgName),
    DescribeLaunchConfiguration(LaunchConfigName),
    CreateLaunchConfiguration(LaunchConfiguration),
    DeleteLaunchConfiguration(LaunchConfigName),
    UpdateAutoScalingGroup {
        asg: AsgName,
        launch_config: LaunchConfigName,
    },
    DescribeScalingActivities(AsgName),
    TerminateInstance(InstanceId),
    SpotPrice {
        instance_type: String,
        availability_zone: String,
    },
    OnDemandPrice(String),
}

impl CloudCall {
    pub fn operation(&self) -> Operation {
        match self {
            CloudCall::DescribeAutoScalingGroups => Operation::DescribeAutoScalingGroups,
            CloudCall::DescribeAutoScalingGroup(_) => Operation::DescribeAutoScalingGroup,
            CloudCall::DescribeLaunchConfiguration(_) => Operation::DescribeLaunchConfiguration,
            CloudCall::CreateLaunchConfiguration(_) => Operation::CreateLaunchConfiguration,
            CloudCall::DeleteLaunchConfiguration(_) => Operation::DeleteLaunchConfiguration,
            CloudCall::UpdateAutoScalingGroup { .. } => Operation::UpdateAutoScalingGroup,
            CloudCall::DescribeScalingActivities(_) => Operation::DescribeScalingActivities,
            CloudCall::TerminateInstance(_) => Operation::TerminateInstance,
            CloudCall::SpotPrice { .. } => Operation::SpotPrice,
            CloudCall::OnDemandPrice(_) => Operation::OnDemandPrice,
        }
    }

    pub fn is_mutation(&self) -> bool {
        self.operation().is_mutation()
    }
}

/// Initial contents for an [`InMemoryCloud`], loadable from JSON.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub auto_scaling_groups: Vec<AutoScalingGroup>,

    #[serde(default)]
    pub launch_configurations: Vec<LaunchConfiguration>,

    #[serde(default)]
    pub spot_prices: Vec<SpotPriceRecord>,

    /// Instance type to hourly on-demand price.
    #[serde(default)]
    pub on_demand_prices: BTreeMap<String, f64>,
}

struct PendingUpdate {
    launch_config: LaunchConfigName,
    remaining_reads: u32,
}

struct State {
    asgs: BTreeMap<AsgName, AutoScalingGroup>,
    launch_configs: BTreeMap<LaunchConfigName, LaunchConfiguration>,
    activities: HashMap<AsgName, Vec<ScalingActivity>>,
    spot_prices: HashMap<(String, String), SpotPriceRecord>,
    on_demand_prices: HashMap<String, f64>,
    calls: Vec<CloudCall>,
    faults: HashMap<Operation, VecDeque<CloudError>>,
    pending_updates: HashMap<AsgName, PendingUpdate>,
    propagation_lag: u32,
    auto_replace: bool,
    next_instance: u64,
    next_activity: u64,
}

impl State {
    fn record(&mut self, call: CloudCall) -> CloudResult<()> {
        let op = call.operation();
        self.calls.push(call);
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => {
                debug!(operation = ?op, error = %err, "Injected cloud failure");
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Advance read-after-write lag for a group and return its visible state.
    fn read_asg(&mut self, name: &AsgName) -> Option<AutoScalingGroup> {
        if let Some(pending) = self.pending_updates.get_mut(name) {
            if pending.remaining_reads == 0 {
                let lc = pending.launch_config.clone();
                self.pending_updates.remove(name);
                if let Some(asg) = self.asgs.get_mut(name) {
                    asg.launch_configuration_name = Some(lc);
                }
            } else {
                pending.remaining_reads -= 1;
            }
        }
        self.asgs.get(name).cloned()
    }

    /// Configuration the group will launch from once pending updates land.
    fn effective_launch_config(&self, name: &AsgName) -> Option<LaunchConfigName> {
        self.pending_updates
            .get(name)
            .map(|p| p.launch_config.clone())
            .or_else(|| self.asgs.get(name).and_then(|a| a.launch_configuration_name.clone()))
    }

    fn next_instance_id(&mut self) -> Option<InstanceId> {
        self.next_instance += 1;
        InstanceId::parse(&format!("i-{:017x}", self.next_instance)).ok()
    }

    fn push_activity(&mut self, asg: &AsgName, description: String) {
        self.next_activity += 1;
        let activity = ScalingActivity {
            activity_id: format!("act-{:08}", self.next_activity),
            description,
            status: ActivityStatus::Successful,
            progress: 100,
            status_message: None,
            start_time: Utc::now(),
        };
        self.activities.entry(asg.clone()).or_default().push(activity);
    }

    fn launch_instance(&mut self, asg_name: &AsgName, zone: String) -> Option<InstanceId> {
        let lc_name = self.effective_launch_config(asg_name)?;
        let purchase_option = self
            .launch_configs
            .get(&lc_name)
            .map(LaunchConfiguration::purchase_option)
            .unwrap_or(PurchaseOption::OnDemand);
        let instance_id = self.next_instance_id()?;

        let asg = self.asgs.get_mut(asg_name)?;
        asg.instances.push(AsgInstance {
            instance_id: instance_id.clone(),
            launch_configuration_name: Some(lc_name),
            availability_zone: zone,
            lifecycle_state: LifecycleState::InService,
            health: HealthStatus::Healthy,
            purchase_option,
        });
        self.push_activity(asg_name, format!("Launching a new EC2 instance: {instance_id}"));
        Some(instance_id)
    }
}

/// In-process [`CloudApi`] implementation.
pub struct InMemoryCloud {
    state: Mutex<State>,
}

impl Default for InMemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCloud {
    /// Create an empty cloud.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                asgs: BTreeMap::new(),
                launch_configs: BTreeMap::new(),
                activities: HashMap::new(),
                spot_prices: HashMap::new(),
                on_demand_prices: HashMap::new(),
                calls: Vec::new(),
                faults: HashMap::new(),
                pending_updates: HashMap::new(),
                propagation_lag: 0,
                auto_replace: true,
                next_instance: 0,
                next_activity: 0,
            }),
        }
    }

    /// Create a cloud populated from a seed.
    pub fn from_seed(seed: Seed) -> Self {
        let cloud = Self::new();
        for lc in seed.launch_configurations {
            cloud.insert_launch_configuration(lc);
        }
        for asg in seed.auto_scaling_groups {
            cloud.insert_asg(asg);
        }
        for record in seed.spot_prices {
            cloud.set_spot_price(&record.instance_type, &record.availability_zone, record.price);
        }
        for (instance_type, price) in seed.on_demand_prices {
            cloud.set_on_demand_price(&instance_type, price);
        }
        cloud
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -------------------------------------------------------------------------
    // Setup
    // -------------------------------------------------------------------------

    pub fn insert_asg(&self, asg: AutoScalingGroup) {
        let mut state = self.lock();
        let max_seen = asg
            .instances
            .iter()
            .filter_map(|i| u64::from_str_radix(i.instance_id.as_str().trim_start_matches("i-"), 16).ok())
            .max()
            .unwrap_or(0);
        state.next_instance = state.next_instance.max(max_seen);
        state.asgs.insert(asg.name.clone(), asg);
    }

    pub fn remove_asg(&self, name: &AsgName) {
        let mut state = self.lock();
        state.asgs.remove(name);
        state.pending_updates.remove(name);
    }

    pub fn insert_launch_configuration(&self, config: LaunchConfiguration) {
        self.lock().launch_configs.insert(config.name.clone(), config);
    }

    /// Launch `count` in-service instances from the group's configuration,
    /// spread over its zones.
    pub fn launch_instances(&self, asg: &AsgName, count: usize) -> Vec<InstanceId> {
        let mut state = self.lock();
        let zones = state
            .asgs
            .get(asg)
            .map(|a| a.availability_zones.clone())
            .unwrap_or_default();
        (0..count)
            .filter_map(|i| {
                let zone = zones.get(i % zones.len().max(1)).cloned().unwrap_or_default();
                state.launch_instance(asg, zone)
            })
            .collect()
    }

    pub fn set_tag(&self, asg: &AsgName, key: &str, value: &str) {
        if let Some(asg) = self.lock().asgs.get_mut(asg) {
            asg.tags.insert(key.to_string(), value.to_string());
        }
    }

    pub fn remove_tag(&self, asg: &AsgName, key: &str) {
        if let Some(asg) = self.lock().asgs.get_mut(asg) {
            asg.tags.remove(key);
        }
    }

    pub fn set_spot_price(&self, instance_type: &str, availability_zone: &str, price: f64) {
        let record = SpotPriceRecord {
            instance_type: instance_type.to_string(),
            availability_zone: availability_zone.to_string(),
            price,
            timestamp: Utc::now(),
        };
        self.lock().spot_prices.insert(
            (instance_type.to_string(), availability_zone.to_string()),
            record,
        );
    }

    pub fn set_on_demand_price(&self, instance_type: &str, price: f64) {
        self.lock()
            .on_demand_prices
            .insert(instance_type.to_string(), price);
    }

    /// Record a scaling activity as reported by the group.
    pub fn push_activity(&self, asg: &AsgName, activity: ScalingActivity) {
        self.lock()
            .activities
            .entry(asg.clone())
            .or_default()
            .push(activity);
    }

    /// Fail the next call of `op` with `err`.
    pub fn fail_next(&self, op: Operation, err: CloudError) {
        self.fail_times(op, err, 1);
    }

    /// Fail the next `times` calls of `op` with `err`.
    pub fn fail_times(&self, op: Operation, err: CloudError, times: usize) {
        let mut state = self.lock();
        let queue = state.faults.entry(op).or_default();
        queue.extend(std::iter::repeat_n(err, times));
    }

    /// Drop all pending injected failures.
    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Number of group reads that keep returning the old launch configuration
    /// after an update.
    pub fn set_propagation_lag(&self, reads: u32) {
        self.lock().propagation_lag = reads;
    }

    /// Whether terminating an instance launches a replacement.
    pub fn set_auto_replace(&self, enabled: bool) {
        self.lock().auto_replace = enabled;
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn calls(&self) -> Vec<CloudCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn count(&self, op: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation() == op)
            .count()
    }

    pub fn mutation_calls(&self) -> Vec<CloudCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.is_mutation())
            .cloned()
            .collect()
    }

    /// Current group state, including updates not yet visible to readers.
    pub fn asg(&self, name: &AsgName) -> Option<AutoScalingGroup> {
        let state = self.lock();
        let mut asg = state.asgs.get(name).cloned()?;
        if let Some(pending) = state.pending_updates.get(name) {
            asg.launch_configuration_name = Some(pending.launch_config.clone());
        }
        Some(asg)
    }

    pub fn launch_configuration(&self, name: &LaunchConfigName) -> Option<LaunchConfiguration> {
        self.lock().launch_configs.get(name).cloned()
    }

    pub fn launch_configuration_names(&self) -> Vec<LaunchConfigName> {
        self.lock().launch_configs.keys().cloned().collect()
    }
}

#[async_trait]
impl CloudApi for InMemoryCloud {
    async fn describe_auto_scaling_groups(&self) -> CloudResult<Vec<AutoScalingGroup>> {
        let mut state = self.lock();
        state.record(CloudCall::DescribeAutoScalingGroups)?;
        let names: Vec<AsgName> = state.asgs.keys().cloned().collect();
        Ok(names.iter().filter_map(|n| state.read_asg(n)).collect())
    }

    async fn describe_auto_scaling_group(&self, name: &AsgName) -> CloudResult<AutoScalingGroup> {
        let mut state = self.lock();
        state.record(CloudCall::DescribeAutoScalingGroup(name.clone()))?;
        state
            .read_asg(name)
            .ok_or_else(|| CloudError::not_found(ResourceKind::AutoScalingGroup, name))
    }

    async fn describe_launch_configuration(
        &self,
        name: &LaunchConfigName,
    ) -> CloudResult<LaunchConfiguration> {
        let mut state = self.lock();
        state.record(CloudCall::DescribeLaunchConfiguration(name.clone()))?;
        state
            .launch_configs
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found(ResourceKind::LaunchConfiguration, name))
    }

    async fn create_launch_configuration(&self, config: &LaunchConfiguration) -> CloudResult<()> {
        let mut state = self.lock();
        state.record(CloudCall::CreateLaunchConfiguration(config.clone()))?;
        if state.launch_configs.contains_key(&config.name) {
            return Err(CloudError::already_exists(
                ResourceKind::LaunchConfiguration,
                &config.name,
            ));
        }
        state
            .launch_configs
            .insert(config.name.clone(), config.clone());
        Ok(())
    }

    async fn delete_launch_configuration(&self, name: &LaunchConfigName) -> CloudResult<()> {
        let mut state = self.lock();
        state.record(CloudCall::DeleteLaunchConfiguration(name.clone()))?;
        if !state.launch_configs.contains_key(name) {
            return Err(CloudError::not_found(ResourceKind::LaunchConfiguration, name));
        }
        let referenced = state
            .asgs
            .keys()
            .any(|asg| state.effective_launch_config(asg).as_ref() == Some(name))
            || state
                .asgs
                .values()
                .any(|asg| asg.launch_configuration_name.as_ref() == Some(name));
        if referenced {
            return Err(CloudError::in_use(ResourceKind::LaunchConfiguration, name));
        }
        state.launch_configs.remove(name);
        Ok(())
    }

    async fn update_auto_scaling_group(
        &self,
        name: &AsgName,
        launch_config: &LaunchConfigName,
    ) -> CloudResult<()> {
        let mut state = self.lock();
        state.record(CloudCall::UpdateAutoScalingGroup {
            asg: name.clone(),
            launch_config: launch_config.clone(),
        })?;
        if !state.asgs.contains_key(name) {
            return Err(CloudError::not_found(ResourceKind::AutoScalingGroup, name));
        }
        if !state.launch_configs.contains_key(launch_config) {
            return Err(CloudError::not_found(
                ResourceKind::LaunchConfiguration,
                launch_config,
            ));
        }

        let lag = state.propagation_lag;
        if lag == 0 {
            state.pending_updates.remove(name);
            if let Some(asg) = state.asgs.get_mut(name) {
                asg.launch_configuration_name = Some(launch_config.clone());
            }
        } else {
            state.pending_updates.insert(
                name.clone(),
                PendingUpdate {
                    launch_config: launch_config.clone(),
                    remaining_reads: lag,
                },
            );
        }
        Ok(())
    }

    async fn describe_scaling_activities(
        &self,
        name: &AsgName,
    ) -> CloudResult<Vec<ScalingActivity>> {
        let mut state = self.lock();
        state.record(CloudCall::DescribeScalingActivities(name.clone()))?;
        if !state.asgs.contains_key(name) {
            return Err(CloudError::not_found(ResourceKind::AutoScalingGroup, name));
        }
        let mut activities = state.activities.get(name).cloned().unwrap_or_default();
        activities.reverse();
        Ok(activities)
    }

    async fn terminate_instance_in_auto_scaling_group(
        &self,
        instance_id: &InstanceId,
        should_decrement_desired_capacity: bool,
    ) -> CloudResult<()> {
        let mut state = self.lock();
        state.record(CloudCall::TerminateInstance(instance_id.clone()))?;

        let found = state.asgs.iter_mut().find_map(|(name, asg)| {
            let idx = asg
                .instances
                .iter()
                .position(|i| &i.instance_id == instance_id)?;
            let removed = asg.instances.remove(idx);
            if should_decrement_desired_capacity {
                asg.desired_capacity = asg.desired_capacity.saturating_sub(1);
            }
            Some((name.clone(), removed.availability_zone))
        });
        let Some((asg_name, zone)) = found else {
            return Err(CloudError::not_found(ResourceKind::Instance, instance_id));
        };

        state.push_activity(&asg_name, format!("Terminating EC2 instance: {instance_id}"));
        if state.auto_replace && !should_decrement_desired_capacity {
            state.launch_instance(&asg_name, zone);
        }
        Ok(())
    }

    async fn spot_price(
        &self,
        instance_type: &str,
        availability_zone: &str,
    ) -> CloudResult<Option<SpotPriceRecord>> {
        let mut state = self.lock();
        state.record(CloudCall::SpotPrice {
            instance_type: instance_type.to_string(),
            availability_zone: availability_zone.to_string(),
        })?;
        Ok(state
            .spot_prices
            .get(&(instance_type.to_string(), availability_zone.to_string()))
            .cloned())
    }

    async fn on_demand_price(&self, instance_type: &str) -> CloudResult<Option<f64>> {
        let mut state = self.lock();
        state.record(CloudCall::OnDemandPrice(instance_type.to_string()))?;
        Ok(state.on_demand_prices.get(instance_type).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asg_name() -> AsgName {
        AsgName::parse("nodes").unwrap()
    }

    fn lc_name() -> LaunchConfigName {
        LaunchConfigName::parse("nodes-lc").unwrap()
    }

    fn launch_config(name: LaunchConfigName, spot_price: Option<f64>) -> LaunchConfiguration {
        LaunchConfiguration {
            name,
            image_id: "ami-1".to_string(),
            instance_type: "m5.large".to_string(),
            key_name: None,
            security_groups: vec![],
            user_data: None,
            iam_instance_profile: None,
            block_device_mappings: vec![],
            instance_monitoring: false,
            ebs_optimized: false,
            associate_public_ip_address: None,
            spot_price,
        }
    }

    fn seeded() -> InMemoryCloud {
        let cloud = InMemoryCloud::new();
        cloud.insert_launch_configuration(launch_config(lc_name(), None));
        cloud.insert_asg(AutoScalingGroup {
            name: asg_name(),
            launch_configuration_name: Some(lc_name()),
            availability_zones: vec!["us-west-2a".to_string(), "us-west-2b".to_string()],
            desired_capacity: 2,
            instances: vec![],
            tags: BTreeMap::new(),
        });
        cloud.launch_instances(&asg_name(), 2);
        cloud
    }

    #[tokio::test]
    async fn test_delete_referenced_launch_config_is_refused() {
        let cloud = seeded();
        let err = cloud.delete_launch_configuration(&lc_name()).await.unwrap_err();
        assert!(matches!(err, CloudError::InUse { .. }));
    }

    #[tokio::test]
    async fn test_create_duplicate_launch_config() {
        let cloud = seeded();
        let err = cloud
            .create_launch_configuration(&launch_config(lc_name(), None))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_update_propagates_after_lag() {
        let cloud = seeded();
        let next = lc_name().successor();
        cloud.insert_launch_configuration(launch_config(next.clone(), Some(0.05)));
        cloud.set_propagation_lag(2);

        cloud.update_auto_scaling_group(&asg_name(), &next).await.unwrap();

        for _ in 0..2 {
            let asg = cloud.describe_auto_scaling_group(&asg_name()).await.unwrap();
            assert_eq!(asg.launch_configuration_name, Some(lc_name()));
        }
        let asg = cloud.describe_auto_scaling_group(&asg_name()).await.unwrap();
        assert_eq!(asg.launch_configuration_name, Some(next));
    }

    #[tokio::test]
    async fn test_terminate_launches_replacement_from_current_config() {
        let cloud = seeded();
        let next = lc_name().successor();
        cloud.insert_launch_configuration(launch_config(next.clone(), Some(0.05)));
        cloud.update_auto_scaling_group(&asg_name(), &next).await.unwrap();

        let victim = cloud.asg(&asg_name()).unwrap().instances[0].instance_id.clone();
        cloud
            .terminate_instance_in_auto_scaling_group(&victim, false)
            .await
            .unwrap();

        let asg = cloud.asg(&asg_name()).unwrap();
        assert_eq!(asg.instances.len(), 2);
        assert!(asg.instances.iter().all(|i| i.instance_id != victim));
        let replacement = asg.instances.last().unwrap();
        assert_eq!(replacement.launch_configuration_name, Some(next));
        assert_eq!(replacement.purchase_option, PurchaseOption::Spot);
    }

    #[tokio::test]
    async fn test_injected_fault_is_consumed_once() {
        let cloud = seeded();
        cloud.fail_next(
            Operation::DescribeAutoScalingGroups,
            CloudError::Throttled("Rate exceeded".to_string()),
        );

        assert!(cloud.describe_auto_scaling_groups().await.is_err());
        assert_eq!(cloud.describe_auto_scaling_groups().await.unwrap().len(), 1);
        assert_eq!(cloud.count(Operation::DescribeAutoScalingGroups), 2);
        assert!(cloud.mutation_calls().is_empty());
    }

    #[test]
    fn test_seed_from_json() {
        let json = serde_json::json!({
            "auto_scaling_groups": [{
                "name": "nodes",
                "launch_configuration_name": "nodes-lc",
                "availability_zones": ["us-west-2a"],
                "desired_capacity": 1,
                "tags": {"KubernetesCluster": "prod"}
            }],
            "launch_configurations": [{
                "name": "nodes-lc",
                "image_id": "ami-1",
                "instance_type": "m5.large"
            }],
            "on_demand_prices": {"m5.large": 0.096}
        });
        let seed: Seed = serde_json::from_value(json).unwrap();
        let cloud = InMemoryCloud::from_seed(seed);

        assert!(cloud.asg(&asg_name()).is_some());
        assert!(cloud.launch_configuration(&lc_name()).is_some());
    }
}
