//! Integration tests for the reconciliation loop.
//!
//! Each test drives the controller against the in-memory cloud one pass at a
//! time and checks the calls it made.

mod common;

use std::time::Duration;

use common::Harness;
use spotter_cloud::{CloudCall, CloudError, Operation, PurchaseOption};
use spotter_manager::{Mode, Policy};
use spotter_testing::{lc_name, AsgBuilder, Fixture, ZONE};

fn position(calls: &[CloudCall], op: Operation) -> usize {
    calls
        .iter()
        .position(|c| c.operation() == op)
        .expect("call was made")
}

#[tokio::test]
async fn test_unmanaged_groups_receive_no_mutations() {
    let fixture = Fixture::new();
    fixture.add_asg(AsgBuilder::new("untagged"), None);
    fixture.add_asg(AsgBuilder::new("typo").policy("use_spot"), None);
    fixture.add_asg(AsgBuilder::new("elsewhere").cluster("staging").policy("use-spot"), None);
    fixture.set_prices(&[ZONE], 0.01, 0.10);
    let mut harness = Harness::start(fixture).await;

    for _ in 0..5 {
        harness.fixture.clock.advance(Duration::from_secs(300));
        harness.controller.run_once().await;
    }

    assert!(harness.fixture.cloud.mutation_calls().is_empty());
    assert_eq!(harness.controller.engine().states().count(), 0);
}

#[tokio::test]
async fn test_price_crossing_moves_group_to_spot() {
    let fixture = Fixture::new();
    let name = fixture.add_asg(AsgBuilder::new("nodes").policy("use-spot"), None);
    fixture.set_prices(&[ZONE], 0.05, 0.10);
    let mut harness = Harness::start(fixture).await;
    assert_eq!(harness.state(&name).mode, Mode::OnDemand);

    harness.controller.run_once().await;

    let cloud = &harness.fixture.cloud;
    assert_eq!(cloud.count(Operation::CreateLaunchConfiguration), 1);
    assert_eq!(cloud.launch_configuration_names(), vec![lc_name("nodes-lc-0")]);

    let new_config = cloud.launch_configuration(&lc_name("nodes-lc-0")).unwrap();
    assert_eq!(new_config.purchase_option(), PurchaseOption::Spot);
    assert_eq!(new_config.spot_price, Some(0.10));

    let asg = cloud.asg(&name).unwrap();
    assert_eq!(asg.launch_configuration_name, Some(lc_name("nodes-lc-0")));
    assert_eq!(asg.instances.len(), 2);
    assert!(asg.instances.iter().all(|i| i.purchase_option == PurchaseOption::Spot));

    // Old configuration deleted only after the group switched over.
    let calls = cloud.calls();
    assert!(
        position(&calls, Operation::UpdateAutoScalingGroup)
            < position(&calls, Operation::DeleteLaunchConfiguration)
    );
    assert_eq!(cloud.count(Operation::TerminateInstance), 2);

    let state = harness.state(&name);
    assert_eq!(state.mode, Mode::Spot);
    assert_eq!(state.launch_config, lc_name("nodes-lc-0"));
    assert!(state.pending_cleanup.is_none());
}

#[tokio::test]
async fn test_unchanged_inputs_are_idempotent() {
    let fixture = Fixture::new();
    let name = fixture.add_asg(AsgBuilder::new("nodes").policy("use-spot"), None);
    fixture.set_prices(&[ZONE], 0.05, 0.10);
    let mut harness = Harness::start(fixture).await;

    harness.controller.run_once().await;
    assert_eq!(harness.state(&name).mode, Mode::Spot);
    harness.fixture.cloud.clear_calls();

    harness.fixture.clock.advance(Duration::from_secs(300));
    harness.controller.run_once().await;

    assert_eq!(harness.fixture.cloud.count(Operation::CreateLaunchConfiguration), 0);
    assert!(harness.fixture.cloud.mutation_calls().is_empty());
    assert_eq!(harness.state(&name).mode, Mode::Spot);
}

#[tokio::test]
async fn test_price_reversal_returns_group_to_on_demand() {
    let fixture = Fixture::new();
    let name = fixture.add_asg(AsgBuilder::new("nodes").policy("use-spot"), Some(0.10));
    fixture.set_prices(&[ZONE], 0.12, 0.10);
    let mut harness = Harness::start(fixture).await;
    assert_eq!(harness.state(&name).mode, Mode::Spot);

    harness.controller.run_once().await;

    let cloud = &harness.fixture.cloud;
    let new_config = cloud.launch_configuration(&lc_name("nodes-lc-0")).unwrap();
    assert_eq!(new_config.spot_price, None);
    assert!(cloud
        .asg(&name)
        .unwrap()
        .instances
        .iter()
        .all(|i| i.purchase_option == PurchaseOption::OnDemand));
    assert_eq!(harness.state(&name).mode, Mode::OnDemand);
}

#[tokio::test]
async fn test_no_spot_policy_moves_off_spot_regardless_of_price() {
    let fixture = Fixture::new();
    let name = fixture.add_asg(AsgBuilder::new("nodes").policy("no-spot"), Some(0.10));
    fixture.set_prices(&[ZONE], 0.01, 0.10);
    let mut harness = Harness::start(fixture).await;

    harness.controller.run_once().await;

    assert_eq!(harness.state(&name).mode, Mode::OnDemand);
    assert_eq!(harness.fixture.cloud.count(Operation::CreateLaunchConfiguration), 1);
}

#[tokio::test]
async fn test_not_terminate_swaps_config_without_terminations() {
    let fixture = Fixture::new();
    let name = fixture.add_asg(AsgBuilder::new("nodes").policy("use-spot").not_terminate(), None);
    fixture.set_prices(&[ZONE], 0.05, 0.10);
    let mut harness = Harness::start(fixture).await;

    harness.controller.run_once().await;

    let cloud = &harness.fixture.cloud;
    assert_eq!(cloud.count(Operation::TerminateInstance), 0);

    let asg = cloud.asg(&name).unwrap();
    assert_eq!(asg.launch_configuration_name, Some(lc_name("nodes-lc-0")));
    assert!(asg.instances.iter().all(|i| i.purchase_option == PurchaseOption::OnDemand));
    assert_eq!(cloud.launch_configuration_names(), vec![lc_name("nodes-lc-0")]);

    let state = harness.state(&name);
    assert_eq!(state.mode, Mode::Spot);
    assert!(state.pending_cleanup.is_none());

    // Later cycles leave the old instances alone too.
    harness.controller.run_once().await;
    assert_eq!(harness.fixture.cloud.count(Operation::TerminateInstance), 0);
}

#[tokio::test]
async fn test_tag_removed_mid_transition_completes_then_unmanaged() {
    let fixture = Fixture::new();
    let name = fixture.add_asg(AsgBuilder::new("nodes").policy("use-spot"), None);
    fixture.set_prices(&[ZONE], 0.05, 0.10);
    let mut harness = Harness::start(fixture).await;

    harness.controller.reconcile();
    assert_eq!(harness.state(&name).mode, Mode::TransitioningToSpot);

    harness.fixture.cloud.remove_tag(&name, spotter_testing::POLICY_TAG);
    harness.controller.refresh_tags().await;
    let state = harness.state(&name);
    assert_eq!(state.policy, Policy::UseSpot);
    assert_eq!(state.mode, Mode::TransitioningToSpot);

    harness.controller.drain().await;
    assert_eq!(harness.state(&name).mode, Mode::Spot);
    let asg = harness.fixture.cloud.asg(&name).unwrap();
    assert!(asg.instances.iter().all(|i| i.purchase_option == PurchaseOption::Spot));

    harness.controller.refresh_tags().await;
    assert_eq!(harness.state(&name).policy, Policy::Unmanaged);

    // Unmanaged from here on, even when spot turns expensive.
    harness.fixture.cloud.clear_calls();
    harness.fixture.set_prices(&[ZONE], 0.50, 0.10);
    for _ in 0..3 {
        harness.controller.run_once().await;
    }
    assert!(harness.fixture.cloud.mutation_calls().is_empty());
    assert_eq!(harness.state(&name).mode, Mode::Spot);
}

#[tokio::test]
async fn test_failed_price_refresh_never_transitions() {
    let fixture = Fixture::new();
    let name = fixture.add_asg(AsgBuilder::new("nodes").policy("use-spot"), None);
    fixture.set_prices(&[ZONE], 0.10, 0.10);
    let mut harness = Harness::start(fixture).await;

    // Spot becomes very cheap, but the refresh that would see it fails.
    harness.fixture.cloud.set_spot_price(spotter_testing::INSTANCE_TYPE, ZONE, 0.01);
    harness.fixture.cloud.fail_times(
        Operation::SpotPrice,
        CloudError::Unavailable("503".into()),
        100,
    );
    for _ in 0..3 {
        harness.controller.run_once().await;
    }

    assert!(harness.fixture.cloud.mutation_calls().is_empty());
    assert_eq!(harness.state(&name).mode, Mode::OnDemand);
}

#[tokio::test]
async fn test_expired_price_never_transitions() {
    let fixture = Fixture::new();
    let name = fixture.add_asg(AsgBuilder::new("nodes").policy("use-spot"), None);
    fixture.set_prices(&[ZONE], 0.05, 0.10);
    let mut harness = Harness::start(fixture).await;

    // Favourable sample, but older than one price refresh interval.
    harness.fixture.clock.advance(Duration::from_secs(601));
    harness.controller.refresh_tags().await;
    harness.controller.reconcile();
    harness.controller.drain().await;

    assert!(harness.fixture.cloud.mutation_calls().is_empty());
    assert_eq!(harness.state(&name).mode, Mode::OnDemand);
}

#[tokio::test]
async fn test_events_only_makes_no_mutations() {
    let fixture = Fixture::new();
    let name = fixture.add_asg(AsgBuilder::new("nodes").policy("use-spot"), None);
    fixture.set_prices(&[ZONE], 0.05, 0.10);
    let mut harness = Harness::start_with(fixture, &[("SPOTTER_EVENTS_ONLY", "1")]).await;

    harness.controller.run_once().await;

    assert!(harness.fixture.cloud.mutation_calls().is_empty());
    assert_eq!(harness.state(&name).mode, Mode::OnDemand);
}

#[tokio::test]
async fn test_failed_update_removes_new_config_and_retries_next_cycle() {
    let fixture = Fixture::new();
    let name = fixture.add_asg(AsgBuilder::new("nodes").policy("use-spot"), None);
    fixture.set_prices(&[ZONE], 0.05, 0.10);
    let mut harness = Harness::start(fixture).await;
    harness.fixture.cloud.fail_next(
        Operation::UpdateAutoScalingGroup,
        CloudError::AccessDenied("autoscaling:UpdateAutoScalingGroup".into()),
    );

    harness.controller.run_once().await;

    let cloud = &harness.fixture.cloud;
    assert_eq!(cloud.launch_configuration_names(), vec![lc_name("nodes-lc")]);
    assert_eq!(cloud.count(Operation::TerminateInstance), 0);
    assert_eq!(harness.state(&name).mode, Mode::OnDemand);

    harness.controller.run_once().await;
    assert_eq!(harness.state(&name).mode, Mode::Spot);
    assert_eq!(
        harness.fixture.cloud.launch_configuration_names(),
        vec![lc_name("nodes-lc-0")]
    );
}

#[tokio::test]
async fn test_propagation_delay_is_waited_out() {
    let fixture = Fixture::new();
    let name = fixture.add_asg(AsgBuilder::new("nodes").policy("use-spot"), None);
    fixture.set_prices(&[ZONE], 0.05, 0.10);
    fixture.cloud.set_propagation_lag(2);
    let mut harness = Harness::start(fixture).await;

    harness.controller.run_once().await;

    let state = harness.state(&name);
    assert_eq!(state.mode, Mode::Spot);
    assert!(state.pending_cleanup.is_none());
    assert!(!harness.fixture.clock.sleeps().is_empty());
}

#[tokio::test]
async fn test_unconfirmed_config_keeps_old_one_for_cleanup() {
    let fixture = Fixture::new();
    let name = fixture.add_asg(AsgBuilder::new("nodes").policy("use-spot"), None);
    fixture.set_prices(&[ZONE], 0.05, 0.10);
    fixture.cloud.set_propagation_lag(100);
    let mut harness = Harness::start(fixture).await;

    harness.controller.run_once().await;

    let cloud = &harness.fixture.cloud;
    assert_eq!(cloud.count(Operation::TerminateInstance), 0);
    assert_eq!(cloud.count(Operation::DeleteLaunchConfiguration), 0);

    let state = harness.state(&name);
    assert_eq!(state.mode, Mode::Spot);
    let cleanup = state.pending_cleanup.expect("cleanup recorded");
    assert_eq!(cleanup.orphan, Some(lc_name("nodes-lc")));
    assert_eq!(cleanup.stragglers.len(), 2);
}

#[tokio::test]
async fn test_stragglers_are_swept_on_a_later_cycle() {
    let fixture = Fixture::new();
    let name = fixture.add_asg(AsgBuilder::new("nodes").policy("use-spot"), None);
    fixture.set_prices(&[ZONE], 0.05, 0.10);
    let mut harness = Harness::start(fixture).await;
    harness.fixture.cloud.fail_next(
        Operation::TerminateInstance,
        CloudError::AccessDenied("autoscaling:TerminateInstanceInAutoScalingGroup".into()),
    );

    harness.controller.run_once().await;

    let state = harness.state(&name);
    assert_eq!(state.mode, Mode::Spot);
    let cleanup = state.pending_cleanup.expect("partial transition");
    assert_eq!(cleanup.stragglers.len(), 2);
    assert_eq!(cleanup.orphan, Some(lc_name("nodes-lc")));

    harness.controller.run_once().await;

    let state = harness.state(&name);
    assert_eq!(state.mode, Mode::Spot);
    assert!(state.pending_cleanup.is_none());

    let cloud = &harness.fixture.cloud;
    assert_eq!(cloud.count(Operation::CreateLaunchConfiguration), 1);
    assert_eq!(cloud.launch_configuration_names(), vec![lc_name("nodes-lc-0")]);
    assert!(cloud
        .asg(&name)
        .unwrap()
        .instances
        .iter()
        .all(|i| i.purchase_option == PurchaseOption::Spot));
}

#[tokio::test]
async fn test_unreadable_launch_config_keeps_pending_cleanup() {
    let fixture = Fixture::new();
    let name = fixture.add_asg(AsgBuilder::new("nodes").policy("use-spot"), None);
    fixture.set_prices(&[ZONE], 0.05, 0.10);
    let mut harness = Harness::start(fixture).await;
    harness.fixture.cloud.fail_next(
        Operation::TerminateInstance,
        CloudError::AccessDenied("autoscaling:TerminateInstanceInAutoScalingGroup".into()),
    );
    harness.controller.run_once().await;
    let recorded = harness.state(&name).pending_cleanup.expect("partial transition");

    harness.fixture.cloud.fail_next(
        Operation::DescribeLaunchConfiguration,
        CloudError::AccessDenied("autoscaling:DescribeLaunchConfigurations".into()),
    );
    harness.controller.refresh_tags().await;

    let state = harness.state(&name);
    assert_eq!(state.mode, Mode::Spot);
    assert_eq!(state.pending_cleanup, Some(recorded));

    harness.controller.run_once().await;

    let state = harness.state(&name);
    assert!(state.pending_cleanup.is_none());
    let cloud = &harness.fixture.cloud;
    assert_eq!(cloud.launch_configuration_names(), vec![lc_name("nodes-lc-0")]);
    assert!(cloud
        .asg(&name)
        .unwrap()
        .instances
        .iter()
        .all(|i| i.purchase_option == PurchaseOption::Spot));
}

#[tokio::test]
async fn test_groups_transition_independently() {
    let fixture = Fixture::new();
    let a = fixture.add_asg(AsgBuilder::new("a").policy("use-spot"), None);
    let b = fixture.add_asg(AsgBuilder::new("b").policy("use-spot"), None);
    fixture.set_prices(&[ZONE], 0.05, 0.10);
    let mut harness = Harness::start(fixture).await;
    harness.fixture.cloud.fail_next(
        Operation::DescribeAutoScalingGroup,
        CloudError::AccessDenied("autoscaling:DescribeAutoScalingGroups".into()),
    );

    harness.controller.run_once().await;

    // Exactly one of the two hit the injected failure.
    let modes = [harness.state(&a).mode, harness.state(&b).mode];
    assert!(modes.contains(&Mode::Spot));
    assert!(modes.contains(&Mode::OnDemand));

    harness.controller.run_once().await;
    assert_eq!(harness.state(&a).mode, Mode::Spot);
    assert_eq!(harness.state(&b).mode, Mode::Spot);
}
