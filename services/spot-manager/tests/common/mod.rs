//! Shared setup for controller integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use spotter_id::AsgName;
use spotter_manager::{AsgState, Config, Controller, MutatorConfig};
use spotter_reconcile::{BackoffPolicy, RetryPolicy};
use spotter_testing::{Fixture, CLUSTER};
use tokio::sync::watch;

pub fn config(extra: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = [
        ("SPOTTER_CLUSTER_NAME", CLUSTER),
        ("SPOTTER_REGION", "us-west-2"),
    ]
    .iter()
    .chain(extra)
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    vars.entry("SPOTTER_LOG_LEVEL".to_string())
        .or_insert_with(|| "debug".to_string());
    Config::from_lookup(|key| vars.get(key).cloned()).expect("test config")
}

/// Small budgets with a fixed one second delay, so tests run quickly against
/// the manual clock.
pub fn mutator_config() -> MutatorConfig {
    let policy = |attempts| RetryPolicy {
        max_attempts: attempts,
        backoff: BackoffPolicy::constant(Duration::from_secs(1)),
    };
    MutatorConfig {
        call_retry: policy(3),
        confirm: policy(5),
        capacity: policy(5),
    }
}

pub struct Harness {
    pub fixture: Fixture,
    pub controller: Controller,
    pub shutdown: watch::Sender<bool>,
}

impl Harness {
    pub async fn start(fixture: Fixture) -> Self {
        Self::start_with(fixture, &[]).await
    }

    pub async fn start_with(fixture: Fixture, extra: &[(&str, &str)]) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut controller = Controller::new(
            &config(extra),
            fixture.cloud.clone(),
            fixture.clock.clone(),
            mutator_config(),
            shutdown_rx,
        );
        controller.initialize().await.expect("controller initializes");

        Self {
            fixture,
            controller,
            shutdown,
        }
    }

    pub fn state(&self, name: &AsgName) -> AsgState {
        self.controller
            .engine()
            .get(name)
            .cloned()
            .expect("group is tracked")
    }
}
