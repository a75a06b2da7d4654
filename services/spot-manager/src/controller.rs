//! Process-scoped controller.
//!
//! Owns the resolver, the price cache and the engine, drives the two refresh
//! timers, and runs plans as tasks. Task results come back through the same
//! loop, so the engine has a single writer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use spotter_cloud::CloudApi;
use spotter_id::AsgName;
use spotter_reconcile::Clock;
use tokio::sync::watch;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::engine::{AsgState, Plan, ReconciliationEngine};
use crate::mutator::{AsgMutator, MutationError, MutatorConfig, PendingCleanup, TransitionOutcome};
use crate::prices::{PriceView, SpotPriceCache};
use crate::tags::TagPolicyResolver;

/// Point-in-time view published for the status API.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub updated_at: Option<DateTime<Utc>>,
    pub in_flight: usize,
    pub asgs: Vec<AsgState>,
    pub prices: Vec<PriceView>,
}

enum TaskReport {
    Transition {
        asg: AsgName,
        result: Result<TransitionOutcome, MutationError>,
    },
    Cleanup {
        asg: AsgName,
        result: Result<Option<PendingCleanup>, MutationError>,
    },
}

#[derive(Clone, Copy)]
enum TaskKind {
    Transition,
    Cleanup,
}

/// The spot manager's reconciliation loop.
pub struct Controller {
    tag_refresh_interval: Duration,
    price_refresh_interval: Duration,
    resolver: TagPolicyResolver,
    prices: SpotPriceCache,
    engine: ReconciliationEngine,
    mutator: Arc<AsgMutator>,
    tasks: JoinSet<TaskReport>,
    running: HashMap<Id, (AsgName, TaskKind)>,
    clock: Arc<dyn Clock>,
    shutdown: watch::Receiver<bool>,
    status: watch::Sender<StatusSnapshot>,
}

impl Controller {
    /// Build a controller. Nothing talks to the cloud until
    /// [`initialize`](Self::initialize).
    pub fn new(
        config: &Config,
        cloud: Arc<dyn CloudApi>,
        clock: Arc<dyn Clock>,
        mutator_config: MutatorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let refresh_retry = mutator_config.call_retry.clone();
        let resolver = TagPolicyResolver::new(
            Arc::clone(&cloud),
            Arc::clone(&clock),
            config.cluster_name.clone(),
            refresh_retry.clone(),
        );
        let prices = SpotPriceCache::new(
            Arc::clone(&cloud),
            Arc::clone(&clock),
            config.price_refresh_interval,
            refresh_retry,
        );
        let mutator = AsgMutator::new(
            Arc::clone(&cloud),
            Arc::clone(&clock),
            mutator_config,
            shutdown.clone(),
        );
        let (status, _) = watch::channel(StatusSnapshot::default());

        Self {
            tag_refresh_interval: config.tag_refresh_interval,
            price_refresh_interval: config.price_refresh_interval,
            resolver,
            prices,
            engine: ReconciliationEngine::new(config.bid_ceiling, config.events_only),
            mutator: Arc::new(mutator),
            tasks: JoinSet::new(),
            running: HashMap::new(),
            clock,
            shutdown,
            status,
        }
    }

    /// Perform the first tag and price refresh. A failure here means the
    /// cloud cannot be reached or the credentials are unusable.
    #[instrument(skip(self))]
    pub async fn initialize(&mut self) -> Result<()> {
        let observed = self
            .resolver
            .refresh()
            .await
            .context("initial autoscaling group listing failed")?;
        self.engine.apply_observations(&observed);

        let keys = self.engine.price_keys();
        let stats = self.prices.refresh(&keys).await;
        if stats.requested > 0 && stats.failed == stats.requested {
            warn!(pairs = stats.requested, "No spot prices available after initial refresh");
        }

        info!(
            tracked = self.engine.states().count(),
            price_pairs = stats.requested,
            "Controller initialized"
        );
        self.publish_status();
        Ok(())
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub fn prices(&self) -> &SpotPriceCache {
        &self.prices
    }

    /// Receiver for status snapshots.
    pub fn status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    /// Re-list groups and apply their policies. A failed listing leaves the
    /// engine unchanged.
    #[instrument(skip(self))]
    pub async fn refresh_tags(&mut self) {
        match self.resolver.refresh().await {
            Ok(observed) => self.engine.apply_observations(&observed),
            Err(e) => warn!(permission = e.is_permission(), error = %e, "Tag refresh failed"),
        }
    }

    /// Re-fetch prices for the groups currently tracked.
    #[instrument(skip(self))]
    pub async fn refresh_prices(&mut self) {
        let keys = self.engine.price_keys();
        let stats = self.prices.refresh(&keys).await;
        if stats.failed > 0 {
            warn!(failed = stats.failed, requested = stats.requested, "Some spot prices could not be refreshed");
        }
    }

    /// Evaluate every group and start the resulting plans.
    pub fn reconcile(&mut self) {
        for plan in self.engine.evaluate(&self.prices) {
            self.spawn(plan);
        }
    }

    fn spawn(&mut self, plan: Plan) {
        let asg = plan.asg().clone();
        let mutator = Arc::clone(&self.mutator);

        let (kind, handle) = match plan {
            Plan::Transition(plan) => (
                TaskKind::Transition,
                self.tasks.spawn(async move {
                    let result = mutator.transition(&plan).await;
                    TaskReport::Transition {
                        asg: plan.asg.clone(),
                        result,
                    }
                }),
            ),
            Plan::Cleanup(plan) => (
                TaskKind::Cleanup,
                self.tasks.spawn(async move {
                    let result = mutator.sweep(&plan).await;
                    TaskReport::Cleanup {
                        asg: plan.asg.clone(),
                        result,
                    }
                }),
            ),
        };
        debug!(asg = %asg, task_id = %handle.id(), "Spawned mutation task");
        self.running.insert(handle.id(), (asg, kind));
    }

    fn handle_joined(&mut self, joined: Result<(Id, TaskReport), JoinError>) {
        match joined {
            Ok((id, report)) => {
                self.running.remove(&id);
                match report {
                    TaskReport::Transition { asg, result } => {
                        self.engine.complete_transition(&asg, result)
                    }
                    TaskReport::Cleanup { asg, result } => self.engine.complete_cleanup(&asg, result),
                }
            }
            Err(e) => {
                let Some((asg, kind)) = self.running.remove(&e.id()) else {
                    error!(error = %e, "Unknown mutation task failed");
                    return;
                };
                error!(asg = %asg, error = %e, "Mutation task panicked");
                let failure = MutationError::Task(e.to_string());
                match kind {
                    TaskKind::Transition => self.engine.complete_transition(&asg, Err(failure)),
                    TaskKind::Cleanup => self.engine.complete_cleanup(&asg, Err(failure)),
                }
            }
        }
    }

    /// Apply the results of every task that has already finished.
    pub fn collect_finished(&mut self) {
        while let Some(joined) = self.tasks.try_join_next_with_id() {
            self.handle_joined(joined);
        }
    }

    /// Wait for all in-flight plans and apply their results.
    pub async fn drain(&mut self) {
        if !self.tasks.is_empty() {
            info!(in_flight = self.tasks.len(), "Waiting for in-flight mutations");
        }
        while let Some(joined) = self.tasks.join_next_with_id().await {
            self.handle_joined(joined);
        }
        self.publish_status();
    }

    /// One full pass: refresh tags and prices, reconcile, and wait for the
    /// resulting plans.
    pub async fn run_once(&mut self) {
        self.refresh_tags().await;
        self.refresh_prices().await;
        self.reconcile();
        self.drain().await;
    }

    fn publish_status(&self) {
        let snapshot = StatusSnapshot {
            updated_at: Some(self.clock.now()),
            in_flight: self.engine.in_flight(),
            asgs: self.engine.states().cloned().collect(),
            prices: self.prices.snapshot(),
        };
        self.status.send_replace(snapshot);
    }

    /// Run until shutdown is signalled, then drain in-flight plans.
    ///
    /// Expects [`initialize`](Self::initialize) to have run; the first
    /// evaluation happens immediately.
    #[instrument(skip(self))]
    pub async fn run(&mut self) {
        info!(
            tag_refresh_secs = self.tag_refresh_interval.as_secs(),
            price_refresh_secs = self.price_refresh_interval.as_secs(),
            "Starting controller"
        );

        let mut shutdown = self.shutdown.clone();
        let mut tag_timer = tokio::time::interval(self.tag_refresh_interval);
        let mut price_timer = tokio::time::interval(self.price_refresh_interval);
        tag_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        price_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Initialization already did the first refreshes.
        tag_timer.tick().await;
        price_timer.tick().await;

        self.reconcile();
        self.publish_status();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = tag_timer.tick() => {
                    self.refresh_tags().await;
                    self.reconcile();
                }
                _ = price_timer.tick() => {
                    self.refresh_prices().await;
                    self.reconcile();
                }
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.handle_joined(joined);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            self.publish_status();
        }

        info!("Controller shutting down");
        self.drain().await;
        info!("Controller stopped");
    }
}
