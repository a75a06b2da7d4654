//! Reconciliation engine.
//!
//! Owns the per-group state table. Each evaluation compares a group's policy
//! and cached prices with its current mode and emits a plan when they
//! disagree. Plans carry the group's exclusion token, so at most one
//! transition or sweep per group is ever in flight.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::Serialize;
use spotter_cloud::PurchaseOption;
use spotter_id::{AsgName, LaunchConfigName};
use spotter_reconcile::{ExclusionToken, KeyedExclusion};
use tracing::{debug, info, warn};

use crate::config::BidCeiling;
use crate::mutator::{MutationError, PendingCleanup, TransitionOutcome};
use crate::prices::{PriceKey, PriceQuote, SpotPriceCache};
use crate::tags::{ObservedAsg, Policy};

// =============================================================================
// State
// =============================================================================

/// Purchasing mode of a group as tracked by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    OnDemand,
    Spot,
    TransitioningToSpot,
    TransitioningToOnDemand,
}

impl Mode {
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Mode::TransitioningToSpot | Mode::TransitioningToOnDemand)
    }

    /// Steady mode a transition lands in. Steady modes map to themselves.
    pub fn target(&self) -> Mode {
        match self {
            Mode::TransitioningToSpot => Mode::Spot,
            Mode::TransitioningToOnDemand => Mode::OnDemand,
            steady => *steady,
        }
    }

    /// Steady mode a transition started from. Steady modes map to themselves.
    pub fn origin(&self) -> Mode {
        match self {
            Mode::TransitioningToSpot => Mode::OnDemand,
            Mode::TransitioningToOnDemand => Mode::Spot,
            steady => *steady,
        }
    }

    fn towards(target: Mode) -> Mode {
        match target {
            Mode::Spot | Mode::TransitioningToSpot => Mode::TransitioningToSpot,
            Mode::OnDemand | Mode::TransitioningToOnDemand => Mode::TransitioningToOnDemand,
        }
    }

    fn purchase_option(&self) -> PurchaseOption {
        match self.target() {
            Mode::Spot => PurchaseOption::Spot,
            _ => PurchaseOption::OnDemand,
        }
    }
}

impl From<PurchaseOption> for Mode {
    fn from(option: PurchaseOption) -> Self {
        match option {
            PurchaseOption::Spot => Mode::Spot,
            PurchaseOption::OnDemand => Mode::OnDemand,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::OnDemand => write!(f, "on-demand"),
            Mode::Spot => write!(f, "spot"),
            Mode::TransitioningToSpot => write!(f, "transitioning-to-spot"),
            Mode::TransitioningToOnDemand => write!(f, "transitioning-to-on-demand"),
        }
    }
}

/// Engine view of one group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AsgState {
    pub name: AsgName,
    pub policy: Policy,
    pub not_terminate: bool,
    pub mode: Mode,
    pub launch_config: LaunchConfigName,
    pub instance_type: String,
    pub zones: Vec<String>,
    pub pending_cleanup: Option<PendingCleanup>,
}

// =============================================================================
// Plans
// =============================================================================

/// Switch a group to a different purchasing option.
#[derive(Debug)]
pub struct TransitionPlan {
    pub asg: AsgName,
    pub target: PurchaseOption,

    /// Spot maximum price. `None` for on-demand.
    pub bid: Option<f64>,

    pub not_terminate: bool,

    _token: ExclusionToken<AsgName>,
}

/// Finish a partial transition.
#[derive(Debug)]
pub struct CleanupPlan {
    pub asg: AsgName,
    pub cleanup: PendingCleanup,
    pub not_terminate: bool,

    _token: ExclusionToken<AsgName>,
}

/// Work the engine wants done against the cloud.
#[derive(Debug)]
pub enum Plan {
    Transition(TransitionPlan),
    Cleanup(CleanupPlan),
}

impl Plan {
    pub fn asg(&self) -> &AsgName {
        match self {
            Plan::Transition(plan) => &plan.asg,
            Plan::Cleanup(plan) => &plan.asg,
        }
    }
}

/// Counters from one evaluation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvaluateStats {
    pub evaluated: usize,
    pub transitions: usize,
    pub cleanups: usize,
    pub suppressed: usize,
}

// =============================================================================
// Decision
// =============================================================================

/// Steady mode a group should move to, or `None` to leave it alone.
///
/// `ceiling` is the price spot has to beat. A missing or stale spot price, or
/// a missing ceiling, is no evidence and never moves a `UseSpot` group.
pub fn decide(
    policy: Policy,
    mode: Mode,
    spot: Option<PriceQuote>,
    ceiling: Option<f64>,
) -> Option<Mode> {
    if mode.is_transitioning() {
        return None;
    }

    match policy {
        Policy::Unmanaged => None,
        Policy::NoSpot => (mode != Mode::OnDemand).then_some(Mode::OnDemand),
        Policy::UseSpot => {
            let (Some(quote), Some(ceiling)) = (spot, ceiling) else {
                return None;
            };
            if quote.stale {
                return None;
            }
            match mode {
                Mode::OnDemand if quote.price < ceiling => Some(Mode::Spot),
                Mode::Spot if quote.price >= ceiling => Some(Mode::OnDemand),
                _ => None,
            }
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Single owner of the group state table.
pub struct ReconciliationEngine {
    states: BTreeMap<AsgName, AsgState>,
    exclusion: KeyedExclusion<AsgName>,
    bid_ceiling: BidCeiling,
    events_only: bool,
}

impl ReconciliationEngine {
    pub fn new(bid_ceiling: BidCeiling, events_only: bool) -> Self {
        Self {
            states: BTreeMap::new(),
            exclusion: KeyedExclusion::new(),
            bid_ceiling,
            events_only,
        }
    }

    pub fn get(&self, name: &AsgName) -> Option<&AsgState> {
        self.states.get(name)
    }

    pub fn states(&self) -> impl Iterator<Item = &AsgState> {
        self.states.values()
    }

    /// Groups with a plan currently executing.
    pub fn in_flight(&self) -> usize {
        self.exclusion.held_count()
    }

    /// Price pairs needed by managed groups.
    pub fn price_keys(&self) -> BTreeSet<PriceKey> {
        self.states
            .values()
            .filter(|s| s.policy.is_managed())
            .flat_map(|s| s.zones.iter().map(|z| PriceKey::new(&s.instance_type, z)))
            .collect()
    }

    /// Apply a completed tag refresh.
    pub fn apply_observations(&mut self, observed: &[ObservedAsg]) {
        let mut seen = HashSet::with_capacity(observed.len());

        for obs in observed {
            seen.insert(obs.name.clone());
            if obs.unresolved {
                debug!(asg = %obs.name, "Launch configuration unknown this cycle, keeping previous state");
                continue;
            }
            let busy = self.exclusion.is_held(&obs.name);

            match self.states.get_mut(&obs.name) {
                Some(state) if busy || state.mode.is_transitioning() => {
                    debug!(asg = %obs.name, mode = %state.mode, "Plan in flight, deferring tag update");
                }
                Some(state) => {
                    if state.policy != obs.policy {
                        info!(asg = %obs.name, from = ?state.policy, to = ?obs.policy, "Policy changed");
                    }
                    let was_managed = state.policy.is_managed();
                    state.policy = obs.policy;
                    state.not_terminate = obs.not_terminate;
                    state.zones = obs.zones.clone();

                    if let Some(launch) = &obs.launch {
                        state.instance_type = launch.instance_type.clone();
                        // Re-derive mode when re-entering management or when
                        // the group was switched outside of this process.
                        if !was_managed || launch.name != state.launch_config {
                            state.mode = Mode::from(launch.purchase_option);
                            state.launch_config = launch.name.clone();
                        }
                    }
                }
                None => {
                    let Some(launch) = &obs.launch else {
                        continue;
                    };
                    let mode = Mode::from(launch.purchase_option);
                    info!(asg = %obs.name, policy = ?obs.policy, mode = %mode, "Tracking group");
                    self.states.insert(
                        obs.name.clone(),
                        AsgState {
                            name: obs.name.clone(),
                            policy: obs.policy,
                            not_terminate: obs.not_terminate,
                            mode,
                            launch_config: launch.name.clone(),
                            instance_type: launch.instance_type.clone(),
                            zones: obs.zones.clone(),
                            pending_cleanup: None,
                        },
                    );
                }
            }
        }

        let exclusion = &self.exclusion;
        self.states.retain(|name, state| {
            let keep = seen.contains(name) || state.mode.is_transitioning() || exclusion.is_held(name);
            if !keep {
                info!(asg = %name, "Group no longer listed, dropping");
            }
            keep
        });
    }

    /// Decide what every managed group should do next.
    pub fn evaluate(&mut self, prices: &SpotPriceCache) -> Vec<Plan> {
        let mut plans = Vec::new();
        let mut stats = EvaluateStats::default();

        for state in self.states.values_mut() {
            if !state.policy.is_managed() || state.mode.is_transitioning() {
                continue;
            }
            stats.evaluated += 1;

            let quote = prices.asg_quote(&state.instance_type, &state.zones);
            let on_demand = prices.on_demand(&state.instance_type);
            let ceiling = on_demand.map(|p| p.min(self.bid_ceiling.bid(p)));

            if let Some(target) = decide(state.policy, state.mode, quote, ceiling) {
                let bid = match target {
                    Mode::Spot => on_demand.map(|p| self.bid_ceiling.bid(p)),
                    _ => None,
                };

                if self.events_only {
                    info!(
                        asg = %state.name,
                        from = %state.mode,
                        to = %target,
                        spot = ?quote.map(|q| q.price),
                        on_demand = ?on_demand,
                        "Would transition (events only)"
                    );
                    stats.suppressed += 1;
                    continue;
                }

                let Some(token) = self.exclusion.try_acquire(&state.name) else {
                    debug!(asg = %state.name, "Plan already in flight");
                    continue;
                };

                info!(
                    asg = %state.name,
                    from = %state.mode,
                    to = %target,
                    spot = ?quote.map(|q| q.price),
                    on_demand = ?on_demand,
                    bid = ?bid,
                    "Starting transition"
                );
                state.mode = Mode::towards(target);
                stats.transitions += 1;
                plans.push(Plan::Transition(TransitionPlan {
                    asg: state.name.clone(),
                    target: state.mode.purchase_option(),
                    bid,
                    not_terminate: state.not_terminate,
                    _token: token,
                }));
                continue;
            }

            if let Some(cleanup) = &state.pending_cleanup {
                if self.events_only {
                    stats.suppressed += 1;
                    continue;
                }
                let Some(token) = self.exclusion.try_acquire(&state.name) else {
                    continue;
                };
                debug!(
                    asg = %state.name,
                    stragglers = cleanup.stragglers.len(),
                    orphan = ?cleanup.orphan,
                    "Scheduling cleanup"
                );
                stats.cleanups += 1;
                plans.push(Plan::Cleanup(CleanupPlan {
                    asg: state.name.clone(),
                    cleanup: cleanup.clone(),
                    not_terminate: state.not_terminate,
                    _token: token,
                }));
            }
        }

        debug!(
            evaluated = stats.evaluated,
            transitions = stats.transitions,
            cleanups = stats.cleanups,
            suppressed = stats.suppressed,
            "Evaluation complete"
        );
        plans
    }

    /// Record the result of a transition.
    pub fn complete_transition(
        &mut self,
        name: &AsgName,
        result: Result<TransitionOutcome, MutationError>,
    ) {
        let Some(state) = self.states.get_mut(name) else {
            warn!(asg = %name, "Transition finished for an untracked group");
            return;
        };
        if !state.mode.is_transitioning() {
            warn!(asg = %name, mode = %state.mode, "Transition finished for a group that was not transitioning");
            return;
        }

        match result {
            Ok(outcome) => {
                state.mode = state.mode.target();
                state.launch_config = outcome.launch_config;
                // Launch configuration names alternate between two values, so
                // any earlier orphan is either the new configuration or was
                // deleted by this transition.
                state.pending_cleanup = outcome.cleanup;
                match &state.pending_cleanup {
                    Some(cleanup) => warn!(
                        asg = %name,
                        mode = %state.mode,
                        stragglers = cleanup.stragglers.len(),
                        orphan = ?cleanup.orphan,
                        "Transition partially complete, cleanup pending"
                    ),
                    None => info!(asg = %name, mode = %state.mode, "Transition complete"),
                }
            }
            Err(e) => {
                state.mode = state.mode.origin();
                warn!(
                    asg = %name,
                    mode = %state.mode,
                    permission = e.is_permission(),
                    error = %e,
                    "Transition failed, will retry next cycle"
                );
            }
        }
    }

    /// Record the result of a cleanup sweep. Never changes mode.
    pub fn complete_cleanup(
        &mut self,
        name: &AsgName,
        result: Result<Option<PendingCleanup>, MutationError>,
    ) {
        let Some(state) = self.states.get_mut(name) else {
            return;
        };

        match result {
            Ok(remaining) => {
                if remaining.is_some() {
                    debug!(asg = %name, "Cleanup still pending");
                }
                state.pending_cleanup = remaining;
            }
            Err(e) => {
                warn!(asg = %name, error = %e, "Cleanup failed, will retry next cycle");
            }
        }
    }
}
