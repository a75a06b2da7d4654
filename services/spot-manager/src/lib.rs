//! Spot manager library.
//!
//! Keeps autoscaling groups on spot capacity while spot is cheaper than
//! on-demand, and moves them back when it is not.
//!
//! ## Architecture
//!
//! - **TagPolicyResolver**: lists candidate groups and parses policy tags
//! - **SpotPriceCache**: caches spot and on-demand prices with staleness
//! - **ReconciliationEngine**: decides which groups need a transition
//! - **AsgMutator**: swaps launch configurations and replaces instances
//! - **Controller**: drives the refresh timers and runs plans as tasks

pub mod config;
pub mod controller;
pub mod engine;
pub mod mutator;
pub mod prices;
pub mod status;
pub mod tags;

pub use config::{BidCeiling, Config, LogFormat};
pub use controller::{Controller, StatusSnapshot};
pub use engine::{AsgState, Mode, Plan, ReconciliationEngine};
pub use mutator::{AsgMutator, MutationError, MutatorConfig, PendingCleanup, TransitionOutcome};
pub use prices::{PriceKey, PriceQuote, SpotPriceCache};
pub use tags::{ObservedAsg, Policy, TagPolicyResolver};
