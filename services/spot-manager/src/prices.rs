//! Spot and on-demand price cache.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use spotter_cloud::CloudApi;
use spotter_reconcile::{retry, Clock, RetryPolicy};
use tracing::{debug, instrument, warn};

/// An (instance type, availability zone) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PriceKey {
    pub instance_type: String,
    pub zone: String,
}

impl PriceKey {
    pub fn new(instance_type: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            instance_type: instance_type.into(),
            zone: zone.into(),
        }
    }
}

/// Last known spot price for one pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpotPriceSample {
    pub price: f64,

    /// Timestamp reported by the provider's price history.
    pub sampled_at: DateTime<Utc>,

    /// When this sample was last successfully renewed.
    pub fetched_at: DateTime<Utc>,

    /// Set when the most recent refresh for this pair failed.
    pub failed: bool,
}

/// A price together with whether it may be acted on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceQuote {
    pub price: f64,
    pub stale: bool,
}

/// Counters from one refresh pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PriceRefreshStats {
    pub requested: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Cached price for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct PriceView {
    #[serde(flatten)]
    pub key: PriceKey,
    pub price: f64,
    pub on_demand: Option<f64>,
    pub stale: bool,
    pub fetched_at: DateTime<Utc>,
}

/// Caches spot prices per (instance type, zone) and on-demand prices per
/// instance type.
///
/// Spot samples go stale after one refresh interval without renewal, or
/// immediately when their last refresh failed. On-demand prices are list
/// prices and never go stale.
pub struct SpotPriceCache {
    cloud: Arc<dyn CloudApi>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    refresh_interval: Duration,
    spot: HashMap<PriceKey, SpotPriceSample>,
    on_demand: HashMap<String, f64>,
}

impl SpotPriceCache {
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        clock: Arc<dyn Clock>,
        refresh_interval: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            cloud,
            clock,
            retry,
            refresh_interval,
            spot: HashMap::new(),
            on_demand: HashMap::new(),
        }
    }

    /// Fetch prices for exactly `keys`, plus on-demand prices for their
    /// instance types. The spot table is replaced wholesale; pairs not
    /// requested are dropped.
    #[instrument(skip_all, fields(pairs = keys.len()))]
    pub async fn refresh(&mut self, keys: &BTreeSet<PriceKey>) -> PriceRefreshStats {
        let mut stats = PriceRefreshStats {
            requested: keys.len(),
            ..Default::default()
        };
        let cloud = self.cloud.as_ref();
        let clock = self.clock.as_ref();

        let mut spot = HashMap::with_capacity(keys.len());
        for key in keys {
            let fetched = retry(&self.retry, clock, "spot_price", move || {
                cloud.spot_price(&key.instance_type, &key.zone)
            })
            .await;

            match fetched {
                Ok(Some(record)) => {
                    stats.updated += 1;
                    spot.insert(
                        key.clone(),
                        SpotPriceSample {
                            price: record.price,
                            sampled_at: record.timestamp,
                            fetched_at: clock.now(),
                            failed: false,
                        },
                    );
                }
                outcome => {
                    stats.failed += 1;
                    match outcome {
                        Err(e) => warn!(
                            instance_type = %key.instance_type,
                            zone = %key.zone,
                            error = %e,
                            "Spot price refresh failed, keeping previous sample"
                        ),
                        _ => warn!(
                            instance_type = %key.instance_type,
                            zone = %key.zone,
                            "No spot price history, keeping previous sample"
                        ),
                    }
                    if let Some(previous) = self.spot.get(key) {
                        spot.insert(
                            key.clone(),
                            SpotPriceSample {
                                failed: true,
                                ..previous.clone()
                            },
                        );
                    }
                }
            }
        }
        self.spot = spot;

        let instance_types: BTreeSet<&str> =
            keys.iter().map(|k| k.instance_type.as_str()).collect();
        for instance_type in instance_types {
            let fetched = retry(&self.retry, clock, "on_demand_price", move || {
                cloud.on_demand_price(instance_type)
            })
            .await;

            match fetched {
                Ok(Some(price)) => {
                    self.on_demand.insert(instance_type.to_string(), price);
                }
                Ok(None) => {
                    warn!(instance_type, "No on-demand price published");
                }
                Err(e) => {
                    warn!(instance_type, error = %e, "On-demand price refresh failed");
                }
            }
        }

        debug!(
            requested = stats.requested,
            updated = stats.updated,
            failed = stats.failed,
            "Price refresh complete"
        );
        stats
    }

    /// Last known spot price for a pair.
    pub fn get(&self, instance_type: &str, zone: &str) -> Option<PriceQuote> {
        let sample = self.spot.get(&PriceKey::new(instance_type, zone))?;
        Some(PriceQuote {
            price: sample.price,
            stale: self.is_stale(sample),
        })
    }

    /// On-demand price for an instance type.
    pub fn on_demand(&self, instance_type: &str) -> Option<f64> {
        self.on_demand.get(instance_type).copied()
    }

    /// Conservative spot price for a group spanning `zones`: the highest
    /// price across them, stale if any zone is stale or has no sample.
    pub fn asg_quote(&self, instance_type: &str, zones: &[String]) -> Option<PriceQuote> {
        let mut quote: Option<PriceQuote> = None;
        let mut missing = false;

        for zone in zones {
            match self.get(instance_type, zone) {
                Some(q) => {
                    quote = Some(match quote {
                        Some(acc) => PriceQuote {
                            price: acc.price.max(q.price),
                            stale: acc.stale || q.stale,
                        },
                        None => q,
                    });
                }
                None => missing = true,
            }
        }

        quote.map(|q| PriceQuote {
            stale: q.stale || missing,
            ..q
        })
    }

    /// All cached spot prices, ordered by key.
    pub fn snapshot(&self) -> Vec<PriceView> {
        let ordered: BTreeMap<&PriceKey, &SpotPriceSample> = self.spot.iter().collect();
        ordered
            .into_iter()
            .map(|(key, sample)| PriceView {
                key: key.clone(),
                price: sample.price,
                on_demand: self.on_demand(&key.instance_type),
                stale: self.is_stale(sample),
                fetched_at: sample.fetched_at,
            })
            .collect()
    }

    fn is_stale(&self, sample: &SpotPriceSample) -> bool {
        if sample.failed {
            return true;
        }
        let window = chrono::Duration::from_std(self.refresh_interval).unwrap_or(chrono::Duration::MAX);
        self.clock.now() - sample.fetched_at > window
    }
}
