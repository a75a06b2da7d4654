//! Configuration for the spot manager.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

/// Maximum price bid for spot capacity.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum BidCeiling {
    /// Bid the instance type's on-demand price.
    #[default]
    OnDemand,

    /// Bid a fixed hourly price.
    Fixed(f64),
}

impl BidCeiling {
    /// Bid to place given the current on-demand price.
    pub fn bid(&self, on_demand: f64) -> f64 {
        match self {
            BidCeiling::OnDemand => on_demand,
            BidCeiling::Fixed(price) => *price,
        }
    }
}

impl fmt::Display for BidCeiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BidCeiling::OnDemand => write!(f, "on-demand"),
            BidCeiling::Fixed(price) => write!(f, "fixed:{price}"),
        }
    }
}

impl FromStr for BidCeiling {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("on-demand") {
            return Ok(BidCeiling::OnDemand);
        }

        let Some(price) = s.strip_prefix("fixed:") else {
            bail!("invalid bid ceiling {s:?}, expected \"on-demand\" or \"fixed:<price>\"");
        };
        let price: f64 = price
            .trim()
            .parse()
            .with_context(|| format!("invalid fixed bid price {price:?}"))?;
        if !price.is_finite() || price <= 0.0 {
            bail!("fixed bid price must be positive, got {price}");
        }
        Ok(BidCeiling::Fixed(price))
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "pretty" => Ok(LogFormat::Text),
            other => Err(anyhow!("invalid log format {other:?}, expected \"json\" or \"text\"")),
        }
    }
}

/// Spot manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Value of the cluster tag that selects candidate groups.
    pub cluster_name: String,

    /// Cloud region the groups live in.
    pub region: String,

    /// How often groups and their tags are re-listed.
    pub tag_refresh_interval: Duration,

    /// How often spot prices are re-fetched. Also the staleness window.
    pub price_refresh_interval: Duration,

    pub bid_ceiling: BidCeiling,

    /// Log decisions without mutating anything.
    pub events_only: bool,

    /// Address for the status API. Disabled when unset.
    pub status_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// JSON seed for the in-memory cloud.
    pub dev_seed: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| anyhow!("{key} must be set"))
        };

        let cluster_name = required("SPOTTER_CLUSTER_NAME")?;
        let region = required("SPOTTER_REGION")?;

        let tag_refresh_interval = secs(&lookup, "SPOTTER_TAG_REFRESH_SECS", 300)?;
        let price_refresh_interval = secs(&lookup, "SPOTTER_PRICE_REFRESH_SECS", 600)?;

        let bid_ceiling = lookup("SPOTTER_BID_CEILING")
            .map(|v| v.parse::<BidCeiling>())
            .transpose()
            .context("SPOTTER_BID_CEILING")?
            .unwrap_or_default();

        let events_only = lookup("SPOTTER_EVENTS_ONLY")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let status_addr = lookup("SPOTTER_STATUS_ADDR")
            .filter(|v| !v.is_empty())
            .map(|v| v.parse::<SocketAddr>())
            .transpose()
            .context("SPOTTER_STATUS_ADDR")?;

        let log_level = lookup("SPOTTER_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let log_format = lookup("SPOTTER_LOG_FORMAT")
            .map(|v| v.parse::<LogFormat>())
            .transpose()
            .context("SPOTTER_LOG_FORMAT")?
            .unwrap_or_default();

        let dev_seed = lookup("SPOTTER_DEV_SEED")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            cluster_name,
            region,
            tag_refresh_interval,
            price_refresh_interval,
            bid_ceiling,
            events_only,
            status_addr,
            log_level,
            log_format,
            dev_seed,
        })
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    let Some(raw) = lookup(key) else {
        return Ok(Duration::from_secs(default));
    };
    let secs: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a whole number of seconds, got {raw:?}"))?;
    if secs == 0 {
        bail!("{key} must be greater than zero");
    }
    Ok(Duration::from_secs(secs))
}
