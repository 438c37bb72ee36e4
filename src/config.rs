//! Engine configuration
//!
//! Loaded from TOML (`volcast.toml` by default), then individual
//! `VOLCAST_*` environment variables override single fields.

use crate::conformal::CalibrationConfig;
use crate::events::EventConfig;
use crate::models::{ConformalMode, RangeEstimator, ResidualDomain, StopRule};
use crate::volatility::{Aggregation, GarchParams, HarParams, Innovation, OmegaMode, RangeParams};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database used by the CLI
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default)]
    pub gbm: GbmConfig,

    #[serde(default)]
    pub garch: GarchConfig,

    #[serde(default)]
    pub har: HarConfig,

    #[serde(default)]
    pub range: RangeConfig,

    #[serde(default)]
    pub conformal: ConformalConfig,

    #[serde(default)]
    pub events: EventsConfig,
}

fn default_db_path() -> String {
    "volcast.db".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            gbm: GbmConfig::default(),
            garch: GarchConfig::default(),
            har: HarConfig::default(),
            range: RangeConfig::default(),
            conformal: ConformalConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// File named by `VOLCAST_CONFIG_PATH` (or `volcast.toml`) when present,
    /// defaults otherwise, then env overrides.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let path =
            std::env::var("VOLCAST_CONFIG_PATH").unwrap_or_else(|_| "volcast.toml".to_string());

        let mut config = if Path::new(&path).exists() {
            Self::load(&path)?
        } else {
            debug!("Using default engine config ({} not found)", path);
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides from `lookup`; split out so tests need not touch
    /// the process environment.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid {}={:?}: {}", key, raw, e))
        }

        if let Some(v) = lookup("VOLCAST_DB_PATH") {
            self.db_path = v;
        }
        if let Some(v) = lookup("VOLCAST_GBM_WINDOW") {
            self.gbm.window_n = parse("VOLCAST_GBM_WINDOW", &v)?;
        }
        if let Some(v) = lookup("VOLCAST_DRIFT_SHRINK") {
            self.gbm.lambda_drift = parse("VOLCAST_DRIFT_SHRINK", &v)?;
        }
        if let Some(v) = lookup("VOLCAST_CAL_WINDOW") {
            self.conformal.cal_window = parse("VOLCAST_CAL_WINDOW", &v)?;
        }
        if let Some(v) = lookup("VOLCAST_ENBPI_SEED") {
            self.conformal.seed = parse("VOLCAST_ENBPI_SEED", &v)?;
        }
        if let Some(v) = lookup("VOLCAST_T_MAX") {
            self.events.t_max = parse("VOLCAST_T_MAX", &v)?;
        }
        if let Some(v) = lookup("VOLCAST_K_INSIDE") {
            self.events.k_inside = parse("VOLCAST_K_INSIDE", &v)?;
        }
        if let Some(v) = lookup("VOLCAST_STOP_RULE") {
            self.events.stop_rule = v.trim().to_string();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.garch_params()?;
        self.range_params()?;
        self.calibration(0.95)?;
        self.event_config()?;
        if !(0.0..=1.0).contains(&self.gbm.lambda_drift) {
            anyhow::bail!("gbm.lambda_drift must lie in [0, 1], got {}", self.gbm.lambda_drift);
        }
        Ok(())
    }

    pub fn garch_params(&self) -> Result<GarchParams> {
        let innovation = match self.garch.dist.to_ascii_lowercase().as_str() {
            "normal" | "n" => Innovation::Normal,
            "t" | "student_t" | "student-t" => Innovation::StudentT { df: self.garch.df },
            other => anyhow::bail!("unknown garch.dist {:?}", other),
        };
        let omega = if self.garch.variance_targeting {
            OmegaMode::VarianceTargeting
        } else {
            OmegaMode::FixedFraction {
                fraction: self.garch.omega_fraction,
            }
        };
        Ok(GarchParams {
            window: self.garch.window,
            innovation,
            omega,
        })
    }

    pub fn har_params(&self) -> HarParams {
        HarParams {
            window: self.har.window,
        }
    }

    pub fn range_params(&self) -> Result<RangeParams> {
        let estimator: RangeEstimator = self
            .range
            .estimator
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let aggregation = match self.range.ewma_lambda {
            Some(lambda) if (0.0..1.0).contains(&lambda) => Aggregation::Ewma { lambda },
            Some(lambda) => anyhow::bail!("range.ewma_lambda must lie in [0, 1), got {}", lambda),
            None => Aggregation::Mean,
        };
        Ok(RangeParams {
            estimator,
            window: self.range.window,
            aggregation,
        })
    }

    /// Calibration settings for a target coverage.
    pub fn calibration(&self, coverage: f64) -> Result<CalibrationConfig> {
        let mode: ConformalMode = self
            .conformal
            .mode
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let domain: ResidualDomain = self
            .conformal
            .domain
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        Ok(CalibrationConfig {
            mode,
            domain,
            cal_window: self.conformal.cal_window,
            coverage,
            eta: self.conformal.eta,
            bootstrap_k: self.conformal.bootstrap_k,
            seed: self.conformal.seed,
        })
    }

    pub fn event_config(&self) -> Result<EventConfig> {
        let stop_rule = match self.events.stop_rule.to_ascii_lowercase().as_str() {
            "re_entry" | "reentry" | "re-entry" => {
                if !(1..=2).contains(&self.events.k_inside) {
                    anyhow::bail!("events.k_inside must be 1 or 2, got {}", self.events.k_inside);
                }
                StopRule::ReEntry {
                    k_inside: self.events.k_inside,
                }
            }
            "sign_flip" | "signflip" | "sign-flip" => StopRule::SignFlip,
            other => anyhow::bail!("unknown events.stop_rule {:?}", other),
        };
        if self.events.t_max == 0 {
            anyhow::bail!("events.t_max must be at least 1");
        }
        Ok(EventConfig {
            stop_rule,
            t_max: self.events.t_max,
        })
    }
}

/// GBM drift/volatility window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbmConfig {
    /// Number of returns (prices used = window_n + 1)
    #[serde(default = "default_gbm_window")]
    pub window_n: usize,

    /// Drift shrinkage in [0, 1]; 0 drops the drift entirely
    #[serde(default)]
    pub lambda_drift: f64,
}

fn default_gbm_window() -> usize {
    252
}

impl Default for GbmConfig {
    fn default() -> Self {
        Self {
            window_n: default_gbm_window(),
            lambda_drift: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GarchConfig {
    #[serde(default = "default_garch_window")]
    pub window: usize,

    /// `normal` or `t`
    #[serde(default = "default_garch_dist")]
    pub dist: String,

    /// Fixed Student-t degrees of freedom; grid-searched when absent
    #[serde(default)]
    pub df: Option<f64>,

    #[serde(default = "default_true")]
    pub variance_targeting: bool,

    /// ω as a fraction of sample variance when targeting is off
    #[serde(default = "default_omega_fraction")]
    pub omega_fraction: f64,
}

fn default_garch_window() -> usize {
    1000
}
fn default_garch_dist() -> String {
    "normal".to_string()
}
fn default_true() -> bool {
    true
}
fn default_omega_fraction() -> f64 {
    0.05
}

impl Default for GarchConfig {
    fn default() -> Self {
        Self {
            window: default_garch_window(),
            dist: default_garch_dist(),
            df: None,
            variance_targeting: true,
            omega_fraction: default_omega_fraction(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarConfig {
    #[serde(default = "default_har_window")]
    pub window: Option<usize>,
}

fn default_har_window() -> Option<usize> {
    Some(500)
}

impl Default for HarConfig {
    fn default() -> Self {
        Self {
            window: default_har_window(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeConfig {
    /// `P`, `GK`, `RS` or `YZ`
    #[serde(default = "default_range_estimator")]
    pub estimator: String,

    #[serde(default = "default_range_window")]
    pub window: usize,

    /// EWMA decay; simple mean when absent
    #[serde(default)]
    pub ewma_lambda: Option<f64>,
}

fn default_range_estimator() -> String {
    "YZ".to_string()
}
fn default_range_window() -> usize {
    22
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            estimator: default_range_estimator(),
            window: default_range_window(),
            ewma_lambda: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConformalConfig {
    /// `ICP`, `ICP-SCALED`, `CQR`, `EnbPI` or `ACI`
    #[serde(default = "default_conformal_mode")]
    pub mode: String,

    /// `log` or `price`
    #[serde(default = "default_conformal_domain")]
    pub domain: String,

    #[serde(default = "default_cal_window")]
    pub cal_window: usize,

    #[serde(default = "default_eta")]
    pub eta: f64,

    #[serde(default = "default_bootstrap_k")]
    pub bootstrap_k: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_conformal_mode() -> String {
    "ICP".to_string()
}
fn default_conformal_domain() -> String {
    "log".to_string()
}
fn default_cal_window() -> usize {
    250
}
fn default_eta() -> f64 {
    0.01
}
fn default_bootstrap_k() -> usize {
    20
}
fn default_seed() -> u64 {
    42
}

impl Default for ConformalConfig {
    fn default() -> Self {
        Self {
            mode: default_conformal_mode(),
            domain: default_conformal_domain(),
            cal_window: default_cal_window(),
            eta: default_eta(),
            bootstrap_k: default_bootstrap_k(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// `re_entry` or `sign_flip`
    #[serde(default = "default_stop_rule")]
    pub stop_rule: String,

    #[serde(default = "default_k_inside")]
    pub k_inside: u32,

    #[serde(default = "default_t_max")]
    pub t_max: u32,
}

fn default_stop_rule() -> String {
    "re_entry".to_string()
}
fn default_k_inside() -> u32 {
    2
}
fn default_t_max() -> u32 {
    20
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            stop_rule: default_stop_rule(),
            k_inside: default_k_inside(),
            t_max: default_t_max(),
        }
    }
}
