//! Shared data model: canonical rows, target specs, sigma forecasts,
//! locked forecast records, conformal state, and event records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Canonical price data (externally owned, read-only)
// ============================================================================

/// One trading day of canonical price data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub adj_close: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
    /// Precomputed log return, when the ingest layer supplies one
    #[serde(default)]
    pub r: Option<f64>,
    #[serde(default = "default_valid")]
    pub valid: bool,
}

fn default_valid() -> bool {
    true
}

impl CanonicalRow {
    /// Adjusted close usable in a return computation.
    pub fn price(&self) -> Option<f64> {
        if !self.valid {
            return None;
        }
        self.adj_close.filter(|p| p.is_finite() && *p > 0.0)
    }

    /// OHLC bar, only when all four legs are present and strictly positive.
    pub fn ohlc(&self) -> Option<Ohlc> {
        if !self.valid {
            return None;
        }
        let bar = Ohlc {
            open: self.open?,
            high: self.high?,
            low: self.low?,
            close: self.close?,
        };
        bar.is_valid().then_some(bar)
    }
}

/// Daily OHLC bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Ohlc {
    pub fn new(open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            open,
            high,
            low,
            close,
        }
    }

    pub fn is_valid(&self) -> bool {
        [self.open, self.high, self.low, self.close]
            .iter()
            .all(|v| v.is_finite() && *v > 0.0)
    }
}

/// Log returns between consecutive usable prices.
///
/// A row's precomputed `r` is used when present and the previous row was
/// usable; otherwise the return is recomputed from adjusted closes.
pub fn log_returns(rows: &[CanonicalRow]) -> Vec<f64> {
    let mut out = Vec::with_capacity(rows.len().saturating_sub(1));
    let mut prev: Option<f64> = None;
    for row in rows {
        let Some(price) = row.price() else {
            prev = None;
            continue;
        };
        if let Some(p0) = prev {
            let r = row
                .r
                .filter(|r| r.is_finite())
                .unwrap_or_else(|| (price / p0).ln());
            out.push(r);
        }
        prev = Some(price);
    }
    out
}

/// Per-symbol horizon and coverage defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub symbol: String,
    /// Horizon in trading days (>= 1)
    pub h: u32,
    /// Target coverage, strictly inside (0, 1)
    pub coverage: f64,
    pub exchange_tz: String,
}

// ============================================================================
// Method tags
// ============================================================================

/// Per-day range variance estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RangeEstimator {
    Parkinson,
    GarmanKlass,
    RogersSatchell,
    YangZhang,
}

impl RangeEstimator {
    pub const ALL: [RangeEstimator; 4] = [
        RangeEstimator::Parkinson,
        RangeEstimator::GarmanKlass,
        RangeEstimator::RogersSatchell,
        RangeEstimator::YangZhang,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            RangeEstimator::Parkinson => "P",
            RangeEstimator::GarmanKlass => "GK",
            RangeEstimator::RogersSatchell => "RS",
            RangeEstimator::YangZhang => "YZ",
        }
    }

    /// Estimators that stay unbiased when the open gaps away from the
    /// previous close.
    pub fn is_drift_robust(&self) -> bool {
        matches!(
            self,
            RangeEstimator::RogersSatchell | RangeEstimator::YangZhang
        )
    }
}

impl FromStr for RangeEstimator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "P" | "PARKINSON" => Ok(RangeEstimator::Parkinson),
            "GK" | "GARMAN-KLASS" | "GARMANKLASS" => Ok(RangeEstimator::GarmanKlass),
            "RS" | "ROGERS-SATCHELL" | "ROGERSSATCHELL" => Ok(RangeEstimator::RogersSatchell),
            "YZ" | "YANG-ZHANG" | "YANGZHANG" => Ok(RangeEstimator::YangZhang),
            other => Err(format!("unknown range estimator: {}", other)),
        }
    }
}

/// Base volatility estimator family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Estimator {
    Gbm,
    GarchNormal,
    GarchStudentT,
    HarRv,
    Range(RangeEstimator),
}

impl Estimator {
    pub fn is_garch(&self) -> bool {
        matches!(self, Estimator::GarchNormal | Estimator::GarchStudentT)
    }
}

impl fmt::Display for Estimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Estimator::Gbm => write!(f, "GBM-CC"),
            Estimator::GarchNormal => write!(f, "GARCH11-N"),
            Estimator::GarchStudentT => write!(f, "GARCH11-t"),
            Estimator::HarRv => write!(f, "HAR-RV"),
            Estimator::Range(est) => write!(f, "Range-{}", est.code()),
        }
    }
}

impl FromStr for Estimator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GBM-CC" | "gbm" => Ok(Estimator::Gbm),
            "GARCH11-N" | "garch-n" | "garch" => Ok(Estimator::GarchNormal),
            "GARCH11-t" | "garch-t" => Ok(Estimator::GarchStudentT),
            "HAR-RV" | "har" => Ok(Estimator::HarRv),
            other => {
                let code = other
                    .strip_prefix("Range-")
                    .or_else(|| other.strip_prefix("range-"))
                    .ok_or_else(|| format!("unknown estimator: {}", other))?;
                Ok(Estimator::Range(code.parse()?))
            }
        }
    }
}

/// Conformal calibration mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConformalMode {
    Icp,
    IcpScaled,
    Cqr,
    EnbPi,
    Aci,
}

impl fmt::Display for ConformalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ConformalMode::Icp => "ICP",
            ConformalMode::IcpScaled => "ICP-SCALED",
            ConformalMode::Cqr => "CQR",
            ConformalMode::EnbPi => "EnbPI",
            ConformalMode::Aci => "ACI",
        };
        f.write_str(tag)
    }
}

impl FromStr for ConformalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ICP" => Ok(ConformalMode::Icp),
            "ICP-SCALED" | "ICP_SCALED" => Ok(ConformalMode::IcpScaled),
            "CQR" => Ok(ConformalMode::Cqr),
            "ENBPI" => Ok(ConformalMode::EnbPi),
            "ACI" => Ok(ConformalMode::Aci),
            other => Err(format!("unknown conformal mode: {}", other)),
        }
    }
}

/// Domain in which conformal residuals are scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResidualDomain {
    Log,
    Price,
}

impl FromStr for ResidualDomain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "log" => Ok(ResidualDomain::Log),
            "price" => Ok(ResidualDomain::Price),
            other => Err(format!("unknown residual domain: {}", other)),
        }
    }
}

/// Method tag carried by a forecast record.
///
/// Serialized as its string tag (`"GARCH11-t"`, `"CQR:HAR-RV"`); string
/// handling stays confined to this boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Method {
    Base(Estimator),
    Conformal {
        mode: ConformalMode,
        base: Estimator,
    },
}

impl Method {
    pub fn base(&self) -> Estimator {
        match self {
            Method::Base(est) => *est,
            Method::Conformal { base, .. } => *base,
        }
    }

    pub fn is_conformal(&self) -> bool {
        matches!(self, Method::Conformal { .. })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Base(est) => write!(f, "{}", est),
            Method::Conformal { mode, base } => write!(f, "{}:{}", mode, base),
        }
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((mode, base)) => Ok(Method::Conformal {
                mode: mode.parse()?,
                base: base.parse()?,
            }),
            None => Ok(Method::Base(s.parse()?)),
        }
    }
}

impl From<Method> for String {
    fn from(m: Method) -> Self {
        m.to_string()
    }
}

impl TryFrom<String> for Method {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// ============================================================================
// Sigma forecasts
// ============================================================================

/// GARCH(1,1) fit diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GarchDiagnostics {
    pub omega: f64,
    pub alpha: f64,
    pub beta: f64,
    /// Degrees of freedom for Student-t innovations
    pub df: Option<f64>,
    pub log_likelihood: f64,
    pub persistence: f64,
    /// Days for a variance shock to halve
    pub half_life: Option<f64>,
    pub uncond_variance: f64,
    pub window: usize,
    pub variance_targeting: bool,
    pub near_unit_root: bool,
}

/// HAR-RV regression diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarDiagnostics {
    pub beta0: f64,
    pub beta_d: f64,
    pub beta_w: f64,
    pub beta_m: f64,
    pub r_squared: f64,
    pub n_obs: usize,
}

/// Overnight-gap regime check for range estimators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapDiagnostic {
    pub gap_days: usize,
    pub days_checked: usize,
    pub threshold: f64,
    /// Prefer Rogers-Satchell / Yang-Zhang over Parkinson / Garman-Klass
    pub prefer_drift_robust: bool,
}

/// Range estimator diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeDiagnostics {
    pub estimator: RangeEstimator,
    pub window: usize,
    pub days_used: usize,
    /// Yang-Zhang weight on the open-to-close variance
    pub k: Option<f64>,
    pub ewma_lambda: Option<f64>,
    pub gap: GapDiagnostic,
}

/// Estimator-specific diagnostics attached to a sigma forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SigmaDiagnostics {
    Gbm {
        mu_hat: f64,
        window_n: usize,
    },
    Garch(GarchDiagnostics),
    Har(HarDiagnostics),
    Range(RangeDiagnostics),
}

/// One-day volatility forecast from a single estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigmaForecast {
    pub source: Estimator,
    pub sigma_1d: f64,
    pub sigma2_1d: f64,
    pub diagnostics: SigmaDiagnostics,
}

impl SigmaForecast {
    pub fn from_variance(source: Estimator, sigma2_1d: f64, diagnostics: SigmaDiagnostics) -> Self {
        Self {
            source,
            sigma_1d: sigma2_1d.sqrt(),
            sigma2_1d,
            diagnostics,
        }
    }

    pub fn garch(&self) -> Option<&GarchDiagnostics> {
        match &self.diagnostics {
            SigmaDiagnostics::Garch(g) => Some(g),
            _ => None,
        }
    }
}

/// Critical value and the distribution it came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CriticalValue {
    Normal { value: f64 },
    StudentT { value: f64, df: f64 },
}

impl CriticalValue {
    pub fn value(&self) -> f64 {
        match self {
            CriticalValue::Normal { value } | CriticalValue::StudentT { value, .. } => *value,
        }
    }
}

// ============================================================================
// Forecast records
// ============================================================================

/// Conformal provenance attached to a conformal forecast record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConformalMeta {
    pub mode: ConformalMode,
    pub domain: ResidualDomain,
    pub cal_window: usize,
    pub base_record_id: Uuid,
    pub base_l_h: f64,
    pub base_u_h: f64,
    pub params: ConformalParams,
}

/// Immutable forecast output. Corrections are new records, never edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub id: Uuid,
    pub symbol: String,
    pub date_t: NaiveDate,
    pub method: Method,
    /// Horizon in trading days
    pub horizon_trading: u32,
    /// Calendar days from `date_t` to the target trading day
    pub horizon_calendar_days: i64,
    pub target_date: NaiveDate,
    pub coverage: f64,
    pub spot: f64,
    pub mu_hat: f64,
    pub mu_used: f64,
    pub sigma_1d: f64,
    pub sigma2_1d: f64,
    pub l_h: f64,
    pub u_h: f64,
    /// Fixed one-day band used by the event tracker
    pub l_1: f64,
    pub u_1: f64,
    /// `None` when a price-domain floor puts `l_1` at zero
    pub band_width_bp: Option<f64>,
    pub m_log: f64,
    pub s_scale: f64,
    pub m_log_1: f64,
    pub s_scale_1: f64,
    pub critical: CriticalValue,
    pub sigma_diagnostics: Option<SigmaDiagnostics>,
    pub vol_percentile: Option<f64>,
    pub params: serde_json::Value,
    pub conformal: Option<ConformalMeta>,
    pub locked: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl ForecastRecord {
    /// Whether `price` lies inside the one-day band.
    pub fn one_day_contains(&self, price: f64) -> bool {
        price >= self.l_1 && price <= self.u_1
    }
}

// ============================================================================
// Conformal state
// ============================================================================

/// Mode-specific calibrated parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConformalParams {
    Icp {
        q_cal: f64,
    },
    IcpScaled {
        q_cal_scaled: f64,
    },
    Cqr {
        delta_l: f64,
        delta_u: f64,
    },
    EnbPi {
        q_cal: f64,
        resamples: usize,
        oob_residuals: usize,
        /// True when no out-of-bag residual materialized and ICP was used
        fell_back_to_icp: bool,
    },
    Aci {
        theta: f64,
        eta: f64,
    },
}

/// Hit/miss statistics over a calibration window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageStats {
    pub n: usize,
    pub miss_count: usize,
    pub hit_rate: f64,
    /// Hit rate over the most recent 60 pairs
    pub hit_rate_last60: f64,
    pub avg_width: f64,
}

/// Result of one calibration pass. Recomputed from scratch on every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConformalState {
    pub symbol: String,
    pub mode: ConformalMode,
    pub domain: ResidualDomain,
    pub base_method: Estimator,
    pub horizon: u32,
    pub coverage: f64,
    pub cal_window: usize,
    pub params: ConformalParams,
    /// Coverage of the uncorrected base intervals
    pub base_coverage: CoverageStats,
    /// In-sample coverage after applying the calibrated correction
    pub calibrated_coverage: CoverageStats,
}

// ============================================================================
// Event records
// ============================================================================

/// Breakout direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn sign(&self) -> i8 {
        match self {
            Direction::Up => 1,
            Direction::Down => -1,
        }
    }
}

/// Stop rule, chosen per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum StopRule {
    /// Stop after `k_inside` consecutive in-band days
    ReEntry { k_inside: u32 },
    /// Stop on the first return against the breakout direction
    SignFlip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ReEntry,
    SignFlip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CensorReason {
    #[serde(rename = "T_max")]
    TMax,
    #[serde(rename = "end_of_sample")]
    EndOfSample,
}

impl fmt::Display for CensorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CensorReason::TMax => f.write_str("T_max"),
            CensorReason::EndOfSample => f.write_str("end_of_sample"),
        }
    }
}

/// One out-of-band episode for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub symbol: String,
    pub breakout_date: NaiveDate,
    /// Date of the forecast whose band was escaped
    pub forecast_date: NaiveDate,
    pub direction: Direction,
    pub z_score: f64,
    pub z_excess: f64,
    pub band_width_bp: Option<f64>,
    pub critical_value: f64,
    pub method: Method,
    pub stop_rule: StopRule,
    pub t_max: u32,
    pub at_risk_days: u32,
    pub inband_streak: u32,
    pub max_z_excess: f64,
    pub last_tick: Option<NaiveDate>,
    #[serde(rename = "T")]
    pub t: Option<u32>,
    #[serde(rename = "D_stop")]
    pub d_stop: Option<NaiveDate>,
    pub stop_reason: Option<StopReason>,
    pub censored: bool,
    pub censor_reason: Option<CensorReason>,
    pub event_open: bool,
}
