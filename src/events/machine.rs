//! Per-symbol breakout state machine
//!
//! `open → {stopped (re-entry), stopped (sign-flip), censored (T_max),
//! censored (end_of_sample)}`. A day with missing inputs pauses the event
//! instead of failing it; the same day can be retried later.

use crate::calendar::TradingCalendar;
use crate::models::{
    CanonicalRow, CensorReason, Direction, EventRecord, ForecastRecord, Method, StopReason,
    StopRule,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventConfig {
    pub stop_rule: StopRule,
    pub t_max: u32,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            stop_rule: StopRule::ReEntry { k_inside: 2 },
            t_max: 20,
        }
    }
}

/// Why a tick did nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PauseReason {
    NotTradingDay { day: NaiveDate },
    MissingClose { day: NaiveDate },
    MissingForecast { day: NaiveDate },
    AlreadyProcessed { day: NaiveDate },
    EventClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    Paused(PauseReason),
    Continued {
        at_risk_days: u32,
        in_band: bool,
        z_excess: f64,
    },
    Stopped {
        reason: StopReason,
        t: u32,
    },
    Censored {
        reason: CensorReason,
        t: u32,
    },
}

impl TickOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TickOutcome::Stopped { .. } | TickOutcome::Censored { .. })
    }
}

/// Everything a tick for `day` needs, resolved from canonical data and the
/// `day − 1` forecast.
#[derive(Debug, Clone, PartialEq)]
pub struct DayObservation {
    pub day: NaiveDate,
    pub close: f64,
    pub prev_close: f64,
    pub forecast_date: NaiveDate,
    pub method: Method,
    pub l_1: f64,
    pub u_1: f64,
    pub m_log_1: f64,
    pub s_scale_1: f64,
    pub critical: f64,
    pub band_width_bp: Option<f64>,
}

impl DayObservation {
    pub fn in_band(&self) -> bool {
        self.close >= self.l_1 && self.close <= self.u_1
    }

    pub fn return_sign(&self) -> i8 {
        let r = (self.close / self.prev_close).ln();
        if r > 0.0 {
            1
        } else if r < 0.0 {
            -1
        } else {
            0
        }
    }

    pub fn z_score(&self) -> f64 {
        if self.s_scale_1 > 0.0 {
            (self.close.ln() - self.m_log_1) / self.s_scale_1
        } else {
            0.0
        }
    }

    /// `max(0, |z| − c)`
    pub fn z_excess(&self) -> f64 {
        (self.z_score().abs() - self.critical).max(0.0)
    }
}

/// Price and forecast lookups for one symbol.
#[derive(Debug, Clone)]
pub struct EventContext<'a> {
    calendar: &'a TradingCalendar,
    closes: BTreeMap<NaiveDate, f64>,
    forecasts: &'a [ForecastRecord],
}

impl<'a> EventContext<'a> {
    pub fn new(
        calendar: &'a TradingCalendar,
        rows: &[CanonicalRow],
        forecasts: &'a [ForecastRecord],
    ) -> Self {
        let closes = rows
            .iter()
            .filter_map(|r| Some((r.date, r.price()?)))
            .collect();
        Self {
            calendar,
            closes,
            forecasts,
        }
    }

    pub fn calendar(&self) -> &TradingCalendar {
        self.calendar
    }

    pub fn last_close_date(&self) -> Option<NaiveDate> {
        self.closes.keys().next_back().copied()
    }

    /// Locked forecast for `date`: the requested method if given, otherwise
    /// the active record, otherwise the newest locked record.
    pub fn forecast_for(&self, date: NaiveDate, method: Option<Method>) -> Option<&'a ForecastRecord> {
        let mut candidates = self
            .forecasts
            .iter()
            .filter(|f| f.date_t == date && f.locked && f.l_1 > 0.0 && f.u_1 > 0.0);
        match method {
            Some(m) => candidates.find(|f| f.method == m),
            None => {
                let all: Vec<&ForecastRecord> = candidates.collect();
                all.iter()
                    .find(|f| f.active)
                    .or_else(|| all.iter().max_by_key(|f| f.created_at))
                    .copied()
            }
        }
    }

    /// Resolves the inputs for `day`, or the reason the tick must pause.
    pub fn observe(&self, day: NaiveDate, method: Option<Method>) -> Result<DayObservation, PauseReason> {
        if !self.calendar.is_trading_date(day) {
            return Err(PauseReason::NotTradingDay { day });
        }
        let prev_day = self.calendar.previous_trading_date(day);
        let close = *self
            .closes
            .get(&day)
            .ok_or(PauseReason::MissingClose { day })?;
        let prev_close = *self
            .closes
            .get(&prev_day)
            .ok_or(PauseReason::MissingClose { day: prev_day })?;
        let fc = self
            .forecast_for(prev_day, method)
            .ok_or(PauseReason::MissingForecast { day: prev_day })?;

        Ok(DayObservation {
            day,
            close,
            prev_close,
            forecast_date: fc.date_t,
            method: fc.method,
            l_1: fc.l_1,
            u_1: fc.u_1,
            m_log_1: fc.m_log_1,
            s_scale_1: fc.s_scale_1,
            critical: fc.critical.value(),
            band_width_bp: fc.band_width_bp,
        })
    }
}

/// Opens an event when the close escapes the prior day's one-day band.
pub fn detect_breakout(symbol: &str, obs: &DayObservation, cfg: &EventConfig) -> Option<EventRecord> {
    if obs.in_band() {
        return None;
    }
    let direction = if obs.close > obs.u_1 {
        Direction::Up
    } else {
        Direction::Down
    };
    let z_excess = obs.z_excess();
    Some(EventRecord {
        id: Uuid::new_v4(),
        symbol: symbol.to_string(),
        breakout_date: obs.day,
        forecast_date: obs.forecast_date,
        direction,
        z_score: obs.z_score(),
        z_excess,
        band_width_bp: obs.band_width_bp,
        critical_value: obs.critical,
        method: obs.method,
        stop_rule: cfg.stop_rule,
        t_max: cfg.t_max,
        at_risk_days: 0,
        inband_streak: 0,
        max_z_excess: z_excess,
        last_tick: Some(obs.day),
        t: None,
        d_stop: None,
        stop_reason: None,
        censored: false,
        censor_reason: None,
        event_open: true,
    })
}

/// Advances an open event by one trading day.
pub fn tick(event: &mut EventRecord, obs: &DayObservation) -> TickOutcome {
    if !event.event_open {
        return TickOutcome::Paused(PauseReason::EventClosed);
    }
    if event.last_tick.is_some_and(|last| obs.day <= last) || obs.day <= event.breakout_date {
        return TickOutcome::Paused(PauseReason::AlreadyProcessed { day: obs.day });
    }

    let in_band = obs.in_band();
    let z_excess = obs.z_excess();
    event.at_risk_days += 1;
    event.max_z_excess = event.max_z_excess.max(z_excess);
    event.inband_streak = if in_band { event.inband_streak + 1 } else { 0 };
    event.last_tick = Some(obs.day);
    let j = event.at_risk_days;

    let stop = match event.stop_rule {
        StopRule::ReEntry { k_inside } => (event.inband_streak >= k_inside)
            .then(|| (StopReason::ReEntry, j.saturating_sub(k_inside))),
        StopRule::SignFlip => (obs.return_sign() == -event.direction.sign())
            .then(|| (StopReason::SignFlip, j - 1)),
    };

    if let Some((reason, t)) = stop {
        event.t = Some(t);
        event.d_stop = Some(obs.day);
        event.stop_reason = Some(reason);
        event.event_open = false;
        return TickOutcome::Stopped { reason, t };
    }
    if j >= event.t_max {
        censor(event, CensorReason::TMax, Some(obs.day));
        return TickOutcome::Censored {
            reason: CensorReason::TMax,
            t: event.t_max,
        };
    }
    TickOutcome::Continued {
        at_risk_days: j,
        in_band,
        z_excess,
    }
}

/// Right-censors an open event at its current at-risk count.
pub fn censor(event: &mut EventRecord, reason: CensorReason, day: Option<NaiveDate>) {
    event.t = Some(match reason {
        CensorReason::TMax => event.t_max,
        CensorReason::EndOfSample => event.at_risk_days,
    });
    event.d_stop = day;
    event.censored = true;
    event.censor_reason = Some(reason);
    event.event_open = false;
}
