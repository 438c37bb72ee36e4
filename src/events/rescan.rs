//! Multi-day walk of the event machine over stored history.

use super::machine::{censor, detect_breakout, tick, EventConfig, EventContext, TickOutcome};
use crate::models::{CensorReason, EventRecord, Method};
use chrono::{Duration, NaiveDate};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RescanReport {
    /// Every event touched by the walk, in breakout order
    pub events: Vec<EventRecord>,
    pub days_processed: usize,
    pub days_paused: usize,
}

impl RescanReport {
    pub fn open_event(&self) -> Option<&EventRecord> {
        self.events.iter().find(|e| e.event_open)
    }
}

/// Walks trading days in `[from, to]`, continuing `open` if given and opening
/// new events on breakouts. When the walk reaches the end of the canonical
/// history with an event still open, that event is censored `end_of_sample`.
pub fn rescan(
    symbol: &str,
    ctx: &EventContext<'_>,
    cfg: &EventConfig,
    method: Option<Method>,
    open: Option<EventRecord>,
    from: NaiveDate,
    to: NaiveDate,
) -> RescanReport {
    let mut report = RescanReport::default();
    let mut current = open;

    for day in ctx.calendar().trading_days_between(from - Duration::days(1), to) {
        let wanted = current.as_ref().map(|e| e.method).or(method);
        let obs = match ctx.observe(day, wanted) {
            Ok(obs) => obs,
            Err(reason) => {
                debug!(symbol, %day, ?reason, "rescan day paused");
                report.days_paused += 1;
                continue;
            }
        };
        report.days_processed += 1;

        match current.as_mut() {
            Some(event) => {
                let outcome = tick(event, &obs);
                if outcome.is_terminal() {
                    if let Some(done) = current.take() {
                        report.events.push(done);
                    }
                } else if let TickOutcome::Paused(reason) = outcome {
                    debug!(symbol, %day, ?reason, "tick skipped");
                }
            }
            None => {
                if let Some(event) = detect_breakout(symbol, &obs, cfg) {
                    debug!(symbol, %day, direction = ?event.direction, "breakout");
                    current = Some(event);
                }
            }
        }
    }

    if let Some(mut event) = current {
        let exhausted = ctx.last_close_date().map_or(true, |last| to >= last);
        if exhausted && event.at_risk_days > 0 {
            let last_tick = event.last_tick;
            censor(&mut event, CensorReason::EndOfSample, last_tick);
        }
        report.events.push(event);
    }
    report
}
