//! Breakout event tracking
//!
//! An event opens the first day a close escapes the prior day's one-day
//! band, is ticked once per trading day, and ends either stopped (re-entry
//! or sign-flip) or right-censored (`T_max` or end of sample). Callers must
//! serialize ticks for the same symbol.

pub mod machine;
pub mod rescan;

pub use machine::{
    censor, detect_breakout, tick, DayObservation, EventConfig, EventContext, PauseReason,
    TickOutcome,
};
pub use rescan::{rescan, RescanReport};
