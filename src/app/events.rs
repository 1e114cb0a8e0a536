//! Outbound events and the periodic status snapshot.

use serde::Serialize;

/// Notable happenings, emitted through [`crate::app::ports::EventSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// Core initialized and ticking.
    Started,
    StateChanged {
        from: &'static str,
        to: &'static str,
        reason: String,
    },
    CollapseDetected {
        in_volt: f32,
        /// Collapse-log count including this one.
        count: usize,
    },
    SweepStarted {
        start_current: f32,
    },
    SweepFinished {
        setpoint: f32,
        run_collapsed: bool,
    },
    /// An adjustment attempt failed and the retry interval grew.
    BackoffRaised {
        level: u8,
        retry_ms: u32,
        reason: String,
    },
    LvProtectTripped {
        out_volt: f32,
    },
    LvProtectReleased {
        out_volt: f32,
    },
    /// The supply has not answered for minutes despite daylight; the
    /// hosting binary decides whether to reset.
    PsuUnresponsive {
        silent_ms: u32,
    },
}

/// Point-in-time view of the whole controller, serializable for a status
/// endpoint or console dump.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: &'static str,
    pub in_volt: f32,
    pub out_volt: f32,
    pub out_curr: f32,
    pub out_power: f32,
    pub energy_wh: f32,
    pub setpoint: f32,
    pub collapses: usize,
    pub backoff_level: u8,
    pub lv_protected: bool,
}
