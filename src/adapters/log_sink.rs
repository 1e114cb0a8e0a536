//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by writing every control event to the logger
//! (UART / USB-CDC on the device). A future network transport would
//! implement the same trait.

use log::{info, warn};

use crate::app::events::ControlEvent;
use crate::app::ports::EventSink;

/// Adapter that logs every [`ControlEvent`] to the serial console.
#[derive(Default)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LogEventSink {
    fn emit(&mut self, event: &ControlEvent) {
        match event {
            ControlEvent::Started => info!("EVENT | started"),
            ControlEvent::StateChanged { from, to, reason } => {
                info!("EVENT | state {from} -> {to} ({reason})");
            }
            ControlEvent::CollapseDetected { in_volt, count } => {
                warn!("EVENT | collapse #{count} at {in_volt:.2}Vin");
            }
            ControlEvent::SweepStarted { start_current } => {
                info!("EVENT | sweep started at {start_current:.3}A");
            }
            ControlEvent::SweepFinished {
                setpoint,
                run_collapsed,
            } => {
                info!(
                    "EVENT | sweep finished, setpoint {setpoint:.3}V{}",
                    if *run_collapsed { " (collapsed)" } else { "" }
                );
            }
            ControlEvent::BackoffRaised {
                level,
                retry_ms,
                reason,
            } => {
                warn!("EVENT | backoff level {level}, retry in {retry_ms}ms: {reason}");
            }
            ControlEvent::LvProtectTripped { out_volt } => {
                warn!("EVENT | low-voltage protect tripped at {out_volt:.2}V");
            }
            ControlEvent::LvProtectReleased { out_volt } => {
                info!("EVENT | low-voltage protect released at {out_volt:.2}V");
            }
            ControlEvent::PsuUnresponsive { silent_ms } => {
                warn!("EVENT | psu unresponsive for {}s", silent_ms / 1000);
            }
        }
    }
    // Serial output is unbuffered; the default no-op flush is correct.
}
