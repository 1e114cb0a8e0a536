//! Pure control logic: operating states, scheduling, backoff, collapse
//! detection and the I-V sweep engine.
//!
//! Nothing in this module touches hardware; everything is driven by the
//! application service through the port traits, which keeps the whole tree
//! unit-testable on the host.

pub mod backoff;
pub mod collapse;
pub mod sweep;

use core::fmt;

/// Top-level operating mode of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperatingState {
    /// Output disabled, nothing to do.
    #[default]
    Off,
    /// Normal proportional tracking toward the voltage setpoint.
    Mppt,
    /// An I-V sweep is in progress; normal tracking is suspended.
    Sweeping,
    /// The panel collapses at every useful operating point; run it
    /// collapsed on purpose at a raised current limit.
    CollapseMode,
    /// Output current is pinned at the configured cap.
    Capped,
    /// The supply is in constant-voltage mode — battery is full.
    FullCv,
    /// No usable supply, or the supply went silent.
    Error,
}

impl OperatingState {
    pub const ALL: [OperatingState; 7] = [
        OperatingState::Off,
        OperatingState::Mppt,
        OperatingState::Sweeping,
        OperatingState::CollapseMode,
        OperatingState::Capped,
        OperatingState::FullCv,
        OperatingState::Error,
    ];

    /// Stable text name, published as the `state` field.
    pub fn as_str(self) -> &'static str {
        match self {
            OperatingState::Off => "off",
            OperatingState::Mppt => "mppt",
            OperatingState::Sweeping => "sweeping",
            OperatingState::CollapseMode => "collapsemode",
            OperatingState::Capped => "capped",
            OperatingState::FullCv => "full_cv",
            OperatingState::Error => "error",
        }
    }
}

impl fmt::Display for OperatingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wraparound-safe deadline comparison on the 32-bit millisecond clock.
///
/// Treats `now` as having passed `deadline` when the wrapped difference is
/// in the lower half of the u32 range, so schedules keep working across the
/// ~49.7-day rollover as long as no deadline is set further than half the
/// range into the future.
#[inline]
pub fn deadline_passed(now_ms: u32, deadline_ms: u32) -> bool {
    now_ms.wrapping_sub(deadline_ms) < u32::MAX / 2
}

/// Per-task deadlines for the cooperative tick loop.
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    pub next_measure: u32,
    pub next_adjust: u32,
    pub next_print: u32,
    pub next_psu_update: u32,
    pub next_auto_sweep: u32,
    /// When the last auto-sweep fired; the next one is scheduled from here
    /// so collapse-shortened intervals stay anchored.
    pub last_auto_sweep: u32,
}

impl Deadlines {
    /// Initial schedule: measurements and prints start immediately, the
    /// first adjustment is held back a second to let telemetry settle.
    pub fn starting_at(now_ms: u32) -> Self {
        Self {
            next_measure: now_ms,
            next_adjust: now_ms.wrapping_add(1000),
            next_print: now_ms,
            next_psu_update: now_ms,
            next_auto_sweep: now_ms,
            last_auto_sweep: now_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_match_published_strings() {
        assert_eq!(OperatingState::Off.as_str(), "off");
        assert_eq!(OperatingState::CollapseMode.as_str(), "collapsemode");
        assert_eq!(OperatingState::FullCv.as_str(), "full_cv");
        for s in OperatingState::ALL {
            assert!(!s.as_str().is_empty());
        }
    }

    #[test]
    fn deadline_simple_cases() {
        assert!(deadline_passed(1000, 1000));
        assert!(deadline_passed(1001, 1000));
        assert!(!deadline_passed(999, 1000));
    }

    #[test]
    fn deadline_survives_wraparound() {
        // Deadline just before rollover, now just after it.
        let deadline = u32::MAX - 10;
        assert!(!deadline_passed(u32::MAX - 20, deadline));
        assert!(deadline_passed(5, deadline));
        // Deadline just after rollover, now still before it.
        assert!(!deadline_passed(u32::MAX - 10, 5));
    }

    #[test]
    fn initial_schedule_defers_adjustment() {
        let d = Deadlines::starting_at(500);
        assert_eq!(d.next_measure, 500);
        assert_eq!(d.next_adjust, 1500);
        assert_eq!(d.next_print, 500);
    }
}
