//! Panel-collapse detection and the recent-collapse log.
//!
//! A collapse is the panel voltage caving in to near the output voltage
//! because the commanded current exceeds what the panel can source. Some
//! supplies report this reliably through their constant-current flag; for
//! the rest we corroborate the flag with input/output voltage proximity.

use heapless::Deque;
use log::debug;

use crate::psu::{DeviceClass, PsuStatus};

/// Collapses older than this fall out of the log.
const COLLAPSE_AGE_MS: u32 = 5 * 60_000;

/// Decide whether the panel is currently collapsed.
///
/// Always false with the output disabled. Supplies whose collapse signal is
/// trustworthy are believed outright; otherwise the signal only counts when
/// the input voltage has sagged close to the output voltage.
pub fn has_collapsed(in_volt: f32, psu: &PsuStatus, class: DeviceClass) -> bool {
    if !psu.out_en {
        return false;
    }
    if class.collapse_signal_accurate() && psu.collapsed {
        return true;
    }
    let simple = in_volt < psu.out_volt * 1.11;
    if simple && psu.collapsed {
        return true;
    }
    let sag_pct = (in_volt - psu.out_volt) / psu.out_volt;
    if sag_pct < 0.05 && psu.collapsed {
        debug!("collapse confirmed by secondary method, sag {:.3}%", sag_pct);
        return true;
    }
    false
}

/// Rolling log of recent collapse timestamps.
///
/// The count feeds the sweep restore factor and the auto-sweep interval;
/// entries age out after five minutes.
#[derive(Debug, Default)]
pub struct CollapseLog {
    events: Deque<u32, 32>,
}

impl CollapseLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a collapse at `now_ms`, evicting the oldest entry if full.
    pub fn record(&mut self, now_ms: u32) {
        if self.events.is_full() {
            self.events.pop_front();
        }
        // Safe: just made room.
        let _ = self.events.push_back(now_ms);
    }

    /// Drop entries older than five minutes; returns how many were removed.
    pub fn prune(&mut self, now_ms: u32) -> usize {
        let mut removed = 0;
        while let Some(&oldest) = self.events.front() {
            if now_ms.wrapping_sub(oldest) > COLLAPSE_AGE_MS {
                self.events.pop_front();
                removed += 1;
            } else {
                break;
            }
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(out_volt: f32, out_en: bool, collapsed: bool) -> PsuStatus {
        PsuStatus {
            out_volt,
            out_en,
            collapsed,
            ..Default::default()
        }
    }

    #[test]
    fn disabled_output_never_collapses() {
        let s = status(14.0, false, true);
        assert!(!has_collapsed(14.1, &s, DeviceClass::DpsSeries));
        assert!(!has_collapsed(14.1, &s, DeviceClass::Drok));
    }

    #[test]
    fn accurate_class_trusts_the_flag() {
        let s = status(14.0, true, true);
        // Input well above output; only the trusted class believes it.
        assert!(has_collapsed(20.0, &s, DeviceClass::DpsSeries));
        assert!(!has_collapsed(20.0, &s, DeviceClass::Drok));
    }

    #[test]
    fn heuristic_needs_flag_and_voltage_sag() {
        // Flag set, input within 11% of output.
        let s = status(14.0, true, true);
        assert!(has_collapsed(15.0, &s, DeviceClass::Drok));
        // Flag clear: voltage proximity alone is not enough.
        let s = status(14.0, true, false);
        assert!(!has_collapsed(14.1, &s, DeviceClass::Drok));
    }

    #[test]
    fn sag_boundaries() {
        // 4.3% above output: well inside the proximity bound.
        let s = status(14.0, true, true);
        assert!(has_collapsed(14.6, &s, DeviceClass::Drok));
        // 12.9% above: out of reach of both methods.
        assert!(!has_collapsed(15.8, &s, DeviceClass::Drok));
    }

    #[test]
    fn log_prunes_by_age() {
        let mut log = CollapseLog::new();
        log.record(1_000);
        log.record(100_000);
        assert_eq!(log.count(), 2);
        // 1_000 is 300_000ms old at 301_000 — not yet over the limit.
        assert_eq!(log.prune(301_000), 0);
        assert_eq!(log.prune(301_001), 1);
        assert_eq!(log.count(), 1);
        assert_eq!(log.prune(500_000), 1);
        assert_eq!(log.count(), 0);
    }

    #[test]
    fn log_evicts_oldest_when_full() {
        let mut log = CollapseLog::new();
        for i in 0..40u32 {
            log.record(i * 10);
        }
        assert_eq!(log.count(), 32);
        // Entries 0..8 were evicted; pruning at a time that would only age
        // out the evicted ones removes nothing.
        assert_eq!(log.prune(80 + COLLAPSE_AGE_MS), 0);
    }
}
