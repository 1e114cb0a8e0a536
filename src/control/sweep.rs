//! I-V curve sweep engine.
//!
//! A sweep ramps the output current step by step, recording one sample per
//! measurement tick, until the panel has collapsed at two or more points.
//! The engine only accumulates samples and renders a verdict; driving the
//! supply and switching states stays in the application service.

use heapless::Vec;

/// One sampled operating point on the I-V curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplePoint {
    pub out_volt: f32,
    pub out_curr: f32,
    pub in_volt: f32,
    pub collapsed: bool,
}

impl SamplePoint {
    /// Output power at this point.
    pub fn power(&self) -> f32 {
        self.out_volt * self.out_curr
    }
}

/// Verdict rendered when a sweep completes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SweepOutcome {
    /// Every recorded point was collapsed; nothing usable to restore to.
    Aborted,
    /// The best collapsed point out-performs every clean point: run the
    /// panel collapsed on purpose and track the collapsed input voltage.
    RunCollapsed { setpoint: f32 },
    /// Normal case: restore to just below the maximum-power clean point.
    Restore {
        setpoint: f32,
        restore_current: f32,
    },
}

/// Accumulates sweep samples and computes the final verdict.
#[derive(Debug, Default)]
pub struct SweepEngine {
    points: Vec<SamplePoint, 256>,
    /// Last recorded sample, kept even after the buffer is cleared so the
    /// early-exit paths (current cap, constant voltage) can still read it.
    last: Option<SamplePoint>,
}

impl SweepEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample; returns (collapsed, non-collapsed) point counts
    /// including this sample. Samples past the buffer capacity are dropped;
    /// sweeps start near the filtered current and terminate on collapse, so
    /// the buffer only fills on a cold full-range ramp.
    pub fn record(&mut self, point: SamplePoint) -> (usize, usize) {
        self.last = Some(point);
        let _ = self.points.push(point);
        let collapsed = self.points.iter().filter(|p| p.collapsed).count();
        (collapsed, self.points.len() - collapsed)
    }

    /// The most recently recorded sample, surviving [`Self::clear`].
    pub fn last_point(&self) -> Option<SamplePoint> {
        self.last
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[SamplePoint] {
        &self.points
    }

    /// Render the verdict for a finished sweep. `recent_collapses` is the
    /// collapse-log count; more recent collapses push the restore current
    /// further below the measured maximum.
    ///
    /// Selection walks the whole buffer for the highest-power clean point,
    /// then backs the restore point off by two samples so tracking resumes
    /// safely below the knee.
    pub fn finish(&self, recent_collapses: usize) -> SweepOutcome {
        let clean_exists = self.points.iter().any(|p| !p.collapsed);
        if !clean_exists {
            return SweepOutcome::Aborted;
        }

        let mut max_index = 0;
        for (i, p) in self.points.iter().enumerate() {
            if !p.collapsed && p.power() > self.points[max_index].power() {
                max_index = i;
            }
        }

        // The final (collapsed) sample is the candidate for running
        // collapsed on purpose.
        let collapse_point = self.points[self.points.len() - 1];
        if self.points[max_index].power() < collapse_point.power() {
            return SweepOutcome::RunCollapsed {
                setpoint: collapse_point.in_volt,
            };
        }

        let restore_index = max_index.saturating_sub(2);
        let restore = self.points[restore_index];
        SweepOutcome::Restore {
            setpoint: restore.in_volt,
            restore_current: restore.out_curr * restore_factor(recent_collapses),
        }
    }

    /// Drop accumulated samples for the next sweep. The last sample is
    /// retained for the early-exit paths.
    pub fn clear(&mut self) {
        self.points.clear();
    }
}

/// Fraction of the measured maximum-power current to restore to after a
/// sweep: 0.98 with no recent collapses, shrinking 4% per collapse down to
/// 0.66 at eight or more.
pub fn restore_factor(recent_collapses: usize) -> f32 {
    0.98 - 0.04 * recent_collapses.min(8) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(v: f32, i: f32, input: f32, collapsed: bool) -> SamplePoint {
        SamplePoint {
            out_volt: v,
            out_curr: i,
            in_volt: input,
            collapsed,
        }
    }

    #[test]
    fn record_counts_both_classes() {
        let mut e = SweepEngine::new();
        assert_eq!(e.record(pt(12.0, 1.0, 19.0, false)), (0, 1));
        assert_eq!(e.record(pt(12.0, 2.0, 18.0, true)), (1, 1));
        assert_eq!(e.record(pt(12.0, 3.0, 13.0, true)), (2, 1));
    }

    #[test]
    fn all_collapsed_sweep_aborts() {
        let mut e = SweepEngine::new();
        e.record(pt(12.0, 1.0, 12.5, true));
        e.record(pt(12.0, 2.0, 12.4, true));
        assert_eq!(e.finish(0), SweepOutcome::Aborted);
    }

    #[test]
    fn restores_below_the_max_power_point() {
        let mut e = SweepEngine::new();
        // Rising power, then the knee, then collapse.
        e.record(pt(13.0, 1.0, 20.0, false)); // 13 W
        e.record(pt(13.0, 2.0, 19.5, false)); // 26 W
        e.record(pt(13.0, 3.0, 19.0, false)); // 39 W  <- max
        e.record(pt(13.0, 3.5, 14.0, true)); // 45.5 W but collapsed
        e.record(pt(13.0, 0.5, 13.5, true)); //  6.5 W collapsed
        match e.finish(0) {
            SweepOutcome::Restore {
                setpoint,
                restore_current,
            } => {
                // Max at index 2, backed off two samples to index 0.
                assert!((setpoint - 20.0).abs() < 1e-6);
                assert!((restore_current - 1.0 * 0.98).abs() < 1e-6);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn back_off_clamps_at_first_sample() {
        let mut e = SweepEngine::new();
        e.record(pt(13.0, 2.0, 19.0, false)); // max at index 0
        e.record(pt(13.0, 0.5, 14.0, true));
        e.record(pt(13.0, 0.4, 13.8, true));
        match e.finish(0) {
            SweepOutcome::Restore { setpoint, .. } => {
                assert!((setpoint - 19.0).abs() < 1e-6);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn collapsed_point_outproducing_clean_points_wins() {
        let mut e = SweepEngine::new();
        e.record(pt(13.0, 1.0, 20.0, false)); // 13 W
        e.record(pt(13.0, 1.5, 18.0, true)); // 19.5 W collapsed
        e.record(pt(13.0, 2.0, 17.5, true)); // 26 W collapsed, final
        assert_eq!(
            e.finish(0),
            SweepOutcome::RunCollapsed { setpoint: 17.5 }
        );
    }

    #[test]
    fn restore_factor_shrinks_with_collapses() {
        assert!((restore_factor(0) - 0.98).abs() < 1e-6);
        assert!((restore_factor(1) - 0.94).abs() < 1e-6);
        assert!((restore_factor(8) - 0.66).abs() < 1e-6);
        assert!((restore_factor(20) - 0.66).abs() < 1e-6);
    }

    #[test]
    fn last_point_survives_clear() {
        let mut e = SweepEngine::new();
        e.record(pt(13.0, 1.0, 20.0, false));
        e.clear();
        assert!(e.is_empty());
        assert_eq!(e.last_point().unwrap().in_volt, 20.0);
    }
}
