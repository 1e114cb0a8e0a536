//! Adaptive failure backoff for PSU communication.
//!
//! Every failed adjustment raises the level, every success lowers it, and
//! the level scales the delay before the next attempt quadratically. A
//! healthy link runs at the base period; a dead one settles at 33x.

/// Highest backoff level; further failures saturate here.
pub const MAX_LEVEL: u8 = 8;

/// Quadratic failure backoff, level 0 (healthy) through [`MAX_LEVEL`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BackoffController {
    level: u8,
}

impl BackoffController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn is_backing_off(&self) -> bool {
        self.level > 0
    }

    /// A command round-trip succeeded; relax one level.
    pub fn on_success(&mut self) {
        self.level = self.level.saturating_sub(1);
    }

    /// A command round-trip failed; escalate one level.
    pub fn on_failure(&mut self) {
        self.level = (self.level + 1).min(MAX_LEVEL);
    }

    /// Scale a base period by the current level: `base * (level^2 + 2) / 2`.
    ///
    /// Level 0 passes the base through untouched; level 1 gives 1.5x,
    /// level 8 gives 33x. The multiply happens before the halving so odd
    /// `level^2 + 2` values still land on the exact 1.5x step.
    pub fn interval(&self, base_ms: u32) -> u32 {
        if self.level == 0 {
            return base_ms;
        }
        let l = u32::from(self.level);
        base_ms.saturating_mul(l * l + 2) / 2
    }
}
