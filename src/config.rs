//! Control-loop configuration parameters.
//!
//! All tunable parameters for the Suntrack controller. Values can be
//! overridden at runtime through the publication layer (every field is
//! individually gettable/settable as text, see [`crate::publish`]) and are
//! persisted via the NVS config port.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Error, Result};

/// `off_threshold` values at or above this are treated as "not yet
/// calibrated"; the first successful collapse recovery measures the open
/// panel voltage and replaces the sentinel with 99.2% of it.
pub const OFF_THRESHOLD_UNCALIBRATED: f32 = 1000.0;

/// Core control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    // --- Tracking controller ---
    /// Proportional gain: amps of correction per volt of setpoint error.
    pub pgain: f32,
    /// Maximum upward current ramp per adjustment (amps). Downward ramps
    /// are permitted at twice this rate.
    pub ramp_limit: f32,
    /// Target solar input voltage (volts). 0 = tracking disabled until a
    /// sweep or an operator provides one.
    pub setpoint: f32,

    // --- Input voltage sensing ---
    /// Full-scale calibration for the ADC fallback path: volts at raw 4096.
    pub vadjust: f32,

    // --- Timing ---
    /// Measurement period (milliseconds). Doubled while sweeping.
    pub meas_period_ms: u32,
    /// Adjustment period (milliseconds), before backoff scaling.
    pub adjust_period_ms: u32,
    /// Status print period (milliseconds).
    pub print_period_ms: u32,
    /// Auto-sweep interval (seconds). 0 disables automatic sweeps.
    pub auto_sweep_secs: u32,

    // --- Limits ---
    /// Hard output-current ceiling (amps). Must be positive for the
    /// `capped` state to be reachable.
    pub current_cap: f32,
    /// Input voltage that marks the panel as recovered after a collapse.
    /// Values ≥ [`OFF_THRESHOLD_UNCALIBRATED`] self-calibrate on first use.
    pub off_threshold: f32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            // Tracking
            pgain: 0.1,
            ramp_limit: 0.5,
            setpoint: 0.0,

            // Sensing
            vadjust: 20.0,

            // Timing
            meas_period_ms: 200,
            adjust_period_ms: 2000,
            print_period_ms: 1000,
            auto_sweep_secs: 600,

            // Limits
            current_cap: 8.5,
            off_threshold: OFF_THRESHOLD_UNCALIBRATED,
        }
    }
}

impl ControlConfig {
    /// Range-check every field. Called before persisting and after loading,
    /// so a corrupted blob can never smuggle in dangerous parameters.
    pub fn validate(&self) -> Result<()> {
        if self.pgain < 0.0 {
            return Err(Error::Config(ConfigError::InvalidValue("pgain < 0")));
        }
        if self.ramp_limit <= 0.0 {
            return Err(Error::Config(ConfigError::InvalidValue("ramp_limit <= 0")));
        }
        if self.meas_period_ms == 0 || self.adjust_period_ms == 0 || self.print_period_ms == 0 {
            return Err(Error::Config(ConfigError::InvalidValue("zero period")));
        }
        if self.current_cap < 0.0 {
            return Err(Error::Config(ConfigError::InvalidValue("current_cap < 0")));
        }
        Ok(())
    }

    /// Whether the collapse-recovery threshold still holds its startup
    /// sentinel and needs self-calibration.
    pub fn off_threshold_uncalibrated(&self) -> bool {
        self.off_threshold >= OFF_THRESHOLD_UNCALIBRATED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let c = ControlConfig::default();
        assert!(c.validate().is_ok());
        assert!(c.pgain > 0.0);
        assert!(c.ramp_limit > 0.0);
        assert!(c.current_cap > 0.0);
        assert!(c.off_threshold_uncalibrated());
        assert!(c.meas_period_ms < c.adjust_period_ms);
    }

    #[test]
    fn serde_roundtrip() {
        let c = ControlConfig::default();
        let json = serde_json::to_string(&c).unwrap();
        let c2: ControlConfig = serde_json::from_str(&json).unwrap();
        assert!((c.pgain - c2.pgain).abs() < 1e-6);
        assert_eq!(c.meas_period_ms, c2.meas_period_ms);
        assert!((c.current_cap - c2.current_cap).abs() < 1e-6);
    }

    #[test]
    fn postcard_roundtrip() {
        let c = ControlConfig::default();
        let bytes = postcard::to_allocvec(&c).unwrap();
        let c2: ControlConfig = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(c.adjust_period_ms, c2.adjust_period_ms);
        assert!((c.off_threshold - c2.off_threshold).abs() < 1e-3);
    }

    #[test]
    fn validation_rejects_zero_periods() {
        let c = ControlConfig {
            meas_period_ms: 0,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn calibrated_threshold_is_not_sentinel() {
        let c = ControlConfig {
            off_threshold: 19.8,
            ..Default::default()
        };
        assert!(!c.off_threshold_uncalibrated());
    }
}
