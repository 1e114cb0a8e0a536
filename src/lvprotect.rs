//! Battery low-voltage protection.
//!
//! Drives a cutoff relay when the battery sags below a trigger voltage and
//! releases it once the battery recovers past a higher threshold. The relay
//! may well power down this controller too, so pending logs are flushed
//! before tripping.

use core::fmt;
use core::str::FromStr;

use log::{info, warn};

use crate::app::events::ControlEvent;
use crate::app::ports::{EventSink, ProtectRelay};
use crate::control::deadline_passed;
use crate::error::{ConfigError, Error, Result};
use crate::pins;

/// Default trigger voltage for a 12 V lead-acid bank.
const DEFAULT_TRIGGER_V: f32 = 11.5;

/// GPIOs muxed to ADC2; unusable for the relay because WiFi owns ADC2.
const ADC2_PINS: [u8; 10] = [0, 2, 4, 12, 13, 14, 15, 25, 26, 27];

/// Relay pin and thresholds, parsed from `pin[i]:trigger:recovery`.
///
/// Every element is optional: `""` gives pin 22 at 11.50/12.42 V, `"25i"`
/// just moves and inverts the pin, `"22:11.8"` derives the recovery point
/// as 108% of the trigger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LvProtectConfig {
    pub pin: u8,
    /// Invert the relay drive (active-high cutoff).
    pub invert: bool,
    pub trigger_v: f32,
    pub recovery_v: f32,
}

impl Default for LvProtectConfig {
    fn default() -> Self {
        Self {
            pin: pins::LV_PROTECT_GPIO,
            invert: false,
            trigger_v: DEFAULT_TRIGGER_V,
            recovery_v: DEFAULT_TRIGGER_V * 1.08,
        }
    }
}

impl LvProtectConfig {
    pub fn validate(&self) -> Result<()> {
        if ADC2_PINS.contains(&self.pin) {
            return Err(ConfigError::InvalidPin("lv-protect pin can't use an ADC2 pin").into());
        }
        if self.trigger_v <= 0.0 {
            return Err(ConfigError::InvalidValue("trigger voltage must be positive").into());
        }
        if self.recovery_v <= self.trigger_v {
            return Err(ConfigError::InvalidValue("recovery must exceed trigger").into());
        }
        Ok(())
    }
}

impl FromStr for LvProtectConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut cfg = LvProtectConfig::default();
        let mut parts = s.split(':');

        if let Some(pin_part) = parts.next() {
            let (digits, invert) = match pin_part.strip_suffix('i') {
                Some(d) => (d, true),
                None => (pin_part, false),
            };
            cfg.invert = invert;
            if !digits.is_empty() {
                cfg.pin = digits
                    .parse()
                    .map_err(|_| Error::Config(ConfigError::InvalidPin("not a pin number")))?;
            }
        }
        if let Some(trig) = parts.next() {
            cfg.trigger_v = trig
                .parse()
                .map_err(|_| Error::Config(ConfigError::InvalidValue("bad trigger voltage")))?;
            cfg.recovery_v = match parts.next() {
                Some(rec) => rec
                    .parse()
                    .map_err(|_| Error::Config(ConfigError::InvalidValue("bad recovery voltage")))?,
                None => cfg.trigger_v * 1.08,
            };
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

impl fmt::Display for LvProtectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}:{:.2}:{:.2}",
            self.pin,
            if self.invert { "i" } else { "" },
            self.trigger_v,
            self.recovery_v
        )
    }
}

/// Hysteretic protection state machine.
#[derive(Debug)]
pub struct LowVoltageProtect {
    cfg: LvProtectConfig,
    triggered: bool,
    next_check_ms: u32,
}

impl LowVoltageProtect {
    /// A fresh instance holds off its first check by five seconds so a
    /// reconfiguration can't trip the relay on a stale reading.
    pub fn new(cfg: LvProtectConfig, now_ms: u32) -> Self {
        Self {
            cfg,
            triggered: false,
            next_check_ms: now_ms.wrapping_add(5000),
        }
    }

    pub fn config(&self) -> &LvProtectConfig {
        &self.cfg
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    /// Evaluate the battery voltage, driving the relay on threshold
    /// crossings. After tripping, re-check in 5 s; after releasing, 10 s.
    pub fn check(
        &mut self,
        now_ms: u32,
        out_volt: f32,
        relay: &mut dyn ProtectRelay,
        sink: &mut dyn EventSink,
    ) {
        if !deadline_passed(now_ms, self.next_check_ms) {
            return;
        }
        if !self.triggered && out_volt < self.cfg.trigger_v {
            warn!("LOW VOLTAGE PROTECT TRIGGERED (now at {out_volt:.2}V)");
            // The relay may cut our own power; get the logs out first.
            sink.flush();
            relay.drive(self.cfg.pin, self.cfg.invert, true);
            self.triggered = true;
            sink.emit(&ControlEvent::LvProtectTripped { out_volt });
            self.next_check_ms = now_ms.wrapping_add(5000);
        } else if self.triggered && out_volt > self.cfg.recovery_v {
            info!("low voltage recovery, re-enabling");
            relay.drive(self.cfg.pin, self.cfg.invert, false);
            self.triggered = false;
            sink.emit(&ControlEvent::LvProtectReleased { out_volt });
            self.next_check_ms = now_ms.wrapping_add(10_000);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct SpyRelay {
        drives: Vec<(u8, bool, bool)>,
    }

    impl ProtectRelay for SpyRelay {
        fn drive(&mut self, pin: u8, invert: bool, tripped: bool) {
            self.drives.push((pin, invert, tripped));
        }
    }

    #[derive(Default)]
    struct SpySink {
        events: Vec<ControlEvent>,
        flushes: usize,
    }

    impl EventSink for SpySink {
        fn emit(&mut self, event: &ControlEvent) {
            self.events.push(event.clone());
        }

        fn flush(&mut self) {
            self.flushes += 1;
        }
    }

    #[test]
    fn parse_full_form() {
        let cfg: LvProtectConfig = "21i:11.8:12.96".parse().unwrap();
        assert_eq!(cfg.pin, 21);
        assert!(cfg.invert);
        assert!((cfg.trigger_v - 11.8).abs() < 1e-6);
        assert!((cfg.recovery_v - 12.96).abs() < 1e-6);
        assert_eq!(cfg.to_string(), "21i:11.80:12.96");
    }

    #[test]
    fn parse_defaults_and_derived_recovery() {
        let cfg: LvProtectConfig = "".parse().unwrap();
        assert_eq!(cfg.pin, 22);
        assert!(!cfg.invert);
        assert!((cfg.trigger_v - 11.5).abs() < 1e-6);

        let cfg: LvProtectConfig = "22:12.0".parse().unwrap();
        assert!((cfg.recovery_v - 12.96).abs() < 1e-3);
    }

    #[test]
    fn parse_rejects_adc2_pins_and_garbage() {
        assert!("4:11.5".parse::<LvProtectConfig>().is_err());
        assert!("xyz:11.5".parse::<LvProtectConfig>().is_err());
        assert!("22:abc".parse::<LvProtectConfig>().is_err());
        // Recovery below trigger is a config error too.
        assert!("22:12.0:11.0".parse::<LvProtectConfig>().is_err());
    }

    #[test]
    fn hysteresis_trip_hold_release() {
        let cfg: LvProtectConfig = "22:12.0:12.96".parse().unwrap();
        let mut lvp = LowVoltageProtect::new(cfg, 0);
        let mut relay = SpyRelay::default();
        let mut sink = SpySink::default();

        // Holdoff window: nothing happens even below trigger.
        lvp.check(1000, 11.0, &mut relay, &mut sink);
        assert!(!lvp.is_triggered());

        // Past holdoff, healthy voltage: nothing.
        lvp.check(6000, 13.0, &mut relay, &mut sink);
        assert!(!lvp.is_triggered());

        // Sag below trigger: trip, flushing logs first.
        lvp.check(7000, 11.9, &mut relay, &mut sink);
        assert!(lvp.is_triggered());
        assert_eq!(relay.drives, vec![(22, false, true)]);
        assert_eq!(sink.flushes, 1);
        assert!(matches!(
            sink.events.last(),
            Some(ControlEvent::LvProtectTripped { .. })
        ));

        // Within the 5 s re-check window: held.
        lvp.check(9000, 13.5, &mut relay, &mut sink);
        assert!(lvp.is_triggered());

        // Between trigger and recovery: still held.
        lvp.check(13_000, 12.5, &mut relay, &mut sink);
        assert!(lvp.is_triggered());

        // Above recovery: release.
        lvp.check(14_000, 13.0, &mut relay, &mut sink);
        assert!(!lvp.is_triggered());
        assert_eq!(relay.drives.last(), Some(&(22, false, false)));
        assert!(matches!(
            sink.events.last(),
            Some(ControlEvent::LvProtectReleased { .. })
        ));
    }
}
