//! Power-supply device classes, shared status snapshot, and a simulated
//! supply for host-side testing.
//!
//! The wire drivers for real supplies live behind the [`PowerSupply`] port;
//! this module holds what the control core needs to know about any of them.

use core::cell::RefCell;
use core::fmt;
use core::str::FromStr;
use std::rc::Rc;

use crate::app::ports::{Clock, PowerSupply};
use crate::error::{ConfigError, Error, PsuError, Result};

/// Families of programmable supplies with different quirks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// Drok-style buck converters. Their constant-current flag chatters, so
    /// collapse detection needs voltage corroboration.
    Drok,
    /// DPS-series supplies. Slower serial link, but the constant-current
    /// flag tracks reality closely.
    DpsSeries,
    /// In-process simulation for host tests.
    Simulated,
}

impl DeviceClass {
    /// Whether the device's constant-current flag alone is trustworthy
    /// evidence of a panel collapse.
    pub fn collapse_signal_accurate(self) -> bool {
        matches!(self, DeviceClass::DpsSeries)
    }

    /// Telemetry refresh period the device's link can sustain.
    pub fn default_meas_period_ms(self) -> u32 {
        match self {
            DeviceClass::Drok => 200,
            DeviceClass::DpsSeries => 500,
            DeviceClass::Simulated => 200,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceClass::Drok => "drok",
            DeviceClass::DpsSeries => "dps",
            DeviceClass::Simulated => "sim",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "drok" => Ok(DeviceClass::Drok),
            "dps" => Ok(DeviceClass::DpsSeries),
            "sim" => Ok(DeviceClass::Simulated),
            _ => Err(ConfigError::InvalidValue("unknown psu type").into()),
        }
    }
}

/// Snapshot of supply telemetry, refreshed by [`PowerSupply::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PsuStatus {
    pub out_volt: f32,
    pub out_curr: f32,
    /// Low-pass-filtered output current; sweep starts and collapse
    /// restores key off this rather than the instantaneous reading.
    pub curr_filtered: f32,
    pub limit_curr: f32,
    pub limit_volt: f32,
    pub out_en: bool,
    pub energy_wh: f32,
    /// Millisecond timestamp of the last successful round-trip.
    pub last_success_ms: u32,
    /// Device is regulating voltage (battery full).
    pub cv_mode: bool,
    /// Device's constant-current flag.
    pub collapsed: bool,
}

impl PsuStatus {
    pub fn out_power(&self) -> f32 {
        self.out_volt * self.out_curr
    }
}

// ---------------------------------------------------------------------------
// Simulated supply
// ---------------------------------------------------------------------------

/// Mutable world-state behind a [`SimulatedPsu`]; tests hold a second
/// handle to change panel conditions or break the link mid-run.
#[derive(Debug, Clone)]
pub struct SimState {
    pub out_volt: f32,
    pub limit_volt: f32,
    pub limit_curr: f32,
    pub energy_wh: f32,
    pub out_en: bool,
    /// When false, every command round-trip fails.
    pub comms_ok: bool,

    /// Panel open-circuit voltage.
    pub open_circuit_v: f32,
    /// Panel source resistance (ohms); input voltage droops by I*R.
    pub source_resistance: f32,
    /// Current the panel can source before collapsing.
    pub available_curr: f32,

    pub last_success_ms: u32,
    pub curr_filtered: f32,
    pub cv_mode: bool,
    /// Every `set_current` value that completed a round-trip, in order,
    /// for asserting command traffic.
    pub set_current_log: Vec<f32>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            out_volt: 13.0,
            limit_volt: 14.4,
            limit_curr: 0.0,
            energy_wh: 0.0,
            out_en: false,
            comms_ok: true,
            open_circuit_v: 20.0,
            source_resistance: 1.0,
            available_curr: 3.0,
            last_success_ms: 0,
            curr_filtered: 0.0,
            cv_mode: false,
            set_current_log: Vec::new(),
        }
    }
}

impl SimState {
    /// Delivered output current: the programmed limit while the panel can
    /// source it, zero with the output disabled. A collapsed panel delivers
    /// well under its maximum power point.
    pub fn out_curr(&self) -> f32 {
        if !self.out_en {
            return 0.0;
        }
        if self.collapsed() {
            self.available_curr * 0.66
        } else {
            self.limit_curr
        }
    }

    /// The supply sits in constant-current mode whenever the panel cannot
    /// deliver the programmed limit.
    pub fn collapsed(&self) -> bool {
        self.out_en && self.limit_curr >= self.available_curr
    }

    /// Panel-side voltage: open-circuit when unloaded, sagged to just above
    /// the output when collapsed, otherwise drooping with drawn current.
    pub fn input_volt(&self) -> f32 {
        if !self.out_en || self.out_curr() <= 0.0 {
            return self.open_circuit_v;
        }
        if self.collapsed() {
            return self.out_volt * 1.02;
        }
        self.open_circuit_v - self.out_curr() * self.source_resistance
    }
}

/// In-process [`PowerSupply`] driving a resistive panel model.
pub struct SimulatedPsu<C: Clock> {
    state: Rc<RefCell<SimState>>,
    clock: C,
}

impl<C: Clock> SimulatedPsu<C> {
    pub fn new(clock: C) -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState::default())),
            clock,
        }
    }

    /// Handle for a test to manipulate panel conditions mid-run.
    pub fn state_handle(&self) -> Rc<RefCell<SimState>> {
        Rc::clone(&self.state)
    }

    fn round_trip(&mut self) -> Result<()> {
        let mut s = self.state.borrow_mut();
        if !s.comms_ok {
            return Err(PsuError::CommandFailed("sim link down").into());
        }
        s.last_success_ms = self.clock.now_ms();
        Ok(())
    }
}

impl<C: Clock> PowerSupply for SimulatedPsu<C> {
    fn begin(&mut self) -> Result<()> {
        self.round_trip()
    }

    fn update(&mut self) -> bool {
        if self.round_trip().is_err() {
            return false;
        }
        let mut s = self.state.borrow_mut();
        // No smoothing in the simulation; the filtered value tracks the
        // instantaneous one so tests stay exact.
        s.curr_filtered = s.out_curr();
        true
    }

    fn set_current(&mut self, amps: f32) -> Result<()> {
        self.round_trip()?;
        let mut s = self.state.borrow_mut();
        s.limit_curr = amps;
        s.set_current_log.push(amps);
        Ok(())
    }

    fn set_voltage(&mut self, volts: f32) -> Result<()> {
        self.round_trip()?;
        self.state.borrow_mut().limit_volt = volts;
        Ok(())
    }

    fn enable_output(&mut self, on: bool) -> Result<()> {
        self.round_trip()?;
        self.state.borrow_mut().out_en = on;
        Ok(())
    }

    fn read_current(&mut self) -> Result<f32> {
        self.round_trip()?;
        let mut s = self.state.borrow_mut();
        let curr = s.out_curr();
        s.curr_filtered = curr;
        Ok(curr)
    }

    fn input_voltage(&mut self) -> Option<f32> {
        let s = self.state.borrow();
        s.comms_ok.then(|| s.input_volt())
    }

    fn set_energy_wh(&mut self, wh: f32) -> Result<()> {
        self.round_trip()?;
        self.state.borrow_mut().energy_wh = wh;
        Ok(())
    }

    fn status(&self) -> PsuStatus {
        let s = self.state.borrow();
        PsuStatus {
            out_volt: s.out_volt,
            out_curr: s.out_curr(),
            curr_filtered: s.curr_filtered,
            limit_curr: s.limit_curr,
            limit_volt: s.limit_volt,
            out_en: s.out_en,
            energy_wh: s.energy_wh,
            last_success_ms: s.last_success_ms,
            cv_mode: s.cv_mode,
            collapsed: s.collapsed(),
        }
    }

    fn device_class(&self) -> DeviceClass {
        DeviceClass::Simulated
    }
}
