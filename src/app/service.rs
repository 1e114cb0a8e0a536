//! The control core: operating-state machine, measurement/adjustment
//! scheduling, sweep driving, collapse recovery, and failure backoff.
//!
//! [`ControlLoop::tick`] is the single entry point; the hosting binary
//! calls it as fast as it likes and the internal deadlines decide what
//! actually runs. Everything here is host-testable through the port
//! traits.

use embedded_hal::delay::DelayNs;
use log::{debug, error, info, warn};

use crate::app::commands::Command;
use crate::app::events::{ControlEvent, StatusSnapshot};
use crate::app::ports::{Clock, ControlIo, EventSink, PowerSupply, PsuFactory};
use crate::config::ControlConfig;
use crate::control::backoff::BackoffController;
use crate::control::collapse::{has_collapsed, CollapseLog};
use crate::control::sweep::{SamplePoint, SweepEngine, SweepOutcome};
use crate::control::{deadline_passed, Deadlines, OperatingState};
use crate::error::{ConfigError, Error, PsuError, Result};
use crate::lvprotect::{LowVoltageProtect, LvProtectConfig};
use crate::psu::{DeviceClass, PsuStatus};
use crate::publish::{DirtySet, Field};

/// Adjustment deadband: errors inside (-0.2 V, +0.3 V] leave the current
/// limit alone. Tighter on the low side so ramp-downs start sooner.
const DEADBAND_HIGH_V: f32 = 0.3;
const DEADBAND_LOW_V: f32 = 0.2;

/// With the output enabled, this much silence from the supply is a fault.
const ENABLED_SILENCE_LIMIT_S: u32 = 11;
/// With the output disabled the supply may idle, but not this long while
/// the panel shows daylight.
const DISABLED_SILENCE_LIMIT_S: u32 = 120;

/// An adjustment attempt that should raise the backoff level.
struct Backoff {
    reason: String,
}

impl Backoff {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// The controller core, generic over its clock and delay providers.
pub struct ControlLoop<C: Clock, D: DelayNs> {
    clock: C,
    delay: D,
    config: ControlConfig,
    state: OperatingState,
    psu: Option<Box<dyn PowerSupply>>,
    psu_factory: Option<Box<dyn PsuFactory>>,
    lv: Option<LowVoltageProtect>,
    sweep: SweepEngine,
    collapses: CollapseLog,
    backoff: BackoffController,
    dirty: DirtySet,
    in_volt: f32,
    deadlines: Deadlines,
}

impl<C: Clock, D: DelayNs> ControlLoop<C, D> {
    pub fn new(clock: C, delay: D, config: ControlConfig) -> Self {
        let now = clock.now_ms();
        Self {
            clock,
            delay,
            config,
            state: OperatingState::Off,
            psu: None,
            psu_factory: None,
            lv: None,
            sweep: SweepEngine::new(),
            collapses: CollapseLog::new(),
            backoff: BackoffController::new(),
            dirty: DirtySet::new(),
            in_volt: 0.0,
            deadlines: Deadlines::starting_at(now),
        }
    }

    // -- accessors -------------------------------------------------------

    pub fn state(&self) -> OperatingState {
        self.state
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn in_volt(&self) -> f32 {
        self.in_volt
    }

    pub fn collapse_count(&self) -> usize {
        self.collapses.count()
    }

    pub fn backoff_level(&self) -> u8 {
        self.backoff.level()
    }

    pub fn psu_status(&self) -> Option<PsuStatus> {
        self.psu.as_ref().map(|p| p.status())
    }

    /// Fields changed since the last drain, for the publishing transport.
    pub fn dirty_fields(&mut self) -> &mut DirtySet {
        &mut self.dirty
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let st = self.psu_status().unwrap_or_default();
        StatusSnapshot {
            state: self.state.as_str(),
            in_volt: self.in_volt,
            out_volt: st.out_volt,
            out_curr: st.out_curr,
            out_power: st.out_power(),
            energy_wh: st.energy_wh,
            setpoint: self.config.setpoint,
            collapses: self.collapses.count(),
            backoff_level: self.backoff.level(),
            lv_protected: self.lv.as_ref().is_some_and(|l| l.is_triggered()),
        }
    }

    // -- configuration ---------------------------------------------------

    /// Install (or replace) the power supply driver. Slow serial links get
    /// the measurement period relaxed if it still holds the fast default.
    pub fn install_psu(&mut self, mut psu: Box<dyn PowerSupply>) -> Result<()> {
        let class = psu.device_class();
        info!("installing {class} power supply");
        let link_period = class.default_meas_period_ms();
        if self.config.meas_period_ms == 200 && link_period > 200 {
            self.config.meas_period_ms = link_period;
            self.dirty.mark(Field::MeasPeriod);
        }
        psu.begin()?;
        let _ = psu.update();
        let st = psu.status();
        // Seed the limit from whatever the device is actually passing so
        // the first adjustment ramps from reality rather than zero.
        let _ = psu.set_current(st.out_curr);
        info!(
            "startup current is {:.3}Afilt/{:.3}Aout",
            st.curr_filtered, st.out_curr
        );
        self.psu = Some(psu);
        self.dirty.mark_all();
        if self.config.auto_sweep_secs > 0 {
            // First auto-sweep shortly after bring-up.
            self.deadlines.next_auto_sweep = self.clock.now_ms().wrapping_add(10_000);
        }
        Ok(())
    }

    pub fn clear_psu(&mut self) {
        self.psu = None;
    }

    /// Provide the driver factory backing `psu=<class>` reconfiguration.
    pub fn set_psu_factory(&mut self, factory: Box<dyn PsuFactory>) {
        self.psu_factory = Some(factory);
    }

    /// Replace the supply driver by device-class name; an empty spec
    /// reports the current class. A bad class or a missing driver leaves
    /// the old instance running.
    pub fn set_psu(&mut self, spec: &str) -> Result<String> {
        if spec.is_empty() {
            return Ok(self
                .psu
                .as_ref()
                .map_or_else(|| "none".to_owned(), |p| p.device_class().to_string()));
        }
        let class: DeviceClass = spec.parse()?;
        let factory = self
            .psu_factory
            .as_mut()
            .ok_or(Error::Config(ConfigError::InvalidValue(
                "no psu drivers available in this build",
            )))?;
        let psu = factory
            .make(class)
            .ok_or(Error::Config(ConfigError::InvalidValue(
                "no driver for that psu class",
            )))?;
        self.install_psu(psu)?;
        Ok(format!("new {class} psu ok"))
    }

    /// Configure low-voltage protection from its text spec; an empty spec
    /// reports the current one. The old instance survives a bad spec.
    pub fn set_lv_protect(&mut self, spec: &str) -> Result<String> {
        if spec.is_empty() {
            return Ok(self
                .lv
                .as_ref()
                .map(|l| l.config().to_string())
                .unwrap_or_default());
        }
        let cfg: LvProtectConfig = spec.parse()?;
        info!("low-voltage cutoff enabled: {cfg} (pin[i]:cutoff:recovery)");
        self.lv = Some(LowVoltageProtect::new(cfg, self.clock.now_ms()));
        Ok(format!("new {cfg} ok"))
    }

    // -- command surface -------------------------------------------------

    pub fn handle_command(
        &mut self,
        cmd: Command,
        io: &mut dyn ControlIo,
        sink: &mut dyn EventSink,
    ) -> Result<String> {
        match cmd {
            Command::StartSweep => {
                self.start_sweep(io, sink);
                Ok("sweeping".to_owned())
            }
            Command::ReconnectPsu => {
                let psu = self.psu.as_mut().ok_or(Error::Psu(PsuError::NotConfigured))?;
                psu.begin()?;
                Ok("reconnected".to_owned())
            }
            Command::GetCollapses => Ok(self.collapses.count().to_string()),
            Command::SetLvProtect(spec) => self.set_lv_protect(&spec),
            Command::SetPsu(spec) => self.set_psu(&spec),
            Command::Get(name) => self.get_field(&name),
            Command::Set(name, value) => {
                self.set_field(&name, &value)?;
                Ok("ok".to_owned())
            }
        }
    }

    /// Read any published field as text.
    pub fn get_field(&self, name: &str) -> Result<String> {
        let field = Field::from_name(name).ok_or(Error::Config(ConfigError::UnknownField))?;
        let psu = || self.psu_status().ok_or(Error::Psu(PsuError::NotConfigured));
        Ok(match field {
            Field::State => self.state.as_str().to_owned(),
            Field::InVolt => format!("{:.2}", self.in_volt),
            Field::OutVolt => format!("{:.2}", psu()?.out_volt),
            Field::OutCurr => format!("{:.3}", psu()?.out_curr),
            Field::OutPower => format!("{:.2}", psu()?.out_power()),
            Field::CurrFilt => format!("{:.3}", psu()?.curr_filtered),
            Field::OutputEn => psu()?.out_en.to_string(),
            Field::EnergyWh => format!("{:.2}", psu()?.energy_wh),
            Field::Collapses => self.collapses.count().to_string(),
            Field::Pgain => format!("{}", self.config.pgain),
            Field::RampLimit => format!("{}", self.config.ramp_limit),
            Field::Setpoint => format!("{}", self.config.setpoint),
            Field::Vadjust => format!("{}", self.config.vadjust),
            Field::MeasPeriod => self.config.meas_period_ms.to_string(),
            Field::AdjustPeriod => self.config.adjust_period_ms.to_string(),
            Field::PrintPeriod => self.config.print_period_ms.to_string(),
            Field::AutoSweep => self.config.auto_sweep_secs.to_string(),
            Field::CurrentCap => format!("{}", self.config.current_cap),
            Field::OffThreshold => format!("{}", self.config.off_threshold),
        })
    }

    /// Write a field from text. Config fields are validated and committed;
    /// device-backed fields become supply commands; telemetry is rejected.
    pub fn set_field(&mut self, name: &str, value: &str) -> Result<()> {
        let field = Field::from_name(name).ok_or(Error::Config(ConfigError::UnknownField))?;
        if field.read_only() {
            return Err(ConfigError::ReadOnlyField.into());
        }
        fn parse_f32(value: &str) -> Result<f32> {
            value
                .parse()
                .map_err(|_| Error::Config(ConfigError::InvalidValue("not a number")))
        }
        fn parse_u32(value: &str) -> Result<u32> {
            value
                .parse()
                .map_err(|_| Error::Config(ConfigError::InvalidValue("not an integer")))
        }
        if field.psu_backed() {
            let psu = self.psu.as_mut().ok_or(Error::Psu(PsuError::NotConfigured))?;
            match field {
                Field::OutVolt => psu.set_voltage(parse_f32(value)?)?,
                Field::OutCurr => psu.set_current(parse_f32(value)?)?,
                Field::OutputEn => psu.enable_output(matches!(value, "on" | "true" | "1"))?,
                Field::EnergyWh => psu.set_energy_wh(parse_f32(value)?)?,
                _ => unreachable!("psu_backed covers exactly these"),
            }
            self.dirty.mark(field);
            return Ok(());
        }
        let mut updated = self.config.clone();
        match field {
            Field::Pgain => updated.pgain = parse_f32(value)?,
            Field::RampLimit => updated.ramp_limit = parse_f32(value)?,
            Field::Setpoint => updated.setpoint = parse_f32(value)?,
            Field::Vadjust => updated.vadjust = parse_f32(value)?,
            Field::MeasPeriod => updated.meas_period_ms = parse_u32(value)?,
            Field::AdjustPeriod => updated.adjust_period_ms = parse_u32(value)?,
            Field::PrintPeriod => updated.print_period_ms = parse_u32(value)?,
            Field::AutoSweep => updated.auto_sweep_secs = parse_u32(value)?,
            Field::CurrentCap => updated.current_cap = parse_f32(value)?,
            Field::OffThreshold => updated.off_threshold = parse_f32(value)?,
            _ => unreachable!("non-config fields handled above"),
        }
        updated.validate()?;
        self.config = updated;
        self.dirty.mark(field);
        Ok(())
    }

    // -- the tick loop ---------------------------------------------------

    /// Run every task whose deadline has passed. Call freely; cheap when
    /// nothing is due.
    pub fn tick(&mut self, io: &mut dyn ControlIo, sink: &mut dyn EventSink) {
        let now = self.clock.now_ms();

        if deadline_passed(now, self.deadlines.next_measure) {
            self.do_measure(io, sink);
            self.do_update_state(sink);
            let period = if self.state == OperatingState::Sweeping {
                self.config.meas_period_ms * 2
            } else {
                self.config.meas_period_ms
            };
            self.deadlines.next_measure = now.wrapping_add(period);
        }

        if deadline_passed(now, self.deadlines.next_adjust) {
            let desired = self.do_measure(io, sink);
            self.do_adjust(desired, io, sink);
            // Scheduled from the backoff level even if do_measure asked
            // for a quick recheck; failures always slow the loop down.
            self.deadlines.next_adjust =
                now.wrapping_add(self.backoff.interval(self.config.adjust_period_ms));
        }

        if deadline_passed(now, self.deadlines.next_print) {
            self.print_status();
            self.deadlines.next_print = now.wrapping_add(self.config.print_period_ms);
        }

        if self.psu.is_some() && deadline_passed(now, self.deadlines.next_psu_update) {
            self.psu_housekeeping(now, sink);
        }

        if let Some(lv) = self.lv.as_mut() {
            if let Some(st) = self.psu.as_ref().map(|p| p.status()) {
                lv.check(now, st.out_volt, io, sink);
            }
        }

        self.auto_sweep_tick(now, io, sink);
    }

    fn psu_housekeeping(&mut self, now: u32, sink: &mut dyn EventSink) {
        if !self.update_psu_telemetry() {
            warn!("psu update fail, reconnecting");
            if let Some(psu) = self.psu.as_mut() {
                if let Err(e) = psu.begin() {
                    warn!("psu reconnect failed: {e}");
                }
            }
        }
        if let Some(st) = self.psu_status() {
            let silent_ms = now.wrapping_sub(st.last_success_ms);
            if self.in_volt > 1.0 && silent_ms > 5 * 60_000 {
                error!("very unresponsive psu, silent {}s", silent_ms / 1000);
                sink.emit(&ControlEvent::PsuUnresponsive { silent_ms });
            }
        }
        self.deadlines.next_psu_update =
            now.wrapping_add(self.backoff.interval(5000).min(100_000));
    }

    fn auto_sweep_tick(&mut self, now: u32, io: &mut dyn ControlIo, sink: &mut dyn EventSink) {
        // A rash of collapses pulls the next sweep in to a third of the
        // configured interval.
        if self.collapses.count() > 2 {
            self.deadlines.next_auto_sweep = self
                .deadlines
                .last_auto_sweep
                .wrapping_add(self.config.auto_sweep_secs.saturating_mul(1000) / 3);
        }
        if self.config.auto_sweep_secs == 0
            || !deadline_passed(now, self.deadlines.next_auto_sweep)
        {
            return;
        }
        match self.state {
            OperatingState::Capped => {
                info!(
                    "skipping auto-sweep, already at current cap ({:.1}A)",
                    self.config.current_cap
                );
            }
            OperatingState::FullCv => {
                info!("skipping auto-sweep, battery-full voltage reached");
            }
            OperatingState::Mppt | OperatingState::CollapseMode => {
                let ago_min =
                    now.wrapping_sub(self.deadlines.last_auto_sweep) as f32 / 1000.0 / 60.0;
                info!("starting auto-sweep (last run {ago_min:.1} mins ago)");
                self.start_sweep(io, sink);
            }
            _ => {}
        }
        self.deadlines.next_auto_sweep =
            now.wrapping_add(self.config.auto_sweep_secs.saturating_mul(1000));
        self.deadlines.last_auto_sweep = now;
    }

    // -- measurement -----------------------------------------------------

    /// Refresh the panel input voltage: from the supply when it can
    /// measure it (refreshing a stale link first), else from our own ADC.
    fn measure_input_volt(&mut self, io: &mut dyn ControlIo) -> f32 {
        let now = self.clock.now_ms();
        let mut reading = None;
        if let Some(psu) = self.psu.as_mut() {
            if let Some(v) = psu.input_voltage() {
                let stale = now.wrapping_sub(psu.status().last_success_ms) > 600;
                reading = if stale && psu.update() {
                    psu.input_voltage().or(Some(v))
                } else {
                    Some(v)
                };
            }
        }
        self.in_volt = match reading {
            Some(v) => v,
            None => f32::from(io.read_input_raw()) * self.config.vadjust / 4096.0,
        };
        self.dirty.mark(Field::InVolt);
        self.in_volt
    }

    /// Measure, and compute the current limit the next adjustment should
    /// apply. Inside the deadband (or with tracking disabled) this is the
    /// present limit, making the adjustment a no-op.
    fn do_measure(&mut self, io: &mut dyn ControlIo, sink: &mut dyn EventSink) -> f32 {
        self.measure_input_volt(io);
        if self.state == OperatingState::Sweeping {
            self.do_sweep_step(io, sink);
        } else if self.config.setpoint > 0.0 {
            if let Some(st) = self.psu_status() {
                if st.out_en {
                    let error = self.in_volt - self.config.setpoint;
                    let dcurr = (error * self.config.pgain)
                        .clamp(-self.config.ramp_limit * 2.0, self.config.ramp_limit);
                    if error > DEADBAND_HIGH_V || -error > DEADBAND_LOW_V {
                        if error < 0.6 && self.state == OperatingState::Mppt {
                            // Overshooting the panel knee; recheck now.
                            debug!("[QUICK]");
                            self.deadlines.next_adjust = self.clock.now_ms();
                        }
                        return (st.limit_curr + dcurr).min(self.config.current_cap);
                    }
                }
            }
        }
        self.psu_status().map_or(0.0, |st| st.limit_curr)
    }

    // -- state machine ---------------------------------------------------

    fn set_state(&mut self, next: OperatingState, reason: &str, sink: &mut dyn EventSink) {
        if self.state != next {
            self.dirty.mark(Field::State);
            info!("state change to {next} (from {}) {reason}", self.state);
            sink.emit(&ControlEvent::StateChanged {
                from: self.state.as_str(),
                to: next.as_str(),
                reason: reason.to_owned(),
            });
        }
        self.state = next;
    }

    /// Derive the operating state from supply telemetry. Sweeps and
    /// deliberate collapse-mode runs own the state until they end.
    fn do_update_state(&mut self, sink: &mut dyn EventSink) {
        let Some(st) = self.psu_status() else {
            return self.set_state(OperatingState::Error, "no psu", sink);
        };
        if self.state == OperatingState::Sweeping || self.state == OperatingState::CollapseMode {
            return;
        }
        let silent_s = self.clock.now_ms().wrapping_sub(st.last_success_ms) / 1000;
        if st.out_en {
            if silent_s > ENABLED_SILENCE_LIMIT_S {
                self.set_state(OperatingState::Error, "enabled but no psu comms", sink);
            } else if st.out_curr > self.config.current_cap * 0.95 {
                self.set_state(OperatingState::Capped, "", sink);
            } else if st.cv_mode {
                self.set_state(OperatingState::FullCv, "", sink);
            } else {
                self.set_state(OperatingState::Mppt, "", sink);
            }
        } else if self.in_volt > 1.0 && silent_s > DISABLED_SILENCE_LIMIT_S {
            self.set_state(OperatingState::Error, "inactive psu", sink);
        } else {
            self.set_state(OperatingState::Off, "", sink);
        }
    }

    // -- adjustment ------------------------------------------------------

    fn do_adjust(&mut self, desired: f32, io: &mut dyn ControlIo, sink: &mut dyn EventSink) {
        match self.try_adjust(desired, io, sink) {
            Ok(()) => self.backoff.on_success(),
            Err(b) => {
                self.backoff.on_failure();
                let retry = self.backoff.interval(self.config.adjust_period_ms);
                warn!("backoff now at {}s: {}", retry / 1000, b.reason);
                sink.emit(&ControlEvent::BackoffRaised {
                    level: self.backoff.level(),
                    retry_ms: retry,
                    reason: b.reason,
                });
            }
        }
        if self.collapses.prune(self.clock.now_ms()) > 0 {
            self.dirty.mark(Field::Collapses);
        }
    }

    fn try_adjust(
        &mut self,
        desired: f32,
        io: &mut dyn ControlIo,
        sink: &mut dyn EventSink,
    ) -> core::result::Result<(), Backoff> {
        let now = self.clock.now_ms();

        if self.state == OperatingState::Error {
            // Freshly failed: keep commanding a shutdown for a while in
            // case the link comes back mid-fault.
            if let Some(psu) = self.psu.as_mut() {
                if now.wrapping_sub(psu.status().last_success_ms) < 30_000 {
                    let _ = psu.enable_output(false);
                    let _ = psu.set_current(0.0);
                    return Err(Backoff::new("psu failure, disabling"));
                }
            }
            return Ok(());
        }

        if self.config.setpoint <= 0.0 || self.state == OperatingState::Sweeping {
            return Ok(());
        }

        let st = self.psu_status();
        let collapsed = match (&st, self.psu.as_ref()) {
            (Some(st), Some(psu)) => has_collapsed(self.in_volt, st, psu.device_class()),
            _ => false,
        };

        if collapsed && self.state != OperatingState::CollapseMode {
            let st = st.unwrap_or_default();
            self.collapses.record(now);
            self.dirty.mark(Field::Collapses);
            warn!(
                "collapsed! {:.2}Vin [{:.2}Vout {:.2}Aout]",
                self.in_volt, st.out_volt, st.out_curr
            );
            sink.emit(&ControlEvent::CollapseDetected {
                in_volt: self.in_volt,
                count: self.collapses.count(),
            });
            self.restore_from_collapse(st.curr_filtered * 0.95, io);
        } else if let Some(st) = st {
            if !st.out_en {
                if self.in_volt < st.out_volt || st.out_volt < 0.1 {
                    return Err(Backoff::new(
                        "not starting up, input voltage too low (is it dark?)",
                    ));
                } else if st.out_volt > st.limit_volt
                    || (st.out_volt < st.limit_volt * 0.60 && st.out_volt > 1.0)
                {
                    // The lower bound still admits a battery behind a
                    // drain diode; anything further off means the limit
                    // was set for a different battery.
                    return Err(Backoff::new(format!(
                        "not starting up, battery {:.1}V too far from supply limit {:.1}V",
                        st.out_volt, st.limit_volt
                    )));
                }
                info!("enabling output");
                if let Some(psu) = self.psu.as_mut() {
                    let _ = psu.enable_output(true);
                }
            }
        }

        let enabled = self.psu_status().is_some_and(|st| st.out_en);
        if enabled && self.state != OperatingState::CollapseMode {
            self.apply_adjustment(desired);
        }
        Ok(())
    }

    /// Push a new current limit to the supply, then read back the actual
    /// current. Exactly-unchanged limits are left alone to spare the link.
    fn apply_adjustment(&mut self, current: f32) {
        let Some(psu) = self.psu.as_mut() else {
            return;
        };
        let previous = psu.status().limit_curr;
        if (current - previous).abs() <= f32::EPSILON {
            return;
        }
        match psu.set_current(current) {
            Ok(()) => debug!(
                "[adjusting {:+.3}A (from {previous:.3}A)]",
                current - previous
            ),
            Err(e) => warn!("error setting current: {e}"),
        }
        self.delay.delay_ms(50);
        if let Some(psu) = self.psu.as_mut() {
            let _ = psu.read_current();
        }
        self.dirty.mark(Field::OutCurr);
        self.dirty.mark(Field::OutPower);
        self.print_status();
    }

    // -- collapse recovery -----------------------------------------------

    /// Drop to a token current, wait (up to 8 s) for the panel voltage to
    /// recover past the off-threshold, then set the restore current. The
    /// first recovery after boot calibrates the threshold from the
    /// observed open-panel voltage.
    fn restore_from_collapse(&mut self, restore_current: f32, io: &mut dyn ControlIo) {
        if let Some(psu) = self.psu.as_mut() {
            // Some supplies wedge when the output is toggled off; a token
            // current unloads the panel just as well.
            let _ = psu.set_current(0.01);
        }
        let start = self.clock.now_ms();
        while self.clock.now_ms().wrapping_sub(start) < 8000
            && self.measure_input_volt(io) < self.config.off_threshold
        {
            self.delay.delay_ms(25);
        }
        let in_v = self.measure_input_volt(io);
        if self.config.off_threshold_uncalibrated() {
            self.config.off_threshold = 0.992 * in_v;
            info!("restore threshold now set to {:.2}V", self.config.off_threshold);
            self.dirty.mark(Field::OffThreshold);
        }
        info!(
            "restore took {:.1}s to reach {:.1}V [goal {:.1}], setting {:.1}A",
            self.clock.now_ms().wrapping_sub(start) as f32 / 1000.0,
            in_v,
            self.config.off_threshold,
            restore_current
        );
        if let Some(psu) = self.psu.as_mut() {
            let _ = psu.set_current(restore_current);
        }
    }

    // -- sweeping --------------------------------------------------------

    /// Begin an I-V sweep: back the current off a little, come fully out
    /// of any collapse, and let the measurement ticks ramp from there.
    pub fn start_sweep(&mut self, io: &mut dyn ControlIo, sink: &mut dyn EventSink) {
        if self.state == OperatingState::Error {
            warn!("can't sweep, system is in error state");
            return;
        }
        let Some(st) = self.psu_status() else {
            warn!("can't sweep without a psu");
            return;
        };
        let start_current = st.curr_filtered * 0.90;
        if let Some(psu) = self.psu.as_mut() {
            let _ = psu.set_current(start_current);
        }
        info!(
            "SWEEP START c={start_current:.3}, (setpoint was {:.3})",
            self.config.setpoint
        );
        sink.emit(&ControlEvent::SweepStarted { start_current });
        let collapsed = self
            .psu
            .as_ref()
            .is_some_and(|psu| has_collapsed(self.in_volt, &psu.status(), psu.device_class()));
        if self.state == OperatingState::CollapseMode || collapsed {
            info!("first coming out of collapse-mode, clim {start_current:.2}A");
            self.restore_from_collapse(st.curr_filtered * 0.75, io);
        }
        self.sweep.clear();
        self.set_state(OperatingState::Sweeping, "sweep requested", sink);
        if let Some(psu) = self.psu.as_mut() {
            if !psu.status().out_en {
                let _ = psu.enable_output(true);
            }
        }
        self.deadlines.last_auto_sweep = self.clock.now_ms();
    }

    /// One sweep sample per measurement tick, terminating on the second
    /// collapsed point, the current cap, or constant-voltage mode.
    fn do_sweep_step(&mut self, io: &mut dyn ControlIo, sink: &mut dyn EventSink) {
        let Some(st) = self.psu_status() else {
            return;
        };
        if !st.out_en {
            // Abandoned sweep: the partial curve is useless.
            self.sweep.clear();
            return self.set_state(OperatingState::Mppt, "output disabled during sweep", sink);
        }

        self.update_psu_telemetry();
        let (st, collapsed) = match self.psu.as_ref() {
            Some(psu) => {
                let st = psu.status();
                (st, has_collapsed(self.in_volt, &st, psu.device_class()))
            }
            None => return,
        };
        let (collapsed_points, _) = self.sweep.record(SamplePoint {
            out_volt: st.out_volt,
            out_curr: st.out_curr,
            in_volt: self.in_volt,
            collapsed,
        });
        if collapsed {
            debug!("COLLAPSED[{collapsed_points}]");
        }

        if collapsed && collapsed_points >= 2 {
            return self.finish_sweep(&st, io, sink);
        }

        if st.limit_curr >= self.config.current_cap {
            if let Some(last) = self.sweep.last_point() {
                self.config.setpoint = last.in_volt;
                self.dirty.mark(Field::Setpoint);
            }
            info!(
                "SWEEP DONE, current cap of {:.1}A reached (setpoint={:.3})",
                self.config.current_cap, self.config.setpoint
            );
            self.set_state(OperatingState::Mppt, "current cap reached", sink);
            sink.emit(&ControlEvent::SweepFinished {
                setpoint: self.config.setpoint,
                run_collapsed: false,
            });
            self.sweep.clear();
            return self.apply_adjustment(self.config.current_cap);
        }
        if st.cv_mode {
            info!("SWEEP DONE, constant-voltage state reached");
            self.set_state(OperatingState::FullCv, "constant voltage reached", sink);
            sink.emit(&ControlEvent::SweepFinished {
                setpoint: self.config.setpoint,
                run_collapsed: false,
            });
            self.sweep.clear();
            return;
        }

        // Keep climbing, faster on stronger sun.
        let next = (st.limit_curr + self.in_volt * 0.001).min(self.config.current_cap + 0.001);
        self.apply_adjustment(next);
    }

    fn finish_sweep(&mut self, st: &PsuStatus, io: &mut dyn ControlIo, sink: &mut dyn EventSink) {
        let now = self.clock.now_ms();
        for (i, p) in self.sweep.points().iter().enumerate() {
            info!(
                "point {i} = [{:.2}Vin {:.2}Vout {:.2}Aout{}]",
                p.in_volt,
                p.out_volt,
                p.out_curr,
                if p.collapsed { " CLPS" } else { "" }
            );
        }
        match self.sweep.finish(self.collapses.count()) {
            SweepOutcome::Aborted => {
                warn!("SWEEP DONE but zero un-collapsed points, aborting");
                self.restore_from_collapse(st.curr_filtered * 0.5, io);
                self.set_state(OperatingState::Mppt, "sweep aborted", sink);
            }
            SweepOutcome::RunCollapsed { setpoint } => {
                info!(
                    "SWEEP DONE, will run collapsed (next sweep in {:.1}m)",
                    self.config.auto_sweep_secs as f32 / 3.0 / 60.0
                );
                self.set_state(OperatingState::CollapseMode, "collapsed point wins", sink);
                let clim = if self.config.current_cap > 0.0 {
                    self.config.current_cap
                } else {
                    10.0
                };
                if let Some(psu) = self.psu.as_mut() {
                    let _ = psu.set_current(clim);
                }
                self.deadlines.next_auto_sweep =
                    now.wrapping_add(self.config.auto_sweep_secs.saturating_mul(1000) / 3);
                self.config.setpoint = setpoint;
                sink.emit(&ControlEvent::SweepFinished {
                    setpoint,
                    run_collapsed: true,
                });
            }
            SweepOutcome::Restore {
                setpoint,
                restore_current,
            } => {
                info!(
                    "SWEEP DONE, new setpoint = {setpoint:.3} (was {:.3})",
                    self.config.setpoint
                );
                self.set_state(OperatingState::Mppt, "sweep finished", sink);
                self.restore_from_collapse(restore_current, io);
                self.config.setpoint = setpoint;
                sink.emit(&ControlEvent::SweepFinished {
                    setpoint,
                    run_collapsed: false,
                });
            }
        }
        self.dirty.mark(Field::Setpoint);
        // Don't re-judge the recovering voltage too quickly.
        self.deadlines.next_adjust = now.wrapping_add(1000);
        self.sweep.clear();
    }

    // -- telemetry -------------------------------------------------------

    fn update_psu_telemetry(&mut self) -> bool {
        let Some(psu) = self.psu.as_mut() else {
            return false;
        };
        if !psu.update() {
            return false;
        }
        let wh = psu.status().energy_wh;
        for f in [
            Field::OutVolt,
            Field::OutCurr,
            Field::OutputEn,
            Field::OutPower,
            Field::CurrFilt,
        ] {
            self.dirty.mark(f);
        }
        // The meter reads garbage for the first couple of watt-hours
        // after a reboot; hold publication until it settles.
        if wh > 2.0 {
            self.dirty.mark(Field::EnergyWh);
        }
        true
    }

    fn print_status(&self) {
        let lv = if self.lv.as_ref().is_some_and(|l| l.is_triggered()) {
            " [LV PROTECTED]"
        } else {
            ""
        };
        match self.psu_status() {
            Some(st) => info!(
                "{} {:.1}Vin -> {:.2}Wh [{:.2}Vout {:.2}Aout{}]{lv}",
                self.state.as_str().to_uppercase(),
                self.in_volt,
                st.energy_wh,
                st.out_volt,
                st.out_curr,
                if st.collapsed { " CLPS" } else { "" }
            ),
            None => info!(
                "{} {:.1}Vin [no PSU]{lv}",
                self.state.as_str().to_uppercase(),
                self.in_volt
            ),
        }
    }
}
