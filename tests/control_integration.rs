//! Integration tests: ControlLoop → state machine → simulated supply.
//!
//! Host-only; drives the whole core through its public surface with the
//! manual clock, the simulated panel/supply, and spy adapters.

#![cfg(not(target_os = "espidf"))]

use suntrack::adapters::hardware::SimIo;
use suntrack::adapters::time::{ManualClock, ManualDelay};
use suntrack::app::commands::Command;
use suntrack::app::events::ControlEvent;
use suntrack::app::ports::{Clock, EventSink};
use suntrack::app::service::ControlLoop;
use suntrack::config::ControlConfig;
use suntrack::control::OperatingState;
use suntrack::psu::{SimState, SimulatedPsu};

use core::cell::RefCell;
use std::rc::Rc;

// ── Test harness ──────────────────────────────────────────────

#[derive(Default)]
struct VecSink {
    events: Vec<ControlEvent>,
    flushes: usize,
}

impl EventSink for VecSink {
    fn emit(&mut self, event: &ControlEvent) {
        self.events.push(event.clone());
    }

    fn flush(&mut self) {
        self.flushes += 1;
    }
}

struct Harness {
    core: ControlLoop<ManualClock, ManualDelay>,
    clock: ManualClock,
    io: SimIo,
    sink: VecSink,
}

impl Harness {
    fn new(config: ControlConfig) -> Self {
        let clock = ManualClock::new();
        let delay = ManualDelay::new(clock.clone());
        Self {
            core: ControlLoop::new(clock.clone(), delay, config),
            clock,
            io: SimIo::default(),
            sink: VecSink::default(),
        }
    }

    fn install_sim_psu(&mut self) -> Rc<RefCell<SimState>> {
        let psu = SimulatedPsu::new(self.clock.clone());
        let handle = psu.state_handle();
        self.core.install_psu(Box::new(psu)).unwrap();
        handle
    }

    /// Tick repeatedly, advancing simulated time `step_ms` per iteration.
    fn run_for(&mut self, sim_ms: u32, step_ms: u32) {
        let end = self.clock.now_ms().wrapping_add(sim_ms);
        while self.clock.now_ms().wrapping_sub(end) >= u32::MAX / 2 {
            self.core.tick(&mut self.io, &mut self.sink);
            self.clock.advance(step_ms);
        }
    }

    fn state_changes(&self) -> Vec<(&'static str, &'static str)> {
        self.sink
            .events
            .iter()
            .filter_map(|e| match e {
                ControlEvent::StateChanged { from, to, .. } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }
}

// ── Scenarios ─────────────────────────────────────────────────

#[test]
fn boots_to_error_without_psu_then_recovers_after_install() {
    let mut h = Harness::new(ControlConfig::default());
    h.run_for(1_000, 100);
    assert_eq!(h.core.state(), OperatingState::Error);

    let _sim = h.install_sim_psu();
    h.run_for(1_000, 100);
    // Supply present, output disabled, link fresh: off.
    assert_eq!(h.core.state(), OperatingState::Off);
    assert!(h.state_changes().contains(&("off", "error")));
    assert!(h.state_changes().contains(&("error", "off")));

    // Tearing the supply back out faults again.
    h.core.clear_psu();
    h.run_for(1_000, 100);
    assert_eq!(h.core.state(), OperatingState::Error);
}

#[test]
fn tracks_panel_toward_setpoint() {
    // Auto-sweep off: this scenario pins the setpoint by hand.
    let config = ControlConfig {
        setpoint: 17.0,
        auto_sweep_secs: 0,
        ..Default::default()
    };
    let mut h = Harness::new(config);
    let sim = h.install_sim_psu();
    // Strong panel: equilibrium at 3 A sits well below the 5 A knee.
    sim.borrow_mut().available_curr = 5.0;

    h.run_for(120_000, 50);

    assert_eq!(h.core.state(), OperatingState::Mppt);
    let st = h.core.psu_status().unwrap();
    assert!(st.out_en, "output should have been enabled");
    // 20 V open circuit through 1 ohm: 17 V input means ~3 A drawn.
    assert!(
        (h.core.in_volt() - 17.0).abs() < 0.5,
        "input voltage {} should be near the setpoint",
        h.core.in_volt()
    );
    assert!((st.limit_curr - 3.0).abs() < 0.5);
    assert_eq!(h.core.collapse_count(), 0);
}

#[test]
fn sweep_finds_the_knee_and_restores_below_it() {
    let mut h = Harness::new(ControlConfig::default());
    let sim = h.install_sim_psu();
    // Weak panel: collapses past 1 A.
    sim.borrow_mut().available_curr = 1.0;

    h.run_for(2_000, 100);
    assert_eq!(h.core.state(), OperatingState::Off);

    h.core
        .handle_command(Command::StartSweep, &mut h.io, &mut h.sink)
        .unwrap();
    assert_eq!(h.core.state(), OperatingState::Sweeping);
    assert!(sim.borrow().out_en, "sweep enables the output");

    // The ramp climbs ~20 mA per step; give it ample simulated time.
    h.run_for(400_000, 100);

    assert_eq!(h.core.state(), OperatingState::Mppt);
    assert!(h
        .sink
        .events
        .iter()
        .any(|e| matches!(e, ControlEvent::SweepStarted { .. })));
    assert!(h.sink.events.iter().any(|e| matches!(
        e,
        ControlEvent::SweepFinished {
            run_collapsed: false,
            ..
        }
    )));
    // Setpoint landed near the knee (1 A through 1 ohm from 20 V).
    let setpoint = h.core.config().setpoint;
    assert!(
        (18.0..20.0).contains(&setpoint),
        "setpoint {setpoint} should sit just below open-circuit"
    );
    // Restore current backed off below the collapse current.
    let st = h.core.psu_status().unwrap();
    assert!(st.limit_curr < 1.0, "limit {} should be under the knee", st.limit_curr);
    assert!(st.limit_curr > 0.5);
    // First collapse recovery calibrated the sentinel threshold.
    let thresh = h.core.config().off_threshold;
    assert!(
        (19.0..20.0).contains(&thresh),
        "off threshold {thresh} should be ~99.2% of open-circuit"
    );
}

#[test]
fn collapse_during_tracking_is_logged_and_restored() {
    let config = ControlConfig {
        setpoint: 17.0,
        auto_sweep_secs: 0,
        ..Default::default()
    };
    let mut h = Harness::new(config);
    let sim = h.install_sim_psu();
    sim.borrow_mut().available_curr = 5.0;

    h.run_for(120_000, 50);
    assert_eq!(h.core.state(), OperatingState::Mppt);

    // A cloud: the panel can now barely source 1 A.
    sim.borrow_mut().available_curr = 1.0;
    h.run_for(30_000, 50);

    assert!(h.core.collapse_count() >= 1);
    assert!(h
        .sink
        .events
        .iter()
        .any(|e| matches!(e, ControlEvent::CollapseDetected { .. })));
    // Recovered to a current the panel can actually deliver.
    let st = h.core.psu_status().unwrap();
    assert!(st.limit_curr < 1.5, "limit {} after restore", st.limit_curr);
}

#[test]
fn low_voltage_protect_trips_and_releases_through_the_loop() {
    let mut h = Harness::new(ControlConfig::default());
    let sim = h.install_sim_psu();
    h.core.set_lv_protect("22:12.0:12.96").unwrap();

    // Healthy battery through the 5 s holdoff: nothing.
    h.run_for(10_000, 100);
    assert!(h.io.relay_drives.is_empty());

    // Battery sags below the trigger.
    sim.borrow_mut().out_volt = 11.9;
    h.run_for(2_000, 100);
    assert_eq!(h.io.relay_drives.last(), Some(&(22, false, true)));
    assert!(h.sink.flushes >= 1, "logs must flush before the relay trips");
    assert!(h
        .sink
        .events
        .iter()
        .any(|e| matches!(e, ControlEvent::LvProtectTripped { .. })));

    // Recovery to between trigger and release threshold: still tripped.
    sim.borrow_mut().out_volt = 12.5;
    h.run_for(10_000, 100);
    assert_eq!(h.io.relay_drives.last(), Some(&(22, false, true)));

    // Above the release threshold: relay released.
    sim.borrow_mut().out_volt = 13.0;
    h.run_for(10_000, 100);
    assert_eq!(h.io.relay_drives.last(), Some(&(22, false, false)));
    assert!(h
        .sink
        .events
        .iter()
        .any(|e| matches!(e, ControlEvent::LvProtectReleased { .. })));
}

#[test]
fn link_loss_while_enabled_faults_and_commands_shutdown() {
    let config = ControlConfig {
        setpoint: 17.0,
        auto_sweep_secs: 0,
        ..Default::default()
    };
    let mut h = Harness::new(config);
    let sim = h.install_sim_psu();
    sim.borrow_mut().available_curr = 5.0;
    h.run_for(60_000, 50);
    assert!(h.core.psu_status().unwrap().out_en);

    // Kill the link; silence grows past 11 s with the output enabled.
    sim.borrow_mut().comms_ok = false;
    h.run_for(20_000, 100);
    assert_eq!(h.core.state(), OperatingState::Error);
    assert!(h.core.backoff_level() >= 1);
    assert!(h
        .sink
        .events
        .iter()
        .any(|e| matches!(e, ControlEvent::BackoffRaised { .. })));

    // Link returns: the shutdown command lands, the state machine leaves
    // error on the next fresh telemetry, and tracking then re-enables the
    // output and works the backoff level back down.
    sim.borrow_mut().comms_ok = true;
    h.run_for(120_000, 100);
    assert_eq!(h.core.state(), OperatingState::Mppt);
    assert!(sim.borrow().out_en);
    assert!(h.core.backoff_level() <= 1);
}

#[test]
fn command_surface_round_trip() {
    let mut h = Harness::new(ControlConfig::default());
    let _sim = h.install_sim_psu();

    let mut cmd = |line: &str, h: &mut Harness| {
        let c = Command::parse(line).unwrap();
        h.core.handle_command(c, &mut h.io, &mut h.sink)
    };

    assert_eq!(cmd("collapses", &mut h).unwrap(), "0");
    cmd("setpoint=17.5", &mut h).unwrap();
    assert_eq!(cmd("setpoint", &mut h).unwrap(), "17.5");
    assert_eq!(cmd("state", &mut h).unwrap(), "off");
    // Telemetry names read back through the same surface.
    assert_eq!(cmd("outvolt", &mut h).unwrap(), "13.00");
    // Unknown and read-only fields are rejected.
    assert!(cmd("bogus", &mut h).is_err());
    assert!(cmd("involt=12", &mut h).is_err());
    // Device-backed fields pass writes through to the supply.
    cmd("outputen=on", &mut h).unwrap();
    assert_eq!(cmd("outputen", &mut h).unwrap(), "true");
    cmd("wh=150", &mut h).unwrap();
    assert_eq!(cmd("wh", &mut h).unwrap(), "150.00");
    cmd("outputen=off", &mut h).unwrap();
    // Supply link and driver management.
    assert_eq!(cmd("connect", &mut h).unwrap(), "reconnected");
    assert_eq!(cmd("psu", &mut h).unwrap(), "sim");
    // No driver factory was installed, so replacement is refused.
    assert!(cmd("psu=dps", &mut h).is_err());
    // Low-voltage protect configure-then-report.
    assert_eq!(cmd("lvprotect=21:11.8", &mut h).unwrap(), "new 21:11.80:12.74 ok");
    assert_eq!(cmd("lvprotect", &mut h).unwrap(), "21:11.80:12.74");
}
