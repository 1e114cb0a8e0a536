//! Suntrack firmware — main entry point.
//!
//! Hexagonal layout: the [`ControlLoop`] core runs against port traits,
//! and this binary wires the concrete adapters to it.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  Adapters (outer ring)                   │
//! │                                                          │
//! │  HardwareIo      LogEventSink   NvsAdapter   Esp32Time   │
//! │  (ADC + relay)   (EventSink)    (ConfigPort) (Clock)     │
//! │                                                          │
//! │  ────────────── Port Trait Boundary ──────────────       │
//! │                                                          │
//! │  ┌────────────────────────────────────────────────┐      │
//! │  │          ControlLoop (pure logic)              │      │
//! │  │  state machine · sweep · collapse · backoff    │      │
//! │  └────────────────────────────────────────────────┘      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The host build runs the same core against the simulated panel for a
//! few seconds — handy for eyeballing behavior without hardware.

#![deny(unused_must_use)]

use anyhow::Result;
use log::{info, warn};

use suntrack::adapters::log_sink::LogEventSink;
use suntrack::adapters::nvs::NvsAdapter;
use suntrack::adapters::time::Esp32TimeAdapter;
use suntrack::app::ports::ConfigPort;
use suntrack::app::service::ControlLoop;
use suntrack::config::ControlConfig;

/// How often the possibly-updated config is compared against the stored
/// blob and re-persisted.
const CONFIG_SAVE_PERIOD_MS: u32 = 60_000;

fn load_config(nvs: &mut NvsAdapter) -> ControlConfig {
    match nvs.load() {
        Ok(Some(cfg)) => {
            info!("config loaded from nvs");
            cfg
        }
        Ok(None) => ControlConfig::default(),
        Err(e) => {
            warn!("config load failed ({e}), using defaults");
            ControlConfig::default()
        }
    }
}

/// Persist the config when it drifted from what is stored (setpoint moves
/// after sweeps, the off-threshold self-calibrates).
fn save_config_if_changed(
    nvs: &mut NvsAdapter,
    current: &ControlConfig,
    last_saved: &mut Vec<u8>,
) {
    let Ok(bytes) = postcard::to_allocvec(current) else {
        return;
    };
    if bytes == *last_saved {
        return;
    }
    match nvs.save(current) {
        Ok(()) => *last_saved = bytes,
        Err(e) => warn!("config save failed: {e}"),
    }
}

#[cfg(target_os = "espidf")]
fn main() -> Result<()> {
    use esp_idf_hal::delay::FreeRtos;
    use suntrack::adapters::hardware::HardwareIo;
    use suntrack::app::events::ControlEvent;
    use suntrack::app::ports::{Clock, EventSink};
    use suntrack::control::deadline_passed;

    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("Suntrack v{}", env!("CARGO_PKG_VERSION"));

    let mut io = HardwareIo::init()?;
    let mut nvs = NvsAdapter::new()?;
    let config = load_config(&mut nvs);
    let mut last_saved = postcard::to_allocvec(&config)?;

    let clock = Esp32TimeAdapter::new();
    let mut core = ControlLoop::new(Esp32TimeAdapter::new(), FreeRtos, config);
    let mut sink = LogEventSink::new();
    sink.emit(&ControlEvent::Started);

    // The supply driver is provisioned at runtime (core.install_psu);
    // until then the core idles in the error state.
    info!("no PSU set");

    let mut next_save = clock.now_ms().wrapping_add(CONFIG_SAVE_PERIOD_MS);
    loop {
        core.tick(&mut io, &mut sink);
        let now = clock.now_ms();
        if deadline_passed(now, next_save) {
            save_config_if_changed(&mut nvs, core.config(), &mut last_saved);
            next_save = now.wrapping_add(CONFIG_SAVE_PERIOD_MS);
        }
        FreeRtos::delay_ms(1);
    }
}

#[cfg(not(target_os = "espidf"))]
fn main() -> Result<()> {
    use suntrack::adapters::hardware::SimIo;
    use suntrack::adapters::time::StdDelay;
    use suntrack::app::events::ControlEvent;
    use suntrack::app::ports::{EventSink, PowerSupply, PsuFactory};
    use suntrack::psu::{DeviceClass, SimulatedPsu};

    /// The only driver a host build links is the simulated panel/supply.
    struct SimPsuFactory;

    impl PsuFactory for SimPsuFactory {
        fn make(&mut self, class: DeviceClass) -> Option<Box<dyn PowerSupply>> {
            (class == DeviceClass::Simulated)
                .then(|| Box::new(SimulatedPsu::new(Esp32TimeAdapter::new())) as Box<dyn PowerSupply>)
        }
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Suntrack v{} (host simulation)", env!("CARGO_PKG_VERSION"));

    let mut nvs = NvsAdapter::new()?;
    let mut config = load_config(&mut nvs);
    config.setpoint = 17.0;
    let mut last_saved = postcard::to_allocvec(&config)?;

    let mut core = ControlLoop::new(Esp32TimeAdapter::new(), StdDelay, config);
    let mut io = SimIo::default();
    let mut sink = LogEventSink::new();
    sink.emit(&ControlEvent::Started);

    core.set_psu_factory(Box::new(SimPsuFactory));
    core.set_psu("sim")
        .map_err(|e| anyhow::anyhow!("psu install failed: {e}"))?;

    // Ten seconds of simulated tracking, then dump the snapshot.
    let start = std::time::Instant::now();
    while start.elapsed().as_secs() < 10 {
        core.tick(&mut io, &mut sink);
        save_config_if_changed(&mut nvs, core.config(), &mut last_saved);
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    println!("{}", serde_json::to_string_pretty(&core.snapshot())?);
    Ok(())
}
