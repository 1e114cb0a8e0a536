//! Capability traits (ports) the control core depends on.
//!
//! Device builds wire these to ESP-IDF adapters; host builds wire them to
//! simulations. The core never touches hardware directly.

use crate::app::events::ControlEvent;
use crate::config::ControlConfig;
use crate::error::Result;
use crate::psu::{DeviceClass, PsuStatus};

/// Monotonic 32-bit millisecond clock. Wraps every ~49.7 days; all
/// consumers compare times through [`crate::control::deadline_passed`].
pub trait Clock {
    fn now_ms(&self) -> u32;
}

/// A programmable power supply: the buck converter between panel and
/// battery. Object-safe so the core can hold whichever driver was
/// configured at runtime.
pub trait PowerSupply {
    /// (Re)open the link to the device.
    fn begin(&mut self) -> Result<()>;

    /// Refresh the telemetry snapshot; false on a failed round-trip.
    fn update(&mut self) -> bool;

    fn set_current(&mut self, amps: f32) -> Result<()>;
    fn set_voltage(&mut self, volts: f32) -> Result<()>;
    fn enable_output(&mut self, on: bool) -> Result<()>;

    /// Read the instantaneous output current from the device.
    fn read_current(&mut self) -> Result<f32>;

    /// Panel-side input voltage, for devices that can measure it.
    /// `None` means the caller should fall back to its own ADC.
    fn input_voltage(&mut self) -> Option<f32>;

    fn set_energy_wh(&mut self, wh: f32) -> Result<()>;

    /// Last refreshed telemetry snapshot.
    fn status(&self) -> PsuStatus;

    fn device_class(&self) -> DeviceClass;
}

/// Builds power-supply drivers for runtime (re)configuration. A build
/// only offers the classes whose drivers it links.
pub trait PsuFactory {
    /// `None` when no driver for the class is available in this build.
    fn make(&mut self, class: DeviceClass) -> Option<Box<dyn PowerSupply>>;
}

/// Raw ADC access for the panel-voltage fallback path (12-bit reading).
pub trait InputSense {
    fn read_input_raw(&mut self) -> u16;
}

/// Digital output driving the battery-protect relay.
pub trait ProtectRelay {
    fn drive(&mut self, pin: u8, invert: bool, tripped: bool);
}

/// Everything the tick loop needs from the board in one place.
pub trait ControlIo: InputSense + ProtectRelay {}

impl<T: InputSense + ProtectRelay> ControlIo for T {}

/// Outbound event stream. `flush` must push anything buffered out to the
/// world; the protection path calls it right before possibly cutting its
/// own power.
pub trait EventSink {
    fn emit(&mut self, event: &ControlEvent);

    fn flush(&mut self) {}
}

/// Persistent storage for the control configuration.
pub trait ConfigPort {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&mut self) -> anyhow::Result<Option<ControlConfig>>;

    fn save(&mut self, config: &ControlConfig) -> anyhow::Result<()>;
}
