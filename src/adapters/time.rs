//! ESP32 time adapter.
//!
//! - **`target_os = "espidf"`** — wraps `esp_timer_get_time()` from the
//!   ESP-IDF high-resolution timer (microsecond precision, monotonic).
//! - **`not(target_os = "espidf")`** — uses `std::time::Instant` for
//!   host-side runs, plus a hand-advanced clock for deterministic tests.

use crate::app::ports::Clock;

/// Millisecond clock for the ESP32 platform (host fallback: `Instant`).
pub struct Esp32TimeAdapter {
    #[cfg(not(target_os = "espidf"))]
    start: std::time::Instant,
}

impl Default for Esp32TimeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Esp32TimeAdapter {
    pub fn new() -> Self {
        Self {
            #[cfg(not(target_os = "espidf"))]
            start: std::time::Instant::now(),
        }
    }
}

impl Clock for Esp32TimeAdapter {
    #[cfg(target_os = "espidf")]
    fn now_ms(&self) -> u32 {
        ((unsafe { esp_idf_svc::sys::esp_timer_get_time() }) / 1_000) as u32
    }

    #[cfg(not(target_os = "espidf"))]
    fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }
}

// ---------------------------------------------------------------------------
// Deterministic clock for host tests
// ---------------------------------------------------------------------------

/// Hand-advanced clock; clones share the same underlying time.
#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: std::rc::Rc<core::cell::Cell<u32>>,
}

#[cfg(not(target_os = "espidf"))]
impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ms: u32) {
        self.now.set(ms);
    }

    pub fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }
}

#[cfg(not(target_os = "espidf"))]
impl Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.now.get()
    }
}

/// Delay provider that advances a [`ManualClock`] instead of sleeping, so
/// delay-polling code paths run instantly under test.
#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Clone)]
pub struct ManualDelay {
    clock: ManualClock,
}

#[cfg(not(target_os = "espidf"))]
impl ManualDelay {
    pub fn new(clock: ManualClock) -> Self {
        Self { clock }
    }
}

#[cfg(not(target_os = "espidf"))]
impl embedded_hal::delay::DelayNs for ManualDelay {
    fn delay_ns(&mut self, ns: u32) {
        // Round up so sub-millisecond delays still move time forward.
        self.clock.advance(ns.div_ceil(1_000_000));
    }
}

/// Real sleeping delay for the host simulation binary.
#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct StdDelay;

#[cfg(not(target_os = "espidf"))]
impl embedded_hal::delay::DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(std::time::Duration::from_nanos(u64::from(ns)));
    }
}
