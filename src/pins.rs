//! GPIO / peripheral pin assignments for the Suntrack controller board.
//!
//! Single source of truth — every adapter references this module rather than
//! hard-coding pin numbers.  Change a pin here and it propagates everywhere.

// ---------------------------------------------------------------------------
// Solar input voltage sense (resistive divider into ADC1)
// ---------------------------------------------------------------------------

/// Panel-side voltage divider — ADC1 channel 0 (GPIO 36 on ESP32).
/// Used only when the PSU cannot report its own input voltage.
pub const INPUT_VOLT_ADC_GPIO: i32 = 36;
/// ADC1 channel number matching [`INPUT_VOLT_ADC_GPIO`].
pub const INPUT_VOLT_ADC_CHANNEL: u32 = 0;

// ---------------------------------------------------------------------------
// Low-voltage protection relay
// ---------------------------------------------------------------------------

/// Default digital output driving the battery-protect relay.
/// Overridable through the low-voltage-protect configuration string.
pub const LV_PROTECT_GPIO: u8 = 22;
