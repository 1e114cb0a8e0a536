//! Board I/O adapter: panel-voltage ADC and the protect relay GPIO.
//!
//! ## Dual-target design
//!
//! On ESP-IDF: reads ADC1 via the oneshot API (raw sys calls, initialised
//! once by [`HardwareIo::init`]) and drives the relay pin directly.
//! On host: [`SimIo`] holds a settable raw reading and records every relay
//! drive for assertions.

use crate::app::ports::{InputSense, ProtectRelay};
#[cfg(target_os = "espidf")]
use crate::pins;

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

#[cfg(target_os = "espidf")]
use log::{info, warn};

/// Real board I/O for the device build.
#[cfg(target_os = "espidf")]
pub struct HardwareIo {
    adc1: adc_oneshot_unit_handle_t,
}

#[cfg(target_os = "espidf")]
impl HardwareIo {
    /// Configure ADC1 for the panel divider. Call once from `main()`
    /// before the tick loop starts.
    pub fn init() -> anyhow::Result<Self> {
        let init_cfg = adc_oneshot_unit_init_cfg_t {
            unit_id: adc_unit_t_ADC_UNIT_1,
            ulp_mode: adc_ulp_mode_t_ADC_ULP_MODE_DISABLE,
            ..Default::default()
        };
        let mut handle: adc_oneshot_unit_handle_t = core::ptr::null_mut();
        // SAFETY: called once from the single main-task context before the
        // tick loop; the handle is owned by this adapter afterwards.
        let ret = unsafe { adc_oneshot_new_unit(&init_cfg, &mut handle) };
        if ret != ESP_OK {
            anyhow::bail!("ADC1 init failed (rc={ret})");
        }

        let chan_cfg = adc_oneshot_chan_cfg_t {
            atten: adc_atten_t_ADC_ATTEN_DB_12,
            bitwidth: adc_bitwidth_t_ADC_BITWIDTH_12,
        };
        let ret = unsafe {
            adc_oneshot_config_channel(handle, pins::INPUT_VOLT_ADC_CHANNEL, &chan_cfg)
        };
        if ret != ESP_OK {
            anyhow::bail!("ADC1 channel config failed (rc={ret})");
        }

        info!(
            "hardware: ADC1 ch{} configured for panel voltage (gpio {})",
            pins::INPUT_VOLT_ADC_CHANNEL,
            pins::INPUT_VOLT_ADC_GPIO
        );
        Ok(Self { adc1: handle })
    }
}

#[cfg(target_os = "espidf")]
impl InputSense for HardwareIo {
    fn read_input_raw(&mut self) -> u16 {
        let mut raw: i32 = 0;
        // SAFETY: the handle was configured in init(); main-loop access only.
        let ret = unsafe { adc_oneshot_read(self.adc1, pins::INPUT_VOLT_ADC_CHANNEL, &mut raw) };
        if ret != ESP_OK {
            warn!("adc read failed (rc={ret})");
            return 0;
        }
        raw.max(0) as u16
    }
}

#[cfg(target_os = "espidf")]
impl ProtectRelay for HardwareIo {
    fn drive(&mut self, pin: u8, invert: bool, tripped: bool) {
        let cfg = gpio_config_t {
            pin_bit_mask: 1u64 << pin,
            mode: gpio_mode_t_GPIO_MODE_OUTPUT,
            pull_up_en: gpio_pullup_t_GPIO_PULLUP_DISABLE,
            pull_down_en: gpio_pulldown_t_GPIO_PULLDOWN_DISABLE,
            intr_type: gpio_int_type_t_GPIO_INTR_DISABLE,
        };
        // Relay idles high; tripping pulls the line low unless inverted.
        let level = u32::from(!(tripped ^ invert));
        // SAFETY: reconfiguring and writing a plain output pin from the
        // single main-task context.
        unsafe {
            gpio_config(&cfg);
            gpio_set_level(i32::from(pin), level);
        }
    }
}

// ---------------------------------------------------------------------------
// Host simulation
// ---------------------------------------------------------------------------

/// Simulated board I/O: tests set the raw ADC value and inspect relay
/// drives afterwards.
#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Default)]
pub struct SimIo {
    /// Raw 12-bit value the next ADC read returns.
    pub raw_input: u16,
    /// Every relay drive issued, as `(pin, invert, tripped)`.
    pub relay_drives: Vec<(u8, bool, bool)>,
}

#[cfg(not(target_os = "espidf"))]
impl InputSense for SimIo {
    fn read_input_raw(&mut self) -> u16 {
        self.raw_input
    }
}

#[cfg(not(target_os = "espidf"))]
impl ProtectRelay for SimIo {
    fn drive(&mut self, pin: u8, invert: bool, tripped: bool) {
        self.relay_drives.push((pin, invert, tripped));
    }
}
