//! Adapters — concrete implementations of the port traits.
//!
//! | Adapter    | Implements            | Connects to                  |
//! |------------|-----------------------|------------------------------|
//! | `hardware` | InputSense            | ESP32 ADC1 (panel divider)   |
//! |            | ProtectRelay          | ESP32 GPIO                   |
//! | `log_sink` | EventSink             | Serial log output            |
//! | `nvs`      | ConfigPort            | NVS / in-memory store        |
//! | `time`     | Clock                 | ESP32 system timer           |

pub mod hardware;
pub mod log_sink;
pub mod nvs;
pub mod time;
