//! Suntrack firmware library.
//!
//! Exposes the pure-logic modules for integration testing and external
//! inspection. All ESP-IDF-specific code is guarded by
//! `#[cfg(target_os = "espidf")]` within each module.

#![deny(unused_must_use)]

pub mod app;
pub mod config;
pub mod control;
pub mod lvprotect;
pub mod psu;
pub mod publish;

pub mod error;
mod pins;

// Hardware/OS adapters; each holds a device implementation and a host
// counterpart behind cfg guards.
pub mod adapters;
