//! Application layer: the hexagonal core.
//!
//! [`ports`] defines the capability traits the core depends on,
//! [`service`] implements the control loop against them, and
//! [`commands`]/[`events`] are the inbound and outbound message types.

pub mod commands;
pub mod events;
pub mod ports;
pub mod service;
