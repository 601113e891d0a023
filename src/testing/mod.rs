//! Testing utilities and mock implementations
//!
//! This module provides doubles for testing the device agent without an MQTT
//! broker or a real clock.

pub mod mocks;

pub use mocks::*;
