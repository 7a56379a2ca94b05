//! Application-level orchestration.
//!
//! This module owns run lifecycle control (start, cancel, single-flight) and the loop
//! that maps UI commands onto it. UI/CLI layers only consume the event stream and call
//! into the controller.

mod controller;

pub use controller::{Controller, ControllerSettings, Job};
pub(crate) use controller::{run_controller, UiCommand};
