//! Instrument access.
//!
//! - [`capabilities`]: traits the measurement procedures are written against
//! - [`dhm`]: TCP client for the DHM server
//! - [`mock`]: simulated microscope and a loopback server speaking the same protocol

pub mod capabilities;
pub mod dhm;
pub mod mock;

pub use capabilities::{HoloCamera, Microscope, OplMotor, StageController};
pub use dhm::DhmClient;
pub use mock::{MockDhmServer, SimulatedDhm};
