//! Remote control and hologram evaluation for a digital holographic microscope.
//!
//! The microscope is driven through a DHM server speaking a little-endian
//! binary request/response protocol over TCP ([`protocol`], [`instrument::dhm`]).
//! On top of that connection the crate runs the closed-loop procedures needed
//! to record usable holograms ([`procedures`]) and evaluates reference
//! holograms in the Fourier domain ([`data::hologram`]). [`session::HoloClient`]
//! ties everything together.

pub mod config;
pub mod data;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod metadata;
pub mod procedures;
pub mod protocol;
pub mod session;
