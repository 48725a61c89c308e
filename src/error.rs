//! Custom error types for the application.
//!
//! This module defines the primary error type, `DhmError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures that occur while talking to the microscope and
//! while evaluating its holograms.
//!
//! ## Error Hierarchy
//!
//! `DhmError` is an enum that consolidates various error sources:
//!
//! - **`Protocol`**: Wraps [`ProtocolError`], every framing, version or transport
//!   problem on the TCP connection. These are always fatal to the current connection;
//!   the client closes the socket and the caller has to reconnect.
//! - **`NotReadable` / `NotWritable` / `ArityError` / `UnknownCommand`**: Misuse of the
//!   command table. These are programming errors and are raised before anything is sent.
//! - **`SearchExhausted`**: The exposure search did not converge within its frame budget.
//! - **`InvalidShutterRange`**: The camera reported a minimum shutter above its maximum.
//! - **`InterferenceNotFound` / `RangeTooSmall` / `NoContrastPeak`**: Failures of the
//!   optical path length scan. The caller may retry with different parameters.
//! - **`InvalidFrame` / `NoDetectableOrder` / `RadiusIncludesZeroOrder`**: Problems with a
//!   hologram handed to the reconstruction pipeline. They never affect the connection.
//! - **`Configuration`**: Semantic errors in the configuration that pass parsing but are
//!   logically incorrect.
//!
//! Every variant carries the counts, bounds or positions needed to diagnose the problem
//! without re-running the measurement.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DhmResult<T> = std::result::Result<T, DhmError>;

/// Failures on the wire. Any of these leaves the connection in an unknown state.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Response command 0x{received:08x} does not match request 0x{expected:08x}")]
    CommandMismatch { expected: i32, received: i32 },

    #[error("Server rejected command 0x{command:08x} with result {result} ({reason})")]
    ServerRejected {
        command: i32,
        result: i32,
        reason: &'static str,
    },

    #[error("Unknown type tag '{0}'")]
    UnknownTypeTag(char),

    #[error("Declared {what} length {length} outside of [0, {max}]")]
    LengthOutOfBounds {
        what: &'static str,
        length: i64,
        max: usize,
    },

    #[error("Image stride {stride} does not give a 1 or 2 byte pixel depth for width {width}")]
    InvalidPixelDepth { width: usize, stride: usize },

    #[error("Expected {expected} values for the frame layout, got {got}")]
    ValueCount { expected: usize, got: usize },

    #[error("Argument {index} does not match type tag '{expected}'")]
    ArgumentType { index: usize, expected: char },

    #[error("Connection closed by the server")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("No response within {0} ms")]
    Timeout(u64),

    #[error("I/O error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => ProtocolError::ConnectionClosed,
            _ => ProtocolError::Io(err),
        }
    }
}

#[derive(Error, Debug)]
pub enum DhmError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Server protocol version {version} is older than the minimum {minimum}")]
    IncompatibleServer { version: i32, minimum: i32 },

    #[error("Unknown remote property or function '{0}'")]
    UnknownCommand(String),

    #[error("Remote property '{0}' is not readable")]
    NotReadable(String),

    #[error("Remote property '{0}' is not writable")]
    NotWritable(String),

    #[error("Remote function '{name}' expects {expected} arguments, got {got}")]
    ArityError {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("Remote property '{name}' returned {found} instead of {expected}")]
    UnexpectedValue {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Camera reports an empty shutter range [{min}, {max}]")]
    InvalidShutterRange { min: i32, max: i32 },

    #[error("Exposure search gave up after {frames} frames (lower bound {lower:?}, upper bound {upper:?})")]
    SearchExhausted {
        frames: usize,
        lower: Option<i32>,
        upper: Option<i32>,
    },

    #[error("{mode} OPL scan detected no interference (best contrast {best:.4})")]
    InterferenceNotFound { mode: &'static str, best: f64 },

    #[error("OPL scan range [{start}, {end}] does not fit into motor travel [{min}, {max}]")]
    RangeTooSmall {
        start: f64,
        end: f64,
        min: f64,
        max: f64,
    },

    #[error("No contrast maximum at the center of {positions:?} (contrast {contrast:?})")]
    NoContrastPeak {
        positions: [f64; 3],
        contrast: [f64; 3],
    },

    #[error("Invalid hologram frame: {0}")]
    InvalidFrame(String),

    #[error("No first diffraction order detectable in the spectrum")]
    NoDetectableOrder,

    #[error("Spectral radius {radius} reaches the zero order at distance {distance:.2}")]
    RadiusIncludesZeroOrder { radius: f64, distance: f64 },

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] figment::Error),

    #[error("Stage controller error: {0}")]
    Stage(String),
}

impl DhmError {
    /// True for errors after which the instrument connection must be re-established.
    ///
    /// Argument marshaling errors are raised before anything is sent and leave
    /// the connection usable.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            DhmError::Protocol(
                ProtocolError::ArgumentType { .. } | ProtocolError::ValueCount { .. },
            ) => false,
            DhmError::Protocol(_) | DhmError::IncompatibleServer { .. } => true,
            _ => false,
        }
    }
}
