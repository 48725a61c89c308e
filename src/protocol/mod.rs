//! Wire protocol of the DHM remote-control server.
//!
//! - [`codec`]: little-endian frame encoding and incremental decoding.
//! - [`commands`]: command codes, server result codes and the name registry.

pub mod codec;
pub mod commands;

pub use codec::{ConfigItem, ImagePayload, PixelDepth, TypeSpec, TypeTag, Value};
pub use commands::{
    codes, CommandTable, RemoteFunction, RemoteProperty, COMMAND_VERSION, DEFAULT_PORT,
    MIN_SERVER_VERSION,
};
