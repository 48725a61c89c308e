//! Command codes and the name-to-command registry of the DHM server.
//!
//! The numeric codes are generated once on the server side and are a hard
//! contract between client and server. [`CommandTable::dhm`] registers every
//! property and function of protocol command version 6.

use super::codec::{TypeSpec, TypeTag};
use crate::error::{DhmError, DhmResult};
use std::collections::HashMap;

/// Command version implemented by this table.
pub const COMMAND_VERSION: i32 = 6;
/// Oldest server protocol version the client talks to.
pub const MIN_SERVER_VERSION: i32 = 3;
/// Default TCP port of the DHM server.
pub const DEFAULT_PORT: u16 = 27182;

/// Raw command codes, named after the remote property or function.
#[allow(missing_docs)]
pub mod codes {
    pub const QUIT: i32 = 0x1e769ffe;
    pub const ERROR: i32 = 0x4bdca849;

    pub const GET_VERSION: i32 = 0x3961955f;
    pub const GET_CMD_VERSION: i32 = 0x6aaeafb6;
    pub const GET_DHM_STATUS: i32 = 0x45aa4da5;
    pub const GET_CONFIG_LIST: i32 = 0x10b2b1b4;
    pub const GET_CONFIG: i32 = 0x2f5bb0d2;
    pub const SET_CONFIG: i32 = 0x753eadfa;
    pub const GET_DHM_SERIAL: i32 = 0x4d4e407e;

    pub const GET_OBJECTIVE_NAME: i32 = 0x3caec94f;
    pub const GET_OBJECTIVE_DESCRIPTION: i32 = 0x50189a53;
    pub const GET_OBJECTIVE_MAGNIFICATION: i32 = 0x4a5a5c7e;
    pub const GET_OBJECTIVE_NUMERICAL_APERTURE: i32 = 0x08643fec;
    pub const GET_OBJECTIVE_PIXEL_SIZE_X_UM: i32 = 0x4d85491e;
    pub const GET_OBJECTIVE_PIXEL_SIZE_Y_UM: i32 = 0x01b07d12;

    pub const GET_CAMERA_SERIAL: i32 = 0x7455294f;
    pub const GET_CAMERA_NAME: i32 = 0x6b332fd4;
    pub const GET_CAMERA_MAX_WIDTH: i32 = 0x3c10ce2c;
    pub const GET_CAMERA_MAX_HEIGHT: i32 = 0x21338322;
    pub const GET_CAMERA_WIDTH: i32 = 0x46811c76;
    pub const GET_CAMERA_HEIGHT: i32 = 0x1dff8e99;
    pub const GET_CAMERA_OFFSET_X: i32 = 0x188c1213;
    pub const GET_CAMERA_OFFSET_Y: i32 = 0x7f724a3b;
    pub const GET_CAMERA_BIT_PER_PIXEL: i32 = 0x5bcc81c3;
    pub const SET_CAMERA_BIT_PER_PIXEL: i32 = 0x03af8c0f;
    pub const GET_CAMERA_STRIDE: i32 = 0x3c32983a;
    pub const GET_CAMERA_PIXEL_SIZE_UM: i32 = 0x453fa1da;

    pub const MIN_CAMERA_SHUTTER: i32 = 0x6b122b3a;
    pub const MAX_CAMERA_SHUTTER: i32 = 0x465b506b;
    pub const GET_CAMERA_SHUTTER: i32 = 0x3cfa2458;
    pub const SET_CAMERA_SHUTTER: i32 = 0x32d64e41;
    pub const MIN_CAMERA_SHUTTER_US: i32 = 0x51cdfc15;
    pub const MAX_CAMERA_SHUTTER_US: i32 = 0x6e36f8f0;
    pub const GET_CAMERA_SHUTTER_US: i32 = 0x13486622;
    pub const SET_CAMERA_SHUTTER_US: i32 = 0x1db09ec3;
    pub const MIN_CAMERA_GAIN: i32 = 0x51441d3f;
    pub const MAX_CAMERA_GAIN: i32 = 0x13695ca2;
    pub const GET_CAMERA_GAIN: i32 = 0x6f1d1bc2;
    pub const SET_CAMERA_GAIN: i32 = 0x7682c6da;
    pub const MIN_CAMERA_BRIGHTNESS: i32 = 0x42f89a18;
    pub const MAX_CAMERA_BRIGHTNESS: i32 = 0x31ea7248;
    pub const GET_CAMERA_BRIGHTNESS: i32 = 0x5ee2574c;
    pub const SET_CAMERA_BRIGHTNESS: i32 = 0x01f15409;

    pub const GET_CAMERA_IMAGE: i32 = 0x55f1cfac;
    pub const GET_OPT_CAMERA_IMAGE: i32 = 0x3d4e070b;
    pub const START_CAMERA_GRAB_TIME: i32 = 0x4955ed50;

    pub const GET_LASER_WAVELENGTH: i32 = 0x637d6d1f;
    pub const SET_LASER_OUTPUT: i32 = 0x08332ea8;

    pub const MIN_MOTOR_CODER_POS: i32 = 0x14683792;
    pub const MAX_MOTOR_CODER_POS: i32 = 0x610eb049;
    pub const GET_MOTOR_CODER_POS: i32 = 0x7a904391;
    pub const MIN_MOTOR_POS: i32 = 0x4baa26b5;
    pub const MAX_MOTOR_POS: i32 = 0x057b1c69;
    pub const GET_MOTOR_POS: i32 = 0x2690f04f;
    pub const SET_MOTOR_POS: i32 = 0x63da8bec;
    pub const UNIT_MOTOR_POS: i32 = 0x03f93167;
}

/// Human readable name of a server result code.
pub fn result_reason(result: i32) -> &'static str {
    match result {
        2 => "quit",
        1 => "unknown",
        0 => "success",
        -1 => "no hardware",
        -2 => "not initialized",
        -3 => "unknown configuration",
        -4 => "wrong integer size",
        -5 => "wrong float size",
        -6 => "shutter underflow",
        -7 => "shutter overflow",
        -8 => "shutter (us) underflow",
        -9 => "shutter (us) overflow",
        -10 => "gain underflow",
        -11 => "gain overflow",
        -12 => "brightness underflow",
        -13 => "brightness overflow",
        -14 => "position underflow",
        -15 => "position overflow",
        -16 => "bit depth underflow",
        -17 => "unknown command",
        _ => "unrecognized result",
    }
}

/// A named instrument value with optional read and write commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteProperty {
    /// Name used with `get` and `set`
    pub name: String,
    /// Code of the getter, `None` for write-only properties
    pub read: Option<i32>,
    /// Code of the setter, `None` for read-only properties
    pub write: Option<i32>,
    /// Wire type of the value in both directions
    pub tag: TypeTag,
}

impl RemoteProperty {
    /// Getter code, or `NotReadable`.
    pub fn read_code(&self) -> DhmResult<i32> {
        self.read
            .ok_or_else(|| DhmError::NotReadable(self.name.clone()))
    }

    /// Setter code, or `NotWritable`.
    pub fn write_code(&self) -> DhmResult<i32> {
        self.write
            .ok_or_else(|| DhmError::NotWritable(self.name.clone()))
    }
}

/// A remote procedure with positional arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFunction {
    /// Name used with `call`
    pub name: String,
    /// Command code of the request
    pub code: i32,
    /// Layout of the response payload
    pub output: TypeSpec,
    /// Layout of the positional arguments
    pub inputs: TypeSpec,
}

/// Entry of a [`CommandTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Accessed with `get` and `set`
    Property(RemoteProperty),
    /// Invoked with `call`
    Function(RemoteFunction),
}

/// Registry mapping names to remote properties and functions.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    commands: HashMap<String, Command>,
}

impl CommandTable {
    /// An empty table, for custom servers and tests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`register_property`](Self::register_property).
    pub fn with_property(
        mut self,
        name: &str,
        read: Option<i32>,
        write: Option<i32>,
        tag: TypeTag,
    ) -> Self {
        self.register_property(name, read, write, tag);
        self
    }

    /// Adds or replaces a property.
    pub fn register_property(
        &mut self,
        name: &str,
        read: Option<i32>,
        write: Option<i32>,
        tag: TypeTag,
    ) {
        self.commands.insert(
            name.to_string(),
            Command::Property(RemoteProperty {
                name: name.to_string(),
                read,
                write,
                tag,
            }),
        );
    }

    /// Adds or replaces a function.
    pub fn register_function(&mut self, name: &str, code: i32, output: TypeSpec, inputs: TypeSpec) {
        self.commands.insert(
            name.to_string(),
            Command::Function(RemoteFunction {
                name: name.to_string(),
                code,
                output,
                inputs,
            }),
        );
    }

    /// Property or function registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    /// Property registered under `name`, or `UnknownCommand`.
    pub fn property(&self, name: &str) -> DhmResult<&RemoteProperty> {
        match self.commands.get(name) {
            Some(Command::Property(p)) => Ok(p),
            _ => Err(DhmError::UnknownCommand(name.to_string())),
        }
    }

    /// Function registered under `name`, or `UnknownCommand`.
    pub fn function(&self, name: &str) -> DhmResult<&RemoteFunction> {
        match self.commands.get(name) {
            Some(Command::Function(f)) => Ok(f),
            _ => Err(DhmError::UnknownCommand(name.to_string())),
        }
    }

    /// Registered names in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// The complete command set of the DHM server.
    pub fn dhm() -> Self {
        use codes::*;
        use TypeTag::{ConfigList, Float32, Float64, Image, Int32, Str};

        let read_only: &[(&str, i32, TypeTag)] = &[
            ("ServerVersion", GET_VERSION, Int32),
            ("CmdVersion", GET_CMD_VERSION, Int32),
            ("Status", GET_DHM_STATUS, Int32),
            ("ConfigList", GET_CONFIG_LIST, ConfigList),
            ("DhmSerial", GET_DHM_SERIAL, Str),
            ("ObjectiveName", GET_OBJECTIVE_NAME, Str),
            ("ObjectiveDescription", GET_OBJECTIVE_DESCRIPTION, Str),
            ("ObjectiveMagnification", GET_OBJECTIVE_MAGNIFICATION, Float64),
            ("ObjectiveNumericalAperture", GET_OBJECTIVE_NUMERICAL_APERTURE, Float64),
            ("ObjectivePixelSizeXUm", GET_OBJECTIVE_PIXEL_SIZE_X_UM, Float64),
            ("ObjectivePixelSizeYUm", GET_OBJECTIVE_PIXEL_SIZE_Y_UM, Float64),
            ("CameraSerial", GET_CAMERA_SERIAL, Str),
            ("CameraName", GET_CAMERA_NAME, Str),
            ("CameraMaxWidth", GET_CAMERA_MAX_WIDTH, Int32),
            ("CameraMaxHeight", GET_CAMERA_MAX_HEIGHT, Int32),
            ("CameraWidth", GET_CAMERA_WIDTH, Int32),
            ("CameraHeight", GET_CAMERA_HEIGHT, Int32),
            ("CameraOffsetX", GET_CAMERA_OFFSET_X, Int32),
            ("CameraOffsetY", GET_CAMERA_OFFSET_Y, Int32),
            ("CameraStride", GET_CAMERA_STRIDE, Int32),
            ("CameraPixelSizeUm", GET_CAMERA_PIXEL_SIZE_UM, Float32),
            ("CameraMinShutter", MIN_CAMERA_SHUTTER, Int32),
            ("CameraMaxShutter", MAX_CAMERA_SHUTTER, Int32),
            ("CameraMinShutterUs", MIN_CAMERA_SHUTTER_US, Float32),
            ("CameraMaxShutterUs", MAX_CAMERA_SHUTTER_US, Float32),
            ("CameraMinGain", MIN_CAMERA_GAIN, Int32),
            ("CameraMaxGain", MAX_CAMERA_GAIN, Int32),
            ("CameraMinBrightness", MIN_CAMERA_BRIGHTNESS, Int32),
            ("CameraMaxBrightness", MAX_CAMERA_BRIGHTNESS, Int32),
            ("CameraImage", GET_CAMERA_IMAGE, Image),
            ("LaserWavelength", GET_LASER_WAVELENGTH, Float64),
            ("MotorMinCoderPos", MIN_MOTOR_CODER_POS, Int32),
            ("MotorMaxCoderPos", MAX_MOTOR_CODER_POS, Int32),
            ("MotorCoderPos", GET_MOTOR_CODER_POS, Int32),
            ("MotorMinPos", MIN_MOTOR_POS, Float32),
            ("MotorMaxPos", MAX_MOTOR_POS, Float32),
            ("MotorUnitPos", UNIT_MOTOR_POS, Str),
        ];
        let read_write: &[(&str, i32, i32, TypeTag)] = &[
            ("Config", GET_CONFIG, SET_CONFIG, Int32),
            ("CameraBitPerPixel", GET_CAMERA_BIT_PER_PIXEL, SET_CAMERA_BIT_PER_PIXEL, Int32),
            ("CameraShutter", GET_CAMERA_SHUTTER, SET_CAMERA_SHUTTER, Int32),
            ("CameraShutterUs", GET_CAMERA_SHUTTER_US, SET_CAMERA_SHUTTER_US, Float32),
            ("CameraGain", GET_CAMERA_GAIN, SET_CAMERA_GAIN, Int32),
            ("CameraBrightness", GET_CAMERA_BRIGHTNESS, SET_CAMERA_BRIGHTNESS, Int32),
            ("MotorPos", GET_MOTOR_POS, SET_MOTOR_POS, Float32),
        ];

        let mut table = Self::new();
        for &(name, read, tag) in read_only {
            table.register_property(name, Some(read), None, tag);
        }
        for &(name, read, write, tag) in read_write {
            table.register_property(name, Some(read), Some(write), tag);
        }
        table.register_property("LaserOutput", None, Some(SET_LASER_OUTPUT), Int32);

        table.register_function(
            "OptCameraImage",
            GET_OPT_CAMERA_IMAGE,
            Image.into(),
            Int32.into(),
        );
        table.register_function(
            "StartCameraGrabTime",
            START_CAMERA_GRAB_TIME,
            Image.into(),
            Int32.into(),
        );
        table
    }
}
