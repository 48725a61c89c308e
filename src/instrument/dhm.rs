//! TCP client for the DHM remote-control server
//!
//! The server exposes the microscope as a set of named remote properties and
//! remote functions (see [`CommandTable`]). Every access is one request frame
//! answered by exactly one response frame that echoes the command code.
//!
//! ## Lifecycle
//!
//! [`DhmClient::connect`] opens the socket and immediately queries the server
//! version; servers older than [`MIN_SERVER_VERSION`] are rejected. The session
//! ends with [`DhmClient::close`], which sends the `Quit` command before closing
//! the socket. If the client is dropped without `close` (early return, `?`,
//! cancelled future), `Drop` still pushes the `Quit` frame onto the socket when
//! the kernel buffer accepts it without blocking.
//!
//! Any protocol error drops the connection. The client does not reconnect; a new
//! client has to be created.
//!
//! ## Example
//!
//! ```no_run
//! use dhm_daq::config::ServerConfig;
//! use dhm_daq::instrument::DhmClient;
//!
//! # async fn run() -> dhm_daq::error::DhmResult<()> {
//! let mut client = DhmClient::connect(&ServerConfig::default()).await?;
//! let shutter = client.get_i32("CameraShutter").await?;
//! client.set("CameraShutter", shutter / 2).await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

use super::capabilities::{HoloCamera, OplMotor};
use crate::config::ServerConfig;
use crate::error::{DhmError, DhmResult, ProtocolError};
use crate::metadata::{
    CameraInfo, DhmInfo, DhmParameters, LaserInfo, MotorInfo, ObjectiveInfo, ServerInfo,
    DHM_MANUFACTURER,
};
use crate::protocol::codec::{self, TypeSpec, TypeTag, Value};
use crate::protocol::commands::result_reason;
use crate::protocol::{codes, CommandTable, ConfigItem, ImagePayload, MIN_SERVER_VERSION};
use async_trait::async_trait;
use ndarray::Array2;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

/// Connection to a DHM server.
#[derive(Debug)]
pub struct DhmClient {
    stream: Option<TcpStream>,
    table: CommandTable,
    peer: String,
    request_timeout: Duration,
    server_version: i32,
}

impl DhmClient {
    /// Connects with the full DHM command table.
    pub async fn connect(config: &ServerConfig) -> DhmResult<Self> {
        Self::connect_with_table(config, CommandTable::dhm()).await
    }

    /// Connects with a caller-provided command table.
    ///
    /// The version handshake uses the fixed `GetVersion` code and does not
    /// depend on the table.
    #[instrument(skip(config, table), fields(host = %config.host, port = config.port))]
    pub async fn connect_with_table(config: &ServerConfig, table: CommandTable) -> DhmResult<Self> {
        let peer = format!("{}:{}", config.host, config.port);
        let stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(&peer))
            .await
            .map_err(|_| ProtocolError::Timeout(config.connect_timeout_ms))?
            .map_err(ProtocolError::from)?;
        stream.set_nodelay(true).map_err(ProtocolError::from)?;

        let mut client = Self {
            stream: Some(stream),
            table,
            peer,
            request_timeout: config.request_timeout(),
            server_version: 0,
        };

        let version = client
            .exchange(codes::GET_VERSION, &[], &TypeSpec::empty(), &TypeTag::Int32.into())
            .await?;
        let version = match version.first() {
            Some(Value::Int32(v)) => *v,
            _ => {
                return Err(DhmError::UnexpectedValue {
                    name: "ServerVersion".to_string(),
                    expected: TypeTag::Int32.name(),
                    found: version.first().map_or("nothing", |v| v.tag().name()),
                })
            }
        };
        if version < MIN_SERVER_VERSION {
            client.shutdown().await;
            return Err(DhmError::IncompatibleServer {
                version,
                minimum: MIN_SERVER_VERSION,
            });
        }
        client.server_version = version;
        info!(peer = %client.peer, version, "Connected to DHM server");
        Ok(client)
    }

    pub fn server_version(&self) -> i32 {
        self.server_version
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn table(&self) -> &CommandTable {
        &self.table
    }

    /// Reads a remote property.
    pub async fn get(&mut self, name: &str) -> DhmResult<Value> {
        let property = self.table.property(name)?;
        let code = property.read_code()?;
        let output = TypeSpec::from(property.tag);
        let mut values = self.exchange(code, &[], &TypeSpec::empty(), &output).await?;
        values
            .pop()
            .ok_or_else(|| DhmError::UnexpectedValue {
                name: name.to_string(),
                expected: output.tags()[0].name(),
                found: "nothing",
            })
    }

    /// Writes a remote property. Numeric values are converted to the wire type.
    pub async fn set(&mut self, name: &str, value: impl Into<Value>) -> DhmResult<()> {
        let property = self.table.property(name)?;
        let code = property.write_code()?;
        let input = TypeSpec::from(property.tag);
        let value = coerce(value.into(), property.tag, 0)?;
        self.exchange(code, &[value], &input, &TypeSpec::empty())
            .await?;
        debug!(property = name, "Property written");
        Ok(())
    }

    /// Invokes a remote function with positional arguments.
    pub async fn call(&mut self, name: &str, args: Vec<Value>) -> DhmResult<Vec<Value>> {
        let function = self.table.function(name)?;
        if args.len() != function.inputs.len() {
            return Err(DhmError::ArityError {
                name: name.to_string(),
                expected: function.inputs.len(),
                got: args.len(),
            });
        }
        let args = args
            .into_iter()
            .zip(function.inputs.tags())
            .enumerate()
            .map(|(index, (arg, tag))| coerce(arg, *tag, index))
            .collect::<Result<Vec<_>, _>>()?;
        let (code, inputs, output) = (function.code, function.inputs.clone(), function.output.clone());
        self.exchange(code, &args, &inputs, &output).await
    }

    pub async fn get_i32(&mut self, name: &str) -> DhmResult<i32> {
        match self.get(name).await? {
            Value::Int32(v) => Ok(v),
            other => Err(unexpected(name, TypeTag::Int32, &other)),
        }
    }

    pub async fn get_f32(&mut self, name: &str) -> DhmResult<f32> {
        match self.get(name).await? {
            Value::Float32(v) => Ok(v),
            other => Err(unexpected(name, TypeTag::Float32, &other)),
        }
    }

    pub async fn get_f64(&mut self, name: &str) -> DhmResult<f64> {
        match self.get(name).await? {
            Value::Float64(v) => Ok(v),
            other => Err(unexpected(name, TypeTag::Float64, &other)),
        }
    }

    /// Reads any scalar property as `f64`.
    pub async fn get_number(&mut self, name: &str) -> DhmResult<f64> {
        let value = self.get(name).await?;
        value
            .as_f64()
            .ok_or_else(|| unexpected(name, TypeTag::Float64, &value))
    }

    pub async fn get_string(&mut self, name: &str) -> DhmResult<String> {
        match self.get(name).await? {
            Value::Str(v) => Ok(v),
            other => Err(unexpected(name, TypeTag::Str, &other)),
        }
    }

    pub async fn get_config_list(&mut self, name: &str) -> DhmResult<Vec<ConfigItem>> {
        match self.get(name).await? {
            Value::ConfigList(v) => Ok(v),
            other => Err(unexpected(name, TypeTag::ConfigList, &other)),
        }
    }

    pub async fn get_image(&mut self, name: &str) -> DhmResult<ImagePayload> {
        match self.get(name).await? {
            Value::Image(v) => Ok(v),
            other => Err(unexpected(name, TypeTag::Image, &other)),
        }
    }

    /// Collects the complete instrument state into a serializable snapshot.
    pub async fn parameters(&mut self) -> DhmResult<DhmParameters> {
        let server = ServerInfo {
            version: self.get_i32("ServerVersion").await?,
            command_version: self.get_i32("CmdVersion").await?,
        };

        let config_id = self.get_i32("Config").await?;
        let config_name = self
            .get_config_list("ConfigList")
            .await?
            .into_iter()
            .find(|item| item.id == config_id)
            .map(|item| item.name);
        let dhm = DhmInfo {
            serial: self.get_string("DhmSerial").await?,
            config_id,
            config_name,
            manufacturer: DHM_MANUFACTURER.to_string(),
        };

        let objective = ObjectiveInfo {
            name: self.get_string("ObjectiveName").await?,
            description: self.get_string("ObjectiveDescription").await?,
            magnification: self.get_f64("ObjectiveMagnification").await?,
            numerical_aperture: self.get_f64("ObjectiveNumericalAperture").await?,
            x_pixel_size_um: self.get_f64("ObjectivePixelSizeXUm").await?,
            y_pixel_size_um: self.get_f64("ObjectivePixelSizeYUm").await?,
        };

        let name = self.get_string("CameraName").await?;
        let camera = CameraInfo {
            serial: self.get_string("CameraSerial").await?,
            manufacturer: CameraInfo::detect_manufacturer(&name),
            name,
            max_width: self.get_i32("CameraMaxWidth").await?,
            max_height: self.get_i32("CameraMaxHeight").await?,
            width: self.get_i32("CameraWidth").await?,
            height: self.get_i32("CameraHeight").await?,
            x_offset: self.get_i32("CameraOffsetX").await?,
            y_offset: self.get_i32("CameraOffsetY").await?,
            bit_per_pixel: self.get_i32("CameraBitPerPixel").await?,
            stride: self.get_i32("CameraStride").await?,
            pixel_size_um: self.get_f32("CameraPixelSizeUm").await?,
            min_shutter: self.get_i32("CameraMinShutter").await?,
            max_shutter: self.get_i32("CameraMaxShutter").await?,
            shutter: self.get_i32("CameraShutter").await?,
            min_shutter_us: self.get_f32("CameraMinShutterUs").await?,
            max_shutter_us: self.get_f32("CameraMaxShutterUs").await?,
            shutter_us: self.get_f32("CameraShutterUs").await?,
            min_gain: self.get_i32("CameraMinGain").await?,
            max_gain: self.get_i32("CameraMaxGain").await?,
            gain: self.get_i32("CameraGain").await?,
            min_brightness: self.get_i32("CameraMinBrightness").await?,
            max_brightness: self.get_i32("CameraMaxBrightness").await?,
            brightness: self.get_i32("CameraBrightness").await?,
        };

        // The server reports the wavelength in m
        let laser = LaserInfo {
            wavelength_um: self.get_f64("LaserWavelength").await? * 1e6,
        };

        let motor = MotorInfo {
            min_coder_pos: self.get_i32("MotorMinCoderPos").await?,
            max_coder_pos: self.get_i32("MotorMaxCoderPos").await?,
            coder_pos: self.get_i32("MotorCoderPos").await?,
            min_pos: self.get_f32("MotorMinPos").await?,
            max_pos: self.get_f32("MotorMaxPos").await?,
            pos: self.get_f32("MotorPos").await?,
            unit_pos: self.get_string("MotorUnitPos").await?,
        };

        Ok(DhmParameters {
            server,
            dhm,
            objective,
            camera,
            laser,
            motor,
        })
    }

    /// Sends `Quit` and closes the socket.
    pub async fn close(mut self) -> DhmResult<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        let quit = codes::QUIT.to_le_bytes();
        let sent = stream.write_all(&quit).await;
        let _ = stream.shutdown().await;
        info!(peer = %self.peer, "Disconnected from DHM server");
        sent.map_err(|e| ProtocolError::from(e).into())
    }

    /// Best-effort `Quit` without consuming the client.
    async fn shutdown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.write_all(&codes::QUIT.to_le_bytes()).await;
            let _ = stream.shutdown().await;
        }
    }

    /// One request/response exchange. Drops the connection on any wire failure.
    async fn exchange(
        &mut self,
        code: i32,
        args: &[Value],
        inputs: &TypeSpec,
        output: &TypeSpec,
    ) -> DhmResult<Vec<Value>> {
        let frame = codec::encode(code, args, inputs)?;
        let stream = self.stream.as_mut().ok_or(ProtocolError::NotConnected)?;

        let timeout_ms = u64::try_from(self.request_timeout.as_millis()).unwrap_or(u64::MAX);
        let outcome = tokio::time::timeout(
            self.request_timeout,
            round_trip(stream, code, &frame, output),
        )
        .await
        .unwrap_or(Err(ProtocolError::Timeout(timeout_ms)));

        match outcome {
            Ok(values) => Ok(values),
            Err(err) => {
                warn!(
                    peer = %self.peer,
                    command = %format!("0x{code:08x}"),
                    error = %err,
                    "Dropping DHM connection"
                );
                if let Some(stream) = self.stream.take() {
                    // The server hangs up by itself after an Error frame.
                    if !matches!(err, ProtocolError::ServerRejected { .. }) {
                        quit_nonblocking(&stream, &self.peer);
                    }
                }
                Err(err.into())
            }
        }
    }
}

async fn round_trip(
    stream: &mut TcpStream,
    code: i32,
    frame: &[u8],
    output: &TypeSpec,
) -> Result<Vec<Value>, ProtocolError> {
    stream.write_all(frame).await?;
    let answer = codec::read_code(stream).await?;
    if answer == codes::ERROR && code != codes::ERROR {
        let result = stream.read_i32_le().await?;
        return Err(ProtocolError::ServerRejected {
            command: code,
            result,
            reason: result_reason(result),
        });
    }
    if answer != code {
        return Err(ProtocolError::CommandMismatch {
            expected: code,
            received: answer,
        });
    }
    codec::read_values(stream, output).await
}

/// Converts numeric arguments to the wire type of the command.
fn coerce(value: Value, tag: TypeTag, index: usize) -> Result<Value, ProtocolError> {
    let converted = match (&value, tag) {
        (v, t) if v.tag() == t => return Ok(value),
        (Value::Int32(v), TypeTag::Float32) => Value::Float32(*v as f32),
        (Value::Int32(v), TypeTag::Float64) => Value::Float64(f64::from(*v)),
        (Value::Float32(v), TypeTag::Float64) => Value::Float64(f64::from(*v)),
        (Value::Float64(v), TypeTag::Float32) => Value::Float32(*v as f32),
        (Value::Float32(v), TypeTag::Int32) => Value::Int32(v.round() as i32),
        (Value::Float64(v), TypeTag::Int32) => Value::Int32(v.round() as i32),
        _ => {
            return Err(ProtocolError::ArgumentType {
                index,
                expected: tag.code(),
            })
        }
    };
    Ok(converted)
}

fn unexpected(name: &str, expected: TypeTag, found: &Value) -> DhmError {
    DhmError::UnexpectedValue {
        name: name.to_string(),
        expected: expected.name(),
        found: found.tag().name(),
    }
}

/// Sends `Quit` without awaiting; a 4 byte write fits into any socket buffer.
fn quit_nonblocking(stream: &TcpStream, peer: &str) {
    match stream.try_write(&codes::QUIT.to_le_bytes()) {
        Ok(_) => debug!(peer, "Sent Quit"),
        Err(e) => warn!(peer, error = %e, "Could not send Quit"),
    }
}

impl Drop for DhmClient {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            quit_nonblocking(&stream, &self.peer);
        }
    }
}

#[async_trait]
impl HoloCamera for DhmClient {
    async fn shutter_range(&mut self) -> DhmResult<(i32, i32)> {
        let min = self.get_i32("CameraMinShutter").await?;
        let max = self.get_i32("CameraMaxShutter").await?;
        Ok((min, max))
    }

    async fn shutter(&mut self) -> DhmResult<i32> {
        self.get_i32("CameraShutter").await
    }

    async fn set_shutter(&mut self, shutter: i32) -> DhmResult<()> {
        self.set("CameraShutter", shutter).await
    }

    async fn bit_depth(&mut self) -> DhmResult<u32> {
        let bits = self.get_i32("CameraBitPerPixel").await?;
        u32::try_from(bits).map_err(|_| DhmError::UnexpectedValue {
            name: "CameraBitPerPixel".to_string(),
            expected: "non-negative bit depth",
            found: "negative value",
        })
    }

    async fn grab_frame(&mut self) -> DhmResult<Array2<u16>> {
        Ok(self.get_image("CameraImage").await?.into_pixels())
    }
}

#[async_trait]
impl OplMotor for DhmClient {
    async fn motor_range(&mut self) -> DhmResult<(f64, f64)> {
        let min = self.get_number("MotorMinPos").await?;
        let max = self.get_number("MotorMaxPos").await?;
        Ok((min, max))
    }

    async fn motor_position(&mut self) -> DhmResult<f64> {
        self.get_number("MotorPos").await
    }

    async fn move_motor(&mut self, position: f64) -> DhmResult<()> {
        self.set("MotorPos", position).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_numeric_arguments() {
        assert_eq!(
            coerce(Value::Float64(1375.5), TypeTag::Float32, 0).unwrap(),
            Value::Float32(1375.5)
        );
        assert_eq!(
            coerce(Value::Int32(7), TypeTag::Float64, 0).unwrap(),
            Value::Float64(7.0)
        );
        assert_eq!(
            coerce(Value::Float64(41.6), TypeTag::Int32, 0).unwrap(),
            Value::Int32(42)
        );
        assert!(matches!(
            coerce(Value::from("fast"), TypeTag::Int32, 2),
            Err(ProtocolError::ArgumentType {
                index: 2,
                expected: 'i'
            })
        ));
    }
}
