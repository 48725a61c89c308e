//! Simulated microscope and a loopback DHM server.
//!
//! [`SimulatedDhm`] models the optics well enough to exercise the control loops:
//! the camera sees a cosine fringe pattern whose brightness grows linearly with
//! the shutter value and whose fringe visibility is a Gaussian function of the
//! OPL motor position. It implements [`HoloCamera`] and [`OplMotor`] directly, so
//! the algorithms can run in-process.
//!
//! [`MockDhmServer`] puts the same model behind a real TCP socket speaking the
//! DHM wire protocol, including `Error` frames for out-of-range writes and
//! unknown commands.

use super::capabilities::{saturation_value, HoloCamera, OplMotor};
use crate::config::ServerConfig;
use crate::error::{DhmResult, ProtocolError};
use crate::protocol::codec::{self, TypeSpec, Value};
use crate::protocol::commands::{Command, CommandTable};
use crate::protocol::{codes, ConfigItem, ImagePayload, PixelDepth, COMMAND_VERSION};
use async_trait::async_trait;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Server result codes used by the simulation.
mod result {
    pub const SHUTTER_UNDERFLOW: i32 = -6;
    pub const SHUTTER_OVERFLOW: i32 = -7;
    pub const POS_UNDERFLOW: i32 = -14;
    pub const POS_OVERFLOW: i32 = -15;
    pub const BPP_UNDERFLOW: i32 = -16;
    pub const UNKNOWN_COMMAND: i32 = -17;
}

/// Optical model of a DHM.
#[derive(Debug, Clone)]
pub struct SimulatedDhm {
    pub server_version: i32,
    pub width: usize,
    pub height: usize,
    pub bit_depth: u32,
    /// Fringe carrier in cycles per frame `(x, y)`
    pub carrier: (f64, f64),
    /// Mean pixel value per shutter unit
    pub gain_per_shutter: f64,
    pub shutter: i32,
    pub shutter_range: (i32, i32),
    pub motor_position: f64,
    pub motor_range: (f64, f64),
    /// Motor position of balanced path lengths (µm)
    pub coherence_center: f64,
    /// Standard deviation of the visibility envelope (µm)
    pub coherence_width: f64,
    pub max_visibility: f64,
    /// Uniform pixel noise amplitude
    pub noise: f64,
    pub camera_name: String,
    pub config_id: i32,
    pub configs: Vec<ConfigItem>,
    pub frames_grabbed: usize,
    pub quit_received: usize,
    rng: StdRng,
}

impl Default for SimulatedDhm {
    fn default() -> Self {
        Self {
            server_version: 4,
            width: 128,
            height: 128,
            bit_depth: 8,
            carrier: (32.0, 32.0),
            gain_per_shutter: 0.5,
            shutter: 100,
            shutter_range: (1, 2000),
            motor_position: 1000.0,
            motor_range: (0.0, 3000.0),
            coherence_center: 1375.0,
            coherence_width: 150.0,
            max_visibility: 0.9,
            noise: 0.0,
            camera_name: "Basler acA1300-60gm".to_string(),
            config_id: 137,
            configs: vec![
                ConfigItem {
                    id: 137,
                    name: "10x".to_string(),
                },
                ConfigItem {
                    id: 138,
                    name: "20x".to_string(),
                },
            ],
            frames_grabbed: 0,
            quit_received: 0,
            rng: StdRng::seed_from_u64(0x5eed),
        }
    }
}

impl SimulatedDhm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_noise(mut self, noise: f64, seed: u64) -> Self {
        self.noise = noise;
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Fringe visibility at the current motor position.
    pub fn visibility(&self) -> f64 {
        let d = self.motor_position - self.coherence_center;
        self.max_visibility * (-d * d / (2.0 * self.coherence_width * self.coherence_width)).exp()
    }

    /// Renders one camera frame at the current shutter and motor position.
    pub fn render(&mut self) -> Array2<u16> {
        self.frames_grabbed += 1;
        let max = f64::from(saturation_value(self.bit_depth));
        let level = self.gain_per_shutter * f64::from(self.shutter);
        let visibility = self.visibility();
        let (fx, fy) = (
            self.carrier.0 / self.width as f64,
            self.carrier.1 / self.height as f64,
        );
        let noise = self.noise;
        let rng = &mut self.rng;
        Array2::from_shape_fn((self.height, self.width), |(y, x)| {
            let phase = 2.0 * PI * (fx * x as f64 + fy * y as f64);
            let mut value = level * (1.0 + visibility * phase.cos());
            if noise > 0.0 {
                value += rng.gen_range(-noise..=noise);
            }
            value.round().clamp(0.0, max) as u16
        })
    }

    fn image(&mut self) -> ImagePayload {
        let depth = if self.bit_depth > 8 {
            PixelDepth::Mono16
        } else {
            PixelDepth::Mono8
        };
        ImagePayload::new(self.render(), depth)
    }

    fn read(&mut self, name: &str) -> Result<Value, i32> {
        let value = match name {
            "ServerVersion" => Value::Int32(self.server_version),
            "CmdVersion" => Value::Int32(COMMAND_VERSION),
            "Status" => Value::Int32(2),
            "ConfigList" => Value::ConfigList(self.configs.clone()),
            "Config" => Value::Int32(self.config_id),
            "DhmSerial" => Value::from("DHM-T1000-SIM"),
            "ObjectiveName" => Value::from("10x"),
            "ObjectiveDescription" => Value::from("Simulated 10x objective"),
            "ObjectiveMagnification" => Value::Float64(10.0),
            "ObjectiveNumericalAperture" => Value::Float64(0.3),
            "ObjectivePixelSizeXUm" | "ObjectivePixelSizeYUm" => Value::Float64(0.53),
            "CameraSerial" => Value::from("SIM-0001"),
            "CameraName" => Value::Str(self.camera_name.clone()),
            "CameraMaxWidth" | "CameraWidth" | "CameraStride" => Value::Int32(self.width as i32),
            "CameraMaxHeight" | "CameraHeight" => Value::Int32(self.height as i32),
            "CameraOffsetX" | "CameraOffsetY" => Value::Int32(0),
            "CameraBitPerPixel" => Value::Int32(self.bit_depth as i32),
            "CameraPixelSizeUm" => Value::Float32(5.3),
            "CameraMinShutter" => Value::Int32(self.shutter_range.0),
            "CameraMaxShutter" => Value::Int32(self.shutter_range.1),
            "CameraShutter" => Value::Int32(self.shutter),
            "CameraMinShutterUs" => Value::Float32(self.shutter_range.0 as f32 * 10.0),
            "CameraMaxShutterUs" => Value::Float32(self.shutter_range.1 as f32 * 10.0),
            "CameraShutterUs" => Value::Float32(self.shutter as f32 * 10.0),
            "CameraMinGain" | "CameraGain" | "CameraMinBrightness" => Value::Int32(0),
            "CameraMaxGain" => Value::Int32(100),
            "CameraMaxBrightness" => Value::Int32(255),
            "CameraBrightness" => Value::Int32(128),
            "CameraImage" => Value::Image(self.image()),
            "LaserWavelength" => Value::Float64(666e-9),
            "MotorMinCoderPos" => Value::Int32((self.motor_range.0 * 10.0) as i32),
            "MotorMaxCoderPos" => Value::Int32((self.motor_range.1 * 10.0) as i32),
            "MotorCoderPos" => Value::Int32((self.motor_position * 10.0).round() as i32),
            "MotorMinPos" => Value::Float32(self.motor_range.0 as f32),
            "MotorMaxPos" => Value::Float32(self.motor_range.1 as f32),
            "MotorPos" => Value::Float32(self.motor_position as f32),
            "MotorUnitPos" => Value::from("µm"),
            _ => return Err(result::UNKNOWN_COMMAND),
        };
        Ok(value)
    }

    fn write(&mut self, name: &str, value: &Value) -> Result<(), i32> {
        let number = value.as_f64().ok_or(result::UNKNOWN_COMMAND)?;
        match name {
            "CameraShutter" => self.apply_shutter(number.round() as i32)?,
            "CameraShutterUs" => self.apply_shutter((number / 10.0).round() as i32)?,
            "MotorPos" => {
                if number < self.motor_range.0 {
                    return Err(result::POS_UNDERFLOW);
                }
                if number > self.motor_range.1 {
                    return Err(result::POS_OVERFLOW);
                }
                self.motor_position = number;
            }
            "CameraBitPerPixel" => {
                if number < 1.0 {
                    return Err(result::BPP_UNDERFLOW);
                }
                self.bit_depth = number as u32;
            }
            "Config" => self.config_id = number as i32,
            "CameraGain" | "CameraBrightness" | "LaserOutput" => {}
            _ => return Err(result::UNKNOWN_COMMAND),
        }
        Ok(())
    }

    fn apply_shutter(&mut self, shutter: i32) -> Result<(), i32> {
        if shutter < self.shutter_range.0 {
            return Err(result::SHUTTER_UNDERFLOW);
        }
        if shutter > self.shutter_range.1 {
            return Err(result::SHUTTER_OVERFLOW);
        }
        self.shutter = shutter;
        Ok(())
    }

    fn call(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, i32> {
        match name {
            "OptCameraImage" | "StartCameraGrabTime" => {
                if let Some(Value::Int32(shutter)) = args.first() {
                    if name == "OptCameraImage" {
                        self.apply_shutter(*shutter)?;
                    }
                }
                Ok(vec![Value::Image(self.image())])
            }
            _ => Err(result::UNKNOWN_COMMAND),
        }
    }
}

#[async_trait]
impl HoloCamera for SimulatedDhm {
    async fn shutter_range(&mut self) -> DhmResult<(i32, i32)> {
        Ok(self.shutter_range)
    }

    async fn shutter(&mut self) -> DhmResult<i32> {
        Ok(self.shutter)
    }

    async fn set_shutter(&mut self, shutter: i32) -> DhmResult<()> {
        self.apply_shutter(shutter).map_err(rejected(codes::SET_CAMERA_SHUTTER))
    }

    async fn bit_depth(&mut self) -> DhmResult<u32> {
        Ok(self.bit_depth)
    }

    async fn grab_frame(&mut self) -> DhmResult<Array2<u16>> {
        Ok(self.render())
    }
}

#[async_trait]
impl OplMotor for SimulatedDhm {
    async fn motor_range(&mut self) -> DhmResult<(f64, f64)> {
        Ok(self.motor_range)
    }

    async fn motor_position(&mut self) -> DhmResult<f64> {
        Ok(self.motor_position)
    }

    async fn move_motor(&mut self, position: f64) -> DhmResult<()> {
        self.write("MotorPos", &Value::Float64(position))
            .map_err(rejected(codes::SET_MOTOR_POS))
    }
}

fn rejected(command: i32) -> impl Fn(i32) -> crate::error::DhmError {
    move |result| {
        ProtocolError::ServerRejected {
            command,
            result,
            reason: crate::protocol::commands::result_reason(result),
        }
        .into()
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Read,
    Write,
    Call,
}

#[derive(Debug, Clone)]
struct Route {
    name: String,
    action: Action,
    inputs: TypeSpec,
    output: TypeSpec,
}

fn routes(table: &CommandTable) -> HashMap<i32, Route> {
    let mut routes = HashMap::new();
    for name in table.names() {
        match table.lookup(name) {
            Some(Command::Property(p)) => {
                if let Some(code) = p.read {
                    routes.insert(
                        code,
                        Route {
                            name: p.name.clone(),
                            action: Action::Read,
                            inputs: TypeSpec::empty(),
                            output: p.tag.into(),
                        },
                    );
                }
                if let Some(code) = p.write {
                    routes.insert(
                        code,
                        Route {
                            name: p.name.clone(),
                            action: Action::Write,
                            inputs: p.tag.into(),
                            output: TypeSpec::empty(),
                        },
                    );
                }
            }
            Some(Command::Function(f)) => {
                routes.insert(
                    f.code,
                    Route {
                        name: f.name.clone(),
                        action: Action::Call,
                        inputs: f.inputs.clone(),
                        output: f.output.clone(),
                    },
                );
            }
            None => {}
        }
    }
    routes
}

/// A DHM server on a loopback port backed by a [`SimulatedDhm`].
pub struct MockDhmServer {
    addr: SocketAddr,
    state: Arc<Mutex<SimulatedDhm>>,
    handle: JoinHandle<()>,
}

impl MockDhmServer {
    /// Binds an ephemeral port and starts accepting connections.
    pub async fn start(dhm: SimulatedDhm) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(dhm));
        let routes = Arc::new(routes(&CommandTable::dhm()));

        let task_state = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Mock DHM server accept failed");
                        break;
                    }
                };
                debug!(%peer, "Mock DHM server accepted connection");
                let state = task_state.clone();
                let routes = routes.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(socket, state, routes).await {
                        debug!(%peer, error = %e, "Mock DHM connection ended");
                    }
                });
            }
        });

        info!(%addr, "Mock DHM server listening");
        Ok(Self {
            addr,
            state,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Client configuration pointing at this server.
    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            ..ServerConfig::default()
        }
    }

    pub fn state(&self) -> Arc<Mutex<SimulatedDhm>> {
        self.state.clone()
    }
}

impl Drop for MockDhmServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    mut socket: TcpStream,
    state: Arc<Mutex<SimulatedDhm>>,
    routes: Arc<HashMap<i32, Route>>,
) -> Result<(), ProtocolError> {
    loop {
        let code = match codec::read_code(&mut socket).await {
            Ok(code) => code,
            Err(ProtocolError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        };
        if code == codes::QUIT {
            state.lock().await.quit_received += 1;
            return Ok(());
        }

        let Some(route) = routes.get(&code) else {
            return send_error(&mut socket, result::UNKNOWN_COMMAND).await;
        };
        let args = codec::read_values(&mut socket, &route.inputs).await?;

        let outcome = {
            let mut dhm = state.lock().await;
            match route.action {
                Action::Read => dhm.read(&route.name).map(|v| vec![v]),
                Action::Write => match args.first() {
                    Some(value) => dhm.write(&route.name, value).map(|()| Vec::new()),
                    None => Err(result::UNKNOWN_COMMAND),
                },
                Action::Call => dhm.call(&route.name, &args),
            }
        };

        match outcome {
            Ok(values) => {
                let frame = codec::encode(code, &values, &route.output)?;
                socket.write_all(&frame).await?;
            }
            // The real server reports the failure and hangs up.
            Err(result) => return send_error(&mut socket, result).await,
        }
    }
}

async fn send_error(socket: &mut TcpStream, result: i32) -> Result<(), ProtocolError> {
    let frame = codec::encode(
        codes::ERROR,
        &[Value::Int32(result)],
        &crate::protocol::TypeTag::Int32.into(),
    )?;
    socket.write_all(&frame).await?;
    socket.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_saturates_at_bit_depth() {
        let mut dhm = SimulatedDhm::new();
        dhm.shutter = 2000;
        let frame = dhm.render();
        assert_eq!(frame.dim(), (128, 128));
        assert_eq!(frame.iter().copied().max(), Some(255));
        assert_eq!(dhm.frames_grabbed, 1);
    }

    #[test]
    fn test_visibility_peaks_at_coherence_center() {
        let mut dhm = SimulatedDhm::new();
        dhm.motor_position = dhm.coherence_center;
        assert!((dhm.visibility() - dhm.max_visibility).abs() < 1e-12);
        dhm.motor_position += 3.0 * dhm.coherence_width;
        assert!(dhm.visibility() < 0.02);
    }

    #[tokio::test]
    async fn test_out_of_range_writes_are_rejected() {
        let mut dhm = SimulatedDhm::new();
        let err = dhm.set_shutter(5000).await.unwrap_err();
        assert!(err.to_string().contains("shutter overflow"));
        let err = dhm.move_motor(-1.0).await.unwrap_err();
        assert!(err.to_string().contains("position underflow"));
        assert_eq!(dhm.shutter, 100);
    }

    #[test]
    fn test_routes_cover_table() {
        let routes = routes(&CommandTable::dhm());
        assert!(matches!(
            routes.get(&codes::SET_CAMERA_SHUTTER).map(|r| r.action),
            Some(Action::Write)
        ));
        assert!(matches!(
            routes.get(&codes::GET_OPT_CAMERA_IMAGE).map(|r| r.action),
            Some(Action::Call)
        ));
        assert!(!routes.contains_key(&codes::QUIT));
    }
}
