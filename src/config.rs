//! Configuration loading using Figment
//!
//! Configuration is layered from:
//! 1. `config/dhm.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `DHM_`, using `__` to address nested keys
//!
//! Every key has a default, so an empty or missing file yields a usable configuration.
//!
//! # Environment Variable Overrides
//!
//! ```text
//! DHM_SERVER__HOST=192.168.0.17
//! DHM_EXPOSURE__MAX_OVERFLOW=20
//! DHM_OPL__MODE=long
//! ```
//!
//! # Example
//!
//! ```no_run
//! use dhm_daq::config::DhmConfig;
//!
//! fn main() -> dhm_daq::error::DhmResult<()> {
//!     let config = DhmConfig::load()?;
//!     println!("DHM server at {}:{}", config.server.host, config.server.port);
//!     Ok(())
//! }
//! ```

use crate::error::{DhmError, DhmResult};
use crate::protocol::DEFAULT_PORT;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/dhm.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DhmConfig {
    pub application: ApplicationConfig,
    pub server: ServerConfig,
    pub exposure: ExposureConfig,
    pub opl: OplConfig,
    pub reference: ReferenceConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "DHM remote control".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Connection to the DHM server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    /// Upper bound for one request/response exchange. Image transfers of a
    /// full sensor take a few hundred milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Exposure time optimization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    /// Number of saturated pixels tolerated in the optimized frame
    pub max_overflow: usize,
    /// Frame budget of one optimization run
    pub max_frames: usize,
    /// Log every probe frame at info level
    pub trace: bool,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            max_overflow: 9,
            max_frames: 100,
            trace: false,
        }
    }
}

/// Optical path length scan mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Scan `steps` positions centered on the start position
    Short,
    /// Scan the full motor travel
    Long,
    /// Short scan, falling back to a long scan without interference
    #[default]
    Both,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::Short => "short",
            ScanMode::Long => "long",
            ScanMode::Both => "both",
        }
    }
}

/// Optical path length scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OplConfig {
    pub mode: ScanMode,
    /// Number of coarse positions of a short scan
    pub steps: usize,
    /// Coarse step size in µm
    pub step_um: f64,
    /// Peak weight above which a sample counts as interference
    pub threshold: f64,
    /// Bisection stops once neighboring contrasts differ by less than this
    pub min_contrast: f64,
    /// Bisection stops once the bracket is narrower than this (µm)
    pub min_span_um: f64,
    /// Optimize the exposure at the first sample of each phase
    pub optimize_exposure: bool,
    /// Spectral blur radius of the contrast measurement
    pub blur: usize,
}

impl Default for OplConfig {
    fn default() -> Self {
        Self {
            mode: ScanMode::Both,
            steps: 11,
            step_um: 250.0,
            threshold: 0.2,
            min_contrast: 0.001,
            min_span_um: 5.0,
            optimize_exposure: true,
            blur: 16,
        }
    }
}

impl OplConfig {
    /// Rejects scan geometries that cannot make progress.
    pub fn validate(&self) -> DhmResult<()> {
        if self.steps < 2 {
            return Err(DhmError::Configuration(format!(
                "opl.steps {} too small. Must be >= 2",
                self.steps
            )));
        }
        if !(self.step_um.is_finite() && self.step_um > 0.0) {
            return Err(DhmError::Configuration(format!(
                "opl.step_um must be positive, got {}",
                self.step_um
            )));
        }
        if !(0.0..1.0).contains(&self.threshold) {
            return Err(DhmError::Configuration(format!(
                "opl.threshold {} outside of [0, 1)",
                self.threshold
            )));
        }
        if self.min_contrast < 0.0 || self.min_span_um <= 0.0 {
            return Err(DhmError::Configuration(
                "opl.min_contrast must be >= 0 and opl.min_span_um > 0".to_string(),
            ));
        }
        if self.blur == 0 {
            return Err(DhmError::Configuration(
                "opl.blur must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reference hologram evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub blur: usize,
    /// Order of the polynomial phase surface
    pub order: usize,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self { blur: 16, order: 2 }
    }
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_request_timeout() -> u64 {
    10000
}

impl DhmConfig {
    /// Load configuration from `config/dhm.toml` and environment variables
    ///
    /// Environment variables take precedence over the file. After loading,
    /// configuration is validated.
    pub fn load() -> DhmResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> DhmResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DHM_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns `DhmError::Configuration` with a descriptive message for any
    /// value that parses but cannot work.
    pub fn validate(&self) -> DhmResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DhmError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DhmError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.server.host.is_empty() {
            return Err(DhmError::Configuration(
                "server.host cannot be empty".to_string(),
            ));
        }
        if self.server.port == 0 {
            return Err(DhmError::Configuration(
                "server.port must be > 0".to_string(),
            ));
        }
        if self.server.request_timeout_ms == 0 || self.server.connect_timeout_ms == 0 {
            return Err(DhmError::Configuration(
                "server timeouts must be > 0".to_string(),
            ));
        }

        if self.exposure.max_frames < 2 {
            return Err(DhmError::Configuration(format!(
                "exposure.max_frames {} too small. Must be >= 2",
                self.exposure.max_frames
            )));
        }

        self.opl.validate()?;
        if self.reference.blur == 0 {
            return Err(DhmError::Configuration(
                "reference.blur must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let config = DhmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 27182);
        assert_eq!(config.exposure.max_overflow, 9);
        assert_eq!(config.opl.mode, ScanMode::Both);
        assert_eq!(config.reference.order, 2);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = DhmConfig::default();
        config.application.log_level = "verbose".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_invalid_opl_threshold() {
        let mut config = DhmConfig::default();
        config.opl.threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(DhmError::Configuration(_))
        ));
    }

    #[test]
    fn test_load_file_with_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "dhm.toml",
                r#"
                [server]
                host = "dhm-lab"
                port = 27200

                [opl]
                mode = "short"
                step_um = 100.0
                "#,
            )?;
            jail.set_env("DHM_SERVER__PORT", "30000");
            jail.set_env("DHM_EXPOSURE__MAX_OVERFLOW", "25");

            let config = DhmConfig::load_from("dhm.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.server.host, "dhm-lab");
            assert_eq!(config.server.port, 30000);
            assert_eq!(config.exposure.max_overflow, 25);
            assert_eq!(config.opl.mode, ScanMode::Short);
            assert_eq!(config.opl.step_um, 100.0);
            assert_eq!(config.opl.steps, 11);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        Jail::expect_with(|_jail| {
            let config = DhmConfig::load_from("absent.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.server.host, "localhost");
            Ok(())
        });
    }
}
