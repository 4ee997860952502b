//! Configuration loading and validation (C10).
//!
//! Layered the way the teacher's `Settings`/`V4Config` structs are: a TOML file
//! read through the `config` crate, with environment overrides under a `METEOR_`
//! prefix (double underscore separates nesting, e.g. `METEOR_PUSH__SERVER_PORT`).

use std::path::Path;

use serde::Deserialize;

use crate::error::{AppResult, DaqError};

/// Detection-resolution and algorithm tuning parameters (C2/C3/C6).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectConfig {
    pub detect_w: u32,
    pub detect_h: u32,
    pub block_frames: u16,
    pub fps: f64,
    pub k_sigma: u8,
    pub theta_steps: u16,
    pub rho_max: i32,
    pub peak_threshold: u16,
    pub min_votes: u32,
    pub min_length_px: u32,
    pub min_candidates: usize,
    pub max_candidates: usize,
    pub ff_tmp_dir: String,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            detect_w: 640,
            detect_h: 480,
            block_frames: 256,
            fps: 25.0,
            k_sigma: 5,
            theta_steps: 180,
            rho_max: 900,
            peak_threshold: 8,
            min_votes: 10,
            min_length_px: 15,
            min_candidates: 5,
            max_candidates: 4096,
            ff_tmp_dir: "/tmp/meteor_daq/ff".to_string(),
        }
    }
}

/// Frame-stacker tuning (C7).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct StackerConfig {
    pub frames_per_stack: u32,
    pub jpeg_quality: u8,
    pub dark_frame_path: Option<String>,
    pub stack_tmp_dir: String,
}

impl Default for StackerConfig {
    fn default() -> Self {
        Self {
            frames_per_stack: 25,
            jpeg_quality: 85,
            dark_frame_path: None,
            stack_tmp_dir: "/tmp/meteor_daq/stack".to_string(),
        }
    }
}

/// Receiver connection parameters (C5).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PushConfig {
    pub server_ip: String,
    pub server_port: u16,
    pub timeout_ms: u64,
    pub station_id: String,
    pub camno: u32,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            server_ip: "127.0.0.1".to_string(),
            server_port: 8765,
            timeout_ms: 5000,
            station_id: "AB0001".to_string(),
            camno: 1,
        }
    }
}

/// Process-level runtime knobs not tied to any one component.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Top-level configuration combining every component's settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub detect: DetectConfig,
    pub stacker: StackerConfig,
    pub push: PushConfig,
    pub runtime: RuntimeConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`, with `METEOR_`-prefixed
    /// environment overrides layered on top (matching the teacher's layered
    /// `Settings::new` approach), then validate.
    pub fn load(path: &Path) -> AppResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("METEOR").separator("__"))
            .build()
            .map_err(DaqError::Config)?;

        let app_config: AppConfig = settings.try_deserialize().map_err(DaqError::Config)?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Semantic validation beyond what serde's type system can express.
    pub fn validate(&self) -> AppResult<()> {
        if self.detect.rho_max > 900 {
            return Err(DaqError::Configuration(format!(
                "rho_max {} exceeds the 900 limit",
                self.detect.rho_max
            )));
        }
        if self.detect.theta_steps == 0 {
            return Err(DaqError::Configuration("theta_steps must be > 0".to_string()));
        }
        if self.detect.min_candidates > self.detect.max_candidates {
            return Err(DaqError::Configuration(format!(
                "min_candidates ({}) must not exceed max_candidates ({})",
                self.detect.min_candidates, self.detect.max_candidates
            )));
        }
        if self.detect.block_frames == 0 {
            return Err(DaqError::Configuration("block_frames must be > 0".to_string()));
        }
        if self.stacker.frames_per_stack == 0 {
            return Err(DaqError::Configuration("frames_per_stack must be > 0".to_string()));
        }
        if self.push.server_port == 0 {
            return Err(DaqError::Configuration("server_port must be nonzero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_toml(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_default_config_validates() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_overrides_defaults_from_toml() {
        let file = write_toml(
            r#"
            [detect]
            detect_w = 320
            detect_h = 240

            [push]
            server_ip = "10.0.0.5"
            server_port = 9000
            "#,
        );
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.detect.detect_w, 320);
        assert_eq!(config.detect.detect_h, 240);
        assert_eq!(config.push.server_ip, "10.0.0.5");
        assert_eq!(config.push.server_port, 9000);
        // Untouched fields keep their defaults.
        assert_eq!(config.detect.block_frames, 256);
    }

    #[test]
    fn test_validate_rejects_rho_max_too_large() {
        let mut config = AppConfig::default();
        config.detect.rho_max = 901;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn test_validate_rejects_min_candidates_above_max() {
        let mut config = AppConfig::default();
        config.detect.min_candidates = 10;
        config.detect.max_candidates = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_server_port() {
        let mut config = AppConfig::default();
        config.push.server_port = 0;
        assert!(config.validate().is_err());
    }
}
