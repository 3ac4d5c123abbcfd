//! Simulator configuration

use std::path::PathBuf;

use bt1120_capture::{CaptureConfig, CropRect, PixelFormat, SensorFormat};
use serde::{Deserialize, Serialize};

use crate::SimError;

/// Environment prefix; `BT1120_FRAMES=20`, `BT1120_CAPTURE__STOP_POLL_COUNT=10`
pub const ENV_PREFIX: &str = "BT1120";

/// One simulation run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub capture: CaptureConfig,

    /// Sensor name and mode table
    pub sensor_name: String,
    pub sensor_modes: Vec<SensorFormat>,

    /// Requested output
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub crop: Option<CropRect>,

    /// Buffers requested from queue setup
    pub buffers: usize,
    /// Byte offset of each buffer from an aligned start
    pub buffer_skew: usize,

    /// Frames the sensor delivers
    pub frames: u32,
    /// Time between frames (milliseconds)
    pub frame_interval_ms: u64,

    /// Leave the deferred worker off until the last frame
    pub stall_consumer: bool,
    /// Engine never acknowledges a stop request
    pub stop_stall: bool,

    /// Write each delivered luma plane here as PNG
    pub dump_dir: Option<PathBuf>,

    /// Log as JSON lines instead of plain text
    pub log_json: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            sensor_name: "ov5640".to_string(),
            sensor_modes: vec![
                SensorFormat::new(2592, 1944),
                SensorFormat::new(1920, 1080),
                SensorFormat::new(1280, 720),
                SensorFormat::new(640, 480),
            ],
            width: 1280,
            height: 720,
            format: PixelFormat::Yuv422p,
            crop: None,
            buffers: 3,
            buffer_skew: 0,
            frames: 30,
            frame_interval_ms: 33,
            stall_consumer: false,
            stop_stall: false,
            dump_dir: None,
            log_json: false,
        }
    }
}

impl SimConfig {
    /// Defaults, overridden by an optional TOML file, overridden by
    /// `BT1120_*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self, SimError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_sources() {
        let config = SimConfig::load(None).unwrap();
        assert_eq!(config.width, 1280);
        assert_eq!(config.capture.stop_poll_count, 50);
        assert_eq!(config.sensor_modes.len(), 4);
    }

    #[test]
    fn test_file_overrides() {
        let path = std::env::temp_dir().join(format!("bt1120-sim-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "width = 640\nheight = 480\nformat = \"Yuv420p\"\nstall_consumer = true\nlog_json = true\n\
             [capture]\nstop_poll_count = 5\n[crop]\nleft = 0\ntop = 0\nwidth = 1280\nheight = 960"
        )
        .unwrap();
        drop(file);

        let config = SimConfig::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!((config.width, config.height), (640, 480));
        assert_eq!(config.format, PixelFormat::Yuv420p);
        assert!(config.stall_consumer);
        assert!(config.log_json);
        assert_eq!(config.capture.stop_poll_count, 5);
        assert_eq!(config.capture.stop_poll_interval_ms, 10);
        assert_eq!(config.crop, Some(CropRect::new(0, 0, 1280, 960)));
    }
}
