//! Sensor sub-device interface

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::CaptureError;

/// Sensor output size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorFormat {
    pub width: u32,
    pub height: u32,
}

impl SensorFormat {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    fn covers(&self, other: &SensorFormat) -> bool {
        self.width >= other.width && self.height >= other.height
    }
}

/// Sensor attached to the capture input
pub trait SensorSubdev: Send + Sync {
    fn name(&self) -> &str;

    /// Format the sensor would produce for `req`, without applying it
    fn try_format(&self, req: SensorFormat) -> Result<SensorFormat, CaptureError>;

    /// Apply the closest format to `req`; returns what the sensor produces
    fn set_format(&self, req: SensorFormat) -> Result<SensorFormat, CaptureError>;

    fn set_stream(&self, on: bool) -> Result<(), CaptureError>;
}

/// Sensor with a fixed mode table.
///
/// Picks the smallest mode covering the request, or the largest mode when
/// nothing does.
pub struct StaticSensor {
    name: String,
    modes: Vec<SensorFormat>,
    current: Mutex<Option<SensorFormat>>,
    streaming: AtomicBool,
}

impl StaticSensor {
    pub fn new(name: impl Into<String>, modes: Vec<SensorFormat>) -> Self {
        Self {
            name: name.into(),
            modes,
            current: Mutex::new(None),
            streaming: AtomicBool::new(false),
        }
    }

    /// 2 MP sensor modes (UXGA, SVGA, VGA)
    pub fn ov2640() -> Self {
        Self::new(
            "ov2640",
            vec![
                SensorFormat::new(1600, 1200),
                SensorFormat::new(800, 600),
                SensorFormat::new(640, 480),
            ],
        )
    }

    /// 5 MP sensor modes (QSXGA, 1080p, 720p, VGA)
    pub fn ov5640() -> Self {
        Self::new(
            "ov5640",
            vec![
                SensorFormat::new(2592, 1944),
                SensorFormat::new(1920, 1080),
                SensorFormat::new(1280, 720),
                SensorFormat::new(640, 480),
            ],
        )
    }

    /// Currently applied format
    pub fn current(&self) -> Option<SensorFormat> {
        *self.current.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    fn pick(&self, req: SensorFormat) -> Result<SensorFormat, CaptureError> {
        let covering = self
            .modes
            .iter()
            .filter(|m| m.covers(&req))
            .min_by_key(|m| m.area());
        covering
            .or_else(|| self.modes.iter().max_by_key(|m| m.area()))
            .copied()
            .ok_or_else(|| CaptureError::Sensor(format!("{} has no modes", self.name)))
    }
}

impl SensorSubdev for StaticSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_format(&self, req: SensorFormat) -> Result<SensorFormat, CaptureError> {
        self.pick(req)
    }

    fn set_format(&self, req: SensorFormat) -> Result<SensorFormat, CaptureError> {
        let mode = self.pick(req)?;
        debug!(
            "{}: {}x{} requested, mode {}x{}",
            self.name, req.width, req.height, mode.width, mode.height
        );
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(mode);
        Ok(mode)
    }

    fn set_stream(&self, on: bool) -> Result<(), CaptureError> {
        info!("{}: stream {}", self.name, if on { "on" } else { "off" });
        self.streaming.store(on, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_mode() {
        let s = StaticSensor::ov5640();
        assert_eq!(
            s.set_format(SensorFormat::new(1280, 720)).unwrap(),
            SensorFormat::new(1280, 720)
        );
        assert_eq!(s.current(), Some(SensorFormat::new(1280, 720)));
    }

    #[test]
    fn test_smallest_covering_mode() {
        let s = StaticSensor::ov2640();
        assert_eq!(
            s.try_format(SensorFormat::new(320, 240)).unwrap(),
            SensorFormat::new(640, 480)
        );
        assert_eq!(s.current(), None);
    }

    #[test]
    fn test_oversized_request_gets_largest() {
        let s = StaticSensor::ov2640();
        assert_eq!(
            s.try_format(SensorFormat::new(4000, 3000)).unwrap(),
            SensorFormat::new(1600, 1200)
        );
    }

    #[test]
    fn test_empty_mode_table() {
        let s = StaticSensor::new("none", vec![]);
        assert!(matches!(
            s.try_format(SensorFormat::new(1, 1)),
            Err(CaptureError::Sensor(_))
        ));
    }
}
