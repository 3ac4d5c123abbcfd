//! Capture formats

use frame_queue::PlaneLayout;
use serde::{Deserialize, Serialize};

/// Planar output formats supported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Planar 4:2:0 (chroma planes are a quarter of luma)
    Yuv420p,
    /// Planar 4:2:2 (chroma planes are half of luma)
    Yuv422p,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 2] = [PixelFormat::Yuv420p, PixelFormat::Yuv422p];

    /// V4L2 fourcc
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Yuv420p => *b"YU12",
            PixelFormat::Yuv422p => *b"422P",
        }
    }

    /// Bytes in one chroma plane for a `width` x `height` frame
    pub fn chroma_size(&self, width: u32, height: u32) -> usize {
        let luma = width as usize * height as usize;
        match self {
            PixelFormat::Yuv420p => luma / 4,
            PixelFormat::Yuv422p => luma / 2,
        }
    }
}

/// Crop rectangle in sensor coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    pub fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Whether the rectangle lies inside a `width` x `height` area
    pub fn fits(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.left.checked_add(self.width).is_some_and(|r| r <= width)
            && self.top.checked_add(self.height).is_some_and(|b| b <= height)
    }
}

/// Current capture format of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFrame {
    /// Output width
    pub width: u32,
    /// Output height
    pub height: u32,
    pub format: PixelFormat,
    pub crop: CropRect,
    pub enable_crop: bool,
    pub enable_scale: bool,
}

impl Default for CaptureFrame {
    fn default() -> Self {
        Self::new(640, 480, PixelFormat::Yuv422p)
    }
}

impl CaptureFrame {
    /// Uncropped, unscaled frame
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            crop: CropRect::default(),
            enable_crop: false,
            enable_scale: false,
        }
    }

    pub fn y_size(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn uv_size(&self) -> usize {
        self.format.chroma_size(self.width, self.height)
    }

    pub fn layout(&self) -> PlaneLayout {
        PlaneLayout::new(self.y_size(), self.uv_size())
    }

    /// Region the scaler reads from: the crop window when cropping, else
    /// the full sensor frame
    pub fn source_extent(&self, sensor_width: u32, sensor_height: u32) -> (u32, u32) {
        if self.enable_crop {
            (self.crop.width, self.crop.height)
        } else {
            (sensor_width, sensor_height)
        }
    }
}

/// Input synchronisation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Separate HSYNC/VSYNC lines
    External,
    /// SAV/EAV codes embedded in the data stream
    #[default]
    Embedded,
}

/// Input sample width
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitWidth {
    Bits8,
    #[default]
    Bits16,
}

/// Data-line swap wiring; differs between chip revisions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitSwap {
    #[default]
    Rev1,
    Rev2,
}

impl BitSwap {
    /// Value of the CTRL bit-swap field
    pub fn field_value(&self) -> u32 {
        match self {
            BitSwap::Rev1 => 0x0,
            BitSwap::Rev2 => 0xA,
        }
    }
}

/// Input side configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub sync: SyncMode,
    pub bit_width: BitWidth,
    pub bit_swap: BitSwap,
    /// Mix source the capture block listens to (0..3)
    pub mix_index: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_sizes() {
        let f = CaptureFrame::new(720, 480, PixelFormat::Yuv422p);
        assert_eq!(f.y_size(), 345_600);
        assert_eq!(f.uv_size(), 172_800);
        assert_eq!(f.layout().bytes_used(), 720 * 480 + 2 * (720 * 480 / 2));

        let f = CaptureFrame::new(640, 480, PixelFormat::Yuv420p);
        assert_eq!(f.uv_size(), 76_800);
    }

    #[test]
    fn test_source_extent() {
        let mut f = CaptureFrame::new(320, 240, PixelFormat::Yuv420p);
        assert_eq!(f.source_extent(1280, 720), (1280, 720));
        f.enable_crop = true;
        f.crop = CropRect::new(10, 10, 640, 480);
        assert_eq!(f.source_extent(1280, 720), (640, 480));
    }

    #[test]
    fn test_crop_fits() {
        assert!(CropRect::new(0, 0, 640, 480).fits(640, 480));
        assert!(!CropRect::new(1, 0, 640, 480).fits(640, 480));
        assert!(!CropRect::new(0, 0, 0, 480).fits(640, 480));
        assert!(!CropRect::new(u32::MAX, 0, 2, 2).fits(640, 480));
    }
}
