//! Crop window alignment
//!
//! Chroma subsampling needs the window to start on an even coordinate. The
//! start is rounded down to even; the inclusive end is `left + width` when
//! that is odd and `left + width - 1` otherwise, so the window grows outward
//! rather than losing pixels.

use crate::CropRect;

/// Inclusive crop window as programmed into CROP_X/CROP_Y
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropWindow {
    pub x_begin: u32,
    pub x_end: u32,
    pub y_begin: u32,
    pub y_end: u32,
}

fn even_span(start: u32, len: u32) -> (u32, u32) {
    let begin = start & !1;
    let past = start.saturating_add(len);
    let end = if past % 2 == 1 {
        past
    } else {
        past.saturating_sub(1)
    };
    (begin, end)
}

impl CropWindow {
    pub fn from_rect(rect: &CropRect) -> Self {
        let (x_begin, x_end) = even_span(rect.left, rect.width);
        let (y_begin, y_end) = even_span(rect.top, rect.height);
        Self {
            x_begin,
            x_end,
            y_begin,
            y_end,
        }
    }
}
