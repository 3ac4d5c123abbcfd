//! Scaler step calculation and filter coefficients
//!
//! Downscaling runs in two stages per axis: an integer decimation that
//! divides the source by `decimation + 1`, then a fractional resampler with a
//! 1/4096 step that covers ratios up to 4:1. Decimation is only raised while
//! the remaining ratio is above 4 (or exactly 4 with a remainder).

use crate::map::MAX_DECIMATION;
use crate::RegError;

/// Fixed-point unit of the fractional step
pub const STEP_UNIT: u64 = 4096;

/// Largest ratio the fractional stage handles on its own
pub const MAX_FRACTIONAL_RATIO: u32 = 4;

/// Filter phases per coefficient table
pub const COEF_PHASES: usize = 16;

/// Taps per phase
pub const COEF_TAPS: usize = 4;

/// Sum of the taps of every phase
pub const COEF_UNITY: i32 = 64;

/// Decimation and fractional step for one axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisStep {
    pub decimation: u32,
    pub step: u32,
}

/// Full scaler programming for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleParams {
    pub src: (u32, u32),
    pub dst: (u32, u32),
    pub horizontal: AxisStep,
    pub vertical: AxisStep,
}

/// Compute the step pair for scaling `src` samples down to `dst`.
///
/// Callers must have checked `dst <= src` and both non-zero.
pub fn calc_step(src: u32, dst: u32) -> AxisStep {
    let mut decimation = 0;
    let mut reduced = src;
    while reduced / dst > MAX_FRACTIONAL_RATIO
        || (reduced / dst == MAX_FRACTIONAL_RATIO && reduced % dst != 0)
    {
        decimation += 1;
        reduced = src / (decimation + 1);
    }
    let step = (reduced as u64 * STEP_UNIT / dst as u64) as u32;
    AxisStep { decimation, step }
}

/// Plan scaling from `src` to `dst`.
///
/// Rejects any upscale, and any downscale whose decimation does not fit the
/// 4-bit SCALE_DEC fields.
pub fn plan(src: (u32, u32), dst: (u32, u32)) -> Result<ScaleParams, RegError> {
    if src.0 == 0 || src.1 == 0 || dst.0 == 0 || dst.1 == 0 {
        return Err(RegError::ZeroExtent);
    }
    if dst.0 > src.0 || dst.1 > src.1 {
        return Err(RegError::ScaleRejected { src, dst });
    }
    let horizontal = calc_step(src.0, dst.0);
    let vertical = calc_step(src.1, dst.1);
    let decimation = horizontal.decimation.max(vertical.decimation);
    if decimation > MAX_DECIMATION {
        return Err(RegError::DecimationOverflow {
            src,
            dst,
            decimation,
            max: MAX_DECIMATION,
        });
    }
    Ok(ScaleParams {
        src,
        dst,
        horizontal,
        vertical,
    })
}

/// Taps for phase `phase` of a triangular kernel `half_width` samples wide,
/// normalised to [`COEF_UNITY`]
fn tent_taps(phase: usize, half_width: i32) -> [i32; COEF_TAPS] {
    let phases = COEF_PHASES as i32;
    let p = phase as i32;
    let mut raw = [0i32; COEF_TAPS];
    for (k, tap) in raw.iter_mut().enumerate() {
        let pos = (k as i32 - 1) * phases;
        let dist = (pos - p).abs();
        *tap = (half_width * phases - dist).max(0);
    }
    let sum: i32 = raw.iter().sum();
    let mut taps = raw.map(|w| (w * COEF_UNITY + sum / 2) / sum);
    let residue = COEF_UNITY - taps.iter().sum::<i32>();
    if residue != 0 {
        let mut peak = 0;
        for k in 1..COEF_TAPS {
            if taps[k] > taps[peak] {
                peak = k;
            }
        }
        taps[peak] += residue;
    }
    taps
}

fn pack(taps: [i32; COEF_TAPS]) -> u32 {
    taps.iter()
        .enumerate()
        .fold(0u32, |word, (k, &t)| word | ((t as i8 as u8 as u32) << (8 * k)))
}

fn table(half_width: i32) -> [u32; COEF_PHASES] {
    let mut words = [0u32; COEF_PHASES];
    for (phase, word) in words.iter_mut().enumerate() {
        *word = pack(tent_taps(phase, half_width));
    }
    words
}

/// Interpolation table (linear, 2-tap support)
pub fn zoom_coefficients() -> [u32; COEF_PHASES] {
    table(1)
}

/// Anti-alias table for downscaling (4-tap support)
pub fn scale_coefficients() -> [u32; COEF_PHASES] {
    table(2)
}

/// Unpack one table word into signed taps
pub fn unpack(word: u32) -> [i32; COEF_TAPS] {
    let mut taps = [0; COEF_TAPS];
    for (k, tap) in taps.iter_mut().enumerate() {
        *tap = (word >> (8 * k)) as u8 as i8 as i32;
    }
    taps
}
