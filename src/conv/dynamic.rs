//! Per-call input quantization: one affine scale/zero for the whole tensor, or
//! one symmetric scale per batch element for dense 1x1 shapes.

use crate::backend::KernelCaps;
use crate::conv::up_div;
use rayon::prelude::*;

/// Below this range the input is treated as constant.
pub const DEGENERATE_RANGE: f32 = 1e-7;

/// Fewer elements per chunk than this and the scan stays on one thread.
const MIN_CHUNK: usize = 9;

/// Affine parameters chosen for one tensor: `q = round(x * scale + zero)`,
/// `x ≈ (q - zero) * dequant`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputQuant {
    pub scale: f32,
    pub zero: f32,
    pub dequant: f32,
}

impl InputQuant {
    /// Parameters for an observed `[min, max]` range mapped onto `[-128, 127]`.
    pub fn from_range(min: f32, max: f32) -> Self {
        let range = max - min;
        if range.abs() < DEGENERATE_RANGE {
            // constant input: map it onto +-1 so it dequantizes exactly
            let m = max.abs();
            if m < DEGENERATE_RANGE {
                return Self { scale: 1.0, zero: 0.0, dequant: 1.0 };
            }
            return Self { scale: 1.0 / m, zero: 0.0, dequant: m };
        }
        let scale = 255.0 / range;
        let zero = (-min * 255.0 / range).round() - 128.0;
        Self { scale, zero, dequant: range / 255.0 }
    }
}

/// `(threads, elements per chunk)` for scanning `n` values.
pub fn chunk_plan(n: usize, threads: usize) -> (usize, usize) {
    let threads = threads.max(1);
    let count = up_div(n.max(1), threads);
    if count < MIN_CHUNK {
        return (1, n.max(1));
    }
    let count = up_div(n, up_div(n, count).min(threads));
    (up_div(n, count), count)
}

/// Scans `src` for its range, derives the affine parameters and writes the
/// quantized tensor into `dst`. `partials` needs `2 * threads` slots.
///
/// With `include_zero` the range is widened to contain 0 so that the zero
/// point is a valid int8 and padded taps dequantize to exactly 0.
pub fn single_quant(caps: &KernelCaps, src: &[f32], dst: &mut [i8], threads: usize, partials: &mut [f32], include_zero: bool) -> InputQuant {
    let (need, count) = chunk_plan(src.len(), threads);
    let partials = &mut partials[..2 * need];
    if need == 1 {
        let (lo, hi) = (caps.min_max)(src);
        partials[0] = lo;
        partials[1] = hi;
    } else {
        partials.par_chunks_mut(2).zip(src.par_chunks(count)).for_each(|(p, chunk)| {
            let (lo, hi) = (caps.min_max)(chunk);
            p[0] = lo;
            p[1] = hi;
        });
    }
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for p in partials.chunks_exact(2) {
        lo = lo.min(p[0]);
        hi = hi.max(p[1]);
    }
    if src.is_empty() { lo = 0.0; hi = 0.0; }
    if include_zero { lo = lo.min(0.0); hi = hi.max(0.0); }
    let q = InputQuant::from_range(lo, hi);
    let quantize = caps.quantize;
    dst[..src.len()].par_chunks_mut(count).zip(src.par_chunks(count)).for_each(|(d, s)| quantize(s, d, q.scale, q.zero, -128, 127));
    q
}

/// Symmetric quantization with one scale per batch element.
///
/// `src` holds `batch` rows of `channels` values. Channel ranges are scanned in
/// parallel into `partials` (`threads * batch` slots), reduced serially, and the
/// dequant scale of every row is written to `dequant`.
pub fn batch_quant(
    caps: &KernelCaps,
    src: &[f32],
    batch: usize,
    channels: usize,
    dst: &mut [i8],
    threads: usize,
    partials: &mut [f32],
    dequant: &mut [f32],
) {
    let threads = threads.clamp(1, channels.max(1));
    let per = up_div(channels, threads);
    let abs_max = caps.abs_max;
    partials[..threads * batch].par_chunks_mut(batch).enumerate().for_each(|(t, part)| {
        let c0 = (t * per).min(channels);
        let c1 = ((t + 1) * per).min(channels);
        for (b, slot) in part.iter_mut().enumerate() {
            *slot = abs_max(&src[b * channels + c0..b * channels + c1]);
        }
    });
    for b in 0..batch {
        let amax = (0..threads).map(|t| partials[t * batch + b]).fold(0.0f32, f32::max);
        partials[b] = amax;
    }
    let amax = &partials[..batch];
    let quantize = caps.quantize;
    dst[..batch * channels]
        .par_chunks_mut(channels)
        .zip(src.par_chunks(channels))
        .zip(dequant[..batch].par_iter_mut())
        .enumerate()
        .for_each(|(b, ((d, s), dq))| {
            let (scale, inv) = if amax[b] < DEGENERATE_RANGE { (1.0, 1.0) } else { (127.0 / amax[b], amax[b] / 127.0) };
            quantize(s, d, scale, 0.0, -128, 127);
            *dq = inv;
        });
}
