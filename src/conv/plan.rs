//! Tiling and thread partitioning, redone on every resize, plus the im2col
//! gather that feeds one tile chunk to the gemm kernels.

use crate::backend::{GemmUnit, KernelCaps};
use crate::conv::resource::WeightResource;
use crate::conv::{up_div, ConvShape};
use crate::error::{ConvError, Result};
use crate::tensor::Shape;
use log::debug;

/// Bytes of im2col data one tile may occupy.
pub const L2_CACHE_BUDGET: usize = 2048;

/// Convolution geometry seen by im2col.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Im2ColParams {
    pub batch: usize,
    pub ic: usize,
    pub ih: usize,
    pub iw: usize,
    pub oh: usize,
    pub ow: usize,
    pub kernel_x: usize,
    pub kernel_y: usize,
    pub stride_x: usize,
    pub stride_y: usize,
    pub dilate_x: usize,
    pub dilate_y: usize,
    pub pad_x: usize,
    pub pad_y: usize,
}

impl Im2ColParams {
    pub fn new(shape: &ConvShape, input: Shape, oh: usize, ow: usize) -> Self {
        Self {
            batch: input.batch,
            ic: input.channel,
            ih: input.height,
            iw: input.width,
            oh,
            ow,
            kernel_x: shape.kernel_x,
            kernel_y: shape.kernel_y,
            stride_x: shape.stride_x,
            stride_y: shape.stride_y,
            dilate_x: shape.dilate_x,
            dilate_y: shape.dilate_y,
            pad_x: shape.pad_x,
            pad_y: shape.pad_y,
        }
    }

    /// Output positions over the whole batch.
    pub fn plane(&self) -> usize { self.batch * self.oh * self.ow }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    /// Threads own contiguous ranges of spatial tiles.
    Plane,
    /// Threads own contiguous ranges of output channels; tiles are gathered once up front.
    Channel,
}

/// `divide[i+1] = min((i+1) * ceil(total/threads), total)`; thread `i` owns `[divide[i], divide[i+1])`.
pub fn compute_divides(total: usize, threads: usize) -> Vec<usize> {
    let step = up_div(total, threads.max(1));
    let mut divides = vec![0usize; threads + 1];
    for i in 0..threads { divides[i + 1] = ((i + 1) * step).min(total); }
    divides
}

#[derive(Debug, Clone, PartialEq)]
pub struct TilingPlan {
    pub input: Shape,
    pub output: Shape,
    pub im2col: Im2ColParams,
    pub gemm: GemmUnit,
    pub threads: usize,
    pub split: SplitMode,
    pub tile_limit: usize,
    /// Kernel-width chunks per tile.
    pub im2col_count: usize,
    pub tile_count: usize,
    /// Positions per tile (`dst_xunit * im2col_count`).
    pub tile_width: usize,
    /// Tile ranges (plane split) or channel ranges in `oc_pack` units (channel split).
    pub divides: Vec<usize>,
    pub oc_pack: usize,
    /// im2col bytes of one chunk.
    pub chunk_bytes: usize,
    /// Channel rows of one staged tile.
    pub staging_channels: usize,
    /// f32 slots of one thread's output staging.
    pub staging_len: usize,
    pub use_batch_quant: bool,
}

impl TilingPlan {
    pub fn new(res: &WeightResource, caps: &KernelCaps, input: Shape, output: Shape, threads: usize, batch_quant: bool) -> Result<Self> {
        let shape = &res.shape;
        if input.is_empty() {
            return Err(ConvError::Config(format!("empty input {:?}", input.dims())));
        }
        if input.channel != shape.in_channels {
            return Err(ConvError::ShapeMismatch {
                expected: vec![input.batch, shape.in_channels, input.height, input.width],
                actual: input.dims(),
            });
        }
        let (oh, ow) = shape
            .output_hw(input.height, input.width)
            .ok_or_else(|| ConvError::Config(format!("kernel does not fit input {}x{}", input.height, input.width)))?;
        let expected = Shape::new(input.batch, shape.out_channels, oh, ow);
        if expected != output {
            return Err(ConvError::ShapeMismatch { expected: expected.dims(), actual: output.dims() });
        }

        let threads = threads.max(1);
        let gemm = res.gemm;
        let im2col = Im2ColParams::new(shape, input, oh, ow);
        let plane = im2col.plane();
        let kcu = res.kernel_count_unit;
        let tile_limit_by_c = up_div(L2_CACHE_BUDGET, kcu * gemm.src_unit);

        let (split, tile_limit) = if threads < plane {
            (SplitMode::Plane, tile_limit_by_c.min(up_div(plane, threads)))
        } else {
            (SplitMode::Channel, tile_limit_by_c.min(plane))
        };
        let im2col_count = up_div(tile_limit, gemm.dst_xunit);
        let tile_width = gemm.dst_xunit * im2col_count;
        let tile_count = up_div(plane, tile_width);

        let oc = shape.out_channels;
        let pack = caps.pack;
        let (divides, staging_channels, staging_len) = match split {
            SplitMode::Plane => {
                let divides = compute_divides(tile_count, threads);
                let most = divides.windows(2).map(|w| w[1] - w[0]).max().unwrap_or(0);
                (divides, res.oc_up, most * res.oc_up * tile_width)
            }
            SplitMode::Channel => {
                let divides = if gemm.unit > pack {
                    // balance whole kernel tiles, then express them in pack units
                    let part = gemm.unit / pack;
                    compute_divides(up_div(oc, gemm.unit), threads).into_iter().map(|d| d * part).collect()
                } else {
                    compute_divides(up_div(oc, pack), threads)
                };
                let most = divides.windows(2).map(|w| w[1] - w[0]).max().unwrap_or(0);
                (divides, most * pack, tile_count * most * pack * tile_width)
            }
        };

        let use_batch_quant = batch_quant
            && shape.kernel_area() == 1
            && shape.stride_x == 1
            && shape.stride_y == 1
            && shape.pad_x == 0
            && shape.pad_y == 0
            && oh == 1
            && ow == 1
            && input.height == oh
            && input.width == ow
            && input.batch > 1;

        debug!(
            "tiling plan: split={:?} threads={} plane={} tile_limit={} im2col_count={} tiles={} batch_quant={}",
            split, threads, plane, tile_limit, im2col_count, tile_count, use_batch_quant
        );
        Ok(Self {
            input,
            output,
            im2col,
            gemm,
            threads,
            split,
            tile_limit,
            im2col_count,
            tile_count,
            tile_width,
            divides,
            oc_pack: pack,
            chunk_bytes: kcu * gemm.dst_xunit * gemm.src_unit,
            staging_channels,
            staging_len,
            use_batch_quant,
        })
    }

    pub fn plane(&self) -> usize { self.im2col.plane() }

    /// im2col bytes of one tile.
    pub fn tile_bytes(&self) -> usize { self.im2col_count * self.chunk_bytes }

    /// Tiles whose gather buffers live at once: one per thread, or every tile when split by channel.
    pub fn gather_slots(&self) -> usize {
        match self.split { SplitMode::Plane => self.threads, SplitMode::Channel => self.tile_count }
    }

    /// `(first position, positions)` of tile `t`.
    pub fn tile_range(&self, t: usize) -> (usize, usize) {
        let start = t * self.tile_width;
        (start, self.tile_width.min(self.plane() - start))
    }

    /// `(first channel, channels)` owned by thread `t` under channel split.
    pub fn channel_range(&self, t: usize, oc: usize) -> (usize, usize) {
        let start = (self.divides[t] * self.oc_pack).min(oc);
        let end = (self.divides[t + 1] * self.oc_pack).min(oc);
        (start, end - start)
    }

    /// Named scratch requests in bytes, as acquired from the buffer pool.
    pub fn scratch_requests(&self, res: &WeightResource) -> Vec<(&'static str, usize)> {
        let f = std::mem::size_of::<f32>();
        let batch = self.input.batch;
        let mut out = vec![("quantized input", self.input.len())];
        if self.use_batch_quant {
            out.push(("batch abs-max", (self.threads * batch + batch) * f));
        } else {
            out.push(("min/max partials", 2 * self.threads * f));
        }
        out.push(("im2col", self.gather_slots() * self.tile_bytes()));
        out.push(("source sum", self.gather_slots() * res.block_count * self.tile_width * f));
        out.push(("output staging", self.threads * self.staging_len * f));
        out.push(("fused scale/bias", (res.block_count + 1) * res.oc_up * f));
        out
    }
}

/// Gathers positions `[start, start + real)` into one chunk laid out
/// `[reduction tile][dst_xunit][src_unit]`. Reduction padding stays 0;
/// spatially out-of-bounds taps take the input zero point.
pub fn im2col(dst: &mut [i8], src: &[i8], p: &Im2ColParams, map: &[usize], gemm: GemmUnit, start: usize, real: usize, zero: i8) {
    dst.fill(0);
    let area = p.oh * p.ow;
    let GemmUnit { src_unit, dst_xunit, .. } = gemm;
    for x in 0..real {
        let pos = start + x;
        let b = pos / area;
        let oy = (pos % area) / p.ow;
        let ox = pos % p.ow;
        for ky in 0..p.kernel_y {
            let iy = (oy * p.stride_y + ky * p.dilate_y) as isize - p.pad_y as isize;
            for kx in 0..p.kernel_x {
                let ix = (ox * p.stride_x + kx * p.dilate_x) as isize - p.pad_x as isize;
                let inside = iy >= 0 && (iy as usize) < p.ih && ix >= 0 && (ix as usize) < p.iw;
                let k = ky * p.kernel_x + kx;
                for y in 0..p.ic {
                    let r = map[k * p.ic + y];
                    let v = if inside { src[((b * p.ic + y) * p.ih + iy as usize) * p.iw + ix as usize] } else { zero };
                    dst[((r / src_unit) * dst_xunit + x) * src_unit + r % src_unit] = v;
                }
            }
        }
    }
}

/// `out[x] = scale(x) * Σ q` over reduction tiles `[depth_start, depth_start + depth)` of one chunk.
pub fn source_sum(out: &mut [f32], chunk: &[i8], gemm: GemmUnit, depth_start: usize, depth: usize, real: usize, scale: impl Fn(usize) -> f32) {
    let GemmUnit { src_unit, dst_xunit, .. } = gemm;
    for x in 0..real {
        let mut s = 0i32;
        for u in depth_start..depth_start + depth {
            s += chunk[(u * dst_xunit + x) * src_unit..][..src_unit].iter().map(|&v| v as i32).sum::<i32>();
        }
        out[x] = s as f32 * scale(x);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeapPool;
    use crate::conv::layout::{reduction_map, TileDirect};
    use crate::conv::resource::{QuantMode, QuantizedWeights};
    use std::sync::Arc;

    fn resource(caps: &KernelCaps, oc: usize, ic: usize, k: usize) -> Arc<WeightResource> {
        let w = QuantizedWeights::quantize(&vec![0.5; oc * ic * k * k], oc, 1, false, false);
        WeightResource::build(&w, None, ConvShape::new(oc, ic, k), QuantMode::Dynamic, caps, Arc::new(HeapPool)).unwrap()
    }

    #[test]
    fn divides_are_cumulative_and_capped() {
        assert_eq!(compute_divides(10, 4), vec![0, 3, 6, 9, 10]);
        assert_eq!(compute_divides(2, 4), vec![0, 1, 2, 2, 2]);
    }

    #[test]
    fn large_plane_splits_by_plane() {
        let caps = KernelCaps::scalar();
        let res = resource(&caps, 8, 4, 3);
        let plan = TilingPlan::new(&res, &caps, Shape::new(1, 4, 10, 10), Shape::new(1, 8, 8, 8), 4, false).unwrap();
        assert_eq!(plan.split, SplitMode::Plane);
        // kcu = 9, by_c = ceil(2048/36) = 57, per thread 16
        assert_eq!(plan.tile_limit, 16);
        assert_eq!(plan.im2col_count, 4);
        assert_eq!(plan.tile_count, 4);
        assert_eq!(*plan.divides.last().unwrap(), plan.tile_count);
    }

    #[test]
    fn few_positions_split_by_channel() {
        let caps = KernelCaps::scalar();
        let res = resource(&caps, 16, 4, 1);
        let plan = TilingPlan::new(&res, &caps, Shape::new(1, 4, 1, 2), Shape::new(1, 16, 1, 2), 4, false).unwrap();
        assert_eq!(plan.split, SplitMode::Channel);
        assert_eq!(plan.tile_count, 1);
        assert_eq!(plan.divides, vec![0, 1, 2, 3, 4]);
        assert_eq!(plan.channel_range(2, 16), (8, 4));
    }

    #[test]
    fn wide_kernel_tile_rescales_channel_divides() {
        // avx512: unit 64 over pack 16
        let caps = KernelCaps::avx512();
        let res = resource(&caps, 130, 4, 1);
        let plan = TilingPlan::new(&res, &caps, Shape::new(1, 4, 1, 1), Shape::new(1, 130, 1, 1), 4, false).unwrap();
        assert_eq!(plan.split, SplitMode::Channel);
        assert_eq!(plan.divides, vec![0, 4, 8, 12, 12]);
        assert_eq!(plan.channel_range(0, 130), (0, 64));
        assert_eq!(plan.channel_range(2, 130), (128, 2));
        assert_eq!(plan.channel_range(3, 130), (130, 0));
        for t in 0..3 { assert_eq!(plan.channel_range(t, 130).0 % caps.gemm.unit, 0); }
    }

    #[test]
    fn output_shape_is_checked() {
        let caps = KernelCaps::scalar();
        let res = resource(&caps, 8, 4, 3);
        let err = TilingPlan::new(&res, &caps, Shape::new(1, 4, 10, 10), Shape::new(1, 8, 10, 10), 2, false).unwrap_err();
        assert!(matches!(err, ConvError::ShapeMismatch { .. }));
    }

    #[test]
    fn batch_quant_needs_dense_shape() {
        let caps = KernelCaps::scalar();
        let res = resource(&caps, 8, 4, 1);
        let dense = TilingPlan::new(&res, &caps, Shape::new(3, 4, 1, 1), Shape::new(3, 8, 1, 1), 2, true).unwrap();
        assert!(dense.use_batch_quant);
        let single = TilingPlan::new(&res, &caps, Shape::new(1, 4, 1, 1), Shape::new(1, 8, 1, 1), 2, true).unwrap();
        assert!(!single.use_batch_quant);
        let spatial = TilingPlan::new(&res, &caps, Shape::new(3, 4, 2, 2), Shape::new(3, 8, 2, 2), 2, true).unwrap();
        assert!(!spatial.use_batch_quant);
    }

    #[test]
    fn im2col_fills_border_with_zero_point() {
        // 1 channel 2x2 input, 3x3 kernel, pad 1: position (0,0) sees 4 real taps
        let shape = ConvShape::new(1, 1, 3).with_pad(1);
        let p = Im2ColParams::new(&shape, Shape::new(1, 1, 2, 2), 2, 2);
        let layout = TileDirect::new(4, 1, 9);
        let map = reduction_map(&layout, 1, 9);
        let gemm = GemmUnit { unit: 4, src_unit: 4, dst_xunit: 4 };
        let mut dst = vec![0i8; 9 * 4 * 4];
        im2col(&mut dst, &[1, 2, 3, 4], &p, &map, gemm, 0, 1, -5);
        let col: Vec<i8> = (0..9).map(|k| dst[(map[k] / 4 * 4) * 4 + map[k] % 4]).collect();
        assert_eq!(col, vec![-5, -5, -5, -5, 1, 2, -5, 3, 4]);
        // padded reduction lanes stay zero
        assert_eq!(dst[1], 0);
    }
}
