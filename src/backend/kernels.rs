//! Portable scalar kernels filling every slot of the capability table.
//! Vectorized variants plug into the same function-pointer signatures.

use super::GemmUnit;

/// Last-block output step: activation clamp, optionally followed by int8 requantization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Finalize {
    Float { min: f32, max: f32 },
    /// `q = round(v * inv_scale + zero)` clamped to `[min, max]`; stored as an integral f32.
    Int8 { inv_scale: f32, zero: f32, min: f32, max: f32 },
}

impl Finalize {
    #[inline]
    pub fn apply(self, v: f32) -> f32 {
        match self {
            Finalize::Float { min, max } => v.max(min).min(max),
            Finalize::Int8 { inv_scale, zero, min, max } => (v * inv_scale + zero).round().max(min).min(max),
        }
    }
}

/// Fused post-treatment of one gemm call. Channel-indexed slices start at the
/// first channel handled by the call; position-indexed slices at its first column.
#[derive(Debug, Clone, Copy)]
pub struct PostTreat<'a> {
    pub scale: &'a [f32],
    /// Present on the first block only; overwrites the destination instead of accumulating.
    pub bias: Option<&'a [f32]>,
    pub weight_quant_bias: Option<&'a [f32]>,
    pub src_sum: Option<&'a [f32]>,
    /// Per-position input scale (batch quantization).
    pub extra_scale: Option<&'a [f32]>,
    /// Present on the last block only.
    pub finalize: Option<Finalize>,
}

#[derive(Debug, Clone, Copy)]
pub struct GemmArgs<'a> {
    pub unit: GemmUnit,
    /// Reduction tiles consumed by this call.
    pub depth_quad: usize,
    pub oc_count: usize,
    /// Bytes between consecutive output-channel tiles of the weight.
    pub weight_tile_stride: usize,
    pub real_count: usize,
    pub post: PostTreat<'a>,
}

#[inline]
pub fn dot_i8(w_row: &[u8], x: &[i8]) -> i32 {
    let mut acc: i32 = 0;
    for i in 0..w_row.len() { acc += (w_row[i] as i8 as i32) * (x[i] as i32); }
    acc
}

#[inline]
fn post_treat(dst: &mut [f32], dst_stride: usize, oc: usize, x: usize, acc: i32, post: &PostTreat<'_>) {
    let mut v = acc as f32 * post.scale[oc];
    if let Some(es) = post.extra_scale { v *= es[x]; }
    if let (Some(wb), Some(ss)) = (post.weight_quant_bias, post.src_sum) { v += wb[oc] * ss[x]; }
    let slot = &mut dst[oc * dst_stride + x];
    match post.bias {
        Some(b) => *slot = v + b[oc],
        None => *slot += v,
    }
    if let Some(f) = post.finalize { *slot = f.apply(*slot); }
}

/// `dst[oc][x] (+)= post(Σ w[oc][l] * src[l][x])` over one quantization block.
///
/// `src` is one im2col chunk laid out `[depth_quad][dst_xunit][src_unit]`;
/// `weight` is `[oc tiles][depth_quad][unit][src_unit]` with tile stride
/// `weight_tile_stride`.
pub fn gemm_int8(dst: &mut [f32], dst_stride: usize, src: &[i8], weight: &[u8], args: &GemmArgs<'_>) {
    let GemmUnit { unit, src_unit, dst_xunit } = args.unit;
    let oc_tiles = (args.oc_count + unit - 1) / unit;
    for t in 0..oc_tiles {
        let w_tile = &weight[t * args.weight_tile_stride..];
        for i in 0..unit {
            let oc = t * unit + i;
            if oc >= args.oc_count { break; }
            for x in 0..args.real_count {
                let mut acc = 0i32;
                for u in 0..args.depth_quad {
                    let w_row = &w_tile[(u * unit + i) * src_unit..][..src_unit];
                    let s_row = &src[(u * dst_xunit + x) * src_unit..][..src_unit];
                    acc += dot_i8(w_row, s_row);
                }
                post_treat(dst, dst_stride, oc, x, acc, &args.post);
            }
        }
    }
}

/// Same as [`gemm_int8`] with two weights per byte: even tile element in the
/// high nibble, odd in the low nibble, both read unsigned (the `-8` storage
/// bias is carried by `weight_quant_bias`).
pub fn gemm_int4(dst: &mut [f32], dst_stride: usize, src: &[i8], weight: &[u8], args: &GemmArgs<'_>) {
    let GemmUnit { unit, src_unit, dst_xunit } = args.unit;
    let oc_tiles = (args.oc_count + unit - 1) / unit;
    for t in 0..oc_tiles {
        let w_tile = &weight[t * args.weight_tile_stride..];
        for i in 0..unit {
            let oc = t * unit + i;
            if oc >= args.oc_count { break; }
            for x in 0..args.real_count {
                let mut acc = 0i32;
                for u in 0..args.depth_quad {
                    let base = (u * unit + i) * src_unit;
                    let s_row = &src[(u * dst_xunit + x) * src_unit..][..src_unit];
                    for s in 0..src_unit {
                        let e = base + s;
                        let b = w_tile[e / 2];
                        let n = if e % 2 == 0 { b >> 4 } else { b & 0x0f };
                        acc += n as i32 * s_row[s] as i32;
                    }
                }
                post_treat(dst, dst_stride, oc, x, acc, &args.post);
            }
        }
    }
}

/// `q = round(x * scale + zero)` clamped to `[min, max]`, rounding half away from zero.
pub fn quantize_f32_to_i8(src: &[f32], dst: &mut [i8], scale: f32, zero: f32, min: i8, max: i8) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = (s * scale + zero).round().max(min as f32).min(max as f32) as i8;
    }
}

pub fn count_min_max(src: &[f32]) -> (f32, f32) {
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for &v in src {
        if v < lo { lo = v; }
        if v > hi { hi = v; }
    }
    (lo, hi)
}

pub fn abs_max(src: &[f32]) -> f32 { src.iter().fold(0.0f32, |acc, v| acc.max(v.abs())) }

pub fn identity_f32(v: f32) -> f32 { v }

pub fn round_to_f16(v: f32) -> f32 { half::f16::from_f32(v).to_f32() }

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> GemmUnit { GemmUnit { unit: 2, src_unit: 4, dst_xunit: 2 } }

    fn post(scale: &[f32]) -> PostTreat<'_> {
        PostTreat { scale, bias: None, weight_quant_bias: None, src_sum: None, extra_scale: None, finalize: None }
    }

    #[test]
    fn gemm_int8_matches_naive_dot() {
        // 2 output channels, one reduction tile of 4, 2 positions
        let weight: Vec<u8> = [1i8, 2, 3, 4, -1, -2, -3, -4].iter().map(|&v| v as u8).collect();
        let src: Vec<i8> = vec![1, 1, 1, 1, 2, 0, 0, 1];
        let scale = [1.0f32, 0.5];
        let zero_bias = [0.0f32, 0.0];
        let mut p = post(&scale);
        p.bias = Some(&zero_bias);
        let args = GemmArgs { unit: unit(), depth_quad: 1, oc_count: 2, weight_tile_stride: 8, real_count: 2, post: p };
        let mut dst = vec![0f32; 4];
        gemm_int8(&mut dst, 2, &src, &weight, &args);
        assert_eq!(dst, vec![10.0, 6.0, -5.0, -3.0]);
    }

    #[test]
    fn gemm_int4_reads_unsigned_nibbles() {
        // tile elements 0..8 = [9,10,11,12, 7,7,7,7]
        let weight = vec![0x9a, 0xbc, 0x77, 0x77];
        let src: Vec<i8> = vec![1, 0, 0, 1, 0, 0, 0, 0];
        let scale = [1.0f32, 1.0];
        let args = GemmArgs { unit: unit(), depth_quad: 1, oc_count: 2, weight_tile_stride: 4, real_count: 1, post: post(&scale) };
        let mut dst = vec![0f32; 4];
        gemm_int4(&mut dst, 2, &src, &weight, &args);
        assert_eq!(dst[0], 21.0);
        assert_eq!(dst[2], 14.0);
    }

    #[test]
    fn finalize_clamps_and_requantizes() {
        assert_eq!(Finalize::Float { min: 0.0, max: 6.0 }.apply(7.5), 6.0);
        assert_eq!(Finalize::Float { min: 0.0, max: 6.0 }.apply(-1.0), 0.0);
        let q = Finalize::Int8 { inv_scale: 10.0, zero: 3.0, min: -128.0, max: 127.0 };
        assert_eq!(q.apply(1.25), 16.0);
        assert_eq!(q.apply(100.0), 127.0);
    }

    #[test]
    fn quantize_rounds_half_away_from_zero() {
        let mut out = [0i8; 4];
        quantize_f32_to_i8(&[0.5, -0.5, 1000.0, -1000.0], &mut out, 1.0, 0.0, -128, 127);
        assert_eq!(out, [1, -1, 127, -128]);
    }

    #[test]
    fn min_max_and_abs_max() {
        assert_eq!(count_min_max(&[3.0, -2.0, 5.5]), (-2.0, 5.5));
        assert_eq!(abs_max(&[3.0, -7.0, 5.5]), 7.0);
        assert_eq!(abs_max(&[]), 0.0);
    }
}
