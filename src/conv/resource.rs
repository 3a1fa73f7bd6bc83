use crate::backend::alloc::{acquire_all, release_all};
use crate::backend::{ActBits, BufferPool, GemmUnit, KernelCaps, Lifetime};
use crate::conv::layout::{self, PackedDims};
use crate::conv::{round_up, up_div, ConvShape};
use crate::error::{ConvError, Result};
use log::debug;
use std::sync::Arc;

/// Already-quantized weights as delivered by the model loader.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedWeights {
    /// `[oc][ic][kernel area]`: one int8 per byte, or with `int4` two values
    /// per byte (high nibble first, each stored `+8`).
    pub weight: Vec<u8>,
    /// Indexed `oc * blocks + block`: scales, or `[zero, scale]` pairs when asymmetric.
    pub alpha: Vec<f32>,
    pub asymmetric: bool,
    pub int4: bool,
}

impl QuantizedWeights {
    /// Quantizes float weights `[oc][l]` block-wise. Symmetric tables use
    /// `absmax / qmax` scales; asymmetric ones map `[min, max]` onto the full
    /// integer range with a float zero.
    pub fn quantize(weights: &[f32], oc: usize, block_count: usize, asymmetric: bool, int4: bool) -> Self {
        let l = weights.len() / oc;
        let bs = l / block_count;
        let (qmin, qmax) = if int4 { (-8i32, 7i32) } else { (-128, 127) };
        let mut values = vec![0i8; oc * l];
        let mut alpha = Vec::with_capacity(oc * block_count * if asymmetric { 2 } else { 1 });
        for j in 0..oc {
            for b in 0..block_count {
                let base = j * l + b * bs;
                let blk = &weights[base..base + bs];
                let (scale, zero) = if asymmetric {
                    let lo = blk.iter().copied().fold(f32::INFINITY, f32::min);
                    let hi = blk.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let scale = if hi > lo { (hi - lo) / (qmax - qmin) as f32 } else { 1.0 };
                    (scale, lo - qmin as f32 * scale)
                } else {
                    let amax = blk.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
                    (if amax > 0.0 { amax / qmax as f32 } else { 1.0 }, 0.0)
                };
                for (i, &w) in blk.iter().enumerate() {
                    values[base + i] = ((w - zero) / scale).round().max(qmin as f32).min(qmax as f32) as i8;
                }
                if asymmetric { alpha.push(zero); }
                alpha.push(scale);
            }
        }
        let weight = if int4 {
            let mut raw = vec![0u8; up_div(values.len(), 2)];
            for (i, &v) in values.iter().enumerate() {
                let n = (v + 8) as u8;
                raw[i / 2] |= if i % 2 == 0 { n << 4 } else { n };
            }
            raw
        } else {
            values.iter().map(|&v| v as u8).collect()
        };
        Self { weight, alpha, asymmetric, int4 }
    }

    /// `(scale, zero)` of table entry `idx`.
    fn entry(&self, idx: usize) -> (f32, f32) {
        if self.asymmetric { (self.alpha[2 * idx + 1], self.alpha[2 * idx]) } else { (self.alpha[idx], 0.0) }
    }

    fn value(&self, idx: usize) -> i32 {
        if self.int4 { layout::source_nibble(&self.weight, idx) as i32 - 8 } else { self.weight[idx] as i8 as i32 }
    }
}

/// Whether input quantization parameters are bound offline or computed per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantMode {
    Offline,
    Dynamic,
}

/// Immutable, build-once weight representation shared by every executor clone.
#[derive(Debug)]
pub struct WeightResource {
    pub shape: ConvShape,
    pub gemm: GemmUnit,
    pub dims: PackedDims,
    pub layout: &'static str,
    pub kernel_count_unit: usize,
    /// `[k][ic]` reduction positions, shared with im2col.
    pub reduction_map: Vec<usize>,
    pub packed: Vec<u8>,
    /// `[block][oc_up]`: `real ≈ scale * stored + bias`.
    pub dequant_scale: Vec<f32>,
    pub dequant_bias: Vec<f32>,
    /// `[block][oc_up]` sums of dequantized weights.
    pub row_sum: Vec<f32>,
    pub bias: Vec<f32>,
    pub oc_up: usize,
    pub block_count: usize,
    pub act_bits: ActBits,
    /// Dequant bias is non-zero, so the kernels need the per-position input sum.
    pub weight_asymmetric: bool,
    pub mode: QuantMode,
    pub relu_threshold: [f32; 2],
    pool: Arc<dyn BufferPool>,
    resident: Vec<(&'static str, usize)>,
}

impl WeightResource {
    pub fn build(
        weights: &QuantizedWeights,
        bias: Option<&[f32]>,
        shape: ConvShape,
        mode: QuantMode,
        caps: &KernelCaps,
        pool: Arc<dyn BufferPool>,
    ) -> Result<Arc<Self>> {
        let oc = shape.out_channels;
        let ic = shape.in_channels;
        let kc = shape.kernel_area();
        if oc == 0 || ic == 0 || kc == 0 {
            return Err(ConvError::Config(format!("empty convolution {}x{}x{}", oc, ic, kc)));
        }
        let l_size = ic * kc;
        let mut dequant_cnt = weights.alpha.len();
        if weights.asymmetric {
            if dequant_cnt % 2 != 0 {
                return Err(ConvError::InvalidQuantTable(format!("asymmetric table has odd length {}", dequant_cnt)));
            }
            dequant_cnt /= 2;
        }
        if dequant_cnt == 0 || dequant_cnt % oc != 0 {
            return Err(ConvError::InvalidQuantTable(format!("{} entries for {} output channels", dequant_cnt, oc)));
        }
        let block_count = dequant_cnt / oc;
        if l_size % block_count != 0 {
            return Err(ConvError::InvalidQuantTable(format!("{} blocks do not divide reduction length {}", block_count, l_size)));
        }
        let expected = if weights.int4 { up_div(oc * l_size, 2) } else { oc * l_size };
        if weights.weight.len() < expected {
            return Err(ConvError::ShapeMismatch { expected: vec![expected], actual: vec![weights.weight.len()] });
        }
        if let Some(b) = bias {
            if b.len() != oc { return Err(ConvError::ShapeMismatch { expected: vec![oc], actual: vec![b.len()] }); }
        }
        if mode == QuantMode::Offline && block_count != 1 {
            return Err(ConvError::Config("offline quantization needs a per-channel weight table".into()));
        }

        let gemm = caps.gemm;
        let layout = layout::layout_for(caps, ic, kc);
        let kcu = layout.kernel_count_unit();
        if block_count > 1 && (kc != 1 || (ic / block_count) % gemm.src_unit != 0) {
            return Err(ConvError::Config(format!(
                "{} blocks need a 1x1 kernel and blocks of whole {}-wide reduction tiles (ic={}, kernel area={})",
                block_count, gemm.src_unit, ic, kc
            )));
        }
        let dims = PackedDims { blocks: block_count, oc_tiles: up_div(oc, gemm.unit), block_l: kcu / block_count, unit: gemm.unit, src_unit: gemm.src_unit };
        let act_bits = if weights.int4 { ActBits::Four } else { ActBits::Eight };
        let oc_up = round_up(oc, caps.pack.max(gemm.unit));

        let resident = vec![
            ("packed weight", dims.bytes(act_bits)),
            ("bias", oc_up * 4),
            ("dequant scale/bias", 2 * block_count * oc_up * 4),
            ("weight row sum", block_count * oc_up * 4),
        ];
        acquire_all(pool.as_ref(), Lifetime::Static, &resident).map_err(ConvError::AllocationFailure)?;

        let mut bias_up = vec![0f32; oc_up];
        if let Some(b) = bias { bias_up[..oc].copy_from_slice(b); }

        // wf = scale * stored + bias; int4 nibbles keep their +8 storage offset
        let offset = if weights.int4 { -8.0f32 } else { 0.0 };
        let mut dequant_scale = vec![0f32; block_count * oc_up];
        let mut dequant_bias = vec![0f32; block_count * oc_up];
        for b in 0..block_count {
            for j in 0..oc {
                let (scale, zero) = weights.entry(j * block_count + b);
                dequant_scale[b * oc_up + j] = scale;
                dequant_bias[b * oc_up + j] = zero + offset * scale;
            }
        }

        let block_size = l_size / block_count;
        let mut row_sum = vec![0f32; block_count * oc_up];
        for j in 0..oc {
            for b in 0..block_count {
                let (scale, zero) = weights.entry(j * block_count + b);
                let base = j * l_size + b * block_size;
                let tmp: i32 = (0..block_size).map(|i| weights.value(base + i)).sum();
                row_sum[b * oc_up + j] = tmp as f32 * scale + block_size as f32 * zero;
            }
        }

        let direct = weights.int4 && layout::can_pack_int4_direct(oc, ic, kc, gemm.unit, gemm.src_unit);
        let packed = match act_bits {
            ActBits::Four if direct => layout::pack_int4_direct(layout.as_ref(), &weights.weight, oc, ic, &dims),
            ActBits::Four => {
                let expanded = layout::expand_int4_source(&weights.weight, oc * l_size);
                layout::pack_int4(&layout::reorder_weight(layout.as_ref(), &expanded, oc, ic, kc, &dims))
            }
            ActBits::Eight => {
                let src: Vec<i8> = weights.weight[..expected].iter().map(|&b| b as i8).collect();
                layout::reorder_weight(layout.as_ref(), &src, oc, ic, kc, &dims).into_iter().map(|v| v as u8).collect()
            }
        };
        debug!(
            "built weight resource: layout={} oc={} ic={} k={} blocks={} bits={} kcu={} packed={}B direct_int4={}",
            layout.name(), oc, ic, kc, block_count, act_bits.bits(), kcu, packed.len(), direct
        );

        let relu_threshold = shape.activation.thresholds().map(caps.to_lowp);
        Ok(Arc::new(Self {
            shape,
            gemm,
            dims,
            layout: layout.name(),
            kernel_count_unit: kcu,
            reduction_map: layout::reduction_map(layout.as_ref(), ic, kc),
            packed,
            dequant_scale,
            dequant_bias,
            row_sum,
            bias: bias_up,
            oc_up,
            block_count,
            act_bits,
            weight_asymmetric: weights.asymmetric || weights.int4,
            mode,
            relu_threshold,
            pool,
            resident,
        }))
    }

    /// Sum of dequantized weights of output channel `c` across all blocks.
    pub fn total_row_sum(&self, c: usize) -> f32 {
        (0..self.block_count).map(|b| self.row_sum[b * self.oc_up + c]).sum()
    }

    /// Reads the packed tensor back through the inverse layout and dequantizes
    /// it into `[oc][ic][kernel area]`.
    pub fn dequantize_weight(&self) -> Vec<f32> {
        let oc = self.shape.out_channels;
        let ic = self.shape.in_channels;
        let kc = self.shape.kernel_area();
        let mut out = vec![0f32; oc * ic * kc];
        for x in 0..oc {
            for k in 0..kc {
                for y in 0..ic {
                    let r = self.reduction_map[k * ic + y];
                    let q = layout::packed_value(&self.packed, self.act_bits, self.dims.element_index(x, r));
                    let b = (r / self.dims.src_unit) / self.dims.block_l;
                    let idx = b * self.oc_up + x;
                    out[(x * ic + y) * kc + k] = self.dequant_scale[idx] * q as f32 + self.dequant_bias[idx];
                }
            }
        }
        out
    }
}

impl Drop for WeightResource {
    fn drop(&mut self) { release_all(self.pool.as_ref(), Lifetime::Static, &self.resident); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BudgetPool, HeapPool};

    fn heap() -> Arc<dyn BufferPool> { Arc::new(HeapPool) }

    #[test]
    fn block_count_from_table_length() {
        let shape = ConvShape::new(2, 8, 1);
        let w = QuantizedWeights { weight: vec![1; 16], alpha: vec![0.1; 8], asymmetric: true, int4: false };
        let res = WeightResource::build(&w, None, shape, QuantMode::Dynamic, &KernelCaps::scalar(), heap()).unwrap();
        assert_eq!(res.block_count, 2);
        assert_eq!(res.row_sum.len(), res.oc_up * 2);
    }

    #[test]
    fn rejects_blocks_not_dividing_reduction() {
        let shape = ConvShape::new(2, 3, 1);
        let w = QuantizedWeights { weight: vec![1; 6], alpha: vec![0.1; 4], asymmetric: false, int4: false };
        let err = WeightResource::build(&w, None, shape, QuantMode::Dynamic, &KernelCaps::scalar(), heap()).unwrap_err();
        assert!(matches!(err, ConvError::InvalidQuantTable(_)), "{:?}", err);
    }

    #[test]
    fn offline_needs_single_block() {
        let shape = ConvShape::new(2, 8, 1);
        let w = QuantizedWeights { weight: vec![1; 16], alpha: vec![0.1; 4], asymmetric: false, int4: false };
        let err = WeightResource::build(&w, None, shape, QuantMode::Offline, &KernelCaps::scalar(), heap()).unwrap_err();
        assert!(matches!(err, ConvError::Config(_)));
    }

    #[test]
    fn int4_symmetric_bias_compensates_storage_offset() {
        let shape = ConvShape::new(1, 4, 1);
        // nibbles 8,9,10,11 => values 0,1,2,3
        let w = QuantizedWeights { weight: vec![0x89, 0xab], alpha: vec![0.5], asymmetric: false, int4: true };
        let res = WeightResource::build(&w, None, shape, QuantMode::Dynamic, &KernelCaps::scalar(), heap()).unwrap();
        assert_eq!(res.dequant_bias[0], -4.0);
        assert!(res.weight_asymmetric);
        assert_eq!(res.total_row_sum(0), 3.0);
        assert_eq!(res.dequantize_weight(), vec![0.0, 0.5, 1.0, 1.5]);
    }

    #[test]
    fn allocation_failure_releases_partial_buffers() {
        let pool = Arc::new(BudgetPool::new(8));
        let shape = ConvShape::new(4, 4, 1);
        let w = QuantizedWeights { weight: vec![1; 16], alpha: vec![0.1; 4], asymmetric: false, int4: false };
        let err = WeightResource::build(&w, None, shape, QuantMode::Dynamic, &KernelCaps::scalar(), pool.clone()).unwrap_err();
        assert!(matches!(err, ConvError::AllocationFailure(_)));
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn drop_returns_resident_bytes() {
        let pool = Arc::new(BudgetPool::new(1 << 20));
        let shape = ConvShape::new(4, 4, 3);
        let w = QuantizedWeights::quantize(&vec![0.25; 4 * 36], 4, 1, false, false);
        let res = WeightResource::build(&w, None, shape, QuantMode::Dynamic, &KernelCaps::sse(), pool.clone()).unwrap();
        assert!(pool.used() > 0);
        drop(res);
        assert_eq!(pool.used(), 0);
    }
}
