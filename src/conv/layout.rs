//! Weight layout transform: `[oc][ic][kernel area]` row-major weights into the
//! `[block][oc tiles][blockL][UNIT][SRC_UNIT]` tiles read by the gemm kernels.
//!
//! Two strategies exist, picked from the capability table: when the reduction
//! tile is wider than the channel pack, channels are grouped by pack and kernel
//! taps are interleaved into the reduction tile; otherwise channels are grouped
//! straight into reduction tiles and kernel taps form the outer loop. Im2col uses
//! the same mapping so that gathered columns line up with packed rows.

use crate::backend::{ActBits, KernelCaps};
use crate::conv::up_div;

pub trait WeightLayout: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;
    fn src_unit(&self) -> usize;
    /// Number of reduction tiles covering `ic * kernel area`, padding included.
    fn kernel_count_unit(&self) -> usize;
    /// Position on the padded reduction axis of input channel `ic` at kernel tap `k`.
    fn reduction_index(&self, ic: usize, k: usize) -> usize;
}

/// `SRC_UNIT > pack`: channels grouped by pack, then kernel taps, then reduction tiles.
#[derive(Debug, Clone, Copy)]
pub struct PackGrouped {
    pack: usize,
    src_unit: usize,
    ic_div: usize,
    kernel_count: usize,
}

impl PackGrouped {
    pub fn new(pack: usize, src_unit: usize, ic: usize, kernel_count: usize) -> Self {
        debug_assert!(src_unit % pack == 0);
        Self { pack, src_unit, ic_div: up_div(ic, pack), kernel_count }
    }
}

impl WeightLayout for PackGrouped {
    fn name(&self) -> &'static str { "pack-grouped" }
    fn src_unit(&self) -> usize { self.src_unit }
    fn kernel_count_unit(&self) -> usize { up_div(self.ic_div * self.kernel_count, self.src_unit / self.pack) }
    fn reduction_index(&self, ic: usize, k: usize) -> usize {
        (k * self.ic_div + ic / self.pack) * self.pack + ic % self.pack
    }
}

/// `SRC_UNIT <= pack`: channels grouped directly by reduction tile.
#[derive(Debug, Clone, Copy)]
pub struct TileDirect {
    src_unit: usize,
    ic_div: usize,
    kernel_count: usize,
}

impl TileDirect {
    pub fn new(src_unit: usize, ic: usize, kernel_count: usize) -> Self {
        Self { src_unit, ic_div: up_div(ic, src_unit), kernel_count }
    }
}

impl WeightLayout for TileDirect {
    fn name(&self) -> &'static str { "tile-direct" }
    fn src_unit(&self) -> usize { self.src_unit }
    fn kernel_count_unit(&self) -> usize { self.ic_div * self.kernel_count }
    fn reduction_index(&self, ic: usize, k: usize) -> usize {
        (ic / self.src_unit + k * self.ic_div) * self.src_unit + ic % self.src_unit
    }
}

pub fn layout_for(caps: &KernelCaps, ic: usize, kernel_count: usize) -> Box<dyn WeightLayout> {
    let pack = caps.layout_pack();
    let src_unit = caps.gemm.src_unit;
    if src_unit > pack {
        Box::new(PackGrouped::new(pack, src_unit, ic, kernel_count))
    } else {
        Box::new(TileDirect::new(src_unit, ic, kernel_count))
    }
}

/// Reduction index for every `(k, ic)` pair, laid out `[k][ic]`.
pub fn reduction_map(layout: &dyn WeightLayout, ic: usize, kernel_count: usize) -> Vec<usize> {
    let mut out = Vec::with_capacity(ic * kernel_count);
    for k in 0..kernel_count {
        for y in 0..ic { out.push(layout.reduction_index(y, k)); }
    }
    out
}

/// Geometry of a packed weight tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedDims {
    pub blocks: usize,
    pub oc_tiles: usize,
    /// Reduction tiles per block.
    pub block_l: usize,
    pub unit: usize,
    pub src_unit: usize,
}

impl PackedDims {
    pub fn tile_elems(&self) -> usize { self.unit * self.src_unit }
    pub fn elems(&self) -> usize { self.blocks * self.oc_tiles * self.block_l * self.tile_elems() }

    pub fn bytes(&self, bits: ActBits) -> usize {
        match bits { ActBits::Eight => self.elems(), ActBits::Four => self.elems() / 2 }
    }

    /// Bytes between consecutive output-channel tiles inside a block.
    pub fn tile_stride(&self, bits: ActBits) -> usize {
        let e = self.block_l * self.tile_elems();
        match bits { ActBits::Eight => e, ActBits::Four => e / 2 }
    }

    /// Bytes between consecutive blocks.
    pub fn block_stride(&self, bits: ActBits) -> usize { self.oc_tiles * self.tile_stride(bits) }

    /// Element index of output channel `oc` at reduction position `r`.
    pub fn element_index(&self, oc: usize, r: usize) -> usize {
        let lu = r / self.src_unit;
        let s = r % self.src_unit;
        let block = lu / self.block_l;
        let bl = lu % self.block_l;
        ((block * self.oc_tiles + oc / self.unit) * self.block_l + bl) * self.tile_elems() + (oc % self.unit) * self.src_unit + s
    }
}

/// Reorders `src` (`[oc][ic][kernel_count]`, int8 values) into packed tiles.
pub fn reorder_weight(layout: &dyn WeightLayout, src: &[i8], oc: usize, ic: usize, kernel_count: usize, dims: &PackedDims) -> Vec<i8> {
    let mut dst = vec![0i8; dims.elems()];
    for k in 0..kernel_count {
        for y in 0..ic {
            let r = layout.reduction_index(y, k);
            for x in 0..oc {
                dst[dims.element_index(x, r)] = src[(x * ic + y) * kernel_count + k];
            }
        }
    }
    dst
}

/// Expands source int4 storage (two per byte, high nibble first, stored `+8`) to int8 values in `[-8, 7]`.
pub fn expand_int4_source(raw: &[u8], count: usize) -> Vec<i8> {
    (0..count).map(|i| source_nibble(raw, i) as i8 - 8).collect()
}

#[inline]
pub fn source_nibble(raw: &[u8], i: usize) -> u8 {
    let b = raw[i / 2];
    if i % 2 == 0 { b >> 4 } else { b & 0x0f }
}

/// Packs tiled int4 values: byte `j` holds entry `2j` in the high nibble and
/// `2j+1` in the low nibble, each stored `+8`.
pub fn pack_int4(tiled: &[i8]) -> Vec<u8> {
    debug_assert!(tiled.len() % 2 == 0);
    tiled.chunks_exact(2).map(|p| (((p[0] + 8) as u8) << 4) | ((p[1] + 8) as u8)).collect()
}

/// Inverse of [`pack_int4`].
pub fn unpack_int4(packed: &[u8]) -> Vec<i8> {
    let mut out = Vec::with_capacity(packed.len() * 2);
    for &b in packed {
        out.push((b >> 4) as i8 - 8);
        out.push((b & 0x0f) as i8 - 8);
    }
    out
}

/// Whether source int4 nibbles can be written straight into packed tiles.
pub fn can_pack_int4_direct(oc: usize, ic: usize, kernel_count: usize, unit: usize, src_unit: usize) -> bool {
    kernel_count == 1 && oc % unit == 0 && ic % src_unit == 0
}

/// Packs source int4 storage without expanding it to int8 first. Only valid
/// when [`can_pack_int4_direct`] holds; the result equals
/// `pack_int4(reorder_weight(expand_int4_source(..)))`.
pub fn pack_int4_direct(layout: &dyn WeightLayout, raw: &[u8], oc: usize, ic: usize, dims: &PackedDims) -> Vec<u8> {
    let mut dst = vec![0x88u8; dims.elems() / 2];
    for x in 0..oc {
        for y in 0..ic {
            let n = source_nibble(raw, x * ic + y);
            let e = dims.element_index(x, layout.reduction_index(y, 0));
            let b = &mut dst[e / 2];
            *b = if e % 2 == 0 { (*b & 0x0f) | (n << 4) } else { (*b & 0xf0) | n };
        }
    }
    dst
}

/// Stored integer of packed element `e`; int4 entries come back as raw nibbles `0..=15`.
#[inline]
pub fn packed_value(packed: &[u8], bits: ActBits, e: usize) -> i32 {
    match bits {
        ActBits::Eight => packed[e] as i8 as i32,
        ActBits::Four => {
            let b = packed[e / 2];
            (if e % 2 == 0 { b >> 4 } else { b & 0x0f }) as i32
        }
    }
}
