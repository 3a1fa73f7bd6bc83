pub mod alloc;
pub mod kernels;

use log::info;
use std::sync::OnceLock;

pub use alloc::{BudgetPool, BufferPool, HeapPool, Lifetime};
pub use kernels::{Finalize, GemmArgs, PostTreat};

/// Register tile of the integer gemm micro-kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmUnit {
    /// Output channels per tile.
    pub unit: usize,
    /// Reduction elements per tile.
    pub src_unit: usize,
    /// Spatial positions per kernel call.
    pub dst_xunit: usize,
}

/// Activation bit-width of the packed weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActBits {
    Eight,
    Four,
}

impl ActBits {
    pub fn bits(self) -> u32 { match self { ActBits::Eight => 8, ActBits::Four => 4 } }
}

pub type GemmKernel = fn(dst: &mut [f32], dst_stride: usize, src: &[i8], weight: &[u8], args: &GemmArgs<'_>);
pub type QuantizeFn = fn(src: &[f32], dst: &mut [i8], scale: f32, zero: f32, min: i8, max: i8);
pub type MinMaxFn = fn(src: &[f32]) -> (f32, f32);
pub type AbsMaxFn = fn(src: &[f32]) -> f32;
pub type LowpFn = fn(v: f32) -> f32;

/// Hardware capability set: tile geometry plus the kernels that match it.
/// Built once and shared by every resource and executor that uses it.
#[derive(Debug, Clone, Copy)]
pub struct KernelCaps {
    pub name: &'static str,
    /// Native channel pack width of float tensors.
    pub pack: usize,
    /// Bytes per float element (4 = fp32, 2 = fp16).
    pub bytes: usize,
    pub gemm: GemmUnit,
    pub gemm_int8: GemmKernel,
    pub gemm_int4: GemmKernel,
    pub quantize: QuantizeFn,
    pub min_max: MinMaxFn,
    pub abs_max: AbsMaxFn,
    pub to_lowp: LowpFn,
}

static DETECTED: OnceLock<KernelCaps> = OnceLock::new();

impl KernelCaps {
    fn reference(name: &'static str, pack: usize, bytes: usize, unit: usize, src_unit: usize, dst_xunit: usize) -> Self {
        Self {
            name,
            pack,
            bytes,
            gemm: GemmUnit { unit, src_unit, dst_xunit },
            gemm_int8: kernels::gemm_int8,
            gemm_int4: kernels::gemm_int4,
            quantize: kernels::quantize_f32_to_i8,
            min_max: kernels::count_min_max,
            abs_max: kernels::abs_max,
            to_lowp: if bytes == 2 { kernels::round_to_f16 } else { kernels::identity_f32 },
        }
    }

    pub fn scalar() -> Self { Self::reference("scalar", 4, 4, 4, 4, 4) }
    pub fn sse() -> Self { Self::reference("sse", 4, 4, 4, 16, 4) }
    pub fn avx2() -> Self { Self::reference("avx2", 8, 4, 8, 4, 4) }
    pub fn avx512() -> Self { Self::reference("avx512", 16, 4, 64, 4, 4) }
    pub fn neon() -> Self { Self::reference("neon", 4, 4, 4, 16, 2) }
    pub fn arm82() -> Self { Self::reference("arm82", 8, 2, 8, 4, 12) }

    /// Channel group width used by the weight layout and im2col.
    /// fp16 tables with an 8-wide pack still gather in groups of 4.
    pub fn layout_pack(&self) -> usize {
        if self.bytes == 2 && self.pack == 8 { 4 } else { self.pack }
    }

    pub fn gemm_kernel(&self, bits: ActBits) -> GemmKernel {
        match bits { ActBits::Eight => self.gemm_int8, ActBits::Four => self.gemm_int4 }
    }

    /// Capability set for the running CPU, probed once per process.
    pub fn detect() -> Self {
        *DETECTED.get_or_init(|| {
            let caps = probe();
            info!("kernel caps: {} (pack={}, bytes={}, gemm={:?})", caps.name, caps.pack, caps.bytes, caps.gemm);
            caps
        })
    }
}

#[cfg(all(target_arch = "aarch64", feature = "simd-neon"))]
fn probe() -> KernelCaps {
    if std::arch::is_aarch64_feature_detected!("fp16") { KernelCaps::arm82() } else { KernelCaps::neon() }
}

#[cfg(not(all(target_arch = "aarch64", feature = "simd-neon")))]
fn probe() -> KernelCaps {
    #[cfg(target_arch = "x86_64")]
    {
        #[cfg(feature = "simd-avx512")]
        {
            if std::is_x86_feature_detected!("avx512f") { return KernelCaps::avx512(); }
        }
        #[cfg(feature = "simd-avx2")]
        {
            if std::is_x86_feature_detected!("avx2") { return KernelCaps::avx2(); }
        }
        if std::is_x86_feature_detected!("sse4.1") { return KernelCaps::sse(); }
    }
    KernelCaps::scalar()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_keep_pack_and_unit_commensurate() {
        for caps in [KernelCaps::scalar(), KernelCaps::sse(), KernelCaps::avx2(), KernelCaps::avx512(), KernelCaps::neon(), KernelCaps::arm82()] {
            let u = caps.gemm.unit;
            for p in [caps.pack, caps.layout_pack()] {
                assert!(u % p == 0 || p % u == 0, "{}: unit {} vs pack {}", caps.name, u, p);
            }
            let p = caps.layout_pack();
            if caps.gemm.src_unit > p { assert_eq!(caps.gemm.src_unit % p, 0, "{}", caps.name); }
        }
    }

    #[test]
    fn fp16_pack8_gathers_by_four() {
        assert_eq!(KernelCaps::arm82().layout_pack(), 4);
        assert_eq!(KernelCaps::avx2().layout_pack(), 8);
    }

    #[test]
    fn detect_is_stable() {
        let a = KernelCaps::detect();
        let b = KernelCaps::detect();
        assert_eq!(a.name, b.name);
        assert_eq!(a.gemm, b.gemm);
    }
}
