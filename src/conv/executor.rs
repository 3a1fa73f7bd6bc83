use crate::backend::alloc::{acquire_all, release_all};
use crate::backend::{BufferPool, Finalize, GemmArgs, GemmKernel, KernelCaps, Lifetime, PostTreat};
use crate::conv::dynamic;
use crate::conv::plan::{im2col, source_sum, SplitMode, TilingPlan};
use crate::conv::resource::{QuantMode, WeightResource};
use crate::conv::Activation;
use crate::error::{ConvError, Result};
use crate::tensor::{DataType, Tensor, TensorData, TensorDesc};
use log::{debug, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOptions {
    /// Worker count; 0 uses the size of the current rayon pool.
    #[serde(default)]
    pub threads: usize,
    /// Allow per-batch symmetric quantization on dense 1x1 shapes.
    #[serde(default = "yes")]
    pub batch_quant: bool,
}

fn yes() -> bool { true }

impl Default for ExecOptions {
    fn default() -> Self { Self { threads: 0, batch_quant: true } }
}

impl ExecOptions {
    pub fn with_threads(mut self, threads: usize) -> Self { self.threads = threads; self }
    pub fn with_batch_quant(mut self, on: bool) -> Self { self.batch_quant = on; self }

    fn resolved_threads(&self) -> usize {
        if self.threads == 0 { rayon::current_num_threads() } else { self.threads }
    }
}

/// Input/output quantization bound ahead of time, plus the per-channel scale
/// and bias fused from it. Refreshed on every resize.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineQuant {
    pub input_scale: f32,
    pub input_zero: i32,
    pub output_scale: f32,
    pub output_zero: i32,
    pub clamp_min: i32,
    pub clamp_max: i32,
    /// `[oc_up]` weight scale times input scale.
    pub scale: Vec<f32>,
    /// `[oc_up]` bias with the input zero-point correction folded in.
    pub bias: Vec<f32>,
}

impl Default for OfflineQuant {
    fn default() -> Self {
        Self {
            input_scale: 1.0,
            input_zero: 0,
            output_scale: 1.0,
            output_zero: 0,
            clamp_min: -128,
            clamp_max: 127,
            scale: Vec::new(),
            bias: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuantPolicy {
    Offline(OfflineQuant),
    Dynamic { batch_quant: bool },
}

impl QuantPolicy {
    fn for_mode(mode: QuantMode, options: &ExecOptions) -> Self {
        match mode {
            QuantMode::Offline => QuantPolicy::Offline(OfflineQuant::default()),
            QuantMode::Dynamic => QuantPolicy::Dynamic { batch_quant: options.batch_quant },
        }
    }
}

/// Scratch owned by one executor; per-thread buffers are `threads * per_thread`
/// long and handed out as disjoint chunks by index.
#[derive(Debug, Default)]
struct ScratchArena {
    input: Vec<i8>,
    partials: Vec<f32>,
    batch_scale: Vec<f32>,
    im2col: Vec<i8>,
    src_sum: Vec<f32>,
    staging: Vec<f32>,
    scale: Vec<f32>,
    bias: Vec<f32>,
}

impl ScratchArena {
    fn new(plan: &TilingPlan, res: &WeightResource) -> Self {
        let batch = plan.input.batch;
        let slots = plan.gather_slots();
        Self {
            input: vec![0; plan.input.len()],
            partials: vec![0.0; (2 * plan.threads).max(plan.threads * batch + batch)],
            batch_scale: vec![0.0; if plan.use_batch_quant { batch } else { 0 }],
            im2col: vec![0; slots * plan.tile_bytes()],
            src_sum: vec![0.0; slots * res.block_count * plan.tile_width],
            staging: vec![0.0; plan.threads * plan.staging_len],
            scale: vec![0.0; res.block_count * res.oc_up],
            bias: vec![0.0; res.oc_up],
        }
    }
}

/// Read-only state shared by every worker of one execute call.
struct TileCtx<'a> {
    res: &'a WeightResource,
    plan: &'a TilingPlan,
    gemm: GemmKernel,
    input: &'a [i8],
    zero: i8,
    in_scale: f32,
    extra: Option<&'a [f32]>,
    scale: &'a [f32],
    bias: &'a [f32],
    finalize: Finalize,
}

impl TileCtx<'_> {
    /// im2col of every chunk of `tile`, plus per-block source sums for asymmetric weights.
    fn gather(&self, tile: usize, col: &mut [i8], ss: &mut [f32]) {
        let plan = self.plan;
        let res = self.res;
        let dxu = plan.gemm.dst_xunit;
        let block_l = res.dims.block_l;
        let (start, real) = plan.tile_range(tile);
        for c in 0..plan.im2col_count {
            let off = c * dxu;
            if off >= real { break; }
            let creal = dxu.min(real - off);
            let chunk = &mut col[c * plan.chunk_bytes..][..plan.chunk_bytes];
            im2col(chunk, self.input, &plan.im2col, &res.reduction_map, plan.gemm, start + off, creal, self.zero);
            if res.weight_asymmetric {
                for b in 0..res.block_count {
                    source_sum(&mut ss[b * plan.tile_width + off..], chunk, plan.gemm, b * block_l, block_l, creal, |x| {
                        self.extra.map_or(self.in_scale, |e| e[start + off + x])
                    });
                }
            }
        }
    }

    /// Gemm over every block of `tile` for channels `[oc_start, oc_start + oc_count)`,
    /// written to `dst` as `[channel][tile_width]`.
    fn compute(&self, tile: usize, col: &[i8], ss: &[f32], dst: &mut [f32], oc_start: usize, oc_count: usize) {
        let plan = self.plan;
        let res = self.res;
        let dims = &res.dims;
        let dxu = plan.gemm.dst_xunit;
        let tile_stride = dims.tile_stride(res.act_bits);
        let block_stride = dims.block_stride(res.act_bits);
        let weight_base = (oc_start / dims.unit) * tile_stride;
        let depth_bytes = dims.block_l * dxu * plan.gemm.src_unit;
        let last = res.block_count - 1;
        let (start, real) = plan.tile_range(tile);
        for c in 0..plan.im2col_count {
            let off = c * dxu;
            if off >= real { break; }
            let chunk = &col[c * plan.chunk_bytes..][..plan.chunk_bytes];
            for b in 0..res.block_count {
                let row = b * res.oc_up + oc_start;
                let post = PostTreat {
                    scale: &self.scale[row..],
                    bias: (b == 0).then(|| &self.bias[oc_start..]),
                    weight_quant_bias: res.weight_asymmetric.then(|| &res.dequant_bias[row..]),
                    src_sum: res.weight_asymmetric.then(|| &ss[b * plan.tile_width + off..]),
                    extra_scale: self.extra.map(|e| &e[start + off..]),
                    finalize: (b == last).then_some(self.finalize),
                };
                let args = GemmArgs {
                    unit: plan.gemm,
                    depth_quad: dims.block_l,
                    oc_count,
                    weight_tile_stride: tile_stride,
                    real_count: dxu.min(real - off),
                    post,
                };
                (self.gemm)(&mut dst[off..], plan.tile_width, &chunk[b * depth_bytes..], &res.packed[b * block_stride + weight_base..], &args);
            }
        }
    }
}

/// Quantized convolution operator bound to one shared weight resource.
#[derive(Debug)]
pub struct ConvInt8Executor {
    resource: Arc<WeightResource>,
    caps: Arc<KernelCaps>,
    pool: Arc<dyn BufferPool>,
    options: ExecOptions,
    policy: QuantPolicy,
    plan: Option<TilingPlan>,
    io: Option<(DataType, DataType)>,
    arena: ScratchArena,
}

impl ConvInt8Executor {
    pub fn new(resource: Arc<WeightResource>, caps: Arc<KernelCaps>, pool: Arc<dyn BufferPool>, options: ExecOptions) -> Result<Self> {
        if resource.gemm != caps.gemm {
            warn!("weights packed for {:?} cannot run on {} ({:?})", resource.gemm, caps.name, caps.gemm);
            return Err(ConvError::Invalid);
        }
        let policy = QuantPolicy::for_mode(resource.mode, &options);
        Ok(Self { resource, caps, pool, options, policy, plan: None, io: None, arena: ScratchArena::default() })
    }

    /// New executor sharing this one's weights; it must be resized before use.
    pub fn clone_shared(&self) -> Self {
        Self {
            resource: Arc::clone(&self.resource),
            caps: Arc::clone(&self.caps),
            pool: Arc::clone(&self.pool),
            options: self.options,
            policy: QuantPolicy::for_mode(self.resource.mode, &self.options),
            plan: None,
            io: None,
            arena: ScratchArena::default(),
        }
    }

    pub fn resource(&self) -> &Arc<WeightResource> { &self.resource }
    pub fn policy(&self) -> &QuantPolicy { &self.policy }
    pub fn plan(&self) -> Option<&TilingPlan> { self.plan.as_ref() }

    /// Rebinds offline quantization parameters from the tensor descriptions and
    /// refolds them into the per-channel scale and bias. No-op for dynamic policies.
    pub fn update_quant(&mut self, input: &TensorDesc, output: &TensorDesc) -> Result<()> {
        let res = self.resource.as_ref();
        let q = match &mut self.policy {
            QuantPolicy::Offline(q) => q,
            QuantPolicy::Dynamic { .. } => return Ok(()),
        };
        let iq = input.quant.ok_or_else(|| ConvError::Config("offline input needs quantization parameters".into()))?;
        if output.dtype == DataType::I8 && output.quant.is_none() {
            return Err(ConvError::Config("int8 output needs quantization parameters".into()));
        }
        let oq = output.quant.unwrap_or_default();
        q.input_scale = iq.scale;
        q.input_zero = iq.zero;
        q.output_scale = oq.scale;
        q.output_zero = oq.zero;
        q.clamp_min = oq.min;
        q.clamp_max = oq.max;
        match res.shape.activation {
            Activation::None => {}
            Activation::Relu => q.clamp_min = q.clamp_min.max(oq.zero),
            Activation::Relu6 => {
                q.clamp_min = q.clamp_min.max(oq.zero);
                q.clamp_max = q.clamp_max.min((6.0 / oq.scale).round() as i32 + oq.zero);
            }
        }
        let zs = iq.zero as f32 * iq.scale;
        q.scale = res.dequant_scale[..res.oc_up].iter().map(|&s| s * iq.scale).collect();
        q.bias = (0..res.oc_up).map(|c| res.bias[c] - zs * res.total_row_sum(c)).collect();
        Ok(())
    }

    /// Plans tiling for new shapes and sizes the scratch arena. Scratch is
    /// acquired from the pool for the duration of the call only.
    pub fn resize(&mut self, input: &TensorDesc, output: &TensorDesc) -> Result<()> {
        self.plan = None;
        self.io = None;
        let batch_quant = match &self.policy {
            QuantPolicy::Dynamic { batch_quant } => {
                if input.dtype != DataType::F32 || output.dtype != DataType::F32 {
                    return Err(ConvError::Config("dynamic quantization runs on f32 tensors".into()));
                }
                *batch_quant
            }
            QuantPolicy::Offline(_) => false,
        };
        self.update_quant(input, output)?;
        let res = self.resource.as_ref();
        let plan = TilingPlan::new(res, &self.caps, input.shape, output.shape, self.options.resolved_threads(), batch_quant)?;
        let requests = plan.scratch_requests(res);
        acquire_all(self.pool.as_ref(), Lifetime::Dynamic, &requests).map_err(ConvError::OutOfMemory)?;
        self.arena = ScratchArena::new(&plan, res);
        release_all(self.pool.as_ref(), Lifetime::Dynamic, &requests);
        debug!("resized {:?} -> {:?}: {} scratch buffers", input.shape, output.shape, requests.len());
        self.plan = Some(plan);
        self.io = Some((input.dtype, output.dtype));
        Ok(())
    }

    pub fn execute(&mut self, input: &Tensor, output: &mut Tensor) -> Result<()> {
        let Self { resource, caps, policy, plan, io, arena, .. } = self;
        let plan = plan.as_ref().ok_or(ConvError::NotResized)?;
        if input.shape() != plan.input {
            return Err(ConvError::ShapeMismatch { expected: plan.input.dims(), actual: input.shape().dims() });
        }
        if output.shape() != plan.output {
            return Err(ConvError::ShapeMismatch { expected: plan.output.dims(), actual: output.shape().dims() });
        }
        if *io != Some((input.desc.dtype, output.desc.dtype)) {
            return Err(ConvError::Config("tensor types differ from the last resize".into()));
        }
        let res: &WeightResource = resource;
        let n = plan.input.len();
        let oc_up = res.oc_up;
        let threads = plan.threads;

        // quantize input, fold its scale into the per-channel scale and bias
        let (zero, in_scale, finalize) = match policy {
            QuantPolicy::Offline(q) => {
                match &input.data {
                    TensorData::I8(v) => arena.input[..n].copy_from_slice(v),
                    TensorData::F32(v) => (caps.quantize)(v, &mut arena.input[..n], 1.0 / q.input_scale, q.input_zero as f32, -128, 127),
                }
                arena.scale.copy_from_slice(&q.scale);
                arena.bias.copy_from_slice(&q.bias);
                let finalize = match output.desc.dtype {
                    DataType::I8 => Finalize::Int8 {
                        inv_scale: 1.0 / q.output_scale,
                        zero: q.output_zero as f32,
                        min: q.clamp_min as f32,
                        max: q.clamp_max as f32,
                    },
                    DataType::F32 => float_clamp(res),
                };
                (q.input_zero.clamp(-128, 127) as i8, q.input_scale, finalize)
            }
            QuantPolicy::Dynamic { .. } => {
                let src = input.as_f32().ok_or_else(|| ConvError::Config("dynamic quantization needs f32 input".into()))?;
                if plan.use_batch_quant {
                    dynamic::batch_quant(caps, src, plan.input.batch, plan.input.channel, &mut arena.input, threads, &mut arena.partials, &mut arena.batch_scale);
                    arena.scale.copy_from_slice(&res.dequant_scale);
                    arena.bias.copy_from_slice(&res.bias);
                    (0, 1.0, float_clamp(res))
                } else {
                    let padded = res.shape.pad_x > 0 || res.shape.pad_y > 0;
                    let q = dynamic::single_quant(caps, src, &mut arena.input[..n], threads, &mut arena.partials, padded);
                    for (s, &w) in arena.scale.iter_mut().zip(&res.dequant_scale) { *s = w * q.dequant; }
                    let zs = q.zero * q.dequant;
                    for (c, b) in arena.bias.iter_mut().enumerate() { *b = res.bias[c] - zs * res.total_row_sum(c); }
                    (q.zero.clamp(-128.0, 127.0) as i8, q.dequant, float_clamp(res))
                }
            }
        };

        let ctx = TileCtx {
            res,
            plan,
            gemm: caps.gemm_kernel(res.act_bits),
            input: &arena.input,
            zero,
            in_scale,
            extra: plan.use_batch_quant.then(|| &arena.batch_scale[..]),
            scale: &arena.scale,
            bias: &arena.bias,
            finalize,
        };
        let tile_bytes = plan.tile_bytes();
        let ss_len = res.block_count * plan.tile_width;
        let tile_out = plan.staging_channels * plan.tile_width;
        let oc = res.shape.out_channels;
        match plan.split {
            SplitMode::Plane => {
                arena.staging
                    .par_chunks_mut(plan.staging_len)
                    .zip(arena.im2col.par_chunks_mut(tile_bytes))
                    .zip(arena.src_sum.par_chunks_mut(ss_len))
                    .enumerate()
                    .for_each(|(t, ((staging, col), ss))| {
                        for tile in plan.divides[t]..plan.divides[t + 1] {
                            let local = tile - plan.divides[t];
                            ctx.gather(tile, col, ss);
                            ctx.compute(tile, col, ss, &mut staging[local * tile_out..][..tile_out], 0, oc);
                        }
                    });
            }
            SplitMode::Channel => {
                arena.im2col
                    .par_chunks_mut(tile_bytes)
                    .zip(arena.src_sum.par_chunks_mut(ss_len))
                    .enumerate()
                    .for_each(|(tile, (col, ss))| ctx.gather(tile, col, ss));
                let cols = &arena.im2col;
                let sums = &arena.src_sum;
                arena.staging.par_chunks_mut(plan.staging_len).enumerate().for_each(|(t, staging)| {
                    let (oc_start, count) = plan.channel_range(t, oc);
                    if count == 0 { return; }
                    for tile in 0..plan.tile_count {
                        let col = &cols[tile * tile_bytes..][..tile_bytes];
                        let ss = &sums[tile * ss_len..][..ss_len];
                        ctx.compute(tile, col, ss, &mut staging[tile * tile_out..][..tile_out], oc_start, count);
                    }
                });
            }
        }

        scatter(plan, oc, caps, &arena.staging, &mut output.data);
        Ok(())
    }
}

fn float_clamp(res: &WeightResource) -> Finalize {
    let [min, max] = res.relu_threshold;
    Finalize::Float { min, max }
}

/// Copies every thread's staged tiles into the NCHW output.
fn scatter(plan: &TilingPlan, oc: usize, caps: &KernelCaps, staging: &[f32], out: &mut TensorData) {
    let area = plan.output.area();
    let tw = plan.tile_width;
    let tile_out = plan.staging_channels * tw;
    let mut write = |idx: usize, v: f32| match out {
        TensorData::F32(o) => o[idx] = (caps.to_lowp)(v),
        TensorData::I8(o) => o[idx] = v as i8,
    };
    for t in 0..plan.threads {
        let staging = &staging[t * plan.staging_len..][..plan.staging_len];
        let (tiles, oc_start, count) = match plan.split {
            SplitMode::Plane => (plan.divides[t]..plan.divides[t + 1], 0, oc),
            SplitMode::Channel => {
                let (s, c) = plan.channel_range(t, oc);
                (0..plan.tile_count, s, c)
            }
        };
        let first = tiles.start;
        for tile in tiles {
            let local = if plan.split == SplitMode::Plane { tile - first } else { tile };
            let (start, real) = plan.tile_range(tile);
            for i in 0..count {
                let row = &staging[local * tile_out + i * tw..][..real];
                for (x, &v) in row.iter().enumerate() {
                    let pos = start + x;
                    write(((pos / area) * oc + oc_start + i) * area + pos % area, v);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeapPool;
    use crate::conv::resource::QuantizedWeights;
    use crate::conv::ConvShape;
    use crate::tensor::Shape;

    fn executor(mode: QuantMode) -> ConvInt8Executor {
        let caps = KernelCaps::scalar();
        let w = QuantizedWeights::quantize(&[1.0, 0.0, 0.0, 1.0], 2, 1, false, false);
        let res = WeightResource::build(&w, Some(&[0.5, -0.5][..]), ConvShape::new(2, 2, 1), mode, &caps, Arc::new(HeapPool)).unwrap();
        ConvInt8Executor::new(res, Arc::new(caps), Arc::new(HeapPool), ExecOptions::default().with_threads(2)).unwrap()
    }

    #[test]
    fn execute_before_resize_fails() {
        let mut ex = executor(QuantMode::Dynamic);
        let input = Tensor::from_f32(Shape::new(1, 2, 1, 1), vec![1.0, 2.0]);
        let mut out = Tensor::zeros(TensorDesc::f32(Shape::new(1, 2, 1, 1)));
        assert_eq!(ex.execute(&input, &mut out), Err(ConvError::NotResized));
    }

    #[test]
    fn identity_weights_pass_input_through() {
        let mut ex = executor(QuantMode::Dynamic);
        let input = Tensor::from_f32(Shape::new(1, 2, 1, 3), vec![1.0, 2.0, 3.0, -1.0, 0.0, 4.0]);
        let mut out = Tensor::zeros(TensorDesc::f32(Shape::new(1, 2, 1, 3)));
        ex.resize(&input.desc, &out.desc).unwrap();
        ex.execute(&input, &mut out).unwrap();
        let expect = [1.5, 2.5, 3.5, -1.5, -0.5, 3.5];
        for (a, b) in out.to_f32_vec().iter().zip(expect) {
            assert!((a - b).abs() < 0.03, "{} vs {}", a, b);
        }
    }

    #[test]
    fn offline_policy_refolds_on_resize() {
        let mut ex = executor(QuantMode::Offline);
        let input = TensorDesc::i8(Shape::new(1, 2, 1, 1), crate::tensor::QuantInfo::new(0.5, 2));
        ex.resize(&input, &TensorDesc::f32(Shape::new(1, 2, 1, 1))).unwrap();
        match ex.policy() {
            QuantPolicy::Offline(q) => {
                assert_eq!(q.input_zero, 2);
                assert!((q.scale[0] - 0.5 / 127.0).abs() < 1e-9);
                // bias - zero * in_scale * row_sum(1.0)
                assert!((q.bias[0] - (0.5 - 1.0)).abs() < 1e-6);
            }
            other => panic!("unexpected policy {:?}", other),
        }
    }

    #[test]
    fn clone_shares_weights_but_not_plan() {
        let mut ex = executor(QuantMode::Dynamic);
        let d = TensorDesc::f32(Shape::new(1, 2, 1, 1));
        ex.resize(&d, &d).unwrap();
        let other = ex.clone_shared();
        assert!(Arc::ptr_eq(ex.resource(), other.resource()));
        assert!(other.plan().is_none());
    }
}
