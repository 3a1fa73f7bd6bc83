use anyhow::{bail, Context};
use clap::Parser;
use qconv::{ConvInt8Executor, ConvShape, ExecOptions, HeapPool, KernelCaps, QuantMode, QuantizedWeights, Shape, Tensor, TensorDesc, WeightResource};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "qconv-bench", version, about = "Time a dynamically quantized convolution and report its error against f32")]
struct Args {
    /// JSON job file; flags below fill in anything it leaves out
    #[arg(long)]
    config: Option<PathBuf>,

    /// Capability preset: detect, scalar, sse, avx2, avx512, neon, arm82
    #[arg(long, default_value = "detect")]
    caps: String,

    #[arg(long, default_value_t = 0)]
    threads: usize,

    #[arg(long, default_value_t = 20)]
    iters: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Print the report as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Job {
    conv: ConvShape,
    input: Shape,
    #[serde(default = "one")]
    blocks: usize,
    #[serde(default)]
    asymmetric: bool,
    #[serde(default)]
    int4: bool,
    #[serde(default)]
    options: ExecOptions,
}

fn one() -> usize { 1 }

impl Default for Job {
    fn default() -> Self {
        Self {
            conv: ConvShape::new(64, 32, 3).with_pad(1),
            input: Shape::new(1, 32, 28, 28),
            blocks: 1,
            asymmetric: false,
            int4: false,
            options: ExecOptions::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Report {
    caps: &'static str,
    threads: usize,
    iters: usize,
    mean_ms: f64,
    max_abs_err: f32,
    max_ref: f32,
}

fn pick_caps(name: &str) -> anyhow::Result<KernelCaps> {
    Ok(match name {
        "detect" => KernelCaps::detect(),
        "scalar" => KernelCaps::scalar(),
        "sse" => KernelCaps::sse(),
        "avx2" => KernelCaps::avx2(),
        "avx512" => KernelCaps::avx512(),
        "neon" => KernelCaps::neon(),
        "arm82" => KernelCaps::arm82(),
        other => bail!("unknown capability preset '{}'", other),
    })
}

/// Direct f32 convolution over NCHW tensors.
fn reference(conv: &ConvShape, w: &[f32], x: &[f32], input: Shape, output: Shape) -> Vec<f32> {
    let mut out = vec![0f32; output.len()];
    let (ic, kh, kw) = (conv.in_channels, conv.kernel_y, conv.kernel_x);
    for b in 0..output.batch {
        for o in 0..output.channel {
            for oy in 0..output.height {
                for ox in 0..output.width {
                    let mut acc = 0f32;
                    for c in 0..ic {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = (oy * conv.stride_y + ky * conv.dilate_y) as isize - conv.pad_y as isize;
                                let ix = (ox * conv.stride_x + kx * conv.dilate_x) as isize - conv.pad_x as isize;
                                if iy < 0 || ix < 0 || iy as usize >= input.height || ix as usize >= input.width { continue; }
                                let xv = x[((b * ic + c) * input.height + iy as usize) * input.width + ix as usize];
                                acc += w[((o * ic + c) * kh + ky) * kw + kx] * xv;
                            }
                        }
                    }
                    out[((b * output.channel + o) * output.height + oy) * output.width + ox] = acc;
                }
            }
        }
    }
    out
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let mut job = match &args.config {
        Some(p) => {
            let text = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
            serde_json::from_str::<Job>(&text).with_context(|| format!("parsing {}", p.display()))?
        }
        None => Job::default(),
    };
    if args.threads > 0 { job.options.threads = args.threads; }
    let caps = pick_caps(&args.caps)?;

    let conv = job.conv;
    let (oh, ow) = conv.output_hw(job.input.height, job.input.width).context("kernel does not fit the input")?;
    let output = Shape::new(job.input.batch, conv.out_channels, oh, ow);

    let mut rng = SmallRng::seed_from_u64(args.seed);
    let normal = Normal::new(0.0f32, 0.5).context("weight distribution")?;
    let weights: Vec<f32> = (0..conv.out_channels * conv.reduction_len()).map(|_| normal.sample(&mut rng)).collect();
    let bias: Vec<f32> = (0..conv.out_channels).map(|_| rng.gen_range(-0.1..0.1)).collect();
    let x: Vec<f32> = (0..job.input.len()).map(|_| rng.gen_range(-1.0..1.0)).collect();

    let q = QuantizedWeights::quantize(&weights, conv.out_channels, job.blocks, job.asymmetric, job.int4);
    let res = WeightResource::build(&q, Some(bias.as_slice()), conv, QuantMode::Dynamic, &caps, Arc::new(HeapPool)).context("building weight resource")?;
    let mut exec = ConvInt8Executor::new(res, Arc::new(caps), Arc::new(HeapPool), job.options)?;

    let input = Tensor::from_f32(job.input, x.clone());
    let mut out = Tensor::zeros(TensorDesc::f32(output));
    exec.resize(&input.desc, &out.desc).context("resize")?;
    exec.execute(&input, &mut out)?;

    let t0 = Instant::now();
    for _ in 0..args.iters { exec.execute(&input, &mut out)?; }
    let mean_ms = t0.elapsed().as_secs_f64() * 1e3 / args.iters.max(1) as f64;

    let mut expect = reference(&conv, &weights, &x, job.input, output);
    for (i, v) in expect.iter_mut().enumerate() { *v += bias[(i / output.area()) % conv.out_channels]; }
    let got = out.to_f32_vec();
    let max_abs_err = got.iter().zip(&expect).map(|(a, b)| (a - b).abs()).fold(0.0f32, f32::max);
    let max_ref = expect.iter().fold(0.0f32, |m, v| m.max(v.abs()));

    let report = Report {
        caps: caps.name,
        threads: exec.plan().map(|p| p.threads).unwrap_or(0),
        iters: args.iters,
        mean_ms,
        max_abs_err,
        max_ref,
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "caps={} threads={} iters={} mean={:.3}ms max_abs_err={:.5} (max |ref|={:.3})",
            report.caps, report.threads, report.iters, report.mean_ms, report.max_abs_err, report.max_ref
        );
    }
    Ok(())
}
