pub mod dynamic;
pub mod executor;
pub mod layout;
pub mod plan;
pub mod resource;

use serde::{Deserialize, Serialize};

pub use executor::{ConvInt8Executor, ExecOptions, QuantPolicy};
pub use resource::{QuantMode, QuantizedWeights, WeightResource};

/// Activation fused into the convolution output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    None,
    Relu,
    Relu6,
}

impl Activation {
    /// Float clamp bounds `[min, max]`.
    pub fn thresholds(self) -> [f32; 2] {
        match self {
            Activation::None => [f32::MIN, f32::MAX],
            Activation::Relu => [0.0, f32::MAX],
            Activation::Relu6 => [0.0, 6.0],
        }
    }
}

/// Static description of a 2d convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvShape {
    pub out_channels: usize,
    pub in_channels: usize,
    pub kernel_x: usize,
    pub kernel_y: usize,
    #[serde(default = "one")]
    pub stride_x: usize,
    #[serde(default = "one")]
    pub stride_y: usize,
    #[serde(default = "one")]
    pub dilate_x: usize,
    #[serde(default = "one")]
    pub dilate_y: usize,
    #[serde(default)]
    pub pad_x: usize,
    #[serde(default)]
    pub pad_y: usize,
    #[serde(default)]
    pub activation: Activation,
}

fn one() -> usize { 1 }

impl ConvShape {
    pub fn new(out_channels: usize, in_channels: usize, kernel: usize) -> Self {
        Self {
            out_channels, in_channels,
            kernel_x: kernel, kernel_y: kernel,
            stride_x: 1, stride_y: 1,
            dilate_x: 1, dilate_y: 1,
            pad_x: 0, pad_y: 0,
            activation: Activation::None,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self { self.stride_x = stride; self.stride_y = stride; self }
    pub fn with_pad(mut self, pad: usize) -> Self { self.pad_x = pad; self.pad_y = pad; self }
    pub fn with_dilation(mut self, dilate: usize) -> Self { self.dilate_x = dilate; self.dilate_y = dilate; self }
    pub fn with_activation(mut self, activation: Activation) -> Self { self.activation = activation; self }

    pub fn kernel_area(&self) -> usize { self.kernel_x * self.kernel_y }

    /// Length of one output channel's reduction axis (`ic * kernel area`).
    pub fn reduction_len(&self) -> usize { self.in_channels * self.kernel_area() }

    /// Output `(height, width)` for an input of `(ih, iw)`; `None` when the
    /// dilated kernel does not fit.
    pub fn output_hw(&self, ih: usize, iw: usize) -> Option<(usize, usize)> {
        let kh = self.dilate_y * (self.kernel_y - 1) + 1;
        let kw = self.dilate_x * (self.kernel_x - 1) + 1;
        let ph = ih + 2 * self.pad_y;
        let pw = iw + 2 * self.pad_x;
        if ph < kh || pw < kw || self.stride_x == 0 || self.stride_y == 0 { return None; }
        Some(((ph - kh) / self.stride_y + 1, (pw - kw) / self.stride_x + 1))
    }
}

#[inline]
pub(crate) fn up_div(a: usize, b: usize) -> usize { (a + b - 1) / b }

#[inline]
pub(crate) fn round_up(a: usize, b: usize) -> usize { up_div(a, b) * b }
