// Quantized tiled convolution: weight packing, runtime input quantization, tiled int gemm
pub mod error;
pub mod tensor;
pub mod backend;
pub mod conv;

pub use backend::{BudgetPool, BufferPool, HeapPool, KernelCaps, Lifetime};
pub use conv::{Activation, ConvInt8Executor, ConvShape, ExecOptions, QuantMode, QuantPolicy, QuantizedWeights, WeightResource};
pub use error::{ConvError, Result};
pub use tensor::{DataType, QuantInfo, Shape, Tensor, TensorData, TensorDesc};
