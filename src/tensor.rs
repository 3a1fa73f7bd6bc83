use serde::{Deserialize, Serialize};

/// NCHW tensor shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub batch: usize,
    pub channel: usize,
    pub height: usize,
    pub width: usize,
}

impl Shape {
    pub fn new(batch: usize, channel: usize, height: usize, width: usize) -> Self { Self { batch, channel, height, width } }
    pub fn len(&self) -> usize { self.batch * self.channel * self.height * self.width }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn area(&self) -> usize { self.height * self.width }
    pub fn dims(&self) -> Vec<usize> { vec![self.batch, self.channel, self.height, self.width] }
}

/// Affine int8 quantization of a tensor: `real = (q - zero) * scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantInfo {
    pub scale: f32,
    pub zero: i32,
    pub min: i32,
    pub max: i32,
}

impl Default for QuantInfo {
    fn default() -> Self { Self { scale: 1.0, zero: 0, min: -128, max: 127 } }
}

impl QuantInfo {
    pub fn new(scale: f32, zero: i32) -> Self { Self { scale, zero, ..Self::default() } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    F32,
    I8,
}

/// Shape, element type and optional quantization of a tensor, without storage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TensorDesc {
    pub shape: Shape,
    pub dtype: DataType,
    pub quant: Option<QuantInfo>,
}

impl TensorDesc {
    pub fn f32(shape: Shape) -> Self { Self { shape, dtype: DataType::F32, quant: None } }
    pub fn i8(shape: Shape, quant: QuantInfo) -> Self { Self { shape, dtype: DataType::I8, quant: Some(quant) } }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I8(Vec<i8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub desc: TensorDesc,
    pub data: TensorData,
}

impl Tensor {
    /// # Panics
    /// When `data.len()` differs from `shape.len()`.
    pub fn from_f32(shape: Shape, data: Vec<f32>) -> Self {
        assert_eq!(shape.len(), data.len(), "f32 tensor data length must match shape");
        Self { desc: TensorDesc::f32(shape), data: TensorData::F32(data) }
    }

    /// # Panics
    /// When `data.len()` differs from `shape.len()`.
    pub fn from_i8(shape: Shape, data: Vec<i8>, quant: QuantInfo) -> Self {
        assert_eq!(shape.len(), data.len(), "i8 tensor data length must match shape");
        Self { desc: TensorDesc::i8(shape, quant), data: TensorData::I8(data) }
    }

    pub fn zeros(desc: TensorDesc) -> Self {
        let n = desc.shape.len();
        let data = match desc.dtype {
            DataType::F32 => TensorData::F32(vec![0.0; n]),
            DataType::I8 => TensorData::I8(vec![0; n]),
        };
        Self { desc, data }
    }

    pub fn shape(&self) -> Shape { self.desc.shape }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data { TensorData::F32(v) => Some(v), _ => None }
    }

    pub fn as_i8(&self) -> Option<&[i8]> {
        match &self.data { TensorData::I8(v) => Some(v), _ => None }
    }

    /// Real values of the tensor; int8 data is mapped through its quant info.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            TensorData::F32(v) => v.clone(),
            TensorData::I8(v) => {
                let q = self.desc.quant.unwrap_or_default();
                v.iter().map(|&x| (x as i32 - q.zero) as f32 * q.scale).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "f32 tensor data length must match shape")]
    fn from_f32_panics_on_wrong_length() {
        Tensor::from_f32(Shape::new(1, 2, 2, 2), vec![0.0; 7]);
    }

    #[test]
    #[should_panic(expected = "i8 tensor data length must match shape")]
    fn from_i8_panics_on_wrong_length() {
        Tensor::from_i8(Shape::new(1, 1, 3, 1), vec![0; 4], QuantInfo::default());
    }

    #[test]
    fn int8_values_map_through_quant_info() {
        let t = Tensor::from_i8(Shape::new(1, 1, 1, 3), vec![-2, 0, 5], QuantInfo::new(0.5, 1));
        assert_eq!(t.to_f32_vec(), vec![-1.5, -0.5, 2.0]);
    }
}
