//! Owned host tensor values.

use crate::types::{DType, TensorType};

/// An owned n-dimensional array on the host.
///
/// Element storage is a raw byte buffer in native layout; typed views are
/// provided for the element types the compiler itself manipulates.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<i64>,
    data: Vec<u8>,
}

impl Tensor {
    pub fn new(dtype: DType, shape: Vec<i64>, data: Vec<u8>) -> Self {
        let elems: i64 = shape.iter().product();
        assert_eq!(
            data.len(),
            elems as usize * dtype.byte_size(),
            "tensor data length does not match shape"
        );
        Self { dtype, shape, data }
    }

    /// Zero-filled tensor of the given type.
    pub fn zeros(ty: &TensorType) -> Self {
        let bytes = ty.num_elements() as usize * ty.dtype.byte_size();
        Self {
            dtype: ty.dtype,
            shape: ty.shape.clone(),
            data: vec![0; bytes],
        }
    }

    pub fn from_f32s(shape: Vec<i64>, values: &[f32]) -> Self {
        let data = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::new(DType::Float32, shape, data)
    }

    pub fn from_i64s(shape: Vec<i64>, values: &[i64]) -> Self {
        let data = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::new(DType::Int64, shape, data)
    }

    pub fn scalar_bool(value: bool) -> Self {
        Self::new(DType::Bool, Vec::new(), vec![value as u8])
    }

    /// The 1-D int64 shape tensor for the given static extents.
    pub fn shape_of(dims: &[i64]) -> Self {
        Self::from_i64s(vec![dims.len() as i64], dims)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn num_elements(&self) -> i64 {
        self.shape.iter().product()
    }

    pub fn ty(&self) -> TensorType {
        TensorType::new(self.dtype, self.shape.clone())
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Raw pointer to element storage, for packed-kernel invocation.
    pub fn data_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    pub fn as_i64s(&self) -> Vec<i64> {
        assert_eq!(self.dtype, DType::Int64);
        self.data
            .chunks_exact(8)
            .map(|c| i64::from_ne_bytes(c.try_into().unwrap()))
            .collect()
    }

    pub fn as_f32s(&self) -> Vec<f32> {
        assert_eq!(self.dtype, DType::Float32);
        self.data
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes(c.try_into().unwrap()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_tensor_contents() {
        let t = Tensor::shape_of(&[4, 2, 3]);
        assert_eq!(t.dtype(), DType::Int64);
        assert_eq!(t.shape(), &[3]);
        assert_eq!(t.as_i64s(), vec![4, 2, 3]);
    }

    #[test]
    fn f32_round_trip() {
        let t = Tensor::from_f32s(vec![4], &[1.0, 2.5, -3.0, 0.0]);
        assert_eq!(t.as_f32s(), vec![1.0, 2.5, -3.0, 0.0]);
        assert_eq!(t.num_elements(), 4);
    }
}
