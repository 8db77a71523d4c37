//! Dense host tensors

use serde::{Deserialize, Serialize};

use runtime_core::{Error, Result};

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    F32,
}

impl DType {
    /// Stable on-disk code
    pub fn code(self) -> u8 {
        match self {
            DType::F32 => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(DType::F32),
            _ => None,
        }
    }
}

/// Row-major dense tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Build a tensor, checking that `data` fills `shape` exactly
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let numel = checked_numel(&shape).ok_or_else(|| {
            Error::shard_mismatch("<tensor>", format!("shape {:?} overflows usize", shape))
        })?;
        if numel != data.len() {
            return Err(Error::shard_mismatch(
                "<tensor>",
                format!(
                    "shape {:?} holds {} elements, got {}",
                    shape,
                    numel,
                    data.len()
                ),
            ));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let data = vec![0.0; numel(&shape)];
        Self { shape, data }
    }

    /// One-dimensional tensor over `data`
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        DType::F32
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Exact equality on the bit patterns (NaN payloads and signed zeros included)
    pub fn bit_eq(&self, other: &Tensor) -> bool {
        self.shape == other.shape
            && self.data.len() == other.data.len()
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

/// Number of elements described by `shape`
pub(crate) fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Like `numel`, but `None` when the product overflows
pub fn checked_numel(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_must_match_data() {
        assert!(Tensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
        let result = Tensor::new(vec![2, 3], vec![0.0; 5]);
        assert!(matches!(result, Err(Error::ShardMismatch { .. })));
    }

    #[test]
    fn test_bit_eq_distinguishes_signed_zero() {
        let a = Tensor::from_vec(vec![0.0, 1.0]);
        let b = Tensor::from_vec(vec![-0.0, 1.0]);
        assert_eq!(a, b);
        assert!(!a.bit_eq(&b));
        assert!(a.bit_eq(&a.clone()));
    }

    #[test]
    fn test_scalar_shape() {
        let t = Tensor::new(vec![], vec![3.5]).unwrap();
        assert_eq!(t.numel(), 1);
        assert_eq!(DType::from_code(t.dtype().code()), Some(DType::F32));
    }

    #[test]
    fn test_overflowing_shape_rejected() {
        assert_eq!(checked_numel(&[3, 4]), Some(12));
        assert_eq!(checked_numel(&[1 << 40, 1 << 40]), None);

        let result = Tensor::new(vec![1 << 40, 1 << 40], Vec::new());
        assert!(matches!(result, Err(Error::ShardMismatch { .. })));
    }
}
