use std::{
    fmt::{self, Debug, Display, Formatter},
    iter, mem,
};

use half::{bf16, f16};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Storage format of tensor elements.
///
/// Every device computes in `f32`. A reduced-precision dtype only changes
/// what a materialised value looks like: it is rounded to the nearest
/// representable value of the format (ties to even).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F16,
    BF16,
}

impl DType {
    pub fn round(self, value: f32) -> f32 {
        match self {
            DType::F32 => value,
            DType::F16 => f16::from_f32(value).to_f32(),
            DType::BF16 => bf16::from_f32(value).to_f32(),
        }
    }

    /// Default `(rtol, atol)` used when comparing results of this format.
    pub fn tolerance(self) -> (f32, f32) {
        match self {
            DType::F32 => (1.3e-6, 1e-5),
            DType::F16 => (1e-3, 1e-3),
            DType::BF16 => (1.6e-2, 1e-2),
        }
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DType::F32 => "float32",
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub(crate) dims: Box<[usize]>,
    pub(crate) strides: Box<[usize]>,
}

impl Display for Shape {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(
            &self
                .dims()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("x"),
        )
    }
}

impl Shape {
    fn contiguous(dims: Box<[usize]>) -> Self {
        Self {
            strides: (1..dims.len())
                .map(|start_dim| dims[start_dim..].iter().product())
                .chain(iter::once(1))
                .take(dims.len())
                .collect(),
            dims,
        }
    }

    pub fn elements(&self) -> usize {
        self.dims().iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(value: [usize; N]) -> Self {
        Shape::contiguous(value.into())
    }
}

impl From<&[usize]> for Shape {
    fn from(value: &[usize]) -> Self {
        Shape::contiguous(value.into())
    }
}

impl From<Vec<usize>> for Shape {
    fn from(value: Vec<usize>) -> Self {
        Shape::contiguous(value.into_boxed_slice())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layout {
    pub(crate) shape: Shape,
    pub(crate) dtype: DType,
}

impl Display for Layout {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.shape(), self.dtype)
    }
}

impl Layout {
    pub fn new(shape: impl Into<Shape>, dtype: DType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
        }
    }

    pub fn scalar(dtype: DType) -> Self {
        Self::new(Vec::<usize>::new(), dtype)
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn dims(&self) -> &[usize] {
        self.shape().dims()
    }

    pub fn rank(&self) -> usize {
        self.shape().rank()
    }

    pub fn strides(&self) -> &[usize] {
        self.shape().strides()
    }

    pub fn elements(&self) -> usize {
        self.shape().elements()
    }

    /// Bytes occupied on a device, where elements are always stored as `f32`.
    pub fn size(&self) -> usize {
        self.elements() * mem::size_of::<f32>()
    }
}

#[derive(Clone, PartialEq)]
pub struct Tensor {
    pub(crate) data: Box<[f32]>,
    pub(crate) layout: Layout,
}

impl Tensor {
    /// Builds a tensor, rounding every value to the layout's dtype.
    pub fn from_vec(layout: Layout, data: Vec<f32>) -> Result<Self> {
        if data.len() != layout.elements() {
            return Err(Error::Shape(format!(
                "{} values do not fill a {layout} tensor",
                data.len()
            )));
        }

        Ok(Self::from_parts(data.into_boxed_slice(), layout))
    }

    pub fn from_scalar(value: f32, dtype: DType) -> Self {
        Self::full(Layout::scalar(dtype), value)
    }

    pub fn full(layout: Layout, value: f32) -> Self {
        let data = vec![value; layout.elements()].into_boxed_slice();

        Self::from_parts(data, layout)
    }

    pub fn zeros(layout: Layout) -> Self {
        Self::full(layout, 0.0)
    }

    /// Samples from `N(0, 1)` using the Box-Muller transform.
    pub fn randn(layout: Layout, rng: &mut impl Rng) -> Self {
        let len = layout.elements();
        let mut values = Vec::with_capacity(len);

        while values.len() < len {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;

            values.push(r * theta.cos());

            if values.len() < len {
                values.push(r * theta.sin());
            }
        }

        Self::from_parts(values.into_boxed_slice(), layout)
    }

    pub(crate) fn from_parts(mut data: Box<[f32]>, layout: Layout) -> Self {
        if layout.dtype != DType::F32 {
            for value in data.iter_mut() {
                *value = layout.dtype.round(*value);
            }
        }

        Self { data, layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn dims(&self) -> &[usize] {
        self.layout.dims()
    }

    pub fn dtype(&self) -> DType {
        self.layout.dtype
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Largest elementwise `|self - other|`. Any NaN difference makes the
    /// result NaN.
    pub fn max_abs_diff(&self, other: &Tensor) -> Result<f32> {
        if self.layout != other.layout {
            return Err(Error::Shape(format!(
                "cannot compare {} with {}",
                self.layout, other.layout
            )));
        }

        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, |max, diff| {
                if diff.is_nan() || diff > max {
                    diff
                } else {
                    max
                }
            }))
    }

    /// Elementwise `|self - other| <= atol + rtol * |other|`. NaNs never match.
    pub fn all_close(&self, other: &Tensor, rtol: f32, atol: f32) -> bool {
        self.dims() == other.dims()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| (a - b).abs() <= atol + rtol * b.abs())
    }

    fn write_values(
        &self,
        f: &mut Formatter<'_>,
        offset: usize,
        depth: usize,
        width: usize,
    ) -> fmt::Result {
        let dims = self.dims();
        let strides = self.layout.strides();

        f.write_str("[")?;

        for index in 0..dims[depth] {
            if index > 0 {
                if depth + 1 == dims.len() {
                    f.write_str(", ")?;
                } else {
                    f.write_str(",")?;
                    f.write_str(&"\n".repeat(dims.len() - depth - 1))?;
                    f.write_str(&" ".repeat("tensor(".len() + depth + 1))?;
                }
            }

            let offset = offset + index * strides[depth];

            if depth + 1 == dims.len() {
                write!(f, "{:>width$.4}", self.data[offset])?;
            } else {
                self.write_values(f, offset, depth + 1, width)?;
            }
        }

        f.write_str("]")
    }
}

impl Display for Tensor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("tensor(")?;

        if self.layout.rank() == 0 {
            write!(f, "{:.4}", self.data[0])?;
        } else if self.data.is_empty() {
            let dims = self
                .dims()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>();

            match dims.as_slice() {
                [dim] => write!(f, "[], size=({dim},)")?,
                dims => write!(f, "[], size=({})", dims.join(", "))?,
            }
        } else {
            let width = self
                .data
                .iter()
                .map(|value| format!("{value:.4}").len())
                .max()
                .unwrap_or(0);

            self.write_values(f, 0, 0, width)?;
        }

        write!(f, ", dtype={})", self.dtype())
    }
}

impl Debug for Tensor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor<{}>{:?}", self.layout, self.data)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn strides_are_row_major() {
        let shape = Shape::from([2, 3, 4]);

        assert_eq!(shape.strides(), &[12, 4, 1]);
        assert_eq!(shape.elements(), 24);
        assert_eq!(Shape::from([0usize; 0]).strides(), &[] as &[usize]);
        assert_eq!(Shape::from([0usize; 0]).elements(), 1);
    }

    #[test]
    fn construction_rounds_to_dtype() {
        let layout = Layout::new([2], DType::BF16);
        let tensor = Tensor::from_vec(layout, vec![1.0 / 3.0, 100.3]).unwrap();

        assert_eq!(tensor.data()[0], bf16::from_f32(1.0 / 3.0).to_f32());
        assert_eq!(tensor.data()[1], 100.5);
        assert_ne!(tensor.data()[0], 1.0 / 3.0);
    }

    #[test]
    fn from_vec_checks_element_count() {
        let result = Tensor::from_vec(Layout::new([2, 2], DType::F32), vec![1.0; 3]);

        assert!(matches!(result, Err(Error::Shape(_))));
    }

    #[test]
    fn randn_is_seeded_and_roughly_standard() {
        let layout = Layout::new([64, 64], DType::F32);

        let a = Tensor::randn(layout.clone(), &mut StdRng::seed_from_u64(3));
        let b = Tensor::randn(layout, &mut StdRng::seed_from_u64(3));

        assert_eq!(a, b);

        let mean = a.data().iter().sum::<f32>() / a.data().len() as f32;
        let variance =
            a.data().iter().map(|x| (x - mean).powi(2)).sum::<f32>() / a.data().len() as f32;

        assert!(mean.abs() < 0.1, "mean = {mean}");
        assert!((variance - 1.0).abs() < 0.1, "variance = {variance}");
    }

    #[test]
    fn comparisons() {
        let layout = Layout::new([3], DType::F32);
        let a = Tensor::from_vec(layout.clone(), vec![1.0, 2.0, 3.0]).unwrap();
        let b = Tensor::from_vec(layout, vec![1.0, 2.5, 3.0]).unwrap();

        assert_eq!(a.max_abs_diff(&b).unwrap(), 0.5);
        assert!(a.all_close(&b, 0.0, 0.5));
        assert!(!a.all_close(&b, 0.0, 0.4));
        assert!(a.max_abs_diff(&Tensor::zeros(Layout::new([3], DType::BF16))).is_err());
    }

    #[test]
    fn nan_divergence_is_reported() {
        let layout = Layout::new([2], DType::BF16);
        let eager = Tensor::from_vec(layout.clone(), vec![0.5, 0.5]).unwrap();
        let compiled = Tensor::from_vec(layout.clone(), vec![f32::NAN, 0.5]).unwrap();
        let late = Tensor::from_vec(layout, vec![0.5, f32::NAN]).unwrap();

        assert!(eager.max_abs_diff(&compiled).unwrap().is_nan());
        assert!(eager.max_abs_diff(&late).unwrap().is_nan());
        assert!(!compiled.all_close(&eager, 1.6e-2, 1e-2));
    }

    #[test]
    fn display_matrix() {
        let layout = Layout::new([2, 2], DType::BF16);
        let tensor = Tensor::from_vec(layout, vec![0.5, -1.0, 2.0, 10.0]).unwrap();

        assert_eq!(
            tensor.to_string(),
            "tensor([[ 0.5000, -1.0000],\n        [ 2.0000, 10.0000]], dtype=bfloat16)"
        );
    }

    #[test]
    fn display_scalar_and_empty() {
        assert_eq!(
            Tensor::from_scalar(0.5, DType::F32).to_string(),
            "tensor(0.5000, dtype=float32)"
        );
        assert_eq!(
            Tensor::zeros(Layout::new([0, 3], DType::F16)).to_string(),
            "tensor([], size=(0, 3), dtype=float16)"
        );
        assert_eq!(
            Tensor::zeros(Layout::new([0], DType::F32)).to_string(),
            "tensor([], size=(0,), dtype=float32)"
        );
    }
}
