//! Dense tensors backed by `ndarray`.
//!
//! Elements are held in one of three host types wide enough to represent
//! every value of the storage dtype exactly, so a tensor that is loaded and
//! saved again keeps its bytes. Arithmetic only happens in [`Tensor::scaled`]
//! and [`Tensor::scaled_add`].

use std::borrow::Cow;

use ndarray::{ArrayD, ArrayViewD, IxDyn, ShapeBuilder};

use crate::{CheckpointError, Dtype, Result};

/// Host-side element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    /// `F32`, `F16` and `BF16` elements.
    F32(ArrayD<f32>),
    /// `F64` elements.
    F64(ArrayD<f64>),
    /// Integer and boolean elements.
    Int(ArrayD<i64>),
}

impl TensorData {
    fn shape(&self) -> &[usize] {
        match self {
            Self::F32(a) => a.shape(),
            Self::F64(a) => a.shape(),
            Self::Int(a) => a.shape(),
        }
    }

    fn to_f32(&self) -> Cow<'_, ArrayD<f32>> {
        match self {
            Self::F32(a) => Cow::Borrowed(a),
            Self::F64(a) => Cow::Owned(a.mapv(|v| v as f32)),
            Self::Int(a) => Cow::Owned(a.mapv(|v| v as f32)),
        }
    }

    fn to_f64(&self) -> Cow<'_, ArrayD<f64>> {
        match self {
            Self::F32(a) => Cow::Owned(a.mapv(f64::from)),
            Self::F64(a) => Cow::Borrowed(a),
            Self::Int(a) => Cow::Owned(a.mapv(|v| v as f64)),
        }
    }
}

/// A dense numeric array with a fixed shape and a storage dtype.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: TensorData,
    dtype: Dtype,
}

impl Tensor {
    /// Build an `f32` tensor from row-major values.
    pub fn from_f32(shape: &[usize], values: Vec<f32>) -> Result<Self> {
        Ok(Self {
            data: TensorData::F32(shaped(shape, values)?),
            dtype: Dtype::F32,
        })
    }

    /// Build an `f64` tensor from row-major values.
    pub fn from_f64(shape: &[usize], values: Vec<f64>) -> Result<Self> {
        Ok(Self {
            data: TensorData::F64(shaped(shape, values)?),
            dtype: Dtype::F64,
        })
    }

    /// Build an integer or boolean tensor from row-major values.
    pub fn from_i64(shape: &[usize], values: Vec<i64>, dtype: Dtype) -> Result<Self> {
        if dtype.is_float() {
            return Err(CheckpointError::UnsupportedDtype(format!(
                "{dtype} cannot hold integer values"
            )));
        }
        Ok(Self {
            data: TensorData::Int(shaped(shape, values)?),
            dtype,
        })
    }

    /// Build a tensor of any dtype from `f32` values.
    ///
    /// Values are converted to the dtype's precision; integer dtypes round.
    pub fn from_vec(shape: &[usize], values: Vec<f32>, dtype: Dtype) -> Result<Self> {
        match dtype {
            Dtype::F64 => Self::from_f64(shape, values.into_iter().map(f64::from).collect()),
            Dtype::F32 => Self::from_f32(shape, values),
            Dtype::F16 => Self::narrowed(shape, values, dtype, |v| half::f16::from_f32(v).to_f32()),
            Dtype::BF16 => Self::narrowed(shape, values, dtype, |v| half::bf16::from_f32(v).to_f32()),
            _ => Self::from_i64(
                shape,
                values.into_iter().map(|v| v.round() as i64).collect(),
                dtype,
            ),
        }
    }

    fn narrowed(
        shape: &[usize],
        values: Vec<f32>,
        dtype: Dtype,
        round: fn(f32) -> f32,
    ) -> Result<Self> {
        Ok(Self {
            data: TensorData::F32(shaped(shape, values.into_iter().map(round).collect())?),
            dtype,
        })
    }

    /// Decode little-endian element bytes of `dtype`.
    pub fn from_bytes(shape: &[usize], dtype: Dtype, bytes: &[u8]) -> Result<Self> {
        let data = match dtype {
            Dtype::F64 => TensorData::F64(shaped(shape, read_le::<f64, _>(bytes, |v| v))?),
            Dtype::F32 => TensorData::F32(shaped(shape, read_le::<f32, _>(bytes, |v| v))?),
            Dtype::F16 => TensorData::F32(shaped(shape, read_le(bytes, half::f16::to_f32))?),
            Dtype::BF16 => TensorData::F32(shaped(shape, read_le(bytes, half::bf16::to_f32))?),
            Dtype::I64 => TensorData::Int(shaped(shape, read_le::<i64, _>(bytes, |v| v))?),
            Dtype::I32 => TensorData::Int(shaped(shape, read_le(bytes, |v: i32| i64::from(v)))?),
            Dtype::I16 => TensorData::Int(shaped(shape, read_le(bytes, |v: i16| i64::from(v)))?),
            Dtype::I8 => TensorData::Int(shaped(shape, read_le(bytes, |v: i8| i64::from(v)))?),
            Dtype::U32 => TensorData::Int(shaped(shape, read_le(bytes, |v: u32| i64::from(v)))?),
            Dtype::U8 => TensorData::Int(shaped(shape, read_le(bytes, |v: u8| i64::from(v)))?),
            Dtype::Bool => {
                TensorData::Int(shaped(shape, read_le(bytes, |b: u8| i64::from(b != 0)))?)
            }
        };
        Ok(Self { data, dtype })
    }

    /// Encode the elements as little-endian bytes of the storage dtype.
    ///
    /// Integer values outside the dtype's range saturate.
    pub fn to_bytes(&self) -> Vec<u8> {
        match &self.data {
            TensorData::F64(a) => write_le(a, |v| v),
            TensorData::F32(a) => match self.dtype {
                Dtype::F16 => write_le(a, half::f16::from_f32),
                Dtype::BF16 => write_le(a, half::bf16::from_f32),
                _ => write_le(a, |v| v),
            },
            TensorData::Int(a) => match self.dtype {
                Dtype::I32 => write_le(a, |v| v.clamp(i32::MIN.into(), i32::MAX.into()) as i32),
                Dtype::I16 => write_le(a, |v| v.clamp(i16::MIN.into(), i16::MAX.into()) as i16),
                Dtype::I8 => write_le(a, |v| v.clamp(i8::MIN.into(), i8::MAX.into()) as i8),
                Dtype::U32 => write_le(a, |v| v.clamp(0, u32::MAX.into()) as u32),
                Dtype::U8 => write_le(a, |v| v.clamp(0, u8::MAX.into()) as u8),
                Dtype::Bool => write_le(a, |v| u8::from(v != 0)),
                _ => write_le(a, |v| v),
            },
        }
    }

    /// Copy the elements a strided layout selects from this tensor's flat
    /// storage into a new row-major tensor of the same dtype.
    ///
    /// `strides` and `offset` count elements, not bytes.
    pub fn gather_strided(
        &self,
        shape: &[usize],
        strides: &[usize],
        offset: usize,
    ) -> Result<Self> {
        let data = match &self.data {
            TensorData::F32(a) => TensorData::F32(gather(a, shape, strides, offset)?),
            TensorData::F64(a) => TensorData::F64(gather(a, shape, strides, offset)?),
            TensorData::Int(a) => TensorData::Int(gather(a, shape, strides, offset)?),
        };
        Ok(Self {
            data,
            dtype: self.dtype,
        })
    }

    /// Tensor shape.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Storage dtype.
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Underlying storage.
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Elements in row-major order, converted to `f32`.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.to_f32().iter().copied().collect()
    }

    /// Elements in row-major order, converted to `f64`.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.data.to_f64().iter().copied().collect()
    }

    /// Elements in row-major order for integer and boolean tensors.
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        match &self.data {
            TensorData::Int(a) => Some(a.iter().copied().collect()),
            _ => None,
        }
    }

    /// Shape rendered as a tuple, e.g. `(2, 3)`, `(4,)` or `()`.
    pub fn shape_string(&self) -> String {
        format_shape(self.shape())
    }

    /// Return `alpha * self`.
    ///
    /// Float tensors keep their dtype; integer and boolean tensors are
    /// promoted to `f32`.
    pub fn scaled(&self, alpha: f32) -> Self {
        match &self.data {
            TensorData::F64(a) => Self {
                data: TensorData::F64(a.mapv(|v| v * f64::from(alpha))),
                dtype: self.dtype,
            },
            TensorData::F32(a) => Self {
                data: TensorData::F32(a.mapv(|v| v * alpha)),
                dtype: self.dtype,
            },
            TensorData::Int(a) => Self {
                data: TensorData::F32(a.mapv(|v| v as f32 * alpha)),
                dtype: Dtype::F32,
            },
        }
    }

    /// In-place `self += alpha * other`.
    ///
    /// Sums involving an `f64` tensor are carried in `f64`. Fails without
    /// touching `self` when the shapes differ.
    pub fn scaled_add(&mut self, alpha: f32, other: &Tensor) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(CheckpointError::ShapeMismatch {
                expected: self.shape().to_vec(),
                actual: other.shape().to_vec(),
            });
        }

        let widen = matches!(other.data, TensorData::F64(_));
        if widen && !matches!(self.data, TensorData::F64(_)) {
            self.data = TensorData::F64(self.data.to_f64().into_owned());
            self.dtype = Dtype::F64;
        } else if let TensorData::Int(a) = &self.data {
            self.data = TensorData::F32(a.mapv(|v| v as f32));
            self.dtype = Dtype::F32;
        }

        match &mut self.data {
            TensorData::F64(sum) => sum.scaled_add(f64::from(alpha), &*other.data.to_f64()),
            TensorData::F32(sum) => sum.scaled_add(alpha, &*other.data.to_f32()),
            TensorData::Int(_) => {}
        }
        Ok(())
    }
}

fn shaped<T>(shape: &[usize], values: Vec<T>) -> Result<ArrayD<T>> {
    let len = values.len();
    ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|_| CheckpointError::InvalidShape {
        shape: shape.to_vec(),
        len,
    })
}

fn gather<T: Clone>(
    storage: &ArrayD<T>,
    shape: &[usize],
    strides: &[usize],
    offset: usize,
) -> Result<ArrayD<T>> {
    let invalid = || CheckpointError::InvalidShape {
        shape: shape.to_vec(),
        len: storage.len().saturating_sub(offset),
    };
    let flat = storage.as_slice().ok_or_else(invalid)?;
    let tail = flat.get(offset..).ok_or_else(invalid)?;
    let view = ArrayViewD::from_shape(IxDyn(shape).strides(IxDyn(strides)), tail)
        .map_err(|_| invalid())?;
    shaped(shape, view.iter().cloned().collect())
}

fn read_le<T: bytemuck::AnyBitPattern, U>(bytes: &[u8], convert: impl Fn(T) -> U) -> Vec<U> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(|chunk| convert(bytemuck::pod_read_unaligned(chunk)))
        .collect()
}

fn write_le<T: Copy, U: bytemuck::Pod>(values: &ArrayD<T>, convert: impl Fn(T) -> U) -> Vec<u8> {
    let converted: Vec<U> = values.iter().map(|&v| convert(v)).collect();
    bytemuck::cast_slice(&converted).to_vec()
}

/// Render a shape the way a Python tuple prints.
pub fn format_shape(shape: &[usize]) -> String {
    match shape {
        [] => "()".to_string(),
        [dim] => format!("({dim},)"),
        dims => {
            let dims: Vec<String> = dims.iter().map(ToString::to_string).collect();
            format!("({})", dims.join(", "))
        }
    }
}
