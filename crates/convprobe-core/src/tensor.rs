use std::fmt;

use bytes::Bytes;
use smallvec::SmallVec;

use crate::{Error, Result, ShapedType};

const FLOAT_BIT: u32 = 0x1000_0000;
const SIGNED_INT_BIT: u32 = 0x2000_0000;

/// Element type of a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NumericKind {
    Int8,
    Int32,
    Float16,
    Float32,
    Unknown,
}

impl NumericKind {
    pub const ALL: [NumericKind; 5] = [
        NumericKind::Int8,
        NumericKind::Int32,
        NumericKind::Float16,
        NumericKind::Float32,
        NumericKind::Unknown,
    ];

    /// Bytes per element, `None` for [`NumericKind::Unknown`].
    pub fn byte_width(self) -> Option<usize> {
        match self {
            NumericKind::Int8 => Some(1),
            NumericKind::Int32 => Some(4),
            NumericKind::Float16 => Some(2),
            NumericKind::Float32 => Some(4),
            NumericKind::Unknown => None,
        }
    }

    /// Raw type code as reported by the graph engine: a family bit ORed with the bit width.
    pub fn raw_value(self) -> u32 {
        match self {
            NumericKind::Int8 => SIGNED_INT_BIT | 8,
            NumericKind::Int32 => SIGNED_INT_BIT | 32,
            NumericKind::Float16 => FLOAT_BIT | 16,
            NumericKind::Float32 => FLOAT_BIT | 32,
            NumericKind::Unknown => 0,
        }
    }
}

impl fmt::Display for NumericKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NumericKind::Int8 => "int8",
            NumericKind::Int32 => "int32",
            NumericKind::Float16 => "float16",
            NumericKind::Float32 => "float32",
            NumericKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Element count, `None` when the product of extents overflows.
    pub fn numel(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Exact byte length of a dense tensor of this shape.
    ///
    /// `None` when the kind has no width or the size does not fit in `usize`.
    pub fn byte_len(&self, kind: NumericKind) -> Option<usize> {
        self.numel()?.checked_mul(kind.byte_width()?)
    }

    pub(crate) fn ensure_positive(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::invalid_shape(&self.0, "rank must be at least 1"));
        }
        if let Some(axis) = self.0.iter().position(|&d| d == 0) {
            return Err(Error::invalid_shape(
                &self.0,
                format!("dimension {axis} must be positive"),
            ));
        }
        // Widest element, so the byte length of every kind fits.
        if self.byte_len(NumericKind::Float32).is_none() {
            return Err(Error::invalid_shape(&self.0, "byte size overflows usize"));
        }
        Ok(())
    }
}

impl From<&[usize]> for Shape {
    fn from(d: &[usize]) -> Self {
        Self::from_slice(d)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(d: [usize; N]) -> Self {
        Self::from_slice(&d)
    }
}

/// Zero-filled memory owned by a device.
#[derive(Clone, Debug)]
pub struct DeviceBuffer {
    bytes: Bytes,
}

impl DeviceBuffer {
    /// Reserves exactly `len` bytes and fills them with zeros.
    pub fn zeroed(len: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|source| Error::Allocation { len, source })?;
        data.resize(len, 0);
        Ok(Self {
            bytes: Bytes::from(data),
        })
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

/// A buffer bound to the shaped type it is read as.
#[derive(Clone, Debug)]
pub struct TensorData {
    pub desc: ShapedType,
    pub buffer: DeviceBuffer,
}

impl TensorData {
    /// Binds `buffer` to `desc`; the buffer must hold exactly one dense tensor of `desc`.
    pub fn bind(buffer: DeviceBuffer, desc: ShapedType) -> Result<Self> {
        let expected = desc.byte_len().ok_or_else(|| {
            Error::contract(format!("cannot bind a buffer to {} elements", desc.kind))
        })?;
        if buffer.len() != expected {
            return Err(Error::contract(format!(
                "buffer holds {} bytes, {:?} x {} needs {}",
                buffer.len(),
                desc.shape.dims(),
                desc.kind,
                expected
            )));
        }
        Ok(Self { desc, buffer })
    }

    pub fn bytes(&self) -> &Bytes {
        self.buffer.bytes()
    }
}
