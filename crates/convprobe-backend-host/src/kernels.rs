use bytes::Bytes;
use convprobe_core::{Error, NumericKind, Result};
use half::f16;
use rayon::prelude::*;

/// Reads little-endian elements of `kind` into `f32` working values.
pub(crate) fn decode(bytes: &[u8], kind: NumericKind) -> Result<Vec<f32>> {
    let width = kind
        .byte_width()
        .ok_or_else(|| Error::contract(format!("cannot decode {kind} data")))?;
    if bytes.len() % width != 0 {
        return Err(Error::contract(format!(
            "{} bytes is not a whole number of {kind} elements",
            bytes.len()
        )));
    }

    Ok(match kind {
        NumericKind::Int8 => bytes.iter().map(|&b| f32::from(b as i8)).collect(),
        NumericKind::Int32 => bytes
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32)
            .collect(),
        NumericKind::Float16 => bytes
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        NumericKind::Float32 => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        NumericKind::Unknown => unreachable!("unknown kind has no width"),
    })
}

/// Writes working values back out as little-endian elements of `kind`.
pub(crate) fn encode(values: &[f32], kind: NumericKind) -> Result<Bytes> {
    let width = kind
        .byte_width()
        .ok_or_else(|| Error::contract(format!("cannot encode {kind} data")))?;
    let mut out = Vec::with_capacity(values.len() * width);
    for &v in values {
        match kind {
            NumericKind::Int8 => out.push(saturate(v, i8::MIN.into(), i8::MAX.into()) as i8 as u8),
            NumericKind::Int32 => {
                let v = saturate(v, i32::MIN as f32, i32::MAX as f32) as i32;
                out.extend_from_slice(&v.to_le_bytes());
            }
            NumericKind::Float16 => out.extend_from_slice(&f16::from_f32(v).to_le_bytes()),
            NumericKind::Float32 => out.extend_from_slice(&v.to_le_bytes()),
            NumericKind::Unknown => unreachable!("unknown kind has no width"),
        }
    }
    Ok(Bytes::from(out))
}

/// Rounds every value to the nearest one representable in `kind`.
///
/// Integers saturate; NaN becomes zero.
pub(crate) fn quantize(values: &mut [f32], kind: NumericKind) {
    match kind {
        NumericKind::Int8 => {
            for v in values {
                *v = saturate(*v, i8::MIN.into(), i8::MAX.into());
            }
        }
        NumericKind::Int32 => {
            for v in values {
                *v = saturate(*v, i32::MIN as f32, i32::MAX as f32);
            }
        }
        NumericKind::Float16 => {
            for v in values {
                *v = f16::from_f32(*v).to_f32();
            }
        }
        NumericKind::Float32 | NumericKind::Unknown => {}
    }
}

fn saturate(v: f32, lo: f32, hi: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.round().clamp(lo, hi)
    }
}

/// Geometry of one NCHW / OIHW convolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Conv2dParams {
    pub batch: usize,
    pub in_channels: usize,
    pub height: usize,
    pub width: usize,
    pub out_channels: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub stride_y: usize,
    pub stride_x: usize,
    pub dilation_y: usize,
    pub dilation_x: usize,
    pub pad_top: usize,
    pub pad_left: usize,
    pub groups: usize,
}

impl Conv2dParams {
    pub fn output_len(&self) -> usize {
        self.batch * self.out_channels * self.out_h * self.out_w
    }
}

/// Direct convolution over NCHW activations and OIHW weights.
///
/// Output planes are independent and computed in parallel.
pub(crate) fn conv2d_nchw(input: &[f32], weights: &[f32], p: &Conv2dParams) -> Vec<f32> {
    let ci_per_group = p.in_channels / p.groups;
    let co_per_group = p.out_channels / p.groups;
    let in_plane = p.height * p.width;
    let out_plane = p.out_h * p.out_w;
    let mut out = vec![0.0f32; p.output_len()];
    if out_plane == 0 {
        return out;
    }
    let columns: Vec<TapColumns> = (0..p.kernel_w).map(|kx| TapColumns::new(kx, p)).collect();

    out.par_chunks_mut(out_plane)
        .enumerate()
        .for_each(|(plane, dst)| {
            let b = plane / p.out_channels;
            let oc = plane % p.out_channels;
            let group = oc / co_per_group;

            for icg in 0..ci_per_group {
                let ic = group * ci_per_group + icg;
                let in_base = (b * p.in_channels + ic) * in_plane;
                let src = &input[in_base..in_base + in_plane];
                let taps = &weights[(oc * ci_per_group + icg) * p.kernel_h * p.kernel_w..];

                for ky in 0..p.kernel_h {
                    for (kx, cols) in columns.iter().enumerate() {
                        let w = taps[ky * p.kernel_w + kx];
                        accumulate_tap(src, dst, w, ky, cols, p);
                    }
                }
            }
        });
    out
}

/// Output columns `lo..hi` whose input column for one kernel column lies inside the row.
#[derive(Clone, Copy, Debug)]
struct TapColumns {
    lo: usize,
    hi: usize,
    /// Input column read by output column `lo`.
    first: usize,
}

impl TapColumns {
    fn new(kx: usize, p: &Conv2dParams) -> Self {
        let offset = kx * p.dilation_x;
        // ix = ox * stride + offset - pad_left must satisfy 0 <= ix < width.
        let lo = p.pad_left.saturating_sub(offset).div_ceil(p.stride_x);
        let hi = (p.width + p.pad_left)
            .saturating_sub(offset)
            .div_ceil(p.stride_x)
            .min(p.out_w);
        let first = (lo * p.stride_x + offset).saturating_sub(p.pad_left);
        Self { lo, hi, first }
    }
}

fn accumulate_tap(
    src: &[f32],
    dst: &mut [f32],
    w: f32,
    ky: usize,
    cols: &TapColumns,
    p: &Conv2dParams,
) {
    if cols.lo >= cols.hi {
        return;
    }
    let row_offset = ky * p.dilation_y;

    for oy in 0..p.out_h {
        let Some(iy) = (oy * p.stride_y + row_offset).checked_sub(p.pad_top) else {
            continue;
        };
        if iy >= p.height {
            continue;
        }
        let src_row = &src[iy * p.width + cols.first..(iy + 1) * p.width];
        let dst_row = &mut dst[oy * p.out_w + cols.lo..oy * p.out_w + cols.hi];

        if p.stride_x == 1 {
            for (acc, &x) in dst_row.iter_mut().zip(src_row) {
                *acc += w * x;
            }
        } else {
            for (acc, &x) in dst_row.iter_mut().zip(src_row.iter().step_by(p.stride_x)) {
                *acc += w * x;
            }
        }
    }
}
