//! On-disk volume formats.
//!
//! Every reader hands out a [`SliceSource`], which can load any run of
//! consecutive z slices without touching the rest of the file.

#[cfg(feature = "hdf5")]
pub mod hdf5;
pub mod meta_image;
pub mod npy;
pub mod raw;
pub mod tiff;

use std::ops::Range;

use half::f16;
use ndarray::Array3;
use rayon::prelude::*;

use crate::enums::{ByteOrder, ElementType};
use crate::geometry::Shape3;
use crate::volume_loader::ReadError;

pub use raw::{RawLayout, RawSource};

pub trait SliceSource: Send + Sync {
    fn shape(&self) -> Shape3;

    fn element_type(&self) -> ElementType;

    /// Voxel spacing `(x, y, z)`
    fn spacing(&self) -> [f64; 3] {
        [1.0; 3]
    }

    /// Position of the first voxel `(x, y, z)`
    fn origin(&self) -> [f64; 3] {
        [0.0; 3]
    }

    /// Byte layout, for sources backed by an uncompressed array
    fn layout(&self) -> Option<&RawLayout> {
        None
    }

    /// Read slices `z` into an array indexed `[z, y, x]`
    fn read_slices(&self, z: Range<usize>) -> Result<Array3<f32>, ReadError>;
}

macro_rules! decode_as {
    ($bytes:expr, $out:expr, $order:expr, $t:ty, $to_f32:expr) => {{
        const N: usize = std::mem::size_of::<$t>();
        $out.par_iter_mut()
            .zip($bytes.par_chunks_exact(N))
            .for_each(|(dst, chunk)| {
                let mut raw = [0u8; N];
                raw.copy_from_slice(chunk);
                let value = match $order {
                    ByteOrder::Little => <$t>::from_le_bytes(raw),
                    ByteOrder::Big => <$t>::from_be_bytes(raw),
                };
                *dst = $to_f32(value);
            });
    }};
}

/// Decode packed samples into `out`. `bytes` must hold exactly
/// `out.len() * element_type.size()` bytes.
pub(crate) fn decode_samples(
    bytes: &[u8],
    element_type: ElementType,
    byte_order: ByteOrder,
    out: &mut [f32],
) {
    debug_assert_eq!(bytes.len(), out.len() * element_type.size());
    match element_type {
        ElementType::I8 => decode_as!(bytes, out, byte_order, i8, |v: i8| v as f32),
        ElementType::U8 => decode_as!(bytes, out, byte_order, u8, |v: u8| v as f32),
        ElementType::I16 => decode_as!(bytes, out, byte_order, i16, |v: i16| v as f32),
        ElementType::U16 => decode_as!(bytes, out, byte_order, u16, |v: u16| v as f32),
        ElementType::I32 => decode_as!(bytes, out, byte_order, i32, |v: i32| v as f32),
        ElementType::U32 => decode_as!(bytes, out, byte_order, u32, |v: u32| v as f32),
        ElementType::F16 => decode_as!(bytes, out, byte_order, f16, |v: f16| v.to_f32()),
        ElementType::F32 => decode_as!(bytes, out, byte_order, f32, |v: f32| v),
        ElementType::F64 => decode_as!(bytes, out, byte_order, f64, |v: f64| v as f32),
    }
}

macro_rules! encode_as {
    ($samples:expr, $order:expr, $t:ty, $from_f32:expr) => {{
        let values: Vec<$t> = $samples.par_iter().map(|&v| $from_f32(v)).collect();
        if $order == ByteOrder::native() {
            bytemuck::cast_slice::<$t, u8>(&values).to_vec()
        } else {
            values
                .iter()
                .flat_map(|v| match $order {
                    ByteOrder::Little => v.to_le_bytes(),
                    ByteOrder::Big => v.to_be_bytes(),
                })
                .collect()
        }
    }};
}

/// Encode samples as `element_type`. Integer targets are rounded and
/// saturated; NaN becomes zero.
pub(crate) fn encode_samples(samples: &[f32], element_type: ElementType, byte_order: ByteOrder) -> Vec<u8> {
    match element_type {
        ElementType::I8 => encode_as!(samples, byte_order, i8, |v: f32| v.round() as i8),
        ElementType::U8 => encode_as!(samples, byte_order, u8, |v: f32| v.round() as u8),
        ElementType::I16 => encode_as!(samples, byte_order, i16, |v: f32| v.round() as i16),
        ElementType::U16 => encode_as!(samples, byte_order, u16, |v: f32| v.round() as u16),
        ElementType::I32 => encode_as!(samples, byte_order, i32, |v: f32| v.round() as i32),
        ElementType::U32 => encode_as!(samples, byte_order, u32, |v: f32| v.round() as u32),
        ElementType::F16 => encode_as!(samples, byte_order, f16, f16::from_f32),
        ElementType::F32 => encode_as!(samples, byte_order, f32, |v: f32| v),
        ElementType::F64 => encode_as!(samples, byte_order, f64, |v: f32| v as f64),
    }
}
