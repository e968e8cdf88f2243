//! NumPy `.npy` files.
//!
//! Only the header is parsed; samples are read through [`RawSource`] at the
//! offset the header reports, so large files are never loaded whole.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use ndarray::{Array3, ArrayView3};
use ndarray_npy::{WritableElement, WriteNpyError, WriteNpyExt};
use thiserror::Error;
use tracing::debug;

use crate::enums::{ByteOrder, ElementType, StorageOrder};
use crate::formats::{RawLayout, RawSource};
use crate::volume::Volume;
use crate::volume_loader::ReadError;

const MAGIC: &[u8; 6] = b"\x93NUMPY";

#[derive(Debug, Error)]
pub enum NpyError {
    #[error("not a NumPy file: bad magic string")]
    BadMagic,

    #[error("unsupported NumPy format version {0}.{1}")]
    UnsupportedVersion(u8, u8),

    #[error("malformed NumPy header: {0}")]
    MalformedHeader(String),

    #[error("unsupported NumPy dtype '{0}'")]
    UnsupportedDtype(String),

    #[error("unsupported array rank {0}: expected 2 or 3 dimensions")]
    UnsupportedRank(usize),

    #[error("cannot write NumPy file: {0}")]
    Write(#[from] WriteNpyError),
}

#[derive(Clone, Debug, PartialEq)]
pub struct NpyHeader {
    pub version: (u8, u8),
    /// Offset of the first sample, magic string included
    pub header_length: u64,
    pub descr: String,
    pub element_type: ElementType,
    pub byte_order: ByteOrder,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
}

impl NpyHeader {
    pub fn read_from(reader: &mut impl Read) -> Result<Self, ReadError> {
        let mut preamble = [0u8; 8];
        reader.read_exact(&mut preamble)?;
        if &preamble[..6] != MAGIC {
            return Err(NpyError::BadMagic.into());
        }
        let version = (preamble[6], preamble[7]);
        let (dict_len, len_size) = match version.0 {
            1 => {
                let mut len = [0u8; 2];
                reader.read_exact(&mut len)?;
                (u16::from_le_bytes(len) as usize, 2)
            }
            2 | 3 => {
                let mut len = [0u8; 4];
                reader.read_exact(&mut len)?;
                (u32::from_le_bytes(len) as usize, 4)
            }
            _ => return Err(NpyError::UnsupportedVersion(version.0, version.1).into()),
        };

        let mut dict = vec![0u8; dict_len];
        reader.read_exact(&mut dict)?;
        let dict = String::from_utf8_lossy(&dict);
        let header_length = (MAGIC.len() + 2 + len_size + dict_len) as u64;
        Ok(Self::parse_dict(&dict, version, header_length)?)
    }

    /// Parse the Python dict literal that follows the preamble.
    pub fn parse_dict(dict: &str, version: (u8, u8), header_length: u64) -> Result<Self, NpyError> {
        let descr = dict_value(dict, "descr")
            .ok_or_else(|| NpyError::MalformedHeader("missing 'descr'".into()))?;
        let fortran_order = match dict_value(dict, "fortran_order") {
            Some("True") => true,
            Some("False") => false,
            other => {
                return Err(NpyError::MalformedHeader(format!(
                    "bad 'fortran_order' value {other:?}"
                )));
            }
        };
        let shape = dict_value(dict, "shape")
            .ok_or_else(|| NpyError::MalformedHeader("missing 'shape'".into()))
            .and_then(parse_shape)?;
        let (element_type, byte_order) = parse_descr(descr)?;

        Ok(Self {
            version,
            header_length,
            descr: descr.to_string(),
            element_type,
            byte_order,
            fortran_order,
            shape,
        })
    }

    pub fn storage_order(&self) -> StorageOrder {
        if self.fortran_order {
            StorageOrder::Fortran
        } else {
            StorageOrder::C
        }
    }

    /// Three dimensional array shape as stored. 2D images gain a single
    /// slice on their slowest axis.
    pub fn shape_3d(&self) -> Result<[usize; 3], NpyError> {
        match (self.shape.as_slice(), self.fortran_order) {
            ([a, b, c], _) => Ok([*a, *b, *c]),
            ([y, x], false) => Ok([1, *y, *x]),
            ([x, y], true) => Ok([*x, *y, 1]),
            (other, _) => Err(NpyError::UnsupportedRank(other.len())),
        }
    }

    pub fn raw_layout(&self) -> Result<RawLayout, NpyError> {
        Ok(RawLayout::new(self.shape_3d()?, self.element_type)
            .with_byte_order(self.byte_order)
            .with_storage_order(self.storage_order())
            .with_header_length(self.header_length))
    }
}

fn dict_value<'a>(dict: &'a str, key: &str) -> Option<&'a str> {
    let start = ["'", "\""].iter().find_map(|q| {
        let needle = format!("{q}{key}{q}");
        dict.find(&needle).map(|i| i + needle.len())
    })?;
    let rest = dict[start..].trim_start();
    let rest = rest.strip_prefix(':')?.trim_start();

    let quote = rest.chars().next()?;
    match quote {
        '\'' | '"' => {
            let body = &rest[1..];
            body.find(quote).map(|end| &body[..end])
        }
        '(' => rest.find(')').map(|end| &rest[..=end]),
        _ => {
            let end = rest.find([',', '}']).unwrap_or(rest.len());
            Some(rest[..end].trim())
        }
    }
}

fn parse_shape(tuple: &str) -> Result<Vec<usize>, NpyError> {
    let inner = tuple
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .ok_or_else(|| NpyError::MalformedHeader(format!("bad shape {tuple}")))?;
    inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            // numpy may write long ints as `10L` on old versions
            s.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|_| NpyError::MalformedHeader(format!("bad shape {tuple}")))
        })
        .collect()
}

fn parse_descr(descr: &str) -> Result<(ElementType, ByteOrder), NpyError> {
    let unsupported = || NpyError::UnsupportedDtype(descr.to_string());
    let mut chars = descr.chars();
    let byte_order = match chars.next().ok_or_else(unsupported)? {
        '<' => ByteOrder::Little,
        '>' => ByteOrder::Big,
        '|' | '=' => ByteOrder::native(),
        _ => return Err(unsupported()),
    };
    let element_type = match chars.as_str() {
        "i1" => ElementType::I8,
        "u1" => ElementType::U8,
        "i2" => ElementType::I16,
        "u2" => ElementType::U16,
        "i4" => ElementType::I32,
        "u4" => ElementType::U32,
        "f2" => ElementType::F16,
        "f4" => ElementType::F32,
        "f8" => ElementType::F64,
        _ => return Err(unsupported()),
    };
    Ok((element_type, byte_order))
}

pub fn read_header(path: impl AsRef<Path>) -> Result<NpyHeader, ReadError> {
    let mut reader = BufReader::new(File::open(path.as_ref())?);
    NpyHeader::read_from(&mut reader)
}

pub fn open(path: impl AsRef<Path>) -> Result<RawSource, ReadError> {
    let path = path.as_ref();
    let header = read_header(path)?;
    debug!(
        ?path,
        descr = %header.descr,
        shape = ?header.shape,
        fortran = header.fortran_order,
        "parsed npy header"
    );
    RawSource::open(path, header.raw_layout()?)
}

fn write_as<A: WritableElement>(
    path: &Path,
    data: ArrayView3<'_, f32>,
    fortran_order: bool,
    cast: impl Fn(f32) -> A,
) -> Result<(), WriteNpyError> {
    let typed: Array3<A> = data.mapv(cast);
    let mut writer = BufWriter::new(File::create(path)?);
    if fortran_order {
        // the transposed view is column major, so it is stored as (x, y, z)
        typed.t().write_npy(&mut writer)?;
    } else {
        typed.write_npy(&mut writer)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the volume as a `.npy` file and return the layout it was stored
/// with.
///
/// The samples are written `x` fastest either way; `fortran_order` only
/// decides whether the stored shape reads `(x, y, z)` or `(z, y, x)`.
/// Integer types are rounded and saturated. Half precision is stored as
/// `f32`.
pub fn write(
    path: impl AsRef<Path>,
    volume: &Volume,
    element_type: ElementType,
    fortran_order: bool,
) -> Result<RawLayout, ReadError> {
    let path = path.as_ref();
    let data = volume.data().view();
    match element_type {
        ElementType::I8 => write_as(path, data, fortran_order, |v| v.round() as i8),
        ElementType::U8 => write_as(path, data, fortran_order, |v| v.round() as u8),
        ElementType::I16 => write_as(path, data, fortran_order, |v| v.round() as i16),
        ElementType::U16 => write_as(path, data, fortran_order, |v| v.round() as u16),
        ElementType::I32 => write_as(path, data, fortran_order, |v| v.round() as i32),
        ElementType::U32 => write_as(path, data, fortran_order, |v| v.round() as u32),
        ElementType::F16 | ElementType::F32 => write_as(path, data, fortran_order, |v| v),
        ElementType::F64 => write_as(path, data, fortran_order, f64::from),
    }
    .map_err(NpyError::from)?;

    let header = read_header(path)?;
    debug!(?path, descr = %header.descr, shape = ?header.shape, "wrote npy");
    Ok(header.raw_layout()?)
}
