//! MetaImage (`.mhd` / `.mha`) headers.
//!
//! The header is a list of `Key = Value` lines. Samples live either in the
//! same file right after the `ElementDataFile = LOCAL` line, or in a
//! separate file named by that line.

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::enums::{ByteOrder, ElementType, StorageOrder};
use crate::formats::{RawLayout, RawSource, npy, raw};
use crate::volume::Volume;
use crate::volume_loader::ReadError;

#[derive(Debug, Error)]
pub enum MetaImageError {
    #[error("MetaImage header is missing '{0}'")]
    MissingField(&'static str),

    #[error("invalid value '{value}' for MetaImage field '{field}'")]
    InvalidValue { field: String, value: String },

    #[error("unsupported MetaImage element type '{0}'")]
    UnsupportedElementType(String),

    #[error("compressed MetaImage data is not supported")]
    Compressed,

    #[error("unsupported MetaImage dimensionality {0}")]
    UnsupportedDims(usize),

    #[error("MetaImage data with {0} channels per voxel is not supported")]
    MultiChannel(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataFile {
    /// Samples follow the header in the same file
    Local,
    External(PathBuf),
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetaImageHeader {
    /// Size along `x, y, z`
    pub dims: [usize; 3],
    pub element_type: ElementType,
    pub byte_order: ByteOrder,
    pub spacing: [f64; 3],
    pub origin: [f64; 3],
    /// Bytes to skip in the data file. `None` means the samples are the
    /// last bytes of the file (`HeaderSize = -1`).
    pub header_size: Option<u64>,
    pub data_file: DataFile,
}

impl MetaImageHeader {
    pub fn new(dims: [usize; 3], element_type: ElementType, data_file: DataFile) -> Self {
        Self {
            dims,
            element_type,
            byte_order: ByteOrder::Little,
            spacing: [1.0; 3],
            origin: [0.0; 3],
            header_size: Some(0),
            data_file,
        }
    }

    /// Parse header text. Returns the header and, for local data, the byte
    /// length of the text up to and including the `ElementDataFile` line.
    pub fn parse(reader: &mut impl BufRead) -> Result<(Self, u64), ReadError> {
        let mut ndims = None;
        let mut dims = None;
        let mut element_type = None;
        let mut byte_order = ByteOrder::Little;
        let mut spacing = [1.0; 3];
        let mut origin = [0.0; 3];
        let mut header_size = Some(0);
        let mut consumed = 0u64;

        let mut line = Vec::new();
        let data_file = loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 {
                return Err(MetaImageError::MissingField("ElementDataFile").into());
            }
            consumed += read as u64;

            let text = String::from_utf8_lossy(&line);
            let Some((key, value)) = text.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "NDims" => ndims = Some(parse_value::<usize>(key, value)?),
                "DimSize" => dims = Some(parse_triple::<usize>(key, value)?),
                "ElementType" => element_type = Some(parse_element_type(value)?),
                "ElementSpacing" | "ElementSize" => spacing = parse_triple(key, value)?,
                "Position" | "Offset" | "Origin" => origin = parse_triple(key, value)?,
                "ElementByteOrderMSB" | "BinaryDataByteOrderMSB" => {
                    byte_order = if parse_bool(key, value)? {
                        ByteOrder::Big
                    } else {
                        ByteOrder::Little
                    };
                }
                "HeaderSize" => {
                    let size = parse_value::<i64>(key, value)?;
                    header_size = u64::try_from(size).ok();
                }
                "ElementNumberOfChannels" => {
                    let channels = parse_value::<usize>(key, value)?;
                    if channels != 1 {
                        return Err(MetaImageError::MultiChannel(channels).into());
                    }
                }
                "CompressedData" => {
                    if parse_bool(key, value)? {
                        return Err(MetaImageError::Compressed.into());
                    }
                }
                "ElementDataFile" => {
                    break if value.eq_ignore_ascii_case("LOCAL") {
                        DataFile::Local
                    } else {
                        DataFile::External(PathBuf::from(value))
                    };
                }
                _ => {}
            }
        };

        let dims = dims.ok_or(MetaImageError::MissingField("DimSize"))?;
        let ndims = ndims.unwrap_or(3);
        if ndims != 3 {
            return Err(MetaImageError::UnsupportedDims(ndims).into());
        }
        let element_type = element_type.ok_or(MetaImageError::MissingField("ElementType"))?;

        Ok((
            Self {
                dims,
                element_type,
                byte_order,
                spacing,
                origin,
                header_size,
                data_file,
            },
            consumed,
        ))
    }

    /// Header text, ending with the `ElementDataFile` line.
    pub fn to_text(&self) -> String {
        let data_file = match &self.data_file {
            DataFile::Local => "LOCAL".to_string(),
            DataFile::External(path) => path.display().to_string(),
        };
        let [x, y, z] = self.dims;
        let [sx, sy, sz] = self.spacing;
        let [ox, oy, oz] = self.origin;
        let msb = if self.byte_order.is_big_endian() { "True" } else { "False" };
        let header_size = self.header_size.map_or(-1, |size| size as i64);
        format!(
            "ObjectType = Image\n\
             NDims = 3\n\
             DimSize = {x} {y} {z}\n\
             ElementType = {element_type}\n\
             ElementSpacing = {sx} {sy} {sz}\n\
             Position = {ox} {oy} {oz}\n\
             ElementByteOrderMSB = {msb}\n\
             HeaderSize = {header_size}\n\
             ElementDataFile = {data_file}\n",
            element_type = met_name(self.element_type),
        )
    }
}

fn parse_value<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, MetaImageError> {
    value.parse().map_err(|_| MetaImageError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn parse_triple<T: std::str::FromStr + Copy>(field: &str, value: &str) -> Result<[T; 3], MetaImageError> {
    let parts = value
        .split_whitespace()
        .map(|v| parse_value::<T>(field, v))
        .collect::<Result<Vec<_>, _>>()?;
    match parts.as_slice() {
        [a, b, c] => Ok([*a, *b, *c]),
        [] => Err(MetaImageError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        }),
        other => Err(MetaImageError::UnsupportedDims(other.len())),
    }
}

fn parse_bool(field: &str, value: &str) -> Result<bool, MetaImageError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(MetaImageError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_element_type(value: &str) -> Result<ElementType, MetaImageError> {
    let parsed = match value {
        "MET_CHAR" => ElementType::I8,
        "MET_UCHAR" => ElementType::U8,
        "MET_SHORT" => ElementType::I16,
        "MET_USHORT" => ElementType::U16,
        "MET_INT" | "MET_LONG" => ElementType::I32,
        "MET_UINT" | "MET_ULONG" => ElementType::U32,
        "MET_FLOAT" => ElementType::F32,
        "MET_DOUBLE" => ElementType::F64,
        other => return Err(MetaImageError::UnsupportedElementType(other.to_string())),
    };
    Ok(parsed)
}

/// MetaImage has no half precision type; `F16` data is stored as float.
fn met_name(element_type: ElementType) -> &'static str {
    match element_type {
        ElementType::I8 => "MET_CHAR",
        ElementType::U8 => "MET_UCHAR",
        ElementType::I16 => "MET_SHORT",
        ElementType::U16 => "MET_USHORT",
        ElementType::I32 => "MET_INT",
        ElementType::U32 => "MET_UINT",
        ElementType::F16 | ElementType::F32 => "MET_FLOAT",
        ElementType::F64 => "MET_DOUBLE",
    }
}

fn stored_type(element_type: ElementType) -> ElementType {
    match element_type {
        ElementType::F16 => ElementType::F32,
        other => other,
    }
}

pub fn open(path: impl AsRef<Path>) -> Result<RawSource, ReadError> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let (header, text_len) = MetaImageHeader::parse(&mut reader)?;
    debug!(?path, dims = ?header.dims, element_type = %header.element_type, "parsed MetaImage header");

    let (data_path, skip) = match &header.data_file {
        DataFile::Local => (path.to_path_buf(), text_len),
        DataFile::External(file) if file.is_absolute() => (file.clone(), 0),
        DataFile::External(file) => (
            path.parent().map_or_else(|| file.clone(), |dir| dir.join(file)),
            0,
        ),
    };

    let mut layout = RawLayout::new(header.dims, header.element_type)
        .with_byte_order(header.byte_order)
        .with_storage_order(StorageOrder::Fortran);
    layout.header_length = match header.header_size {
        Some(size) => skip + size,
        None => fs::metadata(&data_path)?.len().saturating_sub(layout.data_len()),
    };

    Ok(RawSource::open(data_path, layout)?
        .with_spacing(header.spacing)
        .with_origin(header.origin))
}

/// Write `header` next to its data file.
pub fn write_header(path: impl AsRef<Path>, header: &MetaImageHeader) -> Result<(), ReadError> {
    fs::write(path, header.to_text())?;
    Ok(())
}

/// Write the volume as a `.raw` data file plus a `.mhd` header referring to
/// it by name. `path` is the header path.
pub fn write_meta_image(
    path: impl AsRef<Path>,
    volume: &Volume,
    element_type: ElementType,
) -> Result<MetaImageHeader, ReadError> {
    let path = path.as_ref();
    let data_path = path.with_extension("raw");
    let element_type = stored_type(element_type);
    raw::write(&data_path, volume, element_type, ByteOrder::Little)?;

    let file_name = data_path
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| ReadError::UnsupportedFormat(data_path.clone()))?;
    let mut header = MetaImageHeader::new(volume.shape(), element_type, DataFile::External(file_name));
    header.spacing = volume.spacing();
    header.origin = volume.origin();
    write_header(path, &header)?;
    Ok(header)
}

/// Write the volume as a Fortran ordered `.npy` file and a `.mhd` header
/// that skips the NumPy preamble, so both NumPy and MetaImage readers can
/// load the same samples. Returns the header path.
pub fn write_npy_as_meta_image(
    stem: impl AsRef<Path>,
    volume: &Volume,
    element_type: ElementType,
) -> Result<PathBuf, ReadError> {
    let stem = stem.as_ref();
    let npy_path = stem.with_extension("npy");
    let mhd_path = stem.with_extension("mhd");
    let element_type = stored_type(element_type);
    let layout = npy::write(&npy_path, volume, element_type, true)?;

    let data_file = npy_path
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| ReadError::UnsupportedFormat(npy_path.clone()))?;
    let mut header = MetaImageHeader::new(layout.shape, element_type, DataFile::External(data_file));
    header.byte_order = layout.byte_order;
    header.header_size = Some(layout.header_length);
    header.spacing = volume.spacing();
    header.origin = volume.origin();
    write_header(&mhd_path, &header)?;
    Ok(mhd_path)
}
