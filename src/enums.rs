use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::volume_loader::ReadError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orientation {
    Axial,
    Coronal,
    Sagittal,
}

impl FromStr for Orientation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "axial" | "z" => Ok(Self::Axial),
            "coronal" | "y" => Ok(Self::Coronal),
            "sagittal" | "x" => Ok(Self::Sagittal),
            other => Err(format!("unknown orientation '{other}'")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Interpolation {
    Linear,
    // TODO:
    // Cubic,
    #[default]
    None,
}

/// How a voxel budget is split between in-plane magnification and grouping
/// of slices along the slowest axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownsampleStrategy {
    /// Spread the reduction over all three axes. Consecutive slices are
    /// averaged into chunks so in-plane resolution stays as high as the
    /// budget allows.
    #[default]
    Isotropic,
    /// Keep every slice along z and reduce only in-plane. Used for
    /// acquisition data (projections), where each slice is one angle.
    PreserveSlices,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageOrder {
    /// Row-major, last index fastest. Array shape is `(z, y, x)`.
    #[default]
    C,
    /// Column-major, first index fastest. Array shape is `(x, y, z)`.
    Fortran,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }

    pub fn is_big_endian(self) -> bool {
        matches!(self, Self::Big)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    I8,
    #[default]
    U8,
    I16,
    U16,
    I32,
    U32,
    F16,
    F32,
    F64,
}

impl ElementType {
    /// Size of one sample in bytes
    pub fn size(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 | Self::F16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    pub fn bit_depth(self) -> u32 {
        self.size() as u32 * 8
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F16 | Self::F32 | Self::F64)
    }

    /// NumPy-style dtype name, e.g. `uint16`
    pub fn name(self) -> &'static str {
        match self {
            Self::I8 => "int8",
            Self::U8 => "uint8",
            Self::I16 => "int16",
            Self::U16 => "uint16",
            Self::I32 => "int32",
            Self::U32 => "uint32",
            Self::F16 => "float16",
            Self::F32 => "float32",
            Self::F64 => "float64",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ElementType {
    type Err = ReadError;

    /// Accepts dtype names (`uint16`) and single character type codes (`H`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s.trim() {
            "int8" | "i1" | "b" => Self::I8,
            "uint8" | "u1" | "B" => Self::U8,
            "int16" | "i2" | "h" => Self::I16,
            "uint16" | "u2" | "H" => Self::U16,
            "int32" | "i4" | "i" => Self::I32,
            "uint32" | "u4" | "I" => Self::U32,
            "float16" | "f2" | "e" => Self::F16,
            "float32" | "f4" | "f" | "F" => Self::F32,
            "float64" | "f8" | "d" | "D" => Self::F64,
            other => return Err(ReadError::UnknownElementType(other.to_string())),
        };
        Ok(parsed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Raw,
    Numpy,
    MetaImage,
    Tiff,
    Hdf5,
}

impl FileFormat {
    /// Guess the format from a file extension. Directories are TIFF stacks.
    pub fn detect(path: &Path) -> Option<Self> {
        if path.is_dir() {
            return Some(Self::Tiff);
        }
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "raw" => Some(Self::Raw),
            "npy" => Some(Self::Numpy),
            "mhd" | "mha" => Some(Self::MetaImage),
            "tif" | "tiff" => Some(Self::Tiff),
            "h5" | "hdf5" | "nxs" => Some(Self::Hdf5),
            _ => None,
        }
    }
}
