//! JSON job files for the command line tool.
//!
//! ```json
//! {
//!   "array": { "shape": [5, 10, 6], "typecode": "uint16", "is_big_endian": false },
//!   "resample": { "target_size": 1000000, "resample_z": true },
//!   "output": { "filename": "small.npy", "format": "npy" }
//! }
//! ```
//!
//! `array` describes headerless `.raw` input (and names the HDF5 dataset
//! through `group_name`). Every section is optional.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::enums::{ByteOrder, DownsampleStrategy, ElementType, StorageOrder};
use crate::formats::{RawLayout, meta_image};
use crate::resampler::{DEFAULT_TARGET_SIZE, ResampleOptions};
use crate::volume::Volume;
use crate::volume_loader::{Hdf5Options, LoadedVolume, ReadError, ReadMode, ReadOptions};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read job file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid job file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid array section: {0}")]
    Array(String),

    #[error(transparent)]
    Read(#[from] ReadError),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    pub array: Option<ArraySection>,
    pub resample: ResampleSection,
    pub output: Option<OutputSection>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArraySection {
    /// Array shape as stored
    pub shape: Option<[usize; 3]>,
    pub is_fortran: bool,
    pub is_big_endian: bool,
    pub typecode: Option<String>,
    pub group_name: Option<String>,
}

impl ArraySection {
    /// `None` unless the section describes raw data.
    pub fn raw_layout(&self) -> Result<Option<RawLayout>, ConfigError> {
        let (shape, typecode) = match (self.shape, &self.typecode) {
            (None, None) => return Ok(None),
            (Some(shape), Some(typecode)) => (shape, typecode),
            _ => return Err(ConfigError::Array("raw data needs both 'shape' and 'typecode'".into())),
        };
        let element_type = ElementType::from_str(typecode)?;
        let byte_order = if self.is_big_endian { ByteOrder::Big } else { ByteOrder::Little };
        let storage_order = if self.is_fortran { StorageOrder::Fortran } else { StorageOrder::C };
        Ok(Some(
            RawLayout::new(shape, element_type)
                .with_byte_order(byte_order)
                .with_storage_order(storage_order),
        ))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResampleSection {
    pub target_size: u64,
    /// Group slices along z as well as shrinking in-plane
    pub resample_z: bool,
    pub strict_budget: bool,
}

impl Default for ResampleSection {
    fn default() -> Self {
        Self {
            target_size: DEFAULT_TARGET_SIZE,
            resample_z: true,
            strict_budget: false,
        }
    }
}

impl From<ResampleSection> for ResampleOptions {
    fn from(section: ResampleSection) -> Self {
        let strategy = if section.resample_z {
            DownsampleStrategy::Isotropic
        } else {
            DownsampleStrategy::PreserveSlices
        };
        ResampleOptions::default()
            .with_target_size(section.target_size)
            .with_strategy(strategy)
            .with_strict_budget(section.strict_budget)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSection {
    pub filename: PathBuf,
    #[serde(default)]
    pub format: Option<OutputFormat>,
}

impl OutputSection {
    /// Explicit format, or the one implied by the file extension.
    pub fn format(&self) -> Option<OutputFormat> {
        self.format.or_else(|| OutputFormat::from_path(&self.filename))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Npy,
    Mhd,
    Raw,
    /// Dataset `entry1/tomo_entry/data/data` with the read's attribute records
    #[cfg(feature = "hdf5")]
    Hdf5,
}

impl OutputFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "npy" => Some(Self::Npy),
            "mhd" => Some(Self::Mhd),
            "raw" => Some(Self::Raw),
            #[cfg(feature = "hdf5")]
            "h5" | "hdf5" | "nxs" => Some(Self::Hdf5),
            _ => None,
        }
    }

    /// Write `volume` to `path` in this format, returning the files written.
    pub fn save(self, volume: &Volume, path: &Path) -> Result<Vec<PathBuf>, ReadError> {
        match self {
            Self::Npy => {
                volume.save_npy(path)?;
                Ok(vec![path.to_path_buf()])
            }
            Self::Raw => {
                volume.save_raw(path)?;
                Ok(vec![path.to_path_buf()])
            }
            Self::Mhd => {
                let header = path.with_extension("mhd");
                meta_image::write_meta_image(&header, volume, volume.element_type())?;
                Ok(vec![header.clone(), header.with_extension("raw")])
            }
            #[cfg(feature = "hdf5")]
            Self::Hdf5 => {
                crate::formats::hdf5::write(path, volume, None, &Hdf5Options::default())?;
                Ok(vec![path.to_path_buf()])
            }
        }
    }

    /// Like [`OutputFormat::save`], but HDF5 output also records where the
    /// volume came from and whether it was resampled or cropped.
    pub fn save_loaded(self, loaded: &LoadedVolume, path: &Path) -> Result<Vec<PathBuf>, ReadError> {
        match self {
            #[cfg(feature = "hdf5")]
            Self::Hdf5 => {
                crate::formats::hdf5::write(
                    path,
                    &loaded.volume,
                    Some((&loaded.original, &loaded.loaded)),
                    &Hdf5Options::default(),
                )?;
                Ok(vec![path.to_path_buf()])
            }
            other => other.save(&loaded.volume, path),
        }
    }
}

impl JobConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        text.parse()
    }

    /// Reader options for resampling the job's input.
    pub fn read_options(&self) -> Result<ReadOptions, ConfigError> {
        let mut options = ReadOptions::default().with_mode(ReadMode::Resample(self.resample.into()));
        if let Some(array) = &self.array {
            if let Some(layout) = array.raw_layout()? {
                options = options.with_raw_layout(layout);
            }
            if let Some(group_name) = &array.group_name {
                options = options.with_hdf5(Hdf5Options {
                    dataset_name: group_name.clone(),
                    ..Hdf5Options::default()
                });
            }
        }
        Ok(options)
    }
}

impl FromStr for JobConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(serde_json::from_str(s)?)
    }
}
