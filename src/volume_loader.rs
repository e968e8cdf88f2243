use std::path::{Path, PathBuf};

use futures::channel::mpsc::UnboundedSender;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use web_time::Instant;

use crate::enums::{ByteOrder, ElementType, FileFormat};
use crate::formats::meta_image::{self, MetaImageError};
use crate::formats::npy::{self, NpyError};
use crate::formats::tiff::TiffStack;
use crate::formats::{RawLayout, RawSource, SliceSource};
use crate::geometry::GeometryError;
use crate::progress::{NoProgress, ProgressSink};
use crate::resampler::{self, ResampleOptions};
use crate::subset;
use crate::volume::Volume;

pub const DEFAULT_HDF5_DATASET: &str = "entry1/tomo_entry/data/data";

#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    Npy(#[from] NpyError),

    #[error(transparent)]
    MetaImage(#[from] MetaImageError),

    #[error("{path:?} holds {actual} bytes, expected {expected}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("No valid images found in {0:?}")]
    NoValidImages(PathBuf),

    #[error("Unsupported file format: {0:?}")]
    UnsupportedFormat(PathBuf),

    #[error("Raw files need a shape, element type and byte order")]
    MissingRawLayout,

    #[error("Unknown element type '{0}'")]
    UnknownElementType(String),

    #[error("No such file or directory: {0:?}")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TIFF error: {0}")]
    Tiff(#[from] ::tiff::TiffError),

    #[error("Cannot stack {path:?}: {reason}")]
    UnsupportedTiff { path: PathBuf, reason: &'static str },

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[cfg(feature = "hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    #[cfg(feature = "hdf5")]
    #[error("HDF5 dataset of shape {shape:?} cannot be read as 3D at index {index_4d}")]
    Hdf5Shape { shape: Vec<usize>, index_4d: usize },

    #[error("Background read failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hdf5Options {
    pub dataset_name: String,
    /// Outer index into a 4D dataset
    pub index_4d: usize,
}

impl Default for Hdf5Options {
    fn default() -> Self {
        Self {
            dataset_name: DEFAULT_HDF5_DATASET.to_string(),
            index_4d: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    Full,
    Resample(ResampleOptions),
    /// Inclusive `[x0, x1, y0, y1, z0, z1]`; `-1` means the whole axis bound
    Crop([i64; 6]),
    Decimate {
        bounds: [usize; 3],
        sample_rate: Option<[usize; 3]>,
    },
}

impl Default for ReadMode {
    fn default() -> Self {
        Self::Resample(ResampleOptions::default())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadOptions {
    pub mode: ReadMode,
    /// Required for `.raw` files
    pub raw: Option<RawLayout>,
    pub hdf5: Hdf5Options,
}

impl ReadOptions {
    pub fn with_mode(mut self, mode: ReadMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_raw_layout(mut self, layout: RawLayout) -> Self {
        self.raw = Some(layout);
        self
    }

    pub fn with_hdf5(mut self, hdf5: Hdf5Options) -> Self {
        self.hdf5 = hdf5;
        self
    }
}

/// What the file holds, before any resampling or cropping.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OriginalAttributes {
    pub file_name: PathBuf,
    pub format: FileFormat,
    /// `(x, y, z)`
    pub shape: [usize; 3],
    pub element_type: ElementType,
    pub bit_depth: u32,
    pub byte_order: Option<ByteOrder>,
    pub header_length: Option<u64>,
    pub spacing: [f64; 3],
    pub origin: [f64; 3],
}

/// What was loaded into memory.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LoadedAttributes {
    pub resampled: bool,
    pub cropped: bool,
    pub shape: [usize; 3],
    pub spacing: [f64; 3],
    pub origin: [f64; 3],
}

#[derive(Debug)]
pub struct LoadedVolume {
    pub volume: Volume,
    pub original: OriginalAttributes,
    pub loaded: LoadedAttributes,
}

#[derive(Clone, Debug, Default)]
pub struct VolumeReader {
    options: ReadOptions,
}

impl VolumeReader {
    pub fn new(options: ReadOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ReadOptions {
        &self.options
    }

    /// Open `path` as a [`SliceSource`] without reading any samples.
    ///
    /// A single TIFF file stands for every TIFF file in its directory.
    ///
    /// # Errors
    ///
    /// Returns error if the path is missing, the format is unknown or the
    /// header cannot be parsed
    pub fn open_source(&self, path: impl AsRef<Path>) -> Result<(Box<dyn SliceSource>, FileFormat), ReadError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ReadError::NotFound(path.to_path_buf()));
        }
        let format = FileFormat::detect(path).ok_or_else(|| ReadError::UnsupportedFormat(path.to_path_buf()))?;
        debug!(?path, ?format, "opening");

        let source: Box<dyn SliceSource> = match format {
            FileFormat::Raw => {
                let layout = self.options.raw.clone().ok_or(ReadError::MissingRawLayout)?;
                Box::new(RawSource::open_exact(path, layout)?)
            }
            FileFormat::Numpy => Box::new(npy::open(path)?),
            FileFormat::MetaImage => Box::new(meta_image::open(path)?),
            FileFormat::Tiff if path.is_dir() => Box::new(TiffStack::from_directory(path)?),
            FileFormat::Tiff => {
                let dir = path
                    .parent()
                    .filter(|dir| !dir.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                Box::new(TiffStack::from_directory(dir)?)
            }
            #[cfg(feature = "hdf5")]
            FileFormat::Hdf5 => Box::new(crate::formats::hdf5::Hdf5Source::open(
                path,
                self.options.hdf5.clone(),
            )?),
            #[cfg(not(feature = "hdf5"))]
            FileFormat::Hdf5 => return Err(ReadError::UnsupportedFormat(path.to_path_buf())),
        };
        Ok((source, format))
    }

    /// Load a volume from `path` according to the reader's mode.
    pub fn read(&self, path: impl AsRef<Path>) -> Result<LoadedVolume, ReadError> {
        self.read_with_progress(path, &NoProgress)
    }

    pub fn read_with_progress(
        &self,
        path: impl AsRef<Path>,
        progress: &dyn ProgressSink,
    ) -> Result<LoadedVolume, ReadError> {
        let path = path.as_ref();
        let start = Instant::now();
        let (source, format) = self.open_source(path)?;
        let original = Self::original_attributes(path, format, source.as_ref());

        let (volume, resampled, cropped) = match &self.options.mode {
            ReadMode::Full => (resampler::read_full(source.as_ref(), progress)?, false, false),
            ReadMode::Resample(options) => {
                let downsample = options.plan(source.as_ref())?.downsample();
                let volume = resampler::resample(source.as_ref(), options, progress)?;
                (volume, downsample, false)
            }
            ReadMode::Crop(extent) => (subset::crop(source.as_ref(), *extent, progress)?, false, true),
            ReadMode::Decimate { bounds, sample_rate } => {
                let volume = subset::decimate(source.as_ref(), *bounds, *sample_rate, progress)?;
                let resampled = volume.shape() != original.shape;
                (volume, resampled, false)
            }
        };

        let loaded = LoadedAttributes {
            resampled,
            cropped,
            shape: volume.shape(),
            spacing: volume.spacing(),
            origin: volume.origin(),
        };
        info!(
            ?path,
            original = ?original.shape,
            loaded = ?loaded.shape,
            elapsed = ?start.elapsed(),
            "volume read"
        );

        Ok(LoadedVolume {
            volume,
            original,
            loaded,
        })
    }

    /// Read on tokio's blocking pool, sending progress fractions to
    /// `progress` as chunks complete. The channel is closed when the read
    /// finishes.
    pub async fn read_async(
        &self,
        path: impl AsRef<Path>,
        progress: UnboundedSender<f32>,
    ) -> Result<LoadedVolume, ReadError> {
        let reader = self.clone();
        let path = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || {
            let sink = move |fraction: f32| {
                // a dropped receiver only means nobody is watching
                let _ = progress.unbounded_send(fraction);
            };
            reader.read_with_progress(&path, &sink)
        })
        .await?
    }

    fn original_attributes(path: &Path, format: FileFormat, source: &dyn SliceSource) -> OriginalAttributes {
        let element_type = source.element_type();
        OriginalAttributes {
            file_name: path.to_path_buf(),
            format,
            shape: source.shape().as_array(),
            element_type,
            bit_depth: element_type.bit_depth(),
            byte_order: source.layout().map(|layout| layout.byte_order),
            header_length: source.layout().map(|layout| layout.header_length),
            spacing: source.spacing(),
            origin: source.origin(),
        }
    }
}
