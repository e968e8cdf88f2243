//! # volume-resample library
//!
//! This crate loads volumetric datasets too large to hold at full resolution
//! into memory-bounded 3D volumes.
//!
//! Volumes can be read from headerless raw files, NumPy `.npy` files,
//! MetaImage `.mhd`/`.mha` files, stacks of 2D TIFF files and (with the
//! `hdf5` feature) HDF5 datasets. Readers only ever touch the slices they
//! need, so a volume can be:
//!  - read in full
//!  - resampled to fit a voxel budget, averaging runs of slices along z and
//!    shrinking each slice in-plane
//!  - cropped to an axis aligned extent
//!  - decimated to fit per-axis bounds
//!
//! Where the environment supports it, chunks are processed in parallel
//! using rayon. Shapes and extents are given in toolkit order `(x, y, z)`
//! with `z` the slowest varying axis on disk, while the in-memory array is
//! indexed `[z, y, x]`.
//!
//! The resampling geometry lives in [`geometry`] and is usable on its own:
//!
//! ```
//! # use volume_resample::{DownsampleStrategy, Shape3, compute_magnification};
//! let shape = Shape3::new(1000, 1000, 1000).unwrap();
//! let plan = compute_magnification(1_000_000, shape.voxel_count(), shape, DownsampleStrategy::Isotropic)
//!     .unwrap();
//! assert_eq!(plan.slice_per_chunk(), 10);
//! assert!(plan.target_voxel_count() <= 1_000_000);
//! ```
//!
//! # Roadmap
//!
//!  - Cubic interpolation for previews
//!  - Compressed MetaImage data
//!
//! # Examples
//!
//! ## Reading a large NumPy file within a budget
//!
//! Downsample `scan.npy` to at most 256³ voxels and save a preview of the
//! central axial slice.
//!
//! ```no_run
//! # use volume_resample::{Interpolation, Orientation, ReadMode, ReadOptions, ResampleOptions, VolumeReader};
//! let options = ReadOptions::default()
//!     .with_mode(ReadMode::Resample(ResampleOptions::default().with_target_size(256 * 256 * 256)));
//! let loaded = VolumeReader::new(options)
//!     .read("scan.npy")
//!     .expect("should have read the volume");
//! let volume = &loaded.volume;
//! let image = volume
//!     .get_image_from_axis(volume.dim().0 / 2, Orientation::Axial, Interpolation::None)
//!     .expect("should have returned image at center of volume");
//! image.save("result.png").expect("should have saved the preview");
//! ```

pub mod config;
pub mod enums;
pub mod formats;
pub mod geometry;
mod interpolator;
pub mod progress;
pub mod resampler;
pub mod subset;
pub mod volume;
pub mod volume_loader;

pub use enums::{ByteOrder, DownsampleStrategy, ElementType, FileFormat, Interpolation, Orientation, StorageOrder};
pub use formats::{RawLayout, SliceSource};
pub use geometry::{DownsamplePlan, GeometryError, Shape3, SourceRegion, compute_magnification, map_extent};
pub use progress::{NoProgress, ProgressSink};
pub use resampler::ResampleOptions;
pub use volume::Volume;
pub use volume_loader::{
    Hdf5Options, LoadedAttributes, LoadedVolume, OriginalAttributes, ReadError, ReadMode, ReadOptions,
    VolumeReader,
};
