//! Stacks of single page TIFF files, one file per z slice.

use std::fs::{self, File};
use std::io::BufReader;
use std::ops::Range;
use std::path::{Path, PathBuf};

use ::tiff::ColorType;
use ::tiff::decoder::{Decoder, DecodingResult, Limits};
use ndarray::{Array2, Array3, Axis};
use rayon::prelude::*;
use tracing::debug;

use crate::enums::ElementType;
use crate::formats::SliceSource;
use crate::geometry::Shape3;
use crate::volume_loader::ReadError;

#[derive(Clone, Debug)]
pub struct TiffStack {
    files: Vec<PathBuf>,
    shape: Shape3,
    element_type: ElementType,
}

fn decoder(path: &Path) -> Result<Decoder<BufReader<File>>, ReadError> {
    let decoder = Decoder::new(BufReader::new(File::open(path)?))?;
    Ok(decoder.with_limits(Limits::unlimited()))
}

/// Width, height and colour type of the first page.
fn page_info(path: &Path) -> Result<(u32, u32, ColorType), ReadError> {
    let mut decoder = decoder(path)?;
    let (width, height) = decoder.dimensions()?;
    Ok((width, height, decoder.colortype()?))
}

fn unsupported(path: &Path, reason: &'static str) -> ReadError {
    ReadError::UnsupportedTiff {
        path: path.to_path_buf(),
        reason,
    }
}

/// Decode the first page of `path` into grey values and the element type
/// they were stored as.
fn decode_page(path: &Path) -> Result<(Vec<f32>, ElementType), ReadError> {
    let mut decoder = decoder(path)?;
    if !matches!(decoder.colortype()?, ColorType::Gray(_)) {
        return Err(unsupported(path, "only single channel grey pages can be stacked"));
    }
    let decoded = match decoder.read_image()? {
        DecodingResult::U8(data) => (data.into_iter().map(f32::from).collect(), ElementType::U8),
        DecodingResult::I8(data) => (data.into_iter().map(f32::from).collect(), ElementType::I8),
        DecodingResult::U16(data) => (data.into_iter().map(f32::from).collect(), ElementType::U16),
        DecodingResult::I16(data) => (data.into_iter().map(f32::from).collect(), ElementType::I16),
        DecodingResult::U32(data) => (data.into_iter().map(|v| v as f32).collect(), ElementType::U32),
        DecodingResult::I32(data) => (data.into_iter().map(|v| v as f32).collect(), ElementType::I32),
        DecodingResult::F32(data) => (data, ElementType::F32),
        DecodingResult::F64(data) => (data.into_iter().map(|v| v as f32).collect(), ElementType::F64),
        DecodingResult::U64(_) | DecodingResult::I64(_) => {
            return Err(unsupported(path, "64-bit integer samples"));
        }
    };
    Ok(decoded)
}

impl TiffStack {
    /// Open a stack from files in slice order. Every file must share the
    /// dimensions of the first.
    pub fn open(files: Vec<PathBuf>) -> Result<Self, ReadError> {
        let first = files
            .first()
            .ok_or_else(|| ReadError::NoValidImages(PathBuf::new()))?;
        let (width, height, _) = page_info(first)?;

        let pages = files
            .par_iter()
            .map(|path| page_info(path))
            .collect::<Result<Vec<_>, _>>()?;
        if pages.iter().any(|&(w, h, _)| (w, h) != (width, height)) {
            return Err(ReadError::InconsistentDimensions);
        }

        let (_, element_type) = decode_page(first)?;
        let shape = Shape3::new(width as usize, height as usize, files.len())?;
        debug!(files = files.len(), ?shape, %element_type, "opened TIFF stack");

        Ok(Self {
            files,
            shape,
            element_type,
        })
    }

    /// Open every `.tif`/`.tiff` file in `dir`, sorted by file name.
    pub fn from_directory(dir: impl AsRef<Path>) -> Result<Self, ReadError> {
        let dir = dir.as_ref();
        let mut files: Vec<_> = fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("tif") || ext.eq_ignore_ascii_case("tiff"))
            })
            .collect();

        if files.is_empty() {
            return Err(ReadError::NoValidImages(dir.to_path_buf()));
        }
        files.sort();
        Self::open(files)
    }

    fn decode(&self, path: &Path) -> Result<Array2<f32>, ReadError> {
        let (width, height) = (self.shape.x(), self.shape.y());
        let (pixels, _) = decode_page(path)?;
        if pixels.len() != width * height {
            return Err(ReadError::InconsistentDimensions);
        }
        Ok(Array2::from_shape_vec((height, width), pixels)?)
    }
}

impl SliceSource for TiffStack {
    fn shape(&self) -> Shape3 {
        self.shape
    }

    fn element_type(&self) -> ElementType {
        self.element_type
    }

    fn read_slices(&self, z: Range<usize>) -> Result<Array3<f32>, ReadError> {
        let z = z.start.min(self.shape.z())..z.end.min(self.shape.z());
        let slices = self.files[z]
            .par_iter()
            .map(|path| self.decode(path))
            .collect::<Result<Vec<_>, _>>()?;
        if slices.is_empty() {
            return Ok(Array3::zeros((0, self.shape.y(), self.shape.x())));
        }
        let views: Vec<_> = slices.iter().map(|slice| slice.view()).collect();
        Ok(ndarray::stack(Axis(0), &views)?)
    }
}
