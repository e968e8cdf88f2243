use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::enums::{ByteOrder, ElementType, StorageOrder};
use crate::formats::{SliceSource, decode_samples, encode_samples};
use crate::geometry::Shape3;
use crate::volume::Volume;
use crate::volume_loader::ReadError;

/// Byte layout of an uncompressed array stored in a file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLayout {
    /// Array shape as stored: `(z, y, x)` for C order, `(x, y, z)` for Fortran.
    pub shape: [usize; 3],
    pub element_type: ElementType,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub storage_order: StorageOrder,
    /// Bytes to skip before the first sample
    #[serde(default)]
    pub header_length: u64,
}

impl RawLayout {
    pub fn new(shape: [usize; 3], element_type: ElementType) -> Self {
        Self {
            shape,
            element_type,
            byte_order: ByteOrder::Little,
            storage_order: StorageOrder::C,
            header_length: 0,
        }
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_storage_order(mut self, storage_order: StorageOrder) -> Self {
        self.storage_order = storage_order;
        self
    }

    pub fn with_header_length(mut self, header_length: u64) -> Self {
        self.header_length = header_length;
        self
    }

    pub fn volume_shape(&self) -> Result<Shape3, ReadError> {
        Ok(Shape3::from_array_shape(self.shape, self.storage_order)?)
    }

    pub fn bytes_per_element(&self) -> usize {
        self.element_type.size()
    }

    /// Size of the sample data in bytes, header excluded
    pub fn data_len(&self) -> u64 {
        self.shape.iter().map(|&d| d as u64).product::<u64>() * self.bytes_per_element() as u64
    }

    /// Size of one z slice in bytes
    pub fn slice_bytes(&self) -> Result<u64, ReadError> {
        Ok(self.volume_shape()?.slice_len() as u64 * self.bytes_per_element() as u64)
    }

    /// File offset of slice `z`
    pub fn slice_offset(&self, z: usize) -> Result<u64, ReadError> {
        Ok(self.header_length + z as u64 * self.slice_bytes()?)
    }
}

/// A volume stored as packed samples at a fixed offset in a file.
///
/// Both C and Fortran arrays keep `x` fastest once their shape is read in
/// toolkit order, so slices along z are always contiguous.
#[derive(Clone, Debug)]
pub struct RawSource {
    path: PathBuf,
    layout: RawLayout,
    shape: Shape3,
    spacing: [f64; 3],
    origin: [f64; 3],
}

impl RawSource {
    /// Open `path`, requiring at least the bytes `layout` describes.
    pub fn open(path: impl AsRef<Path>, layout: RawLayout) -> Result<Self, ReadError> {
        let path = path.as_ref();
        let shape = layout.volume_shape()?;
        let expected = layout.header_length + layout.data_len();
        let actual = fs::metadata(path)?.len();
        if actual < expected {
            return Err(ReadError::SizeMismatch {
                path: path.to_path_buf(),
                expected,
                actual,
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            layout,
            shape,
            spacing: [1.0; 3],
            origin: [0.0; 3],
        })
    }

    /// Like [`open`](Self::open) but the file must hold exactly the
    /// described bytes, as a headerless `.raw` file does.
    pub fn open_exact(path: impl AsRef<Path>, layout: RawLayout) -> Result<Self, ReadError> {
        let path = path.as_ref();
        let expected = layout.header_length + layout.data_len();
        let actual = fs::metadata(path)?.len();
        if actual != expected {
            return Err(ReadError::SizeMismatch {
                path: path.to_path_buf(),
                expected,
                actual,
            });
        }
        Self::open(path, layout)
    }

    pub fn with_spacing(mut self, spacing: [f64; 3]) -> Self {
        self.spacing = spacing;
        self
    }

    pub fn with_origin(mut self, origin: [f64; 3]) -> Self {
        self.origin = origin;
        self
    }
}

impl SliceSource for RawSource {
    fn shape(&self) -> Shape3 {
        self.shape
    }

    fn element_type(&self) -> ElementType {
        self.layout.element_type
    }

    fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    fn origin(&self) -> [f64; 3] {
        self.origin
    }

    fn layout(&self) -> Option<&RawLayout> {
        Some(&self.layout)
    }

    fn read_slices(&self, z: Range<usize>) -> Result<Array3<f32>, ReadError> {
        let z = z.start.min(self.shape.z())..z.end.min(self.shape.z());
        let count = z.len();
        let samples = count * self.shape.slice_len();

        let mut bytes = vec![0u8; samples * self.layout.bytes_per_element()];
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.layout.slice_offset(z.start)?))?;
        file.read_exact(&mut bytes)?;

        let mut data = vec![0.0f32; samples];
        decode_samples(&bytes, self.layout.element_type, self.layout.byte_order, &mut data);
        Ok(Array3::from_shape_vec(
            (count, self.shape.y(), self.shape.x()),
            data,
        )?)
    }
}

/// Write the volume as headerless samples, `x` fastest.
pub fn write(
    path: impl AsRef<Path>,
    volume: &Volume,
    element_type: ElementType,
    byte_order: ByteOrder,
) -> Result<RawLayout, ReadError> {
    let samples: Vec<f32> = volume.data().iter().copied().collect();
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    writer.write_all(&encode_samples(&samples, element_type, byte_order))?;
    writer.flush()?;

    let (z, y, x) = volume.dim();
    Ok(RawLayout::new([z, y, x], element_type).with_byte_order(byte_order))
}
