//! HDF5 datasets, read slab by slab and written whole with the attributes
//! of the read that produced them.

use std::ops::Range;
use std::path::{Path, PathBuf};

use hdf5::types::{FloatSize, IntSize, TypeDescriptor, VarLenUnicode};
use hdf5::{Dataset, Group, H5Type};
use ndarray::{Array3, ArrayView3, Ix3, s};
use tracing::debug;

use crate::enums::{ElementType, StorageOrder};
use crate::formats::SliceSource;
use crate::geometry::Shape3;
use crate::volume::Volume;
use crate::volume_loader::{Hdf5Options, LoadedAttributes, OriginalAttributes, ReadError};

#[derive(Debug)]
pub struct Hdf5Source {
    path: PathBuf,
    options: Hdf5Options,
    four_d: bool,
    shape: Shape3,
    element_type: ElementType,
}

impl Hdf5Source {
    pub fn open(path: impl AsRef<Path>, options: Hdf5Options) -> Result<Self, ReadError> {
        let path = path.as_ref();
        let file = hdf5::File::open(path)?;
        let dataset = file.dataset(&options.dataset_name)?;

        let dims = dataset.shape();
        let (four_d, stored) = match dims.as_slice() {
            [z, y, x] => (false, [*z, *y, *x]),
            [t, z, y, x] if options.index_4d < *t => (true, [*z, *y, *x]),
            _ => {
                return Err(ReadError::Hdf5Shape {
                    shape: dims.clone(),
                    index_4d: options.index_4d,
                });
            }
        };
        let element_type = match dataset.dtype()?.to_descriptor()? {
            TypeDescriptor::Integer(IntSize::U1) => ElementType::I8,
            TypeDescriptor::Unsigned(IntSize::U1) => ElementType::U8,
            TypeDescriptor::Integer(IntSize::U2) => ElementType::I16,
            TypeDescriptor::Unsigned(IntSize::U2) => ElementType::U16,
            TypeDescriptor::Integer(_) => ElementType::I32,
            TypeDescriptor::Unsigned(_) => ElementType::U32,
            TypeDescriptor::Float(FloatSize::U4) => ElementType::F32,
            TypeDescriptor::Float(_) => ElementType::F64,
            other => return Err(ReadError::UnknownElementType(format!("{other:?}"))),
        };
        let shape = Shape3::from_array_shape(stored, StorageOrder::C)?;
        debug!(?path, dataset = %options.dataset_name, ?shape, %element_type, "opened HDF5 dataset");

        Ok(Self {
            path: path.to_path_buf(),
            options,
            four_d,
            shape,
            element_type,
        })
    }
}

impl SliceSource for Hdf5Source {
    fn shape(&self) -> Shape3 {
        self.shape
    }

    fn element_type(&self) -> ElementType {
        self.element_type
    }

    fn read_slices(&self, z: Range<usize>) -> Result<Array3<f32>, ReadError> {
        let z = z.start.min(self.shape.z())..z.end.min(self.shape.z());
        let file = hdf5::File::open(&self.path)?;
        let dataset = file.dataset(&self.options.dataset_name)?;
        let data = if self.four_d {
            dataset.read_slice::<f32, _, Ix3>(s![self.options.index_4d, z, .., ..])?
        } else {
            dataset.read_slice::<f32, _, Ix3>(s![z, .., ..])?
        };
        Ok(data)
    }
}

/// Open `path` below `root`, creating missing groups on the way.
fn ensure_group(root: Group, path: &str) -> Result<Group, ReadError> {
    let mut group = root;
    for part in path.split('/').filter(|part| !part.is_empty()) {
        group = match group.group(part) {
            Ok(existing) => existing,
            Err(_) => group.create_group(part)?,
        };
    }
    Ok(group)
}

fn create_as<A: H5Type>(
    group: &Group,
    name: &str,
    data: ArrayView3<'_, f32>,
    cast: impl Fn(f32) -> A,
) -> Result<Dataset, ReadError> {
    let typed: Array3<A> = data.mapv(cast);
    Ok(group.new_dataset_builder().with_data(&typed).create(name)?)
}

fn write_str(dataset: &Dataset, name: &str, value: &str) -> Result<(), ReadError> {
    let value: VarLenUnicode = value
        .parse()
        .map_err(|err| hdf5::Error::from(format!("cannot store attribute '{name}': {err}")))?;
    dataset.new_attr::<VarLenUnicode>().create(name)?.write_scalar(&value)?;
    Ok(())
}

fn write_triple<T: H5Type + Copy>(dataset: &Dataset, name: &str, value: [T; 3]) -> Result<(), ReadError> {
    dataset.new_attr_builder().with_data(&value[..]).create(name)?;
    Ok(())
}

fn write_flag(dataset: &Dataset, name: &str, value: bool) -> Result<(), ReadError> {
    dataset.new_attr::<bool>().create(name)?.write_scalar(&value)?;
    Ok(())
}

/// Write `volume` as a C ordered `(z, y, x)` dataset named
/// `options.dataset_name` in a new file.
///
/// The dataset carries `spacing` and `origin` attributes, plus the
/// `original_*`, `resampled` and `cropped` records when `attributes` are
/// given. Half precision is stored as `f32`.
pub fn write(
    path: impl AsRef<Path>,
    volume: &Volume,
    attributes: Option<(&OriginalAttributes, &LoadedAttributes)>,
    options: &Hdf5Options,
) -> Result<(), ReadError> {
    let path = path.as_ref();
    let file = hdf5::File::create(path)?;
    let (parent, name) = options
        .dataset_name
        .rsplit_once('/')
        .unwrap_or(("", options.dataset_name.as_str()));
    let group = ensure_group(file.group("/")?, parent)?;

    let data = volume.data().view();
    let dataset = match volume.element_type() {
        ElementType::I8 => create_as(&group, name, data, |v| v.round() as i8),
        ElementType::U8 => create_as(&group, name, data, |v| v.round() as u8),
        ElementType::I16 => create_as(&group, name, data, |v| v.round() as i16),
        ElementType::U16 => create_as(&group, name, data, |v| v.round() as u16),
        ElementType::I32 => create_as(&group, name, data, |v| v.round() as i32),
        ElementType::U32 => create_as(&group, name, data, |v| v.round() as u32),
        ElementType::F16 | ElementType::F32 => create_as(&group, name, data, |v| v),
        ElementType::F64 => create_as(&group, name, data, f64::from),
    }?;

    write_triple(&dataset, "spacing", volume.spacing())?;
    write_triple(&dataset, "origin", volume.origin())?;
    if let Some((original, loaded)) = attributes {
        write_str(&dataset, "original_file_name", &original.file_name.display().to_string())?;
        write_triple(&dataset, "original_shape", original.shape.map(|n| n as u64))?;
        write_triple(&dataset, "original_spacing", original.spacing)?;
        write_triple(&dataset, "original_origin", original.origin)?;
        write_str(&dataset, "original_element_type", &original.element_type.to_string())?;
        write_flag(&dataset, "resampled", loaded.resampled)?;
        write_flag(&dataset, "cropped", loaded.cropped)?;
    }
    debug!(?path, dataset = %options.dataset_name, shape = ?volume.shape(), "wrote HDF5 dataset");
    Ok(())
}
