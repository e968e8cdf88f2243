use std::fs;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use futures::channel::mpsc;
use image::{ImageBuffer, Luma};
use ndarray::Array3;
use tempfile::TempDir;
use tiff::encoder::{TiffEncoder, colortype};

use volume_resample::formats::meta_image::MetaImageError;
use volume_resample::formats::npy::NpyError;
use volume_resample::{
    ByteOrder, DownsampleStrategy, ElementType, FileFormat, RawLayout, ReadError, ReadMode, ReadOptions,
    ResampleOptions, VolumeReader,
};

const NX: usize = 6;
const NY: usize = 10;
const NZ: usize = 5;

fn value(z: usize, y: usize, x: usize) -> u16 {
    (z * NY * NX + y * NX + x) as u16
}

fn expected() -> Array3<f32> {
    Array3::from_shape_fn((NZ, NY, NX), |(z, y, x)| value(z, y, x) as f32)
}

/// Samples `x` fastest, little endian u16
fn sample_bytes() -> Vec<u8> {
    let mut bytes = Vec::with_capacity(NX * NY * NZ * 2);
    for z in 0..NZ {
        for y in 0..NY {
            for x in 0..NX {
                bytes.extend_from_slice(&value(z, y, x).to_le_bytes());
            }
        }
    }
    bytes
}

fn write_npy(dir: &Path) -> PathBuf {
    let mut dict = format!("{{'descr': '<u2', 'fortran_order': False, 'shape': ({NZ}, {NY}, {NX}), }}");
    while (10 + dict.len() + 1) % 64 != 0 {
        dict.push(' ');
    }
    dict.push('\n');

    let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
    bytes.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    bytes.extend_from_slice(dict.as_bytes());
    bytes.extend_from_slice(&sample_bytes());

    let path = dir.join("volume.npy");
    fs::write(&path, bytes).unwrap();
    path
}

/// Same samples declared as a column major `(x, y, z)` array
fn write_fortran_npy(dir: &Path) -> PathBuf {
    let mut dict = format!("{{'descr': '<u2', 'fortran_order': True, 'shape': ({NX}, {NY}, {NZ}), }}");
    while (10 + dict.len() + 1) % 64 != 0 {
        dict.push(' ');
    }
    dict.push('\n');

    let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
    bytes.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    bytes.extend_from_slice(dict.as_bytes());
    bytes.extend_from_slice(&sample_bytes());

    let path = dir.join("fortran.npy");
    fs::write(&path, bytes).unwrap();
    path
}

fn write_raw(dir: &Path) -> PathBuf {
    let path = dir.join("volume.raw");
    fs::write(&path, sample_bytes()).unwrap();
    path
}

fn write_mha(dir: &Path) -> PathBuf {
    let mut bytes = format!(
        "ObjectType = Image\nNDims = 3\nDimSize = {NX} {NY} {NZ}\nElementType = MET_USHORT\n\
         ElementSpacing = 0.5 0.5 2\nElementByteOrderMSB = False\nElementDataFile = LOCAL\n"
    )
    .into_bytes();
    bytes.extend_from_slice(&sample_bytes());
    let path = dir.join("volume.mha");
    fs::write(&path, bytes).unwrap();
    path
}

fn write_mhd(dir: &Path) -> PathBuf {
    fs::write(dir.join("samples.dat"), sample_bytes()).unwrap();
    let header = format!(
        "NDims = 3\nDimSize = {NX} {NY} {NZ}\nElementType = MET_USHORT\nHeaderSize = -1\nElementDataFile = samples.dat\n"
    );
    let path = dir.join("volume.mhd");
    fs::write(&path, header).unwrap();
    path
}

fn write_tiff_stack(dir: &Path) -> PathBuf {
    let stack = dir.join("stack");
    fs::create_dir(&stack).unwrap();
    for z in 0..NZ {
        let img: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_fn(NX as u32, NY as u32, |x, y| Luma([value(z, y as usize, x as usize)]));
        img.save(stack.join(format!("slice_{z:04}.tiff"))).unwrap();
    }
    stack
}

fn raw_layout() -> RawLayout {
    RawLayout::new([NZ, NY, NX], ElementType::U16)
}

fn full_reader() -> VolumeReader {
    VolumeReader::new(
        ReadOptions::default()
            .with_mode(ReadMode::Full)
            .with_raw_layout(raw_layout()),
    )
}

#[test]
fn every_format_reads_the_same_voxels() {
    let dir = TempDir::new().unwrap();
    let inputs = [
        (write_npy(dir.path()), FileFormat::Numpy),
        (write_raw(dir.path()), FileFormat::Raw),
        (write_mha(dir.path()), FileFormat::MetaImage),
        (write_mhd(dir.path()), FileFormat::MetaImage),
        (write_tiff_stack(dir.path()), FileFormat::Tiff),
    ];

    for (path, format) in inputs {
        let loaded = full_reader().read(&path).unwrap();
        assert_eq!(loaded.original.format, format, "{path:?}");
        assert_eq!(loaded.original.shape, [NX, NY, NZ], "{path:?}");
        assert_eq!(loaded.original.element_type, ElementType::U16, "{path:?}");
        assert_eq!(loaded.volume.data(), &expected(), "{path:?}");
        assert!(!loaded.loaded.resampled);
        assert!(!loaded.loaded.cropped);
    }
}

#[test]
fn fortran_npy_reads_the_same_voxels() {
    let dir = TempDir::new().unwrap();
    let loaded = full_reader().read(write_fortran_npy(dir.path())).unwrap();
    assert_eq!(loaded.original.shape, [NX, NY, NZ]);
    assert_eq!(loaded.volume.data(), &expected());

    let cropped = VolumeReader::new(ReadOptions::default().with_mode(ReadMode::Crop([1, 2, -1, -1, 4, 4])))
        .read(write_fortran_npy(dir.path()))
        .unwrap();
    assert_eq!(cropped.loaded.shape, [2, NY, 1]);
    assert_eq!(cropped.volume.data()[[0, 3, 1]], value(4, 3, 2) as f32);
}

#[test]
fn float_tiff_stack_keeps_real_values() {
    let dir = TempDir::new().unwrap();
    let stack = dir.path().join("float_stack");
    fs::create_dir(&stack).unwrap();
    for z in 0..NZ {
        let pixels: Vec<f32> = (0..NY * NX).map(|i| (z * NY * NX + i) as f32 * 0.5 - 10.0).collect();
        let file = fs::File::create(stack.join(format!("slice_{z:04}.tif"))).unwrap();
        TiffEncoder::new(file)
            .unwrap()
            .write_image::<colortype::Gray32Float>(NX as u32, NY as u32, &pixels)
            .unwrap();
    }

    let loaded = full_reader().read(&stack).unwrap();
    assert_eq!(loaded.original.element_type, ElementType::F32);
    assert_eq!(loaded.volume.data(), &expected().mapv(|v| v * 0.5 - 10.0));
}

#[test]
fn multi_channel_meta_image_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rgb.mha");
    let mut bytes = b"NDims = 3\nDimSize = 2 2 2\nElementType = MET_UCHAR\nElementNumberOfChannels = 3\n\
                      ElementDataFile = LOCAL\n"
        .to_vec();
    bytes.extend((0..24).map(|i| i as u8));
    fs::write(&path, bytes).unwrap();
    assert!(matches!(
        full_reader().read(&path),
        Err(ReadError::MetaImage(MetaImageError::MultiChannel(3)))
    ));
}

#[test]
fn long_thin_volume_meets_a_strict_budget() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rod.raw");
    fs::write(&path, (0..4000).map(|i| (i / 4 % 250) as u8).collect::<Vec<_>>()).unwrap();
    let options = ResampleOptions::default().with_target_size(100).with_strict_budget(true);
    let loaded = VolumeReader::new(
        ReadOptions::default()
            .with_mode(ReadMode::Resample(options))
            .with_raw_layout(RawLayout::new([1000, 2, 2], ElementType::U8)),
    )
    .read(&path)
    .unwrap();
    assert_eq!(loaded.loaded.shape, [1, 1, 100]);
    assert!(loaded.volume.voxel_count() <= 100);
}

#[test]
fn npy_attributes_report_layout() {
    let dir = TempDir::new().unwrap();
    let loaded = full_reader().read(write_npy(dir.path())).unwrap();
    assert_eq!(loaded.original.header_length, Some(128));
    assert_eq!(loaded.original.byte_order, Some(ByteOrder::Little));
    assert_eq!(loaded.original.bit_depth, 16);
}

#[test]
fn meta_image_spacing_is_carried() {
    let dir = TempDir::new().unwrap();
    let loaded = full_reader().read(write_mha(dir.path())).unwrap();
    assert_eq!(loaded.original.spacing, [0.5, 0.5, 2.0]);
    assert_eq!(loaded.volume.spacing(), [0.5, 0.5, 2.0]);
}

#[test]
fn resampling_fits_the_budget() {
    let dir = TempDir::new().unwrap();
    let path = write_npy(dir.path());
    let reader = VolumeReader::new(
        ReadOptions::default().with_mode(ReadMode::Resample(ResampleOptions::default().with_target_size(100))),
    );
    let loaded = reader.read(&path).unwrap();

    assert!(loaded.loaded.resampled);
    assert_eq!(loaded.loaded.shape, [3, 5, 5]);
    assert!(loaded.volume.voxel_count() <= 100);
    assert_eq!(loaded.loaded.spacing, [2.0, 2.0, 1.0]);
}

#[test]
fn resampling_within_budget_is_lossless() {
    let dir = TempDir::new().unwrap();
    let path = write_tiff_stack(dir.path());
    let options = ResampleOptions::default()
        .with_target_size(300)
        .with_strategy(DownsampleStrategy::PreserveSlices);
    let loaded = VolumeReader::new(ReadOptions::default().with_mode(ReadMode::Resample(options)))
        .read(&path)
        .unwrap();
    assert!(!loaded.loaded.resampled);
    assert_eq!(loaded.volume.data(), &expected());
}

#[test]
fn cropping_along_z_keeps_the_extent() {
    let dir = TempDir::new().unwrap();
    let path = write_raw(dir.path());
    let reader = VolumeReader::new(
        ReadOptions::default()
            .with_mode(ReadMode::Crop([0, 5, 0, 9, 1, 3]))
            .with_raw_layout(raw_layout()),
    );
    let loaded = reader.read(&path).unwrap();

    assert!(loaded.loaded.cropped);
    assert_eq!(loaded.volume.extent(), [0, 5, 0, 9, 1, 3]);
    assert_eq!(loaded.loaded.shape, [NX, NY, 3]);
    let expected = expected();
    assert_eq!(loaded.volume.data(), &expected.slice(ndarray::s![1..4, .., ..]));
}

#[test]
fn decimating_to_bounds() {
    let dir = TempDir::new().unwrap();
    let path = write_mha(dir.path());
    let reader = VolumeReader::new(ReadOptions::default().with_mode(ReadMode::Decimate {
        bounds: [3, 5, 5],
        sample_rate: None,
    }));
    let loaded = reader.read(&path).unwrap();
    assert_eq!(loaded.loaded.shape, [3, 5, 5]);
    assert_eq!(loaded.volume.data()[[2, 4, 2]], value(2, 8, 4) as f32);
    assert_eq!(loaded.loaded.spacing, [1.0, 1.0, 2.0]);
}

#[test]
fn single_tiff_file_reads_its_directory() {
    let dir = TempDir::new().unwrap();
    let stack = write_tiff_stack(dir.path());
    let loaded = full_reader().read(stack.join("slice_0000.tiff")).unwrap();
    assert_eq!(loaded.original.shape, [NX, NY, NZ]);
}

#[test]
fn truncated_files_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("short.raw");
    fs::write(&path, &sample_bytes()[..100]).unwrap();
    assert!(matches!(
        full_reader().read(&path),
        Err(ReadError::SizeMismatch { expected: 600, actual: 100, .. })
    ));

    let padded = dir.path().join("long.raw");
    let mut bytes = sample_bytes();
    bytes.push(0);
    fs::write(&padded, bytes).unwrap();
    assert!(matches!(full_reader().read(&padded), Err(ReadError::SizeMismatch { .. })));
}

#[test]
fn corrupt_npy_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.npy");
    fs::write(&path, b"PK\x03\x04 definitely a zip").unwrap();
    assert!(matches!(full_reader().read(&path), Err(ReadError::Npy(NpyError::BadMagic))));
}

#[test]
fn mixed_tiff_sizes_are_rejected() {
    let dir = TempDir::new().unwrap();
    let stack = write_tiff_stack(dir.path());
    let odd: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::new(3, 3);
    odd.save(stack.join("slice_9999.tiff")).unwrap();
    assert!(matches!(full_reader().read(&stack), Err(ReadError::InconsistentDimensions)));
}

#[tokio::test]
async fn async_read_streams_progress() {
    let dir = TempDir::new().unwrap();
    let path = write_npy(dir.path());
    let reader = VolumeReader::new(
        ReadOptions::default().with_mode(ReadMode::Resample(ResampleOptions::default().with_target_size(100))),
    );

    let (sender, receiver) = mpsc::unbounded();
    let (loaded, fractions) = futures::join!(reader.read_async(&path, sender), receiver.collect::<Vec<f32>>());
    let loaded = loaded.unwrap();

    assert_eq!(loaded.loaded.shape, [3, 5, 5]);
    assert_eq!(fractions.len(), NZ);
    assert!(fractions.iter().all(|f| (0.0..=1.0).contains(f)));
    assert!(fractions.contains(&1.0));
}
