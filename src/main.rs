use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use futures::channel::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use volume_resample::config::{JobConfig, OutputFormat};
use volume_resample::{
    ByteOrder, DownsampleStrategy, ElementType, Hdf5Options, Interpolation, LoadedVolume, Orientation, RawLayout,
    ReadMode, ReadOptions, ResampleOptions, StorageOrder, VolumeReader,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Read large volumes into memory-bounded copies", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the shape, type and layout of a dataset as JSON
    Info {
        input: PathBuf,
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Downsample a dataset to fit a voxel budget
    Resample {
        input: PathBuf,
        /// JSON job file; flags given on the command line take precedence
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Maximum number of voxels in the output
        #[arg(short, long)]
        target_size: Option<u64>,
        /// Keep every slice along z and only shrink in-plane
        #[arg(long)]
        preserve_slices: bool,
        /// Fail when the budget cannot be met
        #[arg(long)]
        strict: bool,
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Cut an axis aligned extent out of a dataset
    Crop {
        input: PathBuf,
        /// Inclusive `x0 x1 y0 y1 z0 z1`; -1 stands for the whole axis bound
        #[arg(long, required = true, num_args = 6, value_names = ["X0", "X1", "Y0", "Y1", "Z0", "Z1"], allow_negative_numbers = true)]
        extent: Vec<i64>,
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Save one slice of a (resampled) dataset as an 8-bit PNG
    Preview {
        input: PathBuf,
        #[arg(long, default_value = "axial")]
        orientation: Orientation,
        /// Slice index, the central slice when omitted
        #[arg(long)]
        index: Option<usize>,
        /// Stretch the slice to square pixels
        #[arg(long)]
        linear: bool,
        #[arg(short, long)]
        target_size: Option<u64>,
        #[command(flatten)]
        source: SourceArgs,
        #[arg(short, long, value_name = "PNG")]
        output: PathBuf,
    },
}

/// Layout of headerless input, and the dataset of HDF5 input
#[derive(Args, Debug, Default)]
struct SourceArgs {
    /// Array shape as stored, for `.raw` input
    #[arg(long, num_args = 3, value_names = ["D0", "D1", "D2"])]
    shape: Option<Vec<usize>>,
    /// Element type of `.raw` input, e.g. uint16
    #[arg(long)]
    dtype: Option<String>,
    #[arg(long)]
    big_endian: bool,
    #[arg(long)]
    fortran: bool,
    #[arg(long, default_value_t = 0)]
    header_length: u64,
    /// HDF5 dataset path
    #[arg(long)]
    dataset: Option<String>,
    /// Index into the first axis of a 4D HDF5 dataset
    #[arg(long, default_value_t = 0)]
    index_4d: usize,
}

impl SourceArgs {
    fn apply(&self, mut options: ReadOptions) -> anyhow::Result<ReadOptions> {
        match (&self.shape, &self.dtype) {
            (Some(shape), Some(dtype)) => {
                let shape: [usize; 3] = shape
                    .as_slice()
                    .try_into()
                    .context("--shape takes three dimensions")?;
                let element_type: ElementType = dtype.parse()?;
                let byte_order = if self.big_endian { ByteOrder::Big } else { ByteOrder::Little };
                let storage_order = if self.fortran { StorageOrder::Fortran } else { StorageOrder::C };
                options = options.with_raw_layout(
                    RawLayout::new(shape, element_type)
                        .with_byte_order(byte_order)
                        .with_storage_order(storage_order)
                        .with_header_length(self.header_length),
                );
            }
            (None, None) => {}
            _ => bail!("--shape and --dtype must be given together"),
        }
        if self.dataset.is_some() || self.index_4d != 0 {
            let defaults = Hdf5Options::default();
            options = options.with_hdf5(Hdf5Options {
                dataset_name: self.dataset.clone().unwrap_or(defaults.dataset_name),
                index_4d: self.index_4d,
            });
        }
        Ok(options)
    }
}

#[derive(Args, Debug)]
struct OutputArgs {
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
    /// Defaults to the output file extension
    #[arg(short, long, value_enum)]
    format: Option<OutputFormat>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Info { input, source } => {
            let reader = VolumeReader::new(source.apply(ReadOptions::default())?);
            let (source, format) = reader
                .open_source(&input)
                .with_context(|| format!("cannot open {}", input.display()))?;
            let shape = source.shape().as_array();
            let summary = serde_json::json!({
                "file_name": input,
                "format": format,
                "shape": shape,
                "element_type": source.element_type(),
                "bit_depth": source.element_type().bit_depth(),
                "layout": source.layout(),
                "spacing": source.spacing(),
                "origin": source.origin(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Resample {
            input,
            config,
            target_size,
            preserve_slices,
            strict,
            source,
            output,
        } => {
            let job = match &config {
                Some(path) => {
                    JobConfig::from_path(path).with_context(|| format!("cannot load {}", path.display()))?
                }
                None => JobConfig::default(),
            };
            let mut options = source.apply(job.read_options()?)?;

            let mut resample = ResampleOptions::from(job.resample);
            if let Some(target_size) = target_size {
                resample = resample.with_target_size(target_size);
            }
            if preserve_slices {
                resample = resample.with_strategy(DownsampleStrategy::PreserveSlices);
            }
            if strict {
                resample = resample.with_strict_budget(true);
            }
            options = options.with_mode(ReadMode::Resample(resample));

            let loaded = read_with_progress(VolumeReader::new(options), &input).await?;
            let (path, format) = output_target(&output, job.output.as_ref().map(|o| (o.filename.clone(), o.format())))?;
            save(&loaded, &path, format)?;
        }
        Command::Crop {
            input,
            extent,
            source,
            output,
        } => {
            let extent: [i64; 6] = extent
                .as_slice()
                .try_into()
                .context("--extent takes six values")?;
            let options = source.apply(ReadOptions::default().with_mode(ReadMode::Crop(extent)))?;
            let loaded = read_with_progress(VolumeReader::new(options), &input).await?;
            let (path, format) = output_target(&output, None)?;
            save(&loaded, &path, format)?;
        }
        Command::Preview {
            input,
            orientation,
            index,
            linear,
            target_size,
            source,
            output,
        } => {
            let mut resample = ResampleOptions::default();
            if let Some(target_size) = target_size {
                resample = resample.with_target_size(target_size);
            }
            let options = source.apply(ReadOptions::default().with_mode(ReadMode::Resample(resample)))?;
            let loaded = read_with_progress(VolumeReader::new(options), &input).await?;
            let volume = &loaded.volume;

            let (z, y, x) = volume.dim();
            let index = index.unwrap_or(match orientation {
                Orientation::Axial => z / 2,
                Orientation::Coronal => y / 2,
                Orientation::Sagittal => x / 2,
            });
            let interpolation = if linear { Interpolation::Linear } else { Interpolation::None };
            let image = volume
                .get_image_from_axis(index, orientation, interpolation)
                .with_context(|| format!("slice {index} is outside the volume"))?;
            image
                .save(&output)
                .with_context(|| format!("cannot write {}", output.display()))?;
            info!(path = ?output, index, ?orientation, "preview written");
        }
    }
    Ok(())
}

async fn read_with_progress(reader: VolumeReader, input: &Path) -> anyhow::Result<LoadedVolume> {
    let (sender, receiver) = mpsc::unbounded();
    let read = reader.read_async(input, sender);
    let report = receiver.for_each(|fraction| {
        debug!("{:.0}% read", fraction * 100.0);
        futures::future::ready(())
    });
    let (loaded, ()) = futures::join!(read, report);
    let loaded = loaded.with_context(|| format!("cannot read {}", input.display()))?;
    info!(
        original = ?loaded.original.shape,
        loaded = ?loaded.loaded.shape,
        resampled = loaded.loaded.resampled,
        "volume loaded"
    );
    Ok(loaded)
}

fn output_target(
    args: &OutputArgs,
    from_job: Option<(PathBuf, Option<OutputFormat>)>,
) -> anyhow::Result<(PathBuf, OutputFormat)> {
    let (path, job_format) = match (&args.output, from_job) {
        (Some(path), _) => (path.clone(), None),
        (None, Some((path, format))) => (path, format),
        (None, None) => bail!("no output file given"),
    };
    let format = args
        .format
        .or(job_format)
        .or_else(|| OutputFormat::from_path(&path))
        .with_context(|| format!("cannot tell the output format of {}", path.display()))?;
    Ok((path, format))
}

fn save(loaded: &LoadedVolume, path: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let written = format
        .save_loaded(loaded, path)
        .with_context(|| format!("cannot write {}", path.display()))?;
    for file in written {
        info!(path = ?file, "written");
    }
    Ok(())
}
