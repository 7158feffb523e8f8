use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use orbslam_system::io::{EurocDataset, TumDataset};
use orbslam_system::{SaveOutcome, Sensor, SlamError, SystemBuilder};

/// Exit code for errors the pipeline cannot survive.
const FATAL_EXIT_CODE: u8 = 255;

/// Run the SLAM pipeline over a recorded sequence.
#[derive(Debug, Parser)]
#[command(name = "orbslam", version)]
struct Args {
    /// ORB vocabulary (.txt or .bin).
    #[arg(long)]
    vocabulary: PathBuf,

    /// YAML settings file.
    #[arg(long)]
    settings: PathBuf,

    #[arg(long, value_enum)]
    sensor: Sensor,

    /// Sequence directory: TUM root for monocular / RGB-D, EuRoC `mav0` for stereo.
    #[arg(long)]
    sequence: PathBuf,

    /// TUM associations file (RGB-D only). Defaults to `<sequence>/associations.txt`.
    #[arg(long)]
    associations: Option<PathBuf>,

    /// Map file (.bin) loaded at startup when it exists.
    #[arg(long)]
    map: Option<PathBuf>,

    /// Save the map to `--map` before shutting down.
    #[arg(long, requires = "map")]
    save_map: bool,

    /// Start the rerun viewer.
    #[arg(long)]
    viewer: bool,

    /// Output file for the frame trajectory (stereo / RGB-D).
    #[arg(long, default_value = "CameraTrajectory.txt")]
    trajectory: PathBuf,

    /// Write the frame trajectory in KITTI format instead of TUM.
    #[arg(long)]
    kitti: bool,

    /// Output file for the keyframe trajectory.
    #[arg(long, default_value = "KeyFrameTrajectory.txt")]
    keyframe_trajectory: PathBuf,
}

/// Frames of the selected dataset, in submission order.
enum Sequence {
    Tum(TumDataset),
    Euroc(EurocDataset),
}

impl Sequence {
    fn open(args: &Args) -> Result<Self> {
        Ok(match args.sensor {
            Sensor::Monocular => Sequence::Tum(TumDataset::monocular(&args.sequence)?),
            Sensor::Rgbd => {
                let associations = args
                    .associations
                    .clone()
                    .unwrap_or_else(|| args.sequence.join("associations.txt"));
                Sequence::Tum(TumDataset::rgbd(&args.sequence, &associations)?)
            }
            Sensor::Stereo => Sequence::Euroc(EurocDataset::new(&args.sequence)?),
        })
    }

    fn len(&self) -> usize {
        match self {
            Sequence::Tum(d) => d.len(),
            Sequence::Euroc(d) => d.len(),
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("orbslam_system=info,orbslam=info")))
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            match e.downcast_ref::<SlamError>() {
                Some(slam) if slam.is_fatal() => ExitCode::from(FATAL_EXIT_CODE),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let sequence = Sequence::open(args)?;
    if sequence.len() == 0 {
        bail!("No frames found in {}", args.sequence.display());
    }
    info!("Images in the sequence: {}", sequence.len());

    let mut builder = SystemBuilder::new(&args.vocabulary, &args.settings, args.sensor).use_viewer(args.viewer);
    if let Some(map) = &args.map {
        builder = builder.map_file(map);
    }
    let system = builder.build()?;

    let mut track_times = Vec::with_capacity(sequence.len());
    for idx in 0..sequence.len() {
        let start = Instant::now();
        match &sequence {
            Sequence::Tum(dataset) => {
                let timestamp = dataset.timestamp(idx).context("missing timestamp")?;
                let image = dataset.image(idx)?;
                match args.sensor {
                    Sensor::Rgbd => system.track_rgbd(&image, &dataset.depth(idx)?, timestamp)?,
                    _ => system.track_monocular(&image, timestamp)?,
                };
            }
            Sequence::Euroc(dataset) => {
                let timestamp = dataset.timestamp(idx).context("missing timestamp")?;
                let pair = dataset.stereo_pair(idx)?;
                system.track_stereo(&pair.left, &pair.right, timestamp)?;
            }
        }
        track_times.push(start.elapsed().as_secs_f64());
    }

    track_times.sort_by(f64::total_cmp);
    let total: f64 = track_times.iter().sum();
    info!("median tracking time: {:.4}", track_times[track_times.len() / 2]);
    info!("mean tracking time: {:.4}", total / track_times.len() as f64);

    if args.save_map {
        match system.save_map()? {
            SaveOutcome::Saved(path) => info!("Map saved to {}", path.display()),
            outcome => warn!("Map not saved: {:?}", outcome),
        }
    }

    system.shutdown();

    if args.sensor.has_depth() {
        let saved = if args.kitti {
            system.save_trajectory_kitti(&args.trajectory)
        } else {
            system.save_trajectory_tum(&args.trajectory)
        };
        if let Err(e) = saved {
            warn!("Camera trajectory not saved: {}", e);
        }
    }
    if let Err(e) = system.save_keyframe_trajectory_tum(&args.keyframe_trajectory) {
        warn!("Keyframe trajectory not saved: {}", e);
    }
    Ok(())
}
