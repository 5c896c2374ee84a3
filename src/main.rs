//! Command line front end for pinhole calibration and triangulation.
//!
//! Usage:
//! ```bash
//! pinhole-tools calibrate --input corners.csv --width 640 --height 480 --output cam.yaml
//! pinhole-tools triangulate --rig rig.yaml --observations observations.csv
//! pinhole-tools demo
//! ```

use clap::{Parser, Subcommand};
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use log::{error, info, warn};
use pinhole_tools::camera::{CameraModel, PinholeModel, Resolution};
use pinhole_tools::data::{correspondences_from_samples, group_by_view, load_correspondences_csv};
use pinhole_tools::optimization::{CalibrationConfig, Calibrator};
use pinhole_tools::triangulation::{
    CalibratedCamera, Observation, QueryOutcome, RigDescription, StereoTriangulator,
    TriangulatorConfig,
};
use pinhole_tools::{data, util};
use std::path::{Path, PathBuf};

/// Pinhole camera calibration and multi-view triangulation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Calibrate a camera from a CSV of `view,x3d,y3d,z3d,x2d,y2d` rows
    Calibrate {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(long)]
        width: u32,

        #[arg(long)]
        height: u32,

        /// Calibration settings (YAML, or JSON with a `.json` extension)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Where to write the calibrated camera as Kalibr-style YAML. The
        /// full calibration report goes next to it as `<stem>.report.yaml`.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Triangulate points from a rig description and a CSV of
    /// `query,camera,u,v` observations
    Triangulate {
        #[arg(short, long)]
        rig: PathBuf,

        #[arg(short = 'b', long)]
        observations: PathBuf,

        /// Where to write one `{query, point | error}` record per query as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Calibrate a synthetic camera and triangulate a point with the result
    Demo,
}

fn run_calibration(
    input: &Path,
    resolution: Resolution,
    config: Option<&Path>,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match config {
        Some(path) => CalibrationConfig::load(path)?,
        None => CalibrationConfig::default(),
    };
    config.resolution = resolution;

    let samples = load_correspondences_csv(input)?;
    info!(
        "Loaded {} correspondences from {:?}",
        samples.sample_count(),
        input
    );
    let views = group_by_view(&correspondences_from_samples(&samples)?);

    let mut calibrator = Calibrator::new(config);
    let report_path = output.map(|path| path.with_extension("report.yaml"));
    let session = match calibrator.calibrate(&views) {
        Ok(session) => session,
        Err(e) => {
            if let (Some(partial), Some(path)) = (calibrator.partial_session(), &report_path) {
                partial.report().save(path)?;
                warn!("Saved non-converged calibration report to {:?}", path);
            }
            return Err(e.into());
        }
    };
    info!("\n{}", session.summary());
    info!(
        "Global RMS reprojection error: {:.6} px",
        session.statistics().global_rms
    );
    if !session.all_views_converged() {
        warn!("Some views exceed the residual threshold: {:?}", session.view_status());
    }

    let model = PinholeModel::new(*session.parameters(), resolution)?;
    info!("Calibrated model: {:?}", model);
    if let (Some(path), Some(report_path)) = (output, &report_path) {
        let path_str = path.to_str().ok_or("Invalid output path string")?;
        model.save_to_yaml(path_str)?;
        info!("Saved calibrated camera to {}", path_str);
        session.report().save(report_path)?;
        info!("Saved calibration report to {:?}", report_path);
    }
    Ok(())
}

fn run_triangulation(
    rig: &Path,
    observations: &Path,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let rig = RigDescription::load(rig)?;
    let triangulator = StereoTriangulator::from_rig(&rig, TriangulatorConfig::default())?;
    info!("Loaded rig with {} cameras", triangulator.camera_count());

    let queries = data::load_observations_csv(observations)?;
    let results = triangulator.triangulate_many(&queries);

    let mut outcomes = Vec::with_capacity(results.len());
    for (index, result) in results.iter().enumerate() {
        match result {
            Ok(point) => info!(
                "Query {}: {:?} quality {:.3e} from {} pairs",
                index, point.position, point.quality, point.pairs_used
            ),
            Err(e) => error!("Query {} failed: {}", index, e),
        }
        outcomes.push(QueryOutcome::new(index, result));
    }

    if let Some(path) = output {
        QueryOutcome::save_all(&outcomes, path)?;
        info!("Saved {} query results to {:?}", outcomes.len(), path);
    }
    Ok(())
}

fn run_demo() -> Result<(), Box<dyn std::error::Error>> {
    let (truth, resolution) = util::reference_camera();
    let views = util::synthetic_views(&truth, &util::reference_poses(), &util::reference_board())?;
    info!("Generated {} synthetic views", views.len());

    let mut calibrator = Calibrator::new(CalibrationConfig::new(resolution));
    let session = calibrator.calibrate(&views)?;
    info!("\n{}", session.summary());
    info!("Ground truth: {:?}", truth);
    info!("Estimated:    {:?}", session.parameters());

    // Treat the first two board poses as a stereo pair observing a board corner.
    let mut triangulator = StereoTriangulator::new(TriangulatorConfig::default());
    for (id, pose) in ["view0", "view1"].iter().zip(session.poses()) {
        triangulator.add_camera(*id, CalibratedCamera::new(session.parameters(), *pose));
    }
    let corner = util::reference_board()[10];
    let observations = [
        Observation::new("view0", views[0].pixels[10]),
        Observation::new("view1", views[1].pixels[10]),
    ];
    let point = triangulator.triangulate(&observations)?;
    info!(
        "Triangulated corner {:?} as {:?} (quality {:.3e})",
        corner, point.position, point.quality
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let _logger = Logger::try_with_str(level)?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .suppress_timestamp()
                .suffix("log"),
        )
        .duplicate_to_stdout(Duplicate::All)
        .format_for_files(detailed_format)
        .format_for_stdout(colored_detailed_format)
        // error;warn;info;debug;trace
        .set_palette("196;208;76;39;178".to_string())
        .start()?;

    match &cli.command {
        Command::Calibrate {
            input,
            width,
            height,
            config,
            output,
        } => run_calibration(
            input,
            Resolution {
                width: *width,
                height: *height,
            },
            config.as_deref(),
            output.as_deref(),
        ),
        Command::Triangulate {
            rig,
            observations,
            output,
        } => run_triangulation(rig, observations, output.as_deref()),
        Command::Demo => run_demo(),
    }
}
