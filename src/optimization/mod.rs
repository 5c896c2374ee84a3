//! The `optimization` module calibrates a pinhole camera from multi-view
//! 3D-2D correspondences.
//!
//! Calibration runs in two stages:
//! 1. A closed-form initialization: vanishing-point focal lengths and
//!    homography poses for planar rigs, or a supplied intrinsic guess plus
//!    linear DLT poses for non-planar rigs.
//! 2. A Levenberg-Marquardt refinement of the shared intrinsics and every
//!    per-view pose, minimizing the summed squared reprojection error.
//!
//! The configuration, state and result types live here; the solver itself is
//! in [`calibrator`] and the per-view linearization in [`normal_equations`].

use crate::camera::{
    CameraModelError, CameraParameters, DistortionSolver, RelativePosition, Resolution,
};
use crate::util::ProjectionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub mod calibrator;
pub mod normal_equations;

pub use calibrator::Calibrator;

/// How the calibration rig is treated during initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RigGeometry {
    /// Planar if every view's world points lie on a `z = const` plane.
    #[default]
    Auto,
    Planar,
    NonPlanar,
}

/// Starting point supplied by the caller. Required for non-planar rigs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialGuess {
    pub parameters: CameraParameters,
    /// One pose per view; estimated linearly when absent.
    #[serde(default)]
    pub poses: Option<Vec<RelativePosition>>,
}

impl InitialGuess {
    pub fn new(parameters: CameraParameters) -> Self {
        Self {
            parameters,
            poses: None,
        }
    }

    pub fn with_poses(mut self, poses: Vec<RelativePosition>) -> Self {
        self.poses = Some(poses);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub resolution: Resolution,
    pub rig: RigGeometry,
    /// Relative z spread below which a view counts as planar.
    pub planarity_tolerance: f64,
    pub initial_guess: Option<InitialGuess>,
    pub max_iterations: usize,
    pub initial_damping: f64,
    pub damping_min: f64,
    pub damping_max: f64,
    pub damping_increase_factor: f64,
    pub damping_decrease_factor: f64,
    /// Converged once an accepted step lowers the cost by less than this
    /// fraction.
    pub cost_tolerance: f64,
    /// Converged once the summed squared residual drops below this.
    pub absolute_cost_tolerance: f64,
    /// Reciprocal condition number of the scaled normal matrix below which
    /// the problem is reported singular.
    pub singularity_threshold: f64,
    pub timeout: Option<Duration>,
    /// Views whose RMS reprojection error exceeds this many pixels are
    /// flagged [`ViewStatus::HighResidual`].
    pub view_rms_threshold: f64,
    /// Linearize views on the rayon pool.
    pub parallel: bool,
    /// Used to undistort pixels when initializing from a supplied guess.
    pub distortion_solver: DistortionSolver,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            rig: RigGeometry::Auto,
            planarity_tolerance: 1e-6,
            initial_guess: None,
            max_iterations: 100,
            initial_damping: 1e-3,
            damping_min: 1e-12,
            damping_max: 1e12,
            damping_increase_factor: 10.0,
            damping_decrease_factor: 0.3,
            cost_tolerance: 1e-10,
            absolute_cost_tolerance: 1e-12,
            singularity_threshold: 1e-15,
            timeout: None,
            view_rms_threshold: 1.0,
            parallel: true,
            distortion_solver: DistortionSolver::default(),
        }
    }
}

impl CalibrationConfig {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            ..Self::default()
        }
    }

    pub fn with_rig(mut self, rig: RigGeometry) -> Self {
        self.rig = rig;
        self
    }

    pub fn with_initial_guess(mut self, guess: InitialGuess) -> Self {
        self.initial_guess = Some(guess);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the initial damping parameter.
    pub fn with_damping(mut self, damping: f64) -> Self {
        self.initial_damping = damping;
        self
    }

    /// Set the damping parameter bounds.
    pub fn with_damping_bounds(mut self, min: f64, max: f64) -> Self {
        self.damping_min = min;
        self.damping_max = max;
        self
    }

    /// Set the damping adjustment factors.
    pub fn with_damping_factors(mut self, increase: f64, decrease: f64) -> Self {
        self.damping_increase_factor = increase;
        self.damping_decrease_factor = decrease;
        self
    }

    pub fn with_cost_tolerance(mut self, relative: f64, absolute: f64) -> Self {
        self.cost_tolerance = relative;
        self.absolute_cost_tolerance = absolute;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_view_rms_threshold(mut self, threshold: f64) -> Self {
        self.view_rms_threshold = threshold;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Loads a configuration from YAML, or JSON when the extension is `.json`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CameraModelError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&contents)?),
            _ => Ok(serde_yaml::from_str(&contents)?),
        }
    }
}

/// Lifecycle of a calibration run.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationState {
    Uninitialized,
    Initializing,
    Optimizing,
    Converged,
    Failed(CameraModelError),
}

impl fmt::Display for CalibrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationState::Uninitialized => write!(f, "Uninitialized"),
            CalibrationState::Initializing => write!(f, "Initializing"),
            CalibrationState::Optimizing => write!(f, "Optimizing"),
            CalibrationState::Converged => write!(f, "Converged"),
            CalibrationState::Failed(err) => write!(f, "Failed: {err}"),
        }
    }
}

/// Outcome for a single view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewStatus {
    Converged,
    /// The joint fit converged but this view reprojects poorly.
    HighResidual { rms: f64 },
    /// The run stopped before converging; `rms` is for the last accepted
    /// estimate.
    NotConverged { rms: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualStatistics {
    pub per_view_rms: Vec<f64>,
    pub global_rms: f64,
    pub projection_error: ProjectionError,
}

/// Summary statistics for the Levenberg-Marquardt run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSummary {
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    /// Number of accepted steps (cost did not increase)
    pub successful_steps: usize,
    /// Number of rejected steps (damping increased)
    pub unsuccessful_steps: usize,
    pub final_damping: f64,
    pub total_time: Duration,
}

impl fmt::Display for OptimizationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Calibration Optimization Summary ===")?;
        writeln!(f, "Initial cost:              {:.6e}", self.initial_cost)?;
        writeln!(f, "Final cost:                {:.6e}", self.final_cost)?;
        writeln!(f, "Total iterations:          {}", self.iterations)?;
        writeln!(
            f,
            "Successful steps:          {} ({:.1}%)",
            self.successful_steps,
            100.0 * self.successful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(f, "Unsuccessful steps:        {}", self.unsuccessful_steps)?;
        writeln!(f, "Final damping parameter:   {:.6e}", self.final_damping)?;
        writeln!(f, "Total time:                {:?}", self.total_time)
    }
}

/// One shared intrinsic model and one pose per view. Read-only once
/// produced. A session from [`Calibrator::partial_session`] holds the last
/// accepted estimate of a failed run and is never marked converged.
#[derive(Debug, Clone)]
pub struct CalibrationSession {
    pub(crate) parameters: Arc<CameraParameters>,
    pub(crate) poses: Vec<RelativePosition>,
    pub(crate) view_status: Vec<ViewStatus>,
    pub(crate) statistics: ResidualStatistics,
    pub(crate) summary: OptimizationSummary,
    pub(crate) converged: bool,
}

/// Serializable record of a calibration run: intrinsics, per-view poses and
/// status, residual statistics and the optimizer summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub converged: bool,
    pub parameters: CameraParameters,
    pub poses: Vec<RelativePosition>,
    pub view_status: Vec<ViewStatus>,
    pub statistics: ResidualStatistics,
    pub summary: OptimizationSummary,
}

impl CalibrationReport {
    /// Writes the report as YAML, or JSON when the extension is `.json`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CameraModelError> {
        let path = path.as_ref();
        let contents = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            _ => serde_yaml::to_string(self)?,
        };
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CameraModelError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&contents)?),
            _ => Ok(serde_yaml::from_str(&contents)?),
        }
    }
}

impl CalibrationSession {
    /// Shared handle to the calibrated intrinsics.
    pub fn parameters(&self) -> Arc<CameraParameters> {
        Arc::clone(&self.parameters)
    }

    pub fn poses(&self) -> &[RelativePosition] {
        &self.poses
    }

    pub fn view_status(&self) -> &[ViewStatus] {
        &self.view_status
    }

    pub fn statistics(&self) -> &ResidualStatistics {
        &self.statistics
    }

    pub fn summary(&self) -> &OptimizationSummary {
        &self.summary
    }

    /// Whether the run met a convergence criterion.
    pub fn is_converged(&self) -> bool {
        self.converged
    }

    pub fn report(&self) -> CalibrationReport {
        CalibrationReport {
            converged: self.converged,
            parameters: *self.parameters,
            poses: self.poses.clone(),
            view_status: self.view_status.clone(),
            statistics: self.statistics.clone(),
            summary: self.summary.clone(),
        }
    }

    /// Whether every view fits within the configured residual threshold.
    pub fn all_views_converged(&self) -> bool {
        self.view_status
            .iter()
            .all(|s| matches!(s, ViewStatus::Converged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_yaml_uses_defaults_for_missing_fields() {
        let yaml = "resolution:\n  width: 640\n  height: 480\nrig: non_planar\nmax_iterations: 10\n";
        let config: CalibrationConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.rig, RigGeometry::NonPlanar);
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.initial_damping, 1e-3);
        assert!(config.parallel);
    }

    #[test]
    fn test_malformed_config_is_a_parse_error_in_both_formats() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("config.yaml");
        let json = dir.path().join("config.json");
        std::fs::write(&yaml, "max_iterations: [1, 2").unwrap();
        std::fs::write(&json, "{\"max_iterations\": ").unwrap();

        for path in [&yaml, &json] {
            assert!(matches!(
                CalibrationConfig::load(path),
                Err(CameraModelError::ParseError(_))
            ));
        }
    }

    #[test]
    fn test_config_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = CalibrationConfig::new(Resolution {
            width: 320,
            height: 240,
        })
        .with_damping(1e-2)
        .with_timeout(Duration::from_secs(3));
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(CalibrationConfig::load(&path).unwrap(), config);
    }
}
