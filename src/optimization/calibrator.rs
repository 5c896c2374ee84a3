//! Joint calibration of shared intrinsics and per-view poses.

use crate::camera::pinhole::pixel_to_normalized;
use crate::camera::pose::POSE_DIM;
use crate::camera::{
    validation, CameraModelError, CameraParameters, RelativePosition, INTRINSIC_DIM,
};
use crate::data::ViewCorrespondences;
use crate::geometry::{
    dlt_pose, estimate_focal_lengths, estimate_homography, intrinsic_matrix, is_planar,
    plane_offset, pose_from_homography,
};
use crate::optimization::normal_equations::{total_cost, NormalEquations};
use crate::optimization::{
    CalibrationConfig, CalibrationSession, CalibrationState, InitialGuess, OptimizationSummary,
    ResidualStatistics, RigGeometry, ViewStatus,
};
use crate::util::{reprojection_errors, ProjectionError};
use log::{debug, info, warn};
use nalgebra::{DVector, Matrix3, Vector2, Vector3};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimum correspondences per view for a determined solve.
pub const MIN_POINTS_PER_VIEW: usize = 4;

/// Fits one [`CameraParameters`] shared by all views and one
/// [`RelativePosition`] per view.
///
/// The calibrator walks `Uninitialized -> Initializing -> Optimizing` and
/// ends in `Converged` or `Failed`. A failed run is never reported as
/// converged, whatever state the parameters were left in.
#[derive(Debug, Clone)]
pub struct Calibrator {
    config: CalibrationConfig,
    state: CalibrationState,
    partial: Option<CalibrationSession>,
}

struct Refined {
    parameters: CameraParameters,
    poses: Vec<RelativePosition>,
    summary: OptimizationSummary,
    /// Why the iteration stopped short of convergence.
    failure: Option<CameraModelError>,
}

impl Calibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        Self {
            config,
            state: CalibrationState::Uninitialized,
            partial: None,
        }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    /// Last accepted estimate of a run that failed during optimization, with
    /// every view marked [`ViewStatus::NotConverged`]. `None` after a
    /// successful run or a failure before optimization started.
    pub fn partial_session(&self) -> Option<&CalibrationSession> {
        self.partial.as_ref()
    }

    /// Calibrates from views of a rig, each an ordered list of world points
    /// and their observed pixels.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidInput`] for empty input, views with fewer
    ///   than four correspondences, non-finite values, or collinear rig points.
    /// * [`CameraModelError::NoInitialGuess`] for a non-planar rig without an
    ///   initial guess.
    /// * [`CameraModelError::SingularNormalEquations`] when the views do not
    ///   constrain every parameter (including a planar rig seen in one view).
    /// * [`CameraModelError::ConvergenceFailure`] when the iteration or
    ///   damping budget runs out.
    /// * [`CameraModelError::Timeout`] when the configured deadline passes.
    pub fn calibrate(
        &mut self,
        views: &[ViewCorrespondences],
    ) -> Result<CalibrationSession, CameraModelError> {
        self.partial = None;
        let result = self.run(views);
        match &result {
            Ok(_) => self.transition(CalibrationState::Converged),
            Err(err) => self.transition(CalibrationState::Failed(err.clone())),
        }
        result
    }

    fn transition(&mut self, state: CalibrationState) {
        info!("Calibration state: {} -> {}", self.state, state);
        self.state = state;
    }

    fn run(&mut self, views: &[ViewCorrespondences]) -> Result<CalibrationSession, CameraModelError> {
        let start = Instant::now();
        self.transition(CalibrationState::Initializing);
        validate_views(views)?;
        let (parameters, poses) = self.initialize(views)?;
        info!("Initial estimate: {:?}", parameters);

        self.transition(CalibrationState::Optimizing);
        let mut refined = self.optimize(views, parameters, poses, start)?;
        match refined.failure.take() {
            None => self.build_session(views, refined, true),
            Some(err) => {
                match self.build_session(views, refined, false) {
                    Ok(partial) => self.partial = Some(partial),
                    Err(e) => warn!("No partial result available: {e}"),
                }
                Err(err)
            }
        }
    }

    fn initialize(
        &self,
        views: &[ViewCorrespondences],
    ) -> Result<(CameraParameters, Vec<RelativePosition>), CameraModelError> {
        let tolerance = self.config.planarity_tolerance;
        let planar = match self.config.rig {
            RigGeometry::Auto => views.iter().all(|v| is_planar(&v.world, tolerance)),
            RigGeometry::Planar => {
                if let Some(i) = views.iter().position(|v| !is_planar(&v.world, tolerance)) {
                    return Err(CameraModelError::InvalidInput(format!(
                        "rig declared planar but view {i} is not"
                    )));
                }
                true
            }
            RigGeometry::NonPlanar => false,
        };
        debug!("Rig treated as {}", if planar { "planar" } else { "non-planar" });

        match &self.config.initial_guess {
            Some(guess) => self.initialize_from_guess(guess, views, planar),
            None if planar => self.initialize_planar(views),
            None => Err(CameraModelError::NoInitialGuess),
        }
    }

    /// Principal point at the image center, focal lengths from vanishing
    /// points, poses from per-view homographies.
    fn initialize_planar(
        &self,
        views: &[ViewCorrespondences],
    ) -> Result<(CameraParameters, Vec<RelativePosition>), CameraModelError> {
        let resolution = self.config.resolution;
        if resolution.width == 0 || resolution.height == 0 {
            return Err(CameraModelError::InvalidInput(
                "image resolution is required for planar initialization".to_string(),
            ));
        }
        let center = resolution.image_center();

        let homographies = views
            .iter()
            .map(|view| estimate_homography(&plane_coordinates(view), &view.pixels))
            .collect::<Result<Vec<_>, _>>()?;
        let (fx, fy) = estimate_focal_lengths(&homographies, &center)?;
        debug!("Vanishing-point focal lengths: fx = {fx:.3}, fy = {fy:.3}");

        let parameters = CameraParameters::new(fx, fy, center.x, center.y);
        validation::validate_parameters(&parameters)?;
        let k = intrinsic_matrix(&parameters);
        let poses = views
            .iter()
            .zip(&homographies)
            .map(|(view, h)| pose_from_homography(&k, h, plane_offset(&view.world)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((parameters, poses))
    }

    /// Supplied intrinsics, with supplied poses or linear poses computed on
    /// undistorted normalized coordinates.
    fn initialize_from_guess(
        &self,
        guess: &InitialGuess,
        views: &[ViewCorrespondences],
        planar: bool,
    ) -> Result<(CameraParameters, Vec<RelativePosition>), CameraModelError> {
        validation::validate_parameters(&guess.parameters)?;
        if let Some(poses) = &guess.poses {
            if poses.len() != views.len() {
                return Err(CameraModelError::InvalidInput(format!(
                    "initial guess has {} poses for {} views",
                    poses.len(),
                    views.len()
                )));
            }
            return Ok((guess.parameters, poses.clone()));
        }

        let poses = views
            .iter()
            .map(|view| {
                let normalized = view
                    .pixels
                    .iter()
                    .map(|p| {
                        pixel_to_normalized(p, &guess.parameters, &self.config.distortion_solver)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                if planar {
                    let h = estimate_homography(&plane_coordinates(view), &normalized)?;
                    pose_from_homography(&Matrix3::identity(), &h, plane_offset(&view.world))
                } else {
                    dlt_pose(&view.world, &normalized)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((guess.parameters, poses))
    }

    /// Runs Levenberg-Marquardt from the initial estimate.
    ///
    /// Returns `Err` only when no step can be attempted at all. Failures
    /// after that are recorded in `failure` together with the last
    /// accepted estimate.
    fn optimize(
        &self,
        views: &[ViewCorrespondences],
        mut parameters: CameraParameters,
        mut poses: Vec<RelativePosition>,
        start: Instant,
    ) -> Result<Refined, CameraModelError> {
        let config = &self.config;
        let mut damping = config.initial_damping;
        let mut equations = NormalEquations::assemble(&parameters, &poses, views, config.parallel)?;

        let rcond = equations.reciprocal_condition();
        if rcond < config.singularity_threshold {
            warn!("Normal equations are singular (reciprocal condition {rcond:.3e})");
            return Err(CameraModelError::SingularNormalEquations);
        }

        let mut summary = OptimizationSummary {
            initial_cost: equations.cost,
            final_cost: equations.cost,
            iterations: 0,
            successful_steps: 0,
            unsuccessful_steps: 0,
            final_damping: damping,
            total_time: Duration::ZERO,
        };
        info!(
            "Starting Levenberg-Marquardt over {} parameters, initial cost {:.6e}",
            equations.dimension(),
            equations.cost
        );

        let mut converged = equations.cost < config.absolute_cost_tolerance;
        let failure = loop {
            if converged {
                break None;
            }
            if summary.iterations >= config.max_iterations {
                break Some(CameraModelError::ConvergenceFailure(format!(
                    "iteration budget of {} exhausted at cost {:.6e}",
                    config.max_iterations, equations.cost
                )));
            }
            if let Some(timeout) = config.timeout {
                if start.elapsed() >= timeout {
                    warn!("Calibration deadline of {timeout:?} exceeded");
                    break Some(CameraModelError::Timeout);
                }
            }
            summary.iterations += 1;

            let step = match equations.solve_damped(damping) {
                Ok(step) => step,
                Err(err) => break Some(err),
            };
            let trial = apply_step(&parameters, &poses, &step).ok().and_then(|(p, q)| {
                total_cost(&p, &q, views, config.parallel)
                    .ok()
                    .filter(|c| c.is_finite())
                    .map(|c| (p, q, c))
            });

            match trial {
                Some((trial_parameters, trial_poses, trial_cost)) if trial_cost <= equations.cost => {
                    let accepted = match NormalEquations::assemble(
                        &trial_parameters,
                        &trial_poses,
                        views,
                        config.parallel,
                    ) {
                        Ok(accepted) => accepted,
                        Err(err) => break Some(err),
                    };
                    let previous = equations.cost;
                    parameters = trial_parameters;
                    poses = trial_poses;
                    equations = accepted;
                    damping = (damping * config.damping_decrease_factor).max(config.damping_min);
                    summary.successful_steps += 1;
                    debug!(
                        "Iteration {}: accepted, cost {:.6e} -> {:.6e}, damping {:.3e}",
                        summary.iterations, previous, equations.cost, damping
                    );

                    let relative = if previous > 0.0 {
                        (previous - equations.cost) / previous
                    } else {
                        0.0
                    };
                    converged = equations.cost < config.absolute_cost_tolerance
                        || relative < config.cost_tolerance;
                }
                rejected => {
                    damping *= config.damping_increase_factor;
                    summary.unsuccessful_steps += 1;
                    debug!(
                        "Iteration {}: rejected, trial cost {:.6e}, damping {:.3e}",
                        summary.iterations,
                        rejected.map_or(f64::INFINITY, |(_, _, c)| c),
                        damping
                    );
                    if damping > config.damping_max {
                        break Some(CameraModelError::ConvergenceFailure(format!(
                            "damping exceeded {:.1e} after {} iterations",
                            config.damping_max, summary.iterations
                        )));
                    }
                }
            }
        };

        summary.final_cost = equations.cost;
        summary.final_damping = damping;
        summary.total_time = start.elapsed();
        debug!("\n{summary}");
        Ok(Refined {
            parameters,
            poses,
            summary,
            failure,
        })
    }

    /// Residual statistics and per-view status for a refined estimate. Views
    /// of a run that did not converge are all reported `NotConverged`.
    fn build_session(
        &self,
        views: &[ViewCorrespondences],
        refined: Refined,
        converged: bool,
    ) -> Result<CalibrationSession, CameraModelError> {
        let per_view = views
            .iter()
            .zip(&refined.poses)
            .map(|(view, pose)| reprojection_errors(&refined.parameters, pose, view))
            .collect::<Result<Vec<_>, _>>()?;

        let rms = |errors: &[f64]| {
            (errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt()
        };
        let per_view_rms: Vec<f64> = per_view.iter().map(|e| rms(e)).collect();
        let all: Vec<f64> = per_view.concat();
        let statistics = ResidualStatistics {
            global_rms: rms(&all),
            projection_error: ProjectionError::from_errors(&all)?,
            per_view_rms,
        };

        let view_status = statistics
            .per_view_rms
            .iter()
            .enumerate()
            .map(|(i, &rms)| {
                if !converged {
                    ViewStatus::NotConverged { rms }
                } else if rms > self.config.view_rms_threshold {
                    warn!("View {i} reprojects with RMS {rms:.4} px");
                    ViewStatus::HighResidual { rms }
                } else {
                    ViewStatus::Converged
                }
            })
            .collect();

        if converged {
            info!(
                "Calibration converged after {} iterations, RMS {:.6} px",
                refined.summary.iterations, statistics.global_rms
            );
        } else {
            warn!(
                "Calibration stopped after {} iterations without converging, RMS {:.6} px",
                refined.summary.iterations, statistics.global_rms
            );
        }
        Ok(CalibrationSession {
            parameters: Arc::new(refined.parameters),
            poses: refined.poses,
            view_status,
            statistics,
            summary: refined.summary,
            converged,
        })
    }
}

fn validate_views(views: &[ViewCorrespondences]) -> Result<(), CameraModelError> {
    if views.is_empty() {
        return Err(CameraModelError::InvalidInput(
            "no views to calibrate from".to_string(),
        ));
    }
    for (i, view) in views.iter().enumerate() {
        if view.world.len() != view.pixels.len() {
            return Err(CameraModelError::InvalidInput(format!(
                "view {i} has {} world points but {} pixels",
                view.world.len(),
                view.pixels.len()
            )));
        }
        if view.len() < MIN_POINTS_PER_VIEW {
            return Err(CameraModelError::InvalidInput(format!(
                "view {i} has {} correspondences, at least {MIN_POINTS_PER_VIEW} are required",
                view.len()
            )));
        }
        let finite = view.world.iter().all(|p| p.iter().all(|v| v.is_finite()))
            && view.pixels.iter().all(|p| p.iter().all(|v| v.is_finite()));
        if !finite {
            return Err(CameraModelError::InvalidInput(format!(
                "view {i} contains non-finite values"
            )));
        }
    }
    Ok(())
}

fn plane_coordinates(view: &ViewCorrespondences) -> Vec<Vector2<f64>> {
    view.world.iter().map(|p| p.xy()).collect()
}

/// Adds the intrinsic increment and applies each pose increment on the left.
fn apply_step(
    parameters: &CameraParameters,
    poses: &[RelativePosition],
    step: &DVector<f64>,
) -> Result<(CameraParameters, Vec<RelativePosition>), CameraModelError> {
    let mut values = parameters.to_array();
    for (value, delta) in values.iter_mut().zip(step.iter()) {
        *value += delta;
    }
    let parameters = CameraParameters::from_slice(&values)?;

    let poses = poses
        .iter()
        .enumerate()
        .map(|(i, pose)| {
            let o = INTRINSIC_DIM + POSE_DIM * i;
            pose.perturbed(
                &Vector3::new(step[o], step[o + 1], step[o + 2]),
                &Vector3::new(step[o + 3], step[o + 4], step[o + 5]),
            )
        })
        .collect();
    Ok((parameters, poses))
}
