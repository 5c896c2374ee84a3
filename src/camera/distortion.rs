//! Iterative inverse of the radial-tangential distortion map.
//!
//! The forward map `Xd = D(Xn)` mixes quartic radial and quadratic tangential
//! terms and has no closed-form inverse. [`DistortionSolver::undistort`] runs
//! the classic fixed-point iteration
//!
//! ```text
//! Xn_{k+1} = (Xd - tangential(Xn_k)) / (1 + k1 r^2 + k2 r^4)
//! ```
//!
//! and, when that stalls or runs away, retries with a bounded number of Newton
//! steps on `D(Xn) - Xd` starting from the best fixed-point estimate.
//!
//! For strong distortion `D` folds over itself and one `Xd` can have several
//! preimages. The wanted one is connected to the origin through a region
//! where `det J > 0`. An estimate that fails that check is discarded, and the
//! solver continues from the origin instead, following the preimage of
//! `t * Xd` as `t` grows from 0 to 1. A value is only returned once the
//! forward map reproduces the input without crossing a fold; otherwise the
//! caller gets [`CameraModelError::UndistortDivergence`].

use crate::camera::pinhole::{apply_distortion, distortion_jacobian, tangential_term};
use crate::camera::{CameraModelError, CameraParameters};
use log::debug;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistortionSolver {
    /// Stop once an update moves the estimate by less than this.
    pub tolerance: f64,
    /// Fixed-point iteration cap.
    pub max_iterations: usize,
    /// Cap on the Newton retry.
    pub newton_iterations: usize,
    /// Estimates whose magnitude exceeds this are treated as divergent.
    pub divergence_bound: f64,
}

impl Default for DistortionSolver {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_iterations: 20,
            newton_iterations: 20,
            divergence_bound: 1e6,
        }
    }
}

/// Samples of the Jacobian determinant taken between the origin and an
/// estimate.
const FOLD_SAMPLES: usize = 16;

/// Continuation gives up once its step in `t` falls below this.
const MIN_CONTINUATION_STEP: f64 = 1.0 / 4096.0;

enum FixedPoint {
    Converged(Vector2<f64>),
    Stalled(Vector2<f64>),
    Diverged,
}

impl DistortionSolver {
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Recover normalized undistorted coordinates from distorted normalized
    /// coordinates.
    pub fn undistort(
        &self,
        distorted: &Vector2<f64>,
        params: &CameraParameters,
    ) -> Result<Vector2<f64>, CameraModelError> {
        if !distorted.x.is_finite() || !distorted.y.is_finite() {
            return Err(CameraModelError::InvalidInput(
                "distorted point must be finite".to_string(),
            ));
        }
        if params.distortion().iter().all(|k| *k == 0.0) {
            return Ok(*distorted);
        }

        let start = match self.fixed_point(distorted, params) {
            FixedPoint::Converged(point) if self.accepts(&point, distorted, params) => {
                return Ok(point)
            }
            FixedPoint::Converged(point) | FixedPoint::Stalled(point) => point,
            FixedPoint::Diverged => *distorted,
        };

        debug!(
            "fixed-point undistortion did not settle at ({:.6}, {:.6}), retrying with Newton steps",
            distorted.x, distorted.y
        );
        if let Ok(point) = self.newton(distorted, start, params) {
            if self.accepts(&point, distorted, params) {
                return Ok(point);
            }
        }

        debug!(
            "continuing undistortion of ({:.6}, {:.6}) from the origin",
            distorted.x, distorted.y
        );
        let point = self.continuation(distorted, params)?;
        if self.accepts(&point, distorted, params) {
            Ok(point)
        } else {
            Err(CameraModelError::UndistortDivergence)
        }
    }

    fn fixed_point(&self, distorted: &Vector2<f64>, params: &CameraParameters) -> FixedPoint {
        let mut point = *distorted;
        for _ in 0..self.max_iterations {
            let r2 = point.norm_squared();
            let radial = 1.0 + params.k1 * r2 + params.k2 * r2 * r2;
            if radial.abs() < f64::EPSILON {
                return FixedPoint::Diverged;
            }
            let next = (distorted - tangential_term(&point, params)) / radial;
            let step = (next - point).norm();
            point = next;

            if !step.is_finite() || point.norm() > self.divergence_bound {
                return FixedPoint::Diverged;
            }
            if step < self.tolerance {
                return FixedPoint::Converged(point);
            }
        }
        FixedPoint::Stalled(point)
    }

    fn newton(
        &self,
        distorted: &Vector2<f64>,
        start: Vector2<f64>,
        params: &CameraParameters,
    ) -> Result<Vector2<f64>, CameraModelError> {
        let mut point = start;
        for _ in 0..self.newton_iterations {
            let error = apply_distortion(&point, params) - distorted;
            if error.norm() < self.tolerance {
                return Ok(point);
            }
            let jacobian = distortion_jacobian(&point, params);
            let delta = jacobian
                .try_inverse()
                .ok_or(CameraModelError::UndistortDivergence)?
                * error;
            point -= delta;

            if !point.x.is_finite() || !point.y.is_finite() || point.norm() > self.divergence_bound
            {
                return Err(CameraModelError::UndistortDivergence);
            }
            if delta.norm() < self.tolerance {
                return Ok(point);
            }
        }
        Err(CameraModelError::UndistortDivergence)
    }

    /// Tracks the preimage of `t * distorted` from `t = 0`, where it is the
    /// origin, to `t = 1`. Steps that land past a fold or jump away from the
    /// previous estimate are retried with half the step.
    fn continuation(
        &self,
        distorted: &Vector2<f64>,
        params: &CameraParameters,
    ) -> Result<Vector2<f64>, CameraModelError> {
        let max_jump = 10.0 * distorted.norm();
        let mut point = Vector2::zeros();
        let mut t = 0.0;
        let mut step = 0.25;
        while t < 1.0 {
            let next_t = f64::min(1.0, t + step);
            let next = self
                .newton(&(distorted * next_t), point, params)
                .ok()
                .filter(|next| {
                    distortion_jacobian(next, params).determinant() > 0.0
                        && (next - point).norm() <= max_jump * step
                });
            match next {
                Some(next) => {
                    point = next;
                    t = next_t;
                    step = f64::min(2.0 * step, 0.5);
                }
                None => {
                    step *= 0.5;
                    if step < MIN_CONTINUATION_STEP {
                        return Err(CameraModelError::UndistortDivergence);
                    }
                }
            }
        }
        Ok(point)
    }

    /// True if `point` maps back onto `distorted` and the straight path from
    /// the origin to it never crosses a fold of the distortion map.
    fn accepts(
        &self,
        point: &Vector2<f64>,
        distorted: &Vector2<f64>,
        params: &CameraParameters,
    ) -> bool {
        self.reproduces(point, distorted, params)
            && (1..=FOLD_SAMPLES).all(|i| {
                let along = point * (i as f64 / FOLD_SAMPLES as f64);
                distortion_jacobian(&along, params).determinant() > 0.0
            })
    }

    fn reproduces(
        &self,
        point: &Vector2<f64>,
        distorted: &Vector2<f64>,
        params: &CameraParameters,
    ) -> bool {
        (apply_distortion(point, params) - distorted).norm() <= self.tolerance * 1e2
    }
}
