//! Linearization of the reprojection residuals and assembly of the
//! Gauss-Newton normal equations.
//!
//! The parameter vector is laid out as
//!
//! ```text
//! [fx fy cx cy k1 k2 p1 p2 | rot_0 trans_0 | rot_1 trans_1 | ...]
//! ```
//!
//! Each view only touches the shared intrinsics and its own pose, so its
//! contribution is a dense 14x14 block. Blocks are computed independently
//! (on the rayon pool when requested) and scattered into the global system
//! in one sequential pass. Rotation columns are derivatives with respect to
//! a left-multiplied increment `R <- exp(delta) R`.

use crate::camera::pinhole::{
    apply_distortion, distortion_jacobian, normalized_to_pixel, perspective_projection,
};
use crate::camera::pose::POSE_DIM;
use crate::camera::{CameraModelError, CameraParameters, RelativePosition, INTRINSIC_DIM};
use crate::data::ViewCorrespondences;
use nalgebra::{DMatrix, DVector, Matrix2, Matrix2x3, SMatrix, SVector, Vector2, Vector3};
use rayon::prelude::*;

/// Parameters touched by one view: intrinsics followed by that view's pose.
pub const VIEW_BLOCK_DIM: usize = INTRINSIC_DIM + POSE_DIM;

pub type PointJacobian = SMatrix<f64, 2, VIEW_BLOCK_DIM>;

/// Pixel residual `projected - observed` and its Jacobian.
pub fn linearize_point(
    params: &CameraParameters,
    pose: &RelativePosition,
    world: &Vector3<f64>,
    observed: &Vector2<f64>,
) -> Result<(Vector2<f64>, PointJacobian), CameraModelError> {
    let rotated = pose.rotation_matrix() * world;
    let camera = rotated + pose.translation;
    let normalized = perspective_projection(&camera)?;
    let distorted = apply_distortion(&normalized, params);
    let residual = normalized_to_pixel(&distorted, params) - observed;

    let (xn, yn) = (normalized.x, normalized.y);
    let r2 = normalized.norm_squared();
    let r4 = r2 * r2;
    let (fx, fy) = (params.fx, params.fy);

    let mut jacobian = PointJacobian::zeros();
    jacobian[(0, 0)] = distorted.x;
    jacobian[(0, 2)] = 1.0;
    jacobian[(0, 4)] = fx * xn * r2;
    jacobian[(0, 5)] = fx * xn * r4;
    jacobian[(0, 6)] = fx * 2.0 * xn * yn;
    jacobian[(0, 7)] = fx * (r2 + 2.0 * xn * xn);

    jacobian[(1, 1)] = distorted.y;
    jacobian[(1, 3)] = 1.0;
    jacobian[(1, 4)] = fy * yn * r2;
    jacobian[(1, 5)] = fy * yn * r4;
    jacobian[(1, 6)] = fy * (r2 + 2.0 * yn * yn);
    jacobian[(1, 7)] = fy * 2.0 * xn * yn;

    let z_inv = 1.0 / camera.z;
    let d_normalized = Matrix2x3::new(z_inv, 0.0, -xn * z_inv, 0.0, z_inv, -yn * z_inv);
    let d_pixel = Matrix2::new(fx, 0.0, 0.0, fy) * distortion_jacobian(&normalized, params) * d_normalized;

    jacobian
        .fixed_view_mut::<2, 3>(0, INTRINSIC_DIM)
        .copy_from(&(d_pixel * -rotated.cross_matrix()));
    jacobian
        .fixed_view_mut::<2, 3>(0, INTRINSIC_DIM + 3)
        .copy_from(&d_pixel);

    Ok((residual, jacobian))
}

/// `J^T J`, `J^T r` and the squared residual sum of one view.
#[derive(Debug, Clone)]
pub struct ViewContribution {
    pub hessian: SMatrix<f64, VIEW_BLOCK_DIM, VIEW_BLOCK_DIM>,
    pub gradient: SVector<f64, VIEW_BLOCK_DIM>,
    pub cost: f64,
}

pub fn linearize_view(
    params: &CameraParameters,
    pose: &RelativePosition,
    view: &ViewCorrespondences,
) -> Result<ViewContribution, CameraModelError> {
    let mut contribution = ViewContribution {
        hessian: SMatrix::zeros(),
        gradient: SVector::zeros(),
        cost: 0.0,
    };
    for (world, observed) in view.world.iter().zip(&view.pixels) {
        let (residual, jacobian) = linearize_point(params, pose, world, observed)?;
        contribution.hessian += jacobian.transpose() * jacobian;
        contribution.gradient += jacobian.transpose() * residual;
        contribution.cost += residual.norm_squared();
    }
    Ok(contribution)
}

/// Summed squared reprojection error of one view.
pub fn view_cost(
    params: &CameraParameters,
    pose: &RelativePosition,
    view: &ViewCorrespondences,
) -> Result<f64, CameraModelError> {
    let rotation = pose.rotation_matrix();
    view.world
        .iter()
        .zip(&view.pixels)
        .map(|(world, observed)| {
            let normalized = perspective_projection(&(rotation * world + pose.translation))?;
            let pixel = normalized_to_pixel(&apply_distortion(&normalized, params), params);
            Ok((pixel - observed).norm_squared())
        })
        .sum()
}

fn check_lengths(
    poses: &[RelativePosition],
    views: &[ViewCorrespondences],
) -> Result<(), CameraModelError> {
    if poses.len() != views.len() {
        return Err(CameraModelError::InvalidInput(format!(
            "{} poses for {} views",
            poses.len(),
            views.len()
        )));
    }
    Ok(())
}

/// Total cost over all views.
pub fn total_cost(
    params: &CameraParameters,
    poses: &[RelativePosition],
    views: &[ViewCorrespondences],
    parallel: bool,
) -> Result<f64, CameraModelError> {
    check_lengths(poses, views)?;
    let costs: Vec<f64> = if parallel {
        views
            .par_iter()
            .zip(poses.par_iter())
            .map(|(view, pose)| view_cost(params, pose, view))
            .collect::<Result<_, _>>()?
    } else {
        views
            .iter()
            .zip(poses)
            .map(|(view, pose)| view_cost(params, pose, view))
            .collect::<Result<_, _>>()?
    };
    Ok(costs.iter().sum())
}

/// Dense normal equations `J^T J` and `J^T r` over all parameters.
#[derive(Debug, Clone)]
pub struct NormalEquations {
    pub hessian: DMatrix<f64>,
    pub gradient: DVector<f64>,
    pub cost: f64,
}

impl NormalEquations {
    pub fn assemble(
        params: &CameraParameters,
        poses: &[RelativePosition],
        views: &[ViewCorrespondences],
        parallel: bool,
    ) -> Result<Self, CameraModelError> {
        check_lengths(poses, views)?;
        let contributions: Vec<ViewContribution> = if parallel {
            views
                .par_iter()
                .zip(poses.par_iter())
                .map(|(view, pose)| linearize_view(params, pose, view))
                .collect::<Result<_, _>>()?
        } else {
            views
                .iter()
                .zip(poses)
                .map(|(view, pose)| linearize_view(params, pose, view))
                .collect::<Result<_, _>>()?
        };

        let dim = INTRINSIC_DIM + POSE_DIM * views.len();
        let mut equations = NormalEquations {
            hessian: DMatrix::zeros(dim, dim),
            gradient: DVector::zeros(dim),
            cost: 0.0,
        };
        for (index, contribution) in contributions.iter().enumerate() {
            let offset = INTRINSIC_DIM + POSE_DIM * index;
            let global = |k: usize| if k < INTRINSIC_DIM { k } else { offset + k - INTRINSIC_DIM };
            for r in 0..VIEW_BLOCK_DIM {
                equations.gradient[global(r)] += contribution.gradient[r];
                for c in 0..VIEW_BLOCK_DIM {
                    equations.hessian[(global(r), global(c))] += contribution.hessian[(r, c)];
                }
            }
            equations.cost += contribution.cost;
        }
        Ok(equations)
    }

    pub fn dimension(&self) -> usize {
        self.gradient.len()
    }

    /// Reciprocal condition number of `J^T J` after Jacobi scaling to unit
    /// diagonal. Zero when some parameter is unconstrained.
    pub fn reciprocal_condition(&self) -> f64 {
        let diagonal = self.hessian.diagonal();
        if diagonal.iter().any(|d| !(d.is_finite() && *d > 0.0)) {
            return 0.0;
        }
        let scale = diagonal.map(|d| 1.0 / d.sqrt());
        let scaled = DMatrix::from_fn(self.dimension(), self.dimension(), |r, c| {
            self.hessian[(r, c)] * scale[r] * scale[c]
        });
        let eigenvalues = scaled.symmetric_eigenvalues();
        let largest = eigenvalues.max();
        if largest <= 0.0 {
            return 0.0;
        }
        (eigenvalues.min() / largest).max(0.0)
    }

    /// Solves the Marquardt-damped system `(J^T J + damping * diag(J^T J)) step = -J^T r`.
    pub fn solve_damped(&self, damping: f64) -> Result<DVector<f64>, CameraModelError> {
        let mut system = self.hessian.clone();
        for i in 0..self.dimension() {
            system[(i, i)] += damping * self.hessian[(i, i)];
        }
        let cholesky = system
            .cholesky()
            .ok_or(CameraModelError::SingularNormalEquations)?;
        let step = cholesky.solve(&(-&self.gradient));
        if step.iter().any(|v| !v.is_finite()) {
            return Err(CameraModelError::SingularNormalEquations);
        }
        Ok(step)
    }
}
