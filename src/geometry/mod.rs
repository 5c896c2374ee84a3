//! Linear geometry used to seed the calibrator.
//!
//! Everything here is closed-form: Hartley-normalized DLT homographies for
//! planar rigs, the vanishing-point focal length estimate, decomposition of a
//! plane-induced homography into a pose, and a linear DLT pose for
//! non-planar rigs. Results are only starting points for the nonlinear
//! refinement in [`crate::optimization`].

use crate::camera::{CameraModelError, CameraParameters, RelativePosition};
use nalgebra::{DMatrix, DVector, Matrix2, Matrix3, Matrix3x4, Matrix4, Vector2, Vector3};
use std::f64::consts::SQRT_2;

/// Ratio of the smallest to largest point-spread variance below which a
/// point set is treated as collinear.
const COLLINEARITY_RATIO: f64 = 1e-12;

/// `K` for zero skew.
pub fn intrinsic_matrix(params: &CameraParameters) -> Matrix3<f64> {
    Matrix3::new(
        params.fx, 0.0, params.cx, 0.0, params.fy, params.cy, 0.0, 0.0, 1.0,
    )
}

/// Whether the world points of one view lie on a `z = const` plane, judged
/// by the z spread relative to the in-plane spread.
pub fn is_planar(points: &[Vector3<f64>], tolerance: f64) -> bool {
    if points.is_empty() {
        return false;
    }
    let n = points.len() as f64;
    let mean = points.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;
    let variance = points
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + (p - mean).component_mul(&(p - mean)))
        / n;
    let in_plane = (variance.x + variance.y).sqrt();
    variance.z.sqrt() <= tolerance * in_plane.max(f64::MIN_POSITIVE)
}

/// Mean z of a view; the plane offset of a planar rig.
pub fn plane_offset(points: &[Vector3<f64>]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    points.iter().map(|p| p.z).sum::<f64>() / points.len() as f64
}

/// Whether a 2D point set is degenerate (all points on one line, or coincident).
pub fn are_collinear(points: &[Vector2<f64>]) -> bool {
    if points.len() < 3 {
        return true;
    }
    let n = points.len() as f64;
    let mean = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let covariance = points
        .iter()
        .fold(Matrix2::zeros(), |acc, p| acc + (p - mean) * (p - mean).transpose())
        / n;
    let eigen = covariance.symmetric_eigen();
    let largest = eigen.eigenvalues.max();
    let smallest = eigen.eigenvalues.min();
    largest <= f64::MIN_POSITIVE || smallest <= COLLINEARITY_RATIO * largest
}

/// Similarity that moves the centroid to the origin and scales the mean
/// distance to `sqrt(2)`.
fn normalization_transform(points: &[Vector2<f64>]) -> Result<Matrix3<f64>, CameraModelError> {
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_distance = points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / n;
    if mean_distance <= f64::EPSILON {
        return Err(CameraModelError::InvalidInput(
            "points are coincident".to_string(),
        ));
    }
    let s = SQRT_2 / mean_distance;
    Ok(Matrix3::new(
        s,
        0.0,
        -s * centroid.x,
        0.0,
        s,
        -s * centroid.y,
        0.0,
        0.0,
        1.0,
    ))
}

fn apply_homogeneous(transform: &Matrix3<f64>, point: &Vector2<f64>) -> Vector2<f64> {
    let p = transform * Vector3::new(point.x, point.y, 1.0);
    Vector2::new(p.x / p.z, p.y / p.z)
}

/// Right singular vector of the smallest singular value, i.e. the least
/// squares solution of `A x = 0` with `|x| = 1`.
fn null_vector(mut a: DMatrix<f64>) -> Result<DVector<f64>, CameraModelError> {
    let cols = a.ncols();
    if a.nrows() < cols {
        // Thin SVD drops the null direction of a wide matrix; zero rows keep it.
        a = a.resize_vertically(cols, 0.0);
    }
    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(CameraModelError::SingularNormalEquations)?;
    let index = svd.singular_values.imin();
    Ok(v_t.row(index).transpose())
}

/// Homography `H` with `pixel ~ H (x, y, 1)` from at least four rig-plane /
/// pixel correspondences, normalized so that `H[(2, 2)] = 1`.
///
/// # Errors
///
/// * [`CameraModelError::InvalidInput`] for fewer than four points,
///   mismatched lengths, or a collinear point layout.
pub fn estimate_homography(
    plane: &[Vector2<f64>],
    pixels: &[Vector2<f64>],
) -> Result<Matrix3<f64>, CameraModelError> {
    let n = plane.len();
    if n < 4 || pixels.len() != n {
        return Err(CameraModelError::InvalidInput(format!(
            "homography needs at least 4 matched points, got {} and {}",
            n,
            pixels.len()
        )));
    }
    if are_collinear(plane) || are_collinear(pixels) {
        return Err(CameraModelError::InvalidInput(
            "rig points are collinear".to_string(),
        ));
    }

    let t_plane = normalization_transform(plane)?;
    let t_pixel = normalization_transform(pixels)?;

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (pw, pi)) in plane.iter().zip(pixels).enumerate() {
        let w = apply_homogeneous(&t_plane, pw);
        let p = apply_homogeneous(&t_pixel, pi);
        let (r0, r1) = (2 * i, 2 * i + 1);

        a[(r0, 0)] = -w.x;
        a[(r0, 1)] = -w.y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = p.x * w.x;
        a[(r0, 7)] = p.x * w.y;
        a[(r0, 8)] = p.x;

        a[(r1, 3)] = -w.x;
        a[(r1, 4)] = -w.y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = p.y * w.x;
        a[(r1, 7)] = p.y * w.y;
        a[(r1, 8)] = p.y;
    }

    let h = null_vector(a)?;
    let normalized = Matrix3::from_row_slice(h.as_slice());
    let t_pixel_inv = t_pixel
        .try_inverse()
        .ok_or(CameraModelError::SingularNormalEquations)?;
    let mut homography = t_pixel_inv * normalized * t_plane;

    let scale = homography[(2, 2)];
    if scale.abs() <= f64::EPSILON {
        return Err(CameraModelError::InvalidInput(
            "homography maps the rig origin to infinity".to_string(),
        ));
    }
    homography /= scale;
    Ok(homography)
}

/// Focal lengths from the vanishing points of each view's rig axes.
///
/// With the principal point known, every plane-induced homography gives two
/// linear constraints on `(1/fx^2, 1/fy^2)`: the images of the rig's x and y
/// axes are orthogonal, and so are the images of its two diagonals.
///
/// # Errors
///
/// * [`CameraModelError::SingularNormalEquations`] with fewer than two views,
///   or when the views do not constrain the focal length (for example all
///   fronto-parallel).
pub fn estimate_focal_lengths(
    homographies: &[Matrix3<f64>],
    principal_point: &Vector2<f64>,
) -> Result<(f64, f64), CameraModelError> {
    if homographies.len() < 2 {
        return Err(CameraModelError::SingularNormalEquations);
    }

    let mut ata = Matrix2::<f64>::zeros();
    let mut atb = Vector2::<f64>::zeros();
    for h in homographies {
        let mut shifted = *h;
        for c in 0..3 {
            shifted[(0, c)] -= principal_point.x * h[(2, c)];
            shifted[(1, c)] -= principal_point.y * h[(2, c)];
        }

        let x_axis = shifted.column(0).into_owned();
        let y_axis = shifted.column(1).into_owned();
        let pairs = [
            (x_axis, y_axis),
            ((x_axis + y_axis) * 0.5, (x_axis - y_axis) * 0.5),
        ];
        for (u, v) in pairs {
            let (u, v) = (u.normalize(), v.normalize());
            let row = Vector2::new(u.x * v.x, u.y * v.y);
            let rhs = -u.z * v.z;
            ata += row * row.transpose();
            atb += row * rhs;
        }
    }

    let eigen = ata.symmetric_eigen();
    if eigen.eigenvalues.min() <= 1e-12 * eigen.eigenvalues.max().max(f64::MIN_POSITIVE) {
        return Err(CameraModelError::SingularNormalEquations);
    }
    let solution = ata
        .try_inverse()
        .ok_or(CameraModelError::SingularNormalEquations)?
        * atb;

    let fx = (1.0 / solution.x.abs()).sqrt();
    let fy = (1.0 / solution.y.abs()).sqrt();
    if !fx.is_finite() || !fy.is_finite() {
        return Err(CameraModelError::SingularNormalEquations);
    }
    Ok((fx, fy))
}

/// Nearest proper rotation to `m` in the Frobenius sense.
fn project_to_rotation(m: &Matrix3<f64>) -> Result<Matrix3<f64>, CameraModelError> {
    let svd = m.svd(true, true);
    let u = svd.u.ok_or(CameraModelError::SingularNormalEquations)?;
    let v_t = svd.v_t.ok_or(CameraModelError::SingularNormalEquations)?;
    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let mut flipped = u;
        flipped.column_mut(2).neg_mut();
        rotation = flipped * v_t;
    }
    Ok(rotation)
}

/// Decomposes a plane-induced homography into the pose of a rig lying on
/// the plane `z = plane_z`, given intrinsics `K`.
///
/// The scale is the mean of the two rotation column norms, its sign chosen
/// so the rig lies in front of the camera.
pub fn pose_from_homography(
    k: &Matrix3<f64>,
    homography: &Matrix3<f64>,
    plane_z: f64,
) -> Result<RelativePosition, CameraModelError> {
    let k_inv = k
        .try_inverse()
        .ok_or(CameraModelError::SingularNormalEquations)?;
    let r1 = k_inv * homography.column(0);
    let r2 = k_inv * homography.column(1);
    let t = k_inv * homography.column(2);

    let norm = 0.5 * (r1.norm() + r2.norm());
    if norm <= f64::EPSILON {
        return Err(CameraModelError::SingularNormalEquations);
    }
    let mut lambda = 1.0 / norm;
    if t.z * lambda < 0.0 {
        lambda = -lambda;
    }

    let (r1, r2) = (r1 * lambda, r2 * lambda);
    let approx = Matrix3::from_columns(&[r1, r2, r1.cross(&r2)]);
    let rotation = project_to_rotation(&approx)?;
    let translation = t * lambda - rotation.column(2) * plane_z;
    RelativePosition::from_rotation_matrix(&rotation, translation)
}

/// Linear pose from at least six non-coplanar world points and their
/// undistorted normalized image coordinates.
///
/// Solves the 3x4 projection `[R | t]` by a normalized DLT, fixes its scale
/// from the mean row norm of the rotation block and projects onto SO(3).
pub fn dlt_pose(
    world: &[Vector3<f64>],
    normalized: &[Vector2<f64>],
) -> Result<RelativePosition, CameraModelError> {
    let n = world.len();
    if n < 6 || normalized.len() != n {
        return Err(CameraModelError::InvalidInput(format!(
            "linear pose needs at least 6 matched points, got {} and {}",
            n,
            normalized.len()
        )));
    }

    let count = n as f64;
    let centroid = world.iter().fold(Vector3::zeros(), |acc, p| acc + p) / count;
    let mean_distance = world.iter().map(|p| (p - centroid).norm()).sum::<f64>() / count;
    if mean_distance <= f64::EPSILON {
        return Err(CameraModelError::InvalidInput(
            "world points are coincident".to_string(),
        ));
    }
    let scale = 3f64.sqrt() / mean_distance;
    let mut t_world = Matrix4::<f64>::identity() * scale;
    t_world[(3, 3)] = 1.0;
    t_world
        .fixed_view_mut::<3, 1>(0, 3)
        .copy_from(&(-centroid * scale));

    let mut a = DMatrix::<f64>::zeros(2 * n, 12);
    for (i, (pw, xn)) in world.iter().zip(normalized).enumerate() {
        let p = (pw - centroid) * scale;
        let (r0, r1) = (2 * i, 2 * i + 1);
        for (j, value) in [p.x, p.y, p.z, 1.0].into_iter().enumerate() {
            a[(r0, j)] = value;
            a[(r0, 8 + j)] = -xn.x * value;
            a[(r1, 4 + j)] = value;
            a[(r1, 8 + j)] = -xn.y * value;
        }
    }

    let p = null_vector(a)?;
    let projection = Matrix3x4::from_row_slice(p.as_slice()) * t_world;
    let block = projection.fixed_view::<3, 3>(0, 0).into_owned();

    let mut s = (block.row(0).norm() + block.row(1).norm() + block.row(2).norm()) / 3.0;
    if s <= f64::EPSILON {
        return Err(CameraModelError::SingularNormalEquations);
    }
    if block.determinant() < 0.0 {
        s = -s;
    }
    let rotation = project_to_rotation(&(block / s))?;
    let translation = projection.column(3) / s;
    RelativePosition::from_rotation_matrix(&rotation, translation)
}
