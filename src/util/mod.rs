//! Reprojection statistics and synthetic calibration data.

use crate::camera::pinhole::project_world_point;
use crate::camera::{CameraModelError, CameraParameters, RelativePosition, Resolution};
use crate::data::{PointCorrespondence, ViewCorrespondences};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

impl ProjectionError {
    /// Summary statistics of per-point pixel error magnitudes.
    pub fn from_errors(errors: &[f64]) -> Result<Self, CameraModelError> {
        if errors.is_empty() {
            return Err(CameraModelError::InvalidInput(
                "no reprojection errors to summarize".to_string(),
            ));
        }

        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let variance = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let rmse = (errors.iter().map(|x| x.powi(2)).sum::<f64>() / n).sqrt();
        let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        let mut sorted = errors.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Ok(ProjectionError {
            rmse,
            min,
            max,
            mean,
            stddev: variance.sqrt(),
            median,
        })
    }
}

/// Pixel distance between each observation of a view and its projection.
pub fn reprojection_errors(
    params: &CameraParameters,
    pose: &RelativePosition,
    view: &ViewCorrespondences,
) -> Result<Vec<f64>, CameraModelError> {
    view.world
        .iter()
        .zip(&view.pixels)
        .map(|(world, pixel)| Ok((project_world_point(world, params, pose)? - pixel).norm()))
        .collect()
}

pub fn compute_reprojection_error(
    params: &CameraParameters,
    pose: &RelativePosition,
    view: &ViewCorrespondences,
) -> Result<ProjectionError, CameraModelError> {
    ProjectionError::from_errors(&reprojection_errors(params, pose, view)?)
}

/// Corners of a `cols x rows` checkerboard with the given spacing, centered
/// on the origin of the `z = 0` plane.
pub fn planar_grid(cols: usize, rows: usize, spacing: f64) -> Vec<Vector3<f64>> {
    let x0 = (cols.saturating_sub(1)) as f64 * spacing / 2.0;
    let y0 = (rows.saturating_sub(1)) as f64 * spacing / 2.0;
    (0..rows)
        .flat_map(|j| {
            (0..cols).map(move |i| Vector3::new(i as f64 * spacing - x0, j as f64 * spacing - y0, 0.0))
        })
        .collect()
}

/// Projects `points` through every pose, producing one view per pose.
pub fn synthetic_views(
    params: &CameraParameters,
    poses: &[RelativePosition],
    points: &[Vector3<f64>],
) -> Result<Vec<ViewCorrespondences>, CameraModelError> {
    poses
        .iter()
        .map(|pose| {
            let pixels = points
                .iter()
                .map(|p| project_world_point(p, params, pose))
                .collect::<Result<Vec<_>, _>>()?;
            ViewCorrespondences::new(points.to_vec(), pixels)
        })
        .collect()
}

/// Flattens views into indexed correspondences.
pub fn flatten_views(views: &[ViewCorrespondences]) -> Vec<PointCorrespondence> {
    views
        .iter()
        .enumerate()
        .flat_map(|(view, v)| {
            v.world
                .iter()
                .zip(&v.pixels)
                .map(move |(world, pixel)| PointCorrespondence {
                    world: *world,
                    pixel: *pixel,
                    view,
                })
        })
        .collect()
}

/// A 640x480 camera with moderate barrel distortion used by the demo and
/// the calibration tests.
pub fn reference_camera() -> (CameraParameters, Resolution) {
    (
        CameraParameters::new(800.0, 780.0, 322.0, 236.0).with_distortion(
            -0.12, 0.03, 0.001, -0.0008,
        ),
        Resolution {
            width: 640,
            height: 480,
        },
    )
}

/// Six tilted views of a board about 0.6 - 0.7 m in front of the camera.
pub fn reference_poses() -> Vec<RelativePosition> {
    [
        ([0.2, -0.1, 0.05], [10.0, -5.0, 600.0]),
        ([-0.25, 0.15, -0.1], [-20.0, 10.0, 650.0]),
        ([0.1, 0.3, 0.2], [0.0, 0.0, 700.0]),
        ([-0.15, -0.3, 0.0], [15.0, 20.0, 620.0]),
        ([0.3, 0.2, -0.15], [-10.0, -15.0, 680.0]),
        ([0.05, -0.25, 0.3], [5.0, 5.0, 720.0]),
    ]
    .iter()
    .map(|(r, t)| RelativePosition::new(Vector3::from(*r), Vector3::from(*t)))
    .collect()
}

/// Board used with [`reference_poses`]: 9x7 corners, 30 mm apart.
pub fn reference_board() -> Vec<Vector3<f64>> {
    planar_grid(9, 7, 30.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_projection_error_statistics() {
        let stats = ProjectionError::from_errors(&[1.0, 3.0, 2.0, 4.0]).unwrap();
        assert_relative_eq!(stats.mean, 2.5);
        assert_relative_eq!(stats.median, 2.5);
        assert_relative_eq!(stats.min, 1.0);
        assert_relative_eq!(stats.max, 4.0);
        assert_relative_eq!(stats.rmse, (30.0f64 / 4.0).sqrt());
        assert_relative_eq!(stats.stddev, 1.25f64.sqrt());
        assert!(ProjectionError::from_errors(&[]).is_err());
    }

    #[test]
    fn test_planar_grid_is_centered() {
        let grid = planar_grid(9, 7, 30.0);
        assert_eq!(grid.len(), 63);
        let centroid = grid.iter().fold(Vector3::zeros(), |a, p| a + p) / grid.len() as f64;
        assert_relative_eq!(centroid, Vector3::zeros(), epsilon = 1e-12);
        assert_eq!(grid[0], Vector3::new(-120.0, -90.0, 0.0));
    }

    #[test]
    fn test_reference_views_fit_in_image() {
        let (params, resolution) = reference_camera();
        let views = synthetic_views(&params, &reference_poses(), &reference_board()).unwrap();
        assert_eq!(views.len(), 6);
        for view in &views {
            assert!(view.pixels.iter().all(|p| resolution.contains(p)));
        }
        let errors = compute_reprojection_error(&params, &reference_poses()[0], &views[0]).unwrap();
        assert!(errors.max < 1e-9);
        assert_eq!(flatten_views(&views).len(), 6 * 63);
    }
}
