//! Per-view extrinsics stored as axis-angle rotation plus translation.
//!
//! The rotation matrix is derived on demand with the Rodrigues formula
//! (`Rotation3::new`) and never persisted, so the stored state cannot drift
//! out of SO(3).

use crate::camera::CameraModelError;
use nalgebra::{Matrix3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

/// Number of scalars in a [`RelativePosition`].
pub const POSE_DIM: usize = 6;

/// World-to-camera transform `X_cam = R(rotation) * X_world + translation`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelativePosition {
    /// Axis-angle rotation; direction is the axis, norm the angle in radians.
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
}

impl Default for RelativePosition {
    fn default() -> Self {
        Self::identity()
    }
}

impl RelativePosition {
    pub fn new(rotation: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self::new(Vector3::zeros(), Vector3::zeros())
    }

    /// Builds a pose from a rotation matrix, projecting it onto SO(3) first.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidInput`] if the matrix has non-finite
    ///   entries or is reflective (`det <= 0`).
    pub fn from_rotation_matrix(
        rotation: &Matrix3<f64>,
        translation: Vector3<f64>,
    ) -> Result<Self, CameraModelError> {
        if rotation.iter().any(|v| !v.is_finite()) || rotation.determinant() <= 0.0 {
            return Err(CameraModelError::InvalidInput(
                "rotation matrix must be a finite proper rotation".to_string(),
            ));
        }
        let projected = Rotation3::from_matrix(rotation);
        Ok(Self::new(projected.scaled_axis(), translation))
    }

    /// Rodrigues: axis-angle to rotation matrix.
    pub fn rotation_matrix(&self) -> Rotation3<f64> {
        Rotation3::new(self.rotation)
    }

    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation_matrix() * point + self.translation
    }

    /// Camera aperture in world coordinates, `-R^T T`.
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation_matrix().inverse() * self.translation)
    }

    /// Rotates a camera-frame direction into the world frame.
    pub fn direction_to_world(&self, direction: &Vector3<f64>) -> Vector3<f64> {
        self.rotation_matrix().inverse() * direction
    }

    /// Applies a left-multiplied rotation increment and an additive
    /// translation increment: `R <- exp(delta_rotation) R`, `T <- T + delta_t`.
    pub fn perturbed(&self, delta_rotation: &Vector3<f64>, delta_translation: &Vector3<f64>) -> Self {
        let rotation = Rotation3::new(*delta_rotation) * self.rotation_matrix();
        Self::new(rotation.scaled_axis(), self.translation + delta_translation)
    }

    /// `[rx, ry, rz, tx, ty, tz]`.
    pub fn to_array(&self) -> [f64; POSE_DIM] {
        [
            self.rotation.x,
            self.rotation.y,
            self.rotation.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        ]
    }

    pub fn from_slice(values: &[f64]) -> Result<Self, CameraModelError> {
        if values.len() != POSE_DIM {
            return Err(CameraModelError::InvalidParams(format!(
                "expected {} pose values, got {}",
                POSE_DIM,
                values.len()
            )));
        }
        Ok(Self::new(
            Vector3::new(values[0], values[1], values[2]),
            Vector3::new(values[3], values[4], values[5]),
        ))
    }
}
