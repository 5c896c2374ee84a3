//! Camera parameters, the camera model trait, and the error taxonomy shared
//! by calibration and triangulation.
//!
//! The pinhole projection pipeline itself lives in [`pinhole`], the iterative
//! inverse of the lens distortion in [`distortion`], and per-view extrinsics in
//! [`pose`].

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod distortion;
pub mod pinhole;
pub mod pose;

pub use distortion::DistortionSolver;
pub use pinhole::PinholeModel;
pub use pose::RelativePosition;

/// Intrinsic parameters of a pinhole camera with 4-term radial-tangential
/// distortion.
///
/// One instance is shared by every view taken with the same physical
/// camera and lens. Once calibration converges it is treated as immutable;
/// consumers hold it behind an `Arc` rather than copying it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraParameters {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Radial distortion coefficients.
    pub k1: f64,
    pub k2: f64,
    /// Tangential distortion coefficients.
    pub p1: f64,
    pub p2: f64,
}

/// Number of scalars in [`CameraParameters`].
pub const INTRINSIC_DIM: usize = 8;

impl CameraParameters {
    /// Distortion-free parameters.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            k1: 0.0,
            k2: 0.0,
            p1: 0.0,
            p2: 0.0,
        }
    }

    pub fn with_distortion(mut self, k1: f64, k2: f64, p1: f64, p2: f64) -> Self {
        self.k1 = k1;
        self.k2 = k2;
        self.p1 = p1;
        self.p2 = p2;
        self
    }

    /// Parameters in optimizer order `[fx, fy, cx, cy, k1, k2, p1, p2]`.
    pub fn to_array(&self) -> [f64; INTRINSIC_DIM] {
        [
            self.fx, self.fy, self.cx, self.cy, self.k1, self.k2, self.p1, self.p2,
        ]
    }

    pub fn from_slice(values: &[f64]) -> Result<Self, CameraModelError> {
        if values.len() != INTRINSIC_DIM {
            return Err(CameraModelError::InvalidParams(format!(
                "expected {} camera parameters, got {}",
                INTRINSIC_DIM,
                values.len()
            )));
        }
        let params = Self {
            fx: values[0],
            fy: values[1],
            cx: values[2],
            cy: values[3],
            k1: values[4],
            k2: values[5],
            p1: values[6],
            p2: values[7],
        };
        validation::validate_parameters(&params)?;
        Ok(params)
    }

    pub fn distortion(&self) -> [f64; 4] {
        [self.k1, self.k2, self.p1, self.p2]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Image center under the top-left-pixel-center convention: the center
    /// of pixel (0, 0) is the origin, so the center of a `w x h` image is at
    /// `(w/2 - 0.5, h/2 - 0.5)`.
    pub fn image_center(&self) -> Vector2<f64> {
        Vector2::new(
            self.width as f64 / 2.0 - 0.5,
            self.height as f64 / 2.0 - 0.5,
        )
    }

    /// Whether `pixel` falls on the sensor. Pixel `i` covers `[i - 0.5, i + 0.5)`.
    pub fn contains(&self, pixel: &Vector2<f64>) -> bool {
        pixel.x >= -0.5
            && pixel.x < self.width as f64 - 0.5
            && pixel.y >= -0.5
            && pixel.y < self.height as f64 - 0.5
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CameraModelError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Point is behind or on the camera plane")]
    DegenerateProjection,
    #[error("Inverse distortion did not converge")]
    UndistortDivergence,
    #[error("Non-planar rig requires an initial intrinsic guess")]
    NoInitialGuess,
    #[error("Normal equations are numerically singular")]
    SingularNormalEquations,
    #[error("Calibration did not converge: {0}")]
    ConvergenceFailure(String),
    #[error("Calibration deadline exceeded")]
    Timeout,
    #[error("At least two observations are required for triangulation")]
    InsufficientViews,
    #[error("Rays are too close to parallel for triangulation")]
    DegenerateGeometry,
    #[error("Projection is outside the image")]
    ProjectionOutSideImage,
    #[error("Input point is outside the image")]
    PointIsOutSideImage,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    /// Malformed YAML or JSON document for a serde-deserialized type.
    #[error("Failed to parse document: {0}")]
    ParseError(String),
    #[error("CSV error: {0}")]
    CsvError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CameraModelError {
    fn from(err: std::io::Error) -> Self {
        CameraModelError::IOError(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for CameraModelError {
    fn from(err: yaml_rust::ScanError) -> Self {
        CameraModelError::YamlError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CameraModelError {
    fn from(err: serde_yaml::Error) -> Self {
        CameraModelError::ParseError(err.to_string())
    }
}

impl From<serde_json::Error> for CameraModelError {
    fn from(err: serde_json::Error) -> Self {
        CameraModelError::ParseError(err.to_string())
    }
}

impl From<csv::Error> for CameraModelError {
    fn from(err: csv::Error) -> Self {
        CameraModelError::CsvError(err.to_string())
    }
}

/// Trait defining the core functionality for camera models
pub trait CameraModel {
    /// Project a 3D point in the camera frame to pixel coordinates
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError>;

    /// Unproject pixel coordinates to a unit-length ray in the camera frame
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError>;

    /// Load camera parameters from a YAML file
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError>
    where
        Self: Sized;

    /// Save camera parameters to a YAML file
    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError>;

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraModelError>;

    fn get_resolution(&self) -> Resolution;

    fn get_parameters(&self) -> CameraParameters;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_parameters(params: &CameraParameters) -> Result<(), CameraModelError> {
        if params.fx.is_nan() || params.fy.is_nan() || params.fx <= 0.0 || params.fy <= 0.0 {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !params.cx.is_finite() || !params.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        if params.distortion().iter().any(|k| !k.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "distortion coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_center_convention() {
        let resolution = Resolution {
            width: 640,
            height: 480,
        };
        let center = resolution.image_center();
        assert_eq!(center.x, 319.5);
        assert_eq!(center.y, 239.5);
        assert!(resolution.contains(&Vector2::new(-0.5, -0.5)));
        assert!(!resolution.contains(&Vector2::new(639.5, 10.0)));
    }

    #[test]
    fn test_validate_parameters() {
        let good = CameraParameters::new(500.0, 500.0, 320.0, 240.0);
        assert!(validation::validate_parameters(&good).is_ok());

        let bad = CameraParameters::new(-1.0, 500.0, 320.0, 240.0);
        assert_eq!(
            validation::validate_parameters(&bad),
            Err(CameraModelError::FocalLengthMustBePositive)
        );

        let nan = CameraParameters::new(500.0, f64::NAN, 320.0, 240.0);
        assert_eq!(
            validation::validate_parameters(&nan),
            Err(CameraModelError::FocalLengthMustBePositive)
        );

        let off = CameraParameters::new(500.0, 500.0, f64::INFINITY, 240.0);
        assert_eq!(
            validation::validate_parameters(&off),
            Err(CameraModelError::PrincipalPointMustBeFinite)
        );
    }

    #[test]
    fn test_from_slice_roundtrip_order() {
        let params = CameraParameters::new(800.0, 780.0, 320.0, 240.0)
            .with_distortion(-0.1, 0.02, 0.001, -0.002);
        let restored = CameraParameters::from_slice(&params.to_array()).unwrap();
        assert_eq!(params, restored);
        assert!(CameraParameters::from_slice(&[1.0, 2.0]).is_err());
    }
}
