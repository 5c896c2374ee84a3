//! Implements the pinhole projection pipeline with radial-tangential distortion.
//!
//! The pipeline is split into pure, stateless stages so the calibrator and the
//! triangulator share exactly the same arithmetic:
//!
//! ```text
//! world --R·X+T--> camera --x/z,y/z--> normalized --D(.)--> distorted --K--> pixel
//! ```
//!
//! Pixel coordinates put the origin at the *center* of the top-left pixel.
//! [`PinholeModel`] wraps the stages behind the [`CameraModel`] trait for a
//! camera with known resolution.

use crate::camera::{
    validation, CameraModel, CameraModelError, CameraParameters, DistortionSolver,
    RelativePosition, Resolution,
};
use nalgebra::{Matrix2, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::{fmt, fs, io::Write};
use yaml_rust::{Yaml, YamlLoader};

/// `R·X + T`.
pub fn world_to_camera(point: &Vector3<f64>, pose: &RelativePosition) -> Vector3<f64> {
    pose.transform_point(point)
}

/// Perspective division onto the unit-distance image plane.
///
/// # Errors
///
/// * [`CameraModelError::DegenerateProjection`] if the point lies on or behind
///   the camera plane (`z <= 0`).
pub fn perspective_projection(point_cam: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
    if point_cam.z <= 0.0 || !point_cam.z.is_finite() {
        return Err(CameraModelError::DegenerateProjection);
    }
    Ok(Vector2::new(point_cam.x / point_cam.z, point_cam.y / point_cam.z))
}

/// Tangential part of the distortion map.
pub fn tangential_term(normalized: &Vector2<f64>, params: &CameraParameters) -> Vector2<f64> {
    let (x, y) = (normalized.x, normalized.y);
    let r2 = x * x + y * y;
    Vector2::new(
        2.0 * params.p1 * x * y + params.p2 * (r2 + 2.0 * x * x),
        params.p1 * (r2 + 2.0 * y * y) + 2.0 * params.p2 * x * y,
    )
}

/// Forward distortion: `Xd = (1 + k1 r^2 + k2 r^4) Xn + tangential(Xn)`.
pub fn apply_distortion(normalized: &Vector2<f64>, params: &CameraParameters) -> Vector2<f64> {
    let r2 = normalized.norm_squared();
    let radial = 1.0 + params.k1 * r2 + params.k2 * r2 * r2;
    normalized * radial + tangential_term(normalized, params)
}

/// Jacobian of [`apply_distortion`] with respect to the normalized point.
pub fn distortion_jacobian(normalized: &Vector2<f64>, params: &CameraParameters) -> Matrix2<f64> {
    let (x, y) = (normalized.x, normalized.y);
    let r2 = x * x + y * y;
    let radial = 1.0 + params.k1 * r2 + params.k2 * r2 * r2;
    // d(radial)/d(r^2)
    let d_radial = params.k1 + 2.0 * params.k2 * r2;
    let cross = 2.0 * x * y * d_radial + 2.0 * params.p1 * x + 2.0 * params.p2 * y;

    Matrix2::new(
        radial + 2.0 * x * x * d_radial + 2.0 * params.p1 * y + 6.0 * params.p2 * x,
        cross,
        cross,
        radial + 2.0 * y * y * d_radial + 6.0 * params.p1 * y + 2.0 * params.p2 * x,
    )
}

/// Affine map from distorted normalized coordinates to pixels (zero skew).
pub fn normalized_to_pixel(distorted: &Vector2<f64>, params: &CameraParameters) -> Vector2<f64> {
    Vector2::new(
        params.fx * distorted.x + params.cx,
        params.fy * distorted.y + params.cy,
    )
}

/// Exact inverse of [`normalized_to_pixel`].
pub fn pixel_to_distorted(pixel: &Vector2<f64>, params: &CameraParameters) -> Vector2<f64> {
    Vector2::new(
        (pixel.x - params.cx) / params.fx,
        (pixel.y - params.cy) / params.fy,
    )
}

/// Pixel to undistorted normalized coordinates.
///
/// # Errors
///
/// * [`CameraModelError::UndistortDivergence`] if the distortion inverse does
///   not converge.
pub fn pixel_to_normalized(
    pixel: &Vector2<f64>,
    params: &CameraParameters,
    solver: &DistortionSolver,
) -> Result<Vector2<f64>, CameraModelError> {
    solver.undistort(&pixel_to_distorted(pixel, params), params)
}

/// Project a point already expressed in the camera frame.
pub fn project_camera_point(
    point_cam: &Vector3<f64>,
    params: &CameraParameters,
) -> Result<Vector2<f64>, CameraModelError> {
    let normalized = perspective_projection(point_cam)?;
    Ok(normalized_to_pixel(
        &apply_distortion(&normalized, params),
        params,
    ))
}

/// Full pipeline from a world point to pixel coordinates for one view.
pub fn project_world_point(
    point: &Vector3<f64>,
    params: &CameraParameters,
    pose: &RelativePosition,
) -> Result<Vector2<f64>, CameraModelError> {
    project_camera_point(&world_to_camera(point, pose), params)
}

/// A calibrated pinhole camera of known resolution.
#[derive(Clone, Serialize, Deserialize)]
pub struct PinholeModel {
    pub parameters: CameraParameters,
    pub resolution: Resolution,
    #[serde(default)]
    pub solver: DistortionSolver,
}

impl PinholeModel {
    pub fn new(
        parameters: CameraParameters,
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        let model = PinholeModel {
            parameters,
            resolution,
            solver: DistortionSolver::default(),
        };
        model.validate_params()?;
        Ok(model)
    }
}

impl fmt::Debug for PinholeModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = &self.parameters;
        write!(
            f,
            "PinholeModel [fx: {} fy: {} cx: {} cy: {} distortion: {:?} resolution: {}x{}]",
            p.fx,
            p.fy,
            p.cx,
            p.cy,
            p.distortion(),
            self.resolution.width,
            self.resolution.height,
        )
    }
}

fn yaml_f64(node: &Yaml) -> Option<f64> {
    node.as_f64().or_else(|| node.as_i64().map(|v| v as f64))
}

fn yaml_vec(doc: &Yaml, key: &str, expected: usize) -> Result<Vec<f64>, CameraModelError> {
    let node = doc["cam0"][key]
        .as_vec()
        .ok_or_else(|| CameraModelError::InvalidParams(format!("Missing {key}")))?;
    if node.len() != expected {
        return Err(CameraModelError::InvalidParams(format!(
            "Expected {expected} values for {key}, found {}",
            node.len()
        )));
    }
    node.iter()
        .enumerate()
        .map(|(i, value)| {
            yaml_f64(value).ok_or_else(|| {
                CameraModelError::InvalidParams(format!("Invalid {key} value at index {i}"))
            })
        })
        .collect()
}

impl CameraModel for PinholeModel {
    /// Projects a camera-frame point to pixels, rejecting points that land
    /// outside the sensor.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let pixel = project_camera_point(point_3d, &self.parameters)?;
        if !self.resolution.contains(&pixel) {
            return Err(CameraModelError::ProjectionOutSideImage);
        }
        Ok(pixel)
    }

    /// Unprojects a pixel to a unit ray `(xn, yn, 1) / |(xn, yn, 1)|`.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        if !self.resolution.contains(point_2d) {
            return Err(CameraModelError::PointIsOutSideImage);
        }
        let normalized = pixel_to_normalized(point_2d, &self.parameters, &self.solver)?;
        Ok(Vector3::new(normalized.x, normalized.y, 1.0).normalize())
    }

    /// Loads parameters from a Kalibr-style YAML file:
    ///
    /// ```yaml
    /// cam0:
    ///   camera_model: pinhole
    ///   intrinsics: [fx, fy, cx, cy]
    ///   distortion_coeffs: [k1, k2, p1, p2]
    ///   resolution: [width, height]
    /// ```
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        let docs = YamlLoader::load_from_str(&contents)?;
        let doc = docs
            .first()
            .ok_or_else(|| CameraModelError::InvalidParams("Empty YAML document".to_string()))?;

        let intrinsics = yaml_vec(doc, "intrinsics", 4)?;
        let distortion = yaml_vec(doc, "distortion_coeffs", 4)?;
        let resolution = yaml_vec(doc, "resolution", 2)?;

        let parameters = CameraParameters::new(
            intrinsics[0],
            intrinsics[1],
            intrinsics[2],
            intrinsics[3],
        )
        .with_distortion(distortion[0], distortion[1], distortion[2], distortion[3]);

        PinholeModel::new(
            parameters,
            Resolution {
                width: resolution[0] as u32,
                height: resolution[1] as u32,
            },
        )
    }

    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        let p = &self.parameters;
        let mut cam = serde_yaml::Mapping::new();
        cam.insert("camera_model".into(), "pinhole".into());
        cam.insert(
            "intrinsics".into(),
            serde_yaml::to_value(vec![p.fx, p.fy, p.cx, p.cy])?,
        );
        cam.insert(
            "distortion_coeffs".into(),
            serde_yaml::to_value(p.distortion().to_vec())?,
        );
        cam.insert(
            "resolution".into(),
            serde_yaml::to_value(vec![self.resolution.width, self.resolution.height])?,
        );
        let mut root = serde_yaml::Mapping::new();
        root.insert("cam0".into(), serde_yaml::Value::Mapping(cam));

        let yaml_string = serde_yaml::to_string(&root)?;
        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;
        Ok(())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_parameters(&self.parameters)
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_parameters(&self) -> CameraParameters {
        self.parameters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_model() -> PinholeModel {
        PinholeModel::new(
            CameraParameters::new(461.629, 460.152, 362.680, 246.049).with_distortion(
                -0.2834,
                0.0739,
                0.00019,
                1.76e-05,
            ),
            Resolution {
                width: 752,
                height: 480,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_principal_point_maps_optical_axis_to_itself() {
        let params = CameraParameters::new(1000.0, 1000.0, 320.0, 240.0);
        let pixel = project_world_point(
            &Vector3::new(0.0, 0.0, 1000.0),
            &params,
            &RelativePosition::identity(),
        )
        .unwrap();
        assert_eq!(pixel, Vector2::new(320.0, 240.0));
    }

    #[test]
    fn test_perspective_projection_rejects_points_behind_camera() {
        assert_eq!(
            perspective_projection(&Vector3::new(1.0, 1.0, 0.0)),
            Err(CameraModelError::DegenerateProjection)
        );
        assert_eq!(
            perspective_projection(&Vector3::new(1.0, 1.0, -2.0)),
            Err(CameraModelError::DegenerateProjection)
        );
    }

    #[test]
    fn test_distortion_jacobian_matches_finite_differences() {
        let params = CameraParameters::new(800.0, 800.0, 320.0, 240.0)
            .with_distortion(-0.2, 0.05, 0.003, -0.002);
        let point = Vector2::new(0.3, -0.4);
        let analytic = distortion_jacobian(&point, &params);
        let h = 1e-7;
        for c in 0..2 {
            let mut delta = Vector2::zeros();
            delta[c] = h;
            let numeric = (apply_distortion(&(point + delta), &params)
                - apply_distortion(&(point - delta), &params))
                / (2.0 * h);
            assert_relative_eq!(analytic[(0, c)], numeric.x, epsilon = 1e-6);
            assert_relative_eq!(analytic[(1, c)], numeric.y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_pixel_normalized_roundtrip() {
        let model = sample_model();
        let normalized = Vector2::new(0.25, -0.3);
        let pixel = normalized_to_pixel(
            &apply_distortion(&normalized, &model.parameters),
            &model.parameters,
        );
        let restored = pixel_to_normalized(&pixel, &model.parameters, &model.solver).unwrap();
        assert_relative_eq!(restored, normalized, epsilon = 1e-9);
    }

    #[test]
    fn test_project_unproject() {
        let model = sample_model();
        let point_3d = Vector3::new(0.5, -0.3, 2.0);
        let point_2d = model.project(&point_3d).unwrap();
        assert!(model.resolution.contains(&point_2d));

        let ray = model.unproject(&point_2d).unwrap();
        assert_relative_eq!(ray, point_3d.normalize(), epsilon = 1e-6);
    }

    #[test]
    fn test_project_rejects_points_outside_image() {
        let model = sample_model();
        assert_eq!(
            model.project(&Vector3::new(10.0, 0.0, 1.0)),
            Err(CameraModelError::ProjectionOutSideImage)
        );
        assert_eq!(
            model.unproject(&Vector2::new(-3.0, 10.0)),
            Err(CameraModelError::PointIsOutSideImage)
        );
    }

    #[test]
    fn test_save_and_load_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pinhole.yaml");
        let path = path.to_str().unwrap();

        let model = sample_model();
        model.save_to_yaml(path).unwrap();
        let loaded = PinholeModel::load_from_yaml(path).unwrap();

        assert_eq!(loaded.parameters, model.parameters);
        assert_eq!(loaded.resolution, model.resolution);
    }

    #[test]
    fn test_load_yaml_with_integer_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("int.yaml");
        fs::write(
            &path,
            "cam0:\n  camera_model: pinhole\n  intrinsics: [500, 500, 320, 240]\n  distortion_coeffs: [0, 0, 0, 0]\n  resolution: [640, 480]\n",
        )
        .unwrap();
        let loaded = PinholeModel::load_from_yaml(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.parameters.fx, 500.0);
        assert_eq!(loaded.resolution.height, 480);
    }

    #[test]
    fn test_load_yaml_rejects_missing_distortion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(
            &path,
            "cam0:\n  intrinsics: [500.0, 500.0, 320.0, 240.0]\n  resolution: [640, 480]\n",
        )
        .unwrap();
        let result = PinholeModel::load_from_yaml(path.to_str().unwrap());
        assert!(matches!(result, Err(CameraModelError::InvalidParams(_))));
    }
}
