//! Multi-view triangulation with calibrated pinhole cameras.
//!
//! Every observation is turned into a world-frame ray. Each unordered pair
//! of rays contributes the midpoint of its closest approach; pairs whose rays
//! are too close to parallel are skipped. The fused point is the weighted
//! mean of the surviving midpoints, uniform weights by default.
//!
//! Cameras are shared read-only, so queries for distinct points can run in
//! parallel ([`StereoTriangulator::triangulate_many`]).

use crate::camera::pinhole::pixel_to_normalized;
use crate::camera::{CameraModelError, CameraParameters, DistortionSolver, RelativePosition};
use log::debug;
use nalgebra::{Vector2, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

pub mod stream;

pub use stream::ObservationStream;

/// A half-line in world coordinates with unit direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Vector3<f64>,
    pub direction: Vector3<f64>,
}

impl Ray {
    pub fn new(origin: Vector3<f64>, direction: Vector3<f64>) -> Self {
        Self {
            origin,
            direction: direction.normalize(),
        }
    }

    pub fn point_at(&self, t: f64) -> Vector3<f64> {
        self.origin + self.direction * t
    }

    /// Perpendicular distance from `point` to the supporting line.
    pub fn distance_to(&self, point: &Vector3<f64>) -> f64 {
        let w = point - self.origin;
        (w - self.direction * w.dot(&self.direction)).norm()
    }

    /// Angle between the two directions, in radians.
    pub fn angle_to(&self, other: &Ray) -> f64 {
        self.direction
            .dot(&other.direction)
            .clamp(-1.0, 1.0)
            .acos()
    }
}

/// Closest points between two lines, `None` when they are parallel.
///
/// Minimizes `|(o1 + s d1) - (o2 + t d2)|^2` over `s` and `t`.
pub fn closest_approach(a: &Ray, b: &Ray) -> Option<(Vector3<f64>, Vector3<f64>)> {
    let w0 = a.origin - b.origin;
    let aa = a.direction.dot(&a.direction);
    let ab = a.direction.dot(&b.direction);
    let bb = b.direction.dot(&b.direction);
    let d = a.direction.dot(&w0);
    let e = b.direction.dot(&w0);

    let denominator = aa * bb - ab * ab;
    if denominator <= 1e-12 * aa * bb {
        return None;
    }
    let s = (ab * e - bb * d) / denominator;
    let t = (aa * e - ab * d) / denominator;
    Some((a.point_at(s), b.point_at(t)))
}

/// Weight given to the midpoint of one ray pair.
pub trait PairWeighting: Send + Sync {
    fn weight(&self, a: &Ray, b: &Ray) -> f64;
}

/// Plain arithmetic mean over pairs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformWeighting;

impl PairWeighting for UniformWeighting {
    fn weight(&self, _a: &Ray, _b: &Ray) -> f64 {
        1.0
    }
}

/// Down-weights narrow-baseline pairs by the sine of their ray angle.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaselineWeighting;

impl PairWeighting for BaselineWeighting {
    fn weight(&self, a: &Ray, b: &Ray) -> f64 {
        a.direction.cross(&b.direction).norm()
    }
}

/// Calibrated intrinsics and pose of one camera. Intrinsics are shared with
/// every other camera built from the same calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibratedCamera {
    parameters: Arc<CameraParameters>,
    pose: RelativePosition,
}

impl CalibratedCamera {
    pub fn new(parameters: Arc<CameraParameters>, pose: RelativePosition) -> Self {
        Self { parameters, pose }
    }

    pub fn parameters(&self) -> &CameraParameters {
        &self.parameters
    }

    pub fn pose(&self) -> &RelativePosition {
        &self.pose
    }

    /// World-frame ray through an observed pixel.
    pub fn ray(&self, pixel: &Vector2<f64>, solver: &DistortionSolver) -> Result<Ray, CameraModelError> {
        let normalized = pixel_to_normalized(pixel, &self.parameters, solver)?;
        let direction = self
            .pose
            .direction_to_world(&Vector3::new(normalized.x, normalized.y, 1.0));
        Ok(Ray::new(self.pose.camera_center(), direction))
    }
}

/// One camera's pixel observation of the point being reconstructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub camera_id: String,
    pub pixel: Vector2<f64>,
}

impl Observation {
    pub fn new(camera_id: impl Into<String>, pixel: Vector2<f64>) -> Self {
        Self {
            camera_id: camera_id.into(),
            pixel,
        }
    }
}

/// A reconstructed world point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point3D {
    pub position: Vector3<f64>,
    /// Standard error of the fused point: RMS distance from the point to the
    /// participating rays over the square root of the surviving pair count.
    pub quality: f64,
    /// Largest distance of a pairwise midpoint from the fused point.
    pub max_deviation: f64,
    pub pairs_used: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulatorConfig {
    /// Pairs whose rays meet at a smaller angle (radians) are skipped.
    pub min_baseline_angle: f64,
    pub distortion_solver: DistortionSolver,
}

impl Default for TriangulatorConfig {
    fn default() -> Self {
        Self {
            min_baseline_angle: 1f64.to_radians(),
            distortion_solver: DistortionSolver::default(),
        }
    }
}

/// One entry of a serialized camera rig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigCamera {
    pub parameters: CameraParameters,
    pub pose: RelativePosition,
}

/// Camera rig keyed by camera id, stored as YAML or JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RigDescription {
    pub cameras: BTreeMap<String, RigCamera>,
}

impl RigDescription {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CameraModelError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&contents)?),
            _ => Ok(serde_yaml::from_str(&contents)?),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CameraModelError> {
        let path = path.as_ref();
        let contents = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            _ => serde_yaml::to_string(self)?,
        };
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Per-query record of a batch run: the point, or why the query failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub query: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point: Option<Point3D>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryOutcome {
    pub fn new(query: usize, result: &Result<Point3D, CameraModelError>) -> Self {
        match result {
            Ok(point) => Self {
                query,
                point: Some(*point),
                error: None,
            },
            Err(err) => Self {
                query,
                point: None,
                error: Some(err.to_string()),
            },
        }
    }

    /// Writes one outcome per query as a JSON array.
    pub fn save_all<P: AsRef<Path>>(outcomes: &[Self], path: P) -> Result<(), CameraModelError> {
        std::fs::write(path, serde_json::to_string_pretty(outcomes)?)?;
        Ok(())
    }
}

pub struct StereoTriangulator {
    cameras: HashMap<String, CalibratedCamera>,
    config: TriangulatorConfig,
    weighting: Box<dyn PairWeighting>,
}

impl StereoTriangulator {
    pub fn new(config: TriangulatorConfig) -> Self {
        Self {
            cameras: HashMap::new(),
            config,
            weighting: Box::new(UniformWeighting),
        }
    }

    /// Builds a triangulator from a rig. Cameras with identical intrinsics
    /// share one parameter allocation.
    pub fn from_rig(
        rig: &RigDescription,
        config: TriangulatorConfig,
    ) -> Result<Self, CameraModelError> {
        let mut triangulator = Self::new(config);
        let mut shared: Vec<Arc<CameraParameters>> = Vec::new();
        for (id, camera) in &rig.cameras {
            crate::camera::validation::validate_parameters(&camera.parameters)?;
            let parameters = match shared.iter().find(|p| ***p == camera.parameters) {
                Some(p) => Arc::clone(p),
                None => {
                    let p = Arc::new(camera.parameters);
                    shared.push(Arc::clone(&p));
                    p
                }
            };
            triangulator.add_camera(id.clone(), CalibratedCamera::new(parameters, camera.pose));
        }
        Ok(triangulator)
    }

    pub fn with_weighting<W: PairWeighting + 'static>(mut self, weighting: W) -> Self {
        self.weighting = Box::new(weighting);
        self
    }

    pub fn add_camera(&mut self, id: impl Into<String>, camera: CalibratedCamera) {
        self.cameras.insert(id.into(), camera);
    }

    pub fn camera(&self, id: &str) -> Option<&CalibratedCamera> {
        self.cameras.get(id)
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    pub fn config(&self) -> &TriangulatorConfig {
        &self.config
    }

    /// Reconstructs one point from simultaneous observations.
    ///
    /// Observations are processed in camera-id order, so the result does not
    /// depend on the input order.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::InsufficientViews`] for fewer than two
    ///   observations, or three or more with every pair rejected.
    /// * [`CameraModelError::InvalidInput`] for an unknown or repeated camera id.
    /// * [`CameraModelError::UndistortDivergence`] if a pixel cannot be undistorted.
    /// * [`CameraModelError::DegenerateGeometry`] if two observations form a
    ///   pair that is too close to parallel.
    pub fn triangulate(&self, observations: &[Observation]) -> Result<Point3D, CameraModelError> {
        if observations.len() < 2 {
            return Err(CameraModelError::InsufficientViews);
        }
        let mut ordered: Vec<&Observation> = observations.iter().collect();
        ordered.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        if let Some(pair) = ordered.windows(2).find(|w| w[0].camera_id == w[1].camera_id) {
            return Err(CameraModelError::InvalidInput(format!(
                "camera {} observed twice",
                pair[0].camera_id
            )));
        }

        let rays = ordered
            .iter()
            .map(|obs| {
                let camera = self.cameras.get(&obs.camera_id).ok_or_else(|| {
                    CameraModelError::InvalidInput(format!("unknown camera {}", obs.camera_id))
                })?;
                camera.ray(&obs.pixel, &self.config.distortion_solver)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut midpoints = Vec::new();
        let mut participating = vec![false; rays.len()];
        for i in 0..rays.len() {
            for j in i + 1..rays.len() {
                let angle = rays[i].angle_to(&rays[j]);
                if angle < self.config.min_baseline_angle {
                    debug!(
                        "Skipping pair ({}, {}): ray angle {:.3e} rad below baseline threshold",
                        ordered[i].camera_id, ordered[j].camera_id, angle
                    );
                    continue;
                }
                let Some((p, q)) = closest_approach(&rays[i], &rays[j]) else {
                    continue;
                };
                let weight = self.weighting.weight(&rays[i], &rays[j]);
                if !(weight.is_finite() && weight > 0.0) {
                    continue;
                }
                midpoints.push(((p + q) * 0.5, weight));
                participating[i] = true;
                participating[j] = true;
            }
        }
        if midpoints.is_empty() {
            // No usable pair left among three or more views.
            return Err(if rays.len() == 2 {
                CameraModelError::DegenerateGeometry
            } else {
                CameraModelError::InsufficientViews
            });
        }

        let total_weight: f64 = midpoints.iter().map(|(_, w)| w).sum();
        let position = midpoints
            .iter()
            .fold(Vector3::zeros(), |acc, (m, w)| acc + m * *w)
            / total_weight;

        let (sum_squared, ray_count) = rays
            .iter()
            .zip(&participating)
            .filter(|(_, used)| **used)
            .fold((0.0, 0usize), |(sum, n), (ray, _)| {
                (sum + ray.distance_to(&position).powi(2), n + 1)
            });
        let rms = (sum_squared / ray_count as f64).sqrt();
        let max_deviation = midpoints
            .iter()
            .map(|(m, _)| (m - position).norm())
            .fold(0.0, f64::max);

        Ok(Point3D {
            position,
            quality: rms / (midpoints.len() as f64).sqrt(),
            max_deviation,
            pairs_used: midpoints.len(),
        })
    }

    /// Triangulates independent points in parallel, one result per query.
    pub fn triangulate_many(
        &self,
        queries: &[Vec<Observation>],
    ) -> Vec<Result<Point3D, CameraModelError>> {
        queries
            .par_iter()
            .map(|observations| self.triangulate(observations))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::pinhole::project_world_point;
    use approx::assert_relative_eq;

    fn camera_at(center: Vector3<f64>, rotation: Vector3<f64>) -> CalibratedCamera {
        let params = Arc::new(CameraParameters::new(800.0, 800.0, 319.5, 239.5));
        let pose = RelativePosition::new(rotation, Vector3::zeros());
        let translation = -(pose.rotation_matrix() * center);
        CalibratedCamera::new(params, RelativePosition::new(rotation, translation))
    }

    fn observe(id: &str, camera: &CalibratedCamera, point: &Vector3<f64>) -> Observation {
        let pixel = project_world_point(point, camera.parameters(), camera.pose()).unwrap();
        Observation::new(id, pixel)
    }

    #[test]
    fn test_closest_approach_of_skew_lines() {
        let a = Ray::new(Vector3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0));
        let b = Ray::new(Vector3::new(0.0, 1.0, 2.0), Vector3::new(0.0, 0.0, 1.0));
        let (p, q) = closest_approach(&a, &b).unwrap();
        assert_relative_eq!(p, Vector3::new(0.0, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(q, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
        assert!(closest_approach(&a, &a).is_none());
    }

    #[test]
    fn test_camera_ray_passes_through_point() {
        let camera = camera_at(Vector3::new(0.3, -0.2, 0.1), Vector3::new(0.05, -0.1, 0.02));
        let point = Vector3::new(1.0, 0.5, 4.0);
        let obs = observe("cam", &camera, &point);
        let ray = camera.ray(&obs.pixel, &DistortionSolver::default()).unwrap();
        assert_relative_eq!(ray.origin, Vector3::new(0.3, -0.2, 0.1), epsilon = 1e-12);
        assert!(ray.distance_to(&point) < 1e-9);
    }

    #[test]
    fn test_result_does_not_depend_on_observation_order() {
        let mut triangulator = StereoTriangulator::new(TriangulatorConfig::default());
        let left = camera_at(Vector3::zeros(), Vector3::zeros());
        let right = camera_at(Vector3::new(1.0, 0.0, 0.0), Vector3::new(0.0, -0.1, 0.0));
        let point = Vector3::new(0.4, 0.2, 5.0);
        let mut observations = vec![observe("left", &left, &point), observe("right", &right, &point)];
        observations[0].pixel.x += 0.7;
        triangulator.add_camera("left", left);
        triangulator.add_camera("right", right);

        let forward = triangulator.triangulate(&observations).unwrap();
        observations.reverse();
        let backward = triangulator.triangulate(&observations).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_rejects_unknown_and_duplicate_cameras() {
        let mut triangulator = StereoTriangulator::new(TriangulatorConfig::default());
        triangulator.add_camera("left", camera_at(Vector3::zeros(), Vector3::zeros()));
        let pixel = Vector2::new(300.0, 200.0);

        let unknown = [Observation::new("left", pixel), Observation::new("right", pixel)];
        assert!(matches!(
            triangulator.triangulate(&unknown),
            Err(CameraModelError::InvalidInput(_))
        ));
        let duplicate = [Observation::new("left", pixel), Observation::new("left", pixel)];
        assert!(matches!(
            triangulator.triangulate(&duplicate),
            Err(CameraModelError::InvalidInput(_))
        ));
        assert_eq!(
            triangulator.triangulate(&unknown[..1]),
            Err(CameraModelError::InsufficientViews)
        );
    }

    #[test]
    fn test_baseline_weighting_matches_uniform_for_exact_rays() {
        let cameras = [
            ("a", camera_at(Vector3::zeros(), Vector3::zeros())),
            ("b", camera_at(Vector3::new(1.0, 0.0, 0.0), Vector3::zeros())),
            ("c", camera_at(Vector3::new(0.0, 2.0, 0.0), Vector3::zeros())),
        ];
        let point = Vector3::new(0.2, 0.4, 6.0);
        let observations: Vec<_> = cameras.iter().map(|(id, c)| observe(id, c, &point)).collect();

        let mut weighted =
            StereoTriangulator::new(TriangulatorConfig::default()).with_weighting(BaselineWeighting);
        for (id, camera) in cameras {
            weighted.add_camera(id, camera);
        }
        let result = weighted.triangulate(&observations).unwrap();
        assert_relative_eq!(result.position, point, epsilon = 1e-8);
        assert_eq!(result.pairs_used, 3);
    }

    #[test]
    fn test_rig_description_shares_parameters() {
        let params = CameraParameters::new(700.0, 700.0, 320.0, 240.0);
        let mut rig = RigDescription::default();
        for (id, x) in [("left", 0.0), ("right", 1.0)] {
            rig.cameras.insert(
                id.to_string(),
                RigCamera {
                    parameters: params,
                    pose: RelativePosition::new(Vector3::zeros(), Vector3::new(-x, 0.0, 0.0)),
                },
            );
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.yaml");
        rig.save(&path).unwrap();
        let loaded = RigDescription::load(&path).unwrap();
        assert_eq!(loaded, rig);

        let triangulator = StereoTriangulator::from_rig(&loaded, TriangulatorConfig::default()).unwrap();
        assert_eq!(triangulator.camera_count(), 2);
        let left = triangulator.camera("left").unwrap();
        let right = triangulator.camera("right").unwrap();
        assert!(Arc::ptr_eq(&left.parameters, &right.parameters));
    }

    #[test]
    fn test_query_outcomes_record_points_and_failures() {
        let mut triangulator = StereoTriangulator::new(TriangulatorConfig::default());
        let left = camera_at(Vector3::zeros(), Vector3::zeros());
        let right = camera_at(Vector3::new(1.0, 0.0, 0.0), Vector3::new(0.0, -0.1, 0.0));
        let point = Vector3::new(0.4, 0.2, 5.0);
        let queries = vec![
            vec![observe("left", &left, &point), observe("right", &right, &point)],
            vec![observe("left", &left, &point)],
        ];
        triangulator.add_camera("left", left);
        triangulator.add_camera("right", right);

        let outcomes: Vec<_> = triangulator
            .triangulate_many(&queries)
            .iter()
            .enumerate()
            .map(|(i, result)| QueryOutcome::new(i, result))
            .collect();
        assert_eq!(outcomes[0].query, 0);
        assert!(outcomes[0].error.is_none());
        assert_relative_eq!(outcomes[0].point.unwrap().position, point, epsilon = 1e-8);
        assert_eq!(outcomes[1].query, 1);
        assert!(outcomes[1].point.is_none());
        assert_eq!(
            outcomes[1].error.as_deref(),
            Some(CameraModelError::InsufficientViews.to_string().as_str())
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.json");
        QueryOutcome::save_all(&outcomes, &path).unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(written[0].get("point").is_some());
        assert!(written[0].get("error").is_none());
        assert!(written[1].get("point").is_none());
        assert!(written[1].get("error").is_some());
        let loaded: Vec<QueryOutcome> = serde_json::from_value(written).unwrap();
        assert_relative_eq!(
            loaded[0].point.unwrap().position,
            outcomes[0].point.unwrap().position,
            epsilon = 1e-12
        );
        assert_eq!(loaded[1], outcomes[1]);
    }
}
