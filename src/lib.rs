//! Pinhole Tools Library
//!
//! Calibration and multi-view reconstruction for pinhole cameras with
//! radial-tangential distortion. The library provides:
//! - The pinhole projection pipeline and its iterative distortion inverse
//! - Closed-form initialization (homographies, vanishing-point focal lengths,
//!   DLT poses)
//! - A Levenberg-Marquardt calibrator refining shared intrinsics and per-view
//!   poses, with parallel per-view linearization
//! - Multi-view triangulation with a ray-distance quality measure
//! - A row-major sample store for correspondences and a wait condition that
//!   never loses a wake signal

pub mod camera;
pub mod data;
pub mod geometry;
pub mod optimization;
pub mod sync;
pub mod triangulation;
pub mod util;

// Re-export commonly used types
pub use camera::{
    CameraModel, CameraModelError, CameraParameters, DistortionSolver, PinholeModel,
    RelativePosition, Resolution,
};

pub use data::{PointCorrespondence, SampleSet, ViewCorrespondences};

pub use optimization::{
    CalibrationConfig, CalibrationReport, CalibrationSession, CalibrationState, Calibrator,
    InitialGuess, RigGeometry,
};

pub use sync::{QueueMode, WaitCondition};

pub use triangulation::{
    CalibratedCamera, Observation, ObservationStream, Point3D, QueryOutcome, StereoTriangulator,
    TriangulatorConfig,
};
