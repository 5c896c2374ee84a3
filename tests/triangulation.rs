use approx::assert_relative_eq;
use nalgebra::{Vector2, Vector3};
use pinhole_tools::camera::pinhole::project_world_point;
use pinhole_tools::camera::{CameraModelError, CameraParameters, RelativePosition};
use pinhole_tools::triangulation::{
    CalibratedCamera, Observation, ObservationStream, StereoTriangulator, TriangulatorConfig,
};
use std::sync::Arc;
use std::thread;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Cameras looking down +z from the given centers, sharing one intrinsic set.
fn triangulator_with(centers: &[(&str, Vector3<f64>)]) -> StereoTriangulator {
    let params = Arc::new(CameraParameters::new(800.0, 800.0, 319.5, 239.5));
    let mut triangulator = StereoTriangulator::new(TriangulatorConfig::default());
    for (id, center) in centers {
        let pose = RelativePosition::new(Vector3::zeros(), -center);
        triangulator.add_camera(*id, CalibratedCamera::new(Arc::clone(&params), pose));
    }
    triangulator
}

fn observe(
    triangulator: &StereoTriangulator,
    id: &str,
    point: &Vector3<f64>,
    noise: (f64, f64),
) -> Observation {
    let camera = triangulator.camera(id).unwrap();
    let pixel = project_world_point(point, camera.parameters(), camera.pose()).unwrap();
    Observation::new(id, pixel + Vector2::new(noise.0, noise.1))
}

#[test]
fn test_two_views_recover_exact_point() {
    init_logger();
    let triangulator = triangulator_with(&[
        ("left", Vector3::zeros()),
        ("right", Vector3::new(1.0, 0.0, 0.0)),
    ]);
    let point = Vector3::new(1.0, 2.0, 5.0);
    let observations = [
        observe(&triangulator, "left", &point, (0.0, 0.0)),
        observe(&triangulator, "right", &point, (0.0, 0.0)),
    ];

    let result = triangulator.triangulate(&observations).unwrap();
    assert_relative_eq!(result.position, point, epsilon = 1e-4);
    assert_eq!(result.pairs_used, 1);
    assert!(result.quality < 1e-9);
    assert!(result.max_deviation < 1e-9);
}

#[test]
fn test_third_view_improves_noisy_estimate() {
    init_logger();
    let triangulator = triangulator_with(&[
        ("a", Vector3::zeros()),
        ("b", Vector3::new(1.0, 0.0, 0.0)),
        ("c", Vector3::new(-0.6, 0.9, 0.0)),
    ]);
    let point = Vector3::new(0.5, -0.3, 6.0);
    let a = observe(&triangulator, "a", &point, (0.8, 0.3));
    let b = observe(&triangulator, "b", &point, (-0.5, -0.6));
    let c = observe(&triangulator, "c", &point, (0.5, -0.4));

    let pair = triangulator.triangulate(&[a.clone(), b.clone()]).unwrap();
    let triple = triangulator.triangulate(&[a, b, c]).unwrap();

    assert_eq!(pair.pairs_used, 1);
    assert_eq!(triple.pairs_used, 3);
    assert_relative_eq!(pair.quality, 0.003338135, epsilon = 1e-7);
    assert_relative_eq!(triple.quality, 0.002284842, epsilon = 1e-7);
    assert!(triple.quality < pair.quality);
    assert!((triple.position - point).norm() < (pair.position - point).norm());
}

#[test]
fn test_parallel_rays_are_degenerate() {
    init_logger();
    let triangulator = triangulator_with(&[
        ("left", Vector3::zeros()),
        ("right", Vector3::new(0.001, 0.0, 0.0)),
    ]);
    // Both cameras look straight ahead at a point far away.
    let observations = [
        Observation::new("left", Vector2::new(319.5, 239.5)),
        Observation::new("right", Vector2::new(319.5, 239.5)),
    ];
    assert_eq!(
        triangulator.triangulate(&observations),
        Err(CameraModelError::DegenerateGeometry)
    );
}

#[test]
fn test_three_views_without_usable_pair_are_insufficient() {
    init_logger();
    let triangulator = triangulator_with(&[
        ("a", Vector3::zeros()),
        ("b", Vector3::new(0.001, 0.0, 0.0)),
        ("c", Vector3::new(0.0, 0.001, 0.0)),
    ]);
    let observations: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|id| Observation::new(*id, Vector2::new(319.5, 239.5)))
        .collect();
    assert_eq!(
        triangulator.triangulate(&observations),
        Err(CameraModelError::InsufficientViews)
    );
    assert_eq!(
        triangulator.triangulate(&observations[..2]),
        Err(CameraModelError::DegenerateGeometry)
    );
}

#[test]
fn test_narrow_pair_is_skipped_but_others_survive() {
    init_logger();
    let triangulator = triangulator_with(&[
        ("a", Vector3::zeros()),
        ("b", Vector3::new(0.01, 0.0, 0.0)),
        ("c", Vector3::new(1.0, 0.0, 0.0)),
    ]);
    let point = Vector3::new(0.2, 0.1, 4.0);
    let observations: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|id| observe(&triangulator, id, &point, (0.0, 0.0)))
        .collect();

    let result = triangulator.triangulate(&observations).unwrap();
    assert_eq!(result.pairs_used, 2);
    assert_relative_eq!(result.position, point, epsilon = 1e-6);
}

#[test]
fn test_single_observation_is_insufficient() {
    init_logger();
    let triangulator = triangulator_with(&[("a", Vector3::zeros())]);
    let observations = [Observation::new("a", Vector2::new(100.0, 100.0))];
    assert_eq!(
        triangulator.triangulate(&observations),
        Err(CameraModelError::InsufficientViews)
    );
    assert_eq!(
        triangulator.triangulate(&[]),
        Err(CameraModelError::InsufficientViews)
    );
}

#[test]
fn test_parallel_batch_matches_sequential() {
    init_logger();
    let triangulator = triangulator_with(&[
        ("a", Vector3::zeros()),
        ("b", Vector3::new(1.0, 0.0, 0.0)),
        ("c", Vector3::new(0.0, 1.0, 0.0)),
    ]);
    let queries: Vec<Vec<Observation>> = (0..50)
        .map(|i| {
            let point = Vector3::new(0.05 * i as f64 - 1.0, 0.3, 3.0 + 0.1 * i as f64);
            ["a", "b", "c"]
                .iter()
                .map(|id| observe(&triangulator, id, &point, (0.3, -0.2)))
                .collect()
        })
        .collect();

    let batch = triangulator.triangulate_many(&queries);
    assert_eq!(batch.len(), queries.len());
    for (query, result) in queries.iter().zip(&batch) {
        assert_eq!(result, &triangulator.triangulate(query));
    }
}

#[test]
fn test_stream_feeds_worker_threads() {
    init_logger();
    let triangulator = Arc::new(triangulator_with(&[
        ("a", Vector3::zeros()),
        ("b", Vector3::new(1.0, 0.0, 0.0)),
    ]));
    let stream = Arc::new(ObservationStream::new());

    let workers: Vec<_> = (0..3)
        .map(|_| {
            let triangulator = Arc::clone(&triangulator);
            let stream = Arc::clone(&stream);
            thread::spawn(move || triangulator.triangulate_stream(&stream))
        })
        .collect();

    for i in 0..30 {
        let point = Vector3::new(0.1 * i as f64, -0.5, 5.0);
        stream.push(vec![
            observe(&triangulator, "a", &point, (0.0, 0.0)),
            observe(&triangulator, "b", &point, (0.0, 0.0)),
        ]);
    }
    stream.close();

    let results: Vec<_> = workers
        .into_iter()
        .flat_map(|w| w.join().unwrap())
        .collect();
    assert_eq!(results.len(), 30);
    assert!(results.iter().all(|r| r.is_ok()));
}
