//! Sample storage and correspondence I/O.
//!
//! [`SampleSet`] is an ordered collection of fixed-width `f64` rows. The
//! calibrator consumes correspondences as rows `[view, X, Y, Z, u, v]`, which
//! are grouped into per-view [`ViewCorrespondences`] before solving.

use crate::camera::CameraModelError;
use crate::triangulation::Observation;
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Width of a correspondence row `[view, X, Y, Z, u, v]`.
pub const CORRESPONDENCE_WIDTH: usize = 6;

/// Row-major matrix of samples, one sample per row.
#[derive(Debug, Clone, Default)]
pub struct SampleSet {
    data: Vec<f64>,
    sample_count: usize,
    feature_count: usize,
    capacity: usize,
}

impl SampleSet {
    pub fn new(feature_count: usize) -> Self {
        Self {
            feature_count,
            ..Self::default()
        }
    }

    pub fn with_capacity(sample_count: usize, feature_count: usize) -> Self {
        let mut set = Self::new(feature_count);
        set.reserve(sample_count, None);
        set
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn feature_count(&self) -> usize {
        self.feature_count
    }

    /// Number of samples that fit without reallocation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    pub fn sample_at(&self, index: usize) -> Option<&[f64]> {
        if index >= self.sample_count {
            return None;
        }
        let start = index * self.feature_count;
        Some(&self.data[start..start + self.feature_count])
    }

    pub fn sample_at_mut(&mut self, index: usize) -> Option<&mut [f64]> {
        if index >= self.sample_count {
            return None;
        }
        let start = index * self.feature_count;
        Some(&mut self.data[start..start + self.feature_count])
    }

    pub fn samples(&self) -> impl Iterator<Item = &[f64]> {
        // `chunks_exact(0)` panics, so zero-width sets yield empty rows.
        let width = self.feature_count.max(1);
        let rows = if self.feature_count == 0 {
            0
        } else {
            self.sample_count
        };
        self.data.chunks_exact(width).take(rows)
    }

    fn check_width(&self, sample: &[f64]) -> Result<(), CameraModelError> {
        if sample.len() != self.feature_count {
            return Err(CameraModelError::InvalidInput(format!(
                "sample has {} features, set expects {}",
                sample.len(),
                self.feature_count
            )));
        }
        Ok(())
    }

    pub fn set_sample_at(&mut self, index: usize, sample: &[f64]) -> Result<(), CameraModelError> {
        self.check_width(sample)?;
        let count = self.sample_count;
        let row = self.sample_at_mut(index).ok_or_else(|| {
            CameraModelError::InvalidInput(format!("sample index {index} out of range {count}"))
        })?;
        row.copy_from_slice(sample);
        Ok(())
    }

    /// Appends a sample, growing the storage by at most 64 rows at a time.
    pub fn append(&mut self, sample: &[f64]) -> Result<(), CameraModelError> {
        self.check_width(sample)?;
        if self.capacity == self.sample_count {
            let rows = self.sample_count;
            self.reserve((rows * 2).clamp(1, rows + 64), None);
        }
        self.data.extend_from_slice(sample);
        self.sample_count += 1;
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<(), CameraModelError> {
        if index >= self.sample_count {
            return Err(CameraModelError::InvalidInput(format!(
                "sample index {index} out of range {}",
                self.sample_count
            )));
        }
        let start = index * self.feature_count;
        self.data.drain(start..start + self.feature_count);
        self.sample_count -= 1;
        Ok(())
    }

    /// Resizes to `sample_count` rows, optionally changing the width. New
    /// cells are zero; when the width changes existing rows are re-laid out
    /// with truncation or zero padding.
    pub fn resize(&mut self, sample_count: usize, feature_count: Option<usize>) {
        let width = feature_count.unwrap_or(self.feature_count);
        if width != self.feature_count {
            let mut data = vec![0.0; sample_count * width];
            let keep = width.min(self.feature_count);
            for (row, sample) in self.samples().take(sample_count).enumerate() {
                data[row * width..row * width + keep].copy_from_slice(&sample[..keep]);
            }
            self.data = data;
            self.feature_count = width;
        } else {
            self.data.resize(sample_count * width, 0.0);
        }
        self.sample_count = sample_count;
        self.capacity = self.capacity.max(sample_count);
    }

    /// Reserves room for `sample_count` rows. Changing the width clears the set.
    pub fn reserve(&mut self, sample_count: usize, feature_count: Option<usize>) {
        if let Some(width) = feature_count {
            if width != self.feature_count {
                self.data.clear();
                self.sample_count = 0;
                self.feature_count = width;
            }
        }
        if sample_count > self.capacity {
            self.data
                .reserve_exact((sample_count * self.feature_count).saturating_sub(self.data.len()));
            self.capacity = sample_count;
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.sample_count = 0;
    }
}

impl PartialEq for SampleSet {
    fn eq(&self, other: &Self) -> bool {
        self.sample_count == other.sample_count
            && self.feature_count == other.feature_count
            && self.data == other.data
    }
}

/// One 3D-2D correspondence of a calibration rig.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointCorrespondence {
    pub world: Vector3<f64>,
    pub pixel: Vector2<f64>,
    pub view: usize,
}

impl PointCorrespondence {
    pub fn to_row(&self) -> [f64; CORRESPONDENCE_WIDTH] {
        [
            self.view as f64,
            self.world.x,
            self.world.y,
            self.world.z,
            self.pixel.x,
            self.pixel.y,
        ]
    }

    pub fn from_row(row: &[f64]) -> Result<Self, CameraModelError> {
        if row.len() != CORRESPONDENCE_WIDTH {
            return Err(CameraModelError::InvalidInput(format!(
                "correspondence rows have {CORRESPONDENCE_WIDTH} columns, got {}",
                row.len()
            )));
        }
        if row.iter().any(|v| !v.is_finite()) || row[0] < 0.0 || row[0].fract() != 0.0 {
            return Err(CameraModelError::InvalidInput(format!(
                "malformed correspondence row {row:?}"
            )));
        }
        Ok(Self {
            view: row[0] as usize,
            world: Vector3::new(row[1], row[2], row[3]),
            pixel: Vector2::new(row[4], row[5]),
        })
    }
}

/// Correspondences of a single view, in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewCorrespondences {
    pub world: Vec<Vector3<f64>>,
    pub pixels: Vec<Vector2<f64>>,
}

impl ViewCorrespondences {
    pub fn new(world: Vec<Vector3<f64>>, pixels: Vec<Vector2<f64>>) -> Result<Self, CameraModelError> {
        if world.len() != pixels.len() {
            return Err(CameraModelError::InvalidInput(format!(
                "{} world points but {} pixels",
                world.len(),
                pixels.len()
            )));
        }
        Ok(Self { world, pixels })
    }

    pub fn push(&mut self, world: Vector3<f64>, pixel: Vector2<f64>) {
        self.world.push(world);
        self.pixels.push(pixel);
    }

    pub fn len(&self) -> usize {
        self.world.len()
    }

    pub fn is_empty(&self) -> bool {
        self.world.is_empty()
    }
}

/// Groups correspondences by view index, views in ascending index order.
pub fn group_by_view(correspondences: &[PointCorrespondence]) -> Vec<ViewCorrespondences> {
    let mut views: BTreeMap<usize, ViewCorrespondences> = BTreeMap::new();
    for c in correspondences {
        views.entry(c.view).or_default().push(c.world, c.pixel);
    }
    views.into_values().collect()
}

/// Decodes every row of a 6-wide sample set into correspondences.
pub fn correspondences_from_samples(
    samples: &SampleSet,
) -> Result<Vec<PointCorrespondence>, CameraModelError> {
    if samples.feature_count() != CORRESPONDENCE_WIDTH {
        return Err(CameraModelError::InvalidInput(format!(
            "correspondence sets have {CORRESPONDENCE_WIDTH} features, got {}",
            samples.feature_count()
        )));
    }
    samples.samples().map(PointCorrespondence::from_row).collect()
}

pub fn correspondences_to_samples(
    correspondences: &[PointCorrespondence],
) -> Result<SampleSet, CameraModelError> {
    let mut samples = SampleSet::with_capacity(correspondences.len(), CORRESPONDENCE_WIDTH);
    for c in correspondences {
        samples.append(&c.to_row())?;
    }
    Ok(samples)
}

#[derive(Debug, Serialize, Deserialize)]
struct CorrespondenceRecord {
    view: usize,
    x3d: f64,
    y3d: f64,
    z3d: f64,
    x2d: f64,
    y2d: f64,
}

/// Loads correspondences from a CSV file with header
/// `view,x3d,y3d,z3d,x2d,y2d`. Lines starting with `#` are ignored.
pub fn load_correspondences_csv<P: AsRef<Path>>(path: P) -> Result<SampleSet, CameraModelError> {
    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut samples = SampleSet::new(CORRESPONDENCE_WIDTH);
    for record in reader.deserialize() {
        let r: CorrespondenceRecord = record?;
        samples.append(&[r.view as f64, r.x3d, r.y3d, r.z3d, r.x2d, r.y2d])?;
    }
    Ok(samples)
}

pub fn save_correspondences_csv<P: AsRef<Path>>(
    path: P,
    correspondences: &[PointCorrespondence],
) -> Result<(), CameraModelError> {
    let mut writer = csv::Writer::from_path(path)?;
    for c in correspondences {
        writer.serialize(CorrespondenceRecord {
            view: c.view,
            x3d: c.world.x,
            y3d: c.world.y,
            z3d: c.world.z,
            x2d: c.pixel.x,
            y2d: c.pixel.y,
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ObservationRecord {
    query: usize,
    camera: String,
    u: f64,
    v: f64,
}

/// Loads triangulation queries from a CSV file with header
/// `query,camera,u,v`. Queries are returned in ascending query order.
pub fn load_observations_csv<P: AsRef<Path>>(
    path: P,
) -> Result<Vec<Vec<Observation>>, CameraModelError> {
    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut queries: BTreeMap<usize, Vec<Observation>> = BTreeMap::new();
    for record in reader.deserialize() {
        let r: ObservationRecord = record?;
        queries
            .entry(r.query)
            .or_default()
            .push(Observation::new(r.camera, Vector2::new(r.u, r.v)));
    }
    Ok(queries.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_append_growth_policy() {
        let mut set = SampleSet::new(2);
        assert_eq!(set.capacity(), 0);
        set.append(&[1.0, 2.0]).unwrap();
        assert_eq!(set.capacity(), 1);
        set.append(&[3.0, 4.0]).unwrap();
        assert_eq!(set.capacity(), 2);
        set.append(&[5.0, 6.0]).unwrap();
        assert_eq!(set.capacity(), 4);

        let mut big = SampleSet::with_capacity(100, 1);
        for i in 0..101 {
            big.append(&[i as f64]).unwrap();
        }
        // 100 full rows grow by the 64-row cap, not by doubling.
        assert_eq!(big.capacity(), 164);
        assert_eq!(big.sample_at(100), Some(&[100.0][..]));
    }

    #[test]
    fn test_append_rejects_wrong_width() {
        let mut set = SampleSet::new(3);
        assert!(matches!(
            set.append(&[1.0, 2.0]),
            Err(CameraModelError::InvalidInput(_))
        ));
        assert!(set.is_empty());
    }

    #[test]
    fn test_remove_and_set() {
        let mut set = SampleSet::new(2);
        for i in 0..4 {
            set.append(&[i as f64, -(i as f64)]).unwrap();
        }
        set.remove(1).unwrap();
        assert_eq!(set.sample_count(), 3);
        assert_eq!(set.sample_at(1), Some(&[2.0, -2.0][..]));
        set.set_sample_at(0, &[9.0, 9.0]).unwrap();
        assert_eq!(set.sample_at(0), Some(&[9.0, 9.0][..]));
        assert!(set.remove(3).is_err());
        assert!(set.set_sample_at(5, &[0.0, 0.0]).is_err());
    }

    #[test]
    fn test_resize_and_reserve() {
        let mut set = SampleSet::new(2);
        set.append(&[1.0, 2.0]).unwrap();
        set.resize(3, None);
        assert_eq!(set.sample_at(2), Some(&[0.0, 0.0][..]));

        set.resize(2, Some(3));
        assert_eq!(set.feature_count(), 3);
        assert_eq!(set.sample_at(0), Some(&[1.0, 2.0, 0.0][..]));

        set.reserve(10, Some(3));
        assert_eq!(set.sample_count(), 2);
        set.reserve(10, Some(4));
        assert_eq!(set.sample_count(), 0);
        assert_eq!(set.feature_count(), 4);
        assert!(set.capacity() >= 10);
    }

    #[test]
    fn test_equality_ignores_capacity() {
        let mut a = SampleSet::with_capacity(50, 2);
        let mut b = SampleSet::new(2);
        a.append(&[1.0, 2.0]).unwrap();
        b.append(&[1.0, 2.0]).unwrap();
        assert_eq!(a, b);
        b.append(&[3.0, 4.0]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_group_by_view_orders_views() {
        let make = |view, x| PointCorrespondence {
            world: Vector3::new(x, 0.0, 0.0),
            pixel: Vector2::new(x, x),
            view,
        };
        let views = group_by_view(&[make(3, 1.0), make(0, 2.0), make(3, 3.0)]);
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].len(), 1);
        assert_eq!(views[1].world[1].x, 3.0);
    }

    #[test]
    fn test_correspondence_csv_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corr.csv");
        let correspondences = vec![
            PointCorrespondence {
                world: Vector3::new(1.0, 2.0, 0.0),
                pixel: Vector2::new(100.5, 200.25),
                view: 0,
            },
            PointCorrespondence {
                world: Vector3::new(-1.0, 0.5, 0.0),
                pixel: Vector2::new(10.0, 20.0),
                view: 1,
            },
        ];
        save_correspondences_csv(&path, &correspondences).unwrap();
        let samples = load_correspondences_csv(&path).unwrap();
        assert_eq!(samples, correspondences_to_samples(&correspondences).unwrap());
        assert_eq!(correspondences_from_samples(&samples).unwrap(), correspondences);
    }

    #[test]
    fn test_load_observations_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obs.csv");
        fs::write(
            &path,
            "query,camera,u,v\n# first point\n0,left,10.0,20.0\n0,right,11.0,21.0\n1,left,1.0,2.0\n",
        )
        .unwrap();
        let queries = load_observations_csv(&path).unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].len(), 2);
        assert_eq!(queries[0][1].camera_id, "right");
    }
}
