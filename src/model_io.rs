//! Flat binary tracker files.
//!
//! The on-disk layout is a 4-byte schema identifier and a little-endian
//! format version, followed by a bincode-framed payload of the wire tables
//! below. Matrices travel as (rows, cols, row-major data). Readers verify
//! the header and every dimension invariant before a runtime [`Tracker`]
//! is constructed; any violation surfaces as a recoverable
//! [`Error::FormatInvalid`].

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::regressor::Regressor;
use crate::shape::{Shape, ShapeResidual};
use crate::tracker::Tracker;
use crate::tree::{Split, Tree, TreeNode};

const MAGIC: [u8; 4] = *b"STRK";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 8;

/// Trained trackers run to hundreds of megabytes; anything beyond this is
/// rejected before parsing.
const MAX_FILE_BYTES: u64 = 8 << 30;

#[derive(Serialize, Deserialize)]
struct MatrixF {
    rows: u32,
    cols: u32,
    data: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct MatrixI {
    rows: u32,
    cols: u32,
    data: Vec<i32>,
}

#[derive(Serialize, Deserialize)]
struct TreeNodeRecord {
    idx1: i32,
    idx2: i32,
    threshold: f32,
    mean: MatrixF,
}

#[derive(Serialize, Deserialize)]
struct TreeRecord {
    nodes: Vec<TreeNodeRecord>,
    depth: u32,
}

#[derive(Serialize, Deserialize)]
struct RegressorRecord {
    closest_landmarks: MatrixI,
    pixel_coordinates: MatrixF,
    mean_shape_residual: MatrixF,
    mean_shape: MatrixF,
    forest: Vec<TreeRecord>,
    learning_rate: f32,
}

#[derive(Serialize, Deserialize)]
struct TrackerRecord {
    mean_shape: MatrixF,
    mean_shape_rect_corners: MatrixF,
    cascade: Vec<RegressorRecord>,
}

fn matrix_f(m: &Shape) -> MatrixF {
    let mut data = Vec::with_capacity(m.nrows() * m.ncols());
    for r in 0..m.nrows() {
        for c in 0..m.ncols() {
            data.push(m[(r, c)]);
        }
    }
    MatrixF {
        rows: m.nrows() as u32,
        cols: m.ncols() as u32,
        data,
    }
}

fn to_shape(m: &MatrixF, what: &str) -> Result<Shape> {
    if m.rows != 3 {
        return Err(Error::FormatInvalid(format!(
            "{what}: expected 3 rows, found {}",
            m.rows
        )));
    }
    let cols = m.cols as usize;
    if m.data.len() != 3 * cols {
        return Err(Error::FormatInvalid(format!(
            "{what}: {}x{} header disagrees with {} values",
            m.rows,
            m.cols,
            m.data.len()
        )));
    }
    let mut out = Shape::zeros(cols);
    for r in 0..3 {
        for c in 0..cols {
            out[(r, c)] = m.data[r * cols + c];
        }
    }
    Ok(out)
}

fn tree_record(tree: &Tree) -> TreeRecord {
    TreeRecord {
        nodes: tree
            .nodes
            .iter()
            .map(|n| TreeNodeRecord {
                idx1: n.split.idx1,
                idx2: n.split.idx2,
                threshold: n.split.threshold,
                mean: matrix_f(&n.mean),
            })
            .collect(),
        depth: tree.depth as u32,
    }
}

fn regressor_record(r: &Regressor) -> RegressorRecord {
    RegressorRecord {
        closest_landmarks: MatrixI {
            rows: 1,
            cols: r.closest_shape_landmark.len() as u32,
            data: r
                .closest_shape_landmark
                .iter()
                .map(|&i| i as i32)
                .collect(),
        },
        pixel_coordinates: matrix_f(&r.shape_relative_pixel_coordinates),
        mean_shape_residual: matrix_f(&r.mean_residual),
        mean_shape: matrix_f(&r.mean_shape),
        forest: r.trees.iter().map(tree_record).collect(),
        learning_rate: r.learning_rate,
    }
}

fn verify_tree(record: &TreeRecord, num_coords: usize, num_landmarks: usize) -> Result<Tree> {
    let depth = record.depth as usize;
    if depth < 1 {
        return Err(Error::FormatInvalid("tree depth must be at least 1".into()));
    }
    if depth > 31 {
        return Err(Error::FormatInvalid(format!(
            "implausible tree depth {depth}"
        )));
    }
    let expected_nodes = (1usize << depth) - 1;
    if record.nodes.len() != expected_nodes {
        return Err(Error::FormatInvalid(format!(
            "tree of depth {depth} must hold {expected_nodes} nodes, found {}",
            record.nodes.len()
        )));
    }

    let mut nodes = Vec::with_capacity(record.nodes.len());
    for n in &record.nodes {
        if n.idx1 >= 0 {
            if n.idx1 as usize >= num_coords || n.idx2 < 0 || n.idx2 as usize >= num_coords {
                return Err(Error::FormatInvalid(format!(
                    "split indices ({}, {}) exceed {num_coords} coordinates",
                    n.idx1, n.idx2
                )));
            }
        }
        let mean = to_shape(&n.mean, "tree node mean")?;
        // Unreached slots keep an empty mean; populated leaves carry one
        // residual column per landmark.
        if mean.ncols() != 0 && mean.ncols() != num_landmarks {
            return Err(Error::FormatInvalid(format!(
                "tree node mean has {} columns, tracker has {num_landmarks} landmarks",
                mean.ncols()
            )));
        }
        nodes.push(TreeNode {
            split: Split {
                idx1: n.idx1,
                idx2: n.idx2,
                threshold: n.threshold,
            },
            mean,
        });
    }

    Ok(Tree { nodes, depth })
}

fn verify_regressor(record: &RegressorRecord, num_landmarks: usize) -> Result<Regressor> {
    let pixel_coordinates = to_shape(&record.pixel_coordinates, "pixel coordinates")?;
    let num_coords = pixel_coordinates.ncols();

    let closest = &record.closest_landmarks;
    if closest.data.len() != closest.rows as usize * closest.cols as usize {
        return Err(Error::FormatInvalid(
            "closest landmark table disagrees with its header".into(),
        ));
    }
    if closest.data.len() != num_coords {
        return Err(Error::FormatInvalid(format!(
            "{} closest-landmark entries for {num_coords} pixel coordinates",
            closest.data.len()
        )));
    }
    let mut closest_shape_landmark = Vec::with_capacity(num_coords);
    for &idx in &closest.data {
        if idx < 0 || idx as usize >= num_landmarks {
            return Err(Error::FormatInvalid(format!(
                "closest landmark {idx} exceeds {num_landmarks} landmarks"
            )));
        }
        closest_shape_landmark.push(idx as usize);
    }

    let mean_residual: ShapeResidual = to_shape(&record.mean_shape_residual, "mean residual")?;
    if mean_residual.ncols() != num_landmarks {
        return Err(Error::FormatInvalid(format!(
            "stage mean residual has {} columns, tracker has {num_landmarks} landmarks",
            mean_residual.ncols()
        )));
    }
    let mean_shape = to_shape(&record.mean_shape, "stage mean shape")?;
    if mean_shape.ncols() != num_landmarks {
        return Err(Error::FormatInvalid(format!(
            "stage mean shape has {} columns, tracker has {num_landmarks} landmarks",
            mean_shape.ncols()
        )));
    }
    if !record.learning_rate.is_finite() {
        return Err(Error::FormatInvalid("learning rate is not finite".into()));
    }

    let trees = record
        .forest
        .iter()
        .map(|t| verify_tree(t, num_coords, num_landmarks))
        .collect::<Result<Vec<_>>>()?;

    Ok(Regressor {
        shape_relative_pixel_coordinates: pixel_coordinates,
        closest_shape_landmark,
        mean_residual,
        mean_shape,
        trees,
        learning_rate: record.learning_rate,
    })
}

fn verify_tracker(record: &TrackerRecord) -> Result<Tracker> {
    let mean_shape = to_shape(&record.mean_shape, "tracker mean shape")?;
    let num_landmarks = mean_shape.ncols();
    if num_landmarks == 0 {
        return Err(Error::FormatInvalid("tracker mean shape is empty".into()));
    }

    let mean_shape_rect_corners = to_shape(&record.mean_shape_rect_corners, "rect corners")?;
    if mean_shape_rect_corners.ncols() != 4 {
        return Err(Error::FormatInvalid(format!(
            "rect corners must have 4 columns, found {}",
            mean_shape_rect_corners.ncols()
        )));
    }

    let cascade = record
        .cascade
        .iter()
        .map(|r| verify_regressor(r, num_landmarks))
        .collect::<Result<Vec<_>>>()?;

    Ok(Tracker {
        mean_shape,
        mean_shape_rect_corners,
        cascade,
    })
}

/// Encode a tracker into the self-describing byte layout.
pub fn tracker_to_bytes(tracker: &Tracker) -> Result<Vec<u8>> {
    let record = TrackerRecord {
        mean_shape: matrix_f(&tracker.mean_shape),
        mean_shape_rect_corners: matrix_f(&tracker.mean_shape_rect_corners),
        cascade: tracker.cascade.iter().map(regressor_record).collect(),
    };

    let payload =
        bincode::serialize(&record).map_err(|e| Error::FormatInvalid(e.to_string()))?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&MAGIC);
    bytes.extend_from_slice(&VERSION.to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Verify and decode a tracker from bytes produced by [`tracker_to_bytes`].
pub fn tracker_from_bytes(bytes: &[u8]) -> Result<Tracker> {
    if bytes.len() as u64 > MAX_FILE_BYTES {
        return Err(Error::FormatInvalid(format!(
            "tracker data of {} bytes exceeds the size bound",
            bytes.len()
        )));
    }
    if bytes.len() < HEADER_LEN {
        return Err(Error::FormatInvalid("tracker data is truncated".into()));
    }
    if bytes[..4] != MAGIC {
        return Err(Error::FormatInvalid("not a tracker file".into()));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != VERSION {
        return Err(Error::FormatInvalid(format!(
            "unsupported tracker format version {version}"
        )));
    }

    let record: TrackerRecord = bincode::deserialize(&bytes[HEADER_LEN..])
        .map_err(|e| Error::FormatInvalid(e.to_string()))?;
    verify_tracker(&record)
}

pub fn write_tracker(tracker: &Tracker, path: &Path) -> Result<()> {
    let bytes = tracker_to_bytes(tracker)?;
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

pub fn read_tracker(path: &Path) -> Result<Tracker> {
    let meta = std::fs::metadata(path)?;
    if meta.len() > MAX_FILE_BYTES {
        return Err(Error::FormatInvalid(format!(
            "tracker file of {} bytes exceeds the size bound",
            meta.len()
        )));
    }
    let bytes = std::fs::read(path)?;
    tracker_from_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::PixelCoordinates;

    fn tiny_tracker() -> Tracker {
        let mean_shape = Shape::from_column_slice(&[
            -0.2, -0.2, 0.0, //
            0.2, -0.2, 0.0, //
            0.0, 0.25, 0.0, //
        ]);

        let leaf = TreeNode {
            split: Split {
                idx1: -1,
                idx2: -1,
                threshold: 0.0,
            },
            mean: ShapeResidual::from_element(3, 0.01),
        };
        let split_node = TreeNode {
            split: Split {
                idx1: 0,
                idx2: 1,
                threshold: 0.25,
            },
            mean: ShapeResidual::zeros(0),
        };
        let tree = Tree {
            nodes: vec![split_node, leaf.clone(), leaf],
            depth: 2,
        };

        let regressor = Regressor {
            shape_relative_pixel_coordinates: PixelCoordinates::from_column_slice(&[
                0.05, 0.0, 0.0, -0.03, 0.04, 0.0,
            ]),
            closest_shape_landmark: vec![1, 2],
            mean_residual: ShapeResidual::from_element(3, 0.02),
            mean_shape: mean_shape.clone(),
            trees: vec![tree],
            learning_rate: 0.08,
        };

        Tracker::new(mean_shape, vec![regressor])
    }

    #[test]
    fn round_trip_preserves_predictions_exactly() {
        let tracker = tiny_tracker();
        let bytes = tracker_to_bytes(&tracker).unwrap();
        let reloaded = tracker_from_bytes(&bytes).unwrap();

        let image = crate::image::Image::from_fn(48, 48, |x, y| {
            ((x * 31 + y * 17) % 256) as f32 / 255.0
        });
        let transform = crate::shape::ShapeTransform::new(
            nalgebra::Matrix3::identity() * 30.0,
            nalgebra::Vector3::new(24.0, 24.0, 0.0),
        );

        let a = tracker.predict(&image, &transform, None);
        let b = reloaded.predict(&image, &transform, None);
        assert_eq!(a, b);
    }

    #[test]
    fn round_trip_preserves_stored_matrices() {
        let tracker = tiny_tracker();
        let bytes = tracker_to_bytes(&tracker).unwrap();
        let reloaded = tracker_from_bytes(&bytes).unwrap();

        assert_eq!(reloaded.mean_shape, tracker.mean_shape);
        assert_eq!(
            reloaded.mean_shape_rect_corners,
            tracker.mean_shape_rect_corners
        );
        assert_eq!(reloaded.cascade.len(), 1);
        assert_eq!(
            reloaded.cascade[0].closest_shape_landmark,
            tracker.cascade[0].closest_shape_landmark
        );
        assert_eq!(
            reloaded.cascade[0].learning_rate,
            tracker.cascade[0].learning_rate
        );
    }

    #[test]
    fn rejects_bad_magic() {
        let tracker = tiny_tracker();
        let mut bytes = tracker_to_bytes(&tracker).unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            tracker_from_bytes(&bytes),
            Err(Error::FormatInvalid(_))
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        let tracker = tiny_tracker();
        let mut bytes = tracker_to_bytes(&tracker).unwrap();
        bytes[4] = 99;
        assert!(matches!(
            tracker_from_bytes(&bytes),
            Err(Error::FormatInvalid(_))
        ));
    }

    #[test]
    fn rejects_truncated_data() {
        let tracker = tiny_tracker();
        let bytes = tracker_to_bytes(&tracker).unwrap();
        assert!(matches!(
            tracker_from_bytes(&bytes[..bytes.len() / 2]),
            Err(Error::FormatInvalid(_))
        ));
        assert!(matches!(
            tracker_from_bytes(&bytes[..4]),
            Err(Error::FormatInvalid(_))
        ));
    }

    #[test]
    fn rejects_inconsistent_dimensions() {
        let mut tracker = tiny_tracker();
        // Break the P invariant: one more landmark index than coordinates.
        tracker.cascade[0].closest_shape_landmark.push(0);
        let bytes = tracker_to_bytes(&tracker).unwrap();
        assert!(matches!(
            tracker_from_bytes(&bytes),
            Err(Error::FormatInvalid(_))
        ));
    }
}
