//! Shape algebra: similarity transform estimation, closest-landmark lookup,
//! mean-shape-relative coordinate encoding, and rectangle helpers.

use nalgebra::{DVector, Matrix2x4, Matrix3, Matrix3xX, Vector2, Vector3};

/// L landmarks as column vectors (x, y, z).
pub type Shape = Matrix3xX<f32>;

/// Target shape minus current estimate. Same layout as [`Shape`].
pub type ShapeResidual = Matrix3xX<f32>;

/// Sample locations as column vectors, expressed in some frame
/// (image, canonical, or relative to a nearest landmark).
pub type PixelCoordinates = Matrix3xX<f32>;

/// Intensities sampled from an image at [`PixelCoordinates`].
pub type PixelIntensities = DVector<f32>;

/// Axis-aligned rectangle corners in the order top-left, top-right,
/// bottom-left, bottom-right.
pub type Rect = Matrix2x4<f32>;

/// A 3x4 affine transform (3x3 linear part plus translation), applied to
/// shapes via homogeneous extension of their columns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeTransform {
    linear: Matrix3<f32>,
    translation: Vector3<f32>,
}

impl ShapeTransform {
    pub fn new(linear: Matrix3<f32>, translation: Vector3<f32>) -> Self {
        Self {
            linear,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self {
            linear: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn linear(&self) -> &Matrix3<f32> {
        &self.linear
    }

    pub fn translation(&self) -> &Vector3<f32> {
        &self.translation
    }

    /// Apply the transform to every column of `shape`.
    pub fn apply(&self, shape: &Shape) -> Shape {
        let mut out = self.linear * shape;
        for mut col in out.column_iter_mut() {
            col += self.translation;
        }
        out
    }

    pub fn apply_point(&self, p: &Vector3<f32>) -> Vector3<f32> {
        self.linear * p + self.translation
    }

    /// Inverse transform, or `None` when the linear part is singular.
    pub fn try_inverse(&self) -> Option<ShapeTransform> {
        let inv = self.linear.try_inverse()?;
        Some(ShapeTransform {
            linear: inv,
            translation: -(inv * self.translation),
        })
    }
}

/// Estimate the similarity transform `M = [cR | t]` minimizing the squared
/// alignment error from `from` onto `to`.
///
/// R is orthonormal with reflections corrected away: the sign of the entry
/// belonging to the smallest singular value is flipped only when the
/// covariance determinant is negative (or zero with `det(U) * det(V) < 0`).
/// The scale falls back to 1 when `from` has no spatial extent.
pub fn estimate_similarity_transform(from: &Shape, to: &Shape) -> ShapeTransform {
    debug_assert_eq!(from.ncols(), to.ncols());

    if from.ncols() == 0 {
        return ShapeTransform::identity();
    }

    let n = from.ncols() as f32;
    let mean_from = from.column_mean();
    let mean_to = to.column_mean();

    let mut centered_from = from.clone();
    for mut col in centered_from.column_iter_mut() {
        col -= mean_from;
    }
    let mut centered_to = to.clone();
    for mut col in centered_to.column_iter_mut() {
        col -= mean_to;
    }

    let mut cov: Matrix3<f32> = &centered_from * centered_to.transpose();
    cov /= n;
    let s_from = centered_from.norm_squared() / n;

    let det_cov = cov.determinant();
    let svd = cov.svd(true, true);
    // A 3x3 SVD with both factors requested always yields them.
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return ShapeTransform::identity(),
    };
    let sv = svd.singular_values;
    let d = Matrix3::from_diagonal(&sv);

    let det_uv = u.determinant() * v_t.determinant();
    let mut s = Matrix3::<f32>::identity();
    if det_cov < 0.0 || (det_cov == 0.0 && det_uv < 0.0) {
        // Flip the entry of the smallest singular value; ties resolve to the
        // highest index.
        let mut k = 0;
        for i in 1..3 {
            if sv[i] <= sv[k] {
                k = i;
            }
        }
        s[(k, k)] = -1.0;
    }

    let rot = u.transpose() * s * v_t.transpose();
    let c = if s_from > 0.0 {
        (d * s).trace() / s_from
    } else {
        1.0
    };

    let translation = mean_to - c * rot * mean_from;
    ShapeTransform::new(c * rot, translation)
}

/// Index of the landmark of `shape` closest to `query` in squared Euclidean
/// distance. Linear scan; `shape` must have at least one landmark.
pub fn closest_landmark_index(shape: &Shape, query: &Vector3<f32>) -> usize {
    let mut best = 0usize;
    let mut best_d2 = f32::MAX;
    for (i, col) in shape.column_iter().enumerate() {
        let d2 = (col - query).norm_squared();
        if d2 < best_d2 {
            best_d2 = d2;
            best = i;
        }
    }
    best
}

/// Encode absolute coordinates relative to their nearest `reference`
/// landmark. Returns the offsets together with the nearest-landmark index of
/// every column, so the absolute position can later be rebuilt from wherever
/// a deformed shape places that landmark.
pub fn shape_relative_pixel_coordinates(
    reference: &Shape,
    abs_coords: &PixelCoordinates,
) -> (PixelCoordinates, Vec<usize>) {
    let num_coords = abs_coords.ncols();
    let mut rel = PixelCoordinates::zeros(num_coords);
    let mut closest = Vec::with_capacity(num_coords);

    for i in 0..num_coords {
        let col = abs_coords.column(i).into_owned();
        let idx = closest_landmark_index(reference, &col);
        rel.set_column(i, &(col - reference.column(idx)));
        closest.push(idx);
    }

    (rel, closest)
}

/// The rectangle with corners at (±0.5, ±0.5).
pub fn unit_rectangle() -> Rect {
    Rect::from_columns(&[
        Vector2::new(-0.5, -0.5),
        Vector2::new(0.5, -0.5),
        Vector2::new(-0.5, 0.5),
        Vector2::new(0.5, 0.5),
    ])
}

/// Axis-aligned corners for the given extremes, in the canonical corner
/// order.
pub fn create_rectangle(min_corner: &Vector2<f32>, max_corner: &Vector2<f32>) -> Rect {
    Rect::from_columns(&[
        *min_corner,
        Vector2::new(max_corner.x, min_corner.y),
        Vector2::new(min_corner.x, max_corner.y),
        *max_corner,
    ])
}

/// Bounding rectangle of the x/y rows of `shape`.
pub fn shape_bounds(shape: &Shape) -> Rect {
    let mut min = Vector2::new(f32::MAX, f32::MAX);
    let mut max = Vector2::new(f32::MIN, f32::MIN);
    for col in shape.column_iter() {
        min.x = min.x.min(col[0]);
        min.y = min.y.min(col[1]);
        max.x = max.x.max(col[0]);
        max.y = max.y.max(col[1]);
    }
    create_rectangle(&min, &max)
}

/// Promote a 2x4 rectangle to a 3x4 shape by appending a zero z-row.
pub fn lift_rect(rect: &Rect) -> Shape {
    let mut lifted = Shape::zeros(4);
    for i in 0..4 {
        lifted[(0, i)] = rect[(0, i)];
        lifted[(1, i)] = rect[(1, i)];
    }
    lifted
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn triangle() -> Shape {
        Shape::from_column_slice(&[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0])
    }

    #[test]
    fn similarity_of_identical_shapes_is_identity() {
        let s = triangle();
        let t = estimate_similarity_transform(&s, &s);
        assert_relative_eq!(*t.linear(), Matrix3::identity(), epsilon = 1e-5);
        assert_relative_eq!(*t.translation(), Vector3::zeros(), epsilon = 1e-5);
    }

    #[test]
    fn similarity_recovers_translation() {
        let from = triangle();
        let mut to = from.clone();
        for mut col in to.column_iter_mut() {
            col += Vector3::new(5.0, 5.0, 0.0);
        }

        let t = estimate_similarity_transform(&from, &to);
        assert_relative_eq!(*t.linear(), Matrix3::identity(), epsilon = 1e-4);
        assert_relative_eq!(*t.translation(), Vector3::new(5.0, 5.0, 0.0), epsilon = 1e-4);

        let mapped = t.apply(&from);
        assert_relative_eq!(mapped, to, epsilon = 1e-4);
    }

    #[test]
    fn similarity_recovers_isotropic_scale() {
        let from = triangle();
        let to = &from * 2.0;

        let t = estimate_similarity_transform(&from, &to);
        assert_relative_eq!(*t.linear(), Matrix3::identity() * 2.0, epsilon = 1e-4);
        assert_relative_eq!(*t.translation(), Vector3::zeros(), epsilon = 1e-4);
    }

    #[test]
    fn similarity_residual_is_zero_for_similarity_pairs() {
        // Half-turn in the plane, scale by 1.5, translate.
        let rot = Matrix3::new(-1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 1.0);
        let reference = ShapeTransform::new(rot * 1.5, Vector3::new(2.0, -1.0, 0.0));

        let from = triangle();
        let to = reference.apply(&from);

        let t = estimate_similarity_transform(&from, &to);
        assert_relative_eq!(t.apply(&from), to, epsilon = 1e-4);
    }

    #[test]
    fn rectangle_normalization_round_trips() {
        let rect = create_rectangle(&Vector2::new(10.0, 20.0), &Vector2::new(110.0, 170.0));
        let lifted = lift_rect(&rect);
        let unit = lift_rect(&unit_rectangle());

        let t = estimate_similarity_transform(&lifted, &unit);
        let inv = t.try_inverse().unwrap();

        let recovered = inv.apply(&t.apply(&lifted));
        assert_relative_eq!(recovered, lifted, epsilon = 1e-3);
    }

    #[test]
    fn closest_landmark_scan() {
        let s = triangle();
        assert_eq!(closest_landmark_index(&s, &Vector3::new(0.9, 0.1, 0.0)), 1);
        assert_eq!(closest_landmark_index(&s, &Vector3::new(0.1, 0.9, 0.0)), 2);
        assert_eq!(closest_landmark_index(&s, &Vector3::new(-1.0, -1.0, 0.0)), 0);
    }

    #[test]
    fn relative_coordinates_rebuild_absolute_positions() {
        let s = triangle();
        let abs = PixelCoordinates::from_column_slice(&[0.9, 0.1, 0.0, 0.05, 0.8, 0.0]);

        let (rel, closest) = shape_relative_pixel_coordinates(&s, &abs);
        assert_eq!(closest, vec![1, 2]);

        for i in 0..abs.ncols() {
            let rebuilt = rel.column(i) + s.column(closest[i]);
            assert_relative_eq!(rebuilt, abs.column(i).into_owned(), epsilon = 1e-6);
        }
    }

    #[test]
    fn unit_rectangle_corner_order() {
        let r = unit_rectangle();
        assert_eq!(r[(0, 0)], -0.5);
        assert_eq!(r[(1, 0)], -0.5);
        assert_eq!(r[(0, 1)], 0.5);
        assert_eq!(r[(1, 1)], -0.5);
        assert_eq!(r[(0, 2)], -0.5);
        assert_eq!(r[(1, 2)], 0.5);
        assert_eq!(r[(0, 3)], 0.5);
        assert_eq!(r[(1, 3)], 0.5);
    }

    #[test]
    fn bounds_of_shape() {
        let s = Shape::from_column_slice(&[1.0, 2.0, 9.0, 4.0, 6.0, -3.0, 2.0, 3.0, 0.0]);
        let b = shape_bounds(&s);
        assert_eq!(b[(0, 0)], 1.0);
        assert_eq!(b[(1, 0)], 2.0);
        assert_eq!(b[(0, 3)], 4.0);
        assert_eq!(b[(1, 3)], 6.0);
    }
}
