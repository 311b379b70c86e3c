//! One cascade stage: a forest of gradient-boosted trees over a shared set
//! of mean-shape-relative pixel coordinates, plus a mean-residual base
//! learner.

use log::debug;
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{Error, Result};
use crate::image::{read_image, Image};
use crate::shape::{
    estimate_similarity_transform, shape_relative_pixel_coordinates, PixelCoordinates,
    PixelIntensities, Shape, ShapeResidual, ShapeTransform,
};
use crate::training::{TrainingParameters, TrainingSample};
use crate::tree::{Tree, TreeSample, TreeTraining};

/// A fitted cascade stage.
#[derive(Debug, Clone)]
pub struct Regressor {
    /// P sample positions encoded relative to their nearest mean-shape
    /// landmark.
    pub(crate) shape_relative_pixel_coordinates: PixelCoordinates,
    /// Nearest mean-shape landmark per coordinate; same length as the
    /// coordinate count.
    pub(crate) closest_shape_landmark: Vec<usize>,
    /// Constant base learner output.
    pub(crate) mean_residual: ShapeResidual,
    /// The reference shape the relative coordinates were encoded against.
    pub(crate) mean_shape: Shape,
    pub(crate) trees: Vec<Tree>,
    pub(crate) learning_rate: f32,
}

impl Regressor {
    /// Fit the stage on the current sample estimates.
    ///
    /// Per-sample intensities are read once up front and reused by every
    /// tree; only the residuals are updated as the forest grows.
    pub(crate) fn fit(
        samples: &[TrainingSample],
        images: &[Image],
        mean_shape: &Shape,
        params: &TrainingParameters,
        rng: &mut StdRng,
    ) -> Result<Regressor> {
        if samples.is_empty() {
            return Err(Error::EmptyTrainingSet);
        }
        let num_landmarks = mean_shape.ncols();

        let abs_coords = sample_coordinates(mean_shape, params, rng);
        let (rel_coords, closest) = shape_relative_pixel_coordinates(mean_shape, &abs_coords);

        let mut tree_samples = Vec::with_capacity(samples.len());
        let mut mean_residual = ShapeResidual::zeros(num_landmarks);
        for s in samples {
            let residual = &s.target - &s.estimate;
            mean_residual += &residual;

            let shape_to_shape = estimate_similarity_transform(mean_shape, &s.estimate);
            let intensities = read_pixel_intensities(
                &rel_coords,
                &closest,
                &shape_to_shape,
                &s.shape_to_image,
                &s.estimate,
                &images[s.input_idx],
            );
            tree_samples.push(TreeSample {
                residual,
                intensities,
            });
        }
        mean_residual /= samples.len() as f32;

        let learning_rate = params.learning_rate;
        let mut trees: Vec<Tree> = Vec::with_capacity(params.num_trees);
        for k in 0..params.num_trees {
            debug!("fitting tree {}/{}", k + 1, params.num_trees);

            for sample in tree_samples.iter_mut() {
                if k == 0 {
                    sample.residual -= &mean_residual;
                } else {
                    sample.residual -= trees[k - 1].predict(&sample.intensities) * learning_rate;
                }
            }

            let mut tt = TreeTraining {
                samples: &mut tree_samples,
                pixel_coordinates: &rel_coords,
                num_landmarks,
                params,
                rng: &mut *rng,
            };
            trees.push(Tree::fit(&mut tt));
        }

        Ok(Regressor {
            shape_relative_pixel_coordinates: rel_coords,
            closest_shape_landmark: closest,
            mean_residual,
            mean_shape: mean_shape.clone(),
            trees,
            learning_rate,
        })
    }

    /// Residual this stage contributes for the given estimate:
    /// `mean_residual + eta * sum of tree outputs`.
    pub fn predict(
        &self,
        image: &Image,
        shape: &Shape,
        shape_to_image: &ShapeTransform,
    ) -> ShapeResidual {
        let shape_to_shape = estimate_similarity_transform(&self.mean_shape, shape);
        let intensities = read_pixel_intensities(
            &self.shape_relative_pixel_coordinates,
            &self.closest_shape_landmark,
            &shape_to_shape,
            shape_to_image,
            shape,
            image,
        );

        let mut residual = self.mean_residual.clone();
        for tree in &self.trees {
            residual += tree.predict(&intensities) * self.learning_rate;
        }
        residual
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn num_pixel_coordinates(&self) -> usize {
        self.shape_relative_pixel_coordinates.ncols()
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

/// Draw P uniform positions inside the mean-shape bounding volume expanded
/// by the configured margin. Per point the axes are drawn in x, y, z order;
/// the z extent participates even though image lookup ignores it.
fn sample_coordinates(
    mean_shape: &Shape,
    params: &TrainingParameters,
    rng: &mut StdRng,
) -> PixelCoordinates {
    let expansion = params.expansion_random_pixel_coordinates;

    let mut min = Vector3::new(f32::MAX, f32::MAX, f32::MAX);
    let mut max = Vector3::new(f32::MIN, f32::MIN, f32::MIN);
    for col in mean_shape.column_iter() {
        for a in 0..3 {
            min[a] = min[a].min(col[a]);
            max[a] = max[a].max(col[a]);
        }
    }
    min.add_scalar_mut(-expansion);
    max.add_scalar_mut(expansion);
    let extent = max - min;

    let num_coords = params.num_random_pixel_coordinates;
    let mut coords = PixelCoordinates::zeros(num_coords);
    for i in 0..num_coords {
        coords[(0, i)] = min.x + rng.gen::<f32>() * extent.x;
        coords[(1, i)] = min.y + rng.gen::<f32>() * extent.y;
        coords[(2, i)] = min.z + rng.gen::<f32>() * extent.z;
    }
    coords
}

/// Move relative coordinates into image space for one shape estimate: rotate
/// and scale by the canonical-to-estimate linear part, anchor at the nearest
/// landmark of the estimate, then map through the shape-to-image transform.
fn read_pixel_intensities(
    rel_coords: &PixelCoordinates,
    closest: &[usize],
    shape_to_shape: &ShapeTransform,
    shape_to_image: &ShapeTransform,
    shape: &Shape,
    image: &Image,
) -> PixelIntensities {
    let mut coords = shape_to_shape.linear() * rel_coords;
    for (i, &landmark) in closest.iter().enumerate() {
        let mut col = coords.column_mut(i);
        col += shape.column(landmark);
    }
    let coords = shape_to_image.apply(&coords);
    read_image(image, &coords)
}
