//! The full cascade: a reference mean shape refined by sequential
//! regressor stages.

use std::path::Path;

use log::{debug, info};
use nalgebra::Matrix3xX;

use crate::error::{Error, Result};
use crate::image::Image;
use crate::model_io;
use crate::regressor::Regressor;
use crate::shape::{lift_rect, shape_bounds, Shape, ShapeTransform};
use crate::training::{InputData, SampleData};

/// A trained deformable-shape tracker.
///
/// Populated either by [`Tracker::fit`] or by [`Tracker::load`]; once
/// populated it is immutable and safe to share among concurrent readers,
/// each predicting on its own inputs.
#[derive(Debug, Clone)]
pub struct Tracker {
    pub(crate) mean_shape: Shape,
    /// Corners of the mean shape's bounding rectangle, kept for callers
    /// computing initial placements. Stored with a zero z-row.
    pub(crate) mean_shape_rect_corners: Shape,
    pub(crate) cascade: Vec<Regressor>,
}

impl Tracker {
    /// Assemble a tracker from a mean shape and fitted stages.
    pub fn new(mean_shape: Shape, cascade: Vec<Regressor>) -> Tracker {
        let mean_shape_rect_corners = lift_rect(&shape_bounds(&mean_shape));
        Tracker {
            mean_shape,
            mean_shape_rect_corners,
            cascade,
        }
    }

    /// Fit the cascade on a populated sample set.
    ///
    /// The mean shape is the component-wise mean over every sample's
    /// estimate, accumulated in double precision. Stages are fitted
    /// strictly in sequence; after each one, every sample's estimate is
    /// advanced in place by the stage's prediction.
    pub fn fit(input: &mut InputData, data: &mut SampleData) -> Result<Tracker> {
        if data.samples.is_empty() {
            return Err(Error::EmptyTrainingSet);
        }

        info!("fitting tracker on {} samples", data.samples.len());
        debug!("training parameters: {:?}", data.params);

        let num_landmarks = data.samples[0].estimate.ncols();
        let mut acc = Matrix3xX::<f64>::zeros(num_landmarks);
        for s in &data.samples {
            if s.estimate.ncols() != num_landmarks {
                return Err(Error::ShapeDimensionMismatch {
                    expected: num_landmarks,
                    got: s.estimate.ncols(),
                });
            }
            acc += s.estimate.map(f64::from);
        }
        let inv_count = 1.0 / data.samples.len() as f64;
        let mean_shape: Shape = acc.map(|v| (v * inv_count) as f32);

        let mut cascade = Vec::with_capacity(data.params.num_cascades);
        for i in 0..data.params.num_cascades {
            info!("fitting cascade {}/{}", i + 1, data.params.num_cascades);

            let regressor = Regressor::fit(
                &data.samples,
                &input.images,
                &mean_shape,
                &data.params,
                &mut input.rng,
            )?;

            for s in data.samples.iter_mut() {
                let delta =
                    regressor.predict(&input.images[s.input_idx], &s.estimate, &s.shape_to_image);
                s.estimate += delta;
            }

            cascade.push(regressor);
        }

        Ok(Tracker::new(mean_shape, cascade))
    }

    /// Predict landmark positions on `image`, starting from the mean shape
    /// placed by `shape_to_image`.
    ///
    /// When `step_results` is given, it collects the shape after every
    /// cascade stage (in image frame) for debugging, ending with the final
    /// shape.
    pub fn predict(
        &self,
        image: &Image,
        shape_to_image: &ShapeTransform,
        mut step_results: Option<&mut Vec<Shape>>,
    ) -> Shape {
        let mut estimate = self.mean_shape.clone();

        for regressor in &self.cascade {
            if let Some(steps) = step_results.as_deref_mut() {
                steps.push(shape_to_image.apply(&estimate));
            }
            let delta = regressor.predict(image, &estimate, shape_to_image);
            estimate += delta;
        }

        let final_shape = shape_to_image.apply(&estimate);
        if let Some(steps) = step_results.as_deref_mut() {
            steps.push(final_shape.clone());
        }
        final_shape
    }

    /// Serialize to the flat binary tracker format.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        model_io::write_tracker(self, path.as_ref())
    }

    /// Load and verify a tracker file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Tracker> {
        model_io::read_tracker(path.as_ref())
    }

    pub fn mean_shape(&self) -> &Shape {
        &self.mean_shape
    }

    /// Corners of the mean shape's bounding rectangle as a 3x4 shape.
    pub fn mean_shape_rect_corners(&self) -> &Shape {
        &self.mean_shape_rect_corners
    }

    pub fn num_landmarks(&self) -> usize {
        self.mean_shape.ncols()
    }

    pub fn num_cascades(&self) -> usize {
        self.cascade.len()
    }
}
