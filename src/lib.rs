//! # shapetrack
//!
//! Deformable shape tracking in pure Rust: an ensemble of cascaded
//! regression trees that refines a set of 3-D landmark coordinates on a
//! greyscale image, starting from an affine placement of a reference shape.
//!
//! The crate both **trains** a cascade from an annotated corpus and
//! **predicts** landmark positions on unseen images.
//!
//! ## Algorithm overview
//!
//! 1. Ground-truth shapes are normalized into a canonical frame in which
//!    their detection rectangle maps onto the unit rectangle.
//! 2. Prediction starts from the mean shape. Each cascade stage samples
//!    sparse pixel intensities at positions tied to the nearest landmark of
//!    the current estimate, runs them through a forest of regression trees,
//!    and adds the shrunk sum of tree residuals to the estimate.
//! 3. The final estimate is mapped back to image space through the caller's
//!    shape-to-image transform.
//!
//! ## Quick start
//!
//! ```
//! use shapetrack::{Image, Shape, ShapeTransform, Tracker};
//! use nalgebra::{Matrix3, Vector3};
//!
//! // A trained model would come from `Tracker::load("tracker.bin")`; an
//! //  empty cascade simply places the mean shape.
//! let mean_shape = Shape::from_column_slice(&[
//!     -0.2, -0.2, 0.0, //
//!     0.2, -0.2, 0.0, //
//!     0.0, 0.25, 0.0, //
//! ]);
//! let tracker = Tracker::new(mean_shape, Vec::new());
//!
//! let image = Image::from_fn(640, 480, |x, y| ((x + y) % 256) as f32 / 255.0);
//!
//! // Place the canonical frame over a detected region.
//! let shape_to_image =
//!     ShapeTransform::new(Matrix3::identity() * 200.0, Vector3::new(320.0, 240.0, 0.0));
//!
//! let landmarks = tracker.predict(&image, &shape_to_image, None);
//! assert_eq!(landmarks.ncols(), tracker.num_landmarks());
//! ```
//!
//! ## Training
//!
//! Training consumes an [`InputData`] corpus (images, ground-truth shapes,
//! detection rectangles, and a seeded RNG), synthesizes perturbed samples,
//! and fits stage after stage:
//!
//! ```no_run
//! use shapetrack::{
//!     InputData, SampleCreationParameters, SampleData, Tracker, TrainingParameters,
//! };
//!
//! # fn corpus() -> (Vec<shapetrack::Image>, Vec<shapetrack::Shape>, Vec<shapetrack::Rect>) {
//! #     unimplemented!()
//! # }
//! # fn main() -> shapetrack::Result<()> {
//! let (images, shapes, rects) = corpus();
//! let mut input = InputData::new(images, shapes, rects, 10)?;
//! input.normalize_shapes()?;
//!
//! let mut samples = SampleData::create_training_samples(
//!     &mut input,
//!     &SampleCreationParameters::default(),
//!     TrainingParameters::default(),
//! )?;
//!
//! let tracker = Tracker::fit(&mut input, &mut samples)?;
//! tracker.save("tracker.bin")?;
//! # Ok(())
//! # }
//! ```
//!
//! Given a fixed seed, fitting is fully reproducible: all randomness flows
//! from the corpus RNG, and the parallel parts of the fitter neither
//! consume it nor influence which split wins.

pub mod database;
mod error;
mod image;
mod model_io;
mod regressor;
mod shape;
mod tracker;
mod training;
mod tree;

pub use error::{Error, Result};
pub use image::{read_image, Image};
pub use model_io::{read_tracker, tracker_from_bytes, tracker_to_bytes, write_tracker};
pub use regressor::Regressor;
pub use shape::{
    closest_landmark_index, create_rectangle, estimate_similarity_transform, lift_rect,
    shape_bounds, shape_relative_pixel_coordinates, unit_rectangle, PixelCoordinates,
    PixelIntensities, Rect, Shape, ShapeResidual, ShapeTransform,
};
pub use tracker::Tracker;
pub use training::{
    InputData, SampleCreationParameters, SampleData, TrainingParameters, TrainingSample,
};
pub use tree::{Split, Tree};
