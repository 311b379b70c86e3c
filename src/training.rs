//! Training corpus representation and sample synthesis.
//!
//! The input corpus owns the images, the ground-truth shapes, the detection
//! rectangles, and the training RNG. Samples reference their input by index
//! only, so the sample array stays trivially movable and the corpus remains
//! the single owner of the image data.

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::image::Image;
use crate::shape::{
    estimate_similarity_transform, lift_rect, unit_rectangle, Rect, Shape, ShapeTransform,
};

/// Knobs of the cascade fitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingParameters {
    /// Number of sequential refinement stages.
    pub num_cascades: usize,
    /// Trees per stage.
    pub num_trees: usize,
    /// Tree depth D; each tree allocates 2^D - 1 nodes.
    pub max_tree_depth: usize,
    /// Sampling density P per stage.
    pub num_random_pixel_coordinates: usize,
    /// Candidate splits drawn per internal node.
    pub num_random_split_tests_per_node: usize,
    /// Lambda of the distance prior on split-pair acceptance.
    pub exponential_lambda: f32,
    /// Shrinkage applied to every tree's output.
    pub learning_rate: f32,
    /// Margin added to the mean-shape bounding box when sampling coordinates.
    pub expansion_random_pixel_coordinates: f32,
}

impl Default for TrainingParameters {
    fn default() -> Self {
        Self {
            num_cascades: 10,
            num_trees: 500,
            max_tree_depth: 5,
            num_random_pixel_coordinates: 400,
            num_random_split_tests_per_node: 20,
            exponential_lambda: 0.1,
            learning_rate: 0.05,
            expansion_random_pixel_coordinates: 0.05,
        }
    }
}

/// Knobs of the perturbed-sample generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleCreationParameters {
    /// Perturbed estimates generated per input image.
    pub num_shapes_per_image: usize,
    /// Interval the blend weight is drawn from.
    pub linear_weight_range: (f32, f32),
    /// Additionally emit one sample per input whose estimate is the mean of
    /// the perturbations.
    pub include_mean_shape: bool,
}

impl Default for SampleCreationParameters {
    fn default() -> Self {
        Self {
            num_shapes_per_image: 20,
            linear_weight_range: (0.65, 0.8),
            include_mean_shape: true,
        }
    }
}

impl SampleCreationParameters {
    fn validated(&self) -> SampleCreationParameters {
        SampleCreationParameters {
            num_shapes_per_image: self.num_shapes_per_image.max(1),
            linear_weight_range: (
                self.linear_weight_range.0.clamp(0.0, 1.0),
                self.linear_weight_range.1.clamp(0.0, 1.0),
            ),
            include_mean_shape: self.include_mean_shape,
        }
    }
}

/// The annotated input corpus.
pub struct InputData {
    pub images: Vec<Image>,
    pub shapes: Vec<Shape>,
    pub rects: Vec<Rect>,
    /// Inverse normalization transforms, filled by [`InputData::normalize_shapes`].
    pub shape_to_image: Vec<ShapeTransform>,
    /// All training randomness flows from this generator. It is never
    /// handed to worker threads.
    pub rng: StdRng,
}

impl InputData {
    /// Bundle a parallel image/shape/rect corpus with a seeded RNG.
    ///
    /// Fails when the lists disagree in length or the landmark count varies
    /// across shapes.
    pub fn new(images: Vec<Image>, shapes: Vec<Shape>, rects: Vec<Rect>, seed: u64) -> Result<Self> {
        if images.len() != shapes.len() || images.len() != rects.len() {
            return Err(Error::FormatInvalid(format!(
                "corpus lists disagree: {} images, {} shapes, {} rects",
                images.len(),
                shapes.len(),
                rects.len()
            )));
        }
        if let Some(first) = shapes.first() {
            let num_landmarks = first.ncols();
            for s in &shapes {
                if s.ncols() != num_landmarks {
                    return Err(Error::ShapeDimensionMismatch {
                        expected: num_landmarks,
                        got: s.ncols(),
                    });
                }
            }
        }

        Ok(Self {
            images,
            shapes,
            rects,
            shape_to_image: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Transform every ground-truth shape into the canonical frame in which
    /// its detection rectangle maps onto the unit rectangle. The inverse
    /// transforms are retained for mapping estimates back to image space.
    pub fn normalize_shapes(&mut self) -> Result<()> {
        let unit = lift_rect(&unit_rectangle());

        self.shape_to_image.clear();
        self.shape_to_image.reserve(self.shapes.len());
        for i in 0..self.shapes.len() {
            let rect_shape = lift_rect(&self.rects[i]);
            let t = estimate_similarity_transform(&rect_shape, &unit);
            let inv = t.try_inverse().ok_or(Error::RankDeficientTransform)?;
            self.shapes[i] = t.apply(&self.shapes[i]);
            self.shape_to_image.push(inv);
        }
        Ok(())
    }

    /// Double the corpus with horizontally mirrored copies.
    ///
    /// `landmark_permutation[j]` names the source landmark that becomes
    /// landmark `j` after mirroring; it is specific to the annotation
    /// scheme. Must run before [`InputData::normalize_shapes`], while the
    /// rectangles are still in image coordinates.
    pub fn mirror_horizontally(&mut self, landmark_permutation: &[usize]) -> Result<()> {
        let num_landmarks = self.shapes.first().map(|s| s.ncols()).unwrap_or(0);
        if landmark_permutation.len() != num_landmarks {
            return Err(Error::ShapeDimensionMismatch {
                expected: num_landmarks,
                got: landmark_permutation.len(),
            });
        }
        if landmark_permutation
            .iter()
            .any(|&src| src >= num_landmarks)
        {
            return Err(Error::FormatInvalid(
                "landmark permutation indexes out of range".into(),
            ));
        }

        let count = self.images.len();
        for i in 0..count {
            let img = &self.images[i];
            let w = img.width();
            let mirrored = Image::from_fn(w, img.height(), |x, y| {
                img.get((w - 1 - x) as i32, y as i32)
            });

            let mut flipped = self.shapes[i].clone();
            for j in 0..flipped.ncols() {
                flipped[(0, j)] = (w as f32 - 1.0) - flipped[(0, j)];
            }
            let mut permuted = Shape::zeros(num_landmarks);
            for j in 0..num_landmarks {
                permuted.set_column(j, &flipped.column(landmark_permutation[j]).into_owned());
            }

            let mut rect = self.rects[i];
            for c in 0..4 {
                rect[(0, c)] = (w as f32 - 1.0) - rect[(0, c)];
            }
            // Restore the corner convention: mirroring swaps left and right.
            rect.swap_columns(0, 1);
            rect.swap_columns(2, 3);

            self.images.push(mirrored);
            self.shapes.push(permuted);
            self.rects.push(rect);
        }
        Ok(())
    }

    /// Split off a validation subset after permuting the inputs with the
    /// training RNG.
    pub fn random_partition(&mut self, validate_percent: f32) -> InputData {
        let count = self.shapes.len();
        let num_validate = (count as f32 * validate_percent) as usize;

        let mut ids: Vec<usize> = (0..count).collect();
        // Fisher-Yates with the corpus RNG keeps the partition reproducible.
        for i in (1..count).rev() {
            let j = self.rng.gen_range(0..=i);
            ids.swap(i, j);
        }

        let has_transforms = self.shape_to_image.len() == count;
        let validate_seed: u64 = self.rng.gen();

        fn take(src: &InputData, indices: &[usize], has_transforms: bool, rng: StdRng) -> InputData {
            InputData {
                images: indices.iter().map(|&i| src.images[i].clone()).collect(),
                shapes: indices.iter().map(|&i| src.shapes[i].clone()).collect(),
                rects: indices.iter().map(|&i| src.rects[i]).collect(),
                shape_to_image: if has_transforms {
                    indices.iter().map(|&i| src.shape_to_image[i]).collect()
                } else {
                    Vec::new()
                },
                rng,
            }
        }

        let validate = take(
            self,
            &ids[..num_validate],
            has_transforms,
            StdRng::seed_from_u64(validate_seed),
        );
        let train_rng = self.rng.clone();
        let train = take(self, &ids[num_validate..], has_transforms, train_rng);
        *self = train;
        validate
    }
}

/// One synthesized training sample. References its input image by index.
#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub input_idx: usize,
    /// Ground-truth shape in the canonical frame.
    pub target: Shape,
    /// Current estimate, refined in place as cascades are fitted.
    pub estimate: Shape,
    /// Canonical-to-image transform of the referenced input.
    pub shape_to_image: ShapeTransform,
}

/// The sample set a tracker is fitted on.
pub struct SampleData {
    pub samples: Vec<TrainingSample>,
    pub params: TrainingParameters,
}

impl SampleData {
    /// Synthesize perturbed samples: each estimate is a random linear blend
    /// of two ground-truth shapes, optionally followed by one
    /// mean-of-perturbations sample per input.
    pub fn create_training_samples(
        input: &mut InputData,
        creation: &SampleCreationParameters,
        params: TrainingParameters,
    ) -> Result<SampleData> {
        let creation = creation.validated();
        debug!("sample creation parameters: {:?}", creation);

        let num_shapes = input.shapes.len();
        if num_shapes == 0 {
            return Err(Error::EmptyTrainingSet);
        }
        if input.shape_to_image.len() != num_shapes {
            return Err(Error::FormatInvalid(
                "shapes must be normalized before sample creation".into(),
            ));
        }

        let num_samples = num_shapes * creation.num_shapes_per_image;
        let (lo, hi) = creation.linear_weight_range;

        let mut samples = Vec::with_capacity(num_samples + num_shapes);
        for i in 0..num_samples {
            let idx = i % num_shapes;
            let w = lo + input.rng.gen::<f32>() * (hi - lo);
            let a = input.rng.gen_range(0..num_shapes);
            let b = input.rng.gen_range(0..num_shapes);
            let estimate = &input.shapes[a] * w + &input.shapes[b] * (1.0 - w);

            samples.push(TrainingSample {
                input_idx: idx,
                target: input.shapes[idx].clone(),
                estimate,
                shape_to_image: input.shape_to_image[idx],
            });
        }

        if creation.include_mean_shape {
            let num_landmarks = input.shapes[0].ncols();
            let mut mean = Shape::zeros(num_landmarks);
            for s in &samples {
                mean += &s.estimate;
            }
            mean /= samples.len() as f32;

            for i in 0..num_shapes {
                samples.push(TrainingSample {
                    input_idx: i,
                    target: input.shapes[i].clone(),
                    estimate: mean.clone(),
                    shape_to_image: input.shape_to_image[i],
                });
            }
        }

        Ok(SampleData { samples, params })
    }

    /// One sample per input for evaluation runs. Estimates are left zeroed;
    /// prediction starts from the tracker's own mean shape.
    pub fn create_testing_samples(
        input: &InputData,
        params: TrainingParameters,
    ) -> Result<SampleData> {
        if input.shapes.is_empty() {
            return Err(Error::EmptyTrainingSet);
        }
        if input.shape_to_image.len() != input.shapes.len() {
            return Err(Error::FormatInvalid(
                "shapes must be normalized before sample creation".into(),
            ));
        }

        let num_landmarks = input.shapes[0].ncols();
        let samples = (0..input.shapes.len())
            .map(|i| TrainingSample {
                input_idx: i,
                target: input.shapes[i].clone(),
                estimate: Shape::zeros(num_landmarks),
                shape_to_image: input.shape_to_image[i],
            })
            .collect();

        Ok(SampleData { samples, params })
    }
}
