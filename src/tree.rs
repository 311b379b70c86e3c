//! A single regression tree fitted by BFS with residual-energy split
//! selection, predicting on pixel-intensity differences.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::Rng;
use rayon::prelude::*;

use crate::shape::{PixelCoordinates, PixelIntensities, ShapeResidual};
use crate::training::TrainingParameters;

/// A binary test on the difference of two sampled intensities.
/// `idx1 < 0` marks a leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub idx1: i32,
    pub idx2: i32,
    pub threshold: f32,
}

/// Internal node or leaf; leaves carry the mean residual of their samples.
#[derive(Debug, Clone)]
pub(crate) struct TreeNode {
    pub split: Split,
    pub mean: ShapeResidual,
}

impl Default for TreeNode {
    fn default() -> Self {
        TreeNode {
            split: Split {
                idx1: -1,
                idx2: -1,
                threshold: 0.0,
            },
            mean: ShapeResidual::zeros(0),
        }
    }
}

/// A full binary tree of depth D in array layout: node `i` has children
/// `2i + 1` and `2i + 2`, with exactly `2^D - 1` slots. Slots below a
/// premature leaf keep their defaults and are never consulted.
#[derive(Debug, Clone)]
pub struct Tree {
    pub(crate) nodes: Vec<TreeNode>,
    pub(crate) depth: usize,
}

/// Per-sample state threaded through one tree fit.
pub(crate) struct TreeSample {
    pub residual: ShapeResidual,
    pub intensities: PixelIntensities,
}

/// Everything one tree fit needs. The RNG is only touched by the
/// single-threaded outer fitter; the parallel energy evaluation reads
/// samples and coordinates alone, so serial and parallel runs agree.
pub(crate) struct TreeTraining<'a> {
    pub samples: &'a mut Vec<TreeSample>,
    /// Mean-shape-relative coordinates the splits index into.
    pub pixel_coordinates: &'a PixelCoordinates,
    pub num_landmarks: usize,
    pub params: &'a TrainingParameters,
    pub rng: &'a mut StdRng,
}

#[derive(Debug, Clone, Copy)]
struct NodeInfo {
    node: usize,
    depth: usize,
    /// Half-open index range into the sample vector.
    range: (usize, usize),
}

impl Tree {
    pub(crate) fn fit(t: &mut TreeTraining<'_>) -> Tree {
        let depth = t.params.max_tree_depth.max(1);
        let num_nodes = (1usize << depth) - 1;
        let mut nodes = vec![TreeNode::default(); num_nodes];

        let mut queue = VecDeque::new();
        queue.push_back(NodeInfo {
            node: 0,
            depth: 1,
            range: (0, t.samples.len()),
        });

        while let Some(info) = queue.pop_front() {
            if info.depth < depth {
                if let Some((left, right)) = split_node(t, &mut nodes, &info) {
                    queue.push_back(left);
                    queue.push_back(right);
                } else {
                    make_leaf(t, &mut nodes, &info);
                }
            } else {
                make_leaf(t, &mut nodes, &info);
            }
        }

        Tree { nodes, depth }
    }

    /// Descend from the root, evaluating at most D - 1 splits; stops at the
    /// first leaf marker and returns its mean residual.
    pub fn predict(&self, intensities: &PixelIntensities) -> &ShapeResidual {
        let max_tests = self.depth.saturating_sub(1);

        let mut n = 0usize;
        for _ in 0..max_tests {
            let node = &self.nodes[n];
            if node.split.idx1 < 0 {
                break;
            }
            n = if split_test(&node.split, intensities) {
                2 * n + 1
            } else {
                2 * n + 2
            };
        }

        &self.nodes[n].mean
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }
}

#[inline]
fn split_test(split: &Split, intensities: &PixelIntensities) -> bool {
    intensities[split.idx1 as usize] - intensities[split.idx2 as usize] > split.threshold
}

fn mean_residual_of_range(samples: &[TreeSample], num_landmarks: usize) -> ShapeResidual {
    let mut mean = ShapeResidual::zeros(num_landmarks);
    if samples.is_empty() {
        return mean;
    }
    for s in samples {
        mean += &s.residual;
    }
    mean / samples.len() as f32
}

fn make_leaf(t: &TreeTraining<'_>, nodes: &mut [TreeNode], info: &NodeInfo) {
    let node = &mut nodes[info.node];
    node.split.idx1 = -1;
    node.split.idx2 = -1;
    node.mean = mean_residual_of_range(&t.samples[info.range.0..info.range.1], t.num_landmarks);
}

fn split_node(
    t: &mut TreeTraining<'_>,
    nodes: &mut [TreeNode],
    parent: &NodeInfo,
) -> Option<(NodeInfo, NodeInfo)> {
    let (first, last) = parent.range;
    if first == last {
        return None;
    }

    let splits = sample_split_candidates(t);
    if splits.is_empty() {
        return None;
    }

    let parent_mean = mean_residual_of_range(&t.samples[first..last], t.num_landmarks);

    let range = &t.samples[first..last];
    let num_landmarks = t.num_landmarks;
    let energies: Vec<f32> = splits
        .par_iter()
        .map(|split| split_energy(range, num_landmarks, &parent_mean, split))
        .collect();

    // Maximum energy wins; ties break to the lowest index so that parallel
    // and serial evaluation pick the same split.
    let mut best = 0;
    for i in 1..energies.len() {
        if energies[i] > energies[best] {
            best = i;
        }
    }

    let split = splits[best].clone();
    let middle = first + partition_samples(&mut t.samples[first..last], &split);
    if middle == first || middle == last {
        return None;
    }

    nodes[parent.node].split = split;
    Some((
        NodeInfo {
            node: 2 * parent.node + 1,
            depth: parent.depth + 1,
            range: (first, middle),
        },
        NodeInfo {
            node: 2 * parent.node + 2,
            depth: parent.depth + 1,
            range: (middle, last),
        },
    ))
}

/// Draw up to K candidate splits. A pair (i, j) is accepted with probability
/// exp(-d / lambda) over the distance of its relative coordinates, which
/// biases splits toward nearby pixel pairs; each attempt retries up to 100
/// times and is skipped when no pair gets accepted.
fn sample_split_candidates(t: &mut TreeTraining<'_>) -> Vec<Split> {
    const MAX_ATTEMPTS: u32 = 100;

    let num_coords = t.pixel_coordinates.ncols();
    let mut splits = Vec::with_capacity(t.params.num_random_split_tests_per_node);
    if num_coords == 0 {
        return splits;
    }

    let inv_lambda = 1.0 / t.params.exponential_lambda;

    for _ in 0..t.params.num_random_split_tests_per_node {
        let mut iter = 0u32;
        let mut idx1;
        let mut idx2;
        loop {
            idx1 = t.rng.gen_range(0..num_coords);
            idx2 = t.rng.gen_range(0..num_coords);
            let d = (t.pixel_coordinates.column(idx1) - t.pixel_coordinates.column(idx2)).norm();
            let e = (-d * inv_lambda).exp();
            let r: f32 = t.rng.gen();
            iter += 1;

            if !(iter <= MAX_ATTEMPTS && (idx1 == idx2 || r >= e)) {
                break;
            }
        }

        if iter <= MAX_ATTEMPTS {
            let threshold = -64.0 + t.rng.gen::<f32>() * 128.0;
            splits.push(Split {
                idx1: idx1 as i32,
                idx2: idx2 as i32,
                threshold,
            });
        }
    }

    splits
}

/// `|L|·‖μ_L‖² + |R|·‖μ_R‖²`, with the right mean derived from the parent
/// mean so only one pass over the samples is needed. Maximizing this is
/// minimizing the within-child residual sum of squares. Splits leaving the
/// right side empty are never preferred.
fn split_energy(
    samples: &[TreeSample],
    num_landmarks: usize,
    parent_mean: &ShapeResidual,
    split: &Split,
) -> f32 {
    let mut left_mean = ShapeResidual::zeros(num_landmarks);
    let mut num_left = 0usize;
    for s in samples {
        if split_test(split, &s.intensities) {
            left_mean += &s.residual;
            num_left += 1;
        }
    }
    if num_left > 0 {
        left_mean /= num_left as f32;
    }

    let num_parent = samples.len();
    let num_right = num_parent - num_left;
    if num_right == 0 {
        return f32::NEG_INFINITY;
    }

    let right_mean =
        (parent_mean * num_parent as f32 - &left_mean * num_left as f32) / num_right as f32;

    num_left as f32 * left_mean.norm_squared() + num_right as f32 * right_mean.norm_squared()
}

/// Reorder the slice so samples satisfying the split come first; returns the
/// boundary offset.
fn partition_samples(samples: &mut [TreeSample], split: &Split) -> usize {
    let mut boundary = 0usize;
    for j in 0..samples.len() {
        if split_test(split, &samples[j].intensities) {
            samples.swap(boundary, j);
            boundary += 1;
        }
    }
    boundary
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    fn residual(v: f32) -> ShapeResidual {
        ShapeResidual::from_element(2, v)
    }

    fn params(depth: usize) -> TrainingParameters {
        TrainingParameters {
            max_tree_depth: depth,
            num_random_split_tests_per_node: 40,
            ..TrainingParameters::default()
        }
    }

    fn relative_coords() -> PixelCoordinates {
        PixelCoordinates::from_column_slice(&[
            0.0, 0.0, 0.0, //
            0.01, 0.0, 0.0, //
            0.0, 0.01, 0.0, //
            0.01, 0.01, 0.0, //
        ])
    }

    #[test]
    fn depth_one_tree_is_a_single_leaf() {
        let coords = relative_coords();
        let p = params(1);
        let mut rng = StdRng::seed_from_u64(1);
        let mut samples = vec![
            TreeSample {
                residual: residual(1.0),
                intensities: PixelIntensities::from_element(4, 0.5),
            },
            TreeSample {
                residual: residual(3.0),
                intensities: PixelIntensities::from_element(4, 0.1),
            },
        ];

        let mut tt = TreeTraining {
            samples: &mut samples,
            pixel_coordinates: &coords,
            num_landmarks: 2,
            params: &p,
            rng: &mut rng,
        };
        let tree = Tree::fit(&mut tt);

        assert_eq!(tree.num_nodes(), 1);
        assert_eq!(tree.depth(), 1);

        // The root is a leaf holding the mean residual, whatever the input.
        let out = tree.predict(&PixelIntensities::from_element(4, 0.9));
        assert_relative_eq!(*out, residual(2.0), epsilon = 1e-6);
        let out = tree.predict(&PixelIntensities::zeros(4));
        assert_relative_eq!(*out, residual(2.0), epsilon = 1e-6);
    }

    #[test]
    fn empty_range_yields_zero_leaf() {
        let coords = relative_coords();
        let p = params(3);
        let mut rng = StdRng::seed_from_u64(2);
        let mut samples: Vec<TreeSample> = Vec::new();

        let mut tt = TreeTraining {
            samples: &mut samples,
            pixel_coordinates: &coords,
            num_landmarks: 2,
            params: &p,
            rng: &mut rng,
        };
        let tree = Tree::fit(&mut tt);

        assert_eq!(tree.num_nodes(), 7);
        let out = tree.predict(&PixelIntensities::zeros(4));
        assert_relative_eq!(*out, ShapeResidual::zeros(2), epsilon = 1e-6);
    }

    #[test]
    fn fitted_splits_index_valid_coordinates() {
        let coords = relative_coords();
        let p = params(4);
        let mut rng = StdRng::seed_from_u64(3);

        // Two populations separated by the intensity at coordinate 0.
        let mut samples = Vec::new();
        for i in 0..32 {
            let high = i % 2 == 0;
            let mut intensities = PixelIntensities::from_element(4, 0.2);
            intensities[0] = if high { 200.0 } else { 0.0 };
            samples.push(TreeSample {
                residual: residual(if high { 1.0 } else { -1.0 }),
                intensities,
            });
        }

        let mut tt = TreeTraining {
            samples: &mut samples,
            pixel_coordinates: &coords,
            num_landmarks: 2,
            params: &p,
            rng: &mut rng,
        };
        let tree = Tree::fit(&mut tt);

        assert_eq!(tree.num_nodes(), 15);
        for node in &tree.nodes {
            if node.split.idx1 < 0 {
                assert_eq!(node.split.idx1, -1);
                assert_eq!(node.split.idx2, -1);
            } else {
                assert!((node.split.idx1 as usize) < 4);
                assert!(node.split.idx2 >= 0);
                assert!((node.split.idx2 as usize) < 4);
            }
        }
    }

    #[test]
    fn tree_separates_distinct_populations() {
        let coords = relative_coords();
        let p = params(2);
        let mut rng = StdRng::seed_from_u64(4);

        let mut samples = Vec::new();
        for i in 0..64 {
            let high = i % 2 == 0;
            let mut intensities = PixelIntensities::from_element(4, 0.0);
            intensities[0] = if high { 200.0 } else { 0.0 };
            samples.push(TreeSample {
                residual: residual(if high { 1.0 } else { -1.0 }),
                intensities,
            });
        }

        let mut tt = TreeTraining {
            samples: &mut samples,
            pixel_coordinates: &coords,
            num_landmarks: 2,
            params: &p,
            rng: &mut rng,
        };
        let tree = Tree::fit(&mut tt);

        // Any split on coordinate 0 against the rest cleanly separates the
        // populations, so each leaf predicts its side's mean.
        let mut high = PixelIntensities::from_element(4, 0.0);
        high[0] = 200.0;
        let low = PixelIntensities::from_element(4, 0.0);

        let both = tree.predict(&high)[(0, 0)] + tree.predict(&low)[(0, 0)];
        let spread = tree.predict(&high)[(0, 0)] - tree.predict(&low)[(0, 0)];
        assert_relative_eq!(both, 0.0, epsilon = 1e-5);
        assert!(spread.abs() > 1.0);
    }

    #[test]
    fn partition_moves_matching_samples_first() {
        let split = Split {
            idx1: 0,
            idx2: 1,
            threshold: 0.5,
        };
        let mut samples = Vec::new();
        for v in [0.0f32, 1.0, 0.0, 1.0, 1.0] {
            let mut intensities = PixelIntensities::zeros(2);
            intensities[0] = v;
            samples.push(TreeSample {
                residual: residual(v),
                intensities,
            });
        }

        let boundary = partition_samples(&mut samples, &split);
        assert_eq!(boundary, 3);
        for s in &samples[..boundary] {
            assert!(split_test(&split, &s.intensities));
        }
        for s in &samples[boundary..] {
            assert!(!split_test(&split, &s.intensities));
        }
    }

    #[test]
    fn energy_prefers_the_separating_split() {
        let mut samples = Vec::new();
        for i in 0..10 {
            let high = i < 5;
            let mut intensities = PixelIntensities::zeros(2);
            intensities[0] = if high { 10.0 } else { 0.0 };
            samples.push(TreeSample {
                residual: residual(if high { 2.0 } else { -2.0 }),
                intensities,
            });
        }
        let parent_mean = mean_residual_of_range(&samples, 2);

        let separating = Split {
            idx1: 0,
            idx2: 1,
            threshold: 5.0,
        };
        let useless = Split {
            idx1: 1,
            idx2: 1,
            threshold: 100.0,
        };

        let good = split_energy(&samples, 2, &parent_mean, &separating);
        let bad = split_energy(&samples, 2, &parent_mean, &useless);
        assert!(good > bad);
    }
}
