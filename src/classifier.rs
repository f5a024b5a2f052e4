//! Single-feature decision tree for the at-risk label.
//!
//! The tree is a CART classifier using Gini impurity. With a single feature
//! every node covers a contiguous run of the sorted training averages, so
//! the fit sorts once and recurses over slices.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::models::TrainingSample;

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Leaf {
        class: u8,
    },
    Split {
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionTree {
    nodes: Vec<Node>,
}

impl DecisionTree {
    /// Fits a tree no deeper than `max_depth` on `(average, label)` points.
    pub fn fit(samples: &[TrainingSample], max_depth: usize) -> Result<Self> {
        if samples.is_empty() {
            return Err(PipelineError::InsufficientTrainingData(
                "cannot fit a tree on zero samples".to_string(),
            ));
        }
        if samples.iter().any(|sample| !sample.average.is_finite()) {
            return Err(PipelineError::Internal(
                "training averages must be finite".to_string(),
            ));
        }

        let mut points: Vec<(f64, u8)> = samples
            .iter()
            .map(|sample| (sample.average, sample.risk_label))
            .collect();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut tree = DecisionTree { nodes: Vec::new() };
        tree.grow(&points, 0, max_depth);
        Ok(tree)
    }

    fn grow(&mut self, points: &[(f64, u8)], depth: usize, max_depth: usize) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node::Leaf {
            class: majority_class(points),
        });

        if depth >= max_depth || points.len() < 2 {
            return index;
        }
        let Some((position, threshold)) = best_split(points) else {
            return index;
        };

        let (left_points, right_points) = points.split_at(position);
        let left = self.grow(left_points, depth + 1, max_depth);
        let right = self.grow(right_points, depth + 1, max_depth);
        self.nodes[index] = Node::Split {
            threshold,
            left,
            right,
        };
        index
    }

    pub fn predict(&self, average: f64) -> u8 {
        let mut index = 0;
        loop {
            match self.nodes[index] {
                Node::Leaf { class } => return class,
                Node::Split {
                    threshold,
                    left,
                    right,
                } => index = if average <= threshold { left } else { right },
            }
        }
    }

    pub fn predict_batch(&self, averages: &[f64]) -> Vec<u8> {
        averages.iter().map(|average| self.predict(*average)).collect()
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| matches!(node, Node::Leaf { .. }))
            .count()
    }

    pub fn depth(&self) -> usize {
        self.depth_from(0)
    }

    fn depth_from(&self, index: usize) -> usize {
        match self.nodes[index] {
            Node::Leaf { .. } => 0,
            Node::Split { left, right, .. } => {
                1 + self.depth_from(left).max(self.depth_from(right))
            }
        }
    }
}

fn class_counts(points: &[(f64, u8)]) -> [usize; 2] {
    let positives = points.iter().filter(|(_, label)| *label == 1).count();
    [points.len() - positives, positives]
}

/// Majority label; a tie goes to class 0.
fn majority_class(points: &[(f64, u8)]) -> u8 {
    let [negatives, positives] = class_counts(points);
    u8::from(positives > negatives)
}

fn gini(counts: [usize; 2]) -> f64 {
    let total = (counts[0] + counts[1]) as f64;
    if total == 0.0 {
        return 0.0;
    }
    let p0 = counts[0] as f64 / total;
    let p1 = counts[1] as f64 / total;
    1.0 - p0 * p0 - p1 * p1
}

/// Returns the split position in the sorted slice and its threshold, or
/// `None` when no cut strictly lowers the weighted impurity.
fn best_split(points: &[(f64, u8)]) -> Option<(usize, f64)> {
    let total = class_counts(points);
    let parent = gini(total);
    if parent == 0.0 {
        return None;
    }

    let n = points.len() as f64;
    let mut left = [0usize; 2];
    let mut best: Option<(usize, f64, f64)> = None;

    for i in 0..points.len() - 1 {
        left[usize::from(points[i].1)] += 1;
        let (current, next) = (points[i].0, points[i + 1].0);
        if current >= next {
            continue;
        }

        let right = [total[0] - left[0], total[1] - left[1]];
        let n_left = (i + 1) as f64;
        let impurity = (n_left * gini(left) + (n - n_left) * gini(right)) / n;
        if best.map_or(true, |(_, _, best_impurity)| impurity < best_impurity) {
            let mut threshold = current + (next - current) / 2.0;
            if threshold >= next {
                threshold = current;
            }
            best = Some((i + 1, threshold, impurity));
        }
    }

    best.filter(|(_, _, impurity)| *impurity < parent)
        .map(|(position, threshold, _)| (position, threshold))
}

/// Shuffles with a seeded RNG and takes `ceil(test_fraction * n)` samples
/// for the held-out set, leaving at least one on each side.
pub fn train_test_split(
    pool: &[TrainingSample],
    test_fraction: f64,
    seed: u64,
) -> (Vec<TrainingSample>, Vec<TrainingSample>) {
    let n = pool.len();
    let n_test = ((test_fraction * n as f64).ceil() as usize).clamp(1, n.saturating_sub(1).max(1));

    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));

    let test = order[..n_test.min(n)].iter().map(|&i| pool[i]).collect();
    let train = order[n_test.min(n)..].iter().map(|&i| pool[i]).collect();
    (train, test)
}

#[derive(Debug, Clone)]
pub struct RiskModel {
    pub tree: DecisionTree,
    /// Share of correct predictions on the held-out split.
    pub accuracy: f64,
    pub train_size: usize,
    pub test_size: usize,
}

impl RiskModel {
    pub fn predict(&self, average: f64) -> u8 {
        self.tree.predict(average)
    }
}

pub fn fit_risk_model(pool: &[TrainingSample], config: &PipelineConfig) -> Result<RiskModel> {
    if pool.len() < 2 {
        return Err(PipelineError::InsufficientTrainingData(format!(
            "need at least 2 samples, got {}",
            pool.len()
        )));
    }
    let [negatives, positives] = class_counts(
        &pool
            .iter()
            .map(|sample| (sample.average, sample.risk_label))
            .collect::<Vec<_>>(),
    );
    if negatives == 0 || positives == 0 {
        return Err(PipelineError::InsufficientTrainingData(
            "every sample carries the same risk label".to_string(),
        ));
    }

    let (train, test) = train_test_split(pool, config.test_fraction, config.seed);
    let tree = DecisionTree::fit(&train, config.max_depth)?;
    debug!(
        nodes = tree.n_nodes(),
        leaves = tree.n_leaves(),
        depth = tree.depth(),
        "risk tree fitted"
    );

    let correct = test
        .iter()
        .filter(|sample| tree.predict(sample.average) == sample.risk_label)
        .count();
    let accuracy = correct as f64 / test.len() as f64;
    info!(
        train = train.len(),
        test = test.len(),
        accuracy,
        "risk classifier evaluated"
    );

    Ok(RiskModel {
        tree,
        accuracy,
        train_size: train.len(),
        test_size: test.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SampleOrigin;

    fn sample(average: f64, risk_label: u8) -> TrainingSample {
        TrainingSample {
            average,
            risk_label,
            origin: SampleOrigin::Real { student: 0 },
        }
    }

    fn threshold_pool() -> Vec<TrainingSample> {
        (0..=40)
            .map(|step| {
                let average = step as f64 * 0.5;
                sample(average, u8::from(average <= 12.0))
            })
            .collect()
    }

    #[test]
    fn clean_threshold_is_learned_with_one_split() {
        let tree = DecisionTree::fit(&threshold_pool(), 3).unwrap();
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.n_leaves(), 2);
        assert_eq!(tree.predict(12.0), 1);
        assert_eq!(tree.predict(12.2), 1);
        assert_eq!(tree.predict(12.3), 0);
        assert_eq!(tree.predict_batch(&[0.0, 18.33, -3.0, 25.0]), vec![1, 0, 1, 0]);
    }

    #[test]
    fn depth_never_exceeds_limit() {
        let pool: Vec<_> = (0..64).map(|i| sample(i as f64, (i % 2) as u8)).collect();
        let tree = DecisionTree::fit(&pool, 3).unwrap();
        assert!(tree.depth() <= 3);
        assert!(tree.n_leaves() <= 8);
    }

    #[test]
    fn identical_averages_cannot_be_split_and_ties_go_to_zero() {
        let tree = DecisionTree::fit(&[sample(5.0, 0), sample(5.0, 1)], 3).unwrap();
        assert_eq!(tree.n_nodes(), 1);
        assert_eq!(tree.predict(5.0), 0);
    }

    #[test]
    fn zero_gain_cut_leaves_the_node_a_leaf() {
        // Both sides of the only cut keep the parent's 50/50 mix.
        let pool = [sample(1.0, 0), sample(1.0, 1), sample(2.0, 0), sample(2.0, 1)];
        let tree = DecisionTree::fit(&pool, 3).unwrap();
        assert_eq!(tree.n_nodes(), 1);
        assert_eq!(tree.predict_batch(&[1.0, 2.0]), vec![0, 0]);
    }

    #[test]
    fn split_takes_ceiling_of_test_fraction() {
        let pool = threshold_pool();
        let (train, test) = train_test_split(&pool[..12], 0.2, 42);
        assert_eq!(test.len(), 3);
        assert_eq!(train.len(), 9);

        let (train, test) = train_test_split(&pool[..2], 0.2, 42);
        assert_eq!((train.len(), test.len()), (1, 1));
    }

    #[test]
    fn split_is_a_permutation_of_the_pool() {
        let pool = threshold_pool();
        let (train, test) = train_test_split(&pool, 0.2, 42);
        let mut seen: Vec<f64> = train.iter().chain(&test).map(|s| s.average).collect();
        seen.sort_by(f64::total_cmp);
        let expected: Vec<f64> = pool.iter().map(|s| s.average).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn fitting_is_deterministic_for_a_seed() {
        let pool = threshold_pool();
        let config = PipelineConfig::default();
        let first = fit_risk_model(&pool, &config).unwrap();
        let second = fit_risk_model(&pool, &config).unwrap();
        assert_eq!(first.accuracy, second.accuracy);
        assert_eq!(first.tree, second.tree);
        for s in &pool {
            assert_eq!(first.predict(s.average), second.predict(s.average));
        }
    }

    #[test]
    fn clean_pool_scores_full_accuracy() {
        let model = fit_risk_model(&threshold_pool(), &PipelineConfig::default()).unwrap();
        assert_eq!(model.test_size, 9);
        assert_eq!(model.train_size, 32);
        assert!(model.accuracy > 0.8);
    }

    #[test]
    fn too_few_samples_or_one_class_is_insufficient() {
        let config = PipelineConfig::default();
        assert!(matches!(
            fit_risk_model(&[sample(3.0, 1)], &config),
            Err(PipelineError::InsufficientTrainingData(_))
        ));
        let one_class = vec![sample(15.0, 0), sample(18.0, 0), sample(19.0, 0)];
        assert!(matches!(
            fit_risk_model(&one_class, &config),
            Err(PipelineError::InsufficientTrainingData(_))
        ));
    }
}
