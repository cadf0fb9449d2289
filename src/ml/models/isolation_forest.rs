//! Isolation Forest implementation
//!
//! Anomalies are easier to isolate and thus have shorter path lengths in
//! randomly built partitioning trees. Scores follow the usual convention of
//! a decision function: negative means outlier, with the cut placed so that
//! the configured contamination fraction of the training set falls below 0.

use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::{AnomalyModel, ModelConfig};
use crate::error::{DetectError, Result};

const EULER_GAMMA: f64 = 0.577_215_664_9;

/// Isolation Forest model for anomaly detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    /// Individual isolation trees
    trees: Vec<IsolationTree>,
    /// Number of trees
    num_trees: usize,
    /// Maximum sample size for each tree
    max_samples: usize,
    /// Sample size actually used during fit
    sample_size: usize,
    /// Expected outlier fraction of the training data
    contamination: f64,
    /// Seed for tree construction
    seed: u64,
    /// Raw score cut learned from the training data
    offset: f64,
    /// Average path length normalization factor c(sample_size)
    avg_path_length: f64,
    /// Whether the model is trained
    trained: bool,
}

impl Default for IsolationForest {
    fn default() -> Self {
        Self::new(&ModelConfig::default())
    }
}

impl IsolationForest {
    /// Create a new Isolation Forest
    pub fn new(config: &ModelConfig) -> Self {
        Self::with_params(
            config.num_trees,
            config.max_samples,
            config.contamination,
            config.seed,
        )
    }

    /// Create with custom parameters
    pub fn with_params(num_trees: usize, max_samples: usize, contamination: f64, seed: u64) -> Self {
        Self {
            trees: Vec::new(),
            num_trees: num_trees.max(1),
            max_samples: max_samples.max(2),
            sample_size: 0,
            contamination: contamination.clamp(0.0, 0.5),
            seed,
            offset: -0.5,
            avg_path_length: 0.0,
            trained: false,
        }
    }

    pub fn num_trees(&self) -> usize {
        self.num_trees
    }

    pub fn contamination(&self) -> f64 {
        self.contamination
    }

    /// Calculate average path length for normalization (c(n) function)
    fn average_path_length(n: usize) -> f64 {
        match n {
            0 | 1 => 0.0,
            2 => 1.0,
            _ => {
                let n = n as f64;
                2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
            }
        }
    }

    /// Raw score in [-1, 0]; lower is more anomalous
    pub fn score_samples(&self, sample: &[f64]) -> f64 {
        if self.trees.is_empty() || self.avg_path_length == 0.0 {
            return -0.5;
        }

        let total_path_length: f64 = self.trees.iter().map(|tree| tree.path_length(sample)).sum();
        let avg_path = total_path_length / self.trees.len() as f64;

        -(2.0_f64.powf(-avg_path / self.avg_path_length))
    }
}

impl AnomalyModel for IsolationForest {
    fn fit(&mut self, data: &[Vec<f64>]) -> Result<()> {
        if data.is_empty() {
            return Err(DetectError::InsufficientData {
                required: 1,
                actual: 0,
            });
        }

        let n_features = data[0].len();
        if n_features == 0 {
            return Err(DetectError::InsufficientData {
                required: 1,
                actual: 0,
            });
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        self.sample_size = self.max_samples.min(data.len());
        self.avg_path_length = Self::average_path_length(self.sample_size);
        let max_depth = (self.sample_size as f64).log2().ceil().max(1.0) as usize;

        self.trees.clear();
        for _ in 0..self.num_trees {
            // Sample without replacement
            let sample: Vec<&[f64]> = rand::seq::index::sample(&mut rng, data.len(), self.sample_size)
                .into_iter()
                .map(|idx| data[idx].as_slice())
                .collect();

            let tree = IsolationTree::build(&sample, n_features, max_depth, &mut rng);
            self.trees.push(tree);
        }

        // Place the cut at the contamination quantile of training scores
        let mut scores: Vec<f64> = data.iter().map(|s| self.score_samples(s)).collect();
        if scores.iter().any(|s| !s.is_finite()) {
            return Err(DetectError::Computation(
                "non-finite isolation score during fit".to_string(),
            ));
        }
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        self.offset = percentile(&scores, self.contamination);
        self.trained = true;

        Ok(())
    }

    fn decision_function(&self, sample: &[f64]) -> f64 {
        self.score_samples(sample) - self.offset
    }

    fn predict(&self, sample: &[f64]) -> bool {
        self.decision_function(sample) < 0.0
    }

    fn name(&self) -> &str {
        "IsolationForest"
    }

    fn is_trained(&self) -> bool {
        self.trained
    }
}

/// Linear-interpolated quantile `q` (0..=1) of sorted values
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// A single isolation tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationTree {
    root: IsolationNode,
}

impl IsolationTree {
    /// Build an isolation tree from samples
    fn build<R: Rng>(samples: &[&[f64]], n_features: usize, max_depth: usize, rng: &mut R) -> Self {
        let root = Self::build_node(samples, n_features, 0, max_depth, rng);
        Self { root }
    }

    /// Recursively build tree nodes
    fn build_node<R: Rng>(
        samples: &[&[f64]],
        n_features: usize,
        depth: usize,
        max_depth: usize,
        rng: &mut R,
    ) -> IsolationNode {
        // Terminal conditions
        if depth >= max_depth || samples.len() <= 1 {
            return IsolationNode::Leaf {
                size: samples.len(),
            };
        }

        // Visit features in random order until one still varies in this node
        let mut order: Vec<usize> = (0..n_features).collect();
        order.shuffle(rng);

        for feature_idx in order {
            let (min_val, max_val) = samples.iter().fold((f64::MAX, f64::MIN), |(lo, hi), s| {
                let v = s[feature_idx];
                (lo.min(v), hi.max(v))
            });

            if !(max_val > min_val) {
                continue;
            }

            let split_value = rng.random_range(min_val..max_val);

            let (left_samples, right_samples): (Vec<&[f64]>, Vec<&[f64]>) = samples
                .iter()
                .copied()
                .partition(|s| s[feature_idx] <= split_value);

            let left = Self::build_node(&left_samples, n_features, depth + 1, max_depth, rng);
            let right = Self::build_node(&right_samples, n_features, depth + 1, max_depth, rng);

            return IsolationNode::Internal {
                feature_idx,
                split_value,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        // All features constant, nothing left to isolate
        IsolationNode::Leaf {
            size: samples.len(),
        }
    }

    /// Calculate path length for a sample
    fn path_length(&self, sample: &[f64]) -> f64 {
        let mut node = &self.root;
        let mut depth = 0usize;

        loop {
            match node {
                IsolationNode::Leaf { size } => {
                    // Expected remaining depth for leaves holding several samples
                    return depth as f64 + IsolationForest::average_path_length(*size);
                }
                IsolationNode::Internal {
                    feature_idx,
                    split_value,
                    left,
                    right,
                } => {
                    let val = sample.get(*feature_idx).copied().unwrap_or(0.0);
                    node = if val <= *split_value { left } else { right };
                    depth += 1;
                }
            }
        }
    }
}

/// Node in an isolation tree
#[derive(Debug, Clone, Serialize, Deserialize)]
enum IsolationNode {
    /// Internal node with split
    Internal {
        feature_idx: usize,
        split_value: f64,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
    /// Leaf node
    Leaf { size: usize },
}
