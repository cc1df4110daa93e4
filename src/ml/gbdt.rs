//! Gradient-boosted regression trees.
//!
//! Squared-error boosting with leaf-wise tree growth over histogram-binned
//! features. Leaf weights carry L1 (soft threshold on the gradient sum) and
//! L2 (added to the hessian sum) penalties; rows are re-bagged every
//! `bagging_freq` rounds and a feature subset is drawn for every tree.

use crate::error::{AppError, Result};
use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::Validate;

/// Boosting hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct BoostingParams {
    /// Maximum leaves per tree
    #[serde(default = "default_num_leaves")]
    #[validate(range(min = 2))]
    pub num_leaves: usize,

    /// Maximum tree depth
    #[serde(default = "default_max_depth")]
    #[validate(range(min = 1))]
    pub max_depth: usize,

    /// Shrinkage applied to every leaf
    #[serde(default = "default_learning_rate")]
    #[validate(range(min = 0.0001, max = 1.0))]
    pub learning_rate: f64,

    /// Fraction of features drawn per tree
    #[serde(default = "default_feature_fraction")]
    #[validate(range(min = 0.01, max = 1.0))]
    pub feature_fraction: f64,

    /// Fraction of rows drawn per bag
    #[serde(default = "default_bagging_fraction")]
    #[validate(range(min = 0.01, max = 1.0))]
    pub bagging_fraction: f64,

    /// Re-bag every N rounds (0 disables bagging)
    #[serde(default = "default_bagging_freq")]
    pub bagging_freq: usize,

    /// Minimum rows on each side of a split
    #[serde(default = "default_min_data_in_leaf")]
    #[validate(range(min = 1))]
    pub min_data_in_leaf: usize,

    /// L1 penalty on leaf weights
    #[serde(default = "default_lambda")]
    #[validate(range(min = 0.0))]
    pub lambda_l1: f64,

    /// L2 penalty on leaf weights
    #[serde(default = "default_lambda")]
    #[validate(range(min = 0.0))]
    pub lambda_l2: f64,

    /// Upper bound on boosting rounds
    #[serde(default = "default_num_boost_round")]
    #[validate(range(min = 1))]
    pub num_boost_round: usize,

    /// Stop after this many rounds without improvement (0 disables)
    #[serde(default = "default_early_stopping_rounds")]
    pub early_stopping_rounds: usize,

    /// Histogram bins per feature
    #[serde(default = "default_max_bin")]
    #[validate(range(min = 2, max = 65535))]
    pub max_bin: usize,

    /// Seed for bagging and feature sampling
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for BoostingParams {
    fn default() -> Self {
        Self {
            num_leaves: default_num_leaves(),
            max_depth: default_max_depth(),
            learning_rate: default_learning_rate(),
            feature_fraction: default_feature_fraction(),
            bagging_fraction: default_bagging_fraction(),
            bagging_freq: default_bagging_freq(),
            min_data_in_leaf: default_min_data_in_leaf(),
            lambda_l1: default_lambda(),
            lambda_l2: default_lambda(),
            num_boost_round: default_num_boost_round(),
            early_stopping_rounds: default_early_stopping_rounds(),
            max_bin: default_max_bin(),
            seed: default_seed(),
        }
    }
}

impl BoostingParams {
    /// Hyperparameters as strings, for model metadata
    pub fn describe(&self) -> std::collections::HashMap<String, String> {
        [
            ("num_leaves", self.num_leaves.to_string()),
            ("max_depth", self.max_depth.to_string()),
            ("learning_rate", self.learning_rate.to_string()),
            ("feature_fraction", self.feature_fraction.to_string()),
            ("bagging_fraction", self.bagging_fraction.to_string()),
            ("bagging_freq", self.bagging_freq.to_string()),
            ("min_data_in_leaf", self.min_data_in_leaf.to_string()),
            ("lambda_l1", self.lambda_l1.to_string()),
            ("lambda_l2", self.lambda_l2.to_string()),
            ("num_boost_round", self.num_boost_round.to_string()),
            ("early_stopping_rounds", self.early_stopping_rounds.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

fn default_num_leaves() -> usize {
    31
}

fn default_max_depth() -> usize {
    7
}

fn default_learning_rate() -> f64 {
    0.05
}

fn default_feature_fraction() -> f64 {
    0.9
}

fn default_bagging_fraction() -> f64 {
    0.8
}

fn default_bagging_freq() -> usize {
    5
}

fn default_min_data_in_leaf() -> usize {
    20
}

fn default_lambda() -> f64 {
    0.1
}

fn default_num_boost_round() -> usize {
    100
}

fn default_early_stopping_rounds() -> usize {
    10
}

fn default_max_bin() -> usize {
    255
}

fn default_seed() -> u64 {
    42
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

/// A single regression tree; rows with `x[feature] <= threshold` go left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match &nodes[idx] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }
}

/// Bin upper edges for one feature
#[derive(Debug, Clone)]
struct FeatureBins {
    thresholds: Vec<f64>,
}

impl FeatureBins {
    fn fit(column: ArrayView1<f64>, max_bin: usize) -> Self {
        let mut values: Vec<f64> = column.to_vec();
        values.sort_by(|a, b| a.total_cmp(b));
        values.dedup();

        let thresholds = if values.len() <= max_bin {
            values.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect()
        } else {
            let mut cuts: Vec<f64> = Vec::with_capacity(max_bin - 1);
            for b in 1..max_bin {
                let idx = b * values.len() / max_bin;
                let cut = (values[idx - 1] + values[idx]) / 2.0;
                if cuts.last().map_or(true, |&last| cut > last) {
                    cuts.push(cut);
                }
            }
            cuts
        };

        Self { thresholds }
    }

    fn n_bins(&self) -> usize {
        self.thresholds.len() + 1
    }

    fn bin(&self, x: f64) -> u16 {
        self.thresholds.partition_point(|&t| t < x) as u16
    }
}

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    feature: usize,
    bin: usize,
    threshold: f64,
    gain: f64,
}

struct LeafState {
    node: usize,
    rows: Vec<usize>,
    depth: usize,
    sum_grad: f64,
    best: Option<SplitCandidate>,
}

fn threshold_l1(sum_grad: f64, l1: f64) -> f64 {
    sum_grad.signum() * (sum_grad.abs() - l1).max(0.0)
}

struct TreeBuilder<'a> {
    params: &'a BoostingParams,
    bins: &'a [FeatureBins],
    binned: &'a [Vec<u16>],
    grad: &'a [f64],
}

impl<'a> TreeBuilder<'a> {
    fn leaf_score(&self, sum_grad: f64, count: usize) -> f64 {
        let g = threshold_l1(sum_grad, self.params.lambda_l1);
        g * g / (count as f64 + self.params.lambda_l2)
    }

    fn leaf_output(&self, sum_grad: f64, count: usize) -> f64 {
        -threshold_l1(sum_grad, self.params.lambda_l1) / (count as f64 + self.params.lambda_l2)
    }

    fn best_split_for_feature(
        &self,
        feature: usize,
        rows: &[usize],
        sum_grad: f64,
        parent_score: f64,
    ) -> Option<SplitCandidate> {
        let n_bins = self.bins[feature].n_bins();
        if n_bins < 2 {
            return None;
        }

        let column = &self.binned[feature];
        let mut hist = vec![(0.0_f64, 0_usize); n_bins];
        for &r in rows {
            let slot = &mut hist[column[r] as usize];
            slot.0 += self.grad[r];
            slot.1 += 1;
        }

        let min_data = self.params.min_data_in_leaf;
        let total = rows.len();
        let mut left_grad = 0.0;
        let mut left_count = 0;
        let mut best: Option<SplitCandidate> = None;

        for (bin, &(g, c)) in hist.iter().enumerate().take(n_bins - 1) {
            left_grad += g;
            left_count += c;
            if left_count < min_data || c == 0 {
                continue;
            }
            let right_count = total - left_count;
            if right_count < min_data {
                break;
            }

            let gain = self.leaf_score(left_grad, left_count)
                + self.leaf_score(sum_grad - left_grad, right_count)
                - parent_score;
            if gain > 1e-12 && best.map_or(true, |b| gain > b.gain) {
                best = Some(SplitCandidate {
                    feature,
                    bin,
                    threshold: self.bins[feature].thresholds[bin],
                    gain,
                });
            }
        }

        best
    }

    fn find_best_split(
        &self,
        rows: &[usize],
        sum_grad: f64,
        features: &[usize],
    ) -> Option<SplitCandidate> {
        if rows.len() < 2 * self.params.min_data_in_leaf {
            return None;
        }
        let parent_score = self.leaf_score(sum_grad, rows.len());

        let candidates: Vec<Option<SplitCandidate>> = features
            .par_iter()
            .map(|&f| self.best_split_for_feature(f, rows, sum_grad, parent_score))
            .collect();

        // Ties go to the lowest feature index so training is reproducible.
        candidates
            .into_iter()
            .flatten()
            .fold(None, |best: Option<SplitCandidate>, c| match best {
                Some(b) if b.gain >= c.gain => Some(b),
                _ => Some(c),
            })
    }

    fn new_leaf(&self, node: usize, rows: Vec<usize>, depth: usize, features: &[usize]) -> LeafState {
        let sum_grad: f64 = rows.iter().map(|&r| self.grad[r]).sum();
        let best = if depth < self.params.max_depth {
            self.find_best_split(&rows, sum_grad, features)
        } else {
            None
        };
        LeafState {
            node,
            rows,
            depth,
            sum_grad,
            best,
        }
    }

    /// Grow one tree leaf-wise; returns the tree and the (feature, gain) of every split.
    fn grow(&self, rows: Vec<usize>, features: &[usize]) -> (RegressionTree, Vec<(usize, f64)>) {
        let mut nodes = vec![Node::Leaf { value: 0.0 }];
        let mut leaves = vec![self.new_leaf(0, rows, 0, features)];
        let mut gains = Vec::new();

        while leaves.len() < self.params.num_leaves {
            let pick = leaves
                .iter()
                .enumerate()
                .filter_map(|(i, l)| l.best.map(|b| (i, b.gain)))
                .fold(None, |best: Option<(usize, f64)>, (i, g)| match best {
                    Some((_, bg)) if bg >= g => best,
                    _ => Some((i, g)),
                });
            let Some((idx, _)) = pick else { break };

            let leaf = leaves.swap_remove(idx);
            let Some(split) = leaf.best else { break };

            let column = &self.binned[split.feature];
            let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = leaf
                .rows
                .iter()
                .partition(|&&r| (column[r] as usize) <= split.bin);

            let left = nodes.len();
            nodes.push(Node::Leaf { value: 0.0 });
            let right = nodes.len();
            nodes.push(Node::Leaf { value: 0.0 });
            nodes[leaf.node] = Node::Split {
                feature: split.feature,
                threshold: split.threshold,
                left,
                right,
            };
            gains.push((split.feature, split.gain));

            leaves.push(self.new_leaf(left, left_rows, leaf.depth + 1, features));
            leaves.push(self.new_leaf(right, right_rows, leaf.depth + 1, features));
        }

        for leaf in &leaves {
            nodes[leaf.node] = Node::Leaf {
                value: self.params.learning_rate * self.leaf_output(leaf.sum_grad, leaf.rows.len()),
            };
        }

        (RegressionTree { nodes }, gains)
    }
}

/// Additive tree ensemble fit to squared error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostedTrees {
    init_score: f64,
    trees: Vec<RegressionTree>,
    n_features: usize,
    feature_gain: Vec<f64>,
    best_iteration: usize,
    eval_history: Vec<f64>,
}

impl GradientBoostedTrees {
    /// Fit an ensemble. The training set doubles as the early-stopping validation set.
    pub fn fit(params: &BoostingParams, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<Self> {
        params.validate()?;

        let (n_samples, n_features) = x.dim();
        if n_samples == 0 || n_features == 0 {
            return Err(AppError::InvalidTrainingData(
                "cannot fit an ensemble on an empty matrix".to_string(),
            ));
        }
        if y.len() != n_samples {
            return Err(AppError::InvalidTrainingData(format!(
                "feature rows ({}) and labels ({}) differ in length",
                n_samples,
                y.len()
            )));
        }

        let bins: Vec<FeatureBins> = (0..n_features)
            .map(|f| FeatureBins::fit(x.column(f), params.max_bin))
            .collect();
        let binned: Vec<Vec<u16>> = bins
            .iter()
            .enumerate()
            .map(|(f, b)| x.column(f).iter().map(|&v| b.bin(v)).collect())
            .collect();

        let init_score = y.sum() / n_samples as f64;
        let mut preds = vec![init_score; n_samples];
        let mut grad = vec![0.0; n_samples];
        let mut rng = StdRng::seed_from_u64(params.seed);

        let n_sampled_features = ((n_features as f64 * params.feature_fraction).round() as usize)
            .clamp(1, n_features);
        let bag_size = ((n_samples as f64 * params.bagging_fraction).round() as usize)
            .clamp(1, n_samples);
        let bagging = params.bagging_freq > 0 && bag_size < n_samples;
        let mut bag: Vec<usize> = (0..n_samples).collect();

        let mut trees = Vec::new();
        let mut round_gains: Vec<Vec<(usize, f64)>> = Vec::new();
        let mut eval_history = Vec::new();
        let mut best_rmse = f64::INFINITY;
        let mut best_iteration = 0;

        info!(
            n_samples,
            n_features,
            max_rounds = params.num_boost_round,
            "Fitting gradient boosted trees"
        );

        for round in 0..params.num_boost_round {
            if bagging && round % params.bagging_freq == 0 {
                bag = sample(&mut rng, n_samples, bag_size).into_vec();
                bag.sort_unstable();
            }

            let features: Vec<usize> = if n_sampled_features < n_features {
                let mut f = sample(&mut rng, n_features, n_sampled_features).into_vec();
                f.sort_unstable();
                f
            } else {
                (0..n_features).collect()
            };

            for (g, (&p, &t)) in grad.iter_mut().zip(preds.iter().zip(y.iter())) {
                *g = p - t;
            }

            let builder = TreeBuilder {
                params,
                bins: &bins,
                binned: &binned,
                grad: &grad,
            };
            let (tree, gains) = builder.grow(bag.clone(), &features);

            for (i, p) in preds.iter_mut().enumerate() {
                *p += tree.predict_row(x.row(i));
            }
            let rmse = (preds
                .iter()
                .zip(y.iter())
                .map(|(p, t)| (p - t) * (p - t))
                .sum::<f64>()
                / n_samples as f64)
                .sqrt();

            debug!(round = round + 1, rmse, leaves = tree.n_leaves(), "Boosting round");
            trees.push(tree);
            round_gains.push(gains);
            eval_history.push(rmse);

            if rmse < best_rmse {
                best_rmse = rmse;
                best_iteration = round + 1;
            } else if params.early_stopping_rounds > 0
                && round + 1 - best_iteration >= params.early_stopping_rounds
            {
                info!(
                    round = round + 1,
                    best_iteration, best_rmse, "Early stopping: validation RMSE stalled"
                );
                break;
            }
        }

        trees.truncate(best_iteration);
        round_gains.truncate(best_iteration);

        let mut feature_gain = vec![0.0; n_features];
        for (feature, gain) in round_gains.into_iter().flatten() {
            feature_gain[feature] += gain;
        }

        Ok(Self {
            init_score,
            trees,
            n_features,
            feature_gain,
            best_iteration,
            eval_history,
        })
    }

    /// Raw (unclamped) prediction for one row
    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        self.init_score + self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>()
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Array1<f64> {
        x.rows().into_iter().map(|r| self.predict_row(r)).collect()
    }

    /// Total split gain per feature, in column order
    pub fn feature_gain(&self) -> &[f64] {
        &self.feature_gain
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    pub fn best_iteration(&self) -> usize {
        self.best_iteration
    }

    /// Training RMSE after every round that was run
    pub fn eval_history(&self) -> &[f64] {
        &self.eval_history
    }
}
