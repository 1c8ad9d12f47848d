//! Isolation-Forest-with-Moving-Average: fits an isolation forest over the
//! numeric metric columns as a multivariate sample, then gates each
//! anomalous row against its trailing moving average per metric.

use crate::engine::AlgorithmOptions;
use crate::model::{AssembledTable, ChangePoint, ComparativeStats, Direction, MetricSpec};

use super::{AnalysisResult, ChangePointAlgorithm, EngineError};

const NUM_TREES: usize = 100;
const SUBSAMPLE_SIZE: usize = 256;
/// Rows scoring above this are treated as anomalous (0.5 is the standard
/// isolation-forest threshold from Liu, Ting & Zhou 2008).
const ANOMALY_SCORE_THRESHOLD: f64 = 0.5;

pub struct IsolationForestMovingAverage {
    options: AlgorithmOptions,
}

impl IsolationForestMovingAverage {
    pub fn new(options: AlgorithmOptions) -> Self {
        Self { options }
    }
}

impl ChangePointAlgorithm for IsolationForestMovingAverage {
    fn analyze(&self, table: &AssembledTable, metrics: &[MetricSpec]) -> Result<AnalysisResult, EngineError> {
        if table.is_empty() {
            return Err(EngineError::EmptyInput);
        }

        let columns: Vec<String> = metrics.iter().map(|m| m.column_name()).collect();

        // Null cells break the model; drop rows with any missing metric
        // value before fitting (§4.2 edge cases).
        let mut dense_rows: Vec<usize> = Vec::new();
        let mut samples: Vec<Vec<f64>> = Vec::new();
        for (i, row) in table.rows.iter().enumerate() {
            let values: Option<Vec<f64>> = columns.iter().map(|c| row.metrics.get(c).copied().flatten()).collect();
            if let Some(values) = values {
                dense_rows.push(i);
                samples.push(values);
            }
        }

        if samples.len() < 2 {
            return Ok(AnalysisResult::default());
        }

        let forest = IsolationForest::fit(&samples);
        let scores = forest.score_all(&samples);

        let mut result = AnalysisResult::default();

        for (metric, column) in metrics.iter().zip(columns.iter()) {
            let series = table.column_values(column);
            let window = self.options.anomaly_window.max(1);
            let mut points = Vec::new();

            for (sample_idx, &row_idx) in dense_rows.iter().enumerate() {
                if scores[sample_idx] <= ANOMALY_SCORE_THRESHOLD {
                    continue;
                }
                if row_idx == 0 {
                    continue;
                }
                let Some(current) = series[row_idx] else { continue };
                let start = row_idx.saturating_sub(window);
                let trailing = &series[start..row_idx];
                let trailing_mean = {
                    let present: Vec<f64> = trailing.iter().filter_map(|v| *v).collect();
                    if present.is_empty() {
                        continue;
                    }
                    present.iter().sum::<f64>() / present.len() as f64
                };
                if trailing_mean == 0.0 {
                    continue;
                }

                let pct_change = (current - trailing_mean) / trailing_mean.abs() * 100.0;
                if pct_change.abs() <= self.options.min_anomaly_percent {
                    continue;
                }
                if metric.direction != 0 && sign(pct_change) != metric.direction {
                    continue;
                }

                points.push(ChangePoint {
                    metric: column.clone(),
                    index: row_idx,
                    time: table.rows[row_idx].timestamp,
                    stats: ComparativeStats {
                        mean_before: trailing_mean,
                        mean_after: current,
                        std_before: 0.0,
                        std_after: 0.0,
                        p_value: 1.0,
                    },
                });
            }

            if !points.is_empty() {
                result.change_points.insert(column.clone(), points);
            }
        }

        Ok(result)
    }
}

fn sign(v: f64) -> Direction {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}

/// A minimal isolation forest: `NUM_TREES` randomized isolation trees over
/// bootstrap subsamples, scored per Liu et al.'s path-length normalization.
struct IsolationForest {
    trees: Vec<IsolationTree>,
    subsample_size: usize,
}

enum IsolationTree {
    Leaf { size: usize },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<IsolationTree>,
        right: Box<IsolationTree>,
    },
}

impl IsolationForest {
    fn fit(samples: &[Vec<f64>]) -> Self {
        let subsample_size = samples.len().min(SUBSAMPLE_SIZE);
        let max_depth = (subsample_size.max(2) as f64).log2().ceil() as usize;
        let mut rng = SplitMix64::new(0x5eed_f00d_cafe_babe);

        let trees = (0..NUM_TREES)
            .map(|_| {
                let subsample = bootstrap_sample(samples, subsample_size, &mut rng);
                IsolationTree::build(&subsample, 0, max_depth, &mut rng)
            })
            .collect();

        Self { trees, subsample_size }
    }

    fn score_all(&self, samples: &[Vec<f64>]) -> Vec<f64> {
        let c = average_path_length(self.subsample_size);
        samples
            .iter()
            .map(|sample| {
                let avg_depth = self
                    .trees
                    .iter()
                    .map(|t| t.path_length(sample, 0))
                    .sum::<f64>()
                    / self.trees.len() as f64;
                if c <= 0.0 {
                    0.0
                } else {
                    2f64.powf(-avg_depth / c)
                }
            })
            .collect()
    }
}

impl IsolationTree {
    fn build(samples: &[Vec<f64>], depth: usize, max_depth: usize, rng: &mut SplitMix64) -> Self {
        if samples.len() <= 1 || depth >= max_depth {
            return IsolationTree::Leaf { size: samples.len() };
        }

        let num_features = samples[0].len();
        let feature = (rng.next_u64() as usize) % num_features;

        let (min, max) = samples.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
            (lo.min(s[feature]), hi.max(s[feature]))
        });
        if !(min < max) {
            return IsolationTree::Leaf { size: samples.len() };
        }

        let threshold = min + rng.next_unit() * (max - min);
        let (left, right): (Vec<_>, Vec<_>) = samples.iter().cloned().partition(|s| s[feature] < threshold);
        if left.is_empty() || right.is_empty() {
            return IsolationTree::Leaf { size: samples.len() };
        }

        IsolationTree::Split {
            feature,
            threshold,
            left: Box::new(IsolationTree::build(&left, depth + 1, max_depth, rng)),
            right: Box::new(IsolationTree::build(&right, depth + 1, max_depth, rng)),
        }
    }

    fn path_length(&self, sample: &[f64], depth: usize) -> f64 {
        match self {
            IsolationTree::Leaf { size } => depth as f64 + average_path_length(*size),
            IsolationTree::Split { feature, threshold, left, right } => {
                if sample[*feature] < *threshold {
                    left.path_length(sample, depth + 1)
                } else {
                    right.path_length(sample, depth + 1)
                }
            }
        }
    }
}

/// Average unsuccessful-search path length in a binary search tree of `n`
/// nodes (the isolation-forest normalization constant).
fn average_path_length(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    2.0 * (harmonic(n - 1.0)) - (2.0 * (n - 1.0) / n)
}

fn harmonic(n: f64) -> f64 {
    // H(n) ~= ln(n) + gamma
    const EULER_MASCHERONI: f64 = 0.5772156649;
    n.ln() + EULER_MASCHERONI
}

fn bootstrap_sample(samples: &[Vec<f64>], size: usize, rng: &mut SplitMix64) -> Vec<Vec<f64>> {
    (0..size)
        .map(|_| samples[(rng.next_u64() as usize) % samples.len()].clone())
        .collect()
}

/// A tiny deterministic PRNG (SplitMix64) so the forest's randomization is
/// reproducible without pulling in a dependency the teacher doesn't carry.
struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }

    fn next_unit(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_path_length_is_zero_for_trivial_sizes() {
        assert_eq!(average_path_length(0), 0.0);
        assert_eq!(average_path_length(1), 0.0);
    }

    #[test]
    fn forest_scores_outlier_higher_than_inliers() {
        let mut samples: Vec<Vec<f64>> = (0..40).map(|i| vec![100.0 + (i % 3) as f64]).collect();
        samples.push(vec![500.0]);
        let forest = IsolationForest::fit(&samples);
        let scores = forest.score_all(&samples);
        let outlier_score = *scores.last().unwrap();
        let inlier_avg = scores[..scores.len() - 1].iter().sum::<f64>() / (scores.len() - 1) as f64;
        assert!(outlier_score > inlier_avg);
    }

    #[test]
    fn sign_matches_expected_direction() {
        assert_eq!(sign(5.0), 1);
        assert_eq!(sign(-5.0), -1);
        assert_eq!(sign(0.0), 0);
    }
}
