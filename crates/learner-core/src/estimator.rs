//! The closed set of trainable estimators and the fold-based validation
//! protocol used to select and score them.
//!
//! Models are plain data so the trained artifact round-trips through serde:
//! a sparse linear regressor, an AdaBoost stump classifier, and a gradient
//! boosted stump regressor. Each reads named features and carries only the
//! variables that survived its pruning pass.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::features::{is_continuous, FeatureTable};

const WEIGHT_EPSILON: f64 = 1e-3;
const IMPORTANCE_EPSILON: f64 = 1e-3;
const CLASSIFIER_ROUNDS: usize = 24;
const REGRESSOR_ROUNDS: usize = 48;
const REGRESSOR_SHRINKAGE: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum Model {
    Linear(LinearModel),
    BoostClassifier(BoostClassifier),
    BoostRegressor(BoostRegressor),
}

impl Model {
    pub fn fit_linear(rows: &[BTreeMap<String, f64>], targets: &[f64]) -> Self {
        Self::Linear(LinearModel::fit(rows, targets))
    }

    pub fn fit_boost_classifier(rows: &[BTreeMap<String, f64>], labels: &[bool]) -> Self {
        Self::BoostClassifier(BoostClassifier::fit(rows, labels))
    }

    pub fn fit_boost_regressor(rows: &[BTreeMap<String, f64>], targets: &[f64]) -> Self {
        Self::BoostRegressor(BoostRegressor::fit(rows, targets))
    }

    /// Point estimate for regressors, positive-class probability for
    /// classifiers. Unknown variables read as zero.
    pub fn estimate(&self, row: &BTreeMap<String, f64>) -> f64 {
        match self {
            Self::Linear(model) => model.estimate(row),
            Self::BoostClassifier(model) => model.estimate(row),
            Self::BoostRegressor(model) => model.estimate(row),
        }
    }
}

/// A trained model together with its cross-validated quality, when the
/// validation protocol produced any usable folds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictorRecord {
    pub model: Model,
    pub quality: Option<f64>,
}

/// Least squares over min/max-normalized continuous features, with small
/// weights pruned away afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinearModel {
    pub variables: Vec<String>,
    pub ranges: Vec<(f64, f64)>,
    pub y_range: (f64, f64),
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl LinearModel {
    pub fn fit(rows: &[BTreeMap<String, f64>], targets: &[f64]) -> Self {
        let table = FeatureTable::from_rows(rows);
        let kept: Vec<usize> = table
            .variables
            .iter()
            .enumerate()
            .filter(|(_, variable)| is_continuous(variable))
            .map(|(index, _)| index)
            .collect();

        let mut variables = Vec::with_capacity(kept.len());
        let mut ranges = Vec::with_capacity(kept.len());
        for index in &kept {
            let column: Vec<f64> = table.rows.iter().map(|row| row[*index]).collect();
            let low = column.iter().copied().fold(f64::INFINITY, f64::min);
            let high = column.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            variables.push(table.variables[*index].clone());
            ranges.push((low, high - low));
        }

        let (y_low, y_high) = targets.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY),
            |(low, high), value| (low.min(*value), high.max(*value)),
        );
        let y_range = (y_low, y_high - y_low);

        let mut model = Self {
            variables,
            ranges,
            y_range,
            weights: Vec::new(),
            bias: 0.0,
        };

        if table.rows.is_empty() || model.variables.is_empty() {
            return model;
        }

        let width = model.variables.len() + 1;
        let mut normal = vec![vec![0.0; width]; width];
        let mut moments = vec![0.0; width];
        for (row, target) in table.rows.iter().zip(targets) {
            let mut features: Vec<f64> = kept
                .iter()
                .enumerate()
                .map(|(position, index)| normalize(row[*index], model.ranges[position]))
                .collect();
            features.push(1.0);
            let y = normalize(*target, model.y_range);
            for i in 0..width {
                for j in 0..width {
                    normal[i][j] += features[i] * features[j];
                }
                moments[i] += features[i] * y;
            }
        }
        for (i, diagonal) in normal.iter_mut().enumerate() {
            diagonal[i] += 1e-8;
        }

        let Some(solution) = solve_linear_system(normal, moments) else {
            return model;
        };
        model.bias = solution[width - 1];
        model.weights = solution[..width - 1].to_vec();
        model.prune();
        model
    }

    fn prune(&mut self) {
        let mut variables = Vec::new();
        let mut ranges = Vec::new();
        let mut weights = Vec::new();
        for ((variable, range), weight) in self
            .variables
            .iter()
            .zip(self.ranges.iter())
            .zip(self.weights.iter())
        {
            if weight.abs() >= WEIGHT_EPSILON {
                variables.push(variable.clone());
                ranges.push(*range);
                weights.push(*weight);
            }
        }
        self.variables = variables;
        self.ranges = ranges;
        self.weights = weights;
    }

    pub fn estimate(&self, row: &BTreeMap<String, f64>) -> f64 {
        let normalized = self.bias
            + self
                .variables
                .iter()
                .zip(self.ranges.iter())
                .zip(self.weights.iter())
                .map(|((variable, range), weight)| {
                    weight * normalize(row.get(variable).copied().unwrap_or(0.0), *range)
                })
                .sum::<f64>();
        normalized * self.y_range.1 + self.y_range.0
    }
}

fn normalize(value: f64, (base, scale): (f64, f64)) -> f64 {
    if scale == 0.0 {
        0.0
    } else {
        (value - base) / scale
    }
}

fn solve_linear_system(mut matrix: Vec<Vec<f64>>, mut rhs: Vec<f64>) -> Option<Vec<f64>> {
    let size = rhs.len();
    for column in 0..size {
        let pivot = (column..size).max_by(|a, b| matrix[*a][column].abs().total_cmp(&matrix[*b][column].abs()))?;
        if matrix[pivot][column].abs() < 1e-12 {
            return None;
        }
        matrix.swap(column, pivot);
        rhs.swap(column, pivot);
        for row in column + 1..size {
            let factor = matrix[row][column] / matrix[column][column];
            for k in column..size {
                matrix[row][k] -= factor * matrix[column][k];
            }
            rhs[row] -= factor * rhs[column];
        }
    }

    let mut solution = vec![0.0; size];
    for column in (0..size).rev() {
        let mut sum = rhs[column];
        for k in column + 1..size {
            sum -= matrix[column][k] * solution[k];
        }
        solution[column] = sum / matrix[column][column];
    }
    Some(solution)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightedStump {
    pub variable: String,
    pub threshold: f64,
    pub below: f64,
    pub above: f64,
    pub alpha: f64,
}

impl WeightedStump {
    fn vote(&self, value: f64) -> f64 {
        if value < self.threshold {
            self.below
        } else {
            self.above
        }
    }
}

/// AdaBoost over decision stumps; feature importance prunes unused variables
/// with a single refit pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoostClassifier {
    pub prior: f64,
    pub stumps: Vec<WeightedStump>,
}

impl BoostClassifier {
    pub fn fit(rows: &[BTreeMap<String, f64>], labels: &[bool]) -> Self {
        let table = FeatureTable::from_rows(rows);
        let model = Self::fit_table(&table, labels);

        // drop variables that never mattered and refit once
        let mut importance: BTreeMap<&str, f64> = BTreeMap::new();
        let mut total = 0.0;
        for stump in &model.stumps {
            *importance.entry(stump.variable.as_str()).or_insert(0.0) += stump.alpha;
            total += stump.alpha;
        }
        if total <= 0.0 {
            return model;
        }
        let kept: Vec<String> = importance
            .iter()
            .filter(|(_, alpha)| **alpha >= IMPORTANCE_EPSILON * total)
            .map(|(variable, _)| (*variable).to_string())
            .collect();
        if kept.len() == importance.len() {
            return model;
        }
        let reduced: Vec<BTreeMap<String, f64>> = rows
            .iter()
            .map(|row| {
                row.iter()
                    .filter(|(variable, _)| kept.contains(*variable))
                    .map(|(variable, value)| (variable.clone(), *value))
                    .collect()
            })
            .collect();
        Self::fit_table(&FeatureTable::from_rows(&reduced), labels)
    }

    fn fit_table(table: &FeatureTable, labels: &[bool]) -> Self {
        let count = table.rows.len();
        let positives = labels.iter().filter(|label| **label).count();
        let prior = if count == 0 {
            0.0
        } else {
            positives as f64 / count as f64
        };
        let mut model = Self {
            prior,
            stumps: Vec::new(),
        };
        if count == 0 || positives == 0 || positives == count {
            return model;
        }

        let targets: Vec<f64> = labels
            .iter()
            .map(|label| if *label { 1.0 } else { -1.0 })
            .collect();
        let mut weights = vec![1.0 / count as f64; count];

        for _ in 0..CLASSIFIER_ROUNDS {
            let Some((stump, error)) = best_classification_stump(table, &targets, &weights) else {
                break;
            };
            if error >= 0.5 {
                break;
            }
            let clamped = error.clamp(1e-9, 1.0 - 1e-9);
            let alpha = 0.5 * ((1.0 - clamped) / clamped).ln();
            let stump = WeightedStump { alpha, ..stump };

            let mut norm = 0.0;
            for (index, row) in table.rows.iter().enumerate() {
                let variable_index = table
                    .variables
                    .iter()
                    .position(|variable| *variable == stump.variable)
                    .unwrap_or(0);
                let vote = stump.vote(row[variable_index]);
                weights[index] *= (-alpha * targets[index] * vote).exp();
                norm += weights[index];
            }
            if norm > 0.0 {
                for weight in &mut weights {
                    *weight /= norm;
                }
            }

            let stop = error <= 1e-9;
            model.stumps.push(stump);
            if stop {
                break;
            }
        }
        model
    }

    pub fn estimate(&self, row: &BTreeMap<String, f64>) -> f64 {
        if self.stumps.is_empty() {
            return self.prior;
        }
        let mut margin = 0.0;
        let mut total = 0.0;
        for stump in &self.stumps {
            let value = row.get(&stump.variable).copied().unwrap_or(0.0);
            margin += stump.alpha * stump.vote(value);
            total += stump.alpha;
        }
        if total <= 0.0 {
            return self.prior;
        }
        ((margin / total) + 1.0) / 2.0
    }
}

fn best_classification_stump(
    table: &FeatureTable,
    targets: &[f64],
    weights: &[f64],
) -> Option<(WeightedStump, f64)> {
    let mut best: Option<(WeightedStump, f64)> = None;

    for (variable_index, variable) in table.variables.iter().enumerate() {
        for threshold in candidate_thresholds(table, variable_index) {
            for (below, above) in [(-1.0, 1.0), (1.0, -1.0)] {
                let error: f64 = table
                    .rows
                    .iter()
                    .zip(targets)
                    .zip(weights)
                    .filter(|((row, target), _)| {
                        let vote = if row[variable_index] < threshold {
                            below
                        } else {
                            above
                        };
                        vote != **target
                    })
                    .map(|(_, weight)| *weight)
                    .sum();
                if best
                    .as_ref()
                    .map(|(_, best_error)| error < *best_error)
                    .unwrap_or(true)
                {
                    best = Some((
                        WeightedStump {
                            variable: variable.clone(),
                            threshold,
                            below,
                            above,
                            alpha: 0.0,
                        },
                        error,
                    ));
                }
            }
        }
    }
    best
}

fn candidate_thresholds(table: &FeatureTable, variable_index: usize) -> Vec<f64> {
    let mut values: Vec<f64> = table.rows.iter().map(|row| row[variable_index]).collect();
    values.sort_by(f64::total_cmp);
    values.dedup();
    values
        .windows(2)
        .map(|pair| (pair[0] + pair[1]) / 2.0)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegressionStump {
    pub variable: String,
    pub threshold: f64,
    pub below: f64,
    pub above: f64,
}

impl RegressionStump {
    fn output(&self, value: f64) -> f64 {
        if value < self.threshold {
            self.below
        } else {
            self.above
        }
    }
}

/// Gradient-boosted stumps fitted to residuals, with importance-based
/// variable pruning and a single refit pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoostRegressor {
    pub base: f64,
    pub stumps: Vec<RegressionStump>,
}

impl BoostRegressor {
    pub fn fit(rows: &[BTreeMap<String, f64>], targets: &[f64]) -> Self {
        let table = FeatureTable::from_rows(rows);
        let (model, importance) = Self::fit_table(&table, targets);

        let total: f64 = importance.values().sum();
        if total <= 0.0 {
            return model;
        }
        let kept: Vec<&String> = importance
            .iter()
            .filter(|(_, reduction)| **reduction >= IMPORTANCE_EPSILON * total)
            .map(|(variable, _)| variable)
            .collect();
        if kept.len() == importance.len() {
            return model;
        }
        let reduced: Vec<BTreeMap<String, f64>> = rows
            .iter()
            .map(|row| {
                row.iter()
                    .filter(|(variable, _)| kept.contains(variable))
                    .map(|(variable, value)| (variable.clone(), *value))
                    .collect()
            })
            .collect();
        Self::fit_table(&FeatureTable::from_rows(&reduced), targets).0
    }

    fn fit_table(table: &FeatureTable, targets: &[f64]) -> (Self, BTreeMap<String, f64>) {
        let count = targets.len();
        let base = if count == 0 {
            0.0
        } else {
            targets.iter().sum::<f64>() / count as f64
        };
        let mut model = Self {
            base,
            stumps: Vec::new(),
        };
        let mut importance = BTreeMap::new();
        if count == 0 || table.variables.is_empty() {
            return (model, importance);
        }

        let mut residuals: Vec<f64> = targets.iter().map(|target| target - base).collect();

        for _ in 0..REGRESSOR_ROUNDS {
            let Some((stump, reduction)) = best_regression_stump(table, &residuals) else {
                break;
            };
            if reduction <= 1e-12 {
                break;
            }
            let stump = RegressionStump {
                below: stump.below * REGRESSOR_SHRINKAGE,
                above: stump.above * REGRESSOR_SHRINKAGE,
                ..stump
            };
            let variable_index = table
                .variables
                .iter()
                .position(|variable| *variable == stump.variable)
                .unwrap_or(0);
            for (residual, row) in residuals.iter_mut().zip(table.rows.iter()) {
                *residual -= stump.output(row[variable_index]);
            }
            *importance.entry(stump.variable.clone()).or_insert(0.0) += reduction;
            model.stumps.push(stump);
        }
        (model, importance)
    }

    pub fn estimate(&self, row: &BTreeMap<String, f64>) -> f64 {
        self.base
            + self
                .stumps
                .iter()
                .map(|stump| stump.output(row.get(&stump.variable).copied().unwrap_or(0.0)))
                .sum::<f64>()
    }
}

fn best_regression_stump(
    table: &FeatureTable,
    residuals: &[f64],
) -> Option<(RegressionStump, f64)> {
    let baseline: f64 = residuals.iter().map(|residual| residual * residual).sum();
    let mut best: Option<(RegressionStump, f64)> = None;

    for (variable_index, variable) in table.variables.iter().enumerate() {
        for threshold in candidate_thresholds(table, variable_index) {
            let mut below_sum = 0.0;
            let mut below_count = 0.0;
            let mut above_sum = 0.0;
            let mut above_count = 0.0;
            for (row, residual) in table.rows.iter().zip(residuals) {
                if row[variable_index] < threshold {
                    below_sum += residual;
                    below_count += 1.0;
                } else {
                    above_sum += residual;
                    above_count += 1.0;
                }
            }
            if below_count == 0.0 || above_count == 0.0 {
                continue;
            }
            let below = below_sum / below_count;
            let above = above_sum / above_count;
            let sse: f64 = table
                .rows
                .iter()
                .zip(residuals)
                .map(|(row, residual)| {
                    let prediction = if row[variable_index] < threshold {
                        below
                    } else {
                        above
                    };
                    (residual - prediction) * (residual - prediction)
                })
                .sum();
            let reduction = baseline - sse;
            if best
                .as_ref()
                .map(|(_, best_reduction)| reduction > *best_reduction)
                .unwrap_or(true)
            {
                best = Some((
                    RegressionStump {
                        variable: variable.clone(),
                        threshold,
                        below,
                        above,
                    },
                    reduction,
                ));
            }
        }
    }
    best
}

/// k-fold holdout for classifiers: folds whose train or test slice has no
/// positive examples are skipped; the score is mean F1 over scoring folds.
pub fn validate_classifier(
    rows: &[BTreeMap<String, f64>],
    labels: &[bool],
    folds: usize,
    fit: impl Fn(&[BTreeMap<String, f64>], &[bool]) -> Model,
) -> Option<f64> {
    let count = rows.len();
    if count == 0 {
        return None;
    }
    let step = (count / folds.max(1)).max(1);
    let mut scores = Vec::new();
    let mut offset = 0;

    for _ in 0..folds {
        if offset >= count {
            break;
        }
        let test_range = offset..(offset + step).min(count);
        let train_rows: Vec<BTreeMap<String, f64>> = rows
            .iter()
            .enumerate()
            .filter(|(index, _)| !test_range.contains(index))
            .map(|(_, row)| row.clone())
            .collect();
        let train_labels: Vec<bool> = labels
            .iter()
            .enumerate()
            .filter(|(index, _)| !test_range.contains(index))
            .map(|(_, label)| *label)
            .collect();
        let test_rows = &rows[test_range.clone()];
        let test_labels = &labels[test_range.clone()];
        offset += step;

        if !train_labels.iter().any(|label| *label) || !test_labels.iter().any(|label| *label) {
            continue;
        }

        let model = fit(&train_rows, &train_labels);
        let mut true_positive = 0.0;
        let mut false_positive = 0.0;
        let mut false_negative = 0.0;
        for (row, label) in test_rows.iter().zip(test_labels) {
            let predicted = model.estimate(row) > 0.5;
            match (predicted, *label) {
                (true, true) => true_positive += 1.0,
                (true, false) => false_positive += 1.0,
                (false, true) => false_negative += 1.0,
                (false, false) => {}
            }
        }
        let precision = if true_positive + false_positive > 0.0 {
            true_positive / (true_positive + false_positive)
        } else {
            0.0
        };
        let recall = if true_positive + false_negative > 0.0 {
            true_positive / (true_positive + false_negative)
        } else {
            0.0
        };
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        if f1 != 0.0 {
            scores.push(f1);
        }
    }

    mean(&scores)
}

/// k-fold holdout for regressors: mean absolute error relative to the mean
/// magnitude of the test targets, averaged over folds.
pub fn validate_regressor(
    rows: &[BTreeMap<String, f64>],
    targets: &[f64],
    folds: usize,
    fit: impl Fn(&[BTreeMap<String, f64>], &[f64]) -> Model,
) -> Option<f64> {
    let count = rows.len();
    if count == 0 {
        return None;
    }
    let step = (count / folds.max(1)).max(1);
    let mut errors = Vec::new();
    let mut offset = 0;

    for _ in 0..folds {
        if offset >= count {
            break;
        }
        let test_range = offset..(offset + step).min(count);
        let train_rows: Vec<BTreeMap<String, f64>> = rows
            .iter()
            .enumerate()
            .filter(|(index, _)| !test_range.contains(index))
            .map(|(_, row)| row.clone())
            .collect();
        let train_targets: Vec<f64> = targets
            .iter()
            .enumerate()
            .filter(|(index, _)| !test_range.contains(index))
            .map(|(_, target)| *target)
            .collect();
        let test_rows = &rows[test_range.clone()];
        let test_targets = &targets[test_range.clone()];
        offset += step;

        if train_rows.is_empty() || test_rows.is_empty() {
            continue;
        }

        let model = fit(&train_rows, &train_targets);
        let absolute: f64 = test_rows
            .iter()
            .zip(test_targets)
            .map(|(row, target)| (model.estimate(row) - target).abs())
            .sum::<f64>()
            / test_rows.len() as f64;
        let magnitude =
            test_targets.iter().map(|target| target.abs()).sum::<f64>() / test_targets.len() as f64;
        errors.push(if magnitude > 0.0 {
            absolute / magnitude
        } else {
            absolute
        });
    }

    mean(&errors)
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
