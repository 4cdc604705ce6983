//! Points attribution model
//!
//! Ordinary least squares of final points on the four race metrics. Each
//! predictor is z-scored (population standard deviation) before the fit, so
//! coefficients are comparable: points per standard deviation of the metric.
//!
//! The fit is a pure function of its input rows. Nothing is persisted.

use crate::config::FitConfig;
use crate::core::stats::{mean, population_std};
use crate::data::dataset::{DatasetFilter, MasterDataset};
use crate::data::features::Metric;
use crate::error::ErrorKind;
use crate::models::FeatureRow;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Predictor columns in model order
pub const PREDICTORS: [Metric; 4] = [
    Metric::TopSpeed,
    Metric::Degradation,
    Metric::PositionsGained,
    Metric::Consistency,
];

const PIVOT_EPS: f64 = 1e-10;

#[derive(Debug, Error)]
pub enum FitError {
    #[error("Need at least {required} rows to fit, have {rows}")]
    InsufficientData { rows: usize, required: usize },

    #[error("Predictors are collinear; cannot separate their effects")]
    Singular,
}

impl FitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FitError::InsufficientData { .. } => ErrorKind::InsufficientData,
            FitError::Singular => ErrorKind::DegenerateFit,
        }
    }
}

fn predictor_value(row: &FeatureRow, metric: Metric) -> f64 {
    match metric {
        Metric::TopSpeed => row.top_speed_st,
        Metric::Degradation => row.avg_degradation,
        Metric::PositionsGained => row.positions_gained as f64,
        Metric::Consistency => row.avg_consistency,
    }
}

/// One fitted predictor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coefficient {
    pub predictor: String,
    /// Points per standard deviation of the predictor
    pub standardized: f64,
    pub mean: f64,
    /// Population std used for scaling (1.0 for a constant column)
    pub std: f64,
}

impl Coefficient {
    /// Points per unit of the predictor
    pub fn raw(&self) -> f64 {
        self.standardized / self.std
    }
}

/// Fitted attribution model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionModel {
    pub coefficients: Vec<Coefficient>,
    /// Intercept on the standardized scale (mean of the response)
    pub intercept: f64,
    /// Coefficient of determination; `None` when the response is constant
    pub r_squared: Option<f64>,
    pub n_rows: usize,
}

impl AttributionModel {
    pub fn predictor_names(&self) -> Vec<&str> {
        self.coefficients.iter().map(|c| c.predictor.as_str()).collect()
    }

    pub fn coefficient(&self, metric: Metric) -> Option<&Coefficient> {
        let name = metric.to_string();
        self.coefficients.iter().find(|c| c.predictor == name)
    }

    /// Intercept for unscaled predictors
    pub fn raw_intercept(&self) -> f64 {
        self.intercept
            - self
                .coefficients
                .iter()
                .map(|c| c.raw() * c.mean)
                .sum::<f64>()
    }

    /// Predicted points for a row
    pub fn predict(&self, row: &FeatureRow) -> f64 {
        let mut points = self.intercept;
        for (c, metric) in self.coefficients.iter().zip(PREDICTORS) {
            points += c.standardized * (predictor_value(row, metric) - c.mean) / c.std;
        }
        points
    }

    /// Predictors ordered by absolute standardized effect, largest first
    pub fn ranked(&self) -> Vec<&Coefficient> {
        let mut ranked: Vec<&Coefficient> = self.coefficients.iter().collect();
        ranked.sort_by(|a, b| b.standardized.abs().total_cmp(&a.standardized.abs()));
        ranked
    }
}

/// Stateless fitter over dataset snapshots
#[derive(Debug, Clone, Default)]
pub struct AttributionFitter {
    config: FitConfig,
}

impl AttributionFitter {
    pub fn new(config: FitConfig) -> Self {
        Self { config }
    }

    /// Fit on the rows of `snapshot` selected by `filter`
    pub fn fit(
        &self,
        snapshot: &MasterDataset,
        filter: &DatasetFilter,
    ) -> Result<AttributionModel, FitError> {
        self.fit_rows(snapshot.filtered(filter))
    }

    pub fn fit_rows<'a, I>(&self, rows: I) -> Result<AttributionModel, FitError>
    where
        I: IntoIterator<Item = &'a FeatureRow>,
    {
        let rows: Vec<&FeatureRow> = rows.into_iter().collect();
        let n = rows.len();
        if n < self.config.min_rows {
            return Err(FitError::InsufficientData {
                rows: n,
                required: self.config.min_rows,
            });
        }

        let y: Vec<f64> = rows.iter().map(|r| r.final_points).collect();
        let y_mean = mean(&y).ok_or(FitError::InsufficientData {
            rows: n,
            required: self.config.min_rows,
        })?;

        // Standardized design matrix, column-major
        let mut columns = Vec::with_capacity(PREDICTORS.len());
        let mut scales = Vec::with_capacity(PREDICTORS.len());
        for metric in PREDICTORS {
            let raw: Vec<f64> = rows.iter().map(|r| predictor_value(r, metric)).collect();
            let m = mean(&raw).unwrap_or(0.0);
            let constant = raw.iter().all(|v| *v == raw[0]);
            let s = match population_std(&raw) {
                Some(s) if s > 0.0 && !constant => s,
                _ => 1.0,
            };
            if constant {
                columns.push(vec![0.0; n]);
            } else {
                columns.push(raw.iter().map(|v| (v - m) / s).collect::<Vec<f64>>());
            }
            scales.push((m, s));
        }

        // A constant column is all zeros after centering; it gets a zero
        // coefficient and stays out of the normal equations.
        let active: Vec<usize> = (0..columns.len())
            .filter(|&j| columns[j].iter().any(|v| v.abs() > 0.0))
            .collect();

        let k = active.len();
        let mut xtx = vec![vec![0.0; k]; k];
        let mut xty = vec![0.0; k];
        for (a, &ja) in active.iter().enumerate() {
            for (b, &jb) in active.iter().enumerate() {
                xtx[a][b] = dot(&columns[ja], &columns[jb]);
            }
            xty[a] = columns[ja]
                .iter()
                .zip(&y)
                .map(|(x, yv)| x * (yv - y_mean))
                .sum();
        }

        let solution = solve(xtx, xty).ok_or(FitError::Singular)?;

        let mut standardized = vec![0.0; columns.len()];
        for (a, &j) in active.iter().enumerate() {
            standardized[j] = solution[a];
        }

        let ss_tot: f64 = y.iter().map(|v| (v - y_mean).powi(2)).sum();
        let ss_res: f64 = (0..n)
            .map(|i| {
                let fitted = y_mean
                    + (0..columns.len())
                        .map(|j| standardized[j] * columns[j][i])
                        .sum::<f64>();
                (y[i] - fitted).powi(2)
            })
            .sum();
        let r_squared = (ss_tot > 0.0).then(|| 1.0 - ss_res / ss_tot);

        let coefficients = PREDICTORS
            .iter()
            .zip(standardized)
            .zip(scales)
            .map(|((metric, coef), (m, s))| Coefficient {
                predictor: metric.to_string(),
                standardized: coef,
                mean: m,
                std: s,
            })
            .collect();

        tracing::debug!("Fitted attribution model on {} rows", n);

        Ok(AttributionModel {
            coefficients,
            intercept: y_mean,
            r_squared,
            n_rows: n,
        })
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Solve `a x = b` by Gaussian elimination with partial pivoting
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    let scale = a
        .iter()
        .flat_map(|r| r.iter())
        .fold(0.0_f64, |acc, v| acc.max(v.abs()))
        .max(1.0);

    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < PIVOT_EPS * scale {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}
