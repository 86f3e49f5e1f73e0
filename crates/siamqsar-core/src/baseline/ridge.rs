//! リッジ回帰（0/1 フィンガープリント上の線形モデル）
//!
//! 目的変数は平均で中心化し、切片は正則化しない。
//! サンプル数が次元数以下なら双対形 `(X X^T + λI) a = y` を、
//! それ以外は主形 `(X^T X + λI) w = X^T y` を Cholesky 分解で解く。

use super::{finalize_prediction, BaselineModel, BaselineParams, Fingerprints, PersistFormat};
use crate::config::DatasetType;
use crate::error::{Result, SiamError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_ALPHA: f64 = 1.0;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RidgeRegressor {
    pub alpha: f64,
    pub dataset_type: DatasetType,
    pub dims: usize,
    pub intercept: f64,
    pub weights: Vec<f64>,
}

impl RidgeRegressor {
    pub fn new(params: &BaselineParams) -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            dataset_type: params.dataset_type,
            dims: params.input_dim,
            intercept: 0.0,
            weights: Vec::new(),
        }
    }

    fn predict_one(&self, active: &[usize]) -> f64 {
        let v = self.intercept
            + active
                .iter()
                .filter(|&&i| i < self.dims)
                .map(|&i| self.weights[i])
                .sum::<f64>();
        finalize_prediction(self.dataset_type, v)
    }

    fn fit_dual(&self, rows: &[Vec<usize>], centered: &[f64]) -> std::result::Result<Vec<f64>, String> {
        let n = rows.len();
        // 0/1 ベクトル同士の内積 = 共通インデックス数
        let mut gram = vec![0.0f64; n * n];
        for i in 0..n {
            for j in 0..=i {
                let k = common_count(&rows[i], &rows[j]) as f64;
                gram[i * n + j] = k;
                gram[j * n + i] = k;
            }
            gram[i * n + i] += self.alpha;
        }
        let a = cholesky_solve(&gram, centered, n)?;

        let mut weights = vec![0.0f64; self.dims];
        for (row, &coef) in rows.iter().zip(&a) {
            for &f in row.iter().filter(|&&f| f < self.dims) {
                weights[f] += coef;
            }
        }
        Ok(weights)
    }

    fn fit_primal(&self, rows: &[Vec<usize>], centered: &[f64]) -> std::result::Result<Vec<f64>, String> {
        let d = self.dims;
        let mut xtx = vec![0.0f64; d * d];
        let mut xty = vec![0.0f64; d];
        for (row, &y) in rows.iter().zip(centered) {
            for &i in row.iter().filter(|&&i| i < d) {
                xty[i] += y;
                for &j in row.iter().filter(|&&j| j < d) {
                    xtx[i * d + j] += 1.0;
                }
            }
        }
        for i in 0..d {
            xtx[i * d + i] += self.alpha;
        }
        cholesky_solve(&xtx, &xty, d)
    }
}

/// 昇順インデックス集合の共通要素数
fn common_count(a: &[usize], b: &[usize]) -> usize {
    let (mut i, mut j, mut n) = (0, 0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                n += 1;
                i += 1;
                j += 1;
            }
        }
    }
    n
}

/// 対称正定値行列 `a` (n x n) について `a x = b` を解く
fn cholesky_solve(a: &[f64], b: &[f64], n: usize) -> std::result::Result<Vec<f64>, String> {
    let mut l = vec![0.0f64; n * n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                if sum <= 0.0 {
                    return Err(format!("matrix not positive definite at [{i},{i}] (sum={sum:.6e})"));
                }
                l[i * n + j] = sum.sqrt();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }

    // L z = b
    let mut z = vec![0.0f64; n];
    for i in 0..n {
        let mut sum = b[i];
        for j in 0..i {
            sum -= l[i * n + j] * z[j];
        }
        z[i] = sum / l[i * n + i];
    }

    // L^T x = z
    let mut x = vec![0.0f64; n];
    for i in (0..n).rev() {
        let mut sum = z[i];
        for j in (i + 1)..n {
            sum -= l[j * n + i] * x[j];
        }
        x[i] = sum / l[i * n + i];
    }
    Ok(x)
}

impl BaselineModel for RidgeRegressor {
    fn name(&self) -> &str {
        "Ridge"
    }

    fn persist_format(&self) -> PersistFormat {
        PersistFormat::Serialized
    }

    fn train(&mut self, x: Fingerprints<'_>, y: &[f64], _val: Option<(Fingerprints<'_>, &[f64])>) -> Result<()> {
        if x.len() != y.len() {
            return Err(SiamError::backend(self.name(), format!("{} rows but {} targets", x.len(), y.len())));
        }
        if x.is_empty() {
            return Err(SiamError::backend(self.name(), "empty training set"));
        }
        if x.dims != self.dims {
            return Err(SiamError::DimensionMismatch {
                name: "ridge input".to_string(),
                expected: self.dims,
                actual: x.dims,
            });
        }

        self.intercept = y.iter().sum::<f64>() / y.len() as f64;
        let centered: Vec<f64> = y.iter().map(|v| v - self.intercept).collect();
        let solved = if x.len() <= self.dims {
            self.fit_dual(x.rows, &centered)
        } else {
            self.fit_primal(x.rows, &centered)
        };
        self.weights = solved.map_err(|e| SiamError::backend("Ridge", e))?;
        log::debug!("ridge fitted on {} rows (alpha={})", x.len(), self.alpha);
        Ok(())
    }

    fn predict(&self, x: Fingerprints<'_>) -> Result<Vec<f64>> {
        if self.weights.len() != self.dims {
            return Err(SiamError::backend(self.name(), "model is not trained"));
        }
        Ok(x.rows.iter().map(|r| self.predict_one(r)).collect())
    }

    fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}
