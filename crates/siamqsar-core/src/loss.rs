//! 複合損失（タスク損失 + 対照損失）
//!
//! - タスク損失: 回帰はスケール済み目的変数での MSE、分類はロジットに対する BCE
//! - 対照損失: `sigmoid(cos(e_q, e_r) / temperature)` とペア目標の BCE
//! - `Total = w_task * task + w_cl * CL`
//!
//! 逆伝播用に、出力と両埋め込みに対する勾配（`Total` の勾配）も返す。

use crate::config::{DatasetType, LossWeights};
use crate::metrics::LossRecord;

/// 対照損失の確率クリップ
const PROB_EPS: f32 = 1e-7;
/// コサイン類似度のノルム下限
const NORM_EPS: f32 = 1e-8;

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// ペア1件分の勾配
#[derive(Clone, Debug, PartialEq)]
pub struct PairGrad {
    pub output: f32,
    pub e_q: Vec<f32>,
    pub e_r: Vec<f32>,
}

/// バッチの損失と勾配
#[derive(Clone, Debug)]
pub struct LossOutput {
    pub record: LossRecord,
    pub grads: Vec<PairGrad>,
}

#[derive(Clone, Copy, Debug)]
pub struct CompositeLoss {
    pub dataset_type: DatasetType,
    pub weights: LossWeights,
    pub temperature: f32,
}

impl CompositeLoss {
    pub fn new(dataset_type: DatasetType, weights: LossWeights, temperature: f32) -> Self {
        Self {
            dataset_type,
            weights,
            temperature,
        }
    }

    /// ペアの整合性目標（回帰は `exp(-|y_q - y_r|)`、分類は同じクラスなら 1）
    pub fn pair_target(&self, y_q: f32, y_r: f32) -> f32 {
        match self.dataset_type {
            DatasetType::Regression => (-(y_q - y_r).abs()).exp(),
            DatasetType::Classification => {
                if (y_q >= 0.5) == (y_r >= 0.5) {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// バッチの損失を計算する
    ///
    /// `predictions` は回帰値またはロジット、`targets` はスケール済み目的変数。
    pub fn forward(
        &self,
        predictions: &[f32],
        targets: &[f32],
        e_q: &[&[f32]],
        e_r: &[&[f32]],
        pair_targets: &[f32],
    ) -> LossOutput {
        let n = predictions.len();
        debug_assert_eq!(targets.len(), n);
        debug_assert_eq!(e_q.len(), n);
        debug_assert_eq!(e_r.len(), n);
        debug_assert_eq!(pair_targets.len(), n);
        if n == 0 {
            return LossOutput {
                record: LossRecord::default(),
                grads: Vec::new(),
            };
        }
        let inv_n = 1.0 / n as f32;
        let w_task = self.weights.task;
        let w_cl = self.weights.contrastive;

        let mut task_sum = 0.0f64;
        let mut cl_sum = 0.0f64;
        let mut grads = Vec::with_capacity(n);

        for i in 0..n {
            let (task, d_task) = match self.dataset_type {
                DatasetType::Regression => {
                    let diff = predictions[i] - targets[i];
                    (diff * diff, 2.0 * diff)
                }
                DatasetType::Classification => {
                    let z = predictions[i];
                    let t = targets[i];
                    let l = z.max(0.0) - z * t + (1.0 + (-z.abs()).exp()).ln();
                    (l, sigmoid(z) - t)
                }
            };
            task_sum += task as f64;

            let (cl, d_a, d_b) = self.contrastive(e_q[i], e_r[i], pair_targets[i]);
            cl_sum += cl as f64;

            let scale = w_cl * inv_n;
            grads.push(PairGrad {
                output: w_task * d_task * inv_n,
                e_q: d_a.into_iter().map(|g| g * scale).collect(),
                e_r: d_b.into_iter().map(|g| g * scale).collect(),
            });
        }

        let task = task_sum / n as f64;
        let cl = cl_sum / n as f64;
        let (mse, cls) = match self.dataset_type {
            DatasetType::Regression => (task, 0.0),
            DatasetType::Classification => (0.0, task),
        };
        LossOutput {
            record: LossRecord {
                total: w_task as f64 * task + w_cl as f64 * cl,
                mse,
                cls,
                cl,
            },
            grads,
        }
    }

    /// 対照損失1件分と、2つの埋め込みに対する勾配
    fn contrastive(&self, a: &[f32], b: &[f32], target: f32) -> (f32, Vec<f32>, Vec<f32>) {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na = a.iter().map(|x| x * x).sum::<f32>().sqrt().max(NORM_EPS);
        let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt().max(NORM_EPS);
        let cos = dot / (na * nb);

        let raw = sigmoid(cos / self.temperature);
        let p = raw.clamp(PROB_EPS, 1.0 - PROB_EPS);
        let loss = -(target * p.ln() + (1.0 - target) * (1.0 - p).ln());

        // クリップされた領域では勾配 0
        let d_cos = if raw > PROB_EPS && raw < 1.0 - PROB_EPS {
            (p - target) / self.temperature
        } else {
            0.0
        };
        let d_a = a
            .iter()
            .zip(b)
            .map(|(&x, &y)| d_cos * (y / (na * nb) - cos * x / (na * na)))
            .collect();
        let d_b = a
            .iter()
            .zip(b)
            .map(|(&x, &y)| d_cos * (x / (na * nb) - cos * y / (nb * nb)))
            .collect();
        (loss, d_a, d_b)
    }
}
