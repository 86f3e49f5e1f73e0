//! 評価指標とメトリクス履歴
//!
//! - 回帰: rmse / mae / r2
//! - 分類: auc / prc-auc / accuracy / cross_entropy
//! - MoleculeACE 準拠の cliff RMSE と、標的ごとの集計（平均 ± 標準偏差）

use crate::config::DatasetType;
use crate::error::{Result, SiamError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// log loss 計算時の確率クリップ
const LOG_LOSS_EPS: f64 = 1e-15;

/// 評価指標
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Metric {
    #[serde(rename = "auc")]
    Auc,
    #[serde(rename = "prc-auc")]
    PrcAuc,
    #[serde(rename = "rmse")]
    Rmse,
    #[serde(rename = "mae")]
    Mae,
    #[serde(rename = "r2")]
    R2,
    #[serde(rename = "accuracy")]
    Accuracy,
    #[serde(rename = "cross_entropy")]
    CrossEntropy,
}

impl Metric {
    pub const ALL: [Metric; 7] = [
        Metric::Auc,
        Metric::PrcAuc,
        Metric::Rmse,
        Metric::Mae,
        Metric::R2,
        Metric::Accuracy,
        Metric::CrossEntropy,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Auc => "auc",
            Self::PrcAuc => "prc-auc",
            Self::Rmse => "rmse",
            Self::Mae => "mae",
            Self::R2 => "r2",
            Self::Accuracy => "accuracy",
            Self::CrossEntropy => "cross_entropy",
        }
    }

    /// 小さいほど良い指標か（メトリクス名から自動的に決まる）
    pub fn minimize(self) -> bool {
        matches!(self, Self::Rmse | Self::Mae | Self::CrossEntropy)
    }

    pub fn supports(self, dataset_type: DatasetType) -> bool {
        match dataset_type {
            DatasetType::Regression => matches!(self, Self::Rmse | Self::Mae | Self::R2),
            DatasetType::Classification => !matches!(self, Self::Rmse | Self::Mae | Self::R2),
        }
    }

    /// 最悪値（best の初期値）
    pub fn worst(self) -> f64 {
        if self.minimize() {
            f64::INFINITY
        } else {
            f64::NEG_INFINITY
        }
    }

    /// `candidate` が `best` より良いか
    pub fn improves(self, candidate: f64, best: f64) -> bool {
        if self.minimize() {
            candidate < best
        } else {
            candidate > best
        }
    }

    /// 予測値を評価する（予測は元の単位、分類では確率）
    pub fn evaluate(self, y_true: &[f64], y_pred: &[f64]) -> f64 {
        match self {
            Self::Rmse => rmse(y_true, y_pred),
            Self::Mae => mae(y_true, y_pred),
            Self::R2 => r2(y_true, y_pred),
            Self::Auc => roc_auc(y_true, y_pred),
            Self::PrcAuc => prc_auc(y_true, y_pred),
            Self::Accuracy => accuracy(y_true, y_pred),
            Self::CrossEntropy => cross_entropy(y_true, y_pred),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = SiamError;

    fn from_str(s: &str) -> Result<Self> {
        Metric::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| SiamError::config(format!("unknown metric `{s}`")))
    }
}

/// 1つの評価結果
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub metric: Metric,
    pub value: f64,
}

impl Score {
    pub fn compute(metric: Metric, y_true: &[f64], y_pred: &[f64]) -> Self {
        Self {
            metric,
            value: metric.evaluate(y_true, y_pred),
        }
    }
}

pub fn rmse(y_true: &[f64], y_pred: &[f64]) -> f64 {
    debug_assert_eq!(y_true.len(), y_pred.len());
    if y_true.is_empty() {
        return f64::NAN;
    }
    let sse: f64 = y_true.iter().zip(y_pred).map(|(t, p)| (t - p) * (t - p)).sum();
    (sse / y_true.len() as f64).sqrt()
}

pub fn mae(y_true: &[f64], y_pred: &[f64]) -> f64 {
    if y_true.is_empty() {
        return f64::NAN;
    }
    let sae: f64 = y_true.iter().zip(y_pred).map(|(t, p)| (t - p).abs()).sum();
    sae / y_true.len() as f64
}

pub fn r2(y_true: &[f64], y_pred: &[f64]) -> f64 {
    if y_true.is_empty() {
        return f64::NAN;
    }
    let mean = y_true.iter().sum::<f64>() / y_true.len() as f64;
    let ss_res: f64 = y_true.iter().zip(y_pred).map(|(t, p)| (t - p) * (t - p)).sum();
    let ss_tot: f64 = y_true.iter().map(|t| (t - mean) * (t - mean)).sum();
    if ss_tot == 0.0 {
        // 定数ターゲット: 完全一致なら 1、それ以外は 0
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

/// MoleculeACE の cliff RMSE
///
/// `cliff_mask` が真の行だけで RMSE を計算する。該当行がなければ NaN。
pub fn cliff_rmse(y_true: &[f64], y_pred: &[f64], cliff_mask: &[bool]) -> f64 {
    debug_assert_eq!(y_true.len(), cliff_mask.len());
    let (t, p): (Vec<f64>, Vec<f64>) = y_true
        .iter()
        .zip(y_pred)
        .zip(cliff_mask)
        .filter(|(_, m)| **m)
        .map(|((t, p), _)| (*t, *p))
        .unzip();
    rmse(&t, &p)
}

/// ROC AUC（Mann-Whitney U、同順位は平均順位）
pub fn roc_auc(y_true: &[f64], y_score: &[f64]) -> f64 {
    let n_pos = y_true.iter().filter(|&&y| y >= 0.5).count();
    let n_neg = y_true.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        log::warn!("roc_auc is undefined with a single class ({n_pos} pos / {n_neg} neg)");
        return f64::NAN;
    }

    let mut order: Vec<usize> = (0..y_score.len()).collect();
    order.sort_by(|&a, &b| y_score[a].total_cmp(&y_score[b]));

    let mut ranks = vec![0.0f64; y_score.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && y_score[order[j + 1]] == y_score[order[i]] {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = avg_rank;
        }
        i = j + 1;
    }

    let pos_rank_sum: f64 = ranks
        .iter()
        .zip(y_true)
        .filter(|(_, y)| **y >= 0.5)
        .map(|(r, _)| r)
        .sum();
    let u = pos_rank_sum - (n_pos * (n_pos + 1)) as f64 / 2.0;
    u / (n_pos as f64 * n_neg as f64)
}

/// PR 曲線下面積（閾値ごとの precision/recall を台形積分）
pub fn prc_auc(y_true: &[f64], y_score: &[f64]) -> f64 {
    let n_pos = y_true.iter().filter(|&&y| y >= 0.5).count();
    if n_pos == 0 {
        log::warn!("prc-auc is undefined without positive samples");
        return f64::NAN;
    }

    let mut order: Vec<usize> = (0..y_score.len()).collect();
    order.sort_by(|&a, &b| y_score[b].total_cmp(&y_score[a]));

    // (recall, precision) を recall 昇順に並べる。始点は (0, 1)。
    let mut points = vec![(0.0f64, 1.0f64)];
    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut i = 0;
    while i < order.len() {
        let threshold = y_score[order[i]];
        while i < order.len() && y_score[order[i]] == threshold {
            if y_true[order[i]] >= 0.5 {
                tp += 1;
            } else {
                fp += 1;
            }
            i += 1;
        }
        let recall = tp as f64 / n_pos as f64;
        let precision = tp as f64 / (tp + fp) as f64;
        points.push((recall, precision));
    }

    points
        .windows(2)
        .map(|w| (w[1].0 - w[0].0) * (w[1].1 + w[0].1) / 2.0)
        .sum()
}

pub fn accuracy(y_true: &[f64], y_prob: &[f64]) -> f64 {
    if y_true.is_empty() {
        return f64::NAN;
    }
    let correct = y_true
        .iter()
        .zip(y_prob)
        .filter(|(t, p)| (**t >= 0.5) == (**p > 0.5))
        .count();
    correct as f64 / y_true.len() as f64
}

pub fn cross_entropy(y_true: &[f64], y_prob: &[f64]) -> f64 {
    if y_true.is_empty() {
        return f64::NAN;
    }
    let total: f64 = y_true
        .iter()
        .zip(y_prob)
        .map(|(t, p)| {
            let p = p.clamp(LOG_LOSS_EPS, 1.0 - LOG_LOSS_EPS);
            -(t * p.ln() + (1.0 - t) * (1.0 - p).ln())
        })
        .sum();
    total / y_true.len() as f64
}

/// 平均と母標準偏差
pub fn summarize(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// 標的1つ分の評価
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TargetScore {
    pub target: String,
    pub rmse: f64,
    pub cliff_rmse: f64,
}

/// 標的横断の集計結果
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CrossTargetSummary {
    pub per_target: Vec<TargetScore>,
    pub rmse_mean: f64,
    pub rmse_std: f64,
    pub cliff_rmse_mean: f64,
    pub cliff_rmse_std: f64,
}

/// 標的ごとの RMSE / cliff RMSE を計算し、平均 ± 標準偏差で集計する
///
/// 標的の順序は最初に出現した順。
pub fn per_target_summary(
    targets: &[String],
    y_true: &[f64],
    y_pred: &[f64],
    cliff_mask: &[bool],
) -> CrossTargetSummary {
    let mut order: Vec<&str> = Vec::new();
    let mut rows: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, t) in targets.iter().enumerate() {
        let entry = rows.entry(t.as_str()).or_default();
        if entry.is_empty() {
            order.push(t.as_str());
        }
        entry.push(i);
    }

    let per_target: Vec<TargetScore> = order
        .iter()
        .map(|&target| {
            let idx = &rows[target];
            let t: Vec<f64> = idx.iter().map(|&i| y_true[i]).collect();
            let p: Vec<f64> = idx.iter().map(|&i| y_pred[i]).collect();
            let m: Vec<bool> = idx.iter().map(|&i| cliff_mask[i]).collect();
            TargetScore {
                target: target.to_string(),
                rmse: rmse(&t, &p),
                cliff_rmse: cliff_rmse(&t, &p, &m),
            }
        })
        .collect();

    let rmses: Vec<f64> = per_target.iter().map(|s| s.rmse).collect();
    let cliffs: Vec<f64> = per_target.iter().map(|s| s.cliff_rmse).collect();
    let (rmse_mean, rmse_std) = summarize(&rmses);
    let (cliff_rmse_mean, cliff_rmse_std) = summarize(&cliffs);
    CrossTargetSummary {
        per_target,
        rmse_mean,
        rmse_std,
        cliff_rmse_mean,
        cliff_rmse_std,
    }
}

/// 1エポック分の損失（学習データ平均）
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LossRecord {
    #[serde(rename = "Total")]
    pub total: f64,
    #[serde(rename = "MSE")]
    pub mse: f64,
    #[serde(rename = "CLS")]
    pub cls: f64,
    #[serde(rename = "CL")]
    pub cl: f64,
}

impl LossRecord {
    pub fn entries(&self) -> [(&'static str, f64); 4] {
        [
            ("Total", self.total),
            ("MSE", self.mse),
            ("CLS", self.cls),
            ("CL", self.cl),
        ]
    }

    /// サンプル数で重み付けして加算
    pub fn accumulate(&mut self, other: &LossRecord, weight: f64) {
        self.total += other.total * weight;
        self.mse += other.mse * weight;
        self.cls += other.cls * weight;
        self.cl += other.cl * weight;
    }

    pub fn scaled(&self, factor: f64) -> LossRecord {
        LossRecord {
            total: self.total * factor,
            mse: self.mse * factor,
            cls: self.cls * factor,
            cl: self.cl * factor,
        }
    }

    /// 有効なタスク損失（回帰なら MSE、分類なら CLS）
    pub fn task(&self, dataset_type: DatasetType) -> f64 {
        match dataset_type {
            DatasetType::Regression => self.mse,
            DatasetType::Classification => self.cls,
        }
    }
}

/// エポック毎のメトリクス履歴
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricHistory {
    pub series: BTreeMap<String, Vec<(usize, f64)>>,
}

impl MetricHistory {
    /// 追跡する系列を空で用意する
    pub fn new(metric: Metric) -> Self {
        let mut series = BTreeMap::new();
        for (name, _) in LossRecord::default().entries() {
            series.insert(format!("train_loss_{name}"), Vec::new());
        }
        series.insert(format!("val_{metric}"), Vec::new());
        series.insert(format!("test_{metric}"), Vec::new());
        Self { series }
    }

    /// 1エポック分の値を全系列に追加する
    pub fn collect_epoch(&mut self, epoch: usize, losses: &LossRecord, val: &Score, test: &Score) {
        for (name, value) in losses.entries() {
            self.push(&format!("train_loss_{name}"), epoch, value);
        }
        self.push(&format!("val_{}", val.metric), epoch, val.value);
        self.push(&format!("test_{}", test.metric), epoch, test.value);
    }

    fn push(&mut self, key: &str, epoch: usize, value: f64) {
        self.series.entry(key.to_string()).or_default().push((epoch, value));
    }

    pub fn get(&self, key: &str) -> Option<&[(usize, f64)]> {
        self.series.get(key).map(Vec::as_slice)
    }

    pub fn epochs(&self) -> usize {
        self.series.values().map(Vec::len).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rmse_and_mae() {
        let y = [1.0, 2.0, 3.0];
        let p = [1.0, 2.0, 5.0];
        assert!((rmse(&y, &p) - (4.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert!((mae(&y, &p) - 2.0 / 3.0).abs() < 1e-12);
        assert!(rmse(&[], &[]).is_nan());
    }

    #[test]
    fn test_cliff_rmse_all_true_mask_equals_rmse() {
        let y = [0.5, 1.5, -2.0, 4.0];
        let p = [0.0, 2.0, -1.0, 3.5];
        let mask = [true; 4];
        assert_eq!(cliff_rmse(&y, &p, &mask), rmse(&y, &p));
    }

    #[test]
    fn test_cliff_rmse_subset() {
        let y = [0.0, 1.0, 2.0];
        let p = [0.0, 3.0, 2.0];
        assert!((cliff_rmse(&y, &p, &[false, true, false]) - 2.0).abs() < 1e-12);
        assert!(cliff_rmse(&y, &p, &[false; 3]).is_nan());
    }

    #[test]
    fn test_r2_perfect_and_constant() {
        assert!((r2(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]) - 1.0).abs() < 1e-12);
        assert_eq!(r2(&[2.0, 2.0], &[2.0, 2.0]), 1.0);
        assert_eq!(r2(&[2.0, 2.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_roc_auc() {
        let y = [0.0, 0.0, 1.0, 1.0];
        assert!((roc_auc(&y, &[0.1, 0.4, 0.35, 0.8]) - 0.75).abs() < 1e-12);
        assert!((roc_auc(&y, &[0.1, 0.2, 0.8, 0.9]) - 1.0).abs() < 1e-12);
        // 同点は 0.5 として扱われる
        assert!((roc_auc(&y, &[0.5, 0.5, 0.5, 0.5]) - 0.5).abs() < 1e-12);
        assert!(roc_auc(&[1.0, 1.0], &[0.2, 0.3]).is_nan());
    }

    #[test]
    fn test_prc_auc_perfect_ranking() {
        let y = [0.0, 1.0, 0.0, 1.0];
        assert!((prc_auc(&y, &[0.1, 0.9, 0.2, 0.8]) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_accuracy_and_cross_entropy() {
        let y = [1.0, 0.0, 1.0, 0.0];
        let p = [0.9, 0.2, 0.4, 0.6];
        assert!((accuracy(&y, &p) - 0.5).abs() < 1e-12);
        let ce = cross_entropy(&y, &p);
        assert!(ce > 0.0 && ce.is_finite());
    }

    #[test]
    fn test_metric_direction_from_name() {
        for m in Metric::ALL {
            let parsed: Metric = m.name().parse().unwrap();
            assert_eq!(parsed, m);
        }
        assert!(Metric::Rmse.minimize());
        assert!(Metric::CrossEntropy.minimize());
        assert!(!Metric::Auc.minimize());
        assert!(!Metric::R2.minimize());
        assert!(Metric::Rmse.improves(0.5, 1.0));
        assert!(Metric::Auc.improves(0.9, 0.8));
        assert!("f1".parse::<Metric>().is_err());
    }

    #[test]
    fn test_summarize_population_std() {
        let (mean, std) = summarize(&[1.0, 2.0, 3.0, 4.0]);
        assert!((mean - 2.5).abs() < 1e-12);
        assert!((std - 1.25f64.sqrt()).abs() < 1e-12);
        let (m, s) = summarize(&[]);
        assert!(m.is_nan() && s.is_nan());
    }

    #[test]
    fn test_per_target_summary_keeps_first_seen_order() {
        let targets: Vec<String> = ["P2", "P1", "P2", "P1"].iter().map(|s| s.to_string()).collect();
        let y = [1.0, 1.0, 2.0, 2.0];
        let p = [1.0, 2.0, 2.0, 2.0];
        let mask = [true, true, false, false];
        let summary = per_target_summary(&targets, &y, &p, &mask);
        assert_eq!(summary.per_target[0].target, "P2");
        assert_eq!(summary.per_target[0].rmse, 0.0);
        assert!((summary.per_target[1].rmse - 0.5f64.sqrt()).abs() < 1e-12);
        assert!((summary.per_target[1].cliff_rmse - 1.0).abs() < 1e-12);
        assert!((summary.rmse_mean - 0.5f64.sqrt() / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_history_collect_epoch() {
        let mut history = MetricHistory::new(Metric::Rmse);
        let losses = LossRecord {
            total: 1.0,
            mse: 0.8,
            cls: 0.0,
            cl: 2.0,
        };
        let val = Score {
            metric: Metric::Rmse,
            value: 0.7,
        };
        let test = Score {
            metric: Metric::Rmse,
            value: 0.9,
        };
        history.collect_epoch(0, &losses, &val, &test);
        history.collect_epoch(1, &losses, &val, &test);
        assert_eq!(history.epochs(), 2);
        assert_eq!(history.get("train_loss_MSE").unwrap(), &[(0, 0.8), (1, 0.8)]);
        assert_eq!(history.get("test_rmse").unwrap()[1], (1, 0.9));
        assert_eq!(history.series.len(), 6);
    }
}
