//! 標準化（列ごとの平均・標準偏差）
//!
//! 学習データの目的変数・追加特徴量で一度だけ fit し、検証・テストにも同じ値を使う。
//! 標準偏差が 0 の列は 1 として扱い、NaN は変換後に `replace_nan_token` で置き換える。

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
    pub replace_nan_token: f64,
}

impl StandardScaler {
    /// 行列（行 = サンプル）に fit する。NaN は集計から除外する。
    pub fn fit(rows: &[Vec<f64>], replace_nan_token: f64) -> Self {
        let cols = rows.first().map_or(0, Vec::len);
        let mut means = vec![0.0; cols];
        let mut stds = vec![1.0; cols];

        for c in 0..cols {
            let values: Vec<f64> = rows.iter().map(|r| r[c]).filter(|v| !v.is_nan()).collect();
            if values.is_empty() {
                continue;
            }
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
            means[c] = mean;
            stds[c] = if var.sqrt() == 0.0 { 1.0 } else { var.sqrt() };
        }
        Self {
            means,
            stds,
            replace_nan_token,
        }
    }

    /// 1列（目的変数）に fit する
    pub fn fit_column(values: &[f64]) -> Self {
        let rows: Vec<Vec<f64>> = values.iter().map(|&v| vec![v]).collect();
        let mut scaler = Self::fit(&rows, 0.0);
        if scaler.means.is_empty() {
            scaler.means = vec![0.0];
            scaler.stds = vec![1.0];
        }
        scaler
    }

    pub fn transform_row(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .enumerate()
            .map(|(c, &v)| {
                let t = (v - self.means[c]) / self.stds[c];
                if t.is_nan() { self.replace_nan_token } else { t }
            })
            .collect()
    }

    pub fn inverse_transform_row(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .enumerate()
            .map(|(c, &v)| v * self.stds[c] + self.means[c])
            .collect()
    }

    /// 1列目に対する変換
    pub fn transform(&self, v: f64) -> f64 {
        self.transform_row(&[v])[0]
    }

    /// 1列目に対する逆変換
    pub fn inverse_transform(&self, v: f64) -> f64 {
        v * self.stds[0] + self.means[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let values = [1.0, 2.0, 3.0, 10.0];
        let scaler = StandardScaler::fit_column(&values);
        for &v in &values {
            let back = scaler.inverse_transform(scaler.transform(v));
            assert!((back - v).abs() < 1e-12);
        }
        let scaled: Vec<f64> = values.iter().map(|&v| scaler.transform(v)).collect();
        let mean = scaled.iter().sum::<f64>() / 4.0;
        assert!(mean.abs() < 1e-12);
    }

    #[test]
    fn test_zero_std_uses_one() {
        let scaler = StandardScaler::fit(&[vec![5.0, 1.0], vec![5.0, 3.0]], 0.0);
        assert_eq!(scaler.stds[0], 1.0);
        assert_eq!(scaler.transform_row(&[6.0, 3.0]), vec![1.0, 1.0]);
    }

    #[test]
    fn test_nan_replaced_by_token() {
        let scaler = StandardScaler::fit(&[vec![1.0], vec![f64::NAN], vec![3.0]], -9.0);
        assert_eq!(scaler.means, vec![2.0]);
        assert_eq!(scaler.transform_row(&[f64::NAN]), vec![-9.0]);
    }
}
