//! Tanimoto 類似度による k 近傍回帰

use super::{finalize_prediction, BaselineModel, BaselineParams, Fingerprints, PersistFormat};
use crate::config::DatasetType;
use crate::data::features::tanimoto;
use crate::error::{Result, SiamError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_K: usize = 5;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KnnRegressor {
    pub k: usize,
    pub dataset_type: DatasetType,
    /// 学習データ（アクティブインデックスと目的変数）
    pub train_x: Vec<Vec<usize>>,
    pub train_y: Vec<f64>,
}

impl KnnRegressor {
    pub fn new(params: &BaselineParams) -> Self {
        Self {
            k: DEFAULT_K,
            dataset_type: params.dataset_type,
            train_x: Vec::new(),
            train_y: Vec::new(),
        }
    }

    fn predict_one(&self, query: &[usize]) -> f64 {
        let mut sims: Vec<(f64, usize)> = self
            .train_x
            .iter()
            .enumerate()
            .map(|(i, x)| (tanimoto(query, x), i))
            .collect();
        // 類似度の降順、同値は学習データの順
        sims.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        let k = self.k.min(sims.len());
        let mean = sims[..k].iter().map(|&(_, i)| self.train_y[i]).sum::<f64>() / k as f64;
        finalize_prediction(self.dataset_type, mean)
    }
}

impl BaselineModel for KnnRegressor {
    fn name(&self) -> &str {
        "KNN"
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
        self.train_x = x.rows.to_vec();
        self.train_y = y.to_vec();
        Ok(())
    }

    fn predict(&self, x: Fingerprints<'_>) -> Result<Vec<f64>> {
        if self.train_x.is_empty() {
            return Err(SiamError::backend(self.name(), "model is not trained"));
        }
        Ok(x.rows.iter().map(|q| self.predict_one(q)).collect())
    }

    fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(dataset_type: DatasetType) -> BaselineParams {
        BaselineParams {
            input_dim: 16,
            dataset_type,
            seed: 0,
            epochs: 1,
            batch_size: 1,
            lr: 0.0,
            hidden_size: 1,
        }
    }

    #[test]
    fn test_nearest_neighbours_average() {
        let mut knn = KnnRegressor::new(&params(DatasetType::Regression));
        knn.k = 2;
        let rows = vec![vec![0, 1, 2], vec![0, 1, 3], vec![7, 8], vec![9]];
        knn.train(Fingerprints::new(16, &rows), &[1.0, 3.0, 10.0, 20.0], None).unwrap();

        let query = vec![vec![0, 1, 2]];
        let pred = knn.predict(Fingerprints::new(16, &query)).unwrap();
        assert!((pred[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_untrained_model_fails() {
        let knn = KnnRegressor::new(&params(DatasetType::Regression));
        let rows = vec![vec![1]];
        assert!(matches!(
            knn.predict(Fingerprints::new(16, &rows)),
            Err(SiamError::Backend { .. })
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let mut knn = KnnRegressor::new(&params(DatasetType::Classification));
        let rows = vec![vec![1], vec![2]];
        knn.train(Fingerprints::new(16, &rows), &[0.0, 1.0], None).unwrap();
        let back: KnnRegressor = serde_json::from_value(knn.to_json().unwrap()).unwrap();
        assert_eq!(back.train_x, knn.train_x);
        assert_eq!(back.dataset_type, DatasetType::Classification);
    }
}
