//! ベースラインモデル
//!
//! バックエンドは [`BaselineModel`] を実装し、[`BaselineRegistry`] の ID から生成する。
//! 保存形式（[`PersistFormat`]）はバックエンドごとに決まっている。
//!
//! | ID | 別名（CPI） | 形式 |
//! |----|-------------|------|
//! | `KNN` | `GraphDTA` | JSON |
//! | `Ridge` | `MolTrans` | JSON |
//! | `MLP` | `DeepDTA` | バイナリ |

pub mod knn;
pub mod mlp;
pub mod ridge;

pub use knn::KnnRegressor;
pub use mlp::MlpRegressor;
pub use ridge::RidgeRegressor;

use crate::config::{DatasetType, RunConfig};
use crate::error::{Result, SiamError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// 保存形式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistFormat {
    /// 独自バイナリ（`.bin`）
    Native,
    /// serde JSON（`.json`）
    Serialized,
}

impl PersistFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Native => "bin",
            Self::Serialized => "json",
        }
    }
}

/// フィンガープリント行列（行ごとのアクティブインデックス）
#[derive(Clone, Copy, Debug)]
pub struct Fingerprints<'a> {
    pub dims: usize,
    pub rows: &'a [Vec<usize>],
}

impl<'a> Fingerprints<'a> {
    pub fn new(dims: usize, rows: &'a [Vec<usize>]) -> Self {
        Self { dims, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// バックエンド生成時のパラメータ
#[derive(Clone, Debug)]
pub struct BaselineParams {
    pub input_dim: usize,
    pub dataset_type: DatasetType,
    pub seed: u64,
    pub epochs: usize,
    pub batch_size: usize,
    pub lr: f32,
    pub hidden_size: usize,
}

impl BaselineParams {
    pub fn from_config(config: &RunConfig, input_dim: usize) -> Self {
        Self {
            input_dim,
            dataset_type: config.dataset_type,
            seed: config.seed,
            epochs: config.train.epochs,
            batch_size: config.train.batch_size,
            lr: config.train.lr,
            hidden_size: config.model.ffn_hidden_size,
        }
    }
}

/// ベースラインモデル
pub trait BaselineModel {
    /// バックエンド名
    fn name(&self) -> &str;

    fn persist_format(&self) -> PersistFormat;

    /// 検証集合を参照するか（参照しないなら検証分も学習に回す）
    fn uses_validation(&self) -> bool {
        false
    }

    /// 学習（`val` は早期終了などに使うバックエンドのみ参照する）
    fn train(&mut self, x: Fingerprints<'_>, y: &[f64], val: Option<(Fingerprints<'_>, &[f64])>) -> Result<()>;

    /// 予測（分類では確率）
    fn predict(&self, x: Fingerprints<'_>) -> Result<Vec<f64>>;

    /// `Serialized` 形式の中身
    fn to_json(&self) -> Result<Value> {
        Err(SiamError::backend(self.name(), "no serialized representation"))
    }

    /// `Native` 形式の中身
    fn write_native(&self, _w: &mut dyn Write) -> Result<()> {
        Err(SiamError::backend(self.name(), "no native representation"))
    }

    /// `dir/{stem}_model.{bin|json}` に保存してパスを返す
    fn save(&self, dir: &Path, stem: &str) -> Result<PathBuf> {
        let format = self.persist_format();
        std::fs::create_dir_all(dir).map_err(|e| SiamError::at_path(dir, e))?;
        let path = dir.join(format!("{stem}_model.{}", format.extension()));
        let file = File::create(&path).map_err(|e| SiamError::at_path(&path, e))?;
        let mut writer = BufWriter::new(file);
        match format {
            PersistFormat::Native => self.write_native(&mut writer)?,
            PersistFormat::Serialized => serde_json::to_writer_pretty(&mut writer, &self.to_json()?)?,
        }
        writer.flush().map_err(|e| SiamError::at_path(&path, e))?;
        log::info!("saved {} model to {}", self.name(), path.display());
        Ok(path)
    }
}

type Factory = fn(&BaselineParams) -> Box<dyn BaselineModel>;

fn create_knn(p: &BaselineParams) -> Box<dyn BaselineModel> {
    Box::new(KnnRegressor::new(p))
}

fn create_ridge(p: &BaselineParams) -> Box<dyn BaselineModel> {
    Box::new(RidgeRegressor::new(p))
}

fn create_mlp(p: &BaselineParams) -> Box<dyn BaselineModel> {
    Box::new(MlpRegressor::new(p))
}

/// バックエンド ID → 生成関数
pub struct BaselineRegistry {
    factories: BTreeMap<&'static str, Factory>,
    aliases: BTreeMap<&'static str, &'static str>,
}

impl Default for BaselineRegistry {
    fn default() -> Self {
        let mut factories: BTreeMap<&'static str, Factory> = BTreeMap::new();
        factories.insert("KNN", create_knn);
        factories.insert("Ridge", create_ridge);
        factories.insert("MLP", create_mlp);

        let aliases = BTreeMap::from([("DeepDTA", "MLP"), ("GraphDTA", "KNN"), ("MolTrans", "Ridge")]);
        Self { factories, aliases }
    }
}

impl BaselineRegistry {
    /// 登録済みの ID（別名を含む）
    pub fn ids(&self) -> Vec<&'static str> {
        self.factories.keys().chain(self.aliases.keys()).copied().collect()
    }

    /// 別名を解決した ID
    pub fn resolve(&self, id: &str) -> Option<&'static str> {
        self.factories
            .get_key_value(id)
            .map(|(k, _)| *k)
            .or_else(|| self.aliases.get(id).copied())
    }

    /// バックエンドを生成する（未知の ID は設定エラー）
    pub fn create(&self, id: &str, params: &BaselineParams) -> Result<Box<dyn BaselineModel>> {
        let factory = self
            .resolve(id)
            .and_then(|resolved| self.factories.get(resolved))
            .ok_or_else(|| {
                SiamError::config(format!("unknown baseline model `{id}` (available: {})", self.ids().join(", ")))
            })?;
        Ok(factory(params))
    }
}

/// 回帰値を分類用の確率の範囲に収める
pub(crate) fn finalize_prediction(dataset_type: DatasetType, v: f64) -> f64 {
    match dataset_type {
        DatasetType::Regression => v,
        DatasetType::Classification => v.clamp(0.0, 1.0),
    }
}
