//! 実行設定
//!
//! TOML ファイルと CLI 上書きから [`RunConfig`] を組み立てる。
//! 検証（[`RunConfig::validate`]）はデータを読み込む前に必ず呼ぶ。

use crate::baseline::BaselineRegistry;
use crate::error::{Result, SiamError};
use crate::metrics::Metric;
use crate::nn::Activation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// split_sizes の合計に許容する誤差
const SPLIT_SUM_TOLERANCE: f64 = 1e-6;

/// 実行モード
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Siamese モデルの学習
    Train,
    /// 学習済みチェックポイントによる推論
    Inference,
    /// QSAR ベースラインの学習と評価
    BaselineQsar,
    /// CPI ベースラインの学習と評価
    BaselineCpi,
}

impl FromStr for RunMode {
    type Err = SiamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "train" => Ok(Self::Train),
            "inference" => Ok(Self::Inference),
            "baseline-qsar" => Ok(Self::BaselineQsar),
            "baseline-cpi" => Ok(Self::BaselineCpi),
            _ => Err(SiamError::config(format!("unknown mode `{s}`"))),
        }
    }
}

/// 目的変数の種類
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetType {
    Regression,
    Classification,
}

impl FromStr for DatasetType {
    type Err = SiamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "regression" => Ok(Self::Regression),
            "classification" => Ok(Self::Classification),
            _ => Err(SiamError::config(format!("unknown dataset type `{s}`"))),
        }
    }
}

/// データ分割の方法
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitType {
    #[serde(rename = "random")]
    Random,
    #[serde(rename = "scaffold_balanced")]
    ScaffoldBalanced,
    /// 入力の split 列（train/test）を使い、検証集合は train から抽出する
    #[serde(rename = "moleculeACE")]
    MoleculeAce,
    #[serde(rename = "predetermined")]
    Predetermined,
}

impl FromStr for SplitType {
    type Err = SiamError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "random" => Ok(Self::Random),
            "scaffold_balanced" => Ok(Self::ScaffoldBalanced),
            "moleculeACE" | "moleculeace" => Ok(Self::MoleculeAce),
            "predetermined" => Ok(Self::Predetermined),
            _ => Err(SiamError::config(format!("unknown split type `{s}`"))),
        }
    }
}

impl fmt::Display for SplitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Random => "random",
            Self::ScaffoldBalanced => "scaffold_balanced",
            Self::MoleculeAce => "moleculeACE",
            Self::Predetermined => "predetermined",
        };
        f.write_str(s)
    }
}

/// 追加特徴量のスケーリング
///
/// 旧来の `features_scaling` / `no_features_scaling` の2フラグを1つにまとめたもの。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureScaling {
    /// 追加特徴量列がある場合のみスケーリングする
    #[default]
    Auto,
    On,
    Off,
}

impl FeatureScaling {
    pub fn enabled(self, has_features: bool) -> bool {
        match self {
            Self::Auto => has_features,
            Self::On => true,
            Self::Off => false,
        }
    }
}

impl FromStr for FeatureScaling {
    type Err = SiamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "on" | "true" => Ok(Self::On),
            "off" | "false" => Ok(Self::Off),
            _ => Err(SiamError::config(format!("unknown feature scaling `{s}`"))),
        }
    }
}

/// 学習率スケジューラの種類
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SchedulerKind {
    /// ウォームアップ付き Noam（バッチ毎に更新）
    #[default]
    Noam,
    /// 指数減衰（エポック毎に更新）
    Exponential { gamma: f32 },
}

/// 複合損失の重み
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossWeights {
    pub task: f32,
    pub contrastive: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            task: 1.0,
            contrastive: 0.1,
        }
    }
}

/// ハッシュ化フィンガープリントの設定
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// ハッシュ空間の次元
    pub dims: usize,
    /// SMILES 文字 n-gram の最大長
    pub max_ngram: usize,
    /// タンパク質配列 k-mer の長さ（CPI のみ）
    pub protein_kmer: usize,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            dims: 2048,
            max_ngram: 3,
            protein_kmer: 3,
        }
    }
}

/// 入力 CSV の列名
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnConfig {
    pub smiles: String,
    pub target: String,
    pub split: String,
    pub cliff: String,
    pub scaffold: String,
    /// CPI: 標的タンパク質の配列
    pub sequence: String,
    /// 追加の数値特徴量列
    pub features: Vec<String>,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            smiles: "smiles".to_string(),
            target: "y".to_string(),
            split: "split".to_string(),
            cliff: "cliff_mol".to_string(),
            scaffold: "scaffold".to_string(),
            sequence: "Sequence".to_string(),
            features: Vec::new(),
        }
    }
}

/// モデルのハイパーパラメータ
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub hidden_size: usize,
    pub depth: usize,
    pub ffn_hidden_size: usize,
    pub ffn_num_layers: usize,
    pub dropout: f32,
    pub activation: Activation,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: 300,
            depth: 3,
            ffn_hidden_size: 300,
            ffn_num_layers: 2,
            dropout: 0.0,
            activation: Activation::Relu,
        }
    }
}

/// 学習設定
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainSettings {
    pub epochs: usize,
    pub batch_size: usize,
    /// 基準学習率（Noam では init_lr = final_lr = lr, max_lr = 10 * lr）
    pub lr: f32,
    pub max_lr: Option<f32>,
    pub init_lr: Option<f32>,
    pub final_lr: Option<f32>,
    pub warmup_epochs: usize,
    pub scheduler: SchedulerKind,
    pub weight_decay: f32,
    /// 対照損失の温度
    pub temperature: f32,
    /// クエリ1件あたりの Siamese ペア数
    pub siams_num: usize,
    /// ランダムペアで自分自身を参照に選ばない
    pub exclude_self_pairs: bool,
    pub loss_weights: LossWeights,
}

impl Default for TrainSettings {
    fn default() -> Self {
        Self {
            epochs: 100,
            batch_size: 256,
            lr: 1e-4,
            max_lr: None,
            init_lr: None,
            final_lr: None,
            warmup_epochs: 2,
            scheduler: SchedulerKind::Noam,
            weight_decay: 0.0,
            temperature: 0.1,
            siams_num: 5,
            exclude_self_pairs: true,
            loss_weights: LossWeights::default(),
        }
    }
}

impl TrainSettings {
    pub fn max_lr(&self) -> f32 {
        self.max_lr.unwrap_or(self.lr * 10.0)
    }

    pub fn init_lr(&self) -> f32 {
        self.init_lr.unwrap_or(self.lr)
    }

    pub fn final_lr(&self) -> f32 {
        self.final_lr.unwrap_or(self.lr)
    }
}

/// 1回の実行に関するすべての設定
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub mode: RunMode,
    pub data_path: Option<PathBuf>,
    pub test_path: Option<PathBuf>,
    pub save_dir: PathBuf,
    /// train: 事前学習済みエンコーダ / inference: 学習済みモデル
    pub checkpoint_path: Option<PathBuf>,
    pub dataset_type: DatasetType,
    pub seed: u64,
    pub split_type: SplitType,
    pub split_sizes: [f64; 3],
    pub metric: Option<Metric>,
    pub features_scaling: FeatureScaling,
    pub max_data_size: Option<usize>,
    /// 出力ファイル名に使うモデル名
    pub model_name: String,
    pub baseline_model: Option<String>,
    pub columns: ColumnConfig,
    pub fingerprint: FingerprintConfig,
    pub model: ModelConfig,
    pub train: TrainSettings,
    /// 進捗とエポック毎のログを出力する
    pub print: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Train,
            data_path: None,
            test_path: None,
            save_dir: PathBuf::from("exp_results"),
            checkpoint_path: None,
            dataset_type: DatasetType::Regression,
            seed: 0,
            split_type: SplitType::MoleculeAce,
            split_sizes: [0.8, 0.1, 0.1],
            metric: None,
            features_scaling: FeatureScaling::Auto,
            max_data_size: None,
            model_name: "SiamQSAR".to_string(),
            baseline_model: None,
            columns: ColumnConfig::default(),
            fingerprint: FingerprintConfig::default(),
            model: ModelConfig::default(),
            train: TrainSettings::default(),
            print: true,
        }
    }
}

impl RunConfig {
    /// TOML ファイルから設定を読み込む（未指定の項目はデフォルト値）
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|e| SiamError::at_path(path, e))?;
        Ok(toml::from_str(&text)?)
    }

    /// データセット名（`data/CHEMBL1862_Ki.csv` → `CHEMBL1862_Ki`）
    pub fn data_name(&self) -> String {
        self.data_path
            .as_deref()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .and_then(|n| n.split('.').next())
            .unwrap_or("dataset")
            .to_string()
    }

    /// 出力ディレクトリ（save_dir/データセット名）
    pub fn save_path(&self) -> PathBuf {
        self.save_dir.join(self.data_name())
    }

    /// 使用するメトリクス（未指定時はデータセット種別から決める）
    pub fn resolved_metric(&self) -> Metric {
        self.metric.unwrap_or(match self.dataset_type {
            DatasetType::Regression => Metric::Rmse,
            DatasetType::Classification => Metric::Auc,
        })
    }

    /// 実行前の設定検証
    pub fn validate(&self) -> Result<()> {
        if self.data_path.is_none() {
            return Err(SiamError::config("data_path is required"));
        }
        if self.mode == RunMode::Inference {
            if self.test_path.is_none() {
                return Err(SiamError::config("inference mode requires test_path"));
            }
            if self.checkpoint_path.is_none() {
                return Err(SiamError::config("inference mode requires checkpoint_path"));
            }
        }
        if matches!(self.mode, RunMode::BaselineQsar | RunMode::BaselineCpi) {
            let Some(id) = self.baseline_model.as_deref() else {
                return Err(SiamError::config("baseline modes require baseline_model"));
            };
            let registry = BaselineRegistry::default();
            if registry.resolve(id).is_none() {
                return Err(SiamError::config(format!(
                    "unknown baseline model `{id}` (available: {})",
                    registry.ids().join(", ")
                )));
            }
        }

        let metric = self.resolved_metric();
        if !metric.supports(self.dataset_type) {
            return Err(SiamError::config(format!(
                "metric `{metric}` cannot be used with {:?} datasets",
                self.dataset_type
            )));
        }

        if self.split_sizes.iter().any(|&s| s < 0.0) {
            return Err(SiamError::config(format!(
                "split_sizes must be non-negative: {:?}",
                self.split_sizes
            )));
        }
        let sum: f64 = self.split_sizes.iter().sum();
        if (sum - 1.0).abs() > SPLIT_SUM_TOLERANCE {
            return Err(SiamError::config(format!(
                "split_sizes must sum to 1, got {sum} ({:?})",
                self.split_sizes
            )));
        }

        let t = &self.train;
        if t.batch_size == 0 || t.siams_num == 0 {
            return Err(SiamError::config("batch_size and siams_num must be positive"));
        }
        let w = &t.loss_weights;
        if !(w.task >= 0.0 && w.contrastive >= 0.0) {
            return Err(SiamError::config(format!(
                "loss weights must be non-negative (task={}, contrastive={})",
                w.task, w.contrastive
            )));
        }
        if !(t.temperature > 0.0) {
            return Err(SiamError::config("temperature must be positive"));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(SiamError::config("dropout must be in [0, 1)"));
        }
        if self.model.depth == 0 || self.model.ffn_num_layers == 0 {
            return Err(SiamError::config("depth and ffn_num_layers must be at least 1"));
        }
        if self.fingerprint.dims == 0 || self.fingerprint.max_ngram == 0 {
            return Err(SiamError::config("fingerprint dims and max_ngram must be positive"));
        }
        if let SchedulerKind::Exponential { gamma } = t.scheduler {
            if !(gamma > 0.0 && gamma <= 1.0) {
                return Err(SiamError::config("exponential gamma must be in (0, 1]"));
            }
        }
        Ok(())
    }
}
