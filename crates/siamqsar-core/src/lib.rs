//! siamqsar: Siamese 対照学習による QSAR / CPI 予測
//!
//! # モジュール
//! - `data`: CSV 読み込み・フィンガープリント・サンプル構築
//! - `split`: train / validation / test の分割
//! - `pairs`: Siamese ペアの生成
//! - `loss`: タスク損失 + 対照損失
//! - `nn`: ネットワーク・オプティマイザ・スケジューラ
//! - `trainer`: 学習ループ
//! - `metrics`: 評価指標と履歴
//! - `baseline`: ベースラインモデル
//! - `pipeline`: 実行モード

pub mod baseline;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod nn;
pub mod pairs;
pub mod pipeline;
pub mod scaler;
pub mod split;
pub mod trainer;

pub use config::{DatasetType, RunConfig, RunMode, SplitType};
pub use error::{Result, SiamError};
pub use metrics::{Metric, MetricHistory};
pub use pipeline::{run, RunStatus, RunSummary};
pub use trainer::{TrainOutcome, Trainer};
