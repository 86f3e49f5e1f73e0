//! Siamese ネットワークの学習モジュール
//!
//! # 構成
//! - `layers`: 学習可能な層（スパース埋め込み・全結合・活性化・dropout）
//! - `network`: 共有エンコーダ + FFN ヘッド
//! - `optimizer`: Adam
//! - `scheduler`: Noam / 指数減衰

pub mod layers;
pub mod network;
pub mod optimizer;
pub mod scheduler;

pub use layers::{Activation, Dense, SparseEmbedding};
pub use network::{LoadReport, MolInput, NetworkShape, PairCache, SiameseNetwork};
pub use optimizer::{Adam, Optimizer};
pub use scheduler::{LrScheduler, StepUnit};

/// 名前付きパラメータ（形状 + 行優先のデータ）
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }

    /// 要素数
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}
