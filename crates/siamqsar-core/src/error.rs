//! Error types for siamqsar
//!
//! 設定エラーはデータ読み込み前に検出し、学習系のエラーはそのまま呼び出し元へ伝播する。

use std::path::PathBuf;

/// siamqsar の各処理で発生するエラー
#[derive(thiserror::Error, Debug)]
pub enum SiamError {
    /// 設定値の不整合（メトリクス・分割方法・必須パスなど）
    #[error("configuration error: {0}")]
    Config(String),

    /// 入力データの不整合（列の欠落・解釈できない値など）
    #[error("data error: {0}")]
    Data(String),

    /// 参照プールが空のためペアを生成できない
    #[error("siamese reference pool is empty ({queries} queries)")]
    EmptyPool { queries: usize },

    /// チェックポイントの形式エラー
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// ベースラインモデルの学習・推論エラー
    #[error("baseline `{name}` failed: {message}")]
    Backend { name: String, message: String },

    /// パス付きのI/Oエラー
    #[error("{}: {source}", path.display())]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    /// Weight dimension mismatch
    #[error("dimension mismatch for {name}: expected {expected}, got {actual}")]
    DimensionMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
}

impl SiamError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn backend(name: &str, msg: impl Into<String>) -> Self {
        Self::Backend {
            name: name.to_string(),
            message: msg.into(),
        }
    }

    pub fn at_path(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Path {
            path: path.into(),
            source,
        }
    }
}

/// Result type for siamqsar operations
pub type Result<T> = std::result::Result<T, SiamError>;
