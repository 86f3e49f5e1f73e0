//! データの読み込みと特徴量化
//!
//! - `io`: CSV の読み書き（gzip 対応）
//! - `table`: 生の CSV テーブル
//! - `features`: ハッシュ化フィンガープリント
//! - `dataset`: [`Sample`] の構築

pub mod dataset;
pub mod features;
pub mod io;
pub mod table;

pub use dataset::{MoleculeDataset, Sample, SampleOptions, PROTOTYPE_TAG};
pub use table::Table;
