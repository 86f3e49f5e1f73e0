//! 分子データセット
//!
//! [`Table`] の各行を [`Sample`] に変換する。元のテーブルは予測値の書き戻し用に保持する。

use super::features::{protein_fingerprint, smiles_fingerprint};
use super::table::Table;
use crate::config::{ColumnConfig, DatasetType, FingerprintConfig};
use crate::error::{Result, SiamError};
use std::path::Path;

/// プロトタイプ（タグ未指定）のサンプルに付ける出自タグ
pub const PROTOTYPE_TAG: &str = "prototype";

/// 分子1つ（CPI では分子 + 標的）のサンプル
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// 元テーブルでの行番号
    pub row: usize,
    pub smiles: String,
    pub target: f64,
    /// アクティブなフィンガープリントのインデックス（昇順）
    pub active: Vec<usize>,
    /// 追加特徴量（スケーリング前）
    pub features: Vec<f32>,
    pub cliff: bool,
    /// 出自タグ（データセット名またはタスク名）
    pub tag: String,
    /// split 列の値（小文字）
    pub split: Option<String>,
    /// scaffold 列の値
    pub scaffold: Option<String>,
}

/// 読み込み済みデータセット
#[derive(Clone, Debug)]
pub struct MoleculeDataset {
    pub table: Table,
    pub samples: Vec<Sample>,
    pub dataset_type: DatasetType,
}

/// サンプル構築時の設定
#[derive(Clone, Copy, Debug)]
pub struct SampleOptions<'a> {
    pub columns: &'a ColumnConfig,
    pub fingerprint: &'a FingerprintConfig,
    pub dataset_type: DatasetType,
    /// 目的変数列が無くてもよい（推論用のクエリ）
    pub allow_missing_target: bool,
    /// 出自タグ
    pub tag: &'a str,
}

/// cliff_mol 列の値を解釈する
pub fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "1.0" | "true" | "yes" => Ok(true),
        "0" | "0.0" | "false" | "no" | "" => Ok(false),
        other => Err(SiamError::data(format!("cannot interpret `{other}` as a 0/1 flag"))),
    }
}

fn parse_target(raw: &str, row: usize, dataset_type: DatasetType) -> Result<f64> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| SiamError::data(format!("row {row}: target `{raw}` is not a number")))?;
    if dataset_type == DatasetType::Classification && value != 0.0 && value != 1.0 {
        return Err(SiamError::data(format!(
            "row {row}: classification target must be 0 or 1, got {value}"
        )));
    }
    Ok(value)
}

impl MoleculeDataset {
    /// CSV を読み込んでデータセットを作る
    pub fn load<P: AsRef<Path>>(path: P, opts: SampleOptions<'_>, max_rows: Option<usize>) -> Result<Self> {
        let mut table = Table::read(path)?;
        if let Some(n) = max_rows {
            table = table.head(n);
        }
        Self::from_table(table, opts)
    }

    /// テーブルからサンプルを構築する
    pub fn from_table(table: Table, opts: SampleOptions<'_>) -> Result<Self> {
        let cols = opts.columns;
        let smiles = table.column(&cols.smiles)?;
        let targets = if opts.allow_missing_target {
            table.optional_column(&cols.target)
        } else {
            Some(table.column(&cols.target)?)
        };
        let cliffs = table.optional_column(&cols.cliff);
        let splits = table.optional_column(&cols.split);
        let scaffolds = table.optional_column(&cols.scaffold);
        let feature_cols: Vec<Vec<&str>> = cols
            .features
            .iter()
            .map(|c| table.column(c))
            .collect::<Result<_>>()?;

        let mut samples = Vec::with_capacity(table.len());
        for (row, smi) in smiles.iter().enumerate() {
            let target = match &targets {
                Some(t) => parse_target(t[row], row, opts.dataset_type)?,
                None => f64::NAN,
            };
            let cliff = match &cliffs {
                Some(c) => parse_flag(c[row])?,
                None => false,
            };
            let features = feature_cols
                .iter()
                .map(|c| c[row].trim().parse::<f32>().unwrap_or(f32::NAN))
                .collect();
            samples.push(Sample {
                row,
                smiles: smi.to_string(),
                target,
                active: smiles_fingerprint(smi, opts.fingerprint.dims, opts.fingerprint.max_ngram),
                features,
                cliff,
                tag: opts.tag.to_string(),
                split: splits.as_ref().map(|s| s[row].trim().to_ascii_lowercase()),
                scaffold: scaffolds.as_ref().map(|s| s[row].trim().to_string()),
            });
        }

        if samples.is_empty() {
            log::warn!("dataset `{}` has no rows", opts.tag);
        }
        Ok(Self {
            table,
            samples,
            dataset_type: opts.dataset_type,
        })
    }

    /// CPI: 分子フィンガープリントに標的配列の k-mer を連結する
    ///
    /// 配列側のインデックスは `fingerprint.dims` だけずらす。
    pub fn with_protein_features(mut self, sequence_column: &str, fp: &FingerprintConfig) -> Result<Self> {
        let seqs: Vec<String> = self
            .table
            .column(sequence_column)?
            .into_iter()
            .map(str::to_string)
            .collect();
        for sample in &mut self.samples {
            let protein = protein_fingerprint(&seqs[sample.row], fp.dims, fp.protein_kmer);
            sample.active.extend(protein.into_iter().map(|i| i + fp.dims));
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// 追加特徴量の次元
    pub fn feature_dim(&self) -> usize {
        self.samples.first().map_or(0, |s| s.features.len())
    }

    /// 指定したインデックスのサンプル（順序を保つ）
    pub fn subset(&self, indices: &[usize]) -> Vec<Sample> {
        indices.iter().map(|&i| self.samples[i].clone()).collect()
    }
}
