//! 実行モードごとの処理
//!
//! - `train`: Siamese モデルの学習とテスト予測
//! - `inference`: 学習済みチェックポイントによる予測
//! - `baseline-qsar` / `baseline-cpi`: ベースラインの学習と評価
//!
//! 出力はすべて `save_dir/<データセット名>/` に書く。

use crate::baseline::{BaselineParams, BaselineRegistry, Fingerprints};
use crate::checkpoint::{self, Checkpoint};
use crate::config::{DatasetType, ModelConfig, RunConfig, RunMode};
use crate::data::{MoleculeDataset, Sample, SampleOptions, Table, PROTOTYPE_TAG};
use crate::error::{Result, SiamError};
use crate::logging::RunLogger;
use crate::metrics::{cliff_rmse, per_target_summary, rmse, CrossTargetSummary};
use crate::nn::{NetworkShape, SiameseNetwork};
use crate::pairs::{generate_pairs, PairStrategy};
use crate::scaler::StandardScaler;
use crate::split::{self, DatasetSplit};
use crate::trainer::{predict_queries, Phase, PreparedSet, Trainer};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde_json::json;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// 予測値の列名
pub const PREDICTION_COLUMN: &str = "Prediction";
/// CPI データの目的変数列
pub const CPI_LABEL_COLUMN: &str = "Label";
/// CPI データの標的 ID 列（優先順）
pub const CPI_GROUP_COLUMNS: [&str; 2] = ["Chembl_id", "UniProt_id"];

/// 1回の実行の結果
#[derive(Clone, Debug)]
pub enum RunStatus {
    Completed(RunSummary),
    /// 出力が既に存在するため何もしなかった
    Skipped { existing: PathBuf },
}

#[derive(Clone, Debug)]
pub struct RunSummary {
    pub mode: RunMode,
    /// 予測 CSV のパス
    pub predictions: PathBuf,
    pub rmse: f64,
    pub cliff_rmse: f64,
    pub best_epoch: Option<usize>,
    /// CPI のみ
    pub per_target: Option<CrossTargetSummary>,
}

/// 設定を検証してモードごとの処理を実行する
pub fn run(config: &RunConfig) -> Result<RunStatus> {
    config.validate()?;
    match config.mode {
        RunMode::Train => run_qsar(config),
        RunMode::Inference => run_inference(config),
        RunMode::BaselineQsar => run_baseline_qsar(config),
        RunMode::BaselineCpi => run_baseline_cpi(config),
    }
}

fn data_path(config: &RunConfig) -> Result<&Path> {
    config
        .data_path
        .as_deref()
        .ok_or_else(|| SiamError::config("data_path is required"))
}

fn sample_options<'a>(config: &'a RunConfig, tag: &'a str, allow_missing_target: bool) -> SampleOptions<'a> {
    SampleOptions {
        columns: &config.columns,
        fingerprint: &config.fingerprint,
        dataset_type: config.dataset_type,
        allow_missing_target,
        tag,
    }
}

/// モデル設定からネットワーク構造を作る
pub fn network_shape(model: &ModelConfig, input_dim: usize, feature_dim: usize) -> NetworkShape {
    NetworkShape {
        input_dim,
        feature_dim,
        hidden_size: model.hidden_size,
        depth: model.depth,
        ffn_hidden_size: model.ffn_hidden_size,
        ffn_num_layers: model.ffn_num_layers,
        dropout: model.dropout,
        activation: model.activation,
    }
}

fn select(samples: &[Sample], indices: &[usize]) -> Vec<Sample> {
    indices.iter().map(|&i| samples[i].clone()).collect()
}

/// 元テーブルの指定行に予測値列を付けて書き出す
fn write_predictions(table: &Table, rows: &[usize], predictions: &[f64], path: &Path) -> Result<()> {
    let values = predictions.iter().map(|p| p.to_string()).collect();
    table.select_rows(rows).with_column(PREDICTION_COLUMN, values)?.write(path)?;
    log::info!("predictions written to {}", path.display());
    Ok(())
}

fn write_json<T: serde::Serialize>(value: &T, path: &Path) -> Result<()> {
    let file = File::create(path).map_err(|e| SiamError::at_path(path, e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush().map_err(|e| SiamError::at_path(path, e))?;
    Ok(())
}

/// 学習データで目的変数・追加特徴量のスケーラを fit する
fn fit_scalers(config: &RunConfig, train: &[Sample]) -> (Option<StandardScaler>, Option<StandardScaler>) {
    let target_scaler = (config.dataset_type == DatasetType::Regression).then(|| {
        let ys: Vec<f64> = train.iter().map(|s| s.target).collect();
        StandardScaler::fit_column(&ys)
    });
    let feature_dim = train.first().map_or(0, |s| s.features.len());
    let feature_scaler = (feature_dim > 0 && config.features_scaling.enabled(true)).then(|| {
        let rows: Vec<Vec<f64>> = train
            .iter()
            .map(|s| s.features.iter().map(|&v| v as f64).collect())
            .collect();
        StandardScaler::fit(&rows, 0.0)
    });
    (target_scaler, feature_scaler)
}

/// Siamese モデルを学習し、テスト集合の予測を書き出す
pub fn run_qsar(config: &RunConfig) -> Result<RunStatus> {
    let save_path = config.save_path();
    let model = &config.model_name;
    let pred_path = save_path.join(format!("{model}_test_pred.csv"));
    if pred_path.exists() {
        log::info!(
            "current task {} for model {model} has been finished, skip...",
            config.data_name()
        );
        return Ok(RunStatus::Skipped { existing: pred_path });
    }
    log::info!("current task: {}", config.data_name());

    fs::create_dir_all(&save_path).map_err(|e| SiamError::at_path(&save_path, e))?;
    let logger = RunLogger::create(&save_path)?;
    logger.event("run_start", json!({ "mode": "train", "config": config }));

    let data_name = config.data_name();
    let dataset = MoleculeDataset::load(
        data_path(config)?,
        sample_options(config, &data_name, false),
        config.max_data_size,
    )?;
    let parts = split::split(&dataset.samples, config.split_type, config.split_sizes, config.seed)?;
    logger.event(
        "split",
        json!({ "train": parts.train.len(), "val": parts.val.len(), "test": parts.test.len() }),
    );

    let train = select(&dataset.samples, &parts.train);
    let (target_scaler, feature_scaler) = fit_scalers(config, &train);
    let train_set = PreparedSet::new(train, target_scaler.as_ref(), feature_scaler.as_ref());
    let val_set = PreparedSet::new(
        select(&dataset.samples, &parts.val),
        target_scaler.as_ref(),
        feature_scaler.as_ref(),
    );
    let test_set = PreparedSet::new(
        select(&dataset.samples, &parts.test),
        target_scaler.as_ref(),
        feature_scaler.as_ref(),
    );

    let shape = network_shape(&config.model, config.fingerprint.dims, dataset.feature_dim());
    let mut network = SiameseNetwork::new(shape);
    network.init_random(&mut ChaCha8Rng::seed_from_u64(config.seed));
    if let Some(pretrained) = &config.checkpoint_path {
        log::info!("loading pretrained encoder from {}", pretrained.display());
        checkpoint::load_pretrained_encoder(&mut network, pretrained)?;
    }

    let mut trainer = Trainer::new(
        config.clone(),
        network,
        train_set.len(),
        target_scaler,
        feature_scaler,
    );
    logger.event("phase", json!({ "to": trainer.phase().to_string() }));
    let outcome = trainer.fit(&train_set, &val_set, &test_set, &save_path, &logger)?;

    write_json(&outcome.history, &save_path.join(format!("{model}_metric_dict.json")))?;
    let test_rows: Vec<usize> = test_set.samples.iter().map(|s| s.row).collect();
    write_predictions(&dataset.table, &test_rows, &outcome.test_predictions, &pred_path)?;
    log::info!(
        "Prediction saved, RMSE: {:.4}, RMSE_cliff: {:.4}",
        outcome.final_rmse,
        outcome.final_cliff_rmse
    );

    trainer.set_phase(Phase::Finished, &logger);
    logger.event(
        "run_end",
        json!({
            "best_epoch": outcome.best_epoch,
            "rmse": outcome.final_rmse,
            "cliff_rmse": outcome.final_cliff_rmse,
        }),
    );
    logger.close()?;

    Ok(RunStatus::Completed(RunSummary {
        mode: RunMode::Train,
        predictions: pred_path,
        rmse: outcome.final_rmse,
        cliff_rmse: outcome.final_cliff_rmse,
        best_epoch: outcome.best_epoch,
        per_target: None,
    }))
}

/// 学習済みチェックポイントで `test_path` の分子を予測する
///
/// 参照プールは `data_path` の学習用の行（チェックポイント作成時と同じ分割）。
pub fn run_inference(config: &RunConfig) -> Result<RunStatus> {
    let ckpt_path = config
        .checkpoint_path
        .as_deref()
        .ok_or_else(|| SiamError::config("inference mode requires checkpoint_path"))?;
    let test_path = config
        .test_path
        .as_deref()
        .ok_or_else(|| SiamError::config("inference mode requires test_path"))?;

    let ckpt = Checkpoint::load(ckpt_path)?;
    let network = ckpt.build_network()?;
    let trained = &ckpt.meta.config;
    log::info!(
        "loaded {} ({} parameters) from {}",
        trained.model_name,
        network.param_count(),
        ckpt_path.display()
    );

    let save_path = config.save_path();
    fs::create_dir_all(&save_path).map_err(|e| SiamError::at_path(&save_path, e))?;
    let logger = RunLogger::create(&save_path)?;
    logger.event(
        "run_start",
        json!({ "mode": "inference", "checkpoint": ckpt_path, "test_path": test_path }),
    );

    // 特徴量化と分割は学習時の設定に合わせる
    let data_name = config.data_name();
    let reference = MoleculeDataset::load(
        data_path(config)?,
        sample_options(trained, &data_name, false),
        trained.max_data_size,
    )?;
    let parts = split::split(&reference.samples, trained.split_type, trained.split_sizes, trained.seed)?;
    let queries = MoleculeDataset::load(test_path, sample_options(trained, PROTOTYPE_TAG, true), None)?;
    if queries.feature_dim() != network.shape.feature_dim && !queries.is_empty() {
        return Err(SiamError::DimensionMismatch {
            name: "query features".to_string(),
            expected: network.shape.feature_dim,
            actual: queries.feature_dim(),
        });
    }

    let target_scaler = ckpt.meta.target_scaler.as_ref();
    let feature_scaler = ckpt.meta.feature_scaler.as_ref();
    let pool = PreparedSet::new(select(&reference.samples, &parts.train), target_scaler, feature_scaler);
    let query_set = PreparedSet::new(queries.samples.clone(), target_scaler, feature_scaler);

    let mut rng = ChaCha8Rng::seed_from_u64(trained.seed);
    let pairs = generate_pairs(&query_set.samples, &pool.samples, PairStrategy::Full, 1, false, &mut rng)?;
    let predictions = predict_queries(
        &network,
        trained.dataset_type,
        target_scaler,
        &query_set,
        &pool,
        &pairs,
    );

    let pred_path = save_path.join(format!("{}_inference_pred.csv", trained.model_name));
    let all_rows: Vec<usize> = (0..queries.table.len()).collect();
    write_predictions(&queries.table, &all_rows, &predictions, &pred_path)?;

    // 目的変数が与えられていれば評価もする
    let targets = query_set.raw_targets();
    let cliffs: Vec<bool> = query_set.samples.iter().map(|s| s.cliff).collect();
    let (rmse_value, cliff_value) = if targets.iter().all(|t| !t.is_nan()) && !targets.is_empty() {
        (rmse(&targets, &predictions), cliff_rmse(&targets, &predictions, &cliffs))
    } else {
        (f64::NAN, f64::NAN)
    };
    logger.event(
        "run_end",
        json!({ "queries": query_set.len(), "pool": pool.len(), "pairs": pairs.len() }),
    );
    logger.close()?;

    Ok(RunStatus::Completed(RunSummary {
        mode: RunMode::Inference,
        predictions: pred_path,
        rmse: rmse_value,
        cliff_rmse: cliff_value,
        best_epoch: None,
        per_target: None,
    }))
}

fn baseline_id(config: &RunConfig) -> Result<&str> {
    config
        .baseline_model
        .as_deref()
        .ok_or_else(|| SiamError::config("baseline modes require baseline_model"))
}

/// ベースラインを学習してテスト集合を予測する（予測はテスト集合の順）
fn fit_baseline(
    config: &RunConfig,
    id: &str,
    samples: &[Sample],
    parts: &DatasetSplit,
    input_dim: usize,
    save_path: &Path,
    logger: &RunLogger,
) -> Result<Vec<f64>> {
    let registry = BaselineRegistry::default();
    let mut model = registry.create(id, &BaselineParams::from_config(config, input_dim))?;

    let rows = |idx: &[usize]| -> (Vec<Vec<usize>>, Vec<f64>) {
        idx.iter()
            .map(|&i| (samples[i].active.clone(), samples[i].target))
            .unzip()
    };
    // 検証集合を使わないバックエンドは train 側の全行で学習する
    let (train_idx, val_idx) = if model.uses_validation() {
        (parts.train.clone(), parts.val.clone())
    } else {
        (parts.train.iter().chain(&parts.val).copied().collect(), Vec::new())
    };
    let (x_train, y_train) = rows(&train_idx);
    let (x_val, y_val) = rows(&val_idx);
    let (x_test, _) = rows(&parts.test);

    log::info!("training size: {}, test size: {}", x_train.len(), x_test.len());
    log::info!("training {id}...");
    logger.event("baseline_train", json!({ "model": id, "train": x_train.len(), "val": x_val.len() }));

    let val = (!x_val.is_empty()).then(|| (Fingerprints::new(input_dim, &x_val), y_val.as_slice()));
    model.train(Fingerprints::new(input_dim, &x_train), &y_train, val)?;
    model.save(save_path, id)?;
    model.predict(Fingerprints::new(input_dim, &x_test))
}

/// QSAR ベースライン
pub fn run_baseline_qsar(config: &RunConfig) -> Result<RunStatus> {
    let id = baseline_id(config)?;
    let save_path = config.save_path();
    log::info!("current task: {}", config.data_name());
    fs::create_dir_all(&save_path).map_err(|e| SiamError::at_path(&save_path, e))?;
    let logger = RunLogger::create(&save_path)?;
    logger.event("run_start", json!({ "mode": "baseline-qsar", "model": id }));

    let data_name = config.data_name();
    let dataset = MoleculeDataset::load(
        data_path(config)?,
        sample_options(config, &data_name, false),
        config.max_data_size,
    )?;
    let parts = split::split(&dataset.samples, config.split_type, config.split_sizes, config.seed)?;

    let predictions = fit_baseline(
        config,
        id,
        &dataset.samples,
        &parts,
        config.fingerprint.dims,
        &save_path,
        &logger,
    )?;

    let targets: Vec<f64> = parts.test.iter().map(|&i| dataset.samples[i].target).collect();
    let cliffs: Vec<bool> = parts.test.iter().map(|&i| dataset.samples[i].cliff).collect();
    let rmse_value = rmse(&targets, &predictions);
    let cliff_value = cliff_rmse(&targets, &predictions, &cliffs);

    let test_rows: Vec<usize> = parts.test.iter().map(|&i| dataset.samples[i].row).collect();
    let pred_path = save_path.join(format!("{id}_test_pred.csv"));
    write_predictions(&dataset.table, &test_rows, &predictions, &pred_path)?;
    log::info!("Prediction saved, RMSE: {rmse_value:.4}, RMSE_cliff: {cliff_value:.4}");

    logger.event("run_end", json!({ "rmse": rmse_value, "cliff_rmse": cliff_value }));
    logger.close()?;

    Ok(RunStatus::Completed(RunSummary {
        mode: RunMode::BaselineQsar,
        predictions: pred_path,
        rmse: rmse_value,
        cliff_rmse: cliff_value,
        best_epoch: None,
        per_target: None,
    }))
}

/// CPI ベースライン（分子 + 標的配列のフィンガープリント）
///
/// `Label` 列は目的変数列名に変更し、標的ごとの RMSE を平均 ± 標準偏差で集計する。
pub fn run_baseline_cpi(config: &RunConfig) -> Result<RunStatus> {
    let id = baseline_id(config)?;
    let save_path = config.save_path();
    let data_name = config.data_name();
    log::info!("current task: {data_name}");
    fs::create_dir_all(&save_path).map_err(|e| SiamError::at_path(&save_path, e))?;
    let logger = RunLogger::create(&save_path)?;
    logger.event("run_start", json!({ "mode": "baseline-cpi", "model": id }));

    let mut table = Table::read(data_path(config)?)?;
    if let Some(n) = config.max_data_size {
        table = table.head(n);
    }
    let target_col = &config.columns.target;
    if !table.has_column(target_col) && table.has_column(CPI_LABEL_COLUMN) {
        table = table.rename_column(CPI_LABEL_COLUMN, target_col);
    }
    let group_col = CPI_GROUP_COLUMNS
        .iter()
        .copied()
        .find(|c| table.has_column(c))
        .ok_or_else(|| {
            SiamError::data(format!("CPI data needs one of the columns {CPI_GROUP_COLUMNS:?}"))
        })?;
    let groups: Vec<String> = table.column(group_col)?.into_iter().map(str::to_string).collect();

    let mut dataset = MoleculeDataset::from_table(table, sample_options(config, &data_name, false))?
        .with_protein_features(&config.columns.sequence, &config.fingerprint)?;
    for sample in &mut dataset.samples {
        sample.tag = groups[sample.row].clone();
    }
    let parts = split::split(&dataset.samples, config.split_type, config.split_sizes, config.seed)?;

    let input_dim = 2 * config.fingerprint.dims;
    let predictions = fit_baseline(config, id, &dataset.samples, &parts, input_dim, &save_path, &logger)?;

    let test: Vec<&Sample> = parts.test.iter().map(|&i| &dataset.samples[i]).collect();
    let targets: Vec<f64> = test.iter().map(|s| s.target).collect();
    let cliffs: Vec<bool> = test.iter().map(|s| s.cliff).collect();
    let tags: Vec<String> = test.iter().map(|s| s.tag.clone()).collect();
    let summary = per_target_summary(&tags, &targets, &predictions, &cliffs);

    let test_rows: Vec<usize> = test.iter().map(|s| s.row).collect();
    let pred_path = save_path.join(format!("{data_name}_test_pred.csv"));
    write_predictions(&dataset.table, &test_rows, &predictions, &pred_path)?;
    log::info!(
        "Prediction saved, RMSE: {:.4}±{:.4}, RMSE_cliff: {:.4}±{:.4}",
        summary.rmse_mean,
        summary.rmse_std,
        summary.cliff_rmse_mean,
        summary.cliff_rmse_std
    );

    logger.event("run_end", json!({ "model": id, "summary": summary }));
    logger.close()?;

    Ok(RunStatus::Completed(RunSummary {
        mode: RunMode::BaselineCpi,
        predictions: pred_path,
        rmse: summary.rmse_mean,
        cliff_rmse: summary.cliff_rmse_mean,
        best_epoch: None,
        per_target: Some(summary),
    }))
}
