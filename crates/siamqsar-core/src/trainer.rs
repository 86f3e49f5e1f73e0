//! 学習ループ
//!
//! エポック単位で Siamese ペアを学習し、検証・テストで評価しながら
//! 最良チェックポイントを保存する。

use crate::checkpoint::Checkpoint;
use crate::config::{DatasetType, RunConfig};
use crate::data::Sample;
use crate::error::Result;
use crate::logging::RunLogger;
use crate::loss::{sigmoid, CompositeLoss};
use crate::metrics::{cliff_rmse, rmse, LossRecord, Metric, MetricHistory, Score};
use crate::nn::{Adam, LrScheduler, MolInput, Optimizer, SiameseNetwork, StepUnit};
use crate::pairs::{generate_pairs, PairStrategy, SiamesePairs};
use crate::scaler::StandardScaler;
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde_json::json;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 小さすぎるデータセットで使うバッチサイズ
pub const SMALL_DATA_BATCH_SIZE: usize = 64;

/// 学習の段階
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Training,
    Evaluating,
    Checkpointing,
    Finished,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "Initializing",
            Self::Training => "Training",
            Self::Evaluating => "Evaluating",
            Self::Checkpointing => "Checkpointing",
            Self::Finished => "Finished",
        };
        f.write_str(s)
    }
}

/// スケーリング済みの入力を持つサンプル集合
#[derive(Clone, Debug, Default)]
pub struct PreparedSet {
    pub samples: Vec<Sample>,
    /// 学習に使う目的変数（回帰はスケール済み、分類は 0/1）
    pub targets: Vec<f32>,
    /// スケール済みの追加特徴量
    pub features: Vec<Vec<f32>>,
}

impl PreparedSet {
    pub fn new(
        samples: Vec<Sample>,
        target_scaler: Option<&StandardScaler>,
        feature_scaler: Option<&StandardScaler>,
    ) -> Self {
        let targets = samples
            .iter()
            .map(|s| match target_scaler {
                Some(sc) if !s.target.is_nan() => sc.transform(s.target) as f32,
                _ => s.target as f32,
            })
            .collect();
        let features = samples
            .iter()
            .map(|s| match feature_scaler {
                Some(sc) => {
                    let row: Vec<f64> = s.features.iter().map(|&v| v as f64).collect();
                    sc.transform_row(&row).into_iter().map(|v| v as f32).collect()
                }
                None => s.features.iter().map(|&v| if v.is_nan() { 0.0 } else { v }).collect(),
            })
            .collect();
        Self {
            samples,
            targets,
            features,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// 元の単位の目的変数
    pub fn raw_targets(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.target).collect()
    }

    fn input(&self, i: usize) -> MolInput<'_> {
        MolInput {
            active: &self.samples[i].active,
            features: &self.features[i],
        }
    }
}

/// ペアの出力をクエリごとに集約した予測値（元の単位、分類では確率）
pub fn predict_queries(
    network: &SiameseNetwork,
    dataset_type: DatasetType,
    target_scaler: Option<&StandardScaler>,
    queries: &PreparedSet,
    pool: &PreparedSet,
    pairs: &SiamesePairs,
) -> Vec<f64> {
    if pairs.is_empty() {
        return vec![f64::NAN; queries.len()];
    }
    // 推論時は各分子を一度だけエンコードする
    let q_emb: Vec<Vec<f32>> = queries
        .samples
        .iter()
        .map(|s| network.encode(&s.active, None).embedding().to_vec())
        .collect();
    let r_emb: Vec<Vec<f32>> = pool
        .samples
        .iter()
        .map(|s| network.encode(&s.active, None).embedding().to_vec())
        .collect();

    let outputs: Vec<f64> = pairs
        .query
        .iter()
        .zip(&pairs.reference)
        .map(|(&q, &r)| {
            let head = network.head_forward(
                &q_emb[q],
                &queries.features[q],
                &r_emb[r],
                &pool.features[r],
                None,
            );
            let out = head.output as f64;
            match dataset_type {
                DatasetType::Regression => target_scaler.map_or(out, |sc| sc.inverse_transform(out)),
                DatasetType::Classification => sigmoid(head.output) as f64,
            }
        })
        .collect();
    pairs.mean_by_query(&outputs)
}

/// `len(train) * siams_num <= batch_size` のときはバッチサイズを 64 にする
pub fn effective_batch_size(train_len: usize, siams_num: usize, batch_size: usize) -> usize {
    if train_len * siams_num <= batch_size {
        log::info!("batch size {batch_size} is too large for {train_len} x {siams_num} pairs, reset to {SMALL_DATA_BATCH_SIZE}");
        SMALL_DATA_BATCH_SIZE
    } else {
        batch_size
    }
}

/// 学習結果
#[derive(Clone, Debug)]
pub struct TrainOutcome {
    pub best_epoch: Option<usize>,
    pub best_val_score: f64,
    pub best_test_score: f64,
    pub final_rmse: f64,
    pub final_cliff_rmse: f64,
    /// 最良チェックポイントによるテスト予測（テスト集合の順）
    pub test_predictions: Vec<f64>,
    pub history: MetricHistory,
    pub checkpoint_path: PathBuf,
}

/// トレーナー
pub struct Trainer {
    config: RunConfig,
    network: SiameseNetwork,
    optimizer: Adam,
    scheduler: LrScheduler,
    loss: CompositeLoss,
    metric: Metric,
    batch_size: usize,
    target_scaler: Option<StandardScaler>,
    feature_scaler: Option<StandardScaler>,
    rng: ChaCha8Rng,
    interrupted: Arc<AtomicBool>,
    phase: Phase,
}

impl Trainer {
    /// 新しいトレーナーを作成
    ///
    /// `network` は初期化済み（必要なら事前学習済みエンコーダを読み込み済み）であること。
    pub fn new(
        config: RunConfig,
        mut network: SiameseNetwork,
        train_len: usize,
        target_scaler: Option<StandardScaler>,
        feature_scaler: Option<StandardScaler>,
    ) -> Self {
        let t = &config.train;
        let batch_size = effective_batch_size(train_len, t.siams_num, t.batch_size);
        let steps_per_epoch = (train_len * t.siams_num).div_ceil(batch_size).max(1);
        let scheduler = LrScheduler::from_settings(t, steps_per_epoch);
        let optimizer = Adam::new(&mut network, scheduler.lr()).with_weight_decay(t.weight_decay);
        let loss = CompositeLoss::new(config.dataset_type, t.loss_weights, t.temperature);
        // 学習用の乱数はモデル初期化とは別系列にする
        let rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(1));

        Self {
            metric: config.resolved_metric(),
            config,
            network,
            optimizer,
            scheduler,
            loss,
            batch_size,
            target_scaler,
            feature_scaler,
            rng,
            interrupted: Arc::new(AtomicBool::new(false)),
            phase: Phase::Initializing,
        }
    }

    /// 中断フラグを取得
    pub fn interrupted(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    pub fn network(&self) -> &SiameseNetwork {
        &self.network
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase, logger: &RunLogger) {
        if self.phase != phase {
            log::debug!("phase: {} -> {}", self.phase, phase);
            logger.event("phase", json!({ "from": self.phase.to_string(), "to": phase.to_string() }));
            self.phase = phase;
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint::from_network(
            &self.network,
            &self.config,
            self.target_scaler.as_ref(),
            self.feature_scaler.as_ref(),
        )
    }

    /// 学習を実行
    ///
    /// 最良モデルは学習データのタスク損失（回帰は MSE、分類は CLS）で選ぶ。
    /// 最初のエポックは常に最良として保存し、以降は損失が厳密に下がったときだけ上書きする。
    /// 学習後は最良チェックポイントを読み直してテスト集合を予測する。
    pub fn fit(
        &mut self,
        train: &PreparedSet,
        val: &PreparedSet,
        test: &PreparedSet,
        save_dir: &Path,
        logger: &RunLogger,
    ) -> Result<TrainOutcome> {
        let t = self.config.train.clone();
        let checkpoint_path = save_dir.join(format!("{}_model.pt", self.config.model_name));

        log::info!("generating siamese pairs...");
        let mut train_pairs =
            generate_pairs(&train.samples, &train.samples, PairStrategy::Random, t.siams_num, t.exclude_self_pairs, &mut self.rng)?;
        let val_pairs =
            generate_pairs(&val.samples, &train.samples, PairStrategy::Random, t.siams_num, t.exclude_self_pairs, &mut self.rng)?;
        let test_pairs = generate_pairs(&test.samples, &train.samples, PairStrategy::Full, t.siams_num, false, &mut self.rng)?;

        let (val_set, val_eval_pairs) = if val.is_empty() {
            log::warn!("validation set is empty; scoring on the training pairs instead");
            (train, train_pairs.clone())
        } else {
            (val, val_pairs)
        };

        log::info!(
            "training {} pairs / batch {} / {} parameters",
            train_pairs.len(),
            self.batch_size,
            self.network.param_count()
        );
        logger.event(
            "train_start",
            json!({
                "train": train.len(),
                "val": val.len(),
                "test": test.len(),
                "train_pairs": train_pairs.len(),
                "test_pairs": test_pairs.len(),
                "batch_size": self.batch_size,
                "parameters": self.network.param_count(),
            }),
        );

        let mut history = MetricHistory::new(self.metric);
        let mut best_loss = f64::INFINITY;
        let mut best_epoch = None;
        let mut best_val_score = self.metric.worst();
        let mut best_test_score = self.metric.worst();

        for epoch in 0..t.epochs {
            if self.interrupted.load(Ordering::SeqCst) {
                log::warn!("interrupted at epoch {epoch}");
                break;
            }

            self.set_phase(Phase::Training, logger);
            train_pairs.shuffle(&mut self.rng);
            let losses = self.train_epoch(train, &train_pairs, epoch);
            if self.scheduler.unit() == StepUnit::Epoch {
                let lr = self.scheduler.step();
                self.optimizer.set_lr(lr);
            }

            self.set_phase(Phase::Evaluating, logger);
            let val_pred = self.predict(val_set, train, &val_eval_pairs);
            let val_score = Score::compute(self.metric, &val_set.raw_targets(), &val_pred);
            let test_pred = self.predict(test, train, &test_pairs);
            let test_score = Score::compute(self.metric, &test.raw_targets(), &test_pred);

            if self.config.print {
                log::info!(
                    "Epoch : {epoch:02}, Loss_Total: {:.3}, Loss_MSE: {:.3}, Loss_CLS: {:.3}, Loss_CL: {:.3}, \
                     Validation score : {:.3}, Test score : {:.3}",
                    losses.total,
                    losses.mse,
                    losses.cls,
                    losses.cl,
                    val_score.value,
                    test_score.value
                );
            }
            logger.event(
                "epoch",
                json!({
                    "epoch": epoch,
                    "loss": losses,
                    "lr": self.optimizer.get_lr(),
                    "val": finite_or_null(val_score.value),
                    "test": finite_or_null(test_score.value),
                }),
            );
            history.collect_epoch(epoch, &losses, &val_score, &test_score);

            // 最初のエポックは無条件に最良とする
            let task_loss = losses.task(self.config.dataset_type);
            if epoch == 0 || task_loss < best_loss {
                best_loss = task_loss;
                best_epoch = Some(epoch);
                best_val_score = val_score.value;
                best_test_score = test_score.value;
                self.set_phase(Phase::Checkpointing, logger);
                let mut checkpoint = self.checkpoint();
                checkpoint.meta.epoch = Some(epoch);
                checkpoint.save(&checkpoint_path)?;
                logger.event("checkpoint", json!({ "epoch": epoch, "task_loss": task_loss }));
            }
        }

        match best_epoch {
            Some(epoch) => log::info!(
                "Final best performed model in {epoch} epoch, val score: {best_val_score:.4}, test score: {best_test_score:.4}"
            ),
            None => {
                log::warn!("no epoch completed; saving the initial model");
                self.checkpoint().save(&checkpoint_path)?;
            }
        }

        // 最良チェックポイントを読み直してテスト集合を予測する
        self.set_phase(Phase::Evaluating, logger);
        self.network = Checkpoint::load(&checkpoint_path)?.build_network()?;
        let test_predictions = self.predict(test, train, &test_pairs);
        let test_targets = test.raw_targets();
        let cliff_mask: Vec<bool> = test.samples.iter().map(|s| s.cliff).collect();

        Ok(TrainOutcome {
            best_epoch,
            best_val_score,
            best_test_score,
            final_rmse: rmse(&test_targets, &test_predictions),
            final_cliff_rmse: cliff_rmse(&test_targets, &test_predictions, &cliff_mask),
            test_predictions,
            history,
            checkpoint_path,
        })
    }

    /// 1エポックの学習（学習データ平均の損失を返す）
    fn train_epoch(&mut self, train: &PreparedSet, pairs: &SiamesePairs, epoch: usize) -> LossRecord {
        let num_batches = pairs.len().div_ceil(self.batch_size);
        let progress = if self.config.print {
            ProgressBar::new(num_batches as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) =
            ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss:{msg}")
        {
            progress.set_style(style);
        }

        let mut total = LossRecord::default();
        let mut seen = 0usize;

        for (batch_idx, range) in pairs.batches(self.batch_size).enumerate() {
            if self.interrupted.load(Ordering::SeqCst) {
                break;
            }
            let n = range.len();
            let record = self.train_batch(train, pairs, range);
            total.accumulate(&record, n as f64);
            seen += n;

            if batch_idx % 10 == 0 {
                progress.set_message(format!("{:.6}", total.total / seen as f64));
            }
            progress.inc(1);
        }
        progress.finish_and_clear();

        if seen == 0 {
            log::warn!("epoch {epoch} processed no pairs");
            return total;
        }
        total.scaled(1.0 / seen as f64)
    }

    /// バッチ1つ分の順伝播・逆伝播・更新
    fn train_batch(&mut self, train: &PreparedSet, pairs: &SiamesePairs, range: std::ops::Range<usize>) -> LossRecord {
        self.network.zero_grad();

        let mut caches = Vec::with_capacity(range.len());
        let mut predictions = Vec::with_capacity(range.len());
        let mut targets = Vec::with_capacity(range.len());
        let mut pair_targets = Vec::with_capacity(range.len());
        for pos in range.clone() {
            let (q, r) = (pairs.query[pos], pairs.reference[pos]);
            let cache = self
                .network
                .forward_pair(train.input(q), train.input(r), Some(&mut self.rng));
            predictions.push(cache.output());
            targets.push(train.targets[q]);
            pair_targets.push(self.loss.pair_target(train.targets[q], train.targets[r]));
            caches.push(cache);
        }

        let e_q: Vec<&[f32]> = caches.iter().map(|c| c.query.embedding()).collect();
        let e_r: Vec<&[f32]> = caches.iter().map(|c| c.reference.embedding()).collect();
        let out = self.loss.forward(&predictions, &targets, &e_q, &e_r, &pair_targets);

        for ((pos, cache), grad) in range.zip(&caches).zip(&out.grads) {
            let (q, r) = (pairs.query[pos], pairs.reference[pos]);
            self.network
                .backward_pair(train.input(q), train.input(r), cache, grad.output, &grad.e_q, &grad.e_r);
        }
        self.optimizer.step(&mut self.network);

        if self.scheduler.unit() == StepUnit::Batch {
            let lr = self.scheduler.step();
            self.optimizer.set_lr(lr);
        }
        out.record
    }

    /// クエリごとの予測値（元の単位）
    pub fn predict(&self, queries: &PreparedSet, pool: &PreparedSet, pairs: &SiamesePairs) -> Vec<f64> {
        predict_queries(
            &self.network,
            self.config.dataset_type,
            self.target_scaler.as_ref(),
            queries,
            pool,
            pairs,
        )
    }
}

fn finite_or_null(v: f64) -> serde_json::Value {
    if v.is_finite() {
        json!(v)
    } else {
        serde_json::Value::Null
    }
}
