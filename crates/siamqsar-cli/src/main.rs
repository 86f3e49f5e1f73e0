//! siamqsar: Siamese 対照学習 / ベースラインの実行
//!
//! 使用例:
//! ```bash
//! # TOML 設定で学習
//! siamqsar --config configs/chembl.toml
//!
//! # 設定ファイル無しで moleculeACE 分割の学習
//! siamqsar --mode train --data-path data/CHEMBL1862_Ki.csv --epochs 100
//!
//! # ベースライン
//! siamqsar --mode baseline-qsar --data-path data/CHEMBL1862_Ki.csv --baseline-model KNN
//! ```

use anyhow::{Context, Result};
use clap::Parser as _;
use siamqsar_core::config::{FeatureScaling, SchedulerKind};
use siamqsar_core::nn::Activation;
use siamqsar_core::{DatasetType, Metric, RunConfig, RunMode, RunStatus, SplitType};
use std::path::PathBuf;

/// Exponential 指定で gamma が無いときの値
const DEFAULT_GAMMA: f32 = 0.95;

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum SchedulerArg {
    Noam,
    Exponential,
}

#[derive(clap::Parser, Debug)]
#[command(
    name = "siamqsar",
    about = "Siamese contrastive QSAR / CPI training, inference and baselines"
)]
struct Cli {
    /// TOML configuration file (CLI options override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run mode: train, inference, baseline-qsar, baseline-cpi
    #[arg(long)]
    mode: Option<RunMode>,

    /// Input CSV (plain or .gz)
    #[arg(long)]
    data_path: Option<PathBuf>,

    /// Query CSV for inference
    #[arg(long)]
    test_path: Option<PathBuf>,

    /// Output root directory
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Pretrained encoder (train) or trained model (inference)
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// regression or classification
    #[arg(long)]
    dataset_type: Option<DatasetType>,

    #[arg(long)]
    seed: Option<u64>,

    /// random, scaffold_balanced, moleculeACE, predetermined
    #[arg(long)]
    split_type: Option<SplitType>,

    /// train / validation / test ratios
    #[arg(long, num_args = 3, value_names = ["TRAIN", "VAL", "TEST"])]
    split_sizes: Option<Vec<f64>>,

    /// auc, prc-auc, rmse, mae, r2, accuracy, cross_entropy
    #[arg(long)]
    metric: Option<Metric>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    lr: Option<f32>,

    #[arg(long)]
    warmup_epochs: Option<usize>,

    #[arg(long, value_enum)]
    scheduler: Option<SchedulerArg>,

    /// Decay factor of the exponential scheduler
    #[arg(long)]
    gamma: Option<f32>,

    #[arg(long)]
    weight_decay: Option<f32>,

    #[arg(long)]
    hidden_size: Option<usize>,

    #[arg(long)]
    depth: Option<usize>,

    #[arg(long)]
    ffn_hidden_size: Option<usize>,

    #[arg(long)]
    ffn_num_layers: Option<usize>,

    #[arg(long)]
    dropout: Option<f32>,

    /// ReLU, LeakyReLU, tanh, ELU
    #[arg(long)]
    activation: Option<Activation>,

    /// Contrastive loss temperature
    #[arg(long)]
    temperature: Option<f32>,

    /// Siamese pairs per query
    #[arg(long)]
    siams_num: Option<usize>,

    /// Weight of the task loss
    #[arg(long)]
    task_weight: Option<f32>,

    /// Weight of the contrastive loss
    #[arg(long)]
    cl_weight: Option<f32>,

    /// auto, on, off
    #[arg(long)]
    features_scaling: Option<FeatureScaling>,

    /// Extra numeric feature columns
    #[arg(long, num_args = 1..)]
    feature_columns: Option<Vec<String>>,

    /// Fingerprint hash dimensions
    #[arg(long)]
    fp_dims: Option<usize>,

    /// Maximum SMILES n-gram length
    #[arg(long)]
    max_ngram: Option<usize>,

    /// Baseline id (KNN, Ridge, MLP / DeepDTA, GraphDTA, MolTrans)
    #[arg(long)]
    baseline_model: Option<String>,

    /// Model name used in output file names
    #[arg(long)]
    model_name: Option<String>,

    #[arg(long)]
    max_data_size: Option<usize>,

    /// Hide progress bars and per-epoch lines
    #[arg(long)]
    quiet: bool,
}

impl Cli {
    /// 設定ファイル（無ければデフォルト）に CLI の値を上書きする
    fn into_config(self) -> Result<RunConfig> {
        let mut cfg = match &self.config {
            Some(path) => RunConfig::from_toml_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => RunConfig::default(),
        };

        macro_rules! set {
            ($field:expr, $value:expr) => {
                if let Some(v) = $value {
                    $field = v;
                }
            };
        }

        set!(cfg.mode, self.mode);
        if self.data_path.is_some() {
            cfg.data_path = self.data_path;
        }
        if self.test_path.is_some() {
            cfg.test_path = self.test_path;
        }
        set!(cfg.save_dir, self.save_dir);
        if self.checkpoint.is_some() {
            cfg.checkpoint_path = self.checkpoint;
        }
        set!(cfg.dataset_type, self.dataset_type);
        set!(cfg.seed, self.seed);
        set!(cfg.split_type, self.split_type);
        if let Some(sizes) = self.split_sizes {
            cfg.split_sizes = [sizes[0], sizes[1], sizes[2]];
        }
        if self.metric.is_some() {
            cfg.metric = self.metric;
        }

        let t = &mut cfg.train;
        set!(t.epochs, self.epochs);
        set!(t.batch_size, self.batch_size);
        set!(t.lr, self.lr);
        set!(t.warmup_epochs, self.warmup_epochs);
        set!(t.weight_decay, self.weight_decay);
        set!(t.temperature, self.temperature);
        set!(t.siams_num, self.siams_num);
        set!(t.loss_weights.task, self.task_weight);
        set!(t.loss_weights.contrastive, self.cl_weight);
        match (self.scheduler, self.gamma) {
            (Some(SchedulerArg::Noam), _) => t.scheduler = SchedulerKind::Noam,
            (Some(SchedulerArg::Exponential), gamma) => {
                t.scheduler = SchedulerKind::Exponential {
                    gamma: gamma.unwrap_or(DEFAULT_GAMMA),
                }
            }
            (None, Some(g)) => {
                if let SchedulerKind::Exponential { gamma } = &mut t.scheduler {
                    *gamma = g;
                } else {
                    log::warn!("--gamma is ignored without the exponential scheduler");
                }
            }
            (None, None) => {}
        }

        let m = &mut cfg.model;
        set!(m.hidden_size, self.hidden_size);
        set!(m.depth, self.depth);
        set!(m.ffn_hidden_size, self.ffn_hidden_size);
        set!(m.ffn_num_layers, self.ffn_num_layers);
        set!(m.dropout, self.dropout);
        set!(m.activation, self.activation);

        set!(cfg.features_scaling, self.features_scaling);
        set!(cfg.columns.features, self.feature_columns);
        set!(cfg.fingerprint.dims, self.fp_dims);
        set!(cfg.fingerprint.max_ngram, self.max_ngram);
        if self.baseline_model.is_some() {
            cfg.baseline_model = self.baseline_model;
        }
        set!(cfg.model_name, self.model_name);
        if self.max_data_size.is_some() {
            cfg.max_data_size = self.max_data_size;
        }
        if self.quiet {
            cfg.print = false;
        }
        Ok(cfg)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.into_config()?;
    config.validate().context("invalid configuration")?;

    match siamqsar_core::run(&config).context("run failed")? {
        RunStatus::Skipped { existing } => {
            println!("skipped: {} already exists", existing.display());
        }
        RunStatus::Completed(summary) => {
            println!("predictions: {}", summary.predictions.display());
            println!("RMSE: {:.4}, RMSE_cliff: {:.4}", summary.rmse, summary.cliff_rmse);
            if let Some(epoch) = summary.best_epoch {
                println!("best epoch: {epoch}");
            }
            if let Some(per_target) = summary.per_target {
                println!(
                    "per target ({}): RMSE {:.4}±{:.4}, RMSE_cliff {:.4}±{:.4}",
                    per_target.per_target.len(),
                    per_target.rmse_mean,
                    per_target.rmse_std,
                    per_target.cliff_rmse_mean,
                    per_target.cliff_rmse_std
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> RunConfig {
        let mut full = vec!["siamqsar"];
        full.extend_from_slice(args);
        Cli::try_parse_from(full).unwrap().into_config().unwrap()
    }

    #[test]
    fn test_cli_overrides_defaults() {
        let cfg = parse(&[
            "--mode",
            "baseline-qsar",
            "--data-path",
            "d/CHEMBL1.csv",
            "--split-sizes",
            "0.7",
            "0.1",
            "0.2",
            "--scheduler",
            "exponential",
            "--activation",
            "tanh",
            "--quiet",
        ]);
        assert_eq!(cfg.mode, RunMode::BaselineQsar);
        assert_eq!(cfg.split_sizes, [0.7, 0.1, 0.2]);
        assert_eq!(cfg.train.scheduler, SchedulerKind::Exponential { gamma: DEFAULT_GAMMA });
        assert_eq!(cfg.model.activation, Activation::Tanh);
        assert!(!cfg.print);
    }

    #[test]
    fn test_split_sizes_needs_three_values() {
        assert!(Cli::try_parse_from(["siamqsar", "--split-sizes", "0.8", "0.2"]).is_err());
    }
}
