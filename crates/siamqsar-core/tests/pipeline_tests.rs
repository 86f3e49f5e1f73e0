//! 実行モードの結合テスト（小さな合成データで学習から予測の書き出しまで）

use siamqsar_core::data::Table;
use siamqsar_core::logging::RUN_LOG_FILE;
use siamqsar_core::pipeline::{self, PREDICTION_COLUMN};
use siamqsar_core::{run, RunConfig, RunMode, RunStatus, SiamError, SplitType};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const N_TRAIN: usize = 24;
const N_TEST: usize = 6;

fn smiles(i: usize) -> String {
    format!("{}O{}", "C".repeat(1 + i % 5), "N".repeat(i % 3))
}

fn activity(i: usize) -> f64 {
    5.0 + (i % 5) as f64 * 0.5 + (i % 3) as f64 * 0.2
}

/// smiles,y,split,cliff_mol の回帰データ
fn write_qsar_csv(dir: &Path, name: &str) -> PathBuf {
    let mut text = String::from("smiles,y,split,cliff_mol\n");
    for i in 0..N_TRAIN + N_TEST {
        let split = if i < N_TRAIN { "train" } else { "test" };
        writeln!(text, "{},{:.2},{split},{}", smiles(i), activity(i), u8::from(i % 4 == 0)).unwrap();
    }
    let path = dir.join(name);
    fs::write(&path, text).unwrap();
    path
}

fn small_config(data_path: PathBuf, save_dir: &Path) -> RunConfig {
    let mut cfg = RunConfig {
        data_path: Some(data_path),
        save_dir: save_dir.to_path_buf(),
        print: false,
        ..RunConfig::default()
    };
    cfg.fingerprint.dims = 64;
    cfg.model.hidden_size = 8;
    cfg.model.ffn_hidden_size = 8;
    cfg.train.epochs = 2;
    cfg.train.siams_num = 2;
    cfg.train.batch_size = 16;
    cfg
}

fn completed(status: RunStatus) -> pipeline::RunSummary {
    match status {
        RunStatus::Completed(summary) => summary,
        RunStatus::Skipped { existing } => panic!("unexpected skip: {}", existing.display()),
    }
}

fn prediction_column(path: &Path) -> Vec<f64> {
    let table = Table::read(path).unwrap();
    table
        .column(PREDICTION_COLUMN)
        .unwrap()
        .into_iter()
        .map(|v| v.parse().unwrap())
        .collect()
}

#[test]
fn train_then_skip_then_inference() {
    let dir = TempDir::new().unwrap();
    let data = write_qsar_csv(dir.path(), "CHEMBL_toy.csv");
    let out = dir.path().join("results");
    let cfg = small_config(data.clone(), &out);

    let summary = completed(run(&cfg).unwrap());
    let task_dir = out.join("CHEMBL_toy");
    assert_eq!(summary.predictions, task_dir.join("SiamQSAR_test_pred.csv"));
    assert!(task_dir.join("SiamQSAR_model.pt").exists());
    assert!(task_dir.join("SiamQSAR_metric_dict.json").exists());
    assert!(task_dir.join(RUN_LOG_FILE).exists());
    assert!(summary.rmse.is_finite());
    assert!(summary.best_epoch.is_some());

    let preds = prediction_column(&summary.predictions);
    assert_eq!(preds.len(), N_TEST);
    assert!(preds.iter().all(|p| p.is_finite()));

    // 2回目は既存の予測ファイルを見てスキップする
    match run(&cfg).unwrap() {
        RunStatus::Skipped { existing } => assert_eq!(existing, summary.predictions),
        RunStatus::Completed(_) => panic!("second run should be skipped"),
    }

    // 目的変数の無いクエリで推論
    let queries = dir.path().join("queries.csv");
    fs::write(&queries, "smiles\nCCO\nCCCON\nCCCCCONN\n").unwrap();
    let infer = RunConfig {
        mode: RunMode::Inference,
        test_path: Some(queries),
        checkpoint_path: Some(task_dir.join("SiamQSAR_model.pt")),
        ..cfg.clone()
    };
    let summary = completed(run(&infer).unwrap());
    assert_eq!(summary.predictions, task_dir.join("SiamQSAR_inference_pred.csv"));
    assert!(summary.rmse.is_nan());
    let preds = prediction_column(&summary.predictions);
    assert_eq!(preds.len(), 3);
    assert!(preds.iter().all(|p| p.is_finite()));
}

#[test]
fn baseline_qsar_writes_predictions_and_model() {
    let dir = TempDir::new().unwrap();
    let data = write_qsar_csv(dir.path(), "CHEMBL_base.csv");
    let out = dir.path().join("results");

    // moleculeACE 分割で floor(0.1 * 30) = 3 行が検証集合に回る
    for (id, file, fitted, val) in [
        ("KNN", "KNN_model.json", N_TRAIN, 0),
        ("Ridge", "Ridge_model.json", N_TRAIN, 0),
        ("MLP", "MLP_model.bin", N_TRAIN - 3, 3),
    ] {
        let cfg = RunConfig {
            mode: RunMode::BaselineQsar,
            baseline_model: Some(id.to_string()),
            ..small_config(data.clone(), &out)
        };
        let summary = completed(run(&cfg).unwrap());
        let task_dir = out.join("CHEMBL_base");
        assert_eq!(summary.predictions, task_dir.join(format!("{id}_test_pred.csv")));
        assert!(task_dir.join(file).exists(), "{file}");
        assert_eq!(prediction_column(&summary.predictions).len(), N_TEST);
        assert!(summary.rmse.is_finite());

        let event = last_event(&task_dir.join(RUN_LOG_FILE), "baseline_train");
        assert_eq!(event["model"], id);
        assert_eq!(event["train"], fitted, "{id}");
        assert_eq!(event["val"], val, "{id}");
    }
}

/// run.log.jsonl から指定イベントの最後の行を取り出す
fn last_event(path: &Path, name: &str) -> serde_json::Value {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
        .filter(|v| v["event"] == name)
        .last()
        .unwrap_or_else(|| panic!("no {name} event"))
}

#[test]
fn baseline_cpi_reports_per_target_scores() {
    let dir = TempDir::new().unwrap();
    let mut text = String::from("smiles,Label,split,cliff_mol,Chembl_id,Sequence\n");
    for i in 0..32 {
        let (target, seq) = if i % 2 == 0 {
            ("CHEMBL_A", "MKTAYIAKQRQISFVKSHFSRQ")
        } else {
            ("CHEMBL_B", "MSDNGPQNQRNAPRITFGGPSD")
        };
        let split = if i < 24 { "train" } else { "test" };
        writeln!(
            text,
            "{},{:.2},{split},{},{target},{seq}",
            smiles(i),
            activity(i) + (i % 2) as f64,
            u8::from(i % 3 == 0)
        )
        .unwrap();
    }
    let data = dir.path().join("cpi_toy.csv");
    fs::write(&data, text).unwrap();
    let out = dir.path().join("results");

    let cfg = RunConfig {
        mode: RunMode::BaselineCpi,
        baseline_model: Some("MolTrans".to_string()),
        ..small_config(data, &out)
    };
    let summary = completed(run(&cfg).unwrap());
    assert_eq!(summary.predictions, out.join("cpi_toy").join("cpi_toy_test_pred.csv"));

    let per_target = summary.per_target.unwrap();
    let names: Vec<&str> = per_target.per_target.iter().map(|t| t.target.as_str()).collect();
    assert_eq!(names, ["CHEMBL_A", "CHEMBL_B"]);
    assert!(per_target.rmse_mean.is_finite());

    // Label 列は目的変数列に改名して書き出す
    let table = Table::read(&summary.predictions).unwrap();
    assert!(table.has_column("y"));
    assert!(!table.has_column("Label"));
    assert_eq!(table.len(), 8);
}

#[test]
fn invalid_config_fails_before_touching_outputs() {
    let dir = TempDir::new().unwrap();
    let data = write_qsar_csv(dir.path(), "CHEMBL_bad.csv");
    let out = dir.path().join("results");

    let mut cfg = small_config(data, &out);
    cfg.metric = Some(siamqsar_core::Metric::Auc);
    assert!(matches!(run(&cfg), Err(SiamError::Config(_))));

    let cfg = RunConfig {
        split_sizes: [0.8, 0.3, 0.1],
        ..small_config(cfg.data_path.clone().unwrap(), &out)
    };
    assert!(matches!(run(&cfg), Err(SiamError::Config(_))));
    assert!(!out.exists());
}

#[test]
fn unknown_baseline_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let data = write_qsar_csv(dir.path(), "CHEMBL_unknown.csv");
    let cfg = RunConfig {
        mode: RunMode::BaselineQsar,
        baseline_model: Some("SVM".to_string()),
        split_type: SplitType::Random,
        ..small_config(data, &dir.path().join("results"))
    };
    assert!(matches!(cfg.validate(), Err(SiamError::Config(_))));
    assert!(matches!(run(&cfg), Err(SiamError::Config(_))));
    assert!(!dir.path().join("results").exists());
}
