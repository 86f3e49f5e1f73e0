use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

fn make_dataset(tmp: &TempDir) -> PathBuf {
    let mut text = String::from("smiles,y,split,cliff_mol\n");
    for i in 0..20 {
        let smiles = format!("{}O{}", "C".repeat(1 + i % 4), "N".repeat(i % 3));
        let split = if i < 16 { "train" } else { "test" };
        writeln!(text, "{smiles},{:.1},{split},{}", 4.0 + (i % 4) as f64, i % 2).unwrap();
    }
    let p = tmp.path().join("CHEMBL_cli.csv");
    fs::write(&p, text).expect("write dataset");
    p
}

fn siamqsar() -> Command {
    Command::cargo_bin("siamqsar").expect("binary exists")
}

#[test]
fn unknown_mode_is_rejected_by_the_parser() {
    siamqsar()
        .args(["--mode", "pretrain"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown mode"));
}

#[test]
fn missing_data_path_fails() {
    siamqsar()
        .args(["--mode", "train", "--quiet"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("data_path is required"));
}

#[test]
fn baseline_qsar_run_prints_prediction_path() {
    let tmp = TempDir::new().unwrap();
    let data = make_dataset(&tmp);
    let out = tmp.path().join("results");
    siamqsar()
        .args(["--mode", "baseline-qsar", "--baseline-model", "KNN", "--fp-dims", "64", "--quiet"])
        .arg("--data-path")
        .arg(&data)
        .arg("--save-dir")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("predictions:"))
        .stdout(predicate::str::contains("KNN_test_pred.csv"));

    let pred = fs::read_to_string(out.join("CHEMBL_cli").join("KNN_test_pred.csv")).expect("predictions exist");
    assert!(pred.lines().next().unwrap().ends_with("Prediction"));
    assert_eq!(pred.lines().count(), 5);
}

#[test]
fn toml_config_is_overridden_by_flags() {
    let tmp = TempDir::new().unwrap();
    let data = make_dataset(&tmp);
    let out = tmp.path().join("results");
    let config = tmp.path().join("run.toml");
    fs::write(
        &config,
        format!(
            "mode = \"baseline-qsar\"\nbaseline_model = \"SVM\"\ndata_path = {:?}\nsave_dir = {:?}\n\n[fingerprint]\ndims = 64\n",
            data.to_string_lossy(),
            out.to_string_lossy()
        ),
    )
    .unwrap();

    // 設定ファイルの SVM は未登録なので失敗する
    siamqsar().arg("--config").arg(&config).arg("--quiet").assert().failure();

    siamqsar()
        .arg("--config")
        .arg(&config)
        .args(["--baseline-model", "Ridge", "--quiet"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Ridge_test_pred.csv"));
}
