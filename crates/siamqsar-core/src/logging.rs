//! 実行ログ（構造化 JSONL）
//!
//! 実行開始時に作成し、各処理へ明示的に渡す。終了時に [`RunLogger::close`] で flush する。
//! 人間向けのログは `log` マクロ側に出す。

use crate::error::{Result, SiamError};
use serde_json::{json, Value};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const RUN_LOG_FILE: &str = "run.log.jsonl";

/// 構造化 JSON ログを扱うヘルパ
pub struct RunLogger {
    path: Option<PathBuf>,
    file: Option<Mutex<BufWriter<File>>>,
}

impl RunLogger {
    /// `dir/run.log.jsonl` に追記するロガーを作る
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| SiamError::at_path(dir, e))?;
        let path = dir.join(RUN_LOG_FILE);
        let f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SiamError::at_path(&path, e))?;
        Ok(Self {
            path: Some(path),
            file: Some(Mutex::new(BufWriter::with_capacity(1 << 16, f))),
        })
    }

    /// 何も書かないロガー
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// イベントを1行書く（`ts` と `event` を付与する）
    pub fn event(&self, event: &str, fields: Value) {
        let mut record = json!({
            "ts": chrono::Local::now().to_rfc3339(),
            "event": event,
        });
        if let (Some(obj), Value::Object(extra)) = (record.as_object_mut(), fields) {
            obj.extend(extra);
        }
        self.write_json(&record);
    }

    pub fn write_json(&self, v: &Value) {
        if let Some(ref file) = self.file {
            if let Ok(mut w) = file.lock() {
                if let Err(e) = writeln!(w, "{v}") {
                    log::warn!("failed to write run log: {e}");
                }
            }
        }
    }

    /// バッファを flush して閉じる
    pub fn close(self) -> Result<()> {
        if let Some(file) = self.file {
            let mut w = file.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
            w.flush()?;
        }
        Ok(())
    }
}
