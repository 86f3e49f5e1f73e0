//! 生の CSV テーブル
//!
//! ヘッダと文字列の行をそのまま保持する。予測値を元の行に付け加えて出力するため、
//! 列の追加は常に新しいテーブルを返し、元のテーブルは変更しない。

use super::io::{csv_reader, write_csv};
use crate::error::{Result, SiamError};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// ヘッダと行から作成する（各行の長さはヘッダと一致しなければならない）
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self> {
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != headers.len()) {
            return Err(SiamError::data(format!(
                "row {i} has {} fields, header has {}",
                row.len(),
                headers.len()
            )));
        }
        Ok(Self { headers, rows })
    }

    /// CSV（`.gz` なら gzip）を読み込む
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut rdr = csv_reader(path)?;

        let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        log::debug!("read {} rows x {} columns from {}", rows.len(), headers.len(), path.display());
        Self::new(headers, rows)
    }

    /// CSV として書き出す（`.gz` なら gzip 圧縮）
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_csv(path.as_ref(), &self.headers, &self.rows)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// 列の値（列が無ければデータエラー）
    pub fn column(&self, name: &str) -> Result<Vec<&str>> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| SiamError::data(format!("missing column `{name}`")))?;
        Ok(self.rows.iter().map(|r| r[idx].as_str()).collect())
    }

    /// 列が存在すればその値
    pub fn optional_column(&self, name: &str) -> Option<Vec<&str>> {
        self.column(name).ok()
    }

    /// 指定した行だけを持つ新しいテーブル（順序は `indices` の順）
    pub fn select_rows(&self, indices: &[usize]) -> Table {
        Table {
            headers: self.headers.clone(),
            rows: indices.iter().map(|&i| self.rows[i].clone()).collect(),
        }
    }

    /// 先頭 `n` 行
    pub fn head(&self, n: usize) -> Table {
        Table {
            headers: self.headers.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    /// 列を追加（同名の列があれば置き換え）した新しいテーブルを返す
    pub fn with_column(&self, name: &str, values: Vec<String>) -> Result<Table> {
        if values.len() != self.rows.len() {
            return Err(SiamError::data(format!(
                "column `{name}` has {} values, table has {} rows",
                values.len(),
                self.rows.len()
            )));
        }
        let mut headers = self.headers.clone();
        let mut rows = self.rows.clone();
        match self.column_index(name) {
            Some(idx) => {
                for (row, v) in rows.iter_mut().zip(values) {
                    row[idx] = v;
                }
            }
            None => {
                headers.push(name.to_string());
                for (row, v) in rows.iter_mut().zip(values) {
                    row.push(v);
                }
            }
        }
        Ok(Table { headers, rows })
    }

    /// 列名を変更した新しいテーブルを返す（列が無ければそのまま）
    pub fn rename_column(&self, from: &str, to: &str) -> Table {
        let headers = self
            .headers
            .iter()
            .map(|h| if h == from { to.to_string() } else { h.clone() })
            .collect();
        Table {
            headers,
            rows: self.rows.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy() -> Table {
        Table::new(
            vec!["smiles".into(), "y".into()],
            vec![vec!["CCO".into(), "1.0".into()], vec!["c1ccccc1".into(), "2.5".into()]],
        )
        .unwrap()
    }

    #[test]
    fn test_with_column_does_not_mutate_source() {
        let table = toy();
        let out = table
            .with_column("Prediction", vec!["0.9".into(), "2.4".into()])
            .unwrap();
        assert_eq!(table.headers().len(), 2);
        assert_eq!(out.headers(), &["smiles", "y", "Prediction"]);
        assert_eq!(out.rows()[1], vec!["c1ccccc1", "2.5", "2.4"]);

        let replaced = out.with_column("y", vec!["a".into(), "b".into()]).unwrap();
        assert_eq!(replaced.headers().len(), 3);
        assert_eq!(replaced.column("y").unwrap(), vec!["a", "b"]);
        assert!(table.with_column("p", vec!["1".into()]).is_err());
    }

    #[test]
    fn test_rows_must_match_header() {
        let err = Table::new(vec!["a".into()], vec![vec!["1".into(), "2".into()]]);
        assert!(err.is_err());
    }

    #[test]
    fn test_read_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        std::fs::write(&path, "smiles,y,split\nCCO,1.0,train\n\"C(=O)O\",2.0,test\n").unwrap();

        let table = Table::read(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.column("smiles").unwrap(), vec!["CCO", "C(=O)O"]);
        assert!(table.column("cliff_mol").is_err());

        let out = dir.path().join("out.csv.gz");
        table.rename_column("y", "Label").write(&out).unwrap();
        let back = Table::read(&out).unwrap();
        assert_eq!(back.headers(), &["smiles", "Label", "split"]);
        assert_eq!(back.rows(), table.rows());
    }

    #[test]
    fn test_select_rows_and_head() {
        let table = toy();
        assert_eq!(table.select_rows(&[1, 0]).column("y").unwrap(), vec!["2.5", "1.0"]);
        assert_eq!(table.head(1).len(), 1);
        assert_eq!(table.head(10).len(), 2);
    }
}
