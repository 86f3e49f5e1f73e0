//! CSV ファイルの入出力（拡張子 `.gz` は gzip）

use crate::error::{Result, SiamError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const READER_BUF_CAP: usize = 128 * 1024; // 128 KiB

fn is_gzip(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("gz"))
}

/// ヘッダ付き CSV のリーダー
pub fn csv_reader(path: &Path) -> Result<csv::Reader<Box<dyn Read>>> {
    let f = File::open(path).map_err(|e| SiamError::at_path(path, e))?;
    let inner: Box<dyn Read> = if is_gzip(path) {
        Box::new(BufReader::with_capacity(READER_BUF_CAP, GzDecoder::new(f)))
    } else {
        Box::new(BufReader::with_capacity(READER_BUF_CAP, f))
    };
    Ok(csv::ReaderBuilder::new().has_headers(true).from_reader(inner))
}

/// ヘッダと行を CSV に書き出す（親ディレクトリは作成する）
pub fn write_csv(path: &Path, headers: &[String], rows: &[Vec<String>]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| SiamError::at_path(parent, e))?;
    }
    let file = BufWriter::new(File::create(path).map_err(|e| SiamError::at_path(path, e))?);

    let mut file = if is_gzip(path) {
        let enc = write_records(GzEncoder::new(file, Compression::default()), headers, rows)?;
        // gzip のトレーラは finish で書かれる
        enc.finish().map_err(|e| SiamError::at_path(path, e))?
    } else {
        write_records(file, headers, rows)?
    };
    file.flush().map_err(|e| SiamError::at_path(path, e))
}

fn write_records<W: Write>(w: W, headers: &[String], rows: &[Vec<String>]) -> Result<W> {
    let mut wtr = csv::Writer::from_writer(w);
    wtr.write_record(headers)?;
    for row in rows {
        wtr.write_record(row)?;
    }
    Ok(wtr.into_inner().map_err(|e| e.into_error())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_gzip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/data.csv.gz");
        write_csv(&path, &strings(&["smiles", "y"]), &[strings(&["CCO", "1.5"])]).unwrap();

        // 生のバイト列は gzip ヘッダで始まる
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[..2], &[0x1f, 0x8b]);

        let mut rdr = csv_reader(&path).unwrap();
        assert_eq!(rdr.headers().unwrap().iter().collect::<Vec<_>>(), vec!["smiles", "y"]);
        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][0], "CCO");
    }

    #[test]
    fn test_plain_csv_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.csv");
        write_csv(&path, &strings(&["a"]), &[strings(&["1"]), strings(&["2"])]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\n1\n2\n");

        let missing = dir.path().join("missing.csv");
        assert!(matches!(csv_reader(&missing), Err(SiamError::Path { .. })));
    }
}
