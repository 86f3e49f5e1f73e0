//! train / validation / test への分割
//!
//! 同じ seed・方法・入力からは常に同じ分割を返す。乱数は `ChaCha8Rng`。

use crate::config::SplitType;
use crate::data::features::tokenize_smiles;
use crate::data::Sample;
use crate::error::{Result, SiamError};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;

const SIZE_TOLERANCE: f64 = 1e-6;

/// データセット上のインデックスの3分割
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DatasetSplit {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
    pub test: Vec<usize>,
}

impl DatasetSplit {
    pub fn total(&self) -> usize {
        self.train.len() + self.val.len() + self.test.len()
    }
}

/// 分割比率の検証
pub fn check_sizes(sizes: [f64; 3]) -> Result<()> {
    if sizes.iter().any(|&s| s < 0.0) {
        return Err(SiamError::config(format!("split sizes must be non-negative: {sizes:?}")));
    }
    let sum: f64 = sizes.iter().sum();
    if (sum - 1.0).abs() > SIZE_TOLERANCE {
        return Err(SiamError::config(format!("split sizes must sum to 1, got {sum}")));
    }
    Ok(())
}

/// データセットを分割する
pub fn split(samples: &[Sample], strategy: SplitType, sizes: [f64; 3], seed: u64) -> Result<DatasetSplit> {
    check_sizes(sizes)?;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let result = match strategy {
        SplitType::Random => random_split(samples.len(), sizes, &mut rng),
        SplitType::ScaffoldBalanced => scaffold_balanced_split(samples, sizes, &mut rng),
        SplitType::MoleculeAce => molecule_ace_split(samples, sizes[1], &mut rng)?,
        SplitType::Predetermined => predetermined_split(samples)?,
    };
    log::info!(
        "{strategy} split: train {} / val {} / test {}",
        result.train.len(),
        result.val.len(),
        result.test.len()
    );
    Ok(result)
}

fn random_split(n: usize, sizes: [f64; 3], rng: &mut ChaCha8Rng) -> DatasetSplit {
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(rng);

    let train_size = (sizes[0] * n as f64).floor() as usize;
    let train_val_size = (((sizes[0] + sizes[1]) * n as f64).floor() as usize).min(n);

    DatasetSplit {
        train: indices[..train_size].to_vec(),
        val: indices[train_size..train_val_size].to_vec(),
        test: indices[train_val_size..].to_vec(),
    }
}

/// SMILES から汎用骨格のキーを作る
///
/// 原子はすべて `C` に、ブラケット原子（立体・電荷・水素の指定を含む）も `C` にまとめ、
/// 結合次数の記号は取り除く。環番号と分岐は残す。
pub fn generic_scaffold(smiles: &str) -> String {
    let mut key = String::with_capacity(smiles.len());
    for token in tokenize_smiles(smiles.trim()) {
        let first = token.chars().next().unwrap_or(' ');
        if token.starts_with('[') || first.is_ascii_alphabetic() {
            key.push('C');
        } else if matches!(token, "=" | "#" | "/" | "\\" | ":" | "$" | "-") {
            continue;
        } else {
            key.push_str(token);
        }
    }
    key
}

fn scaffold_key(sample: &Sample) -> String {
    match sample.scaffold.as_deref() {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => generic_scaffold(&sample.smiles),
    }
}

fn scaffold_balanced_split(samples: &[Sample], sizes: [f64; 3], rng: &mut ChaCha8Rng) -> DatasetSplit {
    let n = samples.len() as f64;
    let (train_size, val_size, test_size) = (sizes[0] * n, sizes[1] * n, sizes[2] * n);

    // 骨格ごとのグループ（初出順）
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, s) in samples.iter().enumerate() {
        let key = scaffold_key(s);
        let entry = groups.entry(key.clone()).or_default();
        if entry.is_empty() {
            order.push(key);
        }
        entry.push(i);
    }

    let (mut big, mut small): (Vec<Vec<usize>>, Vec<Vec<usize>>) = order
        .iter()
        .filter_map(|k| groups.remove(k))
        .partition(|g| g.len() as f64 > val_size / 2.0 || g.len() as f64 > test_size / 2.0);
    big.shuffle(rng);
    small.shuffle(rng);

    let mut split = DatasetSplit::default();
    for group in big.into_iter().chain(small) {
        if (split.train.len() + group.len()) as f64 <= train_size {
            split.train.extend(group);
        } else if (split.val.len() + group.len()) as f64 <= val_size {
            split.val.extend(group);
        } else {
            split.test.extend(group);
        }
    }
    split
}

fn split_tag(sample: &Sample) -> Result<&str> {
    sample
        .split
        .as_deref()
        .ok_or_else(|| SiamError::data("split column is required for this split type"))
}

fn molecule_ace_split(samples: &[Sample], val_ratio: f64, rng: &mut ChaCha8Rng) -> Result<DatasetSplit> {
    let mut train = Vec::new();
    let mut test = Vec::new();
    for (i, s) in samples.iter().enumerate() {
        match split_tag(s)? {
            "train" => train.push(i),
            "test" => test.push(i),
            other => {
                return Err(SiamError::data(format!(
                    "row {}: unknown split tag `{other}` (expected train/test)",
                    s.row
                )));
            }
        }
    }

    let n_val = ((val_ratio * samples.len() as f64).floor() as usize).min(train.len());
    let picked = rand::seq::index::sample(rng, train.len(), n_val);
    let val: Vec<usize> = picked.iter().map(|k| train[k]).collect();

    let mut is_val = vec![false; samples.len()];
    for &i in &val {
        is_val[i] = true;
    }
    train.retain(|&i| !is_val[i]);

    Ok(DatasetSplit { train, val, test })
}

fn predetermined_split(samples: &[Sample]) -> Result<DatasetSplit> {
    let mut split = DatasetSplit::default();
    for (i, s) in samples.iter().enumerate() {
        match split_tag(s)? {
            "train" => split.train.push(i),
            "val" | "valid" | "validation" => split.val.push(i),
            "test" => split.test.push(i),
            other => {
                return Err(SiamError::data(format!("row {}: unknown split tag `{other}`", s.row)));
            }
        }
    }
    Ok(split)
}
