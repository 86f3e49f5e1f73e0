//! ハッシュ化フィンガープリント
//!
//! SMILES をトークン（ブラケット原子・2文字ハロゲン・1文字）に分け、
//! 長さ 1..=max_ngram の n-gram を FNV-1a で `dims` 個のバケットに写像する。
//! タンパク質配列は長さ k の k-mer を同様に写像する。
//! 返すインデックスは昇順・重複なし。

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 名前空間ごとのハッシュの種（SMILES とタンパク質の衝突を避ける）
const SMILES_SALT: u8 = 0x53;
const PROTEIN_SALT: u8 = 0x50;

fn fnv1a(salt: u8, parts: &[&str]) -> u64 {
    let mut h = FNV_OFFSET;
    h ^= salt as u64;
    h = h.wrapping_mul(FNV_PRIME);
    for part in parts {
        for &b in part.as_bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(FNV_PRIME);
        }
        // 区切り
        h ^= 0xff;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// SMILES をトークンに分割する
pub fn tokenize_smiles(smiles: &str) -> Vec<&str> {
    let bytes = smiles.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        match bytes[i] {
            b'[' => {
                while i < bytes.len() && bytes[i] != b']' {
                    i += 1;
                }
                i = (i + 1).min(bytes.len());
            }
            b'C' if bytes.get(i + 1) == Some(&b'l') => i += 2,
            b'B' if bytes.get(i + 1) == Some(&b'r') => i += 2,
            // 2桁の環番号
            b'%' if bytes.get(i + 1..i + 3).is_some_and(|d| d.iter().all(u8::is_ascii_digit)) => i += 3,
            _ => {
                // UTF-8 の文字境界まで進める
                i += 1;
                while i < bytes.len() && !smiles.is_char_boundary(i) {
                    i += 1;
                }
            }
        }
        tokens.push(&smiles[start..i]);
    }
    tokens
}

fn finish(mut indices: Vec<usize>) -> Vec<usize> {
    indices.sort_unstable();
    indices.dedup();
    indices
}

/// SMILES の n-gram フィンガープリント
pub fn smiles_fingerprint(smiles: &str, dims: usize, max_ngram: usize) -> Vec<usize> {
    if dims == 0 {
        return Vec::new();
    }
    let tokens = tokenize_smiles(smiles.trim());
    let mut indices = Vec::new();
    for n in 1..=max_ngram.max(1) {
        for window in tokens.windows(n) {
            indices.push((fnv1a(SMILES_SALT, window) % dims as u64) as usize);
        }
    }
    finish(indices)
}

/// タンパク質配列の k-mer フィンガープリント
pub fn protein_fingerprint(sequence: &str, dims: usize, k: usize) -> Vec<usize> {
    if dims == 0 || k == 0 {
        return Vec::new();
    }
    let seq: String = sequence.trim().to_ascii_uppercase();
    let indices = seq
        .as_bytes()
        .windows(k)
        .filter_map(|w| std::str::from_utf8(w).ok())
        .map(|kmer| (fnv1a(PROTEIN_SALT, &[kmer]) % dims as u64) as usize)
        .collect();
    finish(indices)
}

/// 昇順・重複なしのインデックス集合同士の Tanimoto 係数
pub fn tanimoto(a: &[usize], b: &[usize]) -> f64 {
    let (mut i, mut j, mut common) = (0, 0, 0usize);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                common += 1;
                i += 1;
                j += 1;
            }
        }
    }
    let union = a.len() + b.len() - common;
    if union == 0 {
        1.0
    } else {
        common as f64 / union as f64
    }
}

/// スパースなインデックスを 0/1 の密ベクトルにする
pub fn to_dense(active: &[usize], dims: usize) -> Vec<f32> {
    let mut v = vec![0.0; dims];
    for &i in active {
        if i < dims {
            v[i] = 1.0;
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_keeps_bracket_atoms_and_halogens() {
        assert_eq!(
            tokenize_smiles("C[C@@H](Cl)Br%12"),
            vec!["C", "[C@@H]", "(", "Cl", ")", "Br", "%12"]
        );
    }

    #[test]
    fn test_tokenize_percent_without_digits() {
        assert_eq!(tokenize_smiles("C%aé"), vec!["C", "%", "a", "é"]);
        assert_eq!(tokenize_smiles("C%1"), vec!["C", "%", "1"]);
        assert_eq!(tokenize_smiles("%"), vec!["%"]);
        let fp = smiles_fingerprint("C%aé", 64, 3);
        assert!(!fp.is_empty());
        assert!(fp.iter().all(|&i| i < 64));
    }

    #[test]
    fn test_fingerprint_sorted_unique_in_range() {
        let fp = smiles_fingerprint("CCCCCCCC", 64, 3);
        assert!(fp.windows(2).all(|w| w[0] < w[1]));
        assert!(fp.iter().all(|&i| i < 64));
        // 同じ n-gram の繰り返しは1つにまとまる（C, CC, CCC）
        assert!(fp.len() <= 3);
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = smiles_fingerprint("c1ccccc1O", 2048, 3);
        let b = smiles_fingerprint("c1ccccc1O", 2048, 3);
        assert_eq!(a, b);
        assert_ne!(a, smiles_fingerprint("c1ccccc1N", 2048, 3));
    }

    #[test]
    fn test_tanimoto() {
        assert_eq!(tanimoto(&[1, 2, 3], &[1, 2, 3]), 1.0);
        assert_eq!(tanimoto(&[1, 2], &[3, 4]), 0.0);
        assert!((tanimoto(&[1, 2, 3], &[2, 3, 4]) - 0.5).abs() < 1e-12);
        assert_eq!(tanimoto(&[], &[]), 1.0);
    }

    #[test]
    fn test_protein_kmers() {
        let fp = protein_fingerprint("mkvla", 128, 3);
        assert_eq!(fp, protein_fingerprint("MKVLA", 128, 3));
        assert!(!fp.is_empty() && fp.len() <= 3);
        assert!(protein_fingerprint("MK", 128, 3).is_empty());
    }

    #[test]
    fn test_to_dense() {
        assert_eq!(to_dense(&[0, 2, 9], 4), vec![1.0, 0.0, 1.0, 0.0]);
    }
}
