//! Siamese ペアの生成
//!
//! クエリ集合と参照プールから (クエリ, 参照) の組を作る。
//! - `random`: クエリごとに `num` 件をプールから復元抽出
//! - `full`: クエリ × プールの全組み合わせ（決定的）
//!
//! どちらもクエリ順（query-major）に並び、出自タグはペアごとに保持する。

use crate::data::Sample;
use crate::error::{Result, SiamError};
use rand::seq::SliceRandom;
use rand::Rng;
use std::ops::Range;

/// ペアの作り方
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairStrategy {
    Random,
    Full,
}

/// ペア集合（各配列は同じ長さで位置が対応する）
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SiamesePairs {
    /// クエリ集合内のインデックス
    pub query: Vec<usize>,
    /// 参照プール内のインデックス
    pub reference: Vec<usize>,
    pub query_tags: Vec<String>,
    pub reference_tags: Vec<String>,
    /// クエリ数
    pub num_queries: usize,
}

/// ペアを生成する
///
/// `exclude_self` のとき、`random` でクエリ自身（同じ元行）を引いたら引き直す。
/// ただしプールに他の候補が無ければ自分自身とのペアを許す。
pub fn generate_pairs<R: Rng + ?Sized>(
    queries: &[Sample],
    pool: &[Sample],
    strategy: PairStrategy,
    num: usize,
    exclude_self: bool,
    rng: &mut R,
) -> Result<SiamesePairs> {
    if queries.is_empty() {
        return Ok(SiamesePairs::default());
    }
    if pool.is_empty() {
        return Err(SiamError::EmptyPool {
            queries: queries.len(),
        });
    }

    let per_query = match strategy {
        PairStrategy::Random => num,
        PairStrategy::Full => pool.len(),
    };
    let mut pairs = SiamesePairs {
        query: Vec::with_capacity(queries.len() * per_query),
        reference: Vec::with_capacity(queries.len() * per_query),
        query_tags: Vec::with_capacity(queries.len() * per_query),
        reference_tags: Vec::with_capacity(queries.len() * per_query),
        num_queries: queries.len(),
    };

    for (qi, q) in queries.iter().enumerate() {
        match strategy {
            PairStrategy::Random => {
                let has_other = pool.iter().any(|p| p.row != q.row);
                for _ in 0..num {
                    let mut j = rng.random_range(0..pool.len());
                    while exclude_self && has_other && pool[j].row == q.row {
                        j = rng.random_range(0..pool.len());
                    }
                    pairs.push(qi, j, q, &pool[j]);
                }
            }
            PairStrategy::Full => {
                for (j, r) in pool.iter().enumerate() {
                    pairs.push(qi, j, q, r);
                }
            }
        }
    }
    Ok(pairs)
}

impl SiamesePairs {
    fn push(&mut self, qi: usize, ri: usize, q: &Sample, r: &Sample) {
        self.query.push(qi);
        self.reference.push(ri);
        self.query_tags.push(q.tag.clone());
        self.reference_tags.push(r.tag.clone());
    }

    pub fn len(&self) -> usize {
        self.query.len()
    }

    pub fn is_empty(&self) -> bool {
        self.query.is_empty()
    }

    /// すべての配列を同じ順序でシャッフルする
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        self.query = order.iter().map(|&i| self.query[i]).collect();
        self.reference = order.iter().map(|&i| self.reference[i]).collect();
        self.query_tags = order.iter().map(|&i| self.query_tags[i].clone()).collect();
        self.reference_tags = order.iter().map(|&i| self.reference_tags[i].clone()).collect();
    }

    /// バッチ（ペア位置の範囲）のイテレータ
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = Range<usize>> + '_ {
        let size = batch_size.max(1);
        (0..self.len())
            .step_by(size)
            .map(move |start| start..(start + size).min(self.len()))
    }

    /// クエリごとのペア位置
    pub fn query_groups(&self) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.num_queries];
        for (pos, &q) in self.query.iter().enumerate() {
            groups[q].push(pos);
        }
        groups
    }

    /// ペアごとの値をクエリごとに平均する（ペアの無いクエリは NaN）
    pub fn mean_by_query(&self, values: &[f64]) -> Vec<f64> {
        debug_assert_eq!(values.len(), self.len());
        self.query_groups()
            .iter()
            .map(|g| {
                if g.is_empty() {
                    f64::NAN
                } else {
                    g.iter().map(|&p| values[p]).sum::<f64>() / g.len() as f64
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn samples(rows: std::ops::Range<usize>, tag: &str) -> Vec<Sample> {
        rows.map(|row| Sample {
            row,
            smiles: "C".to_string(),
            target: row as f64,
            active: vec![row],
            features: Vec::new(),
            cliff: false,
            tag: tag.to_string(),
            split: None,
            scaffold: None,
        })
        .collect()
    }

    #[test]
    fn test_pair_cardinality() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let queries = samples(100..103, "q");
        let pool = samples(0..10, "p");

        let random = generate_pairs(&queries, &pool, PairStrategy::Random, 4, true, &mut rng).unwrap();
        assert_eq!(random.len(), 12);
        assert_eq!(&random.query[..4], &[0, 0, 0, 0]);
        assert!(random.reference.iter().all(|&r| r < 10));

        let full = generate_pairs(&queries, &pool, PairStrategy::Full, 4, true, &mut rng).unwrap();
        assert_eq!(full.len(), 30);
        assert_eq!(full.query[10], 1);
        assert_eq!(full.reference[10], 0);
        assert_eq!(full.query_tags[0], "q");
        assert_eq!(full.reference_tags[29], "p");
    }

    #[test]
    fn test_exclude_self_pairs() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let pool = samples(0..3, "p");
        let pairs = generate_pairs(&pool, &pool, PairStrategy::Random, 50, true, &mut rng).unwrap();
        for (q, r) in pairs.query.iter().zip(&pairs.reference) {
            assert_ne!(q, r);
        }

        // 候補が自分しかいない場合は自己ペアを許す
        let single = samples(0..1, "p");
        let pairs = generate_pairs(&single, &single, PairStrategy::Random, 3, true, &mut rng).unwrap();
        assert_eq!(pairs.reference, vec![0, 0, 0]);
    }

    #[test]
    fn test_empty_inputs() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let pool = samples(0..3, "p");
        let empty: Vec<Sample> = Vec::new();
        assert!(generate_pairs(&empty, &pool, PairStrategy::Full, 2, true, &mut rng)
            .unwrap()
            .is_empty());
        assert!(generate_pairs(&empty, &empty, PairStrategy::Random, 2, true, &mut rng)
            .unwrap()
            .is_empty());
        assert!(matches!(
            generate_pairs(&pool, &empty, PairStrategy::Random, 2, true, &mut rng),
            Err(SiamError::EmptyPool { queries: 3 })
        ));
    }

    #[test]
    fn test_shuffle_keeps_alignment_and_groups() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let queries = samples(10..13, "q");
        let pool = samples(0..4, "p");
        let mut pairs = generate_pairs(&queries, &pool, PairStrategy::Full, 1, true, &mut rng).unwrap();
        let values: Vec<f64> = pairs.query.iter().map(|&q| q as f64 * 10.0).collect();
        assert_eq!(pairs.mean_by_query(&values), vec![0.0, 10.0, 20.0]);

        pairs.shuffle(&mut rng);
        let mut seen: Vec<(usize, usize)> = pairs.query.iter().copied().zip(pairs.reference.iter().copied()).collect();
        seen.sort_unstable();
        let expected: Vec<(usize, usize)> = (0..3).flat_map(|q| (0..4).map(move |r| (q, r))).collect();
        assert_eq!(seen, expected);
        assert!(pairs.query_groups().iter().all(|g| g.len() == 4));
    }

    #[test]
    fn test_batches_cover_all_pairs() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let pool = samples(0..10, "p");
        let pairs = generate_pairs(&pool, &pool, PairStrategy::Random, 5, true, &mut rng).unwrap();
        let ranges: Vec<Range<usize>> = pairs.batches(16).collect();
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[3], 48..50);
    }
}
