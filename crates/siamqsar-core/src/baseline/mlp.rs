//! 1隠れ層の MLP（スパース入力）
//!
//! 入力層は [`SparseEmbedding`]、出力層は [`Dense`]。Adam で学習し、
//! 検証データがあれば検証損失が最小のエポックのパラメータを残す。
//!
//! 保存形式（リトルエンディアン）:
//! マジック `SIAMMLP1` + 入力次元 (u32) + 隠れ層次元 (u32) + 分類フラグ (u8)
//! + 目的変数の平均・標準偏差 (f64 x2) + 各パラメータ（要素数 u64 + f32 データ）

use super::{BaselineModel, BaselineParams, Fingerprints, PersistFormat};
use crate::config::DatasetType;
use crate::error::{Result, SiamError};
use crate::loss::sigmoid;
use crate::nn::optimizer::adam_update_params;
use crate::nn::{Activation, Dense, SparseEmbedding};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::io::{Read, Write};

pub const MAGIC: &[u8; 8] = b"SIAMMLP1";

const BETA1: f32 = 0.9;
const BETA2: f32 = 0.999;
const EPSILON: f32 = 1e-8;

#[derive(Clone, Debug)]
pub struct MlpRegressor {
    pub dataset_type: DatasetType,
    pub hidden: SparseEmbedding,
    pub output: Dense,
    /// 回帰の目的変数の標準化パラメータ
    pub y_mean: f64,
    pub y_std: f64,
    epochs: usize,
    batch_size: usize,
    lr: f32,
    seed: u64,
    trained: bool,
}

impl MlpRegressor {
    pub fn new(params: &BaselineParams) -> Self {
        Self {
            dataset_type: params.dataset_type,
            hidden: SparseEmbedding::new(params.input_dim, params.hidden_size.max(1)),
            output: Dense::new(params.hidden_size.max(1), 1),
            y_mean: 0.0,
            y_std: 1.0,
            epochs: params.epochs.max(1),
            batch_size: params.batch_size.max(1),
            lr: params.lr,
            seed: params.seed,
            trained: false,
        }
    }

    /// 生の出力（回帰は標準化空間、分類はロジット）と隠れ層の前活性
    fn forward(&self, active: &[usize]) -> (f32, Vec<f32>, Vec<f32>) {
        let mut pre = vec![0.0; self.hidden.output_dim];
        self.hidden.forward(active, &mut pre);
        let post: Vec<f32> = pre.iter().map(|&x| Activation::Relu.apply(x)).collect();
        let mut out = [0.0f32];
        self.output.forward(&post, &mut out);
        (out[0], pre, post)
    }

    fn target(&self, y: f64) -> f32 {
        match self.dataset_type {
            DatasetType::Regression => ((y - self.y_mean) / self.y_std) as f32,
            DatasetType::Classification => y as f32,
        }
    }

    /// 損失とその出力勾配
    fn loss(&self, out: f32, t: f32) -> (f32, f32) {
        match self.dataset_type {
            DatasetType::Regression => {
                let d = out - t;
                (d * d, 2.0 * d)
            }
            DatasetType::Classification => {
                let l = out.max(0.0) - out * t + (1.0 + (-out.abs()).exp()).ln();
                (l, sigmoid(out) - t)
            }
        }
    }

    fn mean_loss(&self, x: Fingerprints<'_>, y: &[f64]) -> f64 {
        let total: f64 = x
            .rows
            .iter()
            .zip(y)
            .map(|(r, &v)| self.loss(self.forward(r).0, self.target(v)).0 as f64)
            .sum();
        total / x.len().max(1) as f64
    }

    fn zero_grad(&mut self) {
        self.hidden.zero_grad();
        self.output.zero_grad();
    }

    fn write_to(&self, w: &mut dyn Write) -> std::io::Result<()> {
        w.write_all(MAGIC)?;
        w.write_u32::<LittleEndian>(self.hidden.input_dim as u32)?;
        w.write_u32::<LittleEndian>(self.hidden.output_dim as u32)?;
        w.write_u8(u8::from(self.dataset_type == DatasetType::Classification))?;
        w.write_f64::<LittleEndian>(self.y_mean)?;
        w.write_f64::<LittleEndian>(self.y_std)?;
        for data in [&self.hidden.weights, &self.hidden.biases, &self.output.weights, &self.output.biases] {
            w.write_u64::<LittleEndian>(data.len() as u64)?;
            for &v in data.iter() {
                w.write_f32::<LittleEndian>(v)?;
            }
        }
        Ok(())
    }

    /// [`BaselineModel::write_native`] で書いたモデルを読み込む
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(SiamError::backend("MLP", "not an MLP model file (bad magic)"));
        }
        let input_dim = r.read_u32::<LittleEndian>()? as usize;
        let hidden = r.read_u32::<LittleEndian>()? as usize;
        let dataset_type = if r.read_u8()? == 1 {
            DatasetType::Classification
        } else {
            DatasetType::Regression
        };
        let mut model = Self::new(&BaselineParams {
            input_dim,
            dataset_type,
            seed: 0,
            epochs: 1,
            batch_size: 1,
            lr: 0.0,
            hidden_size: hidden,
        });
        model.y_mean = r.read_f64::<LittleEndian>()?;
        model.y_std = r.read_f64::<LittleEndian>()?;
        for data in [
            &mut model.hidden.weights,
            &mut model.hidden.biases,
            &mut model.output.weights,
            &mut model.output.biases,
        ] {
            let len = r.read_u64::<LittleEndian>()? as usize;
            if len != data.len() {
                return Err(SiamError::DimensionMismatch {
                    name: "mlp parameter".to_string(),
                    expected: data.len(),
                    actual: len,
                });
            }
            r.read_f32_into::<LittleEndian>(data)?;
        }
        model.trained = true;
        Ok(model)
    }
}

impl BaselineModel for MlpRegressor {
    fn name(&self) -> &str {
        "MLP"
    }

    fn persist_format(&self) -> PersistFormat {
        PersistFormat::Native
    }

    fn uses_validation(&self) -> bool {
        true
    }

    fn train(&mut self, x: Fingerprints<'_>, y: &[f64], val: Option<(Fingerprints<'_>, &[f64])>) -> Result<()> {
        if x.len() != y.len() {
            return Err(SiamError::backend(self.name(), format!("{} rows but {} targets", x.len(), y.len())));
        }
        if x.is_empty() {
            return Err(SiamError::backend(self.name(), "empty training set"));
        }
        if x.dims != self.hidden.input_dim {
            return Err(SiamError::DimensionMismatch {
                name: "mlp input".to_string(),
                expected: self.hidden.input_dim,
                actual: x.dims,
            });
        }

        if self.dataset_type == DatasetType::Regression {
            let n = y.len() as f64;
            self.y_mean = y.iter().sum::<f64>() / n;
            let var = y.iter().map(|v| (v - self.y_mean).powi(2)).sum::<f64>() / n;
            self.y_std = if var > 0.0 { var.sqrt() } else { 1.0 };
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        self.hidden.init_small(&mut rng);
        self.output.init_he(&mut rng);

        let mut moments: Vec<(Vec<f32>, Vec<f32>)> = [
            self.hidden.weights.len(),
            self.hidden.biases.len(),
            self.output.weights.len(),
            self.output.biases.len(),
        ]
        .iter()
        .map(|&n| (vec![0.0; n], vec![0.0; n]))
        .collect();
        let mut t = 0i32;

        let val = val.filter(|(vx, _)| !vx.is_empty());
        let mut best: Option<(f64, SparseEmbedding, Dense)> = None;
        let mut order: Vec<usize> = (0..x.len()).collect();

        for epoch in 0..self.epochs {
            order.shuffle(&mut rng);
            for start in (0..order.len()).step_by(self.batch_size) {
                let batch = &order[start..(start + self.batch_size).min(order.len())];
                let inv_n = 1.0 / batch.len() as f32;
                self.zero_grad();

                for &i in batch {
                    let (out, pre, post) = self.forward(&x.rows[i]);
                    let (_, d_out) = self.loss(out, self.target(y[i]));
                    let mut d_post = vec![0.0; post.len()];
                    self.output.backward(&post, &[d_out * inv_n], &mut d_post);
                    for (g, &p) in d_post.iter_mut().zip(&pre) {
                        *g *= Activation::Relu.grad(p);
                    }
                    self.hidden.backward(&x.rows[i], &d_post);
                }

                t += 1;
                let lr_t = self.lr * (1.0 - BETA2.powi(t)).sqrt() / (1.0 - BETA1.powi(t));
                let params: [(&mut [f32], &[f32]); 4] = [
                    (self.hidden.weights.as_mut_slice(), self.hidden.weight_grads.as_slice()),
                    (self.hidden.biases.as_mut_slice(), self.hidden.bias_grads.as_slice()),
                    (self.output.weights.as_mut_slice(), self.output.weight_grads.as_slice()),
                    (self.output.biases.as_mut_slice(), self.output.bias_grads.as_slice()),
                ];
                for ((p, g), (m, v)) in params.into_iter().zip(moments.iter_mut()) {
                    adam_update_params(p, g, m, v, BETA1, BETA2, EPSILON, 0.0, lr_t);
                }
            }

            if let Some((vx, vy)) = val {
                let val_loss = self.mean_loss(vx, vy);
                log::debug!("MLP epoch {epoch}: val loss {val_loss:.4}");
                if best.as_ref().is_none_or(|(b, _, _)| val_loss < *b) {
                    best = Some((val_loss, self.hidden.clone(), self.output.clone()));
                }
            }
        }

        if let Some((loss, hidden, output)) = best {
            log::info!("MLP: restoring parameters with best val loss {loss:.4}");
            self.hidden = hidden;
            self.output = output;
        }
        self.trained = true;
        Ok(())
    }

    fn predict(&self, x: Fingerprints<'_>) -> Result<Vec<f64>> {
        if !self.trained {
            return Err(SiamError::backend(self.name(), "model is not trained"));
        }
        Ok(x.rows
            .iter()
            .map(|r| {
                let out = self.forward(r).0;
                match self.dataset_type {
                    DatasetType::Regression => out as f64 * self.y_std + self.y_mean,
                    DatasetType::Classification => sigmoid(out) as f64,
                }
            })
            .collect())
    }

    fn write_native(&self, w: &mut dyn Write) -> Result<()> {
        self.write_to(w)?;
        Ok(())
    }
}
