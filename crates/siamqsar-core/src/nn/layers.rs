//! 学習可能な層
//!
//! - [`SparseEmbedding`]: ハッシュ化フィンガープリント（スパース入力）用の入力層
//! - [`Dense`]: 実行時次元のアフィン変換層
//! - [`Activation`] と inverted dropout

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::SiamError;

/// LeakyReLU の負側の傾き
const LEAKY_SLOPE: f32 = 0.01;

/// 活性化関数
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    #[default]
    #[serde(rename = "ReLU")]
    Relu,
    #[serde(rename = "LeakyReLU")]
    LeakyRelu,
    #[serde(rename = "tanh")]
    Tanh,
    #[serde(rename = "ELU")]
    Elu,
}

impl Activation {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::Relu => x.max(0.0),
            Self::LeakyRelu => {
                if x > 0.0 {
                    x
                } else {
                    LEAKY_SLOPE * x
                }
            }
            Self::Tanh => x.tanh(),
            Self::Elu => {
                if x > 0.0 {
                    x
                } else {
                    x.exp() - 1.0
                }
            }
        }
    }

    /// 活性化前の値 `x` における微分
    #[inline]
    pub fn grad(self, x: f32) -> f32 {
        match self {
            Self::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::LeakyRelu => {
                if x > 0.0 {
                    1.0
                } else {
                    LEAKY_SLOPE
                }
            }
            Self::Tanh => {
                let t = x.tanh();
                1.0 - t * t
            }
            Self::Elu => {
                if x > 0.0 {
                    1.0
                } else {
                    x.exp()
                }
            }
        }
    }
}

impl FromStr for Activation {
    type Err = SiamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relu" => Ok(Self::Relu),
            "leakyrelu" | "leaky_relu" => Ok(Self::LeakyRelu),
            "tanh" => Ok(Self::Tanh),
            "elu" => Ok(Self::Elu),
            _ => Err(SiamError::config(format!("unknown activation `{s}`"))),
        }
    }
}

/// 学習可能なアフィン変換層（実行時次元）
#[derive(Clone, Debug)]
pub struct Dense {
    pub input_dim: usize,
    pub output_dim: usize,
    /// 重み [output][input]
    pub weights: Vec<f32>,
    pub biases: Vec<f32>,
    pub weight_grads: Vec<f32>,
    pub bias_grads: Vec<f32>,
}

impl Dense {
    /// ゼロ初期化
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            weights: vec![0.0; output_dim * input_dim],
            biases: vec![0.0; output_dim],
            weight_grads: vec![0.0; output_dim * input_dim],
            bias_grads: vec![0.0; output_dim],
        }
    }

    /// He (uniform) 初期化
    pub fn init_he<R: Rng>(&mut self, rng: &mut R) {
        let bound = (2.0 / self.input_dim.max(1) as f32).sqrt();
        for w in &mut self.weights {
            *w = rng.random::<f32>() * 2.0 * bound - bound;
        }
        self.biases.fill(0.0);
    }

    pub fn forward(&self, input: &[f32], output: &mut [f32]) {
        debug_assert_eq!(input.len(), self.input_dim);
        debug_assert_eq!(output.len(), self.output_dim);

        for (j, out) in output.iter_mut().enumerate() {
            let row = &self.weights[j * self.input_dim..(j + 1) * self.input_dim];
            *out = self.biases[j] + row.iter().zip(input).map(|(w, x)| w * x).sum::<f32>();
        }
    }

    /// 逆伝播（重み勾配を累積し、入力勾配を `input_grad` に書き込む）
    pub fn backward(&mut self, input: &[f32], output_grad: &[f32], input_grad: &mut [f32]) {
        debug_assert_eq!(input.len(), self.input_dim);
        debug_assert_eq!(output_grad.len(), self.output_dim);
        debug_assert_eq!(input_grad.len(), self.input_dim);

        input_grad.fill(0.0);
        for (j, &grad) in output_grad.iter().enumerate() {
            if grad == 0.0 {
                continue;
            }
            self.bias_grads[j] += grad;
            let offset = j * self.input_dim;
            for i in 0..self.input_dim {
                self.weight_grads[offset + i] += grad * input[i];
                input_grad[i] += grad * self.weights[offset + i];
            }
        }
    }

    pub fn zero_grad(&mut self) {
        self.weight_grads.fill(0.0);
        self.bias_grads.fill(0.0);
    }

    pub fn param_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }
}

/// スパース入力の埋め込み層
///
/// アクティブな特徴量インデックスに対応する重み行の総和 + バイアスを出力する。
#[derive(Clone, Debug)]
pub struct SparseEmbedding {
    pub input_dim: usize,
    pub output_dim: usize,
    /// 重み [input][output]
    pub weights: Vec<f32>,
    pub biases: Vec<f32>,
    pub weight_grads: Vec<f32>,
    pub bias_grads: Vec<f32>,
}

impl SparseEmbedding {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            weights: vec![0.0; input_dim * output_dim],
            biases: vec![0.0; output_dim],
            weight_grads: vec![0.0; input_dim * output_dim],
            bias_grads: vec![0.0; output_dim],
        }
    }

    /// ±0.01 の一様乱数で初期化
    pub fn init_small<R: Rng>(&mut self, rng: &mut R) {
        let bound = 0.01;
        for w in &mut self.weights {
            *w = rng.random::<f32>() * 2.0 * bound - bound;
        }
        self.biases.fill(0.0);
    }

    pub fn forward(&self, active_features: &[usize], output: &mut [f32]) {
        debug_assert_eq!(output.len(), self.output_dim);

        output.copy_from_slice(&self.biases);
        for &idx in active_features {
            if idx >= self.input_dim {
                continue;
            }
            let row = &self.weights[idx * self.output_dim..(idx + 1) * self.output_dim];
            for (out, w) in output.iter_mut().zip(row) {
                *out += w;
            }
        }
    }

    pub fn backward(&mut self, active_features: &[usize], output_grad: &[f32]) {
        debug_assert_eq!(output_grad.len(), self.output_dim);

        for (b, &g) in self.bias_grads.iter_mut().zip(output_grad) {
            *b += g;
        }
        for &idx in active_features {
            if idx >= self.input_dim {
                continue;
            }
            let offset = idx * self.output_dim;
            for (i, &g) in output_grad.iter().enumerate() {
                self.weight_grads[offset + i] += g;
            }
        }
    }

    pub fn zero_grad(&mut self) {
        self.weight_grads.fill(0.0);
        self.bias_grads.fill(0.0);
    }

    pub fn param_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }
}

/// Inverted dropout のマスクを生成する
///
/// 保持される要素は `1 / (1 - p)`、落とされる要素は 0。`p == 0` のときは全要素 1。
pub fn dropout_mask<R: Rng + ?Sized>(len: usize, p: f32, rng: &mut R) -> Vec<f32> {
    if p <= 0.0 {
        return vec![1.0; len];
    }
    let keep = 1.0 / (1.0 - p);
    (0..len)
        .map(|_| if rng.random::<f32>() < p { 0.0 } else { keep })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_dense_forward() {
        let mut layer = Dense::new(4, 2);
        layer.weights = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        layer.biases = vec![1.0, 2.0];

        let mut output = [0.0; 2];
        layer.forward(&[1.0, 2.0, 3.0, 4.0], &mut output);

        // 1 + 1 + 4 + 9 + 16 = 31, 2 + 5 + 12 + 21 + 32 = 72
        assert!((output[0] - 31.0).abs() < 1e-5);
        assert!((output[1] - 72.0).abs() < 1e-5);
    }

    #[test]
    fn test_dense_backward_accumulates() {
        let mut layer = Dense::new(2, 1);
        layer.weights = vec![0.5, -1.0];
        let mut input_grad = [0.0; 2];
        layer.backward(&[2.0, 3.0], &[1.0], &mut input_grad);
        layer.backward(&[2.0, 3.0], &[1.0], &mut input_grad);
        assert_eq!(layer.weight_grads, vec![4.0, 6.0]);
        assert_eq!(layer.bias_grads, vec![2.0]);
        assert_eq!(input_grad, [0.5, -1.0]);
    }

    #[test]
    fn test_sparse_embedding_sums_rows() {
        let mut emb = SparseEmbedding::new(3, 2);
        emb.weights = vec![1.0, 2.0, 10.0, 20.0, 100.0, 200.0];
        emb.biases = vec![0.5, 0.5];
        let mut out = [0.0; 2];
        emb.forward(&[0, 2, 7], &mut out);
        assert_eq!(out, [101.5, 202.5]);

        emb.backward(&[0, 2], &[1.0, -1.0]);
        assert_eq!(emb.weight_grads, vec![1.0, -1.0, 0.0, 0.0, 1.0, -1.0]);
        assert_eq!(emb.bias_grads, vec![1.0, -1.0]);
    }

    #[test]
    fn test_activation_grads_match_finite_difference() {
        for act in [Activation::Relu, Activation::LeakyRelu, Activation::Tanh, Activation::Elu] {
            for &x in &[-1.3f32, -0.2, 0.4, 2.1] {
                let h = 1e-3;
                let numeric = (act.apply(x + h) - act.apply(x - h)) / (2.0 * h);
                assert!((numeric - act.grad(x)).abs() < 1e-2, "{act:?} at {x}");
            }
        }
    }

    #[test]
    fn test_dropout_mask_scaling() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(dropout_mask(8, 0.0, &mut rng).iter().all(|&m| m == 1.0));
        let mask = dropout_mask(1000, 0.5, &mut rng);
        assert!(mask.iter().all(|&m| m == 0.0 || (m - 2.0).abs() < 1e-6));
        let kept = mask.iter().filter(|&&m| m > 0.0).count();
        assert!(kept > 350 && kept < 650);
    }

    #[test]
    fn test_activation_serde_names() {
        let a: Activation = serde_json::from_str("\"LeakyReLU\"").unwrap();
        assert_eq!(a, Activation::LeakyRelu);
        assert_eq!("elu".parse::<Activation>().unwrap(), Activation::Elu);
    }
}
