//! Siamese ネットワーク
//!
//! 共有エンコーダ（スパース埋め込み + 隠れ層）でクエリと参照をそれぞれ埋め込み、
//! `[e_q, f_q, e_r, f_r]` を FFN ヘッドに通してスカラーを出力する。
//! エンコーダの重みは共有なので、逆伝播では両方のパスから勾配を累積する。

use super::layers::{dropout_mask, Activation, Dense, SparseEmbedding};
use super::Tensor;
use crate::error::{Result, SiamError};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// ネットワーク構造（チェックポイントに保存して再構築に使う）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkShape {
    /// フィンガープリントの次元（スパース入力）
    pub input_dim: usize,
    /// 追加特徴量の次元（0 なら無し）
    pub feature_dim: usize,
    pub hidden_size: usize,
    pub depth: usize,
    pub ffn_hidden_size: usize,
    pub ffn_num_layers: usize,
    pub dropout: f32,
    pub activation: Activation,
}

impl NetworkShape {
    /// ヘッドの入力次元
    pub fn head_input_dim(&self) -> usize {
        2 * (self.hidden_size + self.feature_dim)
    }
}

/// ネットワークへの入力（分子1つ分）
#[derive(Clone, Copy, Debug)]
pub struct MolInput<'a> {
    pub active: &'a [usize],
    pub features: &'a [f32],
}

/// エンコーダの順伝播キャッシュ
#[derive(Clone, Debug, Default)]
pub struct EncoderCache {
    /// 各段の活性化前の値
    pub pre: Vec<Vec<f32>>,
    /// 各段の出力（活性化 + dropout 後）
    pub post: Vec<Vec<f32>>,
    pub masks: Vec<Vec<f32>>,
}

impl EncoderCache {
    /// 分子の埋め込み（最終段の出力）
    pub fn embedding(&self) -> &[f32] {
        self.post.last().map(Vec::as_slice).unwrap_or(&[])
    }
}

/// ヘッドの順伝播キャッシュ
#[derive(Clone, Debug, Default)]
pub struct HeadCache {
    pub input: Vec<f32>,
    pub pre: Vec<Vec<f32>>,
    pub post: Vec<Vec<f32>>,
    pub masks: Vec<Vec<f32>>,
    pub output: f32,
}

/// ペア1件分の順伝播キャッシュ
#[derive(Clone, Debug, Default)]
pub struct PairCache {
    pub query: EncoderCache,
    pub reference: EncoderCache,
    pub head: HeadCache,
}

impl PairCache {
    pub fn output(&self) -> f32 {
        self.head.output
    }
}

/// 共有エンコーダ
#[derive(Clone, Debug)]
pub struct Encoder {
    pub embed: SparseEmbedding,
    pub layers: Vec<Dense>,
}

/// FFN ヘッド（最終層の出力は1次元）
#[derive(Clone, Debug)]
pub struct Head {
    pub layers: Vec<Dense>,
}

/// 学習可能な Siamese ネットワーク
#[derive(Clone, Debug)]
pub struct SiameseNetwork {
    pub shape: NetworkShape,
    pub encoder: Encoder,
    pub head: Head,
}

fn draw_mask(len: usize, p: f32, rng: &mut Option<&mut ChaCha8Rng>) -> Vec<f32> {
    match rng {
        Some(r) => dropout_mask(len, p, &mut **r),
        None => vec![1.0; len],
    }
}

impl SiameseNetwork {
    /// ゼロ初期化でネットワークを作成
    pub fn new(shape: NetworkShape) -> Self {
        let h = shape.hidden_size;
        let encoder = Encoder {
            embed: SparseEmbedding::new(shape.input_dim, h),
            layers: (1..shape.depth).map(|_| Dense::new(h, h)).collect(),
        };

        let mut head_layers = Vec::with_capacity(shape.ffn_num_layers);
        let mut in_dim = shape.head_input_dim();
        for _ in 1..shape.ffn_num_layers {
            head_layers.push(Dense::new(in_dim, shape.ffn_hidden_size));
            in_dim = shape.ffn_hidden_size;
        }
        head_layers.push(Dense::new(in_dim, 1));

        Self {
            shape,
            encoder,
            head: Head {
                layers: head_layers,
            },
        }
    }

    /// ランダム初期化
    pub fn init_random<R: Rng>(&mut self, rng: &mut R) {
        self.encoder.embed.init_small(rng);
        for layer in &mut self.encoder.layers {
            layer.init_he(rng);
        }
        for layer in &mut self.head.layers {
            layer.init_he(rng);
        }
    }

    /// 分子1つをエンコードする
    ///
    /// `rng` が `Some` のときは学習モード（dropout 有効）。
    pub fn encode(&self, active: &[usize], mut rng: Option<&mut ChaCha8Rng>) -> EncoderCache {
        let act = self.shape.activation;
        let p = self.shape.dropout;
        let depth = self.encoder.layers.len() + 1;
        let mut cache = EncoderCache {
            pre: Vec::with_capacity(depth),
            post: Vec::with_capacity(depth),
            masks: Vec::with_capacity(depth),
        };

        let mut pre = vec![0.0; self.shape.hidden_size];
        self.encoder.embed.forward(active, &mut pre);
        self.push_stage(&mut cache.pre, &mut cache.post, &mut cache.masks, pre, act, p, &mut rng);

        for layer in &self.encoder.layers {
            let mut pre = vec![0.0; layer.output_dim];
            layer.forward(cache.post.last().map(Vec::as_slice).unwrap_or(&[]), &mut pre);
            self.push_stage(&mut cache.pre, &mut cache.post, &mut cache.masks, pre, act, p, &mut rng);
        }
        cache
    }

    #[allow(clippy::too_many_arguments)]
    fn push_stage(
        &self,
        pres: &mut Vec<Vec<f32>>,
        posts: &mut Vec<Vec<f32>>,
        masks: &mut Vec<Vec<f32>>,
        pre: Vec<f32>,
        act: Activation,
        p: f32,
        rng: &mut Option<&mut ChaCha8Rng>,
    ) {
        let mask = draw_mask(pre.len(), p, rng);
        let post = pre.iter().zip(&mask).map(|(&x, &m)| act.apply(x) * m).collect();
        pres.push(pre);
        posts.push(post);
        masks.push(mask);
    }

    /// 2つの埋め込みと追加特徴量からヘッドの出力を計算する
    pub fn head_forward(
        &self,
        e_q: &[f32],
        f_q: &[f32],
        e_r: &[f32],
        f_r: &[f32],
        mut rng: Option<&mut ChaCha8Rng>,
    ) -> HeadCache {
        let act = self.shape.activation;
        let p = self.shape.dropout;

        let mut input = Vec::with_capacity(self.shape.head_input_dim());
        input.extend_from_slice(e_q);
        input.extend_from_slice(f_q);
        input.extend_from_slice(e_r);
        input.extend_from_slice(f_r);

        let n = self.head.layers.len();
        let mut cache = HeadCache {
            input,
            ..HeadCache::default()
        };
        for (i, layer) in self.head.layers.iter().enumerate() {
            let x = if i == 0 {
                cache.input.as_slice()
            } else {
                cache.post[i - 1].as_slice()
            };
            let mut pre = vec![0.0; layer.output_dim];
            layer.forward(x, &mut pre);
            if i + 1 == n {
                cache.output = pre[0];
                cache.pre.push(pre);
            } else {
                let mask = draw_mask(pre.len(), p, &mut rng);
                let post = pre.iter().zip(&mask).map(|(&x, &m)| act.apply(x) * m).collect();
                cache.pre.push(pre);
                cache.post.push(post);
                cache.masks.push(mask);
            }
        }
        cache
    }

    /// ペア1件の順伝播
    pub fn forward_pair(
        &self,
        query: MolInput<'_>,
        reference: MolInput<'_>,
        mut rng: Option<&mut ChaCha8Rng>,
    ) -> PairCache {
        let q = self.encode(query.active, rng.as_deref_mut());
        let r = self.encode(reference.active, rng.as_deref_mut());
        let head = self.head_forward(
            q.embedding(),
            query.features,
            r.embedding(),
            reference.features,
            rng,
        );
        PairCache {
            query: q,
            reference: r,
            head,
        }
    }

    /// ペア1件の逆伝播
    ///
    /// `output_grad` はヘッド出力に対する勾配、`e_q_grad` / `e_r_grad` は
    /// 埋め込みに直接かかる勾配（対照損失由来）。
    pub fn backward_pair(
        &mut self,
        query: MolInput<'_>,
        reference: MolInput<'_>,
        cache: &PairCache,
        output_grad: f32,
        e_q_grad: &[f32],
        e_r_grad: &[f32],
    ) {
        let input_grad = self.head_backward(&cache.head, output_grad);

        let h = self.shape.hidden_size;
        let f = self.shape.feature_dim;
        let mut q_grad: Vec<f32> = input_grad[..h].to_vec();
        let mut r_grad: Vec<f32> = input_grad[h + f..2 * h + f].to_vec();
        for (g, &c) in q_grad.iter_mut().zip(e_q_grad) {
            *g += c;
        }
        for (g, &c) in r_grad.iter_mut().zip(e_r_grad) {
            *g += c;
        }

        // エンコーダは共有なので両方の勾配を累積
        self.encoder_backward(query.active, &cache.query, q_grad);
        self.encoder_backward(reference.active, &cache.reference, r_grad);
    }

    fn head_backward(&mut self, cache: &HeadCache, output_grad: f32) -> Vec<f32> {
        let act = self.shape.activation;
        let n = self.head.layers.len();
        let mut grad = vec![output_grad];

        for i in (0..n).rev() {
            if i + 1 < n {
                // 活性化 + dropout の逆伝播
                for ((g, &x), &m) in grad.iter_mut().zip(&cache.pre[i]).zip(&cache.masks[i]) {
                    *g *= act.grad(x) * m;
                }
            }
            let input = if i == 0 {
                cache.input.as_slice()
            } else {
                cache.post[i - 1].as_slice()
            };
            let layer = &mut self.head.layers[i];
            let mut input_grad = vec![0.0; layer.input_dim];
            layer.backward(input, &grad, &mut input_grad);
            grad = input_grad;
        }
        grad
    }

    fn encoder_backward(&mut self, active: &[usize], cache: &EncoderCache, mut grad: Vec<f32>) {
        let act = self.shape.activation;
        let stages = cache.pre.len();

        for s in (0..stages).rev() {
            for ((g, &x), &m) in grad.iter_mut().zip(&cache.pre[s]).zip(&cache.masks[s]) {
                *g *= act.grad(x) * m;
            }
            if s == 0 {
                self.encoder.embed.backward(active, &grad);
            } else {
                let layer = &mut self.encoder.layers[s - 1];
                let mut input_grad = vec![0.0; layer.input_dim];
                layer.backward(&cache.post[s - 1], &grad, &mut input_grad);
                grad = input_grad;
            }
        }
    }

    pub fn zero_grad(&mut self) {
        self.encoder.embed.zero_grad();
        for layer in &mut self.encoder.layers {
            layer.zero_grad();
        }
        for layer in &mut self.head.layers {
            layer.zero_grad();
        }
    }

    pub fn param_count(&self) -> usize {
        self.encoder.embed.param_count()
            + self.encoder.layers.iter().map(Dense::param_count).sum::<usize>()
            + self.head.layers.iter().map(Dense::param_count).sum::<usize>()
    }

    /// パラメータと勾配の組（オプティマイザ用、順序は固定）
    pub fn params_mut(&mut self) -> Vec<(&mut [f32], &[f32])> {
        let mut params: Vec<(&mut [f32], &[f32])> = Vec::new();
        let embed = &mut self.encoder.embed;
        params.push((embed.weights.as_mut_slice(), embed.weight_grads.as_slice()));
        params.push((embed.biases.as_mut_slice(), embed.bias_grads.as_slice()));
        for layer in self.encoder.layers.iter_mut().chain(self.head.layers.iter_mut()) {
            params.push((layer.weights.as_mut_slice(), layer.weight_grads.as_slice()));
            params.push((layer.biases.as_mut_slice(), layer.bias_grads.as_slice()));
        }
        params
    }

    /// 名前付きパラメータ
    pub fn state_dict(&self) -> BTreeMap<String, Tensor> {
        let mut dict = BTreeMap::new();
        let embed = &self.encoder.embed;
        dict.insert(
            "encoder.embed.weight".to_string(),
            Tensor::new(vec![embed.input_dim, embed.output_dim], embed.weights.clone()),
        );
        dict.insert(
            "encoder.embed.bias".to_string(),
            Tensor::new(vec![embed.output_dim], embed.biases.clone()),
        );
        for (i, layer) in self.encoder.layers.iter().enumerate() {
            insert_dense(&mut dict, &format!("encoder.layers.{i}"), layer);
        }
        for (i, layer) in self.head.layers.iter().enumerate() {
            insert_dense(&mut dict, &format!("head.layers.{i}"), layer);
        }
        dict
    }

    /// 名前付きパラメータを読み込む
    ///
    /// `strict` のときは欠落・余剰・形状不一致をエラーにする。
    /// そうでなければ警告を出して読み飛ばし、該当パラメータは現在の値のまま残す。
    pub fn load_state_dict(&mut self, dict: &BTreeMap<String, Tensor>, strict: bool) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        let own = self.state_dict();

        for (name, expected) in &own {
            match dict.get(name) {
                None => {
                    if strict {
                        return Err(SiamError::Checkpoint(format!("missing parameter `{name}`")));
                    }
                    log::warn!("checkpoint is missing `{name}`; keeping initial values");
                    report.missing.push(name.clone());
                }
                Some(t) if t.shape != expected.shape => {
                    if strict {
                        return Err(SiamError::DimensionMismatch {
                            name: name.clone(),
                            expected: expected.numel(),
                            actual: t.numel(),
                        });
                    }
                    log::warn!(
                        "shape mismatch for `{name}`: model {:?}, checkpoint {:?}; skipped",
                        expected.shape,
                        t.shape
                    );
                    report.mismatched.push(name.clone());
                }
                Some(t) => {
                    if let Some(slot) = self.param_slot_mut(name) {
                        slot.copy_from_slice(&t.data);
                        report.loaded.push(name.clone());
                    }
                }
            }
        }

        for name in dict.keys().filter(|k| !own.contains_key(*k)) {
            if strict {
                return Err(SiamError::Checkpoint(format!("unexpected parameter `{name}`")));
            }
            log::warn!("checkpoint has unexpected parameter `{name}`; ignored");
            report.unexpected.push(name.clone());
        }
        Ok(report)
    }

    /// 事前学習済みエンコーダのみを読み込む（`encoder.*` 以外は無視）
    pub fn load_pretrained_encoder(&mut self, dict: &BTreeMap<String, Tensor>) -> Result<LoadReport> {
        let encoder_only: BTreeMap<String, Tensor> = dict
            .iter()
            .filter(|(k, _)| k.starts_with("encoder."))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut report = LoadReport::default();
        let own = self.state_dict();
        for (name, expected) in own.iter().filter(|(k, _)| k.starts_with("encoder.")) {
            match encoder_only.get(name) {
                None => {
                    log::warn!("pretrained encoder is missing `{name}`");
                    report.missing.push(name.clone());
                }
                Some(t) if t.shape != expected.shape => {
                    log::warn!(
                        "pretrained `{name}` has shape {:?}, model expects {:?}; skipped",
                        t.shape,
                        expected.shape
                    );
                    report.mismatched.push(name.clone());
                }
                Some(t) => {
                    if let Some(slot) = self.param_slot_mut(name) {
                        slot.copy_from_slice(&t.data);
                        report.loaded.push(name.clone());
                    }
                }
            }
        }
        for name in encoder_only.keys().filter(|k| !own.contains_key(*k)) {
            log::warn!("pretrained encoder has unexpected parameter `{name}`");
            report.unexpected.push(name.clone());
        }
        log::info!(
            "loaded {} pretrained encoder tensors ({} missing, {} mismatched, {} unexpected)",
            report.loaded.len(),
            report.missing.len(),
            report.mismatched.len(),
            report.unexpected.len()
        );
        Ok(report)
    }

    fn param_slot_mut(&mut self, name: &str) -> Option<&mut [f32]> {
        match name {
            "encoder.embed.weight" => return Some(&mut self.encoder.embed.weights),
            "encoder.embed.bias" => return Some(&mut self.encoder.embed.biases),
            _ => {}
        }
        let (layers, rest) = if let Some(rest) = name.strip_prefix("encoder.layers.") {
            (&mut self.encoder.layers, rest)
        } else if let Some(rest) = name.strip_prefix("head.layers.") {
            (&mut self.head.layers, rest)
        } else {
            return None;
        };
        let (idx, kind) = rest.split_once('.')?;
        let layer = layers.get_mut(idx.parse::<usize>().ok()?)?;
        match kind {
            "weight" => Some(&mut layer.weights),
            "bias" => Some(&mut layer.biases),
            _ => None,
        }
    }
}

fn insert_dense(dict: &mut BTreeMap<String, Tensor>, prefix: &str, layer: &Dense) {
    dict.insert(
        format!("{prefix}.weight"),
        Tensor::new(vec![layer.output_dim, layer.input_dim], layer.weights.clone()),
    );
    dict.insert(
        format!("{prefix}.bias"),
        Tensor::new(vec![layer.output_dim], layer.biases.clone()),
    );
}

/// パラメータ読み込みの結果
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub missing: Vec<String>,
    pub mismatched: Vec<String>,
    pub unexpected: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn small_shape(activation: Activation) -> NetworkShape {
        NetworkShape {
            input_dim: 16,
            feature_dim: 2,
            hidden_size: 4,
            depth: 2,
            ffn_hidden_size: 3,
            ffn_num_layers: 2,
            dropout: 0.0,
            activation,
        }
    }

    fn random_net(activation: Activation) -> SiameseNetwork {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut net = SiameseNetwork::new(small_shape(activation));
        net.init_random(&mut rng);
        // 埋め込みが小さすぎると勾配が数値誤差に埋もれる
        for w in &mut net.encoder.embed.weights {
            *w *= 50.0;
        }
        net
    }

    #[test]
    fn test_state_dict_names() {
        let net = SiameseNetwork::new(small_shape(Activation::Relu));
        let dict = net.state_dict();
        let names: Vec<&str> = dict.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            vec![
                "encoder.embed.bias",
                "encoder.embed.weight",
                "encoder.layers.0.bias",
                "encoder.layers.0.weight",
                "head.layers.0.bias",
                "head.layers.0.weight",
                "head.layers.1.bias",
                "head.layers.1.weight",
            ]
        );
        assert_eq!(net.head.layers[0].input_dim, 12);
        assert_eq!(net.head.layers[1].output_dim, 1);
    }

    #[test]
    fn test_forward_is_finite_without_features() {
        let net = random_net(Activation::Relu);
        let q = MolInput {
            active: &[],
            features: &[0.0, 0.0],
        };
        let cache = net.forward_pair(q, q, None);
        assert!(cache.output().is_finite());
        assert_eq!(cache.query.embedding().len(), 4);
    }

    #[test]
    fn test_gradient_check() {
        let mut net = random_net(Activation::Tanh);
        let q = MolInput {
            active: &[1, 3, 5],
            features: &[0.3, -0.2],
        };
        let r = MolInput {
            active: &[2, 3, 9],
            features: &[-0.1, 0.4],
        };
        // 損失 = 出力 + sum(e_q) とし、埋め込みへの直接勾配も検証する
        let loss = |net: &SiameseNetwork| {
            let c = net.forward_pair(q, r, None);
            c.output() + c.query.embedding().iter().sum::<f32>()
        };

        net.zero_grad();
        let cache = net.forward_pair(q, r, None);
        let ones = vec![1.0; 4];
        let zeros = vec![0.0; 4];
        net.backward_pair(q, r, &cache, 1.0, &ones, &zeros);

        let h = 1e-2f32;
        let checks: Vec<(&str, usize)> = vec![
            ("encoder.embed.weight", 3 * 4 + 1),
            ("encoder.embed.weight", 9 * 4 + 2),
            ("encoder.layers.0.weight", 5),
            ("head.layers.0.weight", 7),
            ("head.layers.1.bias", 0),
        ];
        for (name, idx) in checks {
            let analytic = {
                let mut clone = net.clone();
                let params = clone.params_mut();
                let pos = param_position(name);
                params[pos].1[idx]
            };
            let mut plus = net.clone();
            plus.param_slot_mut(name).unwrap()[idx] += h;
            let mut minus = net.clone();
            minus.param_slot_mut(name).unwrap()[idx] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
            assert!(
                (numeric - analytic).abs() < 2e-2 * (1.0 + analytic.abs()),
                "{name}[{idx}]: numeric {numeric}, analytic {analytic}"
            );
        }
    }

    fn param_position(name: &str) -> usize {
        match name {
            "encoder.embed.weight" => 0,
            "encoder.layers.0.weight" => 2,
            "head.layers.0.weight" => 4,
            "head.layers.1.bias" => 7,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_load_state_dict_round_trip() {
        let src = random_net(Activation::Relu);
        let mut dst = SiameseNetwork::new(small_shape(Activation::Relu));
        let report = dst.load_state_dict(&src.state_dict(), true).unwrap();
        assert_eq!(report.loaded.len(), 8);
        assert_eq!(dst.encoder.embed.weights, src.encoder.embed.weights);
        assert_eq!(dst.head.layers[1].weights, src.head.layers[1].weights);
    }

    #[test]
    fn test_pretrained_encoder_is_non_strict() {
        let src = random_net(Activation::Relu);
        let mut dict = src.state_dict();
        dict.remove("encoder.layers.0.bias");
        dict.insert("encoder.extra.weight".to_string(), Tensor::new(vec![1], vec![1.0]));
        dict.insert("encoder.embed.bias".to_string(), Tensor::new(vec![5], vec![0.0; 5]));

        let mut dst = SiameseNetwork::new(small_shape(Activation::Relu));
        let head_before = dst.head.layers[0].weights.clone();
        let report = dst.load_pretrained_encoder(&dict).unwrap();

        assert_eq!(report.missing, vec!["encoder.layers.0.bias".to_string()]);
        assert_eq!(report.mismatched, vec!["encoder.embed.bias".to_string()]);
        assert_eq!(report.unexpected, vec!["encoder.extra.weight".to_string()]);
        assert_eq!(dst.encoder.embed.weights, src.encoder.embed.weights);
        // ヘッドは読み込まない
        assert_eq!(dst.head.layers[0].weights, head_before);

        // strict では同じ辞書がエラーになる
        let mut strict = SiameseNetwork::new(small_shape(Activation::Relu));
        assert!(strict.load_state_dict(&dict, true).is_err());
    }
}
