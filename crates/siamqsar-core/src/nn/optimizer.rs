//! オプティマイザ

use super::network::SiameseNetwork;

/// オプティマイザ trait
pub trait Optimizer {
    /// パラメータを更新
    fn step(&mut self, network: &mut SiameseNetwork);

    /// 学習率を設定
    fn set_lr(&mut self, lr: f32);

    /// 現在の学習率を取得
    fn get_lr(&self) -> f32;
}

/// Adam オプティマイザ
///
/// パラメータテンソルごとに一次・二次モーメントを持つ。
/// テンソルの順序は [`SiameseNetwork::params_mut`] に従う。
pub struct Adam {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,

    t: usize,
    /// (一次モーメント, 二次モーメント)
    moments: Vec<(Vec<f32>, Vec<f32>)>,
}

impl Adam {
    pub fn new(network: &mut SiameseNetwork, lr: f32) -> Self {
        let moments = network
            .params_mut()
            .iter()
            .map(|(p, _)| (vec![0.0; p.len()], vec![0.0; p.len()]))
            .collect();
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            t: 0,
            moments,
        }
    }

    pub fn with_weight_decay(mut self, wd: f32) -> Self {
        self.weight_decay = wd;
        self
    }

    /// 実行済みステップ数
    pub fn steps(&self) -> usize {
        self.t
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn adam_update_params(
    params: &mut [f32],
    grads: &[f32],
    m: &mut [f32],
    v: &mut [f32],
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    lr_t: f32,
) {
    for i in 0..params.len() {
        let g = grads[i] + weight_decay * params[i];

        m[i] = beta1 * m[i] + (1.0 - beta1) * g;
        v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;

        params[i] -= lr_t * m[i] / (v[i].sqrt() + epsilon);
    }
}

impl Optimizer for Adam {
    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn get_lr(&self) -> f32 {
        self.lr
    }

    fn step(&mut self, network: &mut SiameseNetwork) {
        self.t += 1;

        // バイアス補正付き学習率
        let lr_t = self.lr * (1.0 - self.beta2.powi(self.t as i32)).sqrt()
            / (1.0 - self.beta1.powi(self.t as i32));

        for ((params, grads), (m, v)) in network.params_mut().into_iter().zip(self.moments.iter_mut()) {
            adam_update_params(
                params,
                grads,
                m,
                v,
                self.beta1,
                self.beta2,
                self.epsilon,
                self.weight_decay,
                lr_t,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Activation, NetworkShape};

    fn tiny() -> SiameseNetwork {
        SiameseNetwork::new(NetworkShape {
            input_dim: 8,
            feature_dim: 0,
            hidden_size: 2,
            depth: 1,
            ffn_hidden_size: 2,
            ffn_num_layers: 1,
            dropout: 0.0,
            activation: Activation::Relu,
        })
    }

    #[test]
    fn test_adam_step() {
        let mut network = tiny();
        let mut optimizer = Adam::new(&mut network, 0.001);

        network.encoder.embed.weight_grads[0] = 1.0;
        network.head.layers[0].weight_grads[0] = -1.0;

        optimizer.step(&mut network);

        // 初回ステップの更新幅は符号 * lr
        assert!((network.encoder.embed.weights[0] + 0.001).abs() < 1e-6);
        assert!((network.head.layers[0].weights[0] - 0.001).abs() < 1e-6);
        // 勾配ゼロのパラメータは動かない
        assert_eq!(network.encoder.embed.weights[1], 0.0);
        assert_eq!(optimizer.steps(), 1);
    }

    #[test]
    fn test_weight_decay_shrinks_params() {
        let mut network = tiny();
        network.head.layers[0].weights[0] = 1.0;
        let mut optimizer = Adam::new(&mut network, 0.01).with_weight_decay(0.1);
        optimizer.step(&mut network);
        assert!(network.head.layers[0].weights[0] < 1.0);
    }
}
