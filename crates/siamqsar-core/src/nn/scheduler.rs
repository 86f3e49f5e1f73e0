//! 学習率スケジューラ
//!
//! - Noam: `init_lr` から `max_lr` まで線形ウォームアップし、その後 `final_lr` まで指数減衰（バッチ毎）
//! - Exponential: エポック毎に `lr *= gamma`

use crate::config::{SchedulerKind, TrainSettings};

/// スケジューラを進める単位
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepUnit {
    Batch,
    Epoch,
}

/// 学習率スケジューラ
#[derive(Clone, Debug)]
pub enum LrScheduler {
    Noam {
        init_lr: f32,
        max_lr: f32,
        final_lr: f32,
        warmup_steps: usize,
        total_steps: usize,
        linear_increment: f32,
        decay_gamma: f32,
        current_step: usize,
        lr: f32,
    },
    Exponential {
        gamma: f32,
        lr: f32,
    },
}

impl LrScheduler {
    pub fn noam(
        init_lr: f32,
        max_lr: f32,
        final_lr: f32,
        warmup_epochs: usize,
        total_epochs: usize,
        steps_per_epoch: usize,
    ) -> Self {
        let warmup_steps = warmup_epochs.min(total_epochs) * steps_per_epoch;
        let total_steps = total_epochs * steps_per_epoch;
        let linear_increment = if warmup_steps > 0 {
            (max_lr - init_lr) / warmup_steps as f32
        } else {
            0.0
        };
        let decay_steps = total_steps.saturating_sub(warmup_steps);
        let decay_gamma = if decay_steps > 0 && max_lr > 0.0 {
            (final_lr / max_lr).powf(1.0 / decay_steps as f32)
        } else {
            1.0
        };
        Self::Noam {
            init_lr,
            max_lr,
            final_lr,
            warmup_steps,
            total_steps,
            linear_increment,
            decay_gamma,
            current_step: 0,
            lr: init_lr,
        }
    }

    pub fn exponential(lr: f32, gamma: f32) -> Self {
        Self::Exponential { gamma, lr }
    }

    /// 学習設定から構築する
    pub fn from_settings(settings: &TrainSettings, steps_per_epoch: usize) -> Self {
        match settings.scheduler {
            SchedulerKind::Noam => Self::noam(
                settings.init_lr(),
                settings.max_lr(),
                settings.final_lr(),
                settings.warmup_epochs,
                settings.epochs,
                steps_per_epoch,
            ),
            SchedulerKind::Exponential { gamma } => Self::exponential(settings.lr, gamma),
        }
    }

    pub fn unit(&self) -> StepUnit {
        match self {
            Self::Noam { .. } => StepUnit::Batch,
            Self::Exponential { .. } => StepUnit::Epoch,
        }
    }

    /// 現在の学習率
    pub fn lr(&self) -> f32 {
        match self {
            Self::Noam { lr, .. } | Self::Exponential { lr, .. } => *lr,
        }
    }

    /// 1ステップ進めて新しい学習率を返す
    pub fn step(&mut self) -> f32 {
        match self {
            Self::Noam {
                init_lr,
                max_lr,
                final_lr,
                warmup_steps,
                total_steps,
                linear_increment,
                decay_gamma,
                current_step,
                lr,
            } => {
                *current_step += 1;
                *lr = if *current_step <= *warmup_steps {
                    *init_lr + *current_step as f32 * *linear_increment
                } else if *current_step <= *total_steps {
                    *max_lr * decay_gamma.powi((*current_step - *warmup_steps) as i32)
                } else {
                    *final_lr
                };
                *lr
            }
            Self::Exponential { gamma, lr } => {
                *lr *= *gamma;
                *lr
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noam_curve() {
        // warmup 2 エポック x 5 ステップ、合計 10 エポック
        let mut s = LrScheduler::noam(1e-4, 1e-3, 1e-4, 2, 10, 5);
        assert_eq!(s.unit(), StepUnit::Batch);
        assert!((s.lr() - 1e-4).abs() < 1e-9);

        let lrs: Vec<f32> = (0..50).map(|_| s.step()).collect();
        // ウォームアップ終端で max_lr
        assert!((lrs[9] - 1e-3).abs() < 1e-7);
        // ウォームアップ中は単調増加、その後は単調減少
        assert!(lrs[..10].windows(2).all(|w| w[1] > w[0]));
        assert!(lrs[10..].windows(2).all(|w| w[1] < w[0]));
        // 最終ステップで final_lr
        assert!((lrs[49] - 1e-4).abs() < 1e-6);
        // それ以降は final_lr のまま
        assert!((s.step() - 1e-4).abs() < 1e-9);
    }

    #[test]
    fn test_noam_without_warmup() {
        let mut s = LrScheduler::noam(1e-4, 1e-3, 1e-4, 0, 3, 4);
        let first = s.step();
        assert!(first < 1e-3 && first > 1e-4);
    }

    #[test]
    fn test_exponential_per_epoch() {
        let settings = TrainSettings {
            lr: 0.1,
            scheduler: SchedulerKind::Exponential { gamma: 0.5 },
            ..TrainSettings::default()
        };
        let mut s = LrScheduler::from_settings(&settings, 100);
        assert_eq!(s.unit(), StepUnit::Epoch);
        assert!((s.step() - 0.05).abs() < 1e-7);
        assert!((s.step() - 0.025).abs() < 1e-7);
    }
}
