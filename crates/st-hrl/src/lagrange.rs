// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::VecDeque;

use st_nn::ModuleArchive;

use crate::config::PidConfig;
use crate::error::{HrlError, HrlResult};

/// PID-controlled Lagrange multiplier for the safety term.
///
/// The penalty only moves through [`PidLagrangian::update`], which the
/// controller calls once per completed episode.
#[derive(Clone, Debug)]
pub struct PidLagrangian {
    config: PidConfig,
    threshold: f32,
    integral: f32,
    proportional: f32,
    derivative: f32,
    delay: VecDeque<f32>,
    penalty: f32,
}

impl PidLagrangian {
    pub fn new(config: PidConfig, threshold: f32) -> HrlResult<Self> {
        if config.d_delay == 0 {
            return Err(HrlError::config("lagrangian.d_delay", "must be non-zero"));
        }
        if !(threshold > 0.0) {
            return Err(HrlError::config("lagrangian.threshold", "must be positive"));
        }
        let mut delay = VecDeque::with_capacity(config.d_delay);
        delay.push_back(0.0);
        Ok(Self {
            integral: config.multiplier_init,
            proportional: 0.0,
            derivative: 0.0,
            delay,
            penalty: 0.0,
            config,
            threshold,
        })
    }

    pub fn penalty(&self) -> f32 {
        self.penalty
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Feeds one episode cost through the control law and returns the new
    /// penalty, which is never negative.
    pub fn update(&mut self, episode_cost: f32) -> f32 {
        let cfg = &self.config;
        let delta = episode_cost - self.threshold;
        self.integral = (self.integral + delta * cfg.ki).max(0.0);
        let ap = cfg.delta_p_ema_alpha;
        self.proportional = self.proportional * ap + (1.0 - ap) * delta;
        let ad = cfg.delta_d_ema_alpha;
        self.derivative = self.derivative * ad + (1.0 - ad) * episode_cost;
        let delayed = self.delay.front().copied().unwrap_or(0.0);
        let pid_d = (self.derivative - delayed).max(0.0);
        self.penalty = (cfg.kp * self.proportional + self.integral + cfg.kd * pid_d).max(0.0);
        if self.delay.len() == cfg.d_delay {
            self.delay.pop_front();
        }
        self.delay.push_back(self.derivative);
        self.penalty
    }

    pub fn save(&self, archive: &mut ModuleArchive, prefix: &str) {
        archive.insert_scalar(&format!("{prefix}::integral"), self.integral as f64);
        archive.insert_scalar(&format!("{prefix}::proportional"), self.proportional as f64);
        archive.insert_scalar(&format!("{prefix}::derivative"), self.derivative as f64);
        archive.insert_scalar(&format!("{prefix}::penalty"), self.penalty as f64);
        archive.insert_vector(
            &format!("{prefix}::delay"),
            self.delay.iter().map(|&v| v as f64).collect(),
        );
    }

    pub fn check(&self, archive: &ModuleArchive, prefix: &str) -> HrlResult<()> {
        self.read(archive, prefix).map(|_| ())
    }

    /// Restores the multiplier state. A missing scalar or an oversized delay
    /// queue leaves the current state in place.
    pub fn load(&mut self, archive: &ModuleArchive, prefix: &str) -> HrlResult<()> {
        let ([integral, proportional, derivative, penalty], delay) = self.read(archive, prefix)?;
        self.integral = integral;
        self.proportional = proportional;
        self.derivative = derivative;
        self.penalty = penalty;
        self.delay = delay;
        Ok(())
    }

    fn read(&self, archive: &ModuleArchive, prefix: &str) -> HrlResult<([f32; 4], VecDeque<f32>)> {
        let scalar = |name: &str| -> HrlResult<f32> {
            Ok(archive.scalar(&format!("{prefix}::{name}"))? as f32)
        };
        let terms = [
            scalar("integral")?,
            scalar("proportional")?,
            scalar("derivative")?,
            scalar("penalty")?,
        ];
        let delay = archive.vector(&format!("{prefix}::delay"))?;
        if delay.is_empty() || delay.len() > self.config.d_delay {
            return Err(HrlError::checkpoint(format!(
                "delay queue of length {} does not fit d_delay {}",
                delay.len(),
                self.config.d_delay
            )));
        }
        Ok((terms, delay.iter().map(|&v| v as f32).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn controller(kp: f32, ki: f32, kd: f32, delay: usize) -> PidLagrangian {
        PidLagrangian::new(
            PidConfig {
                kp,
                ki,
                kd,
                d_delay: delay,
                delta_p_ema_alpha: 0.9,
                delta_d_ema_alpha: 0.9,
                multiplier_init: 0.0,
            },
            1.0,
        )
        .unwrap()
    }

    #[test]
    fn first_update_matches_hand_computation() {
        let mut pid = controller(1.0, 0.5, 2.0, 3);
        let penalty = pid.update(3.0);
        // delta = 2, I = 1, P = 0.2, D = 0.3, Dd = 0.3
        assert_abs_diff_eq!(penalty, 0.2 + 1.0 + 0.6, epsilon = 1e-6);
    }

    #[test]
    fn penalty_is_never_negative() {
        let mut pid = controller(5.0, 0.1, 1.0, 2);
        for cost in [0.0, 10.0, 0.0, 0.0, 0.0, 3.0, 0.0, 0.0, 0.0, 0.0] {
            assert!(pid.update(cost) >= 0.0);
        }
        assert!(pid.integral >= 0.0);
    }

    #[test]
    fn delay_queue_is_bounded() {
        let mut pid = controller(0.0, 0.0, 1.0, 2);
        for _ in 0..5 {
            pid.update(2.0);
        }
        assert_eq!(pid.delay.len(), 2);
    }

    #[test]
    fn state_survives_archive_round_trip() {
        let mut pid = controller(1.0, 0.2, 0.5, 4);
        pid.update(4.0);
        pid.update(2.0);
        let mut archive = ModuleArchive::new();
        pid.save(&mut archive, "pid");
        let mut restored = controller(1.0, 0.2, 0.5, 4);
        restored.load(&archive, "pid").unwrap();
        assert_eq!(restored.update(3.0), pid.update(3.0));
    }

    #[test]
    fn oversized_delay_queue_is_rejected_without_changes() {
        let mut long = controller(1.0, 0.2, 0.5, 6);
        for cost in [4.0, 2.0, 5.0, 1.0] {
            long.update(cost);
        }
        let mut archive = ModuleArchive::new();
        long.save(&mut archive, "pid");

        let mut pid = controller(1.0, 0.2, 0.5, 2);
        pid.update(3.0);
        let (integral, penalty, delay) = (pid.integral, pid.penalty, pid.delay.clone());
        assert!(pid.check(&archive, "pid").is_err());
        assert!(matches!(pid.load(&archive, "pid"), Err(HrlError::Checkpoint { .. })));
        assert_eq!(pid.integral, integral);
        assert_eq!(pid.penalty, penalty);
        assert_eq!(pid.delay, delay);
    }
}
