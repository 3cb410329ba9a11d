//! 单目标框卡尔曼平滑
//! 状态向量: [cx, cy, w, h, vx, vy, vw, vh], 协方差简化为对角阵

use super::types::BBox;
use crate::config::TrackerConfig;

#[derive(Clone, Debug, PartialEq)]
pub struct KalmanBoxFilter {
    state: [f32; 8],
    p: [f32; 8],
    /// 过程噪声 (越小越平滑)
    q: f32,
    /// 观测噪声 (越大越平滑)
    r: f32,
    velocity_decay: f32,
    stationary_threshold: f32,
    stationary_count: u32,
}

impl KalmanBoxFilter {
    pub fn new(bbox: &BBox, config: &TrackerConfig) -> Self {
        let (cx, cy) = bbox.center();
        Self {
            state: [cx, cy, bbox.w, bbox.h, 0.0, 0.0, 0.0, 0.0],
            p: [10.0; 8],
            q: config.kalman_process_noise,
            r: config.kalman_observation_noise,
            velocity_decay: config.kalman_velocity_decay,
            stationary_threshold: config.kalman_stationary_threshold,
            stationary_count: 0,
        }
    }

    /// 匀速模型预测 + 速度衰减
    pub fn predict(&mut self) {
        let speed = (self.state[4] * self.state[4] + self.state[5] * self.state[5]).sqrt();
        let stationary = speed < self.stationary_threshold;

        let (pos_decay, size_decay) = if stationary {
            self.stationary_count += 1;
            // 连续静止3帧后大幅衰减
            let d = if self.stationary_count > 3 {
                0.7
            } else {
                self.velocity_decay
            };
            (d, d)
        } else {
            self.stationary_count = 0;
            (self.velocity_decay, 0.98)
        };
        self.state[4] *= pos_decay;
        self.state[5] *= pos_decay;
        self.state[6] *= size_decay;
        self.state[7] *= size_decay;

        for i in 0..4 {
            self.state[i] += self.state[i + 4];
        }

        let q = if stationary { self.q * 0.5 } else { self.q };
        for p in self.p.iter_mut() {
            *p += q;
        }
    }

    /// 融合观测值 (按残差大小自适应观测噪声)
    pub fn update(&mut self, bbox: &BBox) {
        let (cx, cy) = bbox.center();
        let y = [
            cx - self.state[0],
            cy - self.state[1],
            bbox.w - self.state[2],
            bbox.h - self.state[3],
        ];

        let residual = (y[0] * y[0] + y[1] * y[1]).sqrt();
        let r = if residual < self.stationary_threshold {
            self.r * 0.3
        } else if residual < 10.0 {
            self.r
        } else {
            self.r * 3.0
        };
        let velocity_gain = if residual < self.stationary_threshold {
            0.3
        } else {
            1.0
        };

        let mut k = [0.0f32; 8];
        for i in 0..8 {
            let noise = if i < 4 { r } else { r * 10.0 };
            k[i] = self.p[i] / (self.p[i] + noise);
        }
        for i in 0..4 {
            self.state[i] += k[i] * y[i];
            self.state[i + 4] += k[i + 4] * y[i] * velocity_gain;
        }
        for i in 0..8 {
            self.p[i] *= 1.0 - k[i];
        }

        if residual >= self.stationary_threshold {
            self.stationary_count = 0;
        }
    }

    pub fn bbox(&self) -> BBox {
        BBox::from_center(
            self.state[0],
            self.state[1],
            self.state[2].max(1.0),
            self.state[3].max(1.0),
        )
    }

    /// 下一帧的预测框 (用于确定搜索窗口)
    pub fn predicted_bbox(&self) -> BBox {
        BBox::from_center(
            self.state[0] + self.state[4],
            self.state[1] + self.state[5],
            (self.state[2] + self.state[6]).max(1.0),
            (self.state[3] + self.state[7]).max(1.0),
        )
    }

    pub fn velocity(&self) -> (f32, f32) {
        (self.state[4], self.state[5])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stationary_box_stays_put() {
        let b = BBox::new(10.0, 10.0, 20.0, 20.0);
        let mut kf = KalmanBoxFilter::new(&b, &TrackerConfig::default());
        for _ in 0..20 {
            kf.predict();
            kf.update(&b);
        }
        let out = kf.bbox();
        assert!((out.x - 10.0).abs() < 0.5);
        assert!((out.w - 20.0).abs() < 0.5);
    }

    #[test]
    fn test_follows_constant_motion() {
        let config = TrackerConfig::default();
        let mut kf = KalmanBoxFilter::new(&BBox::new(0.0, 0.0, 10.0, 10.0), &config);
        for i in 1..=30 {
            kf.predict();
            kf.update(&BBox::new(i as f32 * 3.0, 0.0, 10.0, 10.0));
        }
        let (vx, _) = kf.velocity();
        assert!(vx > 1.0);
        assert!((kf.bbox().x - 90.0).abs() < 6.0);
        assert!(kf.predicted_bbox().x > kf.bbox().x);
    }
}
