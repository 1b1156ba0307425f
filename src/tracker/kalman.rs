use nalgebra::{Matrix3, Vector3};
use tracing::{debug, warn};

use crate::config::SmootherConfig;

/// 1ステップ分のフィルタ結果
struct FilterStep {
    predicted_mean: Vector3<f64>,
    predicted_cov: Matrix3<f64>,
    mean: Vector3<f64>,
    cov: Matrix3<f64>,
}

/// 遷移・観測行列が単位行列の線形カルマンフィルタ（マーカー1個分の3D位置）
///
/// 速度はモデル化しない（定位置モデル）。学習モードでは最初の
/// `train_size` 個の観測を溜め、EMでノイズ共分散を再推定する。
#[derive(Debug, Clone)]
pub struct PositionSmoother {
    transition_cov: Matrix3<f64>,
    observation_cov: Matrix3<f64>,
    initial_mean: Vector3<f64>,
    initial_cov: Matrix3<f64>,

    state: Option<(Vector3<f64>, Matrix3<f64>)>,

    learning: bool,
    calibrated: bool,
    train_size: usize,
    em_iterations: usize,
    observations: Vec<Vector3<f64>>,
}

impl PositionSmoother {
    pub fn new(train_size: usize, em_iterations: usize) -> Self {
        Self {
            transition_cov: Matrix3::identity(),
            observation_cov: Matrix3::identity(),
            initial_mean: Vector3::zeros(),
            initial_cov: Matrix3::identity(),
            state: None,
            learning: train_size >= 2,
            calibrated: false,
            train_size,
            em_iterations,
            observations: Vec::with_capacity(train_size),
        }
    }

    pub fn from_config(config: &SmootherConfig) -> Self {
        let mut s = Self::new(config.train_size, config.em_iterations);
        s.set_learning(config.learning);
        s
    }

    /// 観測を1つ適用して平滑化後の位置を返す（必ず内部状態が進む）
    pub fn apply(&mut self, observation: [f64; 3]) -> [f64; 3] {
        let z = Vector3::from(observation);

        let (mean, cov) = match self.state {
            None => {
                self.initial_mean = z;
                (z, self.initial_cov)
            }
            Some((mean, cov)) => {
                let step = self.step(&mean, &(cov + self.transition_cov), &z);
                (step.mean, step.cov)
            }
        };
        self.state = Some((mean, cov));

        if self.learning && !self.calibrated {
            self.observations.push(z);
            if self.observations.len() >= self.train_size {
                self.run_calibration();
            }
        }

        self.state
            .map(|(m, _)| [m.x, m.y, m.z])
            .unwrap_or(observation)
    }

    /// 学習の有効/無効。無効化すると溜めかけの観測は破棄し、共分散は固定される。
    pub fn set_learning(&mut self, enabled: bool) {
        self.learning = enabled && self.train_size >= 2;
        if !self.learning {
            self.observations.clear();
        }
    }

    pub fn is_learning(&self) -> bool {
        self.learning && !self.calibrated
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    pub fn transition_covariance(&self) -> Matrix3<f64> {
        self.transition_cov
    }

    pub fn observation_covariance(&self) -> Matrix3<f64> {
        self.observation_cov
    }

    /// 予測済みの平均・共分散に観測を反映
    fn step(
        &self,
        predicted_mean: &Vector3<f64>,
        predicted_cov: &Matrix3<f64>,
        z: &Vector3<f64>,
    ) -> FilterStep {
        let s = predicted_cov + self.observation_cov;
        let gain = match s.try_inverse() {
            Some(inv) => predicted_cov * inv,
            // 特異 → 観測を無視して予測を維持
            None => Matrix3::zeros(),
        };
        let mean = predicted_mean + gain * (z - predicted_mean);
        let cov = symmetrize(&((Matrix3::identity() - gain) * predicted_cov));
        FilterStep {
            predicted_mean: *predicted_mean,
            predicted_cov: *predicted_cov,
            mean,
            cov,
        }
    }

    /// 観測列全体に対する前向きフィルタ
    fn filter_all(&self, observations: &[Vector3<f64>]) -> Vec<FilterStep> {
        let mut steps: Vec<FilterStep> = Vec::with_capacity(observations.len());
        for z in observations {
            let (pm, pc) = match steps.last() {
                None => (self.initial_mean, self.initial_cov),
                Some(prev) => (prev.mean, prev.cov + self.transition_cov),
            };
            steps.push(self.step(&pm, &pc, z));
        }
        steps
    }

    /// EMでノイズ共分散・初期状態を再推定し、溜めた観測で状態を更新
    fn run_calibration(&mut self) {
        let start = std::time::Instant::now();
        let observations = std::mem::take(&mut self.observations);

        for _ in 0..self.em_iterations {
            if !self.em_step(&observations) {
                warn!("kalman EM step skipped: singular covariance");
                break;
            }
        }

        let steps = self.filter_all(&observations);
        if let Some(last) = steps.last() {
            self.state = Some((last.mean, last.cov));
        }
        self.calibrated = true;
        debug!(
            "kalman filter calibrated on {} observations, took {:.2}ms",
            observations.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
    }

    /// EM 1反復（E: RTSスムーザ, M: 共分散更新）。失敗時false。
    fn em_step(&mut self, observations: &[Vector3<f64>]) -> bool {
        let n = observations.len();
        if n < 2 {
            return false;
        }
        let steps = self.filter_all(observations);

        // 後ろ向き平滑化
        let mut smoothed_mean = vec![Vector3::zeros(); n];
        let mut smoothed_cov = vec![Matrix3::zeros(); n];
        // pair_cov[t] = Cov(x_t, x_{t-1} | 全観測)
        let mut pair_cov = vec![Matrix3::zeros(); n];

        smoothed_mean[n - 1] = steps[n - 1].mean;
        smoothed_cov[n - 1] = steps[n - 1].cov;

        for t in (0..n - 1).rev() {
            let next = &steps[t + 1];
            let inv = match next.predicted_cov.try_inverse() {
                Some(inv) => inv,
                None => return false,
            };
            let gain = steps[t].cov * inv;
            smoothed_mean[t] = steps[t].mean + gain * (smoothed_mean[t + 1] - next.predicted_mean);
            smoothed_cov[t] = symmetrize(
                &(steps[t].cov + gain * (smoothed_cov[t + 1] - next.predicted_cov) * gain.transpose()),
            );
            pair_cov[t + 1] = smoothed_cov[t + 1] * gain.transpose();
        }

        // 観測ノイズ
        let mut obs_cov = Matrix3::zeros();
        for t in 0..n {
            let r = observations[t] - smoothed_mean[t];
            obs_cov += r * r.transpose() + smoothed_cov[t];
        }
        obs_cov /= n as f64;

        // 遷移ノイズ
        let mut trans_cov = Matrix3::zeros();
        for t in 1..n {
            let d = smoothed_mean[t] - smoothed_mean[t - 1];
            trans_cov += d * d.transpose() + smoothed_cov[t] + smoothed_cov[t - 1]
                - pair_cov[t]
                - pair_cov[t].transpose();
        }
        trans_cov /= (n - 1) as f64;

        self.observation_cov = symmetrize(&obs_cov);
        self.transition_cov = symmetrize(&trans_cov);
        self.initial_mean = smoothed_mean[0];
        self.initial_cov = smoothed_cov[0];
        true
    }
}

fn symmetrize(m: &Matrix3<f64>) -> Matrix3<f64> {
    (m + m.transpose()) * 0.5
}
