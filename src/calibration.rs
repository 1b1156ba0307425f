use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::blob::mask::HUE_MAX;
use crate::blob::ColorMask;

// --- データ構造 ---

/// 色マスクのキャリブレーション結果（カメラ設定込み）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskCalibration {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub exposure: f64,
    #[serde(default = "default_saturation")]
    pub saturation: f64,
    pub masks: Vec<ColorMask>,
}

fn default_saturation() -> f64 {
    50.0
}

impl MaskCalibration {
    /// 色相を n 等分した初期マスク（彩度・明度も同じ中心/幅）
    pub fn evenly_spaced(width: u32, height: u32, n: usize) -> Self {
        let dist = if n == 0 { 0 } else { HUE_MAX / n as i32 };
        let masks = (0..n as i32)
            .map(|i| ColorMask::new(i, (i * dist, dist), (i * dist, dist), (i * dist, dist)))
            .collect();
        Self {
            width,
            height,
            exposure: 0.0,
            saturation: default_saturation(),
            masks,
        }
    }
}

// --- Save / Load ---

pub fn save_calibration<P: AsRef<Path>>(path: P, cal: &MaskCalibration) -> Result<()> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(cal)?;
    fs::write(path, json)
        .with_context(|| format!("failed to write calibration file {}", path.display()))?;
    Ok(())
}

pub fn load_calibration<P: AsRef<Path>>(path: P) -> Result<MaskCalibration> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read calibration file {}", path.display()))?;
    let cal: MaskCalibration = serde_json::from_str(&content)
        .with_context(|| format!("invalid calibration file {}", path.display()))?;
    Ok(cal)
}
