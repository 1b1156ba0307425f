use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::blob::{ColorMask, LocatorConfig};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub smoother: SmootherConfig,
    #[serde(default)]
    pub poser: PoserConfig,
    #[serde(default)]
    pub mapping: MappingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// 既定のログレベル（RUST_LOG が優先）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// ログファイルの出力先ディレクトリ（未指定ならstderrのみ）
    #[serde(default)]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_addr")]
    pub addr: String,
    /// 1メッセージの最大バイト数
    #[serde(default = "default_read_budget")]
    pub read_budget: usize,
    #[serde(default = "default_terminator")]
    pub terminator: String,
    #[serde(default = "default_driver_tokens")]
    pub driver_tokens: Vec<String>,
    #[serde(default = "default_poser_tokens")]
    pub poser_tokens: Vec<String>,
    #[serde(default = "default_close_token")]
    pub close_token: String,
    /// 接続ごとの送信キュー長
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    /// 送信キューが空くのを待つ上限。超えた相手は詰まったとみなし、空くまで配送を飛ばす
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// 中継メッセージをログに出す
    #[serde(default)]
    pub show_messages: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub camera_index: i32,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    /// 焦点距離（ピクセル）
    #[serde(default = "default_focal_length_px")]
    pub focal_length_px: f64,
    /// マーカー球の半径（出力位置と同じ単位、既定はメートル）
    #[serde(default = "default_sphere_radius")]
    pub sphere_radius: f64,
    #[serde(default = "default_blur_sigma")]
    pub blur_sigma: f32,
    #[serde(default = "default_min_points")]
    pub min_points: usize,
    #[serde(default = "default_min_area")]
    pub min_area: f64,
    /// 範囲外のHSV閾値を反対側に折り返す
    #[serde(default)]
    pub wrap_hue: bool,
    #[serde(default = "default_first_frame_timeout_ms")]
    pub first_frame_timeout_ms: u64,
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// 色マスクのキャリブレーションファイル（指定時は masks より優先）
    #[serde(default)]
    pub calibration_file: Option<String>,
    #[serde(default = "default_masks")]
    pub masks: Vec<ColorMask>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmootherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// EM学習に使う観測数
    #[serde(default = "default_train_size")]
    pub train_size: usize,
    #[serde(default = "default_em_iterations")]
    pub em_iterations: usize,
    #[serde(default = "default_true")]
    pub learning: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketFormat {
    /// 空白区切りの10進数
    Text,
    /// little-endian f32 の詰め込み
    Binary,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoserConfig {
    #[serde(default = "default_poser_addr")]
    pub addr: String,
    #[serde(default = "default_poser_id")]
    pub id_token: String,
    /// デバイス構成 (h=HMD, c=コントローラ, t=トラッカー)
    #[serde(default = "default_pose_struct")]
    pub pose_struct: String,
    #[serde(default = "default_send_hz")]
    pub send_hz: f64,
    #[serde(default = "default_packet_format")]
    pub packet_format: PacketFormat,
    /// 接続失敗時に再試行する
    #[serde(default = "default_true")]
    pub retry: bool,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// 再試行回数の上限（None なら無制限）
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// カメラ座標 → デバイス座標の変換（color_poser が使う）
#[derive(Debug, Clone, Deserialize)]
pub struct MappingConfig {
    /// x, y, z 軸まわりの回転（ラジアン、Rx·Ry·Rz の順に掛ける）
    #[serde(default)]
    pub rotation: [f64; 3],
    /// 回転後に掛ける軸ごとの倍率（符号で軸反転）
    #[serde(default = "default_axis_scale")]
    pub axis_scale: [f64; 3],
    /// マーカーごとのオフセット（デバイスのローカル座標、姿勢で回して加算）
    #[serde(default)]
    pub offsets: Vec<[f64; 3]>,
}

fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_server_addr() -> String { "0.0.0.0:6969".to_string() }
fn default_read_budget() -> usize { 400 }
fn default_terminator() -> String { "\n".to_string() }
fn default_driver_tokens() -> Vec<String> { vec!["hello".to_string()] }
fn default_poser_tokens() -> Vec<String> { vec!["holla".to_string(), "poser here".to_string()] }
fn default_close_token() -> String { "CLOSE".to_string() }
fn default_outbox_capacity() -> usize { 64 }
fn default_send_timeout_ms() -> u64 { 1000 }
fn default_axis_scale() -> [f64; 3] { [1.0, 1.0, 1.0] }
fn default_focal_length_px() -> f64 { 554.2563 }
fn default_sphere_radius() -> f64 { 0.02 }
fn default_blur_sigma() -> f32 { crate::blob::locate::DEFAULT_BLUR_SIGMA }
fn default_min_points() -> usize { crate::blob::locate::MIN_CONTOUR_POINTS }
fn default_min_area() -> f64 { crate::blob::locate::MIN_CONTOUR_AREA }
fn default_first_frame_timeout_ms() -> u64 { 2000 }
fn default_start_timeout_ms() -> u64 { 1000 }
fn default_stop_timeout_ms() -> u64 { 4000 }
fn default_masks() -> Vec<ColorMask> {
    vec![
        ColorMask::new(0, (98, 10), (200, 55), (250, 32)),
        ColorMask::new(1, (68, 15), (135, 53), (255, 50)),
        ColorMask::new(2, (68, 15), (135, 53), (255, 50)),
    ]
}
fn default_train_size() -> usize { 15 }
fn default_em_iterations() -> usize { 5 }
fn default_poser_addr() -> String { "127.0.0.1:6969".to_string() }
fn default_poser_id() -> String { "holla".to_string() }
fn default_pose_struct() -> String { "h c c".to_string() }
fn default_send_hz() -> f64 { 100.0 }
fn default_packet_format() -> PacketFormat { PacketFormat::Text }
fn default_retry_delay_ms() -> u64 { 2000 }

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
            read_budget: default_read_budget(),
            terminator: default_terminator(),
            driver_tokens: default_driver_tokens(),
            poser_tokens: default_poser_tokens(),
            close_token: default_close_token(),
            outbox_capacity: default_outbox_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
            show_messages: false,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            width: None,
            height: None,
            focal_length_px: default_focal_length_px(),
            sphere_radius: default_sphere_radius(),
            blur_sigma: default_blur_sigma(),
            min_points: default_min_points(),
            min_area: default_min_area(),
            wrap_hue: false,
            first_frame_timeout_ms: default_first_frame_timeout_ms(),
            start_timeout_ms: default_start_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            calibration_file: None,
            masks: default_masks(),
        }
    }
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            train_size: default_train_size(),
            em_iterations: default_em_iterations(),
            learning: true,
        }
    }
}

impl Default for PoserConfig {
    fn default() -> Self {
        Self {
            addr: default_poser_addr(),
            id_token: default_poser_id(),
            pose_struct: default_pose_struct(),
            send_hz: default_send_hz(),
            packet_format: default_packet_format(),
            retry: true,
            retry_delay_ms: default_retry_delay_ms(),
            max_attempts: None,
        }
    }
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            rotation: [0.0; 3],
            axis_scale: default_axis_scale(),
            offsets: Vec::new(),
        }
    }
}

impl TrackerConfig {
    pub fn locator(&self) -> LocatorConfig {
        LocatorConfig {
            blur_sigma: self.blur_sigma,
            min_points: self.min_points,
            min_area: self.min_area,
            wrap_hue: self.wrap_hue,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// 読めなければデフォルト設定
    ///
    /// ロガーの設定もこのファイルから読むため、読み込みエラーは呼び出し側が
    /// ロガー初期化後に報告できるよう一緒に返す。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Option<anyhow::Error>) {
        match Self::load(&path) {
            Ok(c) => (c, None),
            Err(e) => (Self::default(), Some(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.addr, "0.0.0.0:6969");
        assert_eq!(config.server.read_budget, 400);
        assert_eq!(config.server.driver_tokens, vec!["hello"]);
        assert_eq!(config.server.close_token, "CLOSE");
        assert_eq!(config.tracker.masks.len(), 3);
        assert_eq!(config.smoother.train_size, 15);
        assert_eq!(config.smoother.em_iterations, 5);
        assert_eq!(config.poser.pose_struct, "h c c");
        assert_eq!(config.poser.packet_format, PacketFormat::Text);
        assert_eq!(config.server.send_timeout_ms, 1000);
        assert_eq!(config.mapping.axis_scale, [1.0, 1.0, 1.0]);
        assert!(config.mapping.offsets.is_empty());
    }

    #[test]
    fn test_parse_sections() {
        let src = r#"
            [server]
            addr = "127.0.0.1:7000"
            show_messages = true

            [tracker]
            focal_length_px = 490.0
            sphere_radius = 2.0

            [[tracker.masks]]
            hue_center = 98
            hue_range = 10
            sat_center = 200
            sat_range = 55
            val_center = 250
            val_range = 32

            [smoother]
            enabled = false

            [poser]
            packet_format = "binary"
            max_attempts = 3

            [mapping]
            rotation = [0.6981317007977318, 0.0, 0.0]
            axis_scale = [-0.8, 0.5555555555555556, 0.8]
            offsets = [[-0.035, -0.1, 0.15], [0.0, 0.0, 0.037]]
        "#;
        let config: Config = toml::from_str(src).unwrap();
        assert_eq!(config.server.addr, "127.0.0.1:7000");
        assert!(config.server.show_messages);
        assert_eq!(config.tracker.focal_length_px, 490.0);
        assert_eq!(config.tracker.masks.len(), 1);
        assert_eq!(config.tracker.masks[0].label, 0);
        assert_eq!(config.tracker.masks[0].high(), [108, 255, 282]);
        assert!(!config.smoother.enabled);
        assert_eq!(config.poser.packet_format, PacketFormat::Binary);
        assert_eq!(config.poser.max_attempts, Some(3));
        assert_eq!(config.mapping.axis_scale[0], -0.8);
        assert_eq!(config.mapping.offsets.len(), 2);
    }

    #[test]
    fn test_load_missing_file_falls_back() {
        let (config, error) = Config::load_or_default("/nonexistent/config.toml");
        assert_eq!(config.tracker.sphere_radius, 0.02);
        assert!(error.is_some());
        assert!(Config::load("/nonexistent/config.toml").is_err());
    }
}
