use image::{imageops, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::point::Point;

use super::hsv::threshold;
use super::mask::ColorMask;
use crate::camera::Frame;

/// 輪郭として採用する最小点数（楕円・円錐フィットに必要）
pub const MIN_CONTOUR_POINTS: usize = 5;
/// ノイズ除去用の最小面積（ピクセル²）
pub const MIN_CONTOUR_AREA: f64 = 10.0;
/// ぼかしのデフォルトσ
pub const DEFAULT_BLUR_SIGMA: f32 = 1.5;

#[derive(Debug, Clone, Copy)]
pub struct LocatorConfig {
    /// ガウシアンぼかしのσ（0以下で無効）
    pub blur_sigma: f32,
    pub min_points: usize,
    pub min_area: f64,
    /// 範囲外の閾値を反対側に折り返す
    pub wrap_hue: bool,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            blur_sigma: DEFAULT_BLUR_SIGMA,
            min_points: MIN_CONTOUR_POINTS,
            min_area: MIN_CONTOUR_AREA,
            wrap_hue: false,
        }
    }
}

/// 検出したブロブの外周
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    /// 外周の画素座標（画像座標系: x右, y下）
    pub points: Vec<Point<i32>>,
    /// 外周で囲まれる面積
    pub area: f64,
}

impl Blob {
    /// 画像中心を原点とし、y軸を上向きにした座標に変換
    pub fn centered_points(&self, width: u32, height: u32) -> Vec<[f64; 2]> {
        let cx = width as f64 / 2.0;
        let cy = height as f64 / 2.0;
        self.points
            .iter()
            .map(|p| [p.x as f64 - cx, cy - p.y as f64])
            .collect()
    }

    pub fn centroid(&self) -> (f64, f64) {
        let n = self.points.len().max(1) as f64;
        let (sx, sy) = self
            .points
            .iter()
            .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x as f64, sy + p.y as f64));
        (sx / n, sy / n)
    }
}

/// 多角形の面積（shoelace公式）
pub fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut sum = 0i64;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        sum += a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64;
    }
    (sum as f64).abs() / 2.0
}

/// フレームから色マスクに一致する最大のブロブを探す
pub struct BlobLocator {
    config: LocatorConfig,
}

impl BlobLocator {
    pub fn new(config: LocatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LocatorConfig {
        &self.config
    }

    /// ぼかし処理（全マスク共通の前処理）
    fn prepare(&self, frame: &Frame) -> RgbImage {
        if self.config.blur_sigma > 0.0 {
            imageops::blur(frame, self.config.blur_sigma)
        } else {
            frame.clone()
        }
    }

    /// 1フレーム・1マスクの検出
    pub fn locate(&self, frame: &Frame, mask: &ColorMask) -> Option<Blob> {
        let prepared = self.prepare(frame);
        self.locate_prepared(&prepared, mask)
    }

    /// 全マスクの検出（ぼかしは1回だけ）。結果はマスク順。
    pub fn locate_all(&self, frame: &Frame, masks: &[ColorMask]) -> Vec<Option<Blob>> {
        let prepared = self.prepare(frame);
        masks
            .iter()
            .map(|m| self.locate_prepared(&prepared, m))
            .collect()
    }

    /// `prepare` 済みフレームに対する検出
    fn locate_prepared(&self, prepared: &RgbImage, mask: &ColorMask) -> Option<Blob> {
        if prepared.width() == 0 || prepared.height() == 0 {
            return None;
        }

        let binary = threshold(prepared, &mask.windows(self.config.wrap_hue));

        let best = find_contours::<i32>(&binary)
            .into_iter()
            .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
            .map(|c| {
                let area = polygon_area(&c.points);
                Blob {
                    points: c.points,
                    area,
                }
            })
            .max_by(|a, b| a.area.total_cmp(&b.area))?;

        if best.points.len() < self.config.min_points || best.area < self.config.min_area {
            return None;
        }
        Some(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use imageproc::drawing::draw_filled_circle_mut;

    const BLUE: Rgb<u8> = Rgb([54, 198, 250]);

    fn blue_mask() -> ColorMask {
        ColorMask::new(0, (98, 10), (200, 55), (250, 32))
    }

    fn frame_with_discs(discs: &[((i32, i32), i32)]) -> RgbImage {
        let mut frame = RgbImage::new(320, 240);
        for &(center, radius) in discs {
            draw_filled_circle_mut(&mut frame, center, radius, BLUE);
        }
        frame
    }

    #[test]
    fn test_polygon_area_square() {
        let sq = [
            Point::new(0, 0),
            Point::new(10, 0),
            Point::new(10, 10),
            Point::new(0, 10),
        ];
        assert_eq!(polygon_area(&sq), 100.0);
        assert_eq!(polygon_area(&sq[..2]), 0.0);
    }

    #[test]
    fn test_not_found_on_empty_frame() {
        let locator = BlobLocator::new(LocatorConfig::default());
        let frame = RgbImage::new(320, 240);
        assert!(locator.locate(&frame, &blue_mask()).is_none());
        assert!(locator.locate(&RgbImage::new(0, 0), &blue_mask()).is_none());
    }

    #[test]
    fn test_picks_largest_blob() {
        let locator = BlobLocator::new(LocatorConfig::default());
        let frame = frame_with_discs(&[((60, 60), 8), ((200, 120), 30)]);
        let blob = locator.locate(&frame, &blue_mask()).unwrap();
        let (cx, cy) = blob.centroid();
        assert!((cx - 200.0).abs() < 2.0, "cx = {}", cx);
        assert!((cy - 120.0).abs() < 2.0, "cy = {}", cy);
        assert!(blob.area > 2000.0);
    }

    #[test]
    fn test_tiny_blob_rejected() {
        let locator = BlobLocator::new(LocatorConfig {
            blur_sigma: 0.0,
            ..LocatorConfig::default()
        });
        let frame = frame_with_discs(&[((100, 100), 1)]);
        assert!(locator.locate(&frame, &blue_mask()).is_none());
    }

    #[test]
    fn test_locate_is_deterministic() {
        let locator = BlobLocator::new(LocatorConfig::default());
        let frame = frame_with_discs(&[((150, 100), 25)]);
        let a = locator.locate(&frame, &blue_mask()).unwrap();
        let b = locator.locate(&frame, &blue_mask()).unwrap();
        assert_eq!(a.area, b.area);
        assert_eq!(a, b);
    }

    #[test]
    fn test_locate_all_in_mask_order() {
        let locator = BlobLocator::new(LocatorConfig::default());
        let frame = frame_with_discs(&[((150, 100), 25)]);
        let green = ColorMask::new(1, (68, 15), (135, 53), (255, 50));
        let found = locator.locate_all(&frame, &[green, blue_mask()]);
        assert_eq!(found.len(), 2);
        assert!(found[0].is_none());
        assert_eq!(found[1], locator.locate(&frame, &blue_mask()));
    }

    #[test]
    fn test_centered_points_flip_y() {
        let blob = Blob {
            points: vec![Point::new(160, 20)],
            area: 0.0,
        };
        assert_eq!(blob.centered_points(320, 240), vec![[0.0, 100.0]]);
    }
}
