use image::{GrayImage, Luma, RgbImage};

use super::mask::HsvWindow;

/// RGB画素をOpenCV 8bit形式のHSVに変換 (H: 0-180, S/V: 0-255)
pub fn rgb_to_hsv(rgb: [u8; 3]) -> [u8; 3] {
    let r = rgb[0] as f32;
    let g = rgb[1] as f32;
    let b = rgb[2] as f32;

    let v = r.max(g).max(b);
    let min = r.min(g).min(b);
    let diff = v - min;

    let s = if v > 0.0 { diff * 255.0 / v } else { 0.0 };

    let mut h = if diff == 0.0 {
        0.0
    } else if v == r {
        60.0 * (g - b) / diff
    } else if v == g {
        120.0 + 60.0 * (b - r) / diff
    } else {
        240.0 + 60.0 * (r - g) / diff
    };
    if h < 0.0 {
        h += 360.0;
    }

    [
        ((h / 2.0).round() as u32).min(180) as u8,
        s.round().min(255.0) as u8,
        v as u8,
    ]
}

/// フレームをHSVウィンドウ（複数ならOR）で2値化する
///
/// 範囲内の画素は255、それ以外は0。
pub fn threshold(frame: &RgbImage, windows: &[HsvWindow]) -> GrayImage {
    let mut mask = GrayImage::new(frame.width(), frame.height());
    for (x, y, px) in frame.enumerate_pixels() {
        let hsv = rgb_to_hsv(px.0);
        if windows.iter().any(|w| w.contains(hsv)) {
            mask.put_pixel(x, y, Luma([255]));
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::ColorMask;
    use image::Rgb;

    #[test]
    fn test_primary_colors() {
        assert_eq!(rgb_to_hsv([255, 0, 0]), [0, 255, 255]);
        assert_eq!(rgb_to_hsv([0, 255, 0]), [60, 255, 255]);
        assert_eq!(rgb_to_hsv([0, 0, 255]), [120, 255, 255]);
    }

    #[test]
    fn test_gray_has_no_hue_or_saturation() {
        assert_eq!(rgb_to_hsv([0, 0, 0]), [0, 0, 0]);
        assert_eq!(rgb_to_hsv([128, 128, 128]), [0, 0, 128]);
    }

    #[test]
    fn test_marker_colors() {
        assert_eq!(rgb_to_hsv([54, 198, 250]), [98, 200, 250]);
        assert_eq!(rgb_to_hsv([120, 255, 156]), [68, 135, 255]);
    }

    #[test]
    fn test_threshold_marks_matching_pixels() {
        let mut frame = RgbImage::new(4, 1);
        frame.put_pixel(1, 0, Rgb([54, 198, 250]));
        frame.put_pixel(3, 0, Rgb([120, 255, 156]));
        let mask = ColorMask::new(0, (98, 10), (200, 55), (250, 32));
        let out = threshold(&frame, &mask.windows(false));
        let row: Vec<u8> = (0..4).map(|x| out.get_pixel(x, 0).0[0]).collect();
        assert_eq!(row, vec![0, 255, 0, 0]);
    }
}
