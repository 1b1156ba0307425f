use serde::{Deserialize, Serialize};

/// 色相チャンネルの最大値（OpenCV 8bit HSV）
pub const HUE_MAX: i32 = 180;
/// 彩度・明度チャンネルの最大値
pub const SAT_VAL_MAX: i32 = 255;

/// マーカー1個分のHSV色範囲
///
/// 中心値 ± 範囲で閾値ウィンドウを作る。値は各チャンネルの有効範囲に
/// クランプしない（負値や最大値超えもそのまま比較に使う）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorMask {
    #[serde(default)]
    pub label: i32,
    pub hue_center: i32,
    pub hue_range: i32,
    pub sat_center: i32,
    pub sat_range: i32,
    pub val_center: i32,
    pub val_range: i32,
}

/// HSV空間の閉区間 `low..=high`（チャンネル順: H, S, V）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HsvWindow {
    pub low: [i32; 3],
    pub high: [i32; 3],
}

impl HsvWindow {
    pub fn contains(&self, hsv: [u8; 3]) -> bool {
        (0..3).all(|c| {
            let v = hsv[c] as i32;
            v >= self.low[c] && v <= self.high[c]
        })
    }
}

impl ColorMask {
    pub fn new(
        label: i32,
        hue: (i32, i32),
        sat: (i32, i32),
        val: (i32, i32),
    ) -> Self {
        Self {
            label,
            hue_center: hue.0,
            hue_range: hue.1,
            sat_center: sat.0,
            sat_range: sat.1,
            val_center: val.0,
            val_range: val.1,
        }
    }

    fn centers(&self) -> [i32; 3] {
        [self.hue_center, self.sat_center, self.val_center]
    }

    fn ranges(&self) -> [i32; 3] {
        [self.hue_range, self.sat_range, self.val_range]
    }

    /// 下限 (center - range)
    pub fn low(&self) -> [i32; 3] {
        let (c, r) = (self.centers(), self.ranges());
        [c[0] - r[0], c[1] - r[1], c[2] - r[2]]
    }

    /// 上限 (center + range)
    pub fn high(&self) -> [i32; 3] {
        let (c, r) = (self.centers(), self.ranges());
        [c[0] + r[0], c[1] + r[1], c[2] + r[2]]
    }

    pub fn window(&self) -> HsvWindow {
        HsvWindow {
            low: self.low(),
            high: self.high(),
        }
    }

    /// 閾値ウィンドウ一覧
    ///
    /// `wrap = false` なら `window()` のみ。`wrap = true` の場合、範囲外に
    /// はみ出したチャンネルを `[0, max]` に収め、はみ出し分を反対側に
    /// 折り返した2つ目のウィンドウを追加する（両者のORで閾値化する）。
    pub fn windows(&self, wrap: bool) -> Vec<HsvWindow> {
        let base = self.window();
        if !wrap {
            return vec![base];
        }

        let mut main = base;
        let mut wrapped = base;
        let mut needs_wrap = false;

        for c in 0..3 {
            let c_max = if c == 0 { HUE_MAX } else { SAT_VAL_MAX };
            if base.low[c] < 0 {
                wrapped.low[c] = c_max + base.low[c];
                wrapped.high[c] = c_max;
                main.low[c] = 0;
                needs_wrap = true;
            } else if base.high[c] > c_max {
                wrapped.low[c] = 0;
                wrapped.high[c] = base.high[c] - c_max;
                main.high[c] = c_max;
                needs_wrap = true;
            }
        }

        if needs_wrap {
            vec![main, wrapped]
        } else {
            vec![main]
        }
    }
}
