use std::collections::VecDeque;
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::RgbImage;

/// トラッカーが扱うフレーム（RGB 8bit）
pub type Frame = RgbImage;

/// フレーム供給元
///
/// `poll_frame` はブロックしない。新しいフレームがなければ `Ok(None)`、
/// 供給元が死んだら `Err` を返す（以降トラッカーは停止する）。
pub trait FrameSource: Send + 'static {
    fn poll_frame(&mut self) -> Result<Option<Frame>>;

    /// 解像度 (幅, 高さ)。不明なら None。
    fn resolution(&self) -> Option<(u32, u32)> {
        None
    }

    /// デバイスを解放する。複数回呼ばれても安全であること。
    fn release(&mut self) {}
}

impl FrameSource for Box<dyn FrameSource> {
    fn poll_frame(&mut self) -> Result<Option<Frame>> {
        (**self).poll_frame()
    }

    fn resolution(&self) -> Option<(u32, u32)> {
        (**self).resolution()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// メモリ上のフレーム列（テスト・録画再生用）
pub struct FrameSequence {
    frames: VecDeque<Frame>,
    hold: bool,
    released: bool,
}

impl FrameSequence {
    /// 全フレームを出し切ると `Err`（供給元終了）を返す
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames: frames.into(),
            hold: false,
            released: false,
        }
    }

    /// 全フレームを出し切った後も「新フレームなし」を返し続ける
    pub fn holding(frames: Vec<Frame>) -> Self {
        Self {
            hold: true,
            ..Self::new(frames)
        }
    }

    /// 画像ファイル群から読み込む
    pub fn from_paths<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut frames = Vec::with_capacity(paths.len());
        for p in paths {
            let p = p.as_ref();
            let img = image::open(p)
                .with_context(|| format!("failed to open frame {}", p.display()))?;
            frames.push(img.to_rgb8());
        }
        Ok(Self::new(frames))
    }
}

impl FrameSource for FrameSequence {
    fn poll_frame(&mut self) -> Result<Option<Frame>> {
        if self.released {
            bail!("frame sequence released");
        }
        match self.frames.pop_front() {
            Some(f) => Ok(Some(f)),
            None if self.hold => Ok(None),
            None => bail!("frame sequence exhausted"),
        }
    }

    fn resolution(&self) -> Option<(u32, u32)> {
        self.frames.front().map(|f| f.dimensions())
    }

    fn release(&mut self) {
        self.released = true;
        self.frames.clear();
    }
}
