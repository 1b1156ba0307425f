use anyhow::{bail, Context, Result};
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureAPIs},
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use super::source::{Frame, FrameSource};

/// 連続読み込み失敗がこの回数を超えたらカメラ死亡とみなす
const MAX_READ_FAILURES: u32 = 30;

/// OpenCVを使用したカメラキャプチャ
pub struct OpenCvCamera {
    capture: VideoCapture,
    width: u32,
    height: u32,
}

impl OpenCvCamera {
    /// 解像度を指定してカメラを開く（None ならデバイス既定）
    pub fn open(index: i32, width: Option<u32>, height: Option<u32>) -> Result<Self> {
        let mut capture = VideoCapture::new(index, VideoCaptureAPIs::CAP_ANY as i32)
            .with_context(|| format!("failed to open camera {index}"))?;

        if !capture.is_opened()? {
            bail!("camera {} is not available", index);
        }

        if let Some(w) = width {
            capture.set(videoio::CAP_PROP_FRAME_WIDTH, w as f64)?;
        }
        if let Some(h) = height {
            capture.set(videoio::CAP_PROP_FRAME_HEIGHT, h as f64)?;
        }
        capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0)?;

        let actual_width = capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as u32;
        let actual_height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as u32;
        info!(
            "[cam{}] opened {}x{} @ {}fps",
            index,
            actual_width,
            actual_height,
            capture.get(videoio::CAP_PROP_FPS)?
        );

        Ok(Self {
            capture,
            width: actual_width,
            height: actual_height,
        })
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// フレームを読み込み、RGBに変換して返す
    pub fn read_frame(&mut self) -> Result<Frame> {
        let mut bgr = Mat::default();
        if !self.capture.read(&mut bgr).context("failed to read frame")? || bgr.empty() {
            bail!("empty frame received");
        }
        mat_to_frame(&bgr)
    }

    pub fn release(&mut self) -> Result<()> {
        self.capture.release()?;
        Ok(())
    }
}

/// BGR Mat → RGB Frame
fn mat_to_frame(bgr: &Mat) -> Result<Frame> {
    let mut rgb = Mat::default();
    imgproc::cvt_color_def(bgr, &mut rgb, imgproc::COLOR_BGR2RGB)?;
    let rgb = if rgb.is_continuous() { rgb } else { rgb.try_clone()? };

    let (w, h) = (rgb.cols() as u32, rgb.rows() as u32);
    let data = rgb.data_bytes()?.to_vec();
    Frame::from_raw(w, h, data).context("frame buffer size mismatch")
}

/// 別スレッドでカメラキャプチャを行い、最新フレームを提供する
pub struct ThreadedCamera {
    latest: Arc<Mutex<Option<Frame>>>,
    frame_id: Arc<AtomicU64>,
    last_taken: u64,
    running: Arc<AtomicBool>,
    dead: Arc<AtomicBool>,
    width: u32,
    height: u32,
    handle: Option<thread::JoinHandle<()>>,
}

impl ThreadedCamera {
    pub fn start(index: i32, width: Option<u32>, height: Option<u32>) -> Result<Self> {
        let mut camera = OpenCvCamera::open(index, width, height)?;
        let (w, h) = camera.resolution();

        let latest = Arc::new(Mutex::new(None::<Frame>));
        let frame_id = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let dead = Arc::new(AtomicBool::new(false));

        let handle = {
            let latest = Arc::clone(&latest);
            let frame_id = Arc::clone(&frame_id);
            let running = Arc::clone(&running);
            let dead = Arc::clone(&dead);
            thread::Builder::new()
                .name(format!("camera-{index}"))
                .spawn(move || {
                    let mut failures = 0u32;
                    while running.load(Ordering::Relaxed) {
                        match camera.read_frame() {
                            Ok(frame) => {
                                failures = 0;
                                *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
                                frame_id.fetch_add(1, Ordering::Release);
                            }
                            Err(e) => {
                                failures += 1;
                                if failures > MAX_READ_FAILURES {
                                    warn!("[cam{}] giving up after {} read errors: {e:#}", index, failures);
                                    dead.store(true, Ordering::Release);
                                    break;
                                }
                                thread::sleep(Duration::from_millis(10));
                            }
                        }
                    }
                    if let Err(e) = camera.release() {
                        warn!("[cam{}] release failed: {e:#}", index);
                    }
                })?
        };

        Ok(Self {
            latest,
            frame_id,
            last_taken: 0,
            running,
            dead,
            width: w,
            height: h,
            handle: Some(handle),
        })
    }

    /// 現在のフレームID。新フレームが到着するたびにインクリメントされる。
    pub fn frame_id(&self) -> u64 {
        self.frame_id.load(Ordering::Acquire)
    }
}

impl FrameSource for ThreadedCamera {
    fn poll_frame(&mut self) -> Result<Option<Frame>> {
        if self.dead.load(Ordering::Acquire) {
            bail!("camera capture thread died");
        }
        let id = self.frame_id();
        if id == self.last_taken {
            return Ok(None);
        }
        self.last_taken = id;
        let frame = self
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(frame)
    }

    fn resolution(&self) -> Option<(u32, u32)> {
        Some((self.width, self.height))
    }

    fn release(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadedCamera {
    fn drop(&mut self) {
        self.release();
    }
}
