use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::buffer::PoseBuffer;
use super::cone::{fit_focal_cone_to_sphere, has_nan_in_pose};
use super::kalman::PositionSmoother;
use crate::blob::{BlobLocator, ColorMask, LocatorConfig};
use crate::camera::{Frame, FrameSource};
use crate::config::{SmootherConfig, TrackerConfig};

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_DEAD: u8 = 2;

/// 新フレーム待ちのスリープ
const IDLE_WAIT: Duration = Duration::from_millis(1);

type SharedSource = Arc<Mutex<Option<Box<dyn FrameSource>>>>;

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub focal_length_px: f64,
    pub sphere_radius: f64,
    pub locator: LocatorConfig,
    /// None ならカルマン平滑化なし
    pub smoother: Option<SmootherConfig>,
    pub first_frame_timeout: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self::from_config(&TrackerConfig::default(), &SmootherConfig::default())
    }
}

impl TrackerSettings {
    pub fn from_config(tracker: &TrackerConfig, smoother: &SmootherConfig) -> Self {
        Self {
            focal_length_px: tracker.focal_length_px,
            sphere_radius: tracker.sphere_radius,
            locator: tracker.locator(),
            smoother: smoother.enabled.then(|| smoother.clone()),
            first_frame_timeout: Duration::from_millis(tracker.first_frame_timeout_ms),
            start_timeout: Duration::from_millis(tracker.start_timeout_ms),
            stop_timeout: Duration::from_millis(tracker.stop_timeout_ms),
        }
    }
}

/// トラッキングスレッドと読み手で共有する状態
struct Shared {
    poses: PoseBuffer,
    state: AtomicU8,
    stop: AtomicBool,
    learning: AtomicBool,
    /// 位置配列を公開したフレーム数
    frames: AtomicU64,
}

/// 色マスクごとのマーカー位置を別スレッドで推定し続ける
///
/// 位置配列はマスクの設定順に並ぶ。drop時に `stop()` が呼ばれ、
/// フレーム供給元は必ず解放される。
pub struct BlobTracker {
    shared: Arc<Shared>,
    source: SharedSource,
    pending: Option<Frame>,
    masks: Vec<ColorMask>,
    settings: TrackerSettings,
    worker: Option<thread::JoinHandle<()>>,
    done: Option<mpsc::Receiver<()>>,
}

impl BlobTracker {
    /// 最初のフレームが届くまで（最大 `first_frame_timeout`）ブロックする
    pub fn new<S: FrameSource>(
        source: S,
        masks: Vec<ColorMask>,
        settings: TrackerSettings,
    ) -> Result<Self> {
        let mut source: Box<dyn FrameSource> = Box::new(source);

        let first = match wait_first_frame(&mut source, settings.first_frame_timeout) {
            Ok(frame) => frame,
            Err(e) => {
                source.release();
                return Err(e);
            }
        };
        debug!("first frame {}x{}", first.width(), first.height());

        let learning = settings.smoother.as_ref().map_or(false, |s| s.learning);
        Ok(Self {
            shared: Arc::new(Shared {
                poses: PoseBuffer::new(masks.len()),
                state: AtomicU8::new(STATE_IDLE),
                stop: AtomicBool::new(false),
                learning: AtomicBool::new(learning),
                frames: AtomicU64::new(0),
            }),
            source: Arc::new(Mutex::new(Some(source))),
            pending: Some(first),
            masks,
            settings,
            worker: None,
            done: None,
        })
    }

    /// トラッキングスレッドを起動し、動作開始を確認するまで待つ
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        if self.shared.state.load(Ordering::Acquire) == STATE_DEAD {
            bail!("tracker already stopped");
        }

        let (done_tx, done_rx) = mpsc::channel();
        let worker = Worker {
            shared: Arc::clone(&self.shared),
            source: Arc::clone(&self.source),
            pending: self.pending.take(),
            locator: BlobLocator::new(self.settings.locator),
            smoothers: self
                .masks
                .iter()
                .map(|_| self.settings.smoother.as_ref().map(PositionSmoother::from_config))
                .collect(),
            masks: self.masks.clone(),
            focal_length_px: self.settings.focal_length_px,
            sphere_radius: self.settings.sphere_radius,
        };
        let handle = thread::Builder::new()
            .name("blob-tracker".to_string())
            .spawn(move || {
                worker.run();
                let _ = done_tx.send(());
            })
            .context("failed to spawn tracker thread")?;
        self.worker = Some(handle);
        self.done = Some(done_rx);

        let deadline = Instant::now() + self.settings.start_timeout;
        loop {
            match self.shared.state.load(Ordering::Acquire) {
                STATE_RUNNING => break,
                STATE_DEAD => {
                    self.stop();
                    bail!("frame source died while starting tracker");
                }
                _ if Instant::now() >= deadline => {
                    self.stop();
                    bail!("tracker thread did not start within {:?}", self.settings.start_timeout);
                }
                _ => thread::sleep(IDLE_WAIT),
            }
        }
        info!("blob tracker started with {} masks", self.masks.len());
        Ok(())
    }

    /// 停止要求→上限付きjoin→供給元の解放（何度呼んでもよい）
    ///
    /// スレッドが供給元の読み込み中なら待たずに戻り、解放はスレッド側が
    /// 読み込みを終えた時点で行う。
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);

        if let Some(done) = self.done.take() {
            match done.recv_timeout(self.settings.stop_timeout) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    if let Some(handle) = self.worker.take() {
                        if handle.join().is_err() {
                            warn!("tracker thread panicked");
                        }
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    warn!(
                        "tracker thread did not exit within {:?}, detaching",
                        self.settings.stop_timeout
                    );
                    self.worker = None;
                }
            }
        }
        self.shared.state.store(STATE_DEAD, Ordering::Release);

        let mut guard = match self.source.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                warn!("frame source busy, tracker thread releases it when the read returns");
                return;
            }
        };
        if let Some(mut source) = guard.take() {
            source.release();
            debug!("frame source released");
        }
    }

    /// 最新の位置配列のコピー（マスク順）
    pub fn get_poses(&self) -> Vec<[f64; 3]> {
        self.shared.poses.snapshot()
    }

    pub fn is_alive(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    /// 処理済みフレーム数（読めなかった・空のフレームは数えない）
    pub fn frame_count(&self) -> u64 {
        self.shared.frames.load(Ordering::Acquire)
    }

    /// 全マーカーのカルマン学習を切り替える（次のフレームから反映）
    pub fn set_learning(&self, enabled: bool) {
        self.shared.learning.store(enabled, Ordering::Release);
    }

    pub fn masks(&self) -> &[ColorMask] {
        &self.masks
    }

    /// 他スレッド・タスクに渡す読み取り用ハンドル
    pub fn handle(&self) -> TrackerHandle {
        TrackerHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for BlobTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `BlobTracker` の読み取り専用ハンドル
#[derive(Clone)]
pub struct TrackerHandle {
    shared: Arc<Shared>,
}

impl TrackerHandle {
    pub fn get_poses(&self) -> Vec<[f64; 3]> {
        self.shared.poses.snapshot()
    }

    pub fn is_alive(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    pub fn set_learning(&self, enabled: bool) {
        self.shared.learning.store(enabled, Ordering::Release);
    }

    pub fn frame_count(&self) -> u64 {
        self.shared.frames.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shared.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.poses.is_empty()
    }
}

fn wait_first_frame(source: &mut Box<dyn FrameSource>, timeout: Duration) -> Result<Frame> {
    let deadline = Instant::now() + timeout;
    loop {
        match source.poll_frame().context("frame source failed before first frame")? {
            Some(frame) => return Ok(frame),
            None if Instant::now() >= deadline => {
                bail!("no frame from source within {:?}", timeout)
            }
            None => thread::sleep(IDLE_WAIT),
        }
    }
}

/// トラッキングスレッド本体
struct Worker {
    shared: Arc<Shared>,
    source: SharedSource,
    pending: Option<Frame>,
    locator: BlobLocator,
    smoothers: Vec<Option<PositionSmoother>>,
    masks: Vec<ColorMask>,
    focal_length_px: f64,
    sphere_radius: f64,
}

impl Worker {
    fn run(mut self) {
        self.shared.state.store(STATE_RUNNING, Ordering::Release);

        let mut working = vec![[0.0; 3]; self.masks.len()];
        let mut learning = self.shared.learning.load(Ordering::Acquire);

        while !self.shared.stop.load(Ordering::Acquire) {
            let frame = match self.pending.take() {
                Some(f) => f,
                None => match self.poll() {
                    Ok(Some(f)) => f,
                    Ok(None) => {
                        thread::sleep(IDLE_WAIT);
                        continue;
                    }
                    Err(e) => {
                        warn!("frame source lost: {e:#}");
                        break;
                    }
                },
            };

            let want_learning = self.shared.learning.load(Ordering::Acquire);
            if want_learning != learning {
                learning = want_learning;
                for s in self.smoothers.iter_mut().flatten() {
                    s.set_learning(learning);
                }
                info!("kalman learning {}", if learning { "on" } else { "off" });
            }

            match self.process(&frame, &mut working) {
                Ok(updated) => {
                    self.shared.poses.publish(&working);
                    let frames = self.shared.frames.fetch_add(1, Ordering::AcqRel) + 1;
                    if frames % 300 == 0 {
                        debug!("frame {}: {}/{} markers updated", frames, updated, working.len());
                    }
                }
                Err(e) => warn!("frame skipped: {e:#}"),
            }
        }

        self.shared.state.store(STATE_DEAD, Ordering::Release);
        debug!(
            "tracker loop exited after {} frames",
            self.shared.frames.load(Ordering::Acquire)
        );

        // stop() が読み込み中で解放できなかった場合に備える
        let released = self
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut source) = released {
            source.release();
            debug!("frame source released by tracker thread");
        }
    }

    fn poll(&self) -> Result<Option<Frame>> {
        let mut guard = self.source.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(source) => source.poll_frame(),
            None => bail!("frame source released"),
        }
    }

    /// 1フレーム分の処理。見つからない・NaNのマーカーは前回値のまま。
    fn process(&mut self, frame: &Frame, working: &mut [[f64; 3]]) -> Result<usize> {
        let (w, h) = frame.dimensions();
        if w == 0 || h == 0 {
            bail!("empty frame");
        }

        let blobs = self.locator.locate_all(frame, &self.masks);
        let mut updated = 0;
        for (i, blob) in blobs.into_iter().enumerate() {
            let Some(blob) = blob else {
                continue;
            };
            let points = blob.centered_points(w, h);
            let position = fit_focal_cone_to_sphere(&points, self.sphere_radius, self.focal_length_px);
            if has_nan_in_pose(&position) {
                continue;
            }
            working[i] = match self.smoothers[i].as_mut() {
                Some(s) => s.apply(position),
                None => position,
            };
            updated += 1;
        }
        Ok(updated)
    }
}
