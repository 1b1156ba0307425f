use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// 単一writer・複数readerのダブルバッファ
///
/// writerは裏スロットに書き込んでから表インデックスを切り替える。
/// readerは表スロットを丸ごとコピーして返すので、書き込み途中の配列は見えない。
#[derive(Debug)]
pub struct PoseBuffer {
    slots: [Mutex<Vec<[f64; 3]>>; 2],
    front: AtomicUsize,
    len: usize,
}

impl PoseBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            slots: [
                Mutex::new(vec![[0.0; 3]; len]),
                Mutex::new(vec![[0.0; 3]; len]),
            ],
            front: AtomicUsize::new(0),
            len,
        }
    }

    /// 要素数（マスク数、構築後は不変）
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 全要素を公開する。長さが違う場合は先頭から重なる分だけコピー。
    pub fn publish(&self, poses: &[[f64; 3]]) {
        let back = 1 - self.front.load(Ordering::Acquire);
        {
            let mut slot = self.slots[back].lock().unwrap_or_else(PoisonError::into_inner);
            let n = slot.len().min(poses.len());
            slot[..n].copy_from_slice(&poses[..n]);
        }
        self.front.store(back, Ordering::Release);
    }

    /// 最新の配列のコピー
    pub fn snapshot(&self) -> Vec<[f64; 3]> {
        let front = self.front.load(Ordering::Acquire);
        self.slots[front]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_starts_zeroed() {
        let buf = PoseBuffer::new(3);
        assert_eq!(buf.snapshot(), vec![[0.0; 3]; 3]);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_publish_then_snapshot() {
        let buf = PoseBuffer::new(2);
        buf.publish(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert_eq!(buf.snapshot(), vec![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        buf.publish(&[[7.0, 8.0, 9.0], [4.0, 5.0, 6.0]]);
        assert_eq!(buf.snapshot()[0], [7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_length_never_changes() {
        let buf = PoseBuffer::new(2);
        buf.publish(&[[1.0; 3]; 5]);
        assert_eq!(buf.snapshot().len(), 2);
        buf.publish(&[[2.0; 3]]);
        assert_eq!(buf.snapshot(), vec![[2.0; 3], [0.0; 3]]);
    }

    #[test]
    fn test_concurrent_readers_see_whole_frames() {
        let buf = Arc::new(PoseBuffer::new(4));
        let writer = {
            let buf = Arc::clone(&buf);
            std::thread::spawn(move || {
                for i in 0..2000 {
                    let v = i as f64;
                    buf.publish(&[[v; 3]; 4]);
                }
            })
        };
        for _ in 0..2000 {
            let snap = buf.snapshot();
            let first = snap[0][0];
            assert!(snap.iter().all(|p| p.iter().all(|&v| v == first)));
        }
        writer.join().unwrap();
    }
}
