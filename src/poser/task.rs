use anyhow::Result;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pose::Device;

pub type TaskFn = Box<dyn FnMut(&mut [Device]) -> Result<()> + Send>;

/// 周期実行されるポーザーのタスク
pub struct PoserTask {
    name: String,
    period: Duration,
    job: TaskFn,
}

impl PoserTask {
    pub fn new<F>(name: impl Into<String>, period: Duration, job: F) -> Self
    where
        F: FnMut(&mut [Device]) -> Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            period: period.max(Duration::from_millis(1)),
            job: Box::new(job),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// キャンセルされるか、ジョブがエラーを返すまで回す
    pub async fn run(mut self, devices: Arc<Mutex<Vec<Device>>>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("task {:?} started ({:?})", self.name, self.period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let result = {
                        let mut devs = devices.lock().unwrap_or_else(PoisonError::into_inner);
                        (self.job)(devs.as_mut_slice())
                    };
                    if let Err(e) = result {
                        warn!("task {:?} stopped: {e:#}", self.name);
                        return;
                    }
                }
            }
        }
        debug!("task {:?} finished", self.name);
    }
}
