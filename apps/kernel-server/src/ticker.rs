// [[MISSION]]/apps/kernel-server/src/ticker.rs
// Purpose: Pacing of synthetic progress. Produces the 0..=100 ladder and the
//          cancellable waits between ticks and between steps.
// Architecture: Domain Logic Layer
// Dependencies: tokio, tokio-util

use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::KernelConfig;
use crate::models::RunStatus;

pub const PROGRESS_STEP: u8 = 10;

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Elapsed,
    /// The run status changed while waiting.
    StatusChanged,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickPolicy {
    pub interval: Duration,
    pub settle: Duration,
}

impl TickPolicy {
    pub fn new(interval: Duration, settle: Duration) -> Self {
        Self { interval, settle }
    }

    /// No waiting at all. Every wait still yields to the scheduler once.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn from_config(config: &KernelConfig) -> Self {
        Self::new(config.progress_tick(), config.step_settle())
    }

    /// 0, 10, 20, ... 100.
    pub fn ladder(&self) -> impl Iterator<Item = u8> {
        (0..=100u8).step_by(PROGRESS_STEP as usize)
    }

    pub async fn pace(
        &self,
        status: &mut watch::Receiver<RunStatus>,
        cancel: &CancellationToken,
    ) -> Wake {
        wait(self.interval, status, cancel).await
    }

    pub async fn settle(
        &self,
        status: &mut watch::Receiver<RunStatus>,
        cancel: &CancellationToken,
    ) -> Wake {
        wait(self.settle, status, cancel).await
    }

    /// Interval wait that only honours cancellation, for work that is not
    /// bound to a run.
    pub async fn tick(&self, cancel: &CancellationToken) -> Wake {
        tokio::select! {
            _ = cancel.cancelled() => Wake::Cancelled,
            _ = sleep_or_yield(self.interval) => Wake::Elapsed,
        }
    }
}

async fn wait(
    duration: Duration,
    status: &mut watch::Receiver<RunStatus>,
    cancel: &CancellationToken,
) -> Wake {
    tokio::select! {
        _ = cancel.cancelled() => Wake::Cancelled,
        changed = status.changed() => match changed {
            Ok(()) => Wake::StatusChanged,
            Err(_) => Wake::Cancelled,
        },
        _ = sleep_or_yield(duration) => Wake::Elapsed,
    }
}

async fn sleep_or_yield(duration: Duration) {
    if duration.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(duration).await;
    }
}
