//! Common utilities

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::endpoint::{Timer, TimerHandle};

#[derive(Debug)]
pub(crate) enum Running {
    Continue,
    Stop,
}

/// One-shot timer backed by the tokio runtime. Cancel wins any race with
/// the sleep; a task that already started running is the fire path's
/// re-check problem, which is why session timer tasks verify attachment.
#[derive(Debug, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn add(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let token = CancellationToken::new();
        let fired = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = fired.cancelled() => {}
                _ = tokio::time::sleep(delay) => task(),
            }
        });
        TimerHandle::new(token)
    }
}
