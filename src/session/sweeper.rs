//! Periodic background eviction.

use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Handle to a running sweeper task. Dropping it also stops the task.
#[derive(Debug)]
pub struct SweeperHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stops the task and waits for an in-progress sweep to finish.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            // Err means the task already exited.
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Sweeper task ended abnormally: {}", e);
        }
    }

    /// False once the task has exited.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Runs `sweep` every `interval` until stopped. `sweep` returns `None` when
/// its target is gone, which also ends the task.
pub(crate) fn spawn<F, Fut>(interval: Duration, sweep: F) -> SweeperHandle
where
    F: Fn() -> Option<Fut> + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let (stop, mut stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so a fresh manager
        // is not swept before anything could expire.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut stopped => break,
                _ = ticker.tick() => {
                    let Some(run) = sweep() else {
                        debug!("Sweeper target dropped");
                        break;
                    };
                    run.await;
                }
            }
        }
        debug!("Sweeper stopped");
    });

    SweeperHandle {
        stop: Some(stop),
        task,
    }
}
