//! Cooperative run control.
//!
//! The caller keeps a [`RunHandle`]; the pipeline gets the matching
//! [`RunControls`] and consults them only at checkpoints (before each
//! repository), so an in-flight transfer is never interrupted.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Why a run left its loop early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Keep-running flag was cleared.
    Halted,
    Cancelled,
}

/// Result of polling the controls at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Proceed,
    Paused,
    Stop(StopReason),
}

/// Caller side. Cheap to clone and safe to use from any thread.
#[derive(Clone)]
pub struct RunHandle {
    running: Arc<AtomicBool>,
    pause: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
}

/// Pipeline side.
pub struct RunControls {
    running: Arc<AtomicBool>,
    pause: watch::Receiver<bool>,
    cancel: CancellationToken,
}

/// Create a linked handle/controls pair, initially running and unpaused.
pub fn channel() -> (RunHandle, RunControls) {
    let running = Arc::new(AtomicBool::new(true));
    let (pause_tx, pause_rx) = watch::channel(false);
    let cancel = CancellationToken::new();
    (
        RunHandle {
            running: Arc::clone(&running),
            pause: Arc::new(pause_tx),
            cancel: cancel.clone(),
        },
        RunControls {
            running,
            pause: pause_rx,
            cancel,
        },
    )
}

impl RunHandle {
    pub fn pause(&self) {
        self.pause.send_replace(true);
    }

    pub fn resume(&self) {
        self.pause.send_replace(false);
    }

    pub fn toggle_pause(&self) {
        self.pause.send_modify(|paused| *paused = !*paused);
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    /// Clear the keep-running flag. The run stops at its next checkpoint and
    /// stays resumable.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // Wake a paused worker so it notices.
        self.pause.send_modify(|_| {});
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl RunControls {
    /// Non-blocking look at the current signals. Cancellation wins over
    /// halting, which wins over pausing.
    pub fn poll(&self) -> Signal {
        if self.cancel.is_cancelled() {
            Signal::Stop(StopReason::Cancelled)
        } else if !self.running.load(Ordering::SeqCst) {
            Signal::Stop(StopReason::Halted)
        } else if *self.pause.borrow() {
            Signal::Paused
        } else {
            Signal::Proceed
        }
    }

    /// Block (without spinning) until the pause is cleared or the run is
    /// told to stop. Never returns [`Signal::Paused`].
    pub async fn wait_while_paused(&mut self) -> Signal {
        loop {
            self.pause.borrow_and_update();
            match self.poll() {
                Signal::Paused => {}
                other => return other,
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Signal::Stop(StopReason::Cancelled),
                changed = self.pause.changed() => {
                    // Nobody left to resume us.
                    if changed.is_err() {
                        return Signal::Stop(StopReason::Halted);
                    }
                }
            }
        }
    }
}

/// Map interrupts onto `handle`: the first one cancels the run at its next
/// checkpoint, a second one asks the caller to exit immediately.
///
/// Returns `true` after the second interrupt and `false` if the interrupt
/// source fails before that.
pub async fn forward_interrupts<F, Fut>(handle: RunHandle, mut interrupt: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = interrupt().await {
        warn!(error = %e, "cannot listen for interrupts");
        return false;
    }
    warn!("interrupt received, stopping after the current repository (interrupt again to exit now)");
    handle.cancel();

    match interrupt().await {
        Ok(()) => {
            warn!("second interrupt received, exiting");
            true
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for interrupts");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fresh_controls_proceed() {
        let (_handle, controls) = channel();
        assert_eq!(controls.poll(), Signal::Proceed);
    }

    #[test]
    fn test_signal_precedence() {
        let (handle, controls) = channel();
        handle.pause();
        assert_eq!(controls.poll(), Signal::Paused);
        handle.stop();
        assert_eq!(controls.poll(), Signal::Stop(StopReason::Halted));
        handle.cancel();
        assert_eq!(controls.poll(), Signal::Stop(StopReason::Cancelled));
    }

    #[test]
    fn test_toggle_pause() {
        let (handle, controls) = channel();
        handle.toggle_pause();
        assert!(handle.is_paused());
        handle.toggle_pause();
        assert_eq!(controls.poll(), Signal::Proceed);
    }

    #[tokio::test]
    async fn test_wait_returns_on_resume() {
        let (handle, mut controls) = channel();
        handle.pause();
        let waiter = tokio::spawn(async move { controls.wait_while_paused().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        handle.resume();
        assert_eq!(waiter.await.unwrap(), Signal::Proceed);
    }

    #[tokio::test]
    async fn test_wait_returns_on_cancel() {
        let (handle, mut controls) = channel();
        handle.pause();
        let waiter = tokio::spawn(async move { controls.wait_while_paused().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        assert_eq!(
            waiter.await.unwrap(),
            Signal::Stop(StopReason::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_wait_returns_on_stop() {
        let (handle, mut controls) = channel();
        handle.pause();
        let waiter = tokio::spawn(async move { controls.wait_while_paused().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop();
        assert_eq!(waiter.await.unwrap(), Signal::Stop(StopReason::Halted));
    }

    #[tokio::test]
    async fn test_first_interrupt_cancels_second_forces_exit() {
        let (handle, controls) = channel();
        let interrupts = Arc::new(tokio::sync::Notify::new());
        let source = Arc::clone(&interrupts);
        let forwarder = tokio::spawn(forward_interrupts(handle, move || {
            let source = Arc::clone(&source);
            async move {
                source.notified().await;
                Ok(())
            }
        }));

        interrupts.notify_one();
        for _ in 0..100 {
            if controls.poll() != Signal::Proceed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(controls.poll(), Signal::Stop(StopReason::Cancelled));
        assert!(!forwarder.is_finished());

        interrupts.notify_one();
        assert!(forwarder.await.unwrap());
    }

    #[tokio::test]
    async fn test_broken_interrupt_source_leaves_run_alone() {
        let (handle, controls) = channel();
        let forced = forward_interrupts(handle, || async {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "no signal handler"))
        })
        .await;
        assert!(!forced);
        assert_eq!(controls.poll(), Signal::Proceed);
    }

    #[tokio::test]
    async fn test_dropped_handle_releases_paused_worker() {
        let (handle, mut controls) = channel();
        handle.pause();
        drop(handle);
        assert_eq!(
            controls.wait_while_paused().await,
            Signal::Stop(StopReason::Halted)
        );
    }
}
