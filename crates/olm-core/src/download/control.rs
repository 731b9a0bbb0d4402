//! Cooperative pause/cancel token shared between a worker and its owner.

use std::sync::Arc;

use tokio::sync::watch;

/// What the owner wants the worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Keep transferring.
    Run,
    /// Stop after the current chunk and keep the partial file.
    Pause,
    /// Stop after the current chunk and discard the partial file.
    Cancel,
}

/// Cloneable control cell. All clones observe the same signal.
///
/// Cancel is sticky: once set, [`TaskControl::set`] ignores later signals.
#[derive(Debug, Clone)]
pub struct TaskControl {
    tx: Arc<watch::Sender<ControlSignal>>,
}

impl Default for TaskControl {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskControl {
    /// New token in the [`ControlSignal::Run`] state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlSignal::Run);
        Self { tx: Arc::new(tx) }
    }

    /// Current signal.
    #[must_use]
    pub fn signal(&self) -> ControlSignal {
        *self.tx.borrow()
    }

    /// Replace the signal unless it is already [`ControlSignal::Cancel`].
    pub fn set(&self, signal: ControlSignal) {
        self.tx.send_if_modified(|current| {
            if *current == ControlSignal::Cancel || *current == signal {
                return false;
            }
            *current = signal;
            true
        });
    }

    /// Request a pause.
    pub fn pause(&self) {
        self.set(ControlSignal::Pause);
    }

    /// Clear a pause.
    pub fn resume(&self) {
        self.set(ControlSignal::Run);
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.set(ControlSignal::Cancel);
    }

    /// Wait until the signal is anything other than [`ControlSignal::Run`].
    pub async fn stopped(&self) -> ControlSignal {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|signal| *signal != ControlSignal::Run).await {
            Ok(signal) => *signal,
            Err(_) => ControlSignal::Cancel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_signal_transitions() {
        let control = TaskControl::new();
        assert_eq!(control.signal(), ControlSignal::Run);

        control.pause();
        assert_eq!(control.signal(), ControlSignal::Pause);

        control.resume();
        assert_eq!(control.signal(), ControlSignal::Run);
    }

    #[test]
    fn test_cancel_is_sticky() {
        let control = TaskControl::new();
        control.cancel();
        control.resume();
        control.pause();
        assert_eq!(control.signal(), ControlSignal::Cancel);
    }

    #[tokio::test]
    async fn test_stopped_wakes_on_pause() {
        let control = TaskControl::new();
        let worker = control.clone();
        let handle = tokio::spawn(async move { worker.stopped().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        control.pause();

        let signal = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal, ControlSignal::Pause);
    }

    #[tokio::test]
    async fn test_stopped_returns_immediately_when_already_stopped() {
        let control = TaskControl::new();
        control.cancel();
        assert_eq!(control.stopped().await, ControlSignal::Cancel);
    }
}
