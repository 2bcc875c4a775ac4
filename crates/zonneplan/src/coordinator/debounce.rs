use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::trace;

/// Coalesces bursts of calls into single runs of an action.
///
/// Non-immediate debouncers run the action once at the end of a cooldown
/// window that starts with the first call. Immediate ones run on the first
/// call and then at most once more per window while calls keep coming.
pub struct Debouncer {
    tx: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl Debouncer {
    pub fn new<F, Fut>(cooldown: Duration, immediate: bool, action: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let mut pending = true;
                if immediate {
                    action().await;
                    pending = false;
                }

                loop {
                    tokio::time::sleep(cooldown).await;
                    loop {
                        match rx.try_recv() {
                            Ok(()) => pending = true,
                            Err(TryRecvError::Empty) => break,
                            Err(TryRecvError::Disconnected) => return,
                        }
                    }
                    if !pending {
                        break;
                    }
                    trace!("Debounce window elapsed, running action");
                    action().await;
                    pending = false;
                }
            }
        });

        Self { tx, task }
    }

    pub fn call(&self) {
        // The receiver only goes away after cancel(), so a failed send is moot.
        let _ = self.tx.send(());
    }

    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
