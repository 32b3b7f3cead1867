use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// A long-running component that ended with an error or a panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentFailure {
    pub component: &'static str,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct FailureReporter {
    tx: mpsc::UnboundedSender<ComponentFailure>,
}

impl FailureReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ComponentFailure>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn report(&self, failure: ComponentFailure) {
        // Receiver gone means nobody supervises any more; the failure was logged.
        let _ = self.tx.send(failure);
    }
}

/// Handle on a spawned component loop.
#[derive(Debug)]
pub struct ComponentHandle {
    name: &'static str,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ComponentHandle {
    /// Requests shutdown without waiting for it. Idempotent.
    pub fn signal_stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Requests shutdown and waits for the loop to finish its current iteration.
    #[tracing::instrument(level = "debug", skip(self), fields(component = self.name))]
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            tracing::warn!(component = self.name, error = %err, "component task did not join cleanly");
        }
    }
}

/// Spawns `fut` as component `name`, logging and reporting an error return or
/// a panic instead of letting it vanish with the task.
pub fn spawn_component<F>(
    name: &'static str,
    cancel: CancellationToken,
    reporter: Option<FailureReporter>,
    fut: F,
) -> ComponentHandle
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let task = tokio::spawn(async move {
        let message = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err.to_string(),
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };
        tracing::error!(component = name, error = %message, "component terminated with failure");
        if let Some(reporter) = reporter {
            reporter.report(ComponentFailure {
                component: name,
                message,
            });
        }
    });
    ComponentHandle { name, cancel, task }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
