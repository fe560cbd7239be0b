//! Isolated cooperative execution context for webhook dispatch and
//! user-supplied hook callables, so a slow or panicking hook can never stall
//! the main scheduling loop. Runs its own single-threaded Tokio runtime
//! parked on a dedicated OS thread.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use cronweb_core::model::{JobState, JobType};

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// What a hook callable receives: the outcome of one shot.
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub name: String,
    pub shot_id: String,
    pub uuid: String,
    pub state: JobState,
    pub job_type: JobType,
    pub timestamp_ms: i64,
}

pub type HookFn = Arc<dyn Fn(HookEvent) -> BoxFuture + Send + Sync>;

/// Compile-time registry of local hooks. Each entry's name must begin with
/// `hook_job_done`, mirroring the naming convention the source discovers
/// `hook_job_done*.py` callables by.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Vec<(String, HookFn)>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook. Panics if `name` does not start with `hook_job_done`,
    /// since that is a programming error (a fixed registry entry, not user
    /// input).
    pub fn register(&mut self, name: impl Into<String>, hook: HookFn) {
        let name = name.into();
        assert!(
            name.starts_with("hook_job_done"),
            "hook name {name:?} must start with hook_job_done"
        );
        self.hooks.push((name, hook));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, HookFn)> {
        self.hooks.iter()
    }
}

enum Message {
    Run(BoxFuture, Duration),
    Stop,
}

/// A dedicated cooperative execution context for hook/webhook futures.
pub struct HookHost {
    tx: mpsc::UnboundedSender<Message>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl HookHost {
    pub fn start() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let thread = std::thread::Builder::new()
            .name("cronweb-hooks".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build hook host runtime");
                rt.block_on(async move {
                    let mut in_flight = Vec::new();
                    loop {
                        match rx.recv().await {
                            Some(Message::Run(fut, timeout)) => {
                                in_flight.retain(|h: &tokio::task::JoinHandle<()>| !h.is_finished());
                                in_flight.push(tokio::spawn(async move {
                                    if tokio::time::timeout(timeout, fut).await.is_err() {
                                        tracing::warn!("hook run timed out");
                                    }
                                }));
                            }
                            Some(Message::Stop) | None => {
                                for handle in in_flight.drain(..) {
                                    handle.abort();
                                }
                                break;
                            }
                        }
                    }
                });
            })
            .expect("failed to spawn hook host thread");

        Self {
            tx,
            thread: Some(thread),
        }
    }

    /// Schedules `fut` onto the hook loop bounded by `timeout`. Fire-and-forget
    /// from the caller's perspective: errors and timeouts are logged and
    /// swallowed, never propagated back to the main loop.
    pub fn run_coroutine(&self, fut: BoxFuture, timeout: Duration) {
        if self.tx.send(Message::Run(fut, timeout)).is_err() {
            tracing::warn!("hook host is stopped, dropping hook run");
        }
    }

    pub fn stop(&mut self) {
        let _ = self.tx.send(Message::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HookHost {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn run_coroutine_executes_on_separate_thread() {
        let host = HookHost::start();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        host.run_coroutine(
            Box::pin(async move {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_secs(1),
        );
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_coroutine_swallows_timeouts() {
        let host = HookHost::start();
        host.run_coroutine(
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }),
            Duration::from_millis(20),
        );
        std::thread::sleep(Duration::from_millis(100));
    }

    #[test]
    fn registry_rejects_misnamed_hooks() {
        let mut registry = HookRegistry::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            registry.register("not_a_hook", Arc::new(|_| Box::pin(async {}) as BoxFuture));
        }));
        assert!(result.is_err());
    }
}
