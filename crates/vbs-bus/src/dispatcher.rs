//! Single-threaded callback and timer dispatcher
//!
//! All ready/terminated notifications and discovery timer firings are
//! serialized through one ordered queue consumed on a dedicated thread. The
//! thread drives a current-thread tokio runtime so delayed tasks are plain
//! `tokio::time::sleep` futures that post back onto the same queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vbs_core::{VbsError, VbsResult};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Stop,
}

/// Handle to a delayed task; cancelling prevents it from running if it has
/// not started yet
#[derive(Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    join: tokio::task::JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.join.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Ordered task queue running on its own thread
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Message>,
    runtime: tokio::runtime::Handle,
    thread_id: ThreadId,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Latest generation posted per coalescing key
    coalesced: Arc<Mutex<HashMap<String, u64>>>,
    generation: Mutex<u64>,
}

impl Dispatcher {
    /// Spawn the dispatcher thread
    pub fn new() -> VbsResult<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();

        let thread = std::thread::Builder::new()
            .name("vbs-dispatcher".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));

                runtime.block_on(async move {
                    while let Some(message) = rx.recv().await {
                        match message {
                            Message::Run(task) => task(),
                            Message::Stop => break,
                        }
                    }
                });
                debug!("Dispatcher stopped");
            })
            .map_err(|e| VbsError::Internal(format!("Failed to spawn dispatcher: {}", e)))?;

        let runtime = handle_rx
            .recv()
            .map_err(|e| VbsError::Internal(format!("Dispatcher thread exited: {}", e)))?
            .map_err(|e| VbsError::Internal(format!("Failed to build dispatcher runtime: {}", e)))?;

        Ok(Self {
            tx,
            runtime,
            thread_id: thread.thread().id(),
            thread: Mutex::new(Some(thread)),
            coalesced: Arc::new(Mutex::new(HashMap::new())),
            generation: Mutex::new(0),
        })
    }

    /// Queue a task behind everything already posted
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        if self.tx.send(Message::Run(Box::new(task))).is_err() {
            debug!("Dispatcher stopped, dropping task");
        }
    }

    /// Queue a task, replacing any still-pending task posted under the same key
    ///
    /// The replacement takes the position of the new post, so at most one
    /// task per key is ever pending.
    pub fn post_coalesced(&self, key: impl Into<String>, task: impl FnOnce() + Send + 'static) {
        let key = key.into();
        let generation = {
            let mut counter = self.generation.lock();
            *counter += 1;
            *counter
        };
        self.coalesced.lock().insert(key.clone(), generation);

        let coalesced = self.coalesced.clone();
        self.post(move || {
            let current = {
                let mut pending = coalesced.lock();
                match pending.get(&key) {
                    Some(&latest) if latest == generation => {
                        pending.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if current {
                task();
            }
        });
    }

    /// Run a task on the dispatcher after `delay`
    pub fn post_delayed(
        &self,
        delay: Duration,
        task: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let tx = self.tx.clone();
        let flag = cancelled.clone();

        let join = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if flag.load(Ordering::SeqCst) {
                return;
            }
            let run = move || {
                // Cancelled after firing but before reaching the head of the queue
                if !flag.load(Ordering::SeqCst) {
                    task();
                }
            };
            let _ = tx.send(Message::Run(Box::new(run)));
        });

        TimerHandle { cancelled, join }
    }

    /// Whether the caller is running on the dispatcher thread
    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Block until every task posted before this call has run
    ///
    /// Returns immediately when called from the dispatcher itself.
    pub fn flush(&self) {
        if self.is_current() {
            return;
        }
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        self.post(move || {
            let _ = done_tx.send(());
        });
        let _ = done_rx.recv();
    }

    /// Stop the dispatcher after the tasks already queued; pending timers are dropped
    pub fn shutdown(&self) {
        let _ = self.tx.send(Message::Stop);
        if self.is_current() {
            return;
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!("Dispatcher thread panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
