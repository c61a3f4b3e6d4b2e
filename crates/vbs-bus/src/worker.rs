//! Per-bus read and write worker threads
//!
//! Each worker moves frames between one socket handle and the application
//! until it is cancelled or the hardware call fails. A failed call means the
//! link went away underneath it (the manager tore it down), so the worker
//! just records TERMINATED and exits. A terminated worker is never reused;
//! the next attach spawns a new pair.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};
use vbs_core::{BusKind, Frame, VbsError, VbsResult};

use crate::queue::FrameQueue;
use crate::transport::{BusSocket, HardwareTransport};

/// Observable worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    NotReady = 0,
    Ready = 1,
    Terminated = 2,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Ready,
            2 => Self::Terminated,
            _ => Self::NotReady,
        }
    }
}

/// Receiver of frames read from the bus
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, frame: Frame);
}

impl<F> FrameHandler for F
where
    F: Fn(Frame) + Send + Sync,
{
    fn on_frame(&self, frame: Frame) {
        self(frame)
    }
}

#[derive(Debug, Default)]
struct WorkerShared {
    state: AtomicU8,
    cancelled: AtomicBool,
}

impl WorkerShared {
    fn set(&self, state: WorkerState) {
        // Terminated is final
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != WorkerState::Terminated as u8).then_some(state as u8)
            });
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Handle to one worker thread
#[derive(Debug)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    fn spawn(name: String, body: impl FnOnce(&WorkerShared) + Send + 'static) -> VbsResult<Self> {
        let shared = Arc::new(WorkerShared::default());
        let worker = shared.clone();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                body(&worker);
                worker.set(WorkerState::Terminated);
            })
            .map_err(|e| VbsError::Internal(format!("Failed to spawn {}: {}", name, e)))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// Ask the worker to exit; a call blocked in the hardware only returns
    /// once the link is torn down
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
    }

    /// Poll until the worker reached TERMINATED
    pub fn wait_terminated(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.state() != WorkerState::Terminated {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel();
        if let Some(thread) = self.thread.take() {
            // Only join exited workers; a blocked one is detached
            if thread.is_finished() {
                let _ = thread.join();
            }
        }
    }
}

/// Spawn a read worker; every received frame goes to `handler`
pub fn spawn_reader(
    bus: BusKind,
    transport: Arc<dyn HardwareTransport>,
    socket: BusSocket,
    handler: Arc<dyn FrameHandler>,
) -> VbsResult<WorkerHandle> {
    let name = format!("{}-rx", bus.name().to_lowercase());
    WorkerHandle::spawn(name, move |worker| {
        if worker.is_cancelled() {
            return;
        }
        worker.set(WorkerState::Ready);
        debug!(%bus, socket = socket.socket, "Read worker ready");

        while !worker.is_cancelled() {
            match transport.receive(&socket, bus) {
                Ok(frame) => {
                    if worker.is_cancelled() {
                        break;
                    }
                    handler.on_frame(frame);
                }
                Err(e) => {
                    debug!(%bus, error = %e, "Read worker stopping");
                    break;
                }
            }
        }
    })
}

/// Spawn a write worker draining `queue` into the socket
///
/// The queue is cleared on entry; frames left over from a previous attach
/// are never sent on a new link.
pub fn spawn_writer(
    bus: BusKind,
    transport: Arc<dyn HardwareTransport>,
    socket: BusSocket,
    queue: Arc<FrameQueue>,
    idle: Duration,
) -> VbsResult<WorkerHandle> {
    let name = format!("{}-tx", bus.name().to_lowercase());
    WorkerHandle::spawn(name, move |worker| {
        if worker.is_cancelled() {
            return;
        }
        queue.clear();
        worker.set(WorkerState::Ready);
        debug!(%bus, socket = socket.socket, "Write worker ready");

        while !worker.is_cancelled() {
            match queue.pop() {
                Some(frame) => {
                    if let Err(e) = transport.send(&socket, bus, &frame) {
                        warn!(%bus, %frame, error = %e, "Write worker stopping");
                        break;
                    }
                }
                None => std::thread::sleep(idle),
            }
        }
    })
}

/// Read worker plus optional write worker bound to one socket
#[derive(Debug)]
pub struct BusWorkerPair {
    socket: BusSocket,
    reader: WorkerHandle,
    writer: Option<WorkerHandle>,
}

impl BusWorkerPair {
    /// Start a read-only pair
    pub fn read_only(
        bus: BusKind,
        transport: Arc<dyn HardwareTransport>,
        socket: BusSocket,
        handler: Arc<dyn FrameHandler>,
    ) -> VbsResult<Self> {
        let reader = spawn_reader(bus, transport, socket.clone(), handler)?;
        Ok(Self {
            socket,
            reader,
            writer: None,
        })
    }

    /// Start a read/write pair
    pub fn read_write(
        bus: BusKind,
        transport: Arc<dyn HardwareTransport>,
        socket: BusSocket,
        handler: Arc<dyn FrameHandler>,
        queue: Arc<FrameQueue>,
        idle: Duration,
    ) -> VbsResult<Self> {
        let writer = spawn_writer(bus, transport.clone(), socket.clone(), queue, idle)?;
        let reader = match spawn_reader(bus, transport, socket.clone(), handler) {
            Ok(reader) => reader,
            Err(e) => {
                writer.cancel();
                return Err(e);
            }
        };
        Ok(Self {
            socket,
            reader,
            writer: Some(writer),
        })
    }

    pub fn socket(&self) -> &BusSocket {
        &self.socket
    }

    pub fn read_state(&self) -> WorkerState {
        self.reader.state()
    }

    /// `None` for read-only pairs
    pub fn write_state(&self) -> Option<WorkerState> {
        self.writer.as_ref().map(WorkerHandle::state)
    }

    pub fn is_read_ready(&self) -> bool {
        self.read_state() == WorkerState::Ready
    }

    pub fn is_write_ready(&self) -> bool {
        self.write_state() == Some(WorkerState::Ready)
    }

    pub fn cancel(&self) {
        self.reader.cancel();
        if let Some(writer) = &self.writer {
            writer.cancel();
        }
    }

    pub fn reader(&self) -> &WorkerHandle {
        &self.reader
    }

    pub fn writer(&self) -> Option<&WorkerHandle> {
        self.writer.as_ref()
    }
}

/// The current worker pair of a bus, replaced on every attach
#[derive(Debug, Default)]
pub struct WorkerSlot {
    pair: Mutex<Option<BusWorkerPair>>,
}

impl WorkerSlot {
    /// Install a new pair, cancelling the previous one
    pub fn replace(&self, pair: BusWorkerPair) {
        if let Some(old) = self.pair.lock().replace(pair) {
            old.cancel();
        }
    }

    /// Cancel and drop the current pair
    pub fn clear(&self) {
        if let Some(old) = self.pair.lock().take() {
            old.cancel();
        }
    }

    pub fn is_read_ready(&self) -> bool {
        self.pair
            .lock()
            .as_ref()
            .is_some_and(BusWorkerPair::is_read_ready)
    }

    pub fn is_write_ready(&self) -> bool {
        self.pair
            .lock()
            .as_ref()
            .is_some_and(BusWorkerPair::is_write_ready)
    }

    pub fn read_state(&self) -> Option<WorkerState> {
        self.pair.lock().as_ref().map(BusWorkerPair::read_state)
    }

    pub fn write_state(&self) -> Option<WorkerState> {
        self.pair.lock().as_ref().and_then(BusWorkerPair::write_state)
    }
}
