//! Command-stream backend
//!
//! Models an accelerator whose memory is only reachable through an ordered
//! command queue. A dedicated worker thread owns the receiving end of the
//! queue and executes commands one at a time; writes, frees and kernel
//! launches return as soon as they are enqueued. Reads and `synchronize`
//! block until the stream has drained up to that point.
//!
//! A kernel failing on the worker is recorded against the pass it belongs to
//! and reported by that pass's next `synchronize_pass`; later dispatches of
//! the same pass are discarded while other passes keep running. A write
//! failing on the worker belongs to no pass and is reported by the next
//! plain `synchronize`.

use crate::backend::cpu::reference_kernels;
use crate::backend::{
    lookup_kernel, Backend, BackendError, BackendId, BackendResult, Buffer,
    DeviceKind, KernelCall, KernelFn, KernelTable, PassId,
};
use crate::graph::OpCode;
use crate::tensor::DType;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Stream backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub name: String,
    /// Threads of the pool kernels run on; 0 uses one per logical core
    pub threads: usize,
    pub alignment: usize,
    /// Restrict the kernel table to these ops
    pub ops: Option<Vec<OpCode>>,
    /// Restrict the kernel table to these first-input dtypes
    pub dtypes: Option<Vec<DType>>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: "stream".to_string(),
            threads: 0,
            alignment: 256,
            ops: None,
            dtypes: None,
        }
    }
}

impl StreamConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Kernel table this configuration exposes
    pub fn kernel_table(&self) -> KernelTable {
        let mut table = reference_kernels();
        table.retain(|op, dtype| {
            self.ops.as_ref().map_or(true, |ops| ops.contains(&op))
                && self.dtypes.as_ref().map_or(true, |dtypes| dtypes.contains(&dtype))
        });
        table
    }
}

enum Command {
    Write {
        buffer: Buffer,
        offset: usize,
        data: Vec<u8>,
    },
    Dispatch {
        call: KernelCall,
        kernel: KernelFn,
    },
    Free(Buffer),
    Read {
        buffer: Buffer,
        offset: usize,
        len: usize,
        reply: SyncSender<BackendResult<Vec<u8>>>,
    },
    Fence(SyncSender<()>),
    Shutdown,
}

/// State shared between the handle and its worker
struct StreamState {
    pending: AtomicUsize,
    /// First failure of each pass that has not been reported yet
    failures: Mutex<HashMap<PassId, BackendError>>,
}

impl StreamState {
    fn fail(&self, pass: PassId, error: BackendError) {
        self.failures.lock().entry(pass).or_insert(error);
    }

    fn has_failed(&self, pass: PassId) -> bool {
        self.failures.lock().contains_key(&pass)
    }
}

/// Accelerator-class backend driven by a command stream
pub struct StreamBackend {
    id: BackendId,
    name: String,
    alignment: usize,
    kernels: KernelTable,
    sender: Mutex<Sender<Command>>,
    state: Arc<StreamState>,
    worker: Option<JoinHandle<()>>,
}

impl StreamBackend {
    pub fn new(id: BackendId, config: StreamConfig) -> BackendResult<Self> {
        if !config.alignment.is_power_of_two() {
            return Err(BackendError::InvalidArgument(format!(
                "alignment {} is not a power of two",
                config.alignment
            )));
        }
        let threads = if config.threads == 0 {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            config.threads
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| BackendError::NotAvailable(format!("{}: {}", config.name, e)))?;

        let kernels = config.kernel_table();
        let state = Arc::new(StreamState {
            pending: AtomicUsize::new(0),
            failures: Mutex::new(HashMap::new()),
        });
        let (sender, receiver) = mpsc::channel();

        let worker = std::thread::Builder::new()
            .name(format!("{}-stream", config.name))
            .spawn({
                let state = Arc::clone(&state);
                let name = config.name.clone();
                move || run_stream(&name, receiver, &state, &pool)
            })
            .map_err(|e| BackendError::NotAvailable(format!("{}: {}", config.name, e)))?;

        info!(
            backend = %config.name,
            threads,
            kernels = kernels.len(),
            "created stream backend"
        );

        Ok(Self {
            id,
            name: config.name,
            alignment: config.alignment,
            kernels,
            sender: Mutex::new(sender),
            state,
            worker: Some(worker),
        })
    }

    fn submit(&self, command: Command) -> BackendResult<()> {
        self.state.pending.fetch_add(1, Ordering::AcqRel);
        if self.sender.lock().send(command).is_err() {
            self.state.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(BackendError::StreamClosed(self.name.clone()));
        }
        Ok(())
    }

    /// Number of commands enqueued but not yet completed
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::Acquire)
    }

    pub fn kernels(&self) -> &KernelTable {
        &self.kernels
    }

    /// Wait until every command submitted so far has run
    fn fence(&self) -> BackendResult<()> {
        let (reply, done) = mpsc::sync_channel(1);
        self.submit(Command::Fence(reply))?;
        done.recv()
            .map_err(|_| BackendError::StreamClosed(self.name.clone()))
    }
}

fn run_stream(name: &str, receiver: Receiver<Command>, state: &StreamState, pool: &rayon::ThreadPool) {
    debug!(backend = name, "stream worker started");
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Write { buffer, offset, data } => {
                if let Err(e) = buffer.write_range(offset, &data) {
                    warn!(backend = name, error = %e, "write failed");
                    state.fail(PassId::default(), e);
                }
            }
            Command::Dispatch { call, kernel } => {
                if state.has_failed(call.pass) {
                    trace!(
                        backend = name,
                        pass = %call.pass,
                        node = %call.node,
                        "skipping dispatch after failure"
                    );
                } else if let Err(e) = pool.install(|| kernel(&call)) {
                    warn!(backend = name, node = %call.node, op = %call.op, error = %e, "kernel failed");
                    let error = BackendError::KernelFailed {
                        node: call.node,
                        op: call.op.code(),
                        message: e.to_string(),
                    };
                    state.fail(call.pass, error);
                }
            }
            Command::Free(buffer) => buffer.release(),
            Command::Read {
                buffer,
                offset,
                len,
                reply,
            } => {
                // The caller may have stopped waiting
                let _ = reply.send(buffer.read_range(offset, len));
            }
            Command::Fence(reply) => {
                let _ = reply.send(());
            }
            Command::Shutdown => {
                state.pending.fetch_sub(1, Ordering::AcqRel);
                break;
            }
        }
        state.pending.fetch_sub(1, Ordering::AcqRel);
    }
    debug!(backend = name, "stream worker stopped");
}

impl Backend for StreamBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Accelerator
    }

    fn alignment(&self) -> usize {
        self.alignment
    }

    fn alloc_buffer(&self, size: usize) -> BackendResult<Buffer> {
        Ok(Buffer::new(self.id, size))
    }

    fn free_buffer(&self, buffer: Buffer) -> BackendResult<()> {
        buffer.check_owner(self.id, &self.name)?;
        self.submit(Command::Free(buffer))
    }

    fn write(&self, buffer: &Buffer, offset: usize, data: &[u8]) -> BackendResult<()> {
        buffer.check_owner(self.id, &self.name)?;
        if offset.checked_add(data.len()).map_or(true, |end| end > buffer.size()) {
            return Err(BackendError::OutOfBounds {
                offset,
                len: data.len(),
                size: buffer.size(),
            });
        }
        self.submit(Command::Write {
            buffer: buffer.clone(),
            offset,
            data: data.to_vec(),
        })
    }

    fn read(&self, buffer: &Buffer, offset: usize, len: usize) -> BackendResult<Vec<u8>> {
        buffer.check_owner(self.id, &self.name)?;
        let (reply, response) = mpsc::sync_channel(1);
        self.submit(Command::Read {
            buffer: buffer.clone(),
            offset,
            len,
            reply,
        })?;
        response
            .recv()
            .map_err(|_| BackendError::StreamClosed(self.name.clone()))?
    }

    fn supports(&self, op: OpCode, dtype: DType) -> bool {
        self.kernels.contains(op, dtype)
    }

    fn dispatch(&self, call: &KernelCall) -> BackendResult<()> {
        call.check_owner(self.id, &self.name)?;
        let kernel = lookup_kernel(&self.kernels, &self.name, call)?;
        trace!(backend = %self.name, node = %call.node, op = %call.op, "enqueue");
        self.submit(Command::Dispatch {
            call: call.clone(),
            kernel,
        })
    }

    fn synchronize(&self) -> BackendResult<()> {
        self.fence()?;
        let mut failures = std::mem::take(&mut *self.state.failures.lock()).into_iter();
        match failures.next() {
            Some((_, error)) => {
                for (pass, other) in failures {
                    warn!(backend = %self.name, %pass, error = %other, "dropping further deferred failure");
                }
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn synchronize_pass(&self, pass: PassId) -> BackendResult<()> {
        self.fence()?;
        match self.state.failures.lock().remove(&pass) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn is_idle(&self) -> bool {
        self.pending() == 0
    }
}

impl Drop for StreamBackend {
    fn drop(&mut self) {
        let _ = self.submit(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(backend = %self.name, "stream worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for StreamBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBackend")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}
