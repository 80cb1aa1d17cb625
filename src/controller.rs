use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::driver::SharedDriver;
use crate::error::{Error, Result};
use crate::memory::DmaAllocator;
use crate::qpair::QueuePair;
use crate::transport::ControllerOps;
use crate::trid::TransportId;

/// Options handed to the probe callback, which may adjust them before the
/// transport constructs the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerOpts {
    pub num_io_queues: u32,
    pub io_queue_size: u32,
    /// Request slots per I/O queue pair.
    pub io_queue_requests: u32,
    pub admin_queue_size: u16,
    pub keep_alive_timeout_ms: u32,
    pub hostnqn: String,
}

impl Default for ControllerOpts {
    fn default() -> Self {
        ControllerOpts {
            num_io_queues: 1024,
            io_queue_size: 256,
            io_queue_requests: 512,
            admin_queue_size: 32,
            keep_alive_timeout_ms: 10_000,
            hostnqn: String::new(),
        }
    }
}

/// An attached controller as seen from this process.
///
/// Membership and reference counts live in the shared controller table;
/// the transport object is process local.
pub struct Controller {
    trid: TransportId,
    opts: ControllerOpts,
    slot: usize,
    shared: Arc<SharedDriver>,
    ops: Mutex<Option<Box<dyn ControllerOps>>>,
    allocator: Arc<dyn DmaAllocator>,
    dma_align: usize,
    next_qpair_id: AtomicU16,
}

impl Controller {
    pub(crate) fn new(
        trid: TransportId,
        opts: ControllerOpts,
        slot: usize,
        shared: Arc<SharedDriver>,
        ops: Box<dyn ControllerOps>,
        allocator: Arc<dyn DmaAllocator>,
        dma_align: usize,
    ) -> Self {
        Controller {
            trid,
            opts,
            slot,
            shared,
            ops: Mutex::new(Some(ops)),
            allocator,
            dma_align,
            // qid 0 is the admin queue
            next_qpair_id: AtomicU16::new(1),
        }
    }

    pub fn trid(&self) -> &TransportId {
        &self.trid
    }

    pub fn opts(&self) -> &ControllerOpts {
        &self.opts
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn shared(&self) -> &Arc<SharedDriver> {
        &self.shared
    }

    fn lock_ops(&self) -> MutexGuard<'_, Option<Box<dyn ControllerOps>>> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Failed, hot-removed, or already released by this process.
    pub fn is_failed(&self) -> bool {
        self.shared.get().failed[self.slot].load(Ordering::Acquire) || self.lock_ops().is_none()
    }

    /// Mark the controller failed in every process. It stays attached;
    /// new submissions on its queue pairs are rejected.
    pub fn fail(&self, hot_remove: bool) {
        let was_failed = self.shared.get().failed[self.slot].swap(true, Ordering::AcqRel);
        if !was_failed {
            warn!(trid = %self.trid, hot_remove, "controller marked failed");
        }
        if let Some(ops) = self.lock_ops().as_mut() {
            ops.fail(hot_remove);
        }
    }

    /// Total references held across all processes.
    pub fn ref_count(&self) -> Result<u32> {
        let table = self.shared.lock_table()?;
        Ok(table.entries[self.slot].ref_count())
    }

    /// Allocate an I/O queue pair with `io_queue_requests` request slots.
    pub fn alloc_io_qpair(self: &Arc<Self>) -> Result<QueuePair> {
        if self.is_failed() {
            return Err(Error::ControllerFailed);
        }

        let num_requests = u16::try_from(self.opts.io_queue_requests)
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "io_queue_requests {} out of range",
                    self.opts.io_queue_requests
                ))
            })?;

        let id = self
            .next_qpair_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| {
                (u32::from(id) <= self.opts.num_io_queues && id != u16::MAX).then(|| id + 1)
            })
            .map_err(|_| Error::NoMemory("no free I/O queue ids".into()))?;

        let mut qpair = QueuePair::with_allocator(id, num_requests, Arc::clone(&self.allocator));
        qpair.attach_controller(Arc::downgrade(self), self.dma_align);
        debug!(trid = %self.trid, qid = id, num_requests, "allocated I/O queue pair");
        Ok(qpair)
    }

    pub(crate) fn take_ops(&self) -> Option<Box<dyn ControllerOps>> {
        self.lock_ops().take()
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("trid", &self.trid)
            .field("slot", &self.slot)
            .field("opts", &self.opts)
            .finish()
    }
}
