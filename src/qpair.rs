//! I/O queue pair and its request pool.
//!
//! A queue pair owns a fixed arena of request slots. Every slot sits on
//! exactly one of two intrusive lists: `free` (available) or `queued`
//! (allocated, awaiting completion). Allocation pops the head of `free`,
//! completion or [`QueuePair::free`] moves the slot back, both in O(1).

use std::sync::{Arc, Weak};

use tracing::{debug, trace, warn};

use crate::cmd::DataTransfer;
use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::memory::{DmaAllocator, HeapAllocator, DEFAULT_DMA_ALIGN};
use crate::queues::{CompletionSource, NvmeCompletion};
use crate::request::{
    CompletionFn, Payload, QueuePairId, Request, RequestId, SgeSource, State, UserBuffer,
    UserCopy,
};

#[derive(Debug, Clone, Default)]
pub struct NvmeStats {
    pub completions: u64,
    pub submissions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    Free,
    Queued,
}

struct Slot {
    req: Request,
    list: List,
    prev: Option<u16>,
    next: Option<u16>,
}

#[derive(Debug, Default)]
struct IndexList {
    head: Option<u16>,
    tail: Option<u16>,
    len: usize,
}

pub struct QueuePair {
    id: QueuePairId,
    slots: Vec<Slot>,
    free: IndexList,
    queued: IndexList,
    allocator: Arc<dyn DmaAllocator>,
    dma_align: usize,
    ctrlr: Option<Weak<Controller>>,
    stats: NvmeStats,
}

impl QueuePair {
    /// Queue pair with `num_requests` slots and the default heap allocator.
    pub fn new(id: QueuePairId, num_requests: u16) -> Self {
        Self::with_allocator(id, num_requests, Arc::new(HeapAllocator::default()))
    }

    pub fn with_allocator(
        id: QueuePairId,
        num_requests: u16,
        allocator: Arc<dyn DmaAllocator>,
    ) -> Self {
        let mut qpair = Self {
            id,
            slots: Vec::with_capacity(num_requests as usize),
            free: IndexList::default(),
            queued: IndexList::default(),
            allocator,
            dma_align: DEFAULT_DMA_ALIGN,
            ctrlr: None,
            stats: NvmeStats::default(),
        };
        for i in 0..num_requests {
            qpair.slots.push(Slot {
                req: Request::empty(id),
                list: List::Free,
                prev: None,
                next: None,
            });
            qpair.push_back(List::Free, i);
        }
        qpair
    }

    pub(crate) fn attach_controller(&mut self, ctrlr: Weak<Controller>, dma_align: usize) {
        self.ctrlr = Some(ctrlr);
        self.dma_align = dma_align;
    }

    pub fn id(&self) -> QueuePairId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn num_free(&self) -> usize {
        self.free.len
    }

    pub fn num_queued(&self) -> usize {
        self.queued.len
    }

    pub fn stats(&self) -> &NvmeStats {
        &self.stats
    }

    /// Slot index of `id`, if it was handed out by this queue pair.
    fn slot_index(&self, id: RequestId) -> Option<usize> {
        (id.qpair_id() == self.id && id.index() < self.slots.len()).then(|| id.index())
    }

    pub fn request(&self, id: RequestId) -> Option<&Request> {
        let idx = self.slot_index(id)?;
        Some(&self.slots[idx].req)
    }

    pub fn request_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        let idx = self.slot_index(id)?;
        Some(&mut self.slots[idx].req)
    }

    /// Whether `id` is allocated from this queue pair and awaiting
    /// completion.
    pub fn is_outstanding(&self, id: RequestId) -> bool {
        self.slot_index(id)
            .is_some_and(|idx| self.slots[idx].list == List::Queued)
    }

    /// Take a request from the free list.
    ///
    /// `None` means the pool is exhausted; the caller should back off and
    /// retry after completions have been processed.
    pub fn allocate(
        &mut self,
        payload: Payload,
        payload_size: u32,
        cb: Option<CompletionFn>,
    ) -> Option<RequestId> {
        let Some(idx) = self.pop_front(List::Free) else {
            trace!(qpair = self.id, "request pool exhausted");
            return None;
        };

        self.slots[idx as usize]
            .req
            .populate(payload, payload_size, cb, std::process::id());
        self.push_back(List::Queued, idx);
        Some(RequestId::new(self.id, idx))
    }

    pub fn allocate_contig(
        &mut self,
        buffer: *mut u8,
        payload_size: u32,
        cb: Option<CompletionFn>,
    ) -> Option<RequestId> {
        self.allocate(
            Payload::contig(buffer, payload_size as usize),
            payload_size,
            cb,
        )
    }

    pub fn allocate_sgl(
        &mut self,
        sgl: Box<dyn SgeSource>,
        payload_size: u32,
        cb: Option<CompletionFn>,
    ) -> Option<RequestId> {
        self.allocate(Payload::ScatterGather(sgl), payload_size, cb)
    }

    pub fn allocate_null(&mut self, cb: Option<CompletionFn>) -> Option<RequestId> {
        self.allocate(Payload::null(), 0, cb)
    }

    /// Allocate a request that moves data through a driver-owned bounce
    /// buffer instead of `user_buffer`.
    ///
    /// With `host_to_controller` the first `payload_size` bytes of the user
    /// buffer are copied into the bounce buffer now; otherwise the bounce
    /// buffer is copied back into the user buffer on completion.
    pub fn allocate_user_copy(
        &mut self,
        user_buffer: Option<&UserBuffer>,
        payload_size: u32,
        cb: Option<CompletionFn>,
        host_to_controller: bool,
    ) -> Option<RequestId> {
        let user_buffer = user_buffer?;
        if payload_size == 0 {
            return None;
        }
        let size = payload_size as usize;

        let mut bounce = match self.allocator.zmalloc(size, self.dma_align) {
            Ok(buf) => buf,
            Err(e) => {
                debug!(qpair = self.id, size, "bounce buffer allocation failed: {}", e);
                return None;
            }
        };

        if host_to_controller {
            let user = user_buffer.lock().unwrap_or_else(|e| e.into_inner());
            if user.len() < size {
                return None;
            }
            bounce.as_mut_slice().copy_from_slice(&user[..size]);
        } else if user_buffer.lock().unwrap_or_else(|e| e.into_inner()).len() < size {
            return None;
        }

        let addr = bounce.as_mut_ptr();
        let id = self.allocate(Payload::contig(addr, size), payload_size, None)?;

        let transfer = if host_to_controller {
            DataTransfer::HostToController
        } else {
            DataTransfer::ControllerToHost
        };
        self.slots[id.index()].req.user_copy = Some(UserCopy {
            buffer: Arc::clone(user_buffer),
            bounce,
            cb,
            transfer,
        });
        Some(id)
    }

    /// Return a request to this queue pair's free list.
    ///
    /// Never fails. Payload fields are left as they are until the slot is
    /// allocated again.
    pub fn free(&mut self, id: RequestId) {
        let Some(idx) = self.slot_index(id) else {
            warn!(qpair = self.id, %id, "ignoring free of a request from another queue pair");
            return;
        };
        self.unlink_family(id);
        let list = self.slots[idx].list;
        self.unlink(list, idx as u16);
        self.slots[idx].req.state = State::Free;
        self.push_back(List::Free, idx as u16);
    }

    /// Cut `id` out of its parent's child list and orphan its own children,
    /// so no completion is forwarded through a recycled slot.
    fn unlink_family(&mut self, id: RequestId) {
        let req = &mut self.slots[id.index()].req;
        let parent = req.parent.take();
        let children = std::mem::take(&mut req.children);

        if let Some(parent) = parent {
            self.slots[parent.index()].req.children.retain(|&c| c != id);
        }
        for child in children {
            let child_req = &mut self.slots[child.index()].req;
            if child_req.parent == Some(id) {
                child_req.parent = None;
            }
        }
    }

    /// Link `child` under `parent`; the parent completes once every child
    /// has completed, with the first error any child reported.
    pub fn add_child(&mut self, parent: RequestId, child: RequestId) -> Result<()> {
        if parent == child || !self.is_outstanding(parent) || !self.is_outstanding(child) {
            return Err(Error::InvalidArgument(format!(
                "cannot link {} under {}",
                child, parent
            )));
        }
        if self.slots[child.index()].req.parent.is_some() {
            return Err(Error::InvalidArgument(format!("{} already has a parent", child)));
        }

        let parent_req = &mut self.slots[parent.index()].req;
        if parent_req.children.is_empty() {
            parent_req.parent_status = NvmeCompletion::success(parent.cid());
        }
        parent_req.children.push(child);
        self.slots[child.index()].req.parent = Some(parent);
        Ok(())
    }

    /// Hand a request to the transport. Rejected (and the request freed)
    /// when the owning controller has failed.
    pub fn submit(&mut self, id: RequestId) -> Result<u16> {
        if !self.is_outstanding(id) {
            return Err(Error::InvalidArgument(format!("{} is not allocated", id)));
        }
        if self.controller_failed() {
            self.free(id);
            return Err(Error::ControllerFailed);
        }
        self.slots[id.index()].req.state = State::Submitted;
        self.stats.submissions += 1;
        Ok(id.cid())
    }

    fn controller_failed(&self) -> bool {
        match &self.ctrlr {
            None => false,
            Some(weak) => weak.upgrade().map_or(true, |c| c.is_failed()),
        }
    }

    /// Deliver a completion: runs the handler exactly once and returns the
    /// slot to the free list.
    pub fn complete(&mut self, id: RequestId, cpl: &NvmeCompletion) -> Result<()> {
        if !self.is_outstanding(id) {
            return Err(Error::InvalidArgument(format!("{} is not outstanding", id)));
        }

        let current = std::process::id();
        let owner = self.slots[id.index()].req.pid;
        if owner != current {
            warn!(qpair = self.id, %id, owner, current, "completion for foreign request");
            return Err(Error::ForeignRequest { owner, current });
        }

        if self.slots[id.index()].req.user_copy.is_some() {
            return self.complete_user_copy(id, cpl);
        }

        let req = &mut self.slots[id.index()].req;
        let parent = req.parent.take();
        if let Some(cb) = req.cb.take() {
            cb(cpl);
        }
        self.stats.completions += 1;
        self.free(id);

        if let Some(parent) = parent {
            self.child_complete(parent, id, cpl);
        }
        Ok(())
    }

    /// Completion path of bounce-copied requests: copies device data back
    /// into the caller's buffer when the command read from the device, runs
    /// the caller's handler and releases the bounce buffer.
    pub fn complete_user_copy(&mut self, id: RequestId, cpl: &NvmeCompletion) -> Result<()> {
        if !self.is_outstanding(id) {
            return Err(Error::InvalidArgument(format!("{} is not outstanding", id)));
        }

        let req = &mut self.slots[id.index()].req;
        let size = req.payload_size as usize;
        let parent = req.parent.take();

        if let Some(copy) = req.user_copy.take() {
            if copy.transfer.reads_from_device() {
                let mut user = copy.buffer.lock().unwrap_or_else(|e| e.into_inner());
                let n = size.min(user.len()).min(copy.bounce.len());
                user[..n].copy_from_slice(&copy.bounce.as_slice()[..n]);
            }
            // the payload still points into the bounce buffer
            req.payload = Payload::null();
            if let Some(cb) = copy.cb {
                cb(cpl);
            }
        } else if let Some(cb) = req.cb.take() {
            cb(cpl);
        }

        self.stats.completions += 1;
        self.free(id);

        if let Some(parent) = parent {
            self.child_complete(parent, id, cpl);
        }
        Ok(())
    }

    fn child_complete(&mut self, parent: RequestId, child: RequestId, cpl: &NvmeCompletion) {
        if !self.is_outstanding(parent)
            || !self.slots[parent.index()].req.children.contains(&child)
        {
            debug!(qpair = self.id, %parent, %child, "parent gone, child completion not forwarded");
            return;
        }

        let req = &mut self.slots[parent.index()].req;
        req.children.retain(|&c| c != child);
        if cpl.is_error() && !req.parent_status.is_error() {
            req.parent_status = *cpl;
            req.parent_status.c_id = parent.cid();
        }
        if req.children.is_empty() {
            let status = req.parent_status;
            if let Err(e) = self.complete(parent, &status) {
                warn!(qpair = self.id, %parent, "parent completion failed: {}", e);
            }
        }
    }

    /// Reap up to `max` completions (0 for no limit) and complete their
    /// requests. Returns the number of completions consumed.
    pub fn process_completions(
        &mut self,
        source: &mut impl CompletionSource,
        max: usize,
    ) -> usize {
        let mut n = 0;
        while max == 0 || n < max {
            let Some(cpl) = source.reap() else {
                break;
            };
            n += 1;

            let id = RequestId::new(self.id, cpl.c_id);
            if let Err(e) = self.complete(id, &cpl) {
                warn!(qpair = self.id, cid = cpl.c_id, "dropping completion: {}", e);
            }
        }
        n
    }

    fn list(&mut self, list: List) -> &mut IndexList {
        match list {
            List::Free => &mut self.free,
            List::Queued => &mut self.queued,
        }
    }

    fn push_back(&mut self, list: List, idx: u16) {
        let tail = self.list(list).tail;
        {
            let slot = &mut self.slots[idx as usize];
            slot.list = list;
            slot.prev = tail;
            slot.next = None;
        }
        match tail {
            Some(t) => self.slots[t as usize].next = Some(idx),
            None => self.list(list).head = Some(idx),
        }
        let l = self.list(list);
        l.tail = Some(idx);
        l.len += 1;
    }

    fn pop_front(&mut self, list: List) -> Option<u16> {
        let head = self.list(list).head?;
        self.unlink(list, head);
        Some(head)
    }

    fn unlink(&mut self, list: List, idx: u16) {
        let (prev, next) = {
            let slot = &self.slots[idx as usize];
            debug_assert_eq!(slot.list, list);
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.list(list).head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].prev = prev,
            None => self.list(list).tail = prev,
        }
        let slot = &mut self.slots[idx as usize];
        slot.prev = None;
        slot.next = None;
        self.list(list).len -= 1;
    }
}

impl std::fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePair")
            .field("id", &self.id)
            .field("capacity", &self.slots.len())
            .field("free", &self.free.len)
            .field("queued", &self.queued.len)
            .field("stats", &self.stats)
            .finish()
    }
}
