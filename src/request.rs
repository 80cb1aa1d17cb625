use std::fmt::{self, Display};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::FusedFuture;
use tokio::sync::oneshot;

use crate::cmd::DataTransfer;
use crate::error::{Error, Result};
use crate::memory::DmaBuffer;
use crate::queues::NvmeCompletion;

/// Completion handler; runs exactly once, after the hardware completion is
/// observed and before the request can be allocated again.
pub type CompletionFn = Box<dyn FnOnce(&NvmeCompletion) + Send>;

/// Caller-owned buffer for bounce-copied requests. The caller keeps a clone
/// and reads the data back once the completion handler has run.
pub type UserBuffer = Arc<Mutex<Vec<u8>>>;

pub type QueuePairId = u16;

/// Handle to a request slot within its queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    qpair: QueuePairId,
    slot: u16,
}

impl RequestId {
    pub(crate) fn new(qpair: QueuePairId, slot: u16) -> Self {
        Self { qpair, slot }
    }

    /// Command id used on the wire for this request.
    pub fn cid(&self) -> u16 {
        self.slot
    }

    pub fn qpair_id(&self) -> QueuePairId {
        self.qpair
    }

    pub(crate) fn index(&self) -> usize {
        self.slot as usize
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}.{}", self.qpair, self.slot)
    }
}

/// Scatter-gather payload iterator.
pub trait SgeSource: Send {
    /// Restart iteration `offset` bytes into the payload.
    fn reset(&mut self, offset: u32);
    /// Next `(address, length)` element, `None` once exhausted.
    fn next_sge(&mut self) -> Option<(u64, u32)>;
}

/// Data buffer descriptor of a request.
pub enum Payload {
    Contiguous { addr: *mut u8, len: usize },
    ScatterGather(Box<dyn SgeSource>),
}

impl Payload {
    pub fn null() -> Self {
        Payload::Contiguous {
            addr: std::ptr::null_mut(),
            len: 0,
        }
    }

    pub fn contig(addr: *mut u8, len: usize) -> Self {
        Payload::Contiguous { addr, len }
    }

    pub fn is_contiguous(&self) -> bool {
        matches!(self, Payload::Contiguous { .. })
    }

    /// Start address of a contiguous payload.
    pub fn addr(&self) -> Option<*mut u8> {
        match self {
            Payload::Contiguous { addr, .. } => Some(*addr),
            Payload::ScatterGather(_) => None,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Contiguous { addr, len } => f
                .debug_struct("Contiguous")
                .field("addr", addr)
                .field("len", len)
                .finish(),
            Payload::ScatterGather(_) => f.write_str("ScatterGather"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Free,
    Queued,
    Submitted,
}

impl Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "Free"),
            Self::Queued => write!(f, "Queued"),
            Self::Submitted => write!(f, "Submitted"),
        }
    }
}

/// Bounce-buffer bookkeeping for requests whose caller buffer is not used
/// for DMA directly.
pub(crate) struct UserCopy {
    pub(crate) buffer: UserBuffer,
    pub(crate) bounce: DmaBuffer,
    pub(crate) cb: Option<CompletionFn>,
    pub(crate) transfer: DataTransfer,
}

/// One outstanding command.
pub struct Request {
    pub(crate) qpair: QueuePairId,
    pub(crate) state: State,
    pub(crate) payload: Payload,
    pub(crate) payload_size: u32,
    pub(crate) cb: Option<CompletionFn>,
    pub(crate) pid: u32,
    pub(crate) opc: u8,
    pub(crate) user_copy: Option<UserCopy>,
    pub(crate) parent: Option<RequestId>,
    pub(crate) children: Vec<RequestId>,
    pub(crate) parent_status: NvmeCompletion,
}

// Payload addresses are device-visible memory handed over by the caller;
// the request itself never dereferences them outside the owning queue pair.
unsafe impl Send for Request {}

impl Request {
    pub(crate) fn empty(qpair: QueuePairId) -> Self {
        Self {
            qpair,
            state: State::Free,
            payload: Payload::null(),
            payload_size: 0,
            cb: None,
            pid: 0,
            opc: 0,
            user_copy: None,
            parent: None,
            children: Vec::new(),
            parent_status: NvmeCompletion::default(),
        }
    }

    /// Overwrite every field the allocator owns; the rest of a recycled
    /// request is never read before being set again.
    pub(crate) fn populate(
        &mut self,
        payload: Payload,
        payload_size: u32,
        cb: Option<CompletionFn>,
        pid: u32,
    ) {
        self.state = State::Queued;
        self.payload = payload;
        self.payload_size = payload_size;
        self.cb = cb;
        self.pid = pid;
        self.opc = 0;
        self.user_copy = None;
        self.parent = None;
        self.children.clear();
        self.parent_status = NvmeCompletion::default();
    }

    pub fn qpair_id(&self) -> QueuePairId {
        self.qpair
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_size(&self) -> u32 {
        self.payload_size
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn opc(&self) -> u8 {
        self.opc
    }

    /// Record the command opcode. For bounce-copied requests the opcode's
    /// transfer direction decides whether data is copied back on completion.
    pub fn set_opc(&mut self, opc: u8) {
        self.opc = opc;
        if let Some(copy) = self.user_copy.as_mut() {
            copy.transfer = DataTransfer::from_opcode(opc);
        }
    }

    pub fn has_callback(&self) -> bool {
        self.cb.is_some()
    }

    pub fn is_user_copy(&self) -> bool {
        self.user_copy.is_some()
    }

    /// Driver-owned bounce buffer, if this request copies through one.
    pub fn bounce_buffer(&self) -> Option<&[u8]> {
        self.user_copy.as_ref().map(|c| c.bounce.as_slice())
    }

    /// Mutable bounce buffer, as the device side would fill it.
    pub fn bounce_buffer_mut(&mut self) -> Option<&mut [u8]> {
        self.user_copy.as_mut().map(|c| c.bounce.as_mut_slice())
    }

    pub fn user_buffer(&self) -> Option<&UserBuffer> {
        self.user_copy.as_ref().map(|c| &c.buffer)
    }

    pub fn parent(&self) -> Option<RequestId> {
        self.parent
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("qpair", &self.qpair)
            .field("state", &self.state)
            .field("payload", &self.payload)
            .field("payload_size", &self.payload_size)
            .field("pid", &self.pid)
            .field("opc", &self.opc)
            .field("user_copy", &self.user_copy.is_some())
            .field("parent", &self.parent)
            .field("children", &self.children)
            .finish()
    }
}

#[derive(Debug)]
enum WaitState {
    Pending,
    Completed,
    Error,
}

/// Future side of a completion handler built by [`completion`].
#[derive(Debug)]
pub struct CompletionFuture {
    receiver: oneshot::Receiver<NvmeCompletion>,
    state: WaitState,
}

/// Build a completion handler and a future resolving to the completion it
/// receives.
pub fn completion() -> (CompletionFn, CompletionFuture) {
    let (sender, receiver) = oneshot::channel();
    let cb: CompletionFn = Box::new(move |cpl: &NvmeCompletion| {
        // receiver may have been dropped by a caller that stopped waiting
        let _ = sender.send(*cpl);
    });
    (
        cb,
        CompletionFuture {
            receiver,
            state: WaitState::Pending,
        },
    )
}

impl Future for CompletionFuture {
    type Output = Result<NvmeCompletion>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(cpl)) => {
                self.state = WaitState::Completed;
                Poll::Ready(Ok(cpl))
            }
            Poll::Ready(Err(_)) => {
                self.state = WaitState::Error;
                Poll::Ready(Err(Error::Io(std::io::Error::other(
                    "NVMe command completion channel closed unexpectedly.",
                ))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl FusedFuture for CompletionFuture {
    fn is_terminated(&self) -> bool {
        !matches!(self.state, WaitState::Pending)
    }
}
