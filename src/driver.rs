//! Process-shared driver state and the controller attach/detach protocol.
//!
//! The driver singleton ([`DriverShared`]) sits at the start of a named
//! shared-memory region. The primary process creates and initializes it;
//! secondaries map it, wait for `initialized` and then share the attached
//! controller table. All table mutation happens under a robust
//! process-shared lock. Lock order: shared table lock, then the
//! process-local `attached` list.

use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::DriverConfig;
use crate::controller::{Controller, ControllerOpts};
use crate::error::{Error, Result};
use crate::memory::{DmaAllocator, HeapAllocator};
use crate::mutex::{RobustGuard, RobustMutex};
use crate::shm::{Environment, PosixEnv, SharedRegion};
use crate::transport::{ControllerOps, DeviceHandle, Transport};
use crate::trid::{
    AddressFamily, TransportId, TransportType, NQN_MAX_LEN, TRADDR_MAX_LEN, TRSVCID_MAX_LEN,
};

pub const DRIVER_MAGIC: u64 = u64::from_le_bytes(*b"NVMEHOST");
/// Controllers the shared table can hold.
pub const MAX_CONTROLLERS: usize = 64;
/// Processes that can hold references on one controller.
pub const MAX_PROCESSES: usize = 32;

const INIT_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// Longest a primary waits for a region's creator to stamp its pid before
/// treating the region as abandoned.
const STALE_OWNER_GRACE: Duration = Duration::from_secs(1);

/// Fixed-size transport id as stored in shared memory.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawTransportId {
    trtype: u32,
    /// 0 when absent
    adrfam: u32,
    traddr: [u8; TRADDR_MAX_LEN + 1],
    trsvcid: [u8; TRSVCID_MAX_LEN + 1],
    subnqn: [u8; NQN_MAX_LEN + 1],
}

impl RawTransportId {
    fn to_trid(&self) -> Option<TransportId> {
        let trtype = TransportType::from_raw(self.trtype)?;
        let adrfam = match self.adrfam {
            0 => None,
            raw => Some(AddressFamily::from_raw(raw)?),
        };
        Some(TransportId::from_parts(
            trtype,
            adrfam,
            c_str(&self.traddr),
            c_str(&self.trsvcid),
            c_str(&self.subnqn),
        ))
    }
}

impl From<&TransportId> for RawTransportId {
    fn from(trid: &TransportId) -> Self {
        let mut raw = RawTransportId {
            trtype: trid.trtype() as u32,
            adrfam: trid.adrfam().map_or(0, |a| a as u32),
            traddr: [0; TRADDR_MAX_LEN + 1],
            trsvcid: [0; TRSVCID_MAX_LEN + 1],
            subnqn: [0; NQN_MAX_LEN + 1],
        };
        copy_str(&mut raw.traddr, trid.traddr());
        copy_str(&mut raw.trsvcid, trid.trsvcid());
        copy_str(&mut raw.subnqn, trid.subnqn());
        raw
    }
}

// Lengths are validated when the TransportId is built; the last byte
// always stays NUL.
fn copy_str(dst: &mut [u8], src: &str) {
    let n = src.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
}

fn c_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(crate) struct ProcessRef {
    pid: u32,
    refs: u32,
}

/// One row of the attached controller table.
#[repr(C)]
pub(crate) struct ControllerEntry {
    in_use: bool,
    trid: RawTransportId,
    procs: [ProcessRef; MAX_PROCESSES],
}

impl ControllerEntry {
    pub(crate) fn ref_count(&self) -> u32 {
        self.procs.iter().map(|p| p.refs).sum()
    }

    pub(crate) fn proc_refs(&self, pid: u32) -> u32 {
        self.procs
            .iter()
            .find(|p| p.refs > 0 && p.pid == pid)
            .map_or(0, |p| p.refs)
    }

    fn get_ref(&mut self, pid: u32) -> Result<()> {
        if let Some(p) = self.procs.iter_mut().find(|p| p.refs > 0 && p.pid == pid) {
            p.refs += 1;
            return Ok(());
        }
        match self.procs.iter_mut().find(|p| p.refs == 0) {
            Some(p) => {
                *p = ProcessRef { pid, refs: 1 };
                Ok(())
            }
            None => Err(Error::NoMemory(format!(
                "more than {} processes attached to one controller",
                MAX_PROCESSES
            ))),
        }
    }

    fn put_ref(&mut self, pid: u32) -> Result<()> {
        let p = self
            .procs
            .iter_mut()
            .find(|p| p.refs > 0 && p.pid == pid)
            .ok_or(Error::NotAttached)?;
        p.refs -= 1;
        if p.refs == 0 {
            p.pid = 0;
        }
        Ok(())
    }

    /// Drop the references of processes that no longer exist.
    fn prune_dead(&mut self) -> usize {
        let mut pruned = 0;
        for p in self.procs.iter_mut().filter(|p| p.refs > 0) {
            if !process_alive(p.pid) {
                warn!(pid = p.pid, refs = p.refs, "dropping references of dead process");
                *p = ProcessRef::default();
                pruned += 1;
            }
        }
        pruned
    }

    fn clear(&mut self) {
        self.in_use = false;
        self.trid.trtype = 0;
        self.trid.adrfam = 0;
        self.trid.traddr.fill(0);
        self.trid.trsvcid.fill(0);
        self.trid.subnqn.fill(0);
        self.procs = [ProcessRef::default(); MAX_PROCESSES];
    }
}

fn already_exists(e: &Error) -> bool {
    matches!(e, Error::Io(io) if io.raw_os_error() == Some(libc::EEXIST))
}

fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[repr(C)]
pub(crate) struct AttachedTable {
    pub(crate) entries: [ControllerEntry; MAX_CONTROLLERS],
}

impl AttachedTable {
    fn find(&self, trid: &RawTransportId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.in_use && e.trid == *trid)
    }

    fn claim(&mut self, trid: RawTransportId) -> Option<usize> {
        let slot = self.entries.iter().position(|e| !e.in_use)?;
        let entry = &mut self.entries[slot];
        entry.clear();
        entry.in_use = true;
        entry.trid = trid;
        Some(slot)
    }

    fn clear(&mut self) {
        self.entries.iter_mut().for_each(ControllerEntry::clear);
    }

    /// Prune dead processes everywhere; entries left without references
    /// are released. Returns the number of references dropped.
    fn prune_dead(&mut self) -> usize {
        let mut pruned = 0;
        for entry in self.entries.iter_mut().filter(|e| e.in_use) {
            pruned += entry.prune_dead();
            if entry.ref_count() == 0 {
                warn!(
                    trid = ?entry.trid.to_trid(),
                    "releasing controller entry orphaned by dead processes"
                );
                entry.clear();
            }
        }
        pruned
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.in_use).count()
    }

    /// Some process other than `pid` holding a reference.
    fn foreign_holder(&self, pid: u32) -> Option<u32> {
        self.entries
            .iter()
            .filter(|e| e.in_use)
            .flat_map(|e| e.procs.iter())
            .find(|p| p.refs > 0 && p.pid != pid)
            .map(|p| p.pid)
    }
}

/// Layout of the shared driver region. All-zero bytes are a valid
/// (uninitialized) value.
#[repr(C)]
pub(crate) struct DriverShared {
    magic: AtomicU64,
    layout_size: AtomicU64,
    /// pid of the primary that created the region; 0 while it is being set up
    owner_pid: AtomicU32,
    initialized: AtomicBool,
    pub(crate) failed: [AtomicBool; MAX_CONTROLLERS],
    lock: RobustMutex<AttachedTable>,
}

/// This process's mapping of [`DriverShared`].
pub(crate) struct SharedDriver {
    region: SharedRegion,
}

impl SharedDriver {
    fn new(region: SharedRegion) -> Self {
        SharedDriver { region }
    }

    pub(crate) fn get(&self) -> &DriverShared {
        // the region is page aligned and at least size_of::<DriverShared>()
        unsafe { &*(self.region.as_ptr() as *const DriverShared) }
    }

    /// Take the table lock, pruning dead processes if the previous owner
    /// died holding it.
    pub(crate) fn lock_table(&self) -> Result<RobustGuard<'_, AttachedTable>> {
        let mut table = self.get().lock.lock()?;
        if table.recovered() {
            let pruned = table.prune_dead();
            warn!(pruned, "recovered driver lock");
        }
        Ok(table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Uninitialized,
    PrimaryInitializing,
    PrimaryReady,
    SecondaryAttaching,
    SecondaryReady,
    /// Last initialize failed; the next call starts over.
    Failed,
}

impl DriverState {
    pub fn is_ready(&self) -> bool {
        matches!(self, DriverState::PrimaryReady | DriverState::SecondaryReady)
    }
}

/// Result of probing a single transport id.
#[derive(Debug)]
pub enum ProbeOutcome {
    /// The probe callback rejected the controller.
    Declined,
    Attached(Arc<Controller>),
}

struct Inner {
    state: DriverState,
    shared: Option<Arc<SharedDriver>>,
}

pub struct Driver {
    config: DriverConfig,
    env: Arc<dyn Environment>,
    allocator: Arc<dyn DmaAllocator>,
    transports: Mutex<Vec<Arc<dyn Transport>>>,
    inner: Mutex<Inner>,
    attached: Mutex<Vec<Arc<Controller>>>,
    pid: u32,
}

impl Driver {
    pub fn new(config: DriverConfig, env: Arc<dyn Environment>) -> Result<Self> {
        config.validate()?;
        let allocator = Arc::new(HeapAllocator::new(config.max_dma_alloc));
        Ok(Driver {
            config,
            env,
            allocator,
            transports: Mutex::new(Vec::new()),
            inner: Mutex::new(Inner {
                state: DriverState::Uninitialized,
                shared: None,
            }),
            attached: Mutex::new(Vec::new()),
            pid: std::process::id(),
        })
    }

    /// Driver on POSIX shared memory, with the role taken from the config.
    pub fn from_config(config: DriverConfig) -> Result<Self> {
        let env = PosixEnv::with_role(config.process_role, &config.shm_name)?;
        Self::new(config, Arc::new(env))
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn is_primary(&self) -> bool {
        self.env.is_primary()
    }

    pub fn state(&self) -> DriverState {
        self.lock_inner().state
    }

    /// Register `transport`, replacing any earlier one for the same type.
    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        let mut transports = self.transports.lock().unwrap_or_else(PoisonError::into_inner);
        transports.retain(|t| t.trtype() != transport.trtype());
        debug!(trtype = %transport.trtype(), "registered transport");
        transports.push(transport);
    }

    fn transport(&self, trtype: TransportType) -> Result<Arc<dyn Transport>> {
        self.transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|t| t.trtype() == trtype)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no transport registered for {}", trtype)))
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_attached(&self) -> MutexGuard<'_, Vec<Arc<Controller>>> {
        self.attached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create (primary) or attach to (secondary) the shared driver state.
    ///
    /// A no-op once ready. On failure the state becomes
    /// [`DriverState::Failed`] and a later call tries again.
    #[tracing::instrument(skip(self), fields(shm = %self.config.shm_name))]
    pub fn initialize(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.state.is_ready() {
            return Ok(());
        }

        let primary = self.env.is_primary();
        inner.state = if primary {
            DriverState::PrimaryInitializing
        } else {
            DriverState::SecondaryAttaching
        };

        let result = if primary {
            self.init_primary()
        } else {
            self.init_secondary()
        };

        match result {
            Ok(shared) => {
                inner.shared = Some(Arc::new(shared));
                inner.state = if primary {
                    DriverState::PrimaryReady
                } else {
                    DriverState::SecondaryReady
                };
                info!(primary, "driver initialized");
                Ok(())
            }
            Err(e) => {
                inner.state = DriverState::Failed;
                error!("driver initialization failed: {}", e);
                Err(e)
            }
        }
    }

    fn init_primary(&self) -> Result<SharedDriver> {
        let name = &self.config.shm_name;
        let size = size_of::<DriverShared>();
        let setup_err = |e: Error| Error::Setup(format!("cannot reserve '{}': {}", name, e));

        let region = match self.env.reserve(name, size) {
            Ok(region) => region,
            Err(e) if already_exists(&e) && self.reclaim_abandoned(name, size)? => {
                self.env.reserve(name, size).map_err(setup_err)?
            }
            Err(e) => return Err(setup_err(e)),
        };
        let shared = SharedDriver::new(region);
        shared.get().owner_pid.store(self.pid, Ordering::Release);

        if let Err(e) = Self::setup_shared(&shared, self.env.as_ref(), size) {
            drop(shared);
            if let Err(fe) = self.env.free(name) {
                warn!("failed to release '{}' after setup error: {}", name, fe);
            }
            return Err(e);
        }
        Ok(shared)
    }

    fn setup_shared(shared: &SharedDriver, env: &dyn Environment, size: usize) -> Result<()> {
        let state = shared.get();
        state.lock.init_shared_with(env.mutex_primitives())?;

        let mut table = state.lock.lock()?;
        state.initialized.store(false, Ordering::Release);
        table.clear();
        for failed in &state.failed {
            failed.store(false, Ordering::Relaxed);
        }
        state.magic.store(DRIVER_MAGIC, Ordering::Relaxed);
        state.layout_size.store(size as u64, Ordering::Relaxed);
        state.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Remove a region left behind by a primary that is no longer running.
    /// Returns false if its owner is alive.
    fn reclaim_abandoned(&self, name: &str, size: usize) -> Result<bool> {
        let deadline = Instant::now() + self.config.init_timeout().min(STALE_OWNER_GRACE);
        loop {
            let owner = match self.env.lookup(name, size) {
                Ok(None) => return Ok(true),
                Ok(Some(region)) => SharedDriver::new(region)
                    .get()
                    .owner_pid
                    .load(Ordering::Acquire),
                Err(Error::NotReady(_)) => 0,
                Err(e) => return Err(e),
            };
            if owner != 0 {
                if process_alive(owner) {
                    return Ok(false);
                }
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(INIT_POLL_INTERVAL);
        }

        warn!(name, "removing shared driver state abandoned by a dead primary");
        self.env.free(name)?;
        Ok(true)
    }

    fn init_secondary(&self) -> Result<SharedDriver> {
        let name = &self.config.shm_name;
        let size = size_of::<DriverShared>();
        let deadline = Instant::now() + self.config.init_timeout();
        let not_ready = || {
            Error::NotReady(format!(
                "primary did not finish initializing '{}' within {:?}",
                name,
                self.config.init_timeout()
            ))
        };

        // the primary may still be sizing the region
        let region = loop {
            match self.env.lookup(name, size) {
                Ok(Some(region)) => break region,
                Ok(None) => {
                    return Err(Error::NotFound(format!(
                        "shared driver state '{}' does not exist",
                        name
                    )))
                }
                Err(Error::NotReady(_)) if Instant::now() < deadline => {
                    std::thread::sleep(INIT_POLL_INTERVAL)
                }
                Err(Error::NotReady(_)) => return Err(not_ready()),
                Err(e) => return Err(e),
            }
        };
        let shared = SharedDriver::new(region);
        let state = shared.get();

        while !state.initialized.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                return Err(not_ready());
            }
            std::thread::sleep(INIT_POLL_INTERVAL);
        }

        let magic = state.magic.load(Ordering::Relaxed);
        let layout_size = state.layout_size.load(Ordering::Relaxed);
        if magic != DRIVER_MAGIC || layout_size != size as u64 {
            return Err(Error::AbiMismatch(format!(
                "magic {:#x} size {} (expected {:#x} size {})",
                magic, layout_size, DRIVER_MAGIC, size
            )));
        }

        // confirm under the lock
        drop(shared.lock_table()?);
        Ok(shared)
    }

    fn ready_shared(&self) -> Result<Arc<SharedDriver>> {
        self.initialize()?;
        self.lock_inner()
            .shared
            .clone()
            .ok_or_else(|| Error::NotReady("driver not initialized".into()))
    }

    /// Probe one controller.
    ///
    /// `probe_cb` sees the transport id and default options and may change
    /// the options; returning false declines the controller. A controller
    /// already attached by this process just gains a reference.
    pub fn ctrlr_probe<F>(
        &self,
        trid: &TransportId,
        devhandle: Option<&DeviceHandle>,
        mut probe_cb: F,
    ) -> Result<ProbeOutcome>
    where
        F: FnMut(&TransportId, &mut ControllerOpts) -> bool,
    {
        let shared = self.ready_shared()?;

        let mut opts = ControllerOpts::default();
        if !probe_cb(trid, &mut opts) {
            debug!(%trid, "probe declined");
            return Ok(ProbeOutcome::Declined);
        }

        {
            let mut table = shared.lock_table()?;
            let attached = self.lock_attached();
            if let Some(ctrlr) = attached.iter().find(|c| c.trid() == trid) {
                table.entries[ctrlr.slot()].get_ref(self.pid)?;
                debug!(%trid, "controller already attached, took reference");
                return Ok(ProbeOutcome::Attached(Arc::clone(ctrlr)));
            }
        }

        let transport = self.transport(trid.trtype())?;
        let mut ops = transport
            .ctrlr_construct(trid, &opts, devhandle)
            .ok_or_else(|| Error::ConstructFailed(trid.clone()))?;
        if let Err(e) = ops.start() {
            ops.destruct();
            return Err(e);
        }

        let raw = RawTransportId::from(trid);
        let mut table = match shared.lock_table() {
            Ok(table) => table,
            Err(e) => {
                ops.destruct();
                return Err(e);
            }
        };

        let (slot, joined) = match table.find(&raw) {
            Some(slot) => (slot, true),
            None => match table.claim(raw) {
                Some(slot) => {
                    shared.get().failed[slot].store(false, Ordering::Release);
                    (slot, false)
                }
                None => {
                    drop(table);
                    ops.destruct();
                    return Err(Error::NoMemory(format!(
                        "controller table full ({} entries)",
                        MAX_CONTROLLERS
                    )));
                }
            },
        };

        if let Err(e) = table.entries[slot].get_ref(self.pid) {
            // someone else still owns the device when we joined
            if !joined {
                table.entries[slot].clear();
            }
            drop(table);
            Self::release_ops(ops, !joined);
            return Err(e);
        }

        let ctrlr = Arc::new(Controller::new(
            trid.clone(),
            opts,
            slot,
            Arc::clone(&shared),
            ops,
            Arc::clone(&self.allocator),
            self.config.dma_align,
        ));
        self.lock_attached().push(Arc::clone(&ctrlr));
        drop(table);

        info!(%trid, slot, joined, "controller attached");
        Ok(ProbeOutcome::Attached(ctrlr))
    }

    fn release_ops(mut ops: Box<dyn ControllerOps>, destruct: bool) {
        if destruct {
            ops.destruct();
        }
    }

    /// Enumerate the controllers behind `trid` (all local PCIe devices if
    /// `None`) and probe each. `attach_cb` runs for every attached
    /// controller.
    ///
    /// Succeeds with an empty list when every candidate was declined; fails
    /// only if some candidate failed and none attached.
    #[tracing::instrument(skip_all)]
    pub fn probe<P, A>(
        &self,
        trid: Option<&TransportId>,
        mut probe_cb: P,
        mut attach_cb: A,
    ) -> Result<Vec<Arc<Controller>>>
    where
        P: FnMut(&TransportId, &mut ControllerOpts) -> bool,
        A: FnMut(&TransportId, &Arc<Controller>),
    {
        self.initialize()?;

        let default_trid = TransportId::default();
        let trid = trid.unwrap_or(&default_trid);
        let candidates = self.transport(trid.trtype())?.scan(trid)?;
        debug!(%trid, candidates = candidates.len(), "scanned transport");

        let mut attached = Vec::new();
        let mut last_err = None;
        for cand in &candidates {
            match self.ctrlr_probe(&cand.trid, cand.devhandle.as_ref(), &mut probe_cb) {
                Ok(ProbeOutcome::Attached(ctrlr)) => {
                    attach_cb(&cand.trid, &ctrlr);
                    attached.push(ctrlr);
                }
                Ok(ProbeOutcome::Declined) => {}
                Err(e) => {
                    warn!(trid = %cand.trid, "probe failed: {}", e);
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) if attached.is_empty() => Err(e),
            _ => Ok(attached),
        }
    }

    /// Drop this process's reference on `ctrlr`. The transport's destruct
    /// routine runs when the last reference in any process goes away.
    pub fn detach(&self, ctrlr: &Arc<Controller>) -> Result<()> {
        let shared = ctrlr.shared();
        let slot = ctrlr.slot();

        let mut table = shared.lock_table()?;
        let entry = &mut table.entries[slot];
        entry.put_ref(self.pid)?;
        let total = entry.ref_count();
        let mine = entry.proc_refs(self.pid);

        if mine == 0 {
            self.lock_attached().retain(|c| !Arc::ptr_eq(c, ctrlr));
        }

        if total == 0 {
            entry.clear();
            shared.get().failed[slot].store(false, Ordering::Release);
            if let Some(mut ops) = ctrlr.take_ops() {
                ops.destruct();
            }
            info!(trid = %ctrlr.trid(), "controller destructed");
        } else if mine == 0 {
            drop(ctrlr.take_ops());
            debug!(trid = %ctrlr.trid(), total, "released process reference");
        }
        Ok(())
    }

    /// Controllers attached by this process.
    pub fn attached_count(&self) -> usize {
        self.lock_attached().len()
    }

    pub fn attached_controllers(&self) -> Vec<Arc<Controller>> {
        self.lock_attached().clone()
    }

    /// Controllers attached by any process.
    pub fn shared_controller_count(&self) -> Result<usize> {
        let shared = self.ready_shared()?;
        let table = shared.lock_table()?;
        Ok(table.len())
    }

    /// Drop the references of processes that exited without detaching.
    pub fn reap_dead_processes(&self) -> Result<usize> {
        let shared = self.ready_shared()?;
        let mut table = shared.lock_table()?;
        Ok(table.prune_dead())
    }

    /// Detach everything this process holds and unmap the shared state.
    ///
    /// The primary also removes the region, and refuses with
    /// [`Error::Busy`] while other live processes hold controller
    /// references. Secondaries that attached no controller are not tracked.
    pub fn teardown(&self) -> Result<()> {
        let shared = self.lock_inner().shared.clone();
        if let Some(shared) = shared.filter(|_| self.env.is_primary()) {
            let mut table = shared.lock_table()?;
            table.prune_dead();
            if let Some(pid) = table.foreign_holder(self.pid) {
                return Err(Error::Busy(format!(
                    "pid {} still holds controller references",
                    pid
                )));
            }
        }

        for ctrlr in self.attached_controllers() {
            while ctrlr.shared().lock_table()?.entries[ctrlr.slot()].proc_refs(self.pid) > 0 {
                self.detach(&ctrlr)?;
            }
        }

        let mut inner = self.lock_inner();
        inner.shared = None;
        inner.state = DriverState::Uninitialized;
        if self.env.is_primary() {
            self.env.free(&self.config.shm_name)?;
        }
        info!(shm = %self.config.shm_name, "driver torn down");
        Ok(())
    }
}
