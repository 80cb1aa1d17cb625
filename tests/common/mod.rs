#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nvme_host::error::{Error, Result};
use nvme_host::mutex::MutexPrimitives;
use nvme_host::shm::{Environment, PosixEnv, SharedRegion};
use nvme_host::{
    ControllerOps, ControllerOpts, DeviceHandle, Driver, DriverConfig, ProbeCandidate, ProcessRole,
    Transport, TransportId, TransportType,
};

pub fn shm_name(tag: &str) -> String {
    format!("nvme_host_it_{}_{}", std::process::id(), tag)
}

pub fn config(tag: &str, role: ProcessRole) -> DriverConfig {
    DriverConfig {
        shm_name: shm_name(tag),
        process_role: role,
        init_timeout_ms: 0,
        ..Default::default()
    }
}

pub fn primary(tag: &str) -> Driver {
    Driver::new(config(tag, ProcessRole::Primary), Arc::new(PosixEnv::new(true))).unwrap()
}

pub fn secondary(tag: &str) -> Driver {
    Driver::new(
        config(tag, ProcessRole::Secondary),
        Arc::new(PosixEnv::new(false)),
    )
    .unwrap()
}

pub fn with_timeout(mut config: DriverConfig, timeout: Duration) -> DriverConfig {
    config.init_timeout_ms = timeout.as_millis() as u64;
    config
}

#[derive(Default)]
pub struct Counters {
    pub constructed: AtomicUsize,
    pub started: AtomicUsize,
    pub failed: AtomicUsize,
    pub destructed: AtomicUsize,
}

impl Counters {
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn destructed(&self) -> usize {
        self.destructed.load(Ordering::SeqCst)
    }
}

/// PCIe transport whose controllers only count lifecycle calls.
pub struct MockTransport {
    pub counters: Arc<Counters>,
    pub candidates: Vec<TransportId>,
    pub fail_construct: AtomicBool,
    pub fail_start: AtomicBool,
    pub last_opts: Mutex<Option<ControllerOpts>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Self::with_candidates(Vec::new())
    }

    pub fn with_candidates(candidates: Vec<TransportId>) -> Arc<Self> {
        Arc::new(MockTransport {
            counters: Arc::new(Counters::default()),
            candidates,
            fail_construct: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            last_opts: Mutex::new(None),
        })
    }
}

impl Transport for MockTransport {
    fn trtype(&self) -> TransportType {
        TransportType::Pcie
    }

    fn scan(&self, trid: &TransportId) -> Result<Vec<ProbeCandidate>> {
        if trid.traddr().is_empty() {
            Ok(self
                .candidates
                .iter()
                .map(|t| ProbeCandidate::with_devhandle(t.clone(), DeviceHandle::new(t.traddr().to_string())))
                .collect())
        } else {
            Ok(vec![ProbeCandidate::new(trid.clone())])
        }
    }

    fn ctrlr_construct(
        &self,
        _trid: &TransportId,
        opts: &ControllerOpts,
        _devhandle: Option<&DeviceHandle>,
    ) -> Option<Box<dyn ControllerOps>> {
        *self.last_opts.lock().unwrap() = Some(opts.clone());
        if self.fail_construct.load(Ordering::SeqCst) {
            return None;
        }
        self.counters.constructed.fetch_add(1, Ordering::SeqCst);
        Some(Box::new(MockController {
            counters: Arc::clone(&self.counters),
            fail_start: self.fail_start.load(Ordering::SeqCst),
        }))
    }
}

struct MockController {
    counters: Arc<Counters>,
    fail_start: bool,
}

impl ControllerOps for MockController {
    fn start(&mut self) -> Result<()> {
        self.counters.started.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(Error::NotReady("controller did not become ready".into()));
        }
        Ok(())
    }

    fn fail(&mut self, _hot_remove: bool) {
        self.counters.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn destruct(&mut self) {
        self.counters.destructed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Primary environment that counts region reservations.
pub struct CountingEnv {
    inner: PosixEnv,
    pub reserves: AtomicUsize,
}

impl CountingEnv {
    pub fn new() -> Self {
        CountingEnv {
            inner: PosixEnv::new(true),
            reserves: AtomicUsize::new(0),
        }
    }
}

impl Environment for CountingEnv {
    fn is_primary(&self) -> bool {
        true
    }

    fn reserve(&self, name: &str, size: usize) -> Result<SharedRegion> {
        self.reserves.fetch_add(1, Ordering::SeqCst);
        self.inner.reserve(name, size)
    }

    fn lookup(&self, name: &str, size: usize) -> Result<Option<SharedRegion>> {
        self.inner.lookup(name, size)
    }

    fn free(&self, name: &str) -> Result<()> {
        self.inner.free(name)
    }
}

/// Primary environment with no shared memory available.
pub struct NoMemoryEnv;

impl Environment for NoMemoryEnv {
    fn is_primary(&self) -> bool {
        true
    }

    fn reserve(&self, name: &str, _size: usize) -> Result<SharedRegion> {
        Err(Error::NoMemory(format!("cannot reserve {}", name)))
    }

    fn lookup(&self, _name: &str, _size: usize) -> Result<Option<SharedRegion>> {
        Ok(None)
    }

    fn free(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

struct FailingMutexInit;

impl MutexPrimitives for FailingMutexInit {
    fn mutex_init(
        &self,
        _mutex: *mut libc::pthread_mutex_t,
        _attr: *const libc::pthread_mutexattr_t,
    ) -> i32 {
        -1
    }
}

/// Primary environment whose robust lock cannot be initialized.
pub struct LockFailEnv {
    inner: PosixEnv,
}

impl LockFailEnv {
    pub fn new() -> Self {
        LockFailEnv {
            inner: PosixEnv::new(true),
        }
    }
}

impl Environment for LockFailEnv {
    fn is_primary(&self) -> bool {
        true
    }

    fn reserve(&self, name: &str, size: usize) -> Result<SharedRegion> {
        self.inner.reserve(name, size)
    }

    fn lookup(&self, name: &str, size: usize) -> Result<Option<SharedRegion>> {
        self.inner.lookup(name, size)
    }

    fn free(&self, name: &str) -> Result<()> {
        self.inner.free(name)
    }

    fn mutex_primitives(&self) -> &dyn MutexPrimitives {
        &FailingMutexInit
    }
}
