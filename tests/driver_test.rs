mod common;

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::*;
use nvme_host::shm::{Environment, PosixEnv};
use nvme_host::{
    completion, DriverState, Error, NvmeCompletion, ProbeOutcome, ProcessRole, TransportId,
};

fn accept_all(_: &TransportId, _: &mut nvme_host::ControllerOpts) -> bool {
    true
}

fn attached(outcome: ProbeOutcome) -> Arc<nvme_host::Controller> {
    match outcome {
        ProbeOutcome::Attached(ctrlr) => ctrlr,
        ProbeOutcome::Declined => panic!("probe declined"),
    }
}

#[test]
fn test_initialize_idempotent() {
    let env = Arc::new(CountingEnv::new());
    let driver = nvme_host::Driver::new(config("idem", ProcessRole::Primary), env.clone()).unwrap();
    assert_eq!(driver.state(), DriverState::Uninitialized);

    driver.initialize().unwrap();
    driver.initialize().unwrap();
    assert_eq!(driver.state(), DriverState::PrimaryReady);
    assert_eq!(env.reserves.load(Ordering::SeqCst), 1);
    assert_eq!(driver.shared_controller_count().unwrap(), 0);

    driver.teardown().unwrap();
}

#[test]
fn test_reserve_failure_is_setup_error() {
    let driver =
        nvme_host::Driver::new(config("nomem", ProcessRole::Primary), Arc::new(NoMemoryEnv))
            .unwrap();
    assert!(matches!(driver.initialize(), Err(Error::Setup(_))));
    assert_eq!(driver.state(), DriverState::Failed);
    // retried from scratch
    assert!(matches!(driver.initialize(), Err(Error::Setup(_))));
}

#[test]
fn test_lock_init_failure_propagates_and_frees() {
    let name = shm_name("lockfail");
    let driver = nvme_host::Driver::new(
        config("lockfail", ProcessRole::Primary),
        Arc::new(LockFailEnv::new()),
    )
    .unwrap();

    let err = driver.initialize().unwrap_err();
    assert!(matches!(err, Error::LockInit(-1)));
    assert_eq!(err.errno(), -1);
    assert_eq!(driver.state(), DriverState::Failed);

    assert!(PosixEnv::new(false).lookup(&name, 64).unwrap().is_none());
}

#[test]
fn test_secondary_without_primary() {
    let driver = secondary("noprimary");
    assert!(matches!(driver.initialize(), Err(Error::NotFound(_))));
    assert_eq!(driver.state(), DriverState::Failed);
}

#[test]
fn test_secondary_times_out_on_uninitialized_state() {
    let name = shm_name("race");
    let env = PosixEnv::new(true);
    // zero-filled and never initialized
    let _region = env.reserve(&name, 1 << 20).unwrap();

    let driver = secondary("race");
    let err = driver.initialize().unwrap_err();
    assert!(matches!(err, Error::NotReady(_)));
    assert!(err.is_retryable());
    assert_eq!(driver.state(), DriverState::Failed);

    env.free(&name).unwrap();
}

#[test]
fn test_secondary_retries_while_region_is_sized() {
    let name = shm_name("sizing");
    let env = PosixEnv::new(true);
    // created but not yet truncated to the driver layout
    let _region = env.reserve(&name, 64).unwrap();

    let driver = secondary("sizing");
    let err = driver.initialize().unwrap_err();
    assert!(matches!(err, Error::NotReady(_)));
    assert!(err.is_retryable());

    env.free(&name).unwrap();
    assert!(matches!(driver.initialize(), Err(Error::NotFound(_))));
}

#[test]
fn test_primary_replaces_abandoned_region() {
    let name = shm_name("abandoned");
    // a primary that died before stamping the region
    drop(PosixEnv::new(true).reserve(&name, 64).unwrap());

    let driver = primary("abandoned");
    driver.initialize().unwrap();
    assert_eq!(driver.state(), DriverState::PrimaryReady);
    assert_eq!(driver.shared_controller_count().unwrap(), 0);

    driver.teardown().unwrap();
    assert!(PosixEnv::new(false).lookup(&name, 64).unwrap().is_none());
}

#[test]
fn test_secondary_waits_for_primary() {
    let name = shm_name("wait");
    let primary = primary("wait");
    primary.initialize().unwrap();

    let driver = nvme_host::Driver::new(
        with_timeout(
            config("wait", ProcessRole::Secondary),
            std::time::Duration::from_secs(5),
        ),
        Arc::new(PosixEnv::new(false)),
    )
    .unwrap();
    driver.initialize().unwrap();
    assert_eq!(driver.state(), DriverState::SecondaryReady);
    assert!(!driver.is_primary());

    driver.teardown().unwrap();
    // secondaries never remove the region
    assert!(PosixEnv::new(false).lookup(&name, 64).unwrap().is_some());
    primary.teardown().unwrap();
    assert!(PosixEnv::new(false).lookup(&name, 64).unwrap().is_none());
}

#[test]
fn test_detach_destructs_on_last_reference() {
    let driver = primary("detach");
    let transport = MockTransport::new();
    driver.register_transport(transport.clone());
    let trid = TransportId::pcie("0000:01:00.0").unwrap();

    let first = attached(driver.ctrlr_probe(&trid, None, accept_all).unwrap());
    let second = attached(driver.ctrlr_probe(&trid, None, accept_all).unwrap());
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(transport.counters.constructed(), 1);
    assert_eq!(first.ref_count().unwrap(), 2);
    assert_eq!(driver.attached_count(), 1);

    driver.detach(&first).unwrap();
    assert_eq!(transport.counters.destructed(), 0);
    assert_eq!(driver.attached_count(), 1);
    assert_eq!(first.ref_count().unwrap(), 1);

    driver.detach(&second).unwrap();
    assert_eq!(transport.counters.destructed(), 1);
    assert_eq!(driver.attached_count(), 0);
    assert_eq!(driver.shared_controller_count().unwrap(), 0);
    assert!(first.is_failed());

    // no reference left
    assert!(matches!(driver.detach(&first), Err(Error::NotAttached)));
    assert_eq!(transport.counters.destructed(), 1);

    driver.teardown().unwrap();
}

#[test]
fn test_probe_callback_declines() {
    let driver = primary("decline");
    let transport = MockTransport::new();
    driver.register_transport(transport.clone());
    let trid = TransportId::pcie("0000:02:00.0").unwrap();

    let outcome = driver.ctrlr_probe(&trid, None, |_, _| false).unwrap();
    assert!(matches!(outcome, ProbeOutcome::Declined));

    let ctrlrs = driver
        .probe(Some(&trid), |_, _| false, |_, _| panic!("nothing attaches"))
        .unwrap();
    assert!(ctrlrs.is_empty());
    assert_eq!(transport.counters.constructed(), 0);
    assert_eq!(driver.attached_count(), 0);

    driver.teardown().unwrap();
}

#[test]
fn test_construct_failure() {
    let driver = primary("construct");
    let transport = MockTransport::new();
    transport.fail_construct.store(true, Ordering::SeqCst);
    driver.register_transport(transport.clone());
    let trid = TransportId::pcie("0000:03:00.0").unwrap();

    let err = driver.ctrlr_probe(&trid, None, accept_all).unwrap_err();
    assert!(matches!(err, Error::ConstructFailed(ref t) if *t == trid));
    assert!(driver.probe(Some(&trid), accept_all, |_, _| {}).is_err());
    assert_eq!(driver.attached_count(), 0);
    assert_eq!(driver.shared_controller_count().unwrap(), 0);

    driver.teardown().unwrap();
}

#[test]
fn test_start_failure_destructs() {
    let driver = primary("start");
    let transport = MockTransport::new();
    transport.fail_start.store(true, Ordering::SeqCst);
    driver.register_transport(transport.clone());
    let trid = TransportId::pcie("0000:04:00.0").unwrap();

    assert!(driver.ctrlr_probe(&trid, None, accept_all).is_err());
    assert_eq!(transport.counters.constructed(), 1);
    assert_eq!(transport.counters.destructed(), 1);
    assert_eq!(driver.shared_controller_count().unwrap(), 0);

    driver.teardown().unwrap();
}

#[test]
fn test_unregistered_transport() {
    let driver = primary("notransport");
    driver.register_transport(MockTransport::new());
    let trid = TransportId::rdma("192.168.0.10", "4420", "nqn.2016-06.io.spdk:cnode1").unwrap();

    assert!(matches!(
        driver.ctrlr_probe(&trid, None, accept_all),
        Err(Error::NotFound(_))
    ));
    driver.teardown().unwrap();
}

#[test]
fn test_probe_scans_all_local_devices() {
    let driver = primary("scan");
    let trids: Vec<TransportId> = (1..=3)
        .map(|i| TransportId::pcie(&format!("0000:{:02x}:00.0", i)).unwrap())
        .collect();
    let transport = MockTransport::with_candidates(trids.clone());
    driver.register_transport(transport.clone());

    let mut seen = Vec::new();
    let ctrlrs = driver
        .probe(
            None,
            |trid, _| trid.traddr() != "0000:02:00.0",
            |trid, _| seen.push(trid.clone()),
        )
        .unwrap();
    assert_eq!(ctrlrs.len(), 2);
    assert_eq!(seen, vec![trids[0].clone(), trids[2].clone()]);
    assert_eq!(driver.attached_count(), 2);
    assert_eq!(driver.shared_controller_count().unwrap(), 2);

    driver.teardown().unwrap();
    assert_eq!(transport.counters.destructed(), 2);
}

#[test]
fn test_probe_callback_adjusts_options() {
    let driver = primary("opts");
    let transport = MockTransport::new();
    driver.register_transport(transport.clone());
    let trid = TransportId::pcie("0000:05:00.0").unwrap();

    let ctrlr = attached(
        driver
            .ctrlr_probe(&trid, None, |_, opts| {
                opts.io_queue_requests = 8;
                opts.num_io_queues = 2;
                true
            })
            .unwrap(),
    );
    let seen = transport.last_opts.lock().unwrap().clone().unwrap();
    assert_eq!(seen.io_queue_requests, 8);
    assert_eq!(ctrlr.opts().io_queue_requests, 8);

    let q1 = ctrlr.alloc_io_qpair().unwrap();
    let q2 = ctrlr.alloc_io_qpair().unwrap();
    assert_eq!((q1.id(), q2.id()), (1, 2));
    assert_eq!(q1.capacity(), 8);
    assert!(matches!(ctrlr.alloc_io_qpair(), Err(Error::NoMemory(_))));

    driver.teardown().unwrap();
}

#[test]
fn test_failed_controller_rejects_submission() {
    let driver = primary("fail");
    let transport = MockTransport::new();
    driver.register_transport(transport.clone());
    let trid = TransportId::pcie("0000:06:00.0").unwrap();

    let ctrlr = attached(driver.ctrlr_probe(&trid, None, accept_all).unwrap());
    let mut qpair = ctrlr.alloc_io_qpair().unwrap();

    let id = qpair.allocate_null(None).unwrap();
    ctrlr.fail(true);
    assert!(ctrlr.is_failed());
    assert_eq!(transport.counters.failed(), 1);

    assert!(matches!(qpair.submit(id), Err(Error::ControllerFailed)));
    assert_eq!(qpair.num_free(), qpair.capacity());
    assert!(matches!(ctrlr.alloc_io_qpair(), Err(Error::ControllerFailed)));

    // still attached until detached
    assert_eq!(driver.attached_count(), 1);
    assert_eq!(ctrlr.ref_count().unwrap(), 1);
    driver.detach(&ctrlr).unwrap();
    assert_eq!(transport.counters.destructed(), 1);

    // a fresh attach of the same address starts healthy
    let again = attached(driver.ctrlr_probe(&trid, None, accept_all).unwrap());
    assert!(!again.is_failed());

    driver.teardown().unwrap();
}

#[test]
fn test_io_completion_through_controller_qpair() {
    let driver = primary("io");
    driver.register_transport(MockTransport::new());
    let trid = TransportId::pcie("0000:07:00.0").unwrap();

    let ctrlr = attached(driver.ctrlr_probe(&trid, None, accept_all).unwrap());
    let mut qpair = ctrlr.alloc_io_qpair().unwrap();

    let (cb, fut) = completion();
    let id = qpair.allocate_null(Some(cb)).unwrap();
    let cid = qpair.submit(id).unwrap();

    let mut cq = VecDeque::from(vec![NvmeCompletion::success(cid)]);
    assert_eq!(qpair.process_completions(&mut cq, 0), 1);

    let cpl = futures::executor::block_on(fut).unwrap();
    assert_eq!(cpl.c_id, cid);
    assert!(!cpl.is_error());
    assert_eq!(qpair.stats().completions, 1);
    assert_eq!(qpair.num_free(), qpair.capacity());

    driver.teardown().unwrap();
}

#[test]
fn test_primary_and_secondary_share_table() {
    let primary = primary("share");
    let p_transport = MockTransport::new();
    primary.register_transport(p_transport.clone());
    primary.initialize().unwrap();

    let secondary = secondary("share");
    let s_transport = MockTransport::new();
    secondary.register_transport(s_transport.clone());
    secondary.initialize().unwrap();

    let trid = TransportId::pcie("0000:08:00.0").unwrap();
    let p_ctrlr = attached(primary.ctrlr_probe(&trid, None, accept_all).unwrap());
    let s_ctrlr = attached(secondary.ctrlr_probe(&trid, None, accept_all).unwrap());

    assert_eq!(primary.shared_controller_count().unwrap(), 1);
    assert_eq!(secondary.shared_controller_count().unwrap(), 1);
    assert_eq!(p_ctrlr.ref_count().unwrap(), 2);

    // failure is visible through every mapping
    p_ctrlr.fail(false);
    assert!(s_ctrlr.is_failed());

    secondary.detach(&s_ctrlr).unwrap();
    assert_eq!(p_ctrlr.ref_count().unwrap(), 1);
    assert_eq!(p_transport.counters.destructed() + s_transport.counters.destructed(), 0);

    primary.detach(&p_ctrlr).unwrap();
    assert_eq!(p_transport.counters.destructed(), 1);
    assert_eq!(primary.shared_controller_count().unwrap(), 0);

    secondary.teardown().unwrap();
    primary.teardown().unwrap();
}
