mod common;

use std::sync::Arc;

use common::config;
use nvme_host::{DriverState, ProcessRole};

#[test]
fn test_global_init_is_idempotent() {
    assert!(nvme_host::driver().is_none());

    let first = nvme_host::init(config("global", ProcessRole::Primary)).unwrap();
    assert_eq!(first.state(), DriverState::PrimaryReady);

    let second = nvme_host::init(config("ignored", ProcessRole::Secondary)).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.config().shm_name, common::shm_name("global"));
    assert!(Arc::ptr_eq(&first, &nvme_host::driver().unwrap()));

    first.teardown().unwrap();
}
