pub mod cmd;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod logging;
pub mod memory;
pub mod mutex;
pub mod qpair;
pub mod queues;
pub mod request;
pub mod shm;
pub mod transport;
pub mod trid;

pub use config::{DriverConfig, ProcessRole};
pub use controller::{Controller, ControllerOpts};
pub use driver::{Driver, DriverState, ProbeOutcome};
pub use error::{Error, Result};
pub use qpair::{NvmeStats, QueuePair};
pub use queues::NvmeCompletion;
pub use request::{completion, CompletionFn, Payload, RequestId, UserBuffer};
pub use transport::{ControllerOps, DeviceHandle, ProbeCandidate, Transport};
pub use trid::{AddressFamily, TransportId, TransportType};

use std::sync::{Arc, Mutex, PoisonError};

use lazy_static::lazy_static;

lazy_static! {
    static ref G_DRIVER: Mutex<Option<Arc<Driver>>> = Mutex::new(None);
}

/// Set up logging and the process-wide driver, then initialize it.
///
/// Later calls return the same driver and ignore `config`. If
/// initialization fails the driver is kept, so calling again retries.
pub fn init(config: DriverConfig) -> Result<Arc<Driver>> {
    let driver = {
        let mut global = G_DRIVER.lock().unwrap_or_else(PoisonError::into_inner);
        match global.as_ref() {
            Some(driver) => Arc::clone(driver),
            None => {
                logging::init_logging(&config.log)?;
                let driver = Arc::new(Driver::from_config(config)?);
                *global = Some(Arc::clone(&driver));
                driver
            }
        }
    };
    driver.initialize()?;
    Ok(driver)
}

/// The driver set up by [`init`], if any.
pub fn driver() -> Option<Arc<Driver>> {
    G_DRIVER
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}
