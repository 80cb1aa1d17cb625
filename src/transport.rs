//! Transport plumbing consumed by the attach protocol.
//!
//! A transport knows how to enumerate controllers behind a transport id and
//! how to build one; everything about the wire (PCIe BARs, fabric
//! connections) stays behind [`ControllerOps`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::controller::ControllerOpts;
use crate::error::Result;
use crate::trid::{TransportId, TransportType};

/// Opaque transport-specific device reference handed from `scan` to
/// `ctrlr_construct`.
#[derive(Clone)]
pub struct DeviceHandle(Arc<dyn Any + Send + Sync>);

impl DeviceHandle {
    pub fn new<T: Any + Send + Sync>(dev: T) -> Self {
        DeviceHandle(Arc::new(dev))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceHandle(..)")
    }
}

/// A controller found by [`Transport::scan`].
#[derive(Debug, Clone)]
pub struct ProbeCandidate {
    pub trid: TransportId,
    pub devhandle: Option<DeviceHandle>,
}

impl ProbeCandidate {
    pub fn new(trid: TransportId) -> Self {
        Self {
            trid,
            devhandle: None,
        }
    }

    pub fn with_devhandle(trid: TransportId, devhandle: DeviceHandle) -> Self {
        Self {
            trid,
            devhandle: Some(devhandle),
        }
    }
}

pub trait Transport: Send + Sync {
    fn trtype(&self) -> TransportType;

    /// Controllers reachable through `trid`. A fully specified id usually
    /// yields itself; a bare `trtype:PCIe` may yield every local device.
    fn scan(&self, trid: &TransportId) -> Result<Vec<ProbeCandidate>>;

    /// Build a controller object, or `None` if the device cannot be set up.
    fn ctrlr_construct(
        &self,
        trid: &TransportId,
        opts: &ControllerOpts,
        devhandle: Option<&DeviceHandle>,
    ) -> Option<Box<dyn ControllerOps>>;
}

/// Transport-owned half of a controller.
pub trait ControllerOps: Send {
    /// Bring the controller to ready (enable, admin queue, identify).
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Controller was marked failed; `hot_remove` when the device is gone.
    fn fail(&mut self, _hot_remove: bool) {}

    /// Release device resources. Called once, when the last process
    /// detaches.
    fn destruct(&mut self);
}
