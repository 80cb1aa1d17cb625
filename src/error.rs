//! Error types for the driver core.

use crate::trid::TransportId;

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for driver operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input, absent required argument or zero size
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Well-formed but unrecognized value
    #[error("not found: {0}")]
    NotFound(String),

    /// Pool or allocator exhausted
    #[error("out of memory: {0}")]
    NoMemory(String),

    /// Secondary process found the shared state before the primary finished
    #[error("driver not ready: {0}")]
    NotReady(String),

    /// Primary could not set up the shared driver state
    #[error("driver setup failed: {0}")]
    Setup(String),

    /// Other processes still depend on the shared driver state
    #[error("driver busy: {0}")]
    Busy(String),

    /// Robust lock construction failed with the given primitive return code
    #[error("robust lock initialization failed: {0}")]
    LockInit(i32),

    /// Transport could not construct a controller
    #[error("failed to construct controller for {0}")]
    ConstructFailed(TransportId),

    /// Controller has been marked failed or hot-removed
    #[error("controller failed or removed")]
    ControllerFailed,

    /// Caller does not hold a reference on the controller
    #[error("controller is not attached in this process")]
    NotAttached,

    /// Request was allocated by another process
    #[error("request owned by pid {owner}, completed from pid {current}")]
    ForeignRequest { owner: u32, current: u32 },

    /// Shared region was laid out by an incompatible build
    #[error("shared driver layout mismatch: {0}")]
    AbiMismatch(String),

    /// Configuration could not be read or is invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// Operating system error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Negative errno equivalent, for callers that branch on codes.
    pub fn errno(&self) -> i32 {
        let code = match self {
            Error::InvalidArgument(_) | Error::Config(_) => libc::EINVAL,
            Error::NotFound(_) => libc::ENOENT,
            Error::NoMemory(_) => libc::ENOMEM,
            Error::NotReady(_) => libc::EAGAIN,
            Error::Setup(_) => libc::ENOMEM,
            Error::Busy(_) => libc::EBUSY,
            Error::LockInit(rc) => return if *rc < 0 { *rc } else { -*rc },
            Error::ConstructFailed(_) => libc::ENODEV,
            Error::ControllerFailed => libc::ENXIO,
            Error::NotAttached => libc::EPERM,
            Error::ForeignRequest { .. } => libc::EPERM,
            Error::AbiMismatch(_) => libc::EPROTO,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        };
        -code
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotReady(_) | Error::NoMemory(_) | Error::Busy(_)
        )
    }

    pub(crate) fn last_os_error() -> Self {
        Error::Io(std::io::Error::last_os_error())
    }
}
