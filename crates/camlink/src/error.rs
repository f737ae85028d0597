use std::time::Duration;

use camlink_core::prelude::{PoolError, SlotHandle};
use camlink_device::{DeviceError, StreamKind};
use tracing::debug;

use crate::client::CallerId;

/// Errors returned by client operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    /// The device refused a stream configuration or the snapshot is invalid.
    /// The caller may retry with different settings.
    #[error("configuration rejected: {0}")]
    ConfigurationRejected(String),
    #[error("{caller} does not own the camera (owner: {owner:?})")]
    PermissionDenied {
        caller: CallerId,
        owner: Option<CallerId>,
    },
    /// Transient device contention that persisted through one retry.
    #[error("device busy")]
    DeviceBusy,
    /// Unrecoverable for the affected streams.
    #[error("device error: {0}")]
    DeviceError(String),
    #[error("{0} buffers exhausted")]
    ResourceExhausted(String),
    #[error("{what} did not finish within {waited:?}")]
    Timeout { what: String, waited: Duration },
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("client disconnected")]
    Disconnected,
    #[error("buffer {0:?} is no longer valid")]
    StaleBuffer(SlotHandle),
}

impl ClientError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::ConfigurationRejected(_) => "configuration_rejected",
            ClientError::PermissionDenied { .. } => "permission_denied",
            ClientError::DeviceBusy => "device_busy",
            ClientError::DeviceError(_) => "device_error",
            ClientError::ResourceExhausted(_) => "resource_exhausted",
            ClientError::Timeout { .. } => "timeout",
            ClientError::InvalidOperation(_) => "invalid_operation",
            ClientError::Disconnected => "disconnected",
            ClientError::StaleBuffer(_) => "stale_buffer",
        }
    }

    /// Whether the operation may succeed when retried.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ClientError::DeviceBusy
                | ClientError::ResourceExhausted(_)
                | ClientError::ConfigurationRejected(_)
        )
    }

    /// Bounded waits on the device are fatal for the streams involved.
    pub(crate) fn escalate(self) -> Self {
        match self {
            ClientError::Timeout { what, waited } => {
                ClientError::DeviceError(format!("{what} did not finish within {waited:?}"))
            }
            other => other,
        }
    }

    pub(crate) fn from_pool(kind: StreamKind, err: PoolError) -> Self {
        match err {
            PoolError::Exhausted | PoolError::AcquireTimeout(_) => {
                ClientError::ResourceExhausted(kind.to_string())
            }
            PoolError::DrainTimeout {
                waited,
                outstanding,
            } => ClientError::Timeout {
                what: format!("{kind} stream drain ({outstanding} buffers in flight)"),
                waited,
            },
            other => ClientError::InvalidOperation(format!("{kind} buffer: {other}")),
        }
    }
}

impl From<DeviceError> for ClientError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Busy => ClientError::DeviceBusy,
            DeviceError::Unsupported(reason) => ClientError::ConfigurationRejected(reason),
            DeviceError::ResourceExhausted(stream) => {
                ClientError::ResourceExhausted(stream.to_string())
            }
            other => ClientError::DeviceError(other.to_string()),
        }
    }
}

/// Run a device call, retrying exactly once when the device reports `Busy`.
pub(crate) fn retry_busy<T>(
    what: &str,
    mut call: impl FnMut() -> Result<T, DeviceError>,
) -> Result<T, ClientError> {
    match call() {
        Err(DeviceError::Busy) => {
            debug!(what, "device busy, retrying once");
            call().map_err(ClientError::from)
        }
        other => other.map_err(ClientError::from),
    }
}
