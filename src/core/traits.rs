//! Collaborator contract between the session core and the device.

use serde_json::Value;

use super::error::DeviceError;

/// The device whose telemetry the session reports.
///
/// All methods are synchronous and are called from the dispatch task, so
/// they should return quickly. Payload-producing methods return any
/// JSON-serializable value; the cloud expects objects.
///
/// # Example
///
/// ```ignore
/// struct Heater { power: AtomicU32 }
///
/// impl Device for Heater {
///     fn current_data(&self) -> Result<Value, DeviceError> {
///         Ok(json!({ "power": self.power.load(Ordering::Relaxed) }))
///     }
///     // ...
/// }
/// ```
pub trait Device: Send + Sync + 'static {
    /// Snapshot of the current readings.
    fn current_data(&self) -> Result<Value, DeviceError>;

    /// Snapshot of the device setup.
    fn setup(&self) -> Result<Value, DeviceError>;

    /// Apply a single setup change.
    fn set_setup_value(&self, field: &str, value: i64) -> Result<(), DeviceError>;

    /// Materialize the log records to transmit.
    fn log_data(&self) -> Result<Value, DeviceError>;

    /// Drop log records that were handed out by [`log_data`](Self::log_data).
    fn clear_log(&self) -> Result<(), DeviceError>;

    /// Health byte carried in every frame header.
    fn health_state(&self) -> Result<u8, DeviceError> {
        Ok(0)
    }
}
