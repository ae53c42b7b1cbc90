//! BLE Transport Seam
//!
//! The OS BLE stack sits behind [`BleTransport`]. Characteristic values cross
//! this seam as base64 strings; implementations turn them into raw bytes on
//! air.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Transport-specific peripheral identifier (address, device id, ...)
pub type PeripheralId = String;

/// Invoked with each notified value (base64) or a monitor error
pub type ValueListener = Box<dyn Fn(Result<String, TransportError>) + Send + Sync>;

/// Invoked once the peripheral drops the connection
pub type DisconnectListener = Box<dyn Fn(Option<TransportError>) + Send + Sync>;

/// Registration of a value or disconnect listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    #[error("Bluetooth adapter is off")]
    AdapterOff,

    #[error("Device disconnected")]
    DeviceDisconnected,

    #[error("GATT error: {0}")]
    Gatt(String),
}

#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// Scan until a peripheral advertising `name` is seen
    async fn scan_for(&self, name: &str) -> Result<PeripheralId, TransportError>;

    /// Stop a running scan. No-op when idle.
    async fn stop_scan(&self);

    async fn connect(&self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    /// Request an MTU, returning the negotiated value
    async fn request_mtu(&self, peripheral: &PeripheralId, mtu: u16) -> Result<u16, TransportError>;

    /// Discover all services and characteristics
    async fn discover(&self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    /// Drop the connection and everything registered on it
    async fn cancel_connection(&self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    fn on_disconnected(
        &self,
        peripheral: &PeripheralId,
        listener: DisconnectListener,
    ) -> Result<ListenerId, TransportError>;

    /// Enable notifications on a characteristic and register a listener
    async fn monitor(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        listener: ValueListener,
    ) -> Result<ListenerId, TransportError>;

    /// Unregister a value or disconnect listener. Unknown ids are ignored.
    fn remove_listener(&self, listener: ListenerId);

    /// Confirmed (with response) write of a base64 value
    async fn write_with_response(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        value: &str,
    ) -> Result<(), TransportError>;
}
