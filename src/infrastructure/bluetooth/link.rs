//! Device Link
//!
//! Owns the connection lifecycle to one named peripheral: scan, connect,
//! MTU negotiation, discovery, notification subscriptions and confirmed
//! writes.
//!
//! ```text
//! Idle ──connect──▶ Scanning ──▶ Connecting ──▶ Connected
//!                                    │              │
//!                                    ▼              ▼ (disconnect / link lost)
//!                              Disconnected ◀───────┘
//!                                    │
//!                                    └──reconnect──▶ Reconnecting{n} ──▶ Scanning ...
//! ```

use crate::domain::models::{AppEvent, LinkState};
use crate::infrastructure::bluetooth::protocol::{self, EncodeError};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, ListenerId, PeripheralId, TransportError,
};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    #[error("Bluetooth adapter is off")]
    AdapterOff,

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection cancelled")]
    Cancelled,

    #[error("GATT failure: {0}")]
    GattFailure(String),
}

impl From<TransportError> for ConnectError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::PermissionDenied => ConnectError::PermissionDenied,
            TransportError::AdapterOff => ConnectError::AdapterOff,
            TransportError::DeviceDisconnected => {
                ConnectError::GattFailure("device disconnected".to_string())
            }
            TransportError::Gatt(msg) => ConnectError::GattFailure(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("Device not connected")]
    NotConnected,

    #[error("GATT failure: {0}")]
    GattFailure(String),

    #[error("Invalid command: {0}")]
    Encode(#[from] EncodeError),
}

impl From<TransportError> for WriteError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::DeviceDisconnected => WriteError::NotConnected,
            other => WriteError::GattFailure(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error("Device not connected")]
    NotConnected,

    #[error("Failed to enable notifications: {0}")]
    GattFailure(String),
}

/// Connected peripheral, valid while the link is Connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkHandle {
    pub peripheral: PeripheralId,
    pub device_name: String,
    /// Negotiated MTU, if negotiation succeeded
    pub mtu: Option<u16>,
}

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Upper bound for scan + connect + discovery
    pub connect_timeout: Duration,
    /// MTU requested after connecting
    pub mtu: u16,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            mtu: protocol::DEFAULT_MTU,
        }
    }
}

/// Bounded exponential backoff for reconnects
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt, or None once attempts are used up
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = self.multiplier.max(1.0).powi(attempt as i32 - 1);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Some(Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64())))
    }
}

/// Cancels an in-flight connect or reconnect
#[derive(Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(());
    }
}

/// Notification listener registration. Dropping it unregisters the listener.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

/// Link to the smart box
pub struct DeviceLink<T: BleTransport> {
    transport: Arc<T>,
    config: LinkConfig,
    state: Arc<Mutex<LinkState>>,
    handle: Option<LinkHandle>,
    disconnect_listener: Option<ListenerId>,
    /// Peripheral found by an in-flight connect, released if it fails
    pending: Mutex<Option<PeripheralId>>,
    last_device_name: Option<String>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    cancel: Arc<watch::Sender<()>>,
}

impl<T: BleTransport> DeviceLink<T> {
    pub fn new(
        transport: Arc<T>,
        config: LinkConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (cancel, _) = watch::channel(());
        Self {
            transport,
            config,
            state: Arc::new(Mutex::new(LinkState::Idle)),
            handle: None,
            disconnect_listener: None,
            pending: Mutex::new(None),
            last_device_name: None,
            event_sender,
            cancel: Arc::new(cancel),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or(LinkState::Disconnected { error: None })
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some() && self.state().is_connected()
    }

    /// Handle of the current connection, if connected
    pub fn handle(&self) -> Option<&LinkHandle> {
        self.handle.as_ref().filter(|_| self.state().is_connected())
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            sender: self.cancel.clone(),
        }
    }

    /// Scan for `device_name`, connect, negotiate MTU and discover services.
    ///
    /// The whole sequence is bounded by the configured timeout and aborts
    /// early when the [`CancelHandle`] fires.
    pub async fn connect(&mut self, device_name: &str) -> Result<LinkHandle, ConnectError> {
        if let Some(handle) = self.handle() {
            if handle.device_name == device_name {
                debug!("Already connected to {}", device_name);
                return Ok(handle.clone());
            }
        }
        self.release_connection().await;
        self.last_device_name = Some(device_name.to_string());

        info!("Connecting to device {:?}", device_name);
        let timeout = self.config.connect_timeout;
        let result = self
            .cancellable(async {
                match tokio::time::timeout(timeout, self.establish(device_name)).await {
                    Ok(result) => result,
                    Err(_) => Err(ConnectError::Timeout(timeout)),
                }
            })
            .await;

        match result {
            Ok(handle) => {
                if let Err(e) = self.watch_disconnect(&handle.peripheral) {
                    warn!("Could not register disconnect listener: {}", e);
                }
                info!(
                    "Connected to {} ({}), MTU {:?}",
                    handle.device_name, handle.peripheral, handle.mtu
                );
                self.handle = Some(handle.clone());
                self.set_state(LinkState::Connected);
                Ok(handle)
            }
            Err(e) => {
                warn!("Connection to {:?} failed: {}", device_name, e);
                self.abort_pending().await;
                self.set_state(LinkState::Disconnected {
                    error: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    async fn establish(&self, device_name: &str) -> Result<LinkHandle, ConnectError> {
        self.set_state(LinkState::Scanning);
        let peripheral = self.transport.scan_for(device_name).await?;
        self.transport.stop_scan().await;
        debug!("Found {:?} as {}", device_name, peripheral);

        if let Ok(mut pending) = self.pending.lock() {
            *pending = Some(peripheral.clone());
        }

        self.set_state(LinkState::Connecting);
        self.transport.connect(&peripheral).await?;

        let mtu = match self.transport.request_mtu(&peripheral, self.config.mtu).await {
            Ok(mtu) => Some(mtu),
            Err(e) => {
                warn!("MTU negotiation failed, keeping default: {}", e);
                None
            }
        };

        self.transport.discover(&peripheral).await?;

        if let Ok(mut pending) = self.pending.lock() {
            pending.take();
        }

        Ok(LinkHandle {
            peripheral,
            device_name: device_name.to_string(),
            mtu,
        })
    }

    /// Stop scanning and release a half-open connection after a failed connect
    async fn abort_pending(&self) {
        self.transport.stop_scan().await;
        let pending = self.pending.lock().ok().and_then(|mut p| p.take());
        if let Some(peripheral) = pending {
            if let Err(e) = self.transport.cancel_connection(&peripheral).await {
                debug!("Releasing half-open connection failed: {}", e);
            }
        }
    }

    /// Run `fut` until it completes or the cancel handle fires
    async fn cancellable<F, R>(&self, fut: F) -> Result<R, ConnectError>
    where
        F: Future<Output = Result<R, ConnectError>>,
    {
        // a fresh receiver only observes cancels issued from now on
        let mut cancelled = self.cancel.subscribe();
        tokio::select! {
            result = fut => result,
            _ = cancelled.changed() => Err(ConnectError::Cancelled),
        }
    }

    fn watch_disconnect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let state = self.state.clone();
        let sender = self.event_sender.clone();
        let id = self.transport.on_disconnected(
            peripheral,
            Box::new(move |error| {
                let reason = error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "connection lost".to_string());
                warn!("Link lost: {}", reason);
                let new_state = LinkState::Disconnected {
                    error: Some(reason.clone()),
                };
                if let Ok(mut s) = state.lock() {
                    *s = new_state.clone();
                }
                let _ = sender.send(AppEvent::LinkState(new_state));
                let _ = sender.send(AppEvent::LinkLost { reason });
            }),
        )?;
        self.disconnect_listener = Some(id);
        Ok(())
    }

    /// True while the last connection dropped on its own and the device is
    /// still remembered for [`reconnect`](DeviceLink::reconnect)
    pub fn link_lost(&self) -> bool {
        self.last_device_name.is_some()
            && matches!(self.state(), LinkState::Disconnected { error: Some(_) })
    }

    /// Release the connection and forget the device. Idempotent.
    pub async fn disconnect(&mut self) {
        self.last_device_name = None;
        if self.handle.is_none() {
            return;
        }
        self.release_connection().await;
        info!("Disconnected from device");
        self.set_state(LinkState::Disconnected { error: None });
    }

    async fn release_connection(&mut self) {
        if let Some(id) = self.disconnect_listener.take() {
            self.transport.remove_listener(id);
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.transport.cancel_connection(&handle.peripheral).await {
                debug!("Cancel connection failed: {}", e);
            }
        }
    }

    /// Reconnect to the last device following `policy`.
    ///
    /// Each attempt waits its backoff delay, then runs a full [`connect`].
    /// Gives up after `max_attempts` with the last error.
    ///
    /// [`connect`]: DeviceLink::connect
    pub async fn reconnect(&mut self, policy: &ReconnectPolicy) -> Result<LinkHandle, ConnectError> {
        let device_name = self
            .last_device_name
            .clone()
            .ok_or_else(|| ConnectError::GattFailure("no device to reconnect to".to_string()))?;

        let mut last_error = ConnectError::GattFailure("no reconnect attempts allowed".to_string());
        let mut attempt = 1;
        while let Some(delay) = policy.delay_for(attempt) {
            self.set_state(LinkState::Reconnecting { attempt });
            info!(
                "Reconnect attempt {}/{} in {:?}",
                attempt, policy.max_attempts, delay
            );

            if let Err(e) = self
                .cancellable(async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await
            {
                self.set_state(LinkState::Disconnected {
                    error: Some(e.to_string()),
                });
                return Err(e);
            }

            match self.connect(&device_name).await {
                Ok(handle) => return Ok(handle),
                Err(ConnectError::Cancelled) => return Err(ConnectError::Cancelled),
                Err(e) => last_error = e,
            }
            attempt += 1;
        }

        warn!("Giving up reconnect after {} attempts", attempt - 1);
        self.set_state(LinkState::Disconnected {
            error: Some(last_error.to_string()),
        });
        Err(last_error)
    }

    /// Register `on_value` for notifications of a characteristic.
    ///
    /// Values that fail to decode are logged and dropped.
    pub async fn subscribe<F>(
        &self,
        service: Uuid,
        characteristic: Uuid,
        on_value: F,
    ) -> Result<Subscription, SubscribeError>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let handle = self.handle().ok_or(SubscribeError::NotConnected)?;

        let listener = Box::new(move |value: Result<String, TransportError>| match value {
            Ok(value) => match protocol::decode_value(&value) {
                Ok(text) => on_value(text),
                Err(e) => warn!("Dropping undecodable notification: {}", e),
            },
            Err(e) => warn!("Notification error: {}", e),
        });

        let id = self
            .transport
            .monitor(&handle.peripheral, service, characteristic, listener)
            .await
            .map_err(|e| match e {
                TransportError::DeviceDisconnected => SubscribeError::NotConnected,
                other => SubscribeError::GattFailure(other.to_string()),
            })?;
        debug!("Subscribed to {} ({:?})", characteristic, id);

        let transport = self.transport.clone();
        Ok(Subscription {
            remove: Some(Box::new(move || {
                transport.remove_listener(id);
                debug!("Unsubscribed {:?}", id);
            })),
        })
    }

    /// Base64-encode `payload` and write it with response
    pub async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        payload: &str,
    ) -> Result<(), WriteError> {
        let handle = self.handle().ok_or(WriteError::NotConnected)?;
        debug!("Writing {:?} to {}", payload, characteristic);
        self.transport
            .write_with_response(
                &handle.peripheral,
                service,
                characteristic,
                &protocol::encode_value(payload),
            )
            .await?;
        Ok(())
    }

    fn set_state(&self, new_state: LinkState) {
        if let Ok(mut state) = self.state.lock() {
            if *state == new_state {
                return;
            }
            *state = new_state.clone();
        }
        let _ = self.event_sender.send(AppEvent::LinkState(new_state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::MockTransport;
    use std::sync::atomic::Ordering;

    fn uuids() -> (Uuid, Uuid, Uuid) {
        (
            protocol::parse_uuid(protocol::SERVICE_UUID).unwrap(),
            protocol::parse_uuid(protocol::SLOT_NOTIFY_CHAR_UUID).unwrap(),
            protocol::parse_uuid(protocol::SLOT_COMMAND_CHAR_UUID).unwrap(),
        )
    }

    fn link(
        transport: Arc<MockTransport>,
    ) -> (DeviceLink<MockTransport>, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DeviceLink::new(transport, LinkConfig::default(), tx), rx)
    }

    fn states(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<LinkState> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AppEvent::LinkState(state) = event {
                out.push(state);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_connect_walks_states() {
        let transport = Arc::new(MockTransport::advertising("ESP32SB"));
        let (mut link, mut rx) = link(transport.clone());

        let handle = link.connect("ESP32SB").await.unwrap();
        assert_eq!(handle.device_name, "ESP32SB");
        assert_eq!(handle.mtu, Some(247));
        assert!(link.is_connected());
        assert_eq!(
            states(&mut rx),
            vec![
                LinkState::Scanning,
                LinkState::Connecting,
                LinkState::Connected
            ]
        );
        assert_eq!(transport.disconnect_listener_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_twice_reuses_handle() {
        let transport = Arc::new(MockTransport::advertising("ESP32SB"));
        let (mut link, _rx) = link(transport.clone());

        let first = link.connect("ESP32SB").await.unwrap();
        let second = link.connect("ESP32SB").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out_when_device_absent() {
        let transport = Arc::new(MockTransport::advertising("SomethingElse"));
        let (mut link, _rx) = link(transport.clone());

        let err = link.connect("ESP32SB").await.unwrap_err();
        assert_eq!(err, ConnectError::Timeout(Duration::from_secs(15)));
        assert!(matches!(link.state(), LinkState::Disconnected { error: Some(_) }));
        // scan is stopped after the timeout
        assert!(transport.stop_scan_calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connect_can_be_cancelled() {
        let transport = Arc::new(MockTransport::advertising("SomethingElse"));
        let (mut link, _rx) = link(transport);

        let cancel = link.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        assert_eq!(
            link.connect("ESP32SB").await.unwrap_err(),
            ConnectError::Cancelled
        );
    }

    #[tokio::test]
    async fn test_connect_maps_transport_errors() {
        let transport = Arc::new(MockTransport::advertising("ESP32SB"));
        *transport.scan_error.lock().unwrap() = Some(TransportError::AdapterOff);
        let (mut link, _rx) = link(transport.clone());
        assert_eq!(
            link.connect("ESP32SB").await.unwrap_err(),
            ConnectError::AdapterOff
        );

        *transport.scan_error.lock().unwrap() = None;
        *transport.connect_error.lock().unwrap() = Some(TransportError::PermissionDenied);
        assert_eq!(
            link.connect("ESP32SB").await.unwrap_err(),
            ConnectError::PermissionDenied
        );
        // half-open connection released
        assert_eq!(transport.cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mtu_failure_is_not_fatal() {
        let transport = Arc::new(MockTransport::advertising("ESP32SB"));
        *transport.mtu_error.lock().unwrap() = Some(TransportError::Gatt("nope".to_string()));
        let (mut link, _rx) = link(transport);

        let handle = link.connect("ESP32SB").await.unwrap();
        assert_eq!(handle.mtu, None);
    }

    #[tokio::test]
    async fn test_write_while_disconnected_skips_transport() {
        let transport = Arc::new(MockTransport::advertising("ESP32SB"));
        let (link, _rx) = link(transport.clone());
        let (service, _, command) = uuids();

        let err = link.write(service, command, "3|Empty").await.unwrap_err();
        assert_eq!(err, WriteError::NotConnected);
        assert!(transport.written().is_empty());
    }

    #[tokio::test]
    async fn test_write_is_base64_encoded() {
        let transport = Arc::new(MockTransport::advertising("ESP32SB"));
        let (mut link, _rx) = link(transport.clone());
        let (service, _, command) = uuids();

        link.connect("ESP32SB").await.unwrap();
        link.write(service, command, "3|Empty").await.unwrap();
        assert_eq!(
            transport.written(),
            vec![(service, command, "M3xFbXB0eQ==".to_string())]
        );

        *transport.write_error.lock().unwrap() = Some(TransportError::Gatt("busy".to_string()));
        assert!(matches!(
            link.write(service, command, "3|Empty").await,
            Err(WriteError::GattFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = Arc::new(MockTransport::advertising("ESP32SB"));
        let (mut link, mut rx) = link(transport.clone());

        link.disconnect().await;
        assert!(states(&mut rx).is_empty());

        link.connect("ESP32SB").await.unwrap();
        link.disconnect().await;
        link.disconnect().await;
        assert_eq!(transport.cancel_calls.load(Ordering::SeqCst), 1);
        assert_eq!(link.state(), LinkState::Disconnected { error: None });
        assert_eq!(transport.disconnect_listener_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_drop_unregisters() {
        let transport = Arc::new(MockTransport::advertising("ESP32SB"));
        let (mut link, _rx) = link(transport.clone());
        let (service, notify, _) = uuids();
        link.connect("ESP32SB").await.unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let subscription = link
            .subscribe(service, notify, move |text| sink.lock().unwrap().push(text))
            .await
            .unwrap();

        transport.notify(notify, "1|Empty");
        transport.notify_raw(notify, "%%% not base64");
        assert_eq!(*received.lock().unwrap(), vec!["1|Empty".to_string()]);

        drop(subscription);
        assert_eq!(transport.value_listener_count(), 0);
        transport.notify(notify, "2|Empty");
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let transport = Arc::new(MockTransport::advertising("ESP32SB"));
        let (link, _rx) = link(transport);
        let (service, notify, _) = uuids();
        let result = link.subscribe(service, notify, |_| {}).await;
        assert_eq!(result.unwrap_err(), SubscribeError::NotConnected);
    }

    #[tokio::test]
    async fn test_link_loss_is_reported() {
        let transport = Arc::new(MockTransport::advertising("ESP32SB"));
        let (mut link, mut rx) = link(transport.clone());
        link.connect("ESP32SB").await.unwrap();
        let _ = states(&mut rx);

        transport.drop_link();
        assert!(!link.is_connected());

        let events: Vec<AppEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, AppEvent::LinkLost { .. })));

        let (service, _, command) = uuids();
        assert_eq!(
            link.write(service, command, "1|Empty").await.unwrap_err(),
            WriteError::NotConnected
        );
    }

    #[test]
    fn test_backoff_delays() {
        let policy = ReconnectPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
            multiplier: 2.0,
        };
        let delays: Vec<Option<Duration>> = (0..=6).map(|n| policy.delay_for(n)).collect();
        assert_eq!(
            delays,
            vec![
                None,
                Some(Duration::from_millis(500)),
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(3)),
                Some(Duration::from_secs(3)),
                None,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_retries_with_backoff() {
        let transport = Arc::new(MockTransport::advertising("ESP32SB"));
        let (mut link, mut rx) = link(transport.clone());
        link.connect("ESP32SB").await.unwrap();
        transport.drop_link();
        let _ = states(&mut rx);

        transport.connect_failures.store(2, Ordering::SeqCst);
        let policy = ReconnectPolicy::default();
        let handle = link.reconnect(&policy).await.unwrap();
        assert_eq!(handle.device_name, "ESP32SB");

        let attempts: Vec<u32> = states(&mut rx)
            .into_iter()
            .filter_map(|s| match s {
                LinkState::Reconnecting { attempt } => Some(attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert!(link.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up() {
        let transport = Arc::new(MockTransport::advertising("ESP32SB"));
        let (mut link, _rx) = link(transport.clone());
        link.connect("ESP32SB").await.unwrap();
        transport.drop_link();

        *transport.connect_error.lock().unwrap() = Some(TransportError::Gatt("gone".to_string()));
        let policy = ReconnectPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        let err = link.reconnect(&policy).await.unwrap_err();
        assert_eq!(err, ConnectError::GattFailure("gone".to_string()));
        // one initial connect plus three attempts
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 4);
        assert!(matches!(link.state(), LinkState::Disconnected { error: Some(_) }));
    }

    #[tokio::test]
    async fn test_disconnect_after_loss_forgets_device() {
        let transport = Arc::new(MockTransport::advertising("ESP32SB"));
        let (mut link, _rx) = link(transport.clone());
        link.connect("ESP32SB").await.unwrap();
        transport.drop_link();
        assert!(link.link_lost());

        link.disconnect().await;
        assert!(!link.link_lost());
        assert_eq!(link.state(), LinkState::Disconnected { error: None });
        assert!(link.reconnect(&ReconnectPolicy::default()).await.is_err());
        assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reconnect_without_history_fails() {
        let transport = Arc::new(MockTransport::advertising("ESP32SB"));
        let (mut link, _rx) = link(transport);
        assert!(link.reconnect(&ReconnectPolicy::default()).await.is_err());
    }
}
