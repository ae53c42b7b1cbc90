//! In-memory [`BleTransport`] used by the link and service tests.

use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, DisconnectListener, ListenerId, PeripheralId, TransportError, ValueListener,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct MockTransport {
    /// Names currently advertising; scans for anything else never finish
    pub advertised: Mutex<Vec<String>>,
    pub scan_error: Mutex<Option<TransportError>>,
    pub connect_error: Mutex<Option<TransportError>>,
    /// Number of upcoming connect calls that fail with a GATT error
    pub connect_failures: AtomicU32,
    pub mtu_error: Mutex<Option<TransportError>>,
    pub write_error: Mutex<Option<TransportError>>,

    pub scan_calls: AtomicU32,
    pub stop_scan_calls: AtomicU32,
    pub connect_calls: AtomicU32,
    pub cancel_calls: AtomicU32,
    pub writes: Mutex<Vec<(Uuid, Uuid, String)>>,

    value_listeners: Mutex<HashMap<ListenerId, (Uuid, ValueListener)>>,
    disconnect_listeners: Mutex<HashMap<ListenerId, DisconnectListener>>,
    next_id: AtomicU64,
}

impl MockTransport {
    pub fn advertising(name: &str) -> Self {
        let mock = Self::default();
        mock.advertised.lock().unwrap().push(name.to_string());
        mock
    }

    /// Notify every listener of `characteristic` with a text payload
    pub fn notify(&self, characteristic: Uuid, text: &str) {
        self.notify_raw(characteristic, &protocol::encode_value(text));
    }

    /// Notify with an already encoded value
    pub fn notify_raw(&self, characteristic: Uuid, value: &str) {
        let listeners = self.value_listeners.lock().unwrap();
        for (uuid, listener) in listeners.values() {
            if *uuid == characteristic {
                listener(Ok(value.to_string()));
            }
        }
    }

    /// Simulate the peripheral dropping the link
    pub fn drop_link(&self) {
        let listeners = self.disconnect_listeners.lock().unwrap();
        for listener in listeners.values() {
            listener(Some(TransportError::DeviceDisconnected));
        }
    }

    pub fn value_listener_count(&self) -> usize {
        self.value_listeners.lock().unwrap().len()
    }

    pub fn disconnect_listener_count(&self) -> usize {
        self.disconnect_listeners.lock().unwrap().len()
    }

    pub fn written(&self) -> Vec<(Uuid, Uuid, String)> {
        self.writes.lock().unwrap().clone()
    }

    fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn scan_for(&self, name: &str) -> Result<PeripheralId, TransportError> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.scan_error.lock().unwrap().clone() {
            return Err(e);
        }
        let seen = self.advertised.lock().unwrap().iter().any(|n| n == name);
        if !seen {
            std::future::pending::<()>().await;
        }
        Ok(format!("mock:{}", name))
    }

    async fn stop_scan(&self) {
        self.stop_scan_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn connect(&self, _peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.connect_error.lock().unwrap().clone() {
            return Err(e);
        }
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Gatt("connection refused".to_string()));
        }
        Ok(())
    }

    async fn request_mtu(&self, _peripheral: &PeripheralId, mtu: u16) -> Result<u16, TransportError> {
        match self.mtu_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(mtu.min(247)),
        }
    }

    async fn discover(&self, _peripheral: &PeripheralId) -> Result<(), TransportError> {
        Ok(())
    }

    async fn cancel_connection(&self, _peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.value_listeners.lock().unwrap().clear();
        self.disconnect_listeners.lock().unwrap().clear();
        Ok(())
    }

    fn on_disconnected(
        &self,
        _peripheral: &PeripheralId,
        listener: DisconnectListener,
    ) -> Result<ListenerId, TransportError> {
        let id = self.next_listener_id();
        self.disconnect_listeners.lock().unwrap().insert(id, listener);
        Ok(id)
    }

    async fn monitor(
        &self,
        _peripheral: &PeripheralId,
        _service: Uuid,
        characteristic: Uuid,
        listener: ValueListener,
    ) -> Result<ListenerId, TransportError> {
        let id = self.next_listener_id();
        self.value_listeners
            .lock()
            .unwrap()
            .insert(id, (characteristic, listener));
        Ok(id)
    }

    fn remove_listener(&self, listener: ListenerId) {
        self.value_listeners.lock().unwrap().remove(&listener);
        self.disconnect_listeners.lock().unwrap().remove(&listener);
    }

    async fn write_with_response(
        &self,
        _peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        value: &str,
    ) -> Result<(), TransportError> {
        if let Some(e) = self.write_error.lock().unwrap().clone() {
            return Err(e);
        }
        self.writes
            .lock()
            .unwrap()
            .push((service, characteristic, value.to_string()));
        Ok(())
    }
}
