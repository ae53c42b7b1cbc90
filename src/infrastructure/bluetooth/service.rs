//! Smart Box Service Module
//!
//! Main service that coordinates the link, the slot-table subscription and
//! command writes for the smart box.

use crate::domain::models::{AppEvent, LinkState, MessageSeverity, StatusMessage};
use crate::domain::settings::{Settings, SettingsService};
use crate::domain::slots::SlotTable;
use crate::infrastructure::bluetooth::{
    link::{
        CancelHandle, ConnectError, DeviceLink, LinkConfig, LinkHandle, ReconnectPolicy,
        Subscription, WriteError,
    },
    protocol::{self, CommandTarget, EncodeError, SlotCommand},
    transport::BleTransport,
};
use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Resolved GATT layout of the smart box
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartboxUuids {
    pub service: Uuid,
    pub slot_notify: Uuid,
    pub slot_command: Uuid,
    pub light: Uuid,
    pub scalar: Uuid,
}

impl SmartboxUuids {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            service: protocol::parse_uuid(&settings.ble_service_uuid)?,
            slot_notify: protocol::parse_uuid(&settings.ble_slot_notify_char_uuid)?,
            slot_command: protocol::parse_uuid(&settings.ble_slot_command_char_uuid)?,
            light: protocol::parse_uuid(&settings.ble_light_char_uuid)?,
            scalar: protocol::parse_uuid(protocol::SCALAR_CHAR_UUID)?,
        })
    }
}

fn link_config(settings: &Settings) -> LinkConfig {
    LinkConfig {
        connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
        mtu: settings.ble_mtu,
    }
}

fn reconnect_policy(settings: &Settings) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts: settings.reconnect_max_attempts,
        initial_delay: Duration::from_millis(settings.reconnect_initial_delay_ms),
        max_delay: Duration::from_millis(settings.reconnect_max_delay_ms),
        multiplier: settings.reconnect_multiplier,
    }
}

/// Main service coordinating all smart box operations
pub struct SmartboxService<T: BleTransport> {
    link: DeviceLink<T>,
    uuids: SmartboxUuids,
    slot_subscription: Option<Subscription>,
    /// Last table that decoded to something usable
    slots: Arc<Mutex<SlotTable>>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    settings: Arc<Mutex<SettingsService>>,
}

impl<T: BleTransport> SmartboxService<T> {
    /// Create a new smart box service
    pub fn new(
        transport: Arc<T>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        settings: Arc<Mutex<SettingsService>>,
    ) -> Result<Self> {
        let (uuids, config) = {
            let settings = settings
                .lock()
                .map_err(|_| anyhow::anyhow!("Lock error"))?;
            let s = settings.get();
            (SmartboxUuids::from_settings(s)?, link_config(s))
        };

        Ok(Self {
            link: DeviceLink::new(transport, config, event_sender.clone()),
            uuids,
            slot_subscription: None,
            slots: Arc::new(Mutex::new(SlotTable::new())),
            event_sender,
            settings,
        })
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Latest slot table snapshot
    pub fn slot_table(&self) -> SlotTable {
        self.slots.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.link.cancel_handle()
    }

    fn device_name(&self) -> Result<String> {
        let settings = self
            .settings
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))?;
        Ok(settings.get().device_name.clone())
    }

    fn auto_reconnect(&self) -> bool {
        self.settings
            .lock()
            .map(|s| s.get().auto_reconnect)
            .unwrap_or(false)
    }

    /// Connect to the configured device and subscribe to slot notifications
    pub async fn connect(&mut self) -> Result<LinkHandle> {
        let device_name = self.device_name()?;
        if let Some(handle) = self
            .link
            .handle()
            .filter(|h| h.device_name == device_name && self.slot_subscription.is_some())
        {
            debug!("Already connected to {}", device_name);
            return Ok(handle.clone());
        }
        self.send_log(
            &format!("Searching for {}...", device_name),
            MessageSeverity::Info,
        );

        match self.link.connect(&device_name).await {
            Ok(handle) => {
                self.on_connected().await;
                Ok(handle)
            }
            Err(e) => {
                self.report_connect_error(&e);
                Err(e.into())
            }
        }
    }

    /// Reconnect with backoff after the link was lost
    pub async fn reconnect(&mut self) -> Result<LinkHandle> {
        let policy = {
            let settings = self
                .settings
                .lock()
                .map_err(|_| anyhow::anyhow!("Lock error"))?;
            reconnect_policy(settings.get())
        };
        self.slot_subscription = None;
        self.send_log("Reconnecting...", MessageSeverity::Warning);

        match self.link.reconnect(&policy).await {
            Ok(handle) => {
                self.on_connected().await;
                Ok(handle)
            }
            Err(e) => {
                self.report_connect_error(&e);
                Err(e.into())
            }
        }
    }

    /// React to the peripheral dropping the link. Returns true when a
    /// reconnect brought it back.
    ///
    /// Events that arrive after a manual disconnect or a successful
    /// reconnect are ignored.
    pub async fn handle_link_lost(&mut self, reason: &str) -> bool {
        if !self.link.link_lost() {
            debug!("Ignoring stale link-lost event ({}): {}", self.link_state(), reason);
            return false;
        }
        warn!("Smart box link lost: {}", reason);
        self.slot_subscription = None;
        self.send_log(&format!("Disconnected: {}", reason), MessageSeverity::Warning);

        if !self.auto_reconnect() {
            return false;
        }
        self.reconnect().await.is_ok()
    }

    async fn on_connected(&mut self) {
        self.send_log("Connected!", MessageSeverity::Success);

        let slots = self.slots.clone();
        let sender = self.event_sender.clone();
        let log_raw = self
            .settings
            .lock()
            .map(|s| s.get().debug_raw_data_logging)
            .unwrap_or(false);
        let subscription = self
            .link
            .subscribe(self.uuids.service, self.uuids.slot_notify, move |raw| {
                apply_notification(&slots, &sender, &raw, log_raw);
            })
            .await;

        match subscription {
            Ok(subscription) => {
                info!("Slot notifications enabled");
                self.slot_subscription = Some(subscription);
            }
            Err(e) => {
                error!("Failed to subscribe to slot notifications: {}", e);
                self.send_log(
                    &format!("Connected (slot updates unavailable: {})", e),
                    MessageSeverity::Warning,
                );
            }
        }
    }

    fn report_connect_error(&self, e: &ConnectError) {
        let message = match e {
            ConnectError::PermissionDenied => "Bluetooth permissions are required".to_string(),
            ConnectError::AdapterOff => "Turn on Bluetooth".to_string(),
            ConnectError::Cancelled => "Connection cancelled".to_string(),
            other => format!("Connection error: {}", other),
        };
        self.send_log(&message, MessageSeverity::Error);
    }

    /// Disconnect from the smart box
    pub async fn disconnect(&mut self) {
        if let Some(subscription) = self.slot_subscription.take() {
            subscription.unsubscribe();
        }
        let was_connected = self.link.is_connected();
        self.link.disconnect().await;
        if was_connected {
            self.send_log("Disconnected from device", MessageSeverity::Info);
        }
    }

    /// Write a command to the characteristic it belongs to
    pub async fn send_command(&self, command: &SlotCommand) -> Result<(), WriteError> {
        let characteristic = match command.target() {
            CommandTarget::Slot => self.uuids.slot_command,
            CommandTarget::Light => self.uuids.light,
        };
        let payload = command.encode().map_err(|e| self.reject(e))?;

        match self
            .link
            .write(self.uuids.service, characteristic, &payload)
            .await
        {
            Ok(()) => {
                debug!("Sent {:?} for slot {}", payload, command.slot_id());
                self.send_log(&format!("Data sent: {}", payload), MessageSeverity::Success);
                Ok(())
            }
            Err(e) => {
                error!("Write of {:?} failed: {}", payload, e);
                self.send_log(&format!("Send failed: {}", e), MessageSeverity::Error);
                Err(e)
            }
        }
    }

    /// Store a car in a slot. Blank fields clear the slot.
    pub async fn set_slot(
        &self,
        id: &str,
        brand: &str,
        model: &str,
        color: &str,
        year: &str,
    ) -> Result<(), WriteError> {
        let command =
            SlotCommand::slot(id, brand, model, color, year).map_err(|e| self.reject(e))?;
        self.send_command(&command).await
    }

    pub async fn clear_slot(&self, id: &str) -> Result<(), WriteError> {
        self.send_command(&SlotCommand::Clear { id: id.to_string() })
            .await
    }

    /// Switch the LED of a slot
    pub async fn set_light(&self, id: &str, on: bool) -> Result<(), WriteError> {
        if self.slot_table().get(id).is_none() {
            warn!("Slot {} is not in the current table", id);
        }
        self.send_command(&SlotCommand::Light {
            id: id.to_string(),
            on,
        })
        .await
    }

    /// Scalar write understood by early firmware only
    pub async fn send_scalar(&self, value: i64) -> Result<(), WriteError> {
        self.link
            .write(self.uuids.service, self.uuids.scalar, &value.to_string())
            .await
    }

    fn reject(&self, e: EncodeError) -> WriteError {
        warn!("Refusing to send command: {}", e);
        self.send_log(&format!("Not sent: {}", e), MessageSeverity::Error);
        e.into()
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self
            .event_sender
            .send(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }
}

/// Decode a notification into the shared snapshot.
///
/// A notification with bad segments still replaces the table when at least
/// one slot decoded. If nothing usable came through, the previous snapshot
/// stays.
fn apply_notification(
    slots: &Mutex<SlotTable>,
    sender: &mpsc::UnboundedSender<AppEvent>,
    raw: &str,
    log_raw: bool,
) {
    if log_raw {
        debug!("Raw slot notification: {:?}", raw);
    }
    let decoded = protocol::decode_table(raw);
    for e in &decoded.errors {
        warn!("Slot table: {}", e);
    }

    if decoded.table.is_empty() && !decoded.is_clean() {
        warn!("Ignoring slot notification without valid slots: {:?}", raw);
        return;
    }

    debug!(
        "Slot table updated: {} slots, {} occupied",
        decoded.table.len(),
        decoded.table.occupied_count()
    );
    if let Ok(mut current) = slots.lock() {
        *current = decoded.table.clone();
    }
    let _ = sender.send(AppEvent::SlotTable(decoded.table));
}
