//! WinRT BLE Transport
//!
//! [`BleTransport`] on top of the Windows Bluetooth LE / GATT APIs.

use crate::infrastructure::bluetooth::transport::{
    BleTransport, DisconnectListener, ListenerId, PeripheralId, TransportError, ValueListener,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattSession, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{
    BluetoothAdapter, BluetoothConnectionStatus, BluetoothLEDevice,
};
use windows::Devices::Enumeration::DeviceAccessStatus;
use windows::Devices::Radios::RadioState;
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

impl From<windows::core::Error> for TransportError {
    fn from(e: windows::core::Error) -> Self {
        TransportError::Gatt(e.to_string())
    }
}

struct Peripheral {
    device: BluetoothLEDevice,
    // Keeps the connection open while held
    session: Option<GattSession>,
    characteristics: HashMap<(Uuid, Uuid), GattCharacteristic>,
}

enum Registration {
    Value(GattCharacteristic, i64),
    Status(BluetoothLEDevice, i64),
}

/// WinRT-backed transport
#[derive(Default)]
pub struct WinRtTransport {
    watcher: Mutex<Option<BluetoothLEAdvertisementWatcher>>,
    peripherals: Mutex<HashMap<PeripheralId, Peripheral>>,
    registrations: Mutex<HashMap<ListenerId, Registration>>,
    next_id: AtomicU64,
}

fn to_uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn parse_address(peripheral: &PeripheralId) -> Result<u64, TransportError> {
    u64::from_str_radix(peripheral, 16)
        .map_err(|_| TransportError::Gatt(format!("Invalid peripheral id {}", peripheral)))
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

fn check_status(status: GattCommunicationStatus, what: &str) -> Result<(), TransportError> {
    if status == GattCommunicationStatus::Success {
        Ok(())
    } else {
        Err(TransportError::Gatt(format!("{} failed: {:?}", what, status)))
    }
}

impl WinRtTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn lock_peripherals(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<PeripheralId, Peripheral>>, TransportError> {
        self.peripherals
            .lock()
            .map_err(|_| TransportError::Gatt("Lock error".to_string()))
    }

    fn characteristic(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<GattCharacteristic, TransportError> {
        let peripherals = self.lock_peripherals()?;
        let entry = peripherals
            .get(peripheral)
            .ok_or(TransportError::DeviceDisconnected)?;
        entry
            .characteristics
            .get(&(service, characteristic))
            .cloned()
            .ok_or_else(|| {
                TransportError::Gatt(format!("Characteristic {} not found", characteristic))
            })
    }

    async fn ensure_radio_on(&self) -> Result<(), TransportError> {
        let adapter = BluetoothAdapter::GetDefaultAsync()?.await?;
        let radio = adapter.GetRadioAsync()?.await?;
        if radio.State()? != RadioState::On {
            return Err(TransportError::AdapterOff);
        }
        Ok(())
    }
}

#[async_trait]
impl BleTransport for WinRtTransport {
    async fn scan_for(&self, name: &str) -> Result<PeripheralId, TransportError> {
        self.stop_scan().await;
        self.ensure_radio_on().await?;

        info!("Starting BLE scan for {:?}", name);
        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let (found_tx, mut found_rx) = mpsc::unbounded_channel();
        let target = name.to_string();
        {
            let handler = TypedEventHandler::new(
                move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                      args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                    if let Some(args) = args.as_ref() {
                        let local_name = args.Advertisement()?.LocalName()?.to_string();
                        if local_name == target {
                            let _ = found_tx.send(args.BluetoothAddress()?);
                        }
                    }
                    Ok(())
                },
            );

            watcher.Received(&handler)?;
        }
        watcher.Start()?;
        if let Ok(mut slot) = self.watcher.lock() {
            *slot = Some(watcher);
        }

        let address = found_rx
            .recv()
            .await
            .ok_or_else(|| TransportError::Gatt("Scan aborted".to_string()))?;
        Ok(format!("{:012X}", address))
    }

    async fn stop_scan(&self) {
        let watcher = self.watcher.lock().ok().and_then(|mut w| w.take());
        if let Some(watcher) = watcher {
            info!("Stopping BLE scan...");
            if let Err(e) = watcher.Stop() {
                warn!("Failed to stop watcher: {}", e);
            }
        }
    }

    async fn connect(&self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let address = parse_address(peripheral)?;
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await?;
        info!("Device connected: {:?}", device.Name()?);

        let access = device.RequestAccessAsync()?.await?;
        match access {
            DeviceAccessStatus::DeniedByUser | DeviceAccessStatus::DeniedBySystem => {
                return Err(TransportError::PermissionDenied)
            }
            other => debug!("Device access status: {:?}", other),
        }

        let session = match GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId()?)?.await {
            Ok(session) => {
                session.SetMaintainConnection(true)?;
                Some(session)
            }
            Err(e) => {
                warn!("Failed to create GattSession, continuing anyway: {}", e);
                None
            }
        };

        self.lock_peripherals()?.insert(
            peripheral.clone(),
            Peripheral {
                device,
                session,
                characteristics: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn request_mtu(&self, peripheral: &PeripheralId, mtu: u16) -> Result<u16, TransportError> {
        // Windows negotiates the MTU itself; report what the session ended up with
        let peripherals = self.lock_peripherals()?;
        let entry = peripherals
            .get(peripheral)
            .ok_or(TransportError::DeviceDisconnected)?;
        let session = entry
            .session
            .as_ref()
            .ok_or_else(|| TransportError::Gatt("No GATT session".to_string()))?;
        let negotiated = session.MaxPduSize()?;
        debug!("Requested MTU {}, negotiated {}", mtu, negotiated);
        Ok(negotiated)
    }

    async fn discover(&self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let device = {
            let peripherals = self.lock_peripherals()?;
            peripherals
                .get(peripheral)
                .ok_or(TransportError::DeviceDisconnected)?
                .device
                .clone()
        };

        let services_result = device.GetGattServicesAsync()?.await?;
        check_status(services_result.Status()?, "Service discovery")?;

        let mut found = HashMap::new();
        let services = services_result.Services()?;
        for i in 0..services.Size()? {
            let service = services.GetAt(i)?;
            let service_uuid = to_uuid(service.Uuid()?);

            let chars_result = service.GetCharacteristicsAsync()?.await?;
            if chars_result.Status()? != GattCommunicationStatus::Success {
                warn!("Skipping service {}: {:?}", service_uuid, chars_result.Status()?);
                continue;
            }
            let characteristics = chars_result.Characteristics()?;
            for j in 0..characteristics.Size()? {
                let c = characteristics.GetAt(j)?;
                found.insert((service_uuid, to_uuid(c.Uuid()?)), c);
            }
        }
        info!("Discovered {} characteristics", found.len());

        if let Some(entry) = self.lock_peripherals()?.get_mut(peripheral) {
            entry.characteristics = found;
        }
        Ok(())
    }

    async fn cancel_connection(&self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let entry = self.lock_peripherals()?.remove(peripheral);
        if let Some(entry) = entry {
            if let Some(session) = entry.session {
                let _ = session.Close();
            }
            entry.device.Close()?;
            info!("Disconnected from {}", peripheral);
        }
        Ok(())
    }

    fn on_disconnected(
        &self,
        peripheral: &PeripheralId,
        listener: DisconnectListener,
    ) -> Result<ListenerId, TransportError> {
        let device = {
            let peripherals = self.lock_peripherals()?;
            peripherals
                .get(peripheral)
                .ok_or(TransportError::DeviceDisconnected)?
                .device
                .clone()
        };

        let handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        listener(None);
                    }
                }
                Ok(())
            });
        let token = device.ConnectionStatusChanged(&handler)?;

        let id = self.next_listener_id();
        if let Ok(mut registrations) = self.registrations.lock() {
            registrations.insert(id, Registration::Status(device, token));
        }
        Ok(id)
    }

    async fn monitor(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        listener: ValueListener,
    ) -> Result<ListenerId, TransportError> {
        let gatt_char = self.characteristic(peripheral, service, characteristic)?;

        let mut last_status = GattCommunicationStatus::Unreachable;
        for attempt in 1..=3 {
            last_status = gatt_char
                .WriteClientCharacteristicConfigurationDescriptorAsync(
                    GattClientCharacteristicConfigurationDescriptorValue::Notify,
                )?
                .await?;
            if last_status == GattCommunicationStatus::Success {
                break;
            }
            warn!(
                "Notification enable attempt {} failed. Status: {:?}",
                attempt, last_status
            );
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
        check_status(last_status, "Enabling notifications")?;

        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    match read_buffer(&args.CharacteristicValue()?) {
                        Ok(bytes) => listener(Ok(BASE64.encode(bytes))),
                        Err(e) => listener(Err(e.into())),
                    }
                }
                Ok(())
            },
        );
        let token = gatt_char.ValueChanged(&handler)?;

        let id = self.next_listener_id();
        if let Ok(mut registrations) = self.registrations.lock() {
            registrations.insert(id, Registration::Value(gatt_char, token));
        }
        Ok(id)
    }

    fn remove_listener(&self, listener: ListenerId) {
        let registration = self
            .registrations
            .lock()
            .ok()
            .and_then(|mut r| r.remove(&listener));
        let result = match registration {
            Some(Registration::Value(characteristic, token)) => {
                characteristic.RemoveValueChanged(token)
            }
            Some(Registration::Status(device, token)) => device.RemoveConnectionStatusChanged(token),
            None => Ok(()),
        };
        if let Err(e) = result {
            debug!("Failed to remove listener {:?}: {}", listener, e);
        }
    }

    async fn write_with_response(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        value: &str,
    ) -> Result<(), TransportError> {
        let bytes = BASE64
            .decode(value)
            .map_err(|e| TransportError::Gatt(format!("Invalid value: {}", e)))?;
        let gatt_char = self.characteristic(peripheral, service, characteristic)?;

        let writer = DataWriter::new()?;
        writer.WriteBytes(&bytes)?;
        let buffer = writer.DetachBuffer()?;

        let status = gatt_char
            .WriteValueWithOptionAsync(&buffer, GattWriteOption::WriteWithResponse)?
            .await?;
        check_status(status, "Write")
    }
}
