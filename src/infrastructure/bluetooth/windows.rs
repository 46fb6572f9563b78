//! WinRT Backend
//!
//! [`LinkBackend`] on top of the Windows Runtime Bluetooth LE APIs.
//!
//! WinRT objects live on a dedicated worker thread with its own
//! current-thread runtime. The backend only forwards commands to it, so no
//! call on the application loop ever waits on the radio. Results and
//! notifications come back as [`LinkEvent`]s.

use crate::domain::errors::TransportError;
use crate::domain::models::PeripheralHandle;
use crate::infrastructure::bluetooth::backend::{LinkBackend, LinkEvent, LinkEventSender};
use crate::infrastructure::bluetooth::protocol::{
    ChannelInfo, ChannelProperties, ServiceInfo, WriteMode,
};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use windows::core::{GUID, HRESULT};
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCharacteristicProperties,
    GattClientCharacteristicConfigurationDescriptorValue, GattCommunicationStatus,
    GattDeviceService, GattSession, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Devices::Radios::{Radio, RadioKind, RadioState};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};

const E_INVALIDARG: HRESULT = HRESULT(0x8007_0057_u32 as i32);
const SUBSCRIBE_ATTEMPTS: u32 = 3;
const SUBSCRIBE_RETRY_DELAY_MS: u64 = 500;

fn to_uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn hresult(e: &windows::core::Error) -> i32 {
    e.code().0
}

#[derive(Debug)]
enum WinCommand {
    StartScan,
    StopScan,
    Connect(PeripheralHandle),
    DiscoverCapabilities,
    EnableNotifications { channel: Uuid, indicate: bool },
    Write {
        channel: Uuid,
        payload: Vec<u8>,
        mode: WriteMode,
    },
    Close,
}

pub struct WinRtBackend {
    commands: mpsc::UnboundedSender<WinCommand>,
    radio_on: Arc<AtomicBool>,
}

impl WinRtBackend {
    /// Spawn the worker thread and wait until the radio state is known.
    pub async fn start(events: LinkEventSender) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let radio_on = Arc::new(AtomicBool::new(false));
        let worker_radio = radio_on.clone();

        std::thread::Builder::new()
            .name("bluetooth".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let mut worker = Worker::new(events);
                    // Keep the radio alive so its state handler stays registered.
                    let _radio = match watch_radio(worker_radio).await {
                        Ok(radio) => radio,
                        Err(e) => {
                            warn!("Could not query Bluetooth radio: {}", e);
                            None
                        }
                    };
                    let _ = ready_tx.send(());

                    while let Some(command) = command_rx.recv().await {
                        worker.handle(command).await;
                    }
                    worker.close();
                    debug!("Bluetooth worker stopped");
                });
            })?;

        ready_rx
            .await
            .map_err(|_| anyhow::anyhow!("Bluetooth worker exited during startup"))?;

        Ok(Self {
            commands: command_tx,
            radio_on,
        })
    }

    fn submit(&self, command: WinCommand) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::Backend("Bluetooth worker is not running".to_string()))
    }
}

impl LinkBackend for WinRtBackend {
    fn radio_enabled(&self) -> bool {
        self.radio_on.load(Ordering::SeqCst)
    }

    fn start_scan(&mut self) -> Result<(), TransportError> {
        self.submit(WinCommand::StartScan)
    }

    fn stop_scan(&mut self) {
        let _ = self.submit(WinCommand::StopScan);
    }

    fn connect(&mut self, peripheral: &PeripheralHandle) -> Result<(), TransportError> {
        self.submit(WinCommand::Connect(peripheral.clone()))
    }

    fn discover_capabilities(&mut self) -> Result<(), TransportError> {
        self.submit(WinCommand::DiscoverCapabilities)
    }

    fn enable_notifications(
        &mut self,
        channel: &ChannelInfo,
        indicate: bool,
    ) -> Result<(), TransportError> {
        self.submit(WinCommand::EnableNotifications {
            channel: channel.uuid,
            indicate,
        })
    }

    fn write(
        &mut self,
        channel: &ChannelInfo,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        self.submit(WinCommand::Write {
            channel: channel.uuid,
            payload: payload.to_vec(),
            mode,
        })
    }

    fn close(&mut self) {
        let _ = self.submit(WinCommand::Close);
    }
}

/// Find the Bluetooth radio and mirror its on/off state into `radio_on`.
async fn watch_radio(radio_on: Arc<AtomicBool>) -> Result<Option<Radio>> {
    let radios = Radio::GetRadiosAsync()?.await?;
    for i in 0..radios.Size()? {
        let radio = radios.GetAt(i)?;
        if radio.Kind()? != RadioKind::Bluetooth {
            continue;
        }

        let on = radio.State()? == RadioState::On;
        info!("Bluetooth radio {:?} is {}", radio.Name()?.to_string(), if on { "on" } else { "off" });
        radio_on.store(on, Ordering::SeqCst);

        let flag = radio_on.clone();
        radio.StateChanged(&TypedEventHandler::new(
            move |radio: windows::core::Ref<Radio>, _| {
                if let Some(radio) = radio.as_ref() {
                    let on = radio.State()? == RadioState::On;
                    info!("Bluetooth radio turned {}", if on { "on" } else { "off" });
                    flag.store(on, Ordering::SeqCst);
                }
                Ok(())
            },
        ))?;
        return Ok(Some(radio));
    }

    warn!("No Bluetooth radio found");
    Ok(None)
}

/// Owns every WinRT object of the current scan or link.
struct Worker {
    events: LinkEventSender,
    watcher: Option<BluetoothLEAdvertisementWatcher>,
    device: Option<BluetoothLEDevice>,
    session: Option<GattSession>,
    characteristics: HashMap<Uuid, GattCharacteristic>,
    /// Bumped on close so callbacks from a released link go quiet.
    generation: Arc<AtomicU64>,
}

impl Worker {
    fn new(events: LinkEventSender) -> Self {
        Self {
            events,
            watcher: None,
            device: None,
            session: None,
            characteristics: HashMap::new(),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    async fn handle(&mut self, command: WinCommand) {
        debug!("Bluetooth command: {:?}", command);
        match command {
            WinCommand::StartScan => {
                if let Err(e) = self.start_scan() {
                    error!("Failed to start scan: {}", e);
                }
            }
            WinCommand::StopScan => self.stop_scan(),
            WinCommand::Connect(peripheral) => {
                if let Err(e) = self.connect(&peripheral).await {
                    error!("Connection to {} failed: {}", peripheral.name, e);
                    self.close();
                    self.emit(LinkEvent::ConnectFailed(hresult(&e)));
                }
            }
            WinCommand::DiscoverCapabilities => match self.discover().await {
                Ok(services) => self.emit(LinkEvent::CapabilitiesDiscovered(services)),
                Err(code) => self.emit(LinkEvent::DiscoveryFailed(code)),
            },
            WinCommand::EnableNotifications { channel, indicate } => {
                self.enable_notifications(channel, indicate).await
            }
            WinCommand::Write {
                channel,
                payload,
                mode,
            } => {
                if let Err(e) = self.write(channel, &payload, mode).await {
                    warn!("Write to {} failed: {}", channel, e);
                }
            }
            WinCommand::Close => self.close(),
        }
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn start_scan(&mut self) -> windows::core::Result<()> {
        self.stop_scan();
        info!("Starting BLE scan");

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let sender = self.events.clone();
        let seen = Mutex::new(HashSet::new());
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    let address = args.BluetoothAddress()?;
                    let first_sighting = seen
                        .lock()
                        .map(|mut seen| seen.insert(address))
                        .unwrap_or(false);
                    if !name.is_empty() && first_sighting {
                        let _ = sender.send(LinkEvent::Discovered(PeripheralHandle {
                            id: format!("{:012X}", address),
                            name,
                        }));
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&handler)?;
        watcher.Start()?;
        self.watcher = Some(watcher);
        Ok(())
    }

    fn stop_scan(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            info!("Stopping BLE scan");
            if let Err(e) = watcher.Stop() {
                warn!("Failed to stop scan: {}", e);
            }
        }
    }

    async fn connect(&mut self, peripheral: &PeripheralHandle) -> windows::core::Result<()> {
        let address = u64::from_str_radix(&peripheral.id, 16)
            .map_err(|_| windows::core::Error::from(E_INVALIDARG))?;
        info!("Connecting to {} ({:#X})", peripheral.name, address);

        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await?;

        // Holding a session with MaintainConnection keeps Windows from
        // dropping the link between GATT operations.
        let session = GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId()?)?.await?;
        session.SetMaintainConnection(true)?;

        let sender = self.events.clone();
        let generation = self.generation.clone();
        let expected = generation.load(Ordering::SeqCst);
        device.ConnectionStatusChanged(&TypedEventHandler::new(
            move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    let status = dev.ConnectionStatus()?;
                    if status == BluetoothConnectionStatus::Disconnected
                        && generation.load(Ordering::SeqCst) == expected
                    {
                        let _ = sender.send(LinkEvent::Disconnected);
                    }
                }
                Ok(())
            },
        ))?;

        self.device = Some(device);
        self.session = Some(session);
        self.emit(LinkEvent::Connected);
        Ok(())
    }

    /// Enumerate services and characteristics. Errors carry the platform code.
    async fn discover(&mut self) -> Result<Vec<ServiceInfo>, i32> {
        let Some(device) = self.device.clone() else {
            warn!("Service discovery requested without a device");
            return Err(-1);
        };

        let result = device
            .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)
            .map_err(|e| hresult(&e))?
            .await
            .map_err(|e| hresult(&e))?;
        let status = result.Status().map_err(|e| hresult(&e))?;
        if status != GattCommunicationStatus::Success {
            error!("Failed to get GATT services: {:?}", status);
            return Err(status.0);
        }

        let services = result.Services().map_err(|e| hresult(&e))?;
        let count = services.Size().map_err(|e| hresult(&e))?;
        info!("Found {} service(s)", count);

        self.characteristics.clear();
        let mut discovered = Vec::new();
        for i in 0..count {
            let service = services.GetAt(i).map_err(|e| hresult(&e))?;
            match self.service_info(&service).await {
                Ok(info) => discovered.push(info),
                Err(e) => warn!("Skipping service {}: {}", i, e),
            }
        }
        Ok(discovered)
    }

    async fn service_info(
        &mut self,
        service: &GattDeviceService,
    ) -> windows::core::Result<ServiceInfo> {
        let uuid = to_uuid(service.Uuid()?);
        let result = service
            .GetCharacteristicsWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        let status = result.Status()?;
        if status != GattCommunicationStatus::Success {
            debug!("Characteristics of {} unavailable: {:?}", uuid, status);
            return Ok(ServiceInfo {
                uuid,
                channels: Vec::new(),
            });
        }

        let characteristics = result.Characteristics()?;
        let mut channels = Vec::new();
        for i in 0..characteristics.Size()? {
            let c = characteristics.GetAt(i)?;
            let channel_uuid = to_uuid(c.Uuid()?);
            let props = c.CharacteristicProperties()?;
            let has = |flag: GattCharacteristicProperties| props.0 & flag.0 != 0;

            channels.push(ChannelInfo {
                uuid: channel_uuid,
                properties: ChannelProperties {
                    write: has(GattCharacteristicProperties::Write),
                    write_without_response: has(GattCharacteristicProperties::WriteWithoutResponse),
                    notify: has(GattCharacteristicProperties::Notify),
                    indicate: has(GattCharacteristicProperties::Indicate),
                },
            });
            self.characteristics.insert(channel_uuid, c);
        }

        Ok(ServiceInfo { uuid, channels })
    }

    async fn enable_notifications(&mut self, channel: Uuid, indicate: bool) {
        let Some(characteristic) = self.characteristics.get(&channel).cloned() else {
            warn!("Cannot subscribe to unknown channel {}", channel);
            return;
        };

        let sender = self.events.clone();
        let generation = self.generation.clone();
        let expected = generation.load(Ordering::SeqCst);
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let value = args.CharacteristicValue()?;
                    let reader = DataReader::FromBuffer(&value)?;
                    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
                    reader.ReadBytes(&mut bytes)?;
                    if generation.load(Ordering::SeqCst) == expected {
                        let _ = sender.send(LinkEvent::Notification(bytes));
                    }
                }
                Ok(())
            },
        );
        if let Err(e) = characteristic.ValueChanged(&handler) {
            warn!("Could not register value handler on {}: {}", channel, e);
            return;
        }

        let value = if indicate {
            GattClientCharacteristicConfigurationDescriptorValue::Indicate
        } else {
            GattClientCharacteristicConfigurationDescriptorValue::Notify
        };

        for attempt in 1..=SUBSCRIBE_ATTEMPTS {
            let status = match characteristic.WriteClientCharacteristicConfigurationDescriptorAsync(value) {
                Ok(op) => op.await,
                Err(e) => Err(e),
            };
            match status {
                Ok(status) if status == GattCommunicationStatus::Success => {
                    info!(
                        "Subscribed to {} ({})",
                        channel,
                        if indicate { "indicate" } else { "notify" }
                    );
                    return;
                }
                Ok(status) => warn!(
                    "Subscription to {} returned {:?} (attempt {})",
                    channel, status, attempt
                ),
                Err(e) => warn!(
                    "Subscription to {} failed (attempt {}): {}",
                    channel, attempt, e
                ),
            }
            if attempt < SUBSCRIBE_ATTEMPTS {
                tokio::time::sleep(tokio::time::Duration::from_millis(SUBSCRIBE_RETRY_DELAY_MS))
                    .await;
            }
        }
        error!(
            "Failed to subscribe to {} after {} attempts",
            channel, SUBSCRIBE_ATTEMPTS
        );
    }

    async fn write(
        &mut self,
        channel: Uuid,
        payload: &[u8],
        mode: WriteMode,
    ) -> windows::core::Result<()> {
        let Some(characteristic) = self.characteristics.get(&channel) else {
            warn!("Cannot write to unknown channel {}", channel);
            return Ok(());
        };

        let writer = DataWriter::new()?;
        writer.WriteBytes(payload)?;
        let buffer = writer.DetachBuffer()?;

        let option = match mode {
            WriteMode::WithResponse => GattWriteOption::WriteWithResponse,
            WriteMode::WithoutResponse => GattWriteOption::WriteWithoutResponse,
        };
        let status = characteristic
            .WriteValueWithOptionAsync(&buffer, option)?
            .await?;
        if status != GattCommunicationStatus::Success {
            warn!("Write to {} returned {:?}", channel, status);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.stop_scan();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.characteristics.clear();
        if let Some(session) = self.session.take() {
            let _ = session.Close();
        }
        if let Some(device) = self.device.take() {
            info!("Closing device");
            let _ = device.Close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::UART_SERVICE_UUID;

    #[test]
    fn test_guid_conversion() {
        let guid = GUID::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
        assert_eq!(guid.data1, 0x6e400001);
        assert_eq!(to_uuid(guid), UART_SERVICE_UUID);
    }
}
