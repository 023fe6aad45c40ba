#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use bthost::btuuid::descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION;
use bthost::btuuid::{bluetooth_uuid_from_u16, characteristics, services};
use bthost::error::ErrorKind;
use bthost::keys::KeyMaterial;
use bthost::pairing::{IoCapability, Passkey};
use bthost::smp::SmpEvent;
use bthost::transport::{
    AdapterEvent, CharacteristicDefinition, DescriptorDefinition, LinkEvent, ServiceDefinition, Transport,
    TransportEvent,
};
use bthost::*;
use tokio::sync::mpsc;

pub const HANDLE: ConnHandle = ConnHandle(0x40);

pub const LEVEL_VALUE: u16 = 0x12;
pub const LEVEL_CCCD: u16 = 0x13;
pub const NAME_VALUE: u16 = 0x03;
pub const COMMAND_VALUE: u16 = 0x21;
pub const RESPONSE_VALUE: u16 = 0x23;
pub const RESPONSE_CCCD: u16 = 0x24;

pub fn command_service_uuid() -> Uuid {
    bluetooth_uuid_from_u16(0xfff0)
}

pub fn command_uuid() -> Uuid {
    bluetooth_uuid_from_u16(0xfff1)
}

pub fn response_uuid() -> Uuid {
    bluetooth_uuid_from_u16(0xfff2)
}

/// A transport request seen by [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    StartDiscovery,
    StopDiscovery,
    Connect(DeviceAddress),
    Disconnect(ConnHandle, HciStatus),
    DiscoverServices(ConnHandle),
    Read(u16),
    Write(u16, Vec<u8>, WriteType),
    SendNotification(u16, Vec<u8>),
    SendIndication(u16, Vec<u8>),
    SetSecurity(SecurityLevel, IoCapability),
    PasskeyReply(Option<Passkey>),
    NumericComparisonReply(bool),
    UploadKeys(DeviceAddress),
}

/// A scripted transport that records every request.
pub struct MockTransport {
    tx: mpsc::UnboundedSender<TransportEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    calls: Mutex<Vec<Call>>,
    powered: AtomicBool,
    services: Mutex<Vec<ServiceDefinition>>,
    links: Mutex<HashMap<ConnHandle, DeviceAddress>>,
    /// Value handle written -> (value handle notified, payload)
    replies: Mutex<HashMap<u16, (u16, Vec<u8>)>>,
    pub fail_connect: AtomicBool,
    pub fail_writes: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(MockTransport {
            tx,
            rx: Mutex::new(Some(rx)),
            calls: Mutex::new(Vec::new()),
            powered: AtomicBool::new(true),
            services: Mutex::new(default_services()),
            links: Mutex::new(HashMap::new()),
            replies: Mutex::new(HashMap::new()),
            fail_connect: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| f(c)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn set_services(&self, services: Vec<ServiceDefinition>) {
        *self.services.lock().unwrap() = services;
    }

    /// Answers writes of `written` with a notification of `notified`.
    pub fn reply_on_write(&self, written: u16, notified: u16, value: &[u8]) {
        self.replies.lock().unwrap().insert(written, (notified, value.to_vec()));
    }

    pub fn emit(&self, event: TransportEvent) {
        self.tx.send(event).unwrap();
    }

    pub fn link(&self, peer: DeviceAddress, event: LinkEvent) {
        self.emit(TransportEvent::Link { peer, event });
    }

    pub fn security(&self, peer: DeviceAddress, event: SmpEvent) {
        self.link(peer, LinkEvent::Security(event));
    }

    /// Reports the link to `peer` as established.
    pub fn complete_connect(&self, peer: DeviceAddress) {
        self.links.lock().unwrap().insert(HANDLE, peer);
        self.link(
            peer,
            LinkEvent::Connected {
                handle: HANDLE,
                status: HciStatus::SUCCESS,
            },
        );
    }

    pub fn notify(&self, peer: DeviceAddress, value_handle: u16, value: &[u8]) {
        self.link(
            peer,
            LinkEvent::Notification {
                value_handle,
                value: value.to_vec(),
                timestamp: Instant::now(),
            },
        );
    }

    pub fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::SeqCst);
        self.emit(TransportEvent::Adapter(AdapterEvent::SettingsChanged(self.settings())));
    }

    fn settings(&self) -> AdapterSettings {
        let powered = self.powered.load(Ordering::SeqCst);
        AdapterSettings::from_bits(if powered { 0x213 } else { 0x212 })
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn take_events(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        self.rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ErrorKind::AlreadyInProgress.into())
    }

    async fn adapter_settings(&self) -> Result<AdapterSettings> {
        Ok(self.settings())
    }

    async fn start_discovery(&self, _params: &DiscoveryParameters) -> Result<ScanType> {
        self.record(Call::StartDiscovery);
        Ok(ScanType::ActiveLe)
    }

    async fn stop_discovery(&self) -> Result<()> {
        self.record(Call::StopDiscovery);
        Ok(())
    }

    async fn connect(&self, peer: &DeviceAddress, _params: &ConnectionParameters) -> Result<()> {
        self.record(Call::Connect(*peer));
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(HciStatus::CONNECTION_ALREADY_EXISTS.into());
        }
        Ok(())
    }

    async fn disconnect(&self, handle: ConnHandle, reason: HciStatus) -> Result<()> {
        self.record(Call::Disconnect(handle, reason));
        if let Some(peer) = self.links.lock().unwrap().remove(&handle) {
            self.link(peer, LinkEvent::Disconnected { reason });
        }
        Ok(())
    }

    async fn discover_services(&self, handle: ConnHandle) -> Result<Vec<ServiceDefinition>> {
        self.record(Call::DiscoverServices(handle));
        Ok(self.services.lock().unwrap().clone())
    }

    async fn read(&self, _handle: ConnHandle, attribute: u16) -> Result<Vec<u8>> {
        self.record(Call::Read(attribute));
        Ok(vec![attribute as u8, 0x64])
    }

    async fn write(&self, handle: ConnHandle, attribute: u16, value: &[u8], write_type: WriteType) -> Result<()> {
        self.record(Call::Write(attribute, value.to_vec(), write_type));
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(HciStatus(0x08).into());
        }
        let reply = self.replies.lock().unwrap().get(&attribute).cloned();
        let peer = self.links.lock().unwrap().get(&handle).copied();
        if let (Some((value_handle, value)), Some(peer)) = (reply, peer) {
            self.notify(peer, value_handle, &value);
        }
        Ok(())
    }

    async fn send_notification(&self, _handle: ConnHandle, attribute: u16, value: &[u8]) -> Result<()> {
        self.record(Call::SendNotification(attribute, value.to_vec()));
        Ok(())
    }

    async fn send_indication(&self, _handle: ConnHandle, attribute: u16, value: &[u8]) -> Result<()> {
        self.record(Call::SendIndication(attribute, value.to_vec()));
        Ok(())
    }

    async fn set_security(&self, _handle: ConnHandle, level: SecurityLevel, io_capability: IoCapability) -> Result<()> {
        self.record(Call::SetSecurity(level, io_capability));
        Ok(())
    }

    async fn passkey_reply(&self, _handle: ConnHandle, passkey: Option<Passkey>) -> Result<()> {
        self.record(Call::PasskeyReply(passkey));
        Ok(())
    }

    async fn numeric_comparison_reply(&self, _handle: ConnHandle, accept: bool) -> Result<()> {
        self.record(Call::NumericComparisonReply(accept));
        Ok(())
    }

    async fn upload_keys(&self, peer: &DeviceAddress, _keys: &KeyMaterial) -> Result<()> {
        self.record(Call::UploadKeys(*peer));
        Ok(())
    }
}

fn characteristic(uuid: Uuid, value_handle: u16, properties: u32, cccd: Option<u16>) -> CharacteristicDefinition {
    CharacteristicDefinition {
        uuid,
        declaration_handle: value_handle - 1,
        value_handle,
        properties: CharacteristicProperties::from_bits(properties),
        descriptors: cccd
            .map(|handle| DescriptorDefinition {
                uuid: CLIENT_CHARACTERISTIC_CONFIGURATION,
                handle,
            })
            .into_iter()
            .collect(),
    }
}

/// Generic access (device name, read only), battery (level, read + notify) and a command service.
pub fn default_services() -> Vec<ServiceDefinition> {
    vec![
        ServiceDefinition {
            uuid: services::GENERIC_ACCESS,
            primary: true,
            start_handle: 0x01,
            end_handle: 0x03,
            characteristics: vec![characteristic(characteristics::DEVICE_NAME, NAME_VALUE, 0x02, None)],
        },
        ServiceDefinition {
            uuid: services::BATTERY,
            primary: true,
            start_handle: 0x10,
            end_handle: 0x13,
            characteristics: vec![characteristic(
                characteristics::BATTERY_LEVEL,
                LEVEL_VALUE,
                0x12,
                Some(LEVEL_CCCD),
            )],
        },
        ServiceDefinition {
            uuid: command_service_uuid(),
            primary: true,
            start_handle: 0x20,
            end_handle: 0x24,
            characteristics: vec![
                characteristic(command_uuid(), COMMAND_VALUE, 0x0c, None),
                characteristic(response_uuid(), RESPONSE_VALUE, 0x10, Some(RESPONSE_CCCD)),
            ],
        },
    ]
}

pub fn peer(n: u8) -> DeviceAddress {
    DeviceAddress::new(Address::new([0xc0, 0xff, 0xee, 0x00, 0x00, n]), AddressType::LeRandom)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn open(mock: &Arc<MockTransport>) -> Adapter {
    init_tracing();
    Adapter::builder(mock.clone()).open().await.unwrap()
}

/// Yields until `f` holds, failing the test if it never does.
pub async fn eventually(mut f: impl FnMut() -> bool) {
    for i in 0..2000 {
        if f() {
            return;
        }
        // Work on other runtime threads may need real time.
        if i < 1000 {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
    }
    panic!("condition not reached");
}

/// Connects `peer` and waits until the device is ready.
pub async fn connect_ready(adapter: &Adapter, mock: &MockTransport, peer: DeviceAddress) -> Device {
    let device = adapter.open_device(&peer);
    device.connect().await.unwrap();
    mock.complete_connect(peer);
    eventually(|| device.state() == DeviceState::Ready).await;
    device
}

/// A listener recording every value it receives.
#[derive(Default)]
pub struct Recorder(pub Mutex<Vec<(u16, Vec<u8>)>>);

impl Recorder {
    pub fn values(&self) -> Vec<(u16, Vec<u8>)> {
        self.0.lock().unwrap().clone()
    }
}

impl CharacteristicListener for Recorder {
    fn notification_received(&self, characteristic: &Characteristic, value: &[u8], _timestamp: Instant) {
        self.0
            .lock()
            .unwrap()
            .push((characteristic.value_handle(), value.to_vec()));
    }
}
