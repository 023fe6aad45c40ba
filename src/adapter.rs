//! The local adapter: discovery, the device table and transport event routing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::AdapterConfig;
use crate::device::{DeviceInner, DeviceState};
use crate::error::ErrorKind;
use crate::keys::{KeyStore, MemoryKeyStore};
use crate::pairing::PairingAgent;
use crate::policy::{SecurityPolicy, SecurityRegistry};
use crate::smp::{PairingMode, PairingState};
use crate::transport::{AdapterEvent, DeviceReport, LinkEvent, Transport, TransportEvent};
use crate::util::{call_guarded, WorkerSet};
use crate::{
    AdapterSettings, ConnHandle, Device, DeviceAddress, DiscoveryParameters, DiscoveryPolicy, Error, HciStatus, Result,
    ScanType, SecurityLevel,
};

/// Collaborators shared by an adapter and all of its devices.
pub(crate) struct HostContext {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) key_store: Arc<dyn KeyStore>,
    pub(crate) policy: Arc<dyn SecurityPolicy>,
    pub(crate) agent: Option<Arc<dyn PairingAgent>>,
    pub(crate) config: AdapterConfig,
}

/// Receives adapter and device lifecycle events.
///
/// Callbacks run on the engine's event tasks and must not block. A panicking callback is logged and does not affect
/// other listeners.
#[allow(unused_variables)]
pub trait AdapterStatusListener: Send + Sync {
    /// The adapter settings changed
    fn adapter_settings_changed(&self, adapter: &Adapter, old: AdapterSettings, new: AdapterSettings) {}

    /// Discovery started (`scan_type` is scanning) or stopped
    fn discovering_changed(&self, adapter: &Adapter, scan_type: ScanType, policy: DiscoveryPolicy) {}

    /// A new device was discovered. Return `true` to keep the device alive in the adapter's shared device list.
    fn device_found(&self, device: &Device) -> bool {
        false
    }

    /// A known device was seen again or its advertised data changed
    fn device_updated(&self, device: &Device) {}

    /// The link to a device came up
    fn device_connected(&self, device: &Device, handle: ConnHandle) {}

    /// The pairing state of a device changed
    fn device_pairing_state(&self, device: &Device, state: PairingState, mode: PairingMode) {}

    /// Pairing completed below the required security level; the device is being disconnected
    fn device_security_violation(&self, device: &Device, achieved: SecurityLevel, required: SecurityLevel) {}

    /// A device is connected, secured as requested and (as GATT client) has its services resolved
    fn device_ready(&self, device: &Device) {}

    /// The link to a device went down, or a connection attempt failed (`handle` is [`ConnHandle::NONE`])
    fn device_disconnected(&self, device: &Device, reason: HciStatus, handle: ConnHandle) {}
}

/// Identifies a registered [`AdapterStatusListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatusListenerHandle(u64);

#[derive(Debug)]
struct DiscoveryState {
    settings: AdapterSettings,
    scan_type: ScanType,
    /// What the application asked for; kept while discovery is paused
    requested: Option<DiscoveryParameters>,
    /// Devices that currently hold discovery paused
    paused_by: HashSet<DeviceAddress>,
}

/// A point in a device's life that may release a discovery pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Milestone {
    Paired,
    Ready,
    Disconnected,
}

impl Milestone {
    fn releases(self, policy: DiscoveryPolicy) -> bool {
        match policy {
            DiscoveryPolicy::PauseConnectedUntilReady => self != Milestone::Paired,
            DiscoveryPolicy::PauseConnectedUntilPaired => self != Milestone::Ready,
            DiscoveryPolicy::PauseConnectedUntilDisconnected => self == Milestone::Disconnected,
            DiscoveryPolicy::AutoOff | DiscoveryPolicy::AlwaysOn => true,
        }
    }
}

#[derive(Default)]
struct DeviceTable {
    /// Every device created by this adapter; pruned lazily
    known: HashMap<DeviceAddress, Weak<DeviceInner>>,
    /// Devices some listener asked to keep
    shared: HashMap<DeviceAddress, Device>,
    /// Devices that are connecting or connected
    connected: HashMap<DeviceAddress, Device>,
}

impl DeviceTable {
    fn get(&mut self, address: &DeviceAddress) -> Option<Device> {
        if let Some(device) = self.connected.get(address).or_else(|| self.shared.get(address)) {
            return Some(device.clone());
        }
        match self.known.get(address)?.upgrade() {
            Some(inner) => Some(Device(inner)),
            None => {
                self.known.remove(address);
                None
            }
        }
    }

    fn live(&mut self) -> Vec<Device> {
        self.known.retain(|_, weak| weak.strong_count() > 0);
        let mut devices: Vec<Device> = self.known.values().filter_map(Weak::upgrade).map(Device).collect();
        devices.sort_by_key(|d| d.address());
        devices
    }
}

pub(crate) struct AdapterInner {
    context: Arc<HostContext>,
    discovery: Mutex<DiscoveryState>,
    devices: Mutex<DeviceTable>,
    listeners: Mutex<Vec<(StatusListenerHandle, Arc<dyn AdapterStatusListener>)>>,
    next_listener: AtomicU64,
    workers: WorkerSet,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl AdapterInner {
    fn discovery(&self) -> MutexGuard<'_, DiscoveryState> {
        self.discovery.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn devices(&self) -> MutexGuard<'_, DeviceTable> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for AdapterInner {
    fn drop(&mut self) {
        self.workers.abort_all();
        if let Some(pump) = self.pump.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
    }
}

/// Configures and opens an [`Adapter`].
pub struct AdapterBuilder {
    transport: Arc<dyn Transport>,
    config: AdapterConfig,
    key_store: Option<Arc<dyn KeyStore>>,
    policy: Option<Arc<dyn SecurityPolicy>>,
    agent: Option<Arc<dyn PairingAgent>>,
}

impl AdapterBuilder {
    /// Uses `config` instead of [`AdapterConfig::default`]
    pub fn config(mut self, config: AdapterConfig) -> Self {
        self.config = config;
        self
    }

    /// Persists bonding keys in `key_store`. Defaults to a [`MemoryKeyStore`].
    pub fn key_store(mut self, key_store: Arc<dyn KeyStore>) -> Self {
        self.key_store = Some(key_store);
        self
    }

    /// Looks up per-device security settings in `policy`. Defaults to an empty [`SecurityRegistry`].
    pub fn security_policy(mut self, policy: Arc<dyn SecurityPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Asks `agent` for passkeys and confirmations the security policy cannot answer
    pub fn pairing_agent(mut self, agent: Arc<dyn PairingAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Takes the transport's event stream and starts routing events.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn open(self) -> Result<Adapter> {
        let events = self.transport.take_events()?;
        let settings = self.transport.adapter_settings().await?;
        let context = Arc::new(HostContext {
            transport: self.transport,
            key_store: self.key_store.unwrap_or_else(|| Arc::new(MemoryKeyStore::new())),
            policy: self.policy.unwrap_or_else(|| Arc::new(SecurityRegistry::new())),
            agent: self.agent,
            config: self.config,
        });
        info!(
            "opened adapter hci{} ({}), powered: {}",
            context.config.dev_id, context.config.local_address, settings.powered
        );
        let inner = Arc::new(AdapterInner {
            context,
            discovery: Mutex::new(DiscoveryState {
                settings,
                scan_type: ScanType::None,
                requested: None,
                paused_by: HashSet::new(),
            }),
            devices: Mutex::new(DeviceTable::default()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            workers: WorkerSet::default(),
            pump: Mutex::new(None),
        });
        let pump = tokio::spawn(run_event_pump(Arc::downgrade(&inner), events));
        *inner.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(pump);
        Ok(Adapter(inner))
    }
}

/// The local Bluetooth adapter
///
/// `Adapter` is a cheap handle; clones refer to the same adapter.
#[derive(Clone)]
pub struct Adapter(pub(crate) Arc<AdapterInner>);

impl PartialEq for Adapter {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Adapter {}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("dev_id", &self.0.context.config.dev_id)
            .field("address", &self.0.context.config.local_address)
            .finish()
    }
}

impl Adapter {
    /// Starts configuring an adapter driven by `transport`.
    pub fn builder(transport: Arc<dyn Transport>) -> AdapterBuilder {
        AdapterBuilder {
            transport,
            config: AdapterConfig::default(),
            key_store: None,
            policy: None,
            agent: None,
        }
    }

    /// The configuration the adapter was opened with
    pub fn config(&self) -> &AdapterConfig {
        &self.0.context.config
    }

    /// The current controller settings
    pub fn settings(&self) -> AdapterSettings {
        self.0.discovery().settings
    }

    /// Whether the adapter is powered
    pub fn is_powered(&self) -> bool {
        self.settings().powered
    }

    /// The current scan type, [`ScanType::None`] when not discovering
    pub fn scan_type(&self) -> ScanType {
        self.0.discovery().scan_type
    }

    /// Whether the controller is discovering
    pub fn is_discovering(&self) -> bool {
        self.scan_type().is_scanning()
    }

    /// Starts discovery.
    ///
    /// While a device connects, discovery is paused according to `params.policy` and resumed afterwards.
    pub async fn start_discovery(&self, params: DiscoveryParameters) -> Result<()> {
        {
            let mut discovery = self.0.discovery();
            if !discovery.settings.powered {
                return Err(Error::new(ErrorKind::AdapterUnavailable, None, "adapter is powered off"));
            }
            discovery.requested = Some(params);
            if !discovery.paused_by.is_empty() && params.policy != DiscoveryPolicy::AlwaysOn {
                debug!("discovery deferred while {} devices connect", discovery.paused_by.len());
                return Ok(());
            }
        }
        match self.0.context.transport.start_discovery(&params).await {
            Ok(scan_type) => {
                info!("discovery started: {:?}", scan_type);
                self.set_scan_type(scan_type);
                Ok(())
            }
            Err(err) => {
                self.0.discovery().requested = None;
                Err(err)
            }
        }
    }

    /// Stops discovery and forgets the discovery request.
    pub async fn stop_discovery(&self) -> Result<()> {
        let scanning = {
            let mut discovery = self.0.discovery();
            discovery.requested = None;
            discovery.paused_by.clear();
            discovery.scan_type.is_scanning()
        };
        if scanning {
            self.0.context.transport.stop_discovery().await?;
            info!("discovery stopped");
            self.set_scan_type(ScanType::None);
        }
        Ok(())
    }

    fn set_scan_type(&self, scan_type: ScanType) {
        let policy = {
            let mut discovery = self.0.discovery();
            if discovery.scan_type == scan_type {
                return;
            }
            discovery.scan_type = scan_type;
            discovery
                .requested
                .map_or(self.0.context.config.discovery.policy, |p| p.policy)
        };
        self.emit("discovering changed", |l| l.discovering_changed(self, scan_type, policy));
    }

    /// Every live device this adapter knows of, ordered by address.
    pub fn discovered_devices(&self) -> Vec<Device> {
        self.0.devices().live()
    }

    /// Devices that are connecting or connected
    pub fn connected_devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.0.devices().connected.values().cloned().collect();
        devices.sort_by_key(|d| d.address());
        devices
    }

    /// Finds a live device by address
    pub fn find_device(&self, address: &DeviceAddress) -> Option<Device> {
        self.0.devices().get(address)
    }

    /// Returns the device with `address`, creating it if the adapter does not know it yet.
    ///
    /// Devices created this way are not kept alive by the adapter until they connect.
    pub fn open_device(&self, address: &DeviceAddress) -> Device {
        let mut devices = self.0.devices();
        if let Some(device) = devices.get(address) {
            return device;
        }
        let device = self.new_device(*address, DeviceState::Created);
        devices.known.insert(*address, Arc::downgrade(&device.0));
        device
    }

    /// Drops the adapter's references to discovered devices that are not connected.
    pub fn remove_discovered_devices(&self) {
        let mut devices = self.0.devices();
        devices.shared.clear();
        let connected: HashSet<DeviceAddress> = devices.connected.keys().copied().collect();
        devices.known.retain(|address, _| connected.contains(address));
    }

    fn new_device(&self, address: DeviceAddress, state: DeviceState) -> Device {
        Device::new(address, self.0.context.clone(), Arc::downgrade(&self.0), state)
    }

    /// Registers a status listener.
    pub fn add_status_listener(&self, listener: Arc<dyn AdapterStatusListener>) -> StatusListenerHandle {
        let handle = StatusListenerHandle(self.0.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners().push((handle, listener));
        handle
    }

    /// Removes a status listener. Returns `false` if it was not registered.
    pub fn remove_status_listener(&self, handle: StatusListenerHandle) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(h, _)| *h != handle);
        listeners.len() != before
    }

    /// Removes every status listener. Returns how many were removed.
    pub fn remove_all_status_listeners(&self) -> usize {
        std::mem::take(&mut *self.listeners()).len()
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(StatusListenerHandle, Arc<dyn AdapterStatusListener>)>> {
        self.0.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot_listeners(&self) -> Vec<Arc<dyn AdapterStatusListener>> {
        self.listeners().iter().map(|(_, l)| l.clone()).collect()
    }

    pub(crate) fn emit(&self, what: &str, f: impl Fn(&dyn AdapterStatusListener)) {
        for listener in self.snapshot_listeners() {
            call_guarded(what, || f(listener.as_ref()));
        }
    }

    // Transport events

    fn handle_adapter_event(&self, event: AdapterEvent) {
        match event {
            AdapterEvent::SettingsChanged(new) => self.on_settings_changed(new),
            AdapterEvent::DiscoveringChanged(scan_type) => {
                self.set_scan_type(scan_type);
                if !scan_type.is_scanning() {
                    self.resume_discovery();
                }
            }
            AdapterEvent::DeviceFound(report) => self.on_device_found(report),
        }
    }

    fn on_settings_changed(&self, new: AdapterSettings) {
        let old = {
            let mut discovery = self.0.discovery();
            let old = discovery.settings;
            discovery.settings = new;
            old
        };
        if old == new {
            return;
        }
        info!("adapter settings changed: {:?}", new);
        if old.powered && !new.powered {
            self.on_power_off();
        }
        self.emit("settings changed", |l| l.adapter_settings_changed(self, old, new));
        if !old.powered && new.powered {
            self.resume_discovery();
        }
    }

    /// Clears transient state and takes down every link.
    fn on_power_off(&self) {
        {
            let mut discovery = self.0.discovery();
            discovery.settings = discovery.settings.without_transient();
            discovery.paused_by.clear();
        }
        self.set_scan_type(ScanType::None);
        let connected = self.connected_devices();
        info!("adapter powered off, dropping {} links", connected.len());
        for device in connected {
            device.deliver(LinkEvent::Disconnected {
                reason: HciStatus::CONNECTION_TERMINATED_BY_LOCAL_HOST,
            });
        }
    }

    fn on_device_found(&self, report: DeviceReport) {
        if let Some(device) = self.find_device(&report.peer) {
            device.update_from_report(&report);
            trace!("updated {}", device);
            self.emit("device updated", |l| l.device_updated(&device));
            return;
        }

        let device = self.new_device(report.peer, DeviceState::Discovered);
        device.update_from_report(&report);
        self.0.devices().known.insert(report.peer, Arc::downgrade(&device.0));
        debug!("found {}", device);

        let mut keep = false;
        for listener in self.snapshot_listeners() {
            call_guarded("device found", || keep |= listener.device_found(&device));
        }
        if keep {
            self.0.devices().shared.insert(report.peer, device);
        }
    }

    fn route_link_event(&self, peer: DeviceAddress, event: LinkEvent) {
        let device = match self.find_device(&peer) {
            Some(device) => device,
            None => match event {
                LinkEvent::Connected { status, .. } if status.is_success() => {
                    debug!("incoming connection from {}", peer);
                    let device = self.open_device(&peer);
                    self.0.devices().connected.insert(peer, device.clone());
                    device
                }
                _ => {
                    debug!("dropping {:?} for unknown device {}", event, peer);
                    return;
                }
            },
        };
        device.deliver(event);
    }

    // Device lifecycle hooks

    pub(crate) fn device_connecting(&self, device: &Device) {
        self.0.devices().connected.insert(device.address(), device.clone());
        self.pause_discovery(device);
    }

    pub(crate) fn device_connection_failed(&self, device: &Device, status: Option<HciStatus>) {
        self.0.devices().connected.remove(&device.address());
        self.release_discovery(device, Milestone::Disconnected);
        if let Some(status) = status {
            self.emit("device disconnected", |l| {
                l.device_disconnected(device, status, ConnHandle::NONE)
            });
        }
    }

    pub(crate) fn device_connected(&self, device: &Device, handle: ConnHandle) {
        self.0.devices().connected.insert(device.address(), device.clone());
        self.pause_discovery(device);
        self.emit("device connected", |l| l.device_connected(device, handle));
    }

    pub(crate) fn device_paired(&self, device: &Device) {
        self.release_discovery(device, Milestone::Paired);
    }

    pub(crate) fn device_ready(&self, device: &Device) {
        self.release_discovery(device, Milestone::Ready);
        self.emit("device ready", |l| l.device_ready(device));
    }

    pub(crate) fn device_disconnected(&self, device: &Device, reason: HciStatus, handle: ConnHandle) {
        self.0.devices().connected.remove(&device.address());
        self.release_discovery(device, Milestone::Disconnected);
        self.emit("device disconnected", |l| l.device_disconnected(device, reason, handle));
    }

    pub(crate) fn unregister(&self, device: &Device) {
        let address = device.address();
        let mut devices = self.0.devices();
        devices.connected.remove(&address);
        devices.shared.remove(&address);
        // A newer device object may have taken the address.
        if devices
            .known
            .get(&address)
            .map_or(false, |weak| weak.as_ptr() == Arc::as_ptr(&device.0))
        {
            devices.known.remove(&address);
        }
        drop(devices);
        self.release_discovery(device, Milestone::Disconnected);
    }

    // Discovery policy

    fn pause_discovery(&self, device: &Device) {
        let stop = {
            let mut discovery = self.0.discovery();
            let Some(requested) = discovery.requested else {
                return;
            };
            match requested.policy {
                DiscoveryPolicy::AlwaysOn => return,
                DiscoveryPolicy::AutoOff => {
                    discovery.requested = None;
                }
                _ => {
                    discovery.paused_by.insert(device.address());
                }
            }
            discovery.scan_type.is_scanning()
        };
        if stop {
            debug!("pausing discovery while {} connects", device.address());
            let adapter = self.clone();
            self.0.workers.spawn(async move {
                match adapter.0.context.transport.stop_discovery().await {
                    Ok(()) => adapter.set_scan_type(ScanType::None),
                    Err(err) => warn!("pausing discovery failed: {}", err),
                }
            });
        }
    }

    fn release_discovery(&self, device: &Device, milestone: Milestone) {
        {
            let mut discovery = self.0.discovery();
            let Some(requested) = discovery.requested else {
                return;
            };
            if !milestone.releases(requested.policy) || !discovery.paused_by.remove(&device.address()) {
                return;
            }
        }
        self.resume_discovery();
    }

    /// Restarts discovery if it was requested, is not paused and the controller stopped it.
    fn resume_discovery(&self) {
        let params = {
            let discovery = self.0.discovery();
            match discovery.requested {
                Some(params)
                    if discovery.paused_by.is_empty()
                        && discovery.settings.powered
                        && !discovery.scan_type.is_scanning() =>
                {
                    params
                }
                _ => return,
            }
        };
        debug!("resuming discovery");
        let adapter = self.clone();
        self.0.workers.spawn(async move {
            match adapter.0.context.transport.start_discovery(&params).await {
                Ok(scan_type) => adapter.set_scan_type(scan_type),
                Err(err) => warn!("resuming discovery failed: {}", err),
            }
        });
    }
}

async fn run_event_pump(adapter: Weak<AdapterInner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = adapter.upgrade() else {
            break;
        };
        let adapter = Adapter(inner);
        match event {
            TransportEvent::Adapter(event) => adapter.handle_adapter_event(event),
            TransportEvent::Link { peer, event } => adapter.route_link_event(peer, event),
        }
    }
    debug!("transport event stream closed");
}
