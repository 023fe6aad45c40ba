//! Remote devices and their connection lifecycle.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::adapter::{Adapter, AdapterInner, HostContext};
use crate::attribute_cache::{next_generation, AttributeCache};
use crate::config::AdapterConfig;
use crate::error::ErrorKind;
use crate::keys::{read_key_file, KeyMaterial};
use crate::listener::{
    CccdState, CharacteristicListener, ListenerGuard, ListenerHandle, ListenerMatch, ListenerRegistry, Notifications,
};
use crate::pairing::{IoCapability, Passkey};
use crate::smp::{PairingAction, PairingContext, PairingFailure, PairingMode, PairingState, SmpEvent, SmpPdu};
use crate::transport::{DeviceReport, LinkEvent};
use crate::util::{call_guarded, WorkerSet};
use crate::{
    Characteristic, ConnHandle, ConnectionParameters, Descriptor, DeviceAddress, Error, GattRole, HciStatus, Result,
    SecurityLevel, Service, Uuid, WriteType,
};

/// Lifecycle state of a [`Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    /// Known by address only
    Created,
    /// Seen during discovery
    Discovered,
    /// A connection request was accepted by the transport
    Connecting,
    /// The link is up
    Connected,
    /// The link is up and pairing is in progress
    Pairing,
    /// Security settled and, for the client role, services resolved
    Ready,
    /// A disconnect was requested
    Disconnecting,
    /// The link went down
    Disconnected,
    /// The device was removed; every further operation fails
    Removed,
}

impl DeviceState {
    /// Whether the link is up
    pub fn is_connected(self) -> bool {
        matches!(self, DeviceState::Connected | DeviceState::Pairing | DeviceState::Ready)
    }
}

/// Outcome of [`Device::disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectOutcome {
    /// The disconnect was sent to the transport
    Initiated,
    /// A disconnect is already underway
    AlreadyDisconnecting,
    /// There is no link
    AlreadyDisconnected,
}

#[derive(Debug, Clone, Copy)]
struct SecurityRequest {
    level: SecurityLevel,
    io_capability: IoCapability,
    /// Set once the application chose security for this device
    explicit: bool,
    /// Upper I/O capability for automatic security
    auto_max: Option<IoCapability>,
}

#[derive(Debug)]
struct LinkState {
    state: DeviceState,
    conn: ConnHandle,
    role: GattRole,
    name: Option<String>,
    rssi: Option<i8>,
    last_discovery: Option<Instant>,
    last_update: Instant,
    pairing: PairingContext,
    security: SecurityRequest,
    ready_pending: bool,
    delivery: Option<mpsc::UnboundedSender<LinkEvent>>,
    delivery_task: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct GattState {
    cache: Option<AttributeCache>,
    registry: ListenerRegistry,
}

pub(crate) struct DeviceInner {
    address: DeviceAddress,
    created: Instant,
    context: Arc<HostContext>,
    adapter: Weak<AdapterInner>,
    link: Mutex<LinkState>,
    gatt: Mutex<GattState>,
    cccd_writes: tokio::sync::Mutex<()>,
    workers: WorkerSet,
}

impl DeviceInner {
    // Lock order: `link` before `gatt`.
    fn link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn gatt(&self) -> MutexGuard<'_, GattState> {
        self.gatt.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        self.workers.abort_all();
        let link = self.link.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = link.delivery_task.take() {
            task.abort();
        }
    }
}

/// A remote Bluetooth device
///
/// `Device` is a cheap handle; clones refer to the same device.
#[derive(Clone)]
pub struct Device(pub(crate) Arc<DeviceInner>);

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Device {}

impl std::hash::Hash for Device {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.0.address)
            .field("state", &self.state())
            .finish()
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} [{}]", name, self.0.address),
            None => write!(f, "{}", self.0.address),
        }
    }
}

impl Device {
    pub(crate) fn new(
        address: DeviceAddress,
        context: Arc<HostContext>,
        adapter: Weak<AdapterInner>,
        state: DeviceState,
    ) -> Self {
        let now = Instant::now();
        let config = &context.config.device;
        let link = LinkState {
            state,
            conn: ConnHandle::NONE,
            role: config.role,
            name: None,
            rssi: None,
            last_discovery: None,
            last_update: now,
            pairing: PairingContext::new(address),
            security: SecurityRequest {
                level: config.security_level,
                io_capability: config.io_capability,
                explicit: false,
                auto_max: None,
            },
            ready_pending: false,
            delivery: None,
            delivery_task: None,
        };
        Device(Arc::new(DeviceInner {
            address,
            created: now,
            context,
            adapter,
            link: Mutex::new(link),
            gatt: Mutex::new(GattState::default()),
            cccd_writes: tokio::sync::Mutex::new(()),
            workers: WorkerSet::default(),
        }))
    }

    /// The identity of this device
    pub fn address(&self) -> DeviceAddress {
        self.0.address
    }

    /// The name of the device, if one was advertised
    pub fn name(&self) -> Option<String> {
        self.0.link().name.clone()
    }

    /// Signal strength of the last advertising report, in dBm
    pub fn rssi(&self) -> Option<i8> {
        self.0.link().rssi
    }

    /// The current lifecycle state
    pub fn state(&self) -> DeviceState {
        self.0.link().state
    }

    /// Whether the link to the device is up
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// The HCI connection handle, [`ConnHandle::NONE`] while disconnected
    pub fn conn_handle(&self) -> ConnHandle {
        self.0.link().conn
    }

    /// The local GATT role on this link
    pub fn gatt_role(&self) -> GattRole {
        self.0.link().role
    }

    /// Sets the local GATT role for the next connection.
    pub fn set_gatt_role(&self, role: GattRole) -> Result<()> {
        let mut link = self.0.link();
        self.check_unconnected(&link, "the GATT role")?;
        link.role = role;
        Ok(())
    }

    /// Pairing progress of the current link
    pub fn pairing_state(&self) -> PairingState {
        self.0.link().pairing.state()
    }

    /// Association model of the current or last pairing
    pub fn pairing_mode(&self) -> PairingMode {
        self.0.link().pairing.mode()
    }

    /// The security level the current link reached
    pub fn security_level(&self) -> SecurityLevel {
        self.0.link().pairing.security_level()
    }

    /// When this device object was created
    pub fn created_at(&self) -> Instant {
        self.0.created
    }

    /// When the device was last seen during discovery
    pub fn last_discovery(&self) -> Option<Instant> {
        self.0.link().last_discovery
    }

    /// When the device state or its discovery data last changed
    pub fn last_update(&self) -> Instant {
        self.0.link().last_update
    }

    /// Whether the attribute cache of the current link is populated
    pub fn is_services_resolved(&self) -> bool {
        self.0.gatt().cache.is_some()
    }

    pub(crate) fn config(&self) -> &AdapterConfig {
        &self.0.context.config
    }

    fn adapter(&self) -> Option<Adapter> {
        self.0.adapter.upgrade().map(Adapter)
    }

    fn removed_error(&self) -> Error {
        Error::new(
            ErrorKind::InvalidState,
            None,
            format!("device {} has been removed", self.0.address),
        )
    }

    fn check_unconnected(&self, link: &LinkState, what: &str) -> Result<()> {
        match link.state {
            DeviceState::Removed => Err(self.removed_error()),
            DeviceState::Created | DeviceState::Discovered | DeviceState::Disconnected => Ok(()),
            state => Err(Error::new(
                ErrorKind::InvalidState,
                None,
                format!("{what} can only be changed before connecting ({state:?})"),
            )),
        }
    }

    /// The connection handle of a live link, or `kind` if there is none.
    fn link_handle(&self, kind: ErrorKind) -> Result<ConnHandle> {
        let link = self.0.link();
        match link.state {
            DeviceState::Removed => Err(self.removed_error()),
            state if state.is_connected() => Ok(link.conn),
            state => Err(Error::new(
                kind,
                None,
                format!("{} is not connected ({:?})", self.0.address, state),
            )),
        }
    }

    fn client_handle(&self) -> Result<ConnHandle> {
        let conn = self.link_handle(ErrorKind::NotConnected)?;
        if self.gatt_role() != GattRole::Client {
            return Err(Error::new(ErrorKind::InvalidState, None, "not in the GATT client role"));
        }
        Ok(conn)
    }

    fn ensure_not_removed(&self) -> Result<()> {
        if self.state() == DeviceState::Removed {
            Err(self.removed_error())
        } else {
            Ok(())
        }
    }

    pub(crate) fn update_from_report(&self, report: &DeviceReport) {
        let mut link = self.0.link();
        if link.state == DeviceState::Removed {
            return;
        }
        if report.name.is_some() {
            link.name = report.name.clone();
        }
        if report.rssi.is_some() {
            link.rssi = report.rssi;
        }
        link.last_discovery = Some(report.timestamp);
        link.last_update = Instant::now();
        if link.state == DeviceState::Created {
            link.state = DeviceState::Discovered;
        }
    }

    // Connection lifecycle

    /// Connects with the adapter's default connection parameters.
    ///
    /// Returns once the transport accepted the request; the link comes up asynchronously.
    pub async fn connect(&self) -> Result<()> {
        let params = self.0.context.config.connection;
        self.connect_with(&params).await
    }

    /// Connects with the given parameters.
    ///
    /// Only one connection attempt may be underway: a second call while connecting or connected fails with
    /// [`AlreadyConnected`][ErrorKind::AlreadyConnected] and does not reach the transport.
    pub async fn connect_with(&self, params: &ConnectionParameters) -> Result<()> {
        params.validate()?;
        let (previous, needs_keys, required) = {
            let mut link = self.0.link();
            match link.state {
                DeviceState::Removed => return Err(self.removed_error()),
                DeviceState::Connecting | DeviceState::Connected | DeviceState::Pairing | DeviceState::Ready => {
                    return Err(Error::new(
                        ErrorKind::AlreadyConnected,
                        None,
                        format!("{} is {:?}", self.0.address, link.state),
                    ))
                }
                DeviceState::Disconnecting => {
                    return Err(Error::new(ErrorKind::AlreadyInProgress, None, "disconnect in progress"))
                }
                DeviceState::Created | DeviceState::Discovered | DeviceState::Disconnected => {}
            }
            let previous = link.state;
            link.state = DeviceState::Connecting;
            link.last_update = Instant::now();
            let (required, _) = self.security_for(&link);
            (previous, link.pairing.pre_paired().is_none(), required)
        };

        if let Some(adapter) = self.adapter() {
            adapter.device_connecting(self);
        }
        if needs_keys {
            self.upload_stored_keys(required).await;
        }

        debug!("connecting to {}", self.0.address);
        match self.0.context.transport.connect(&self.0.address, params).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("connect request for {} rejected: {}", self.0.address, err);
                {
                    let mut link = self.0.link();
                    if link.state == DeviceState::Connecting {
                        link.state = previous;
                    }
                }
                if let Some(adapter) = self.adapter() {
                    adapter.device_connection_failed(self, None);
                }
                Err(err)
            }
        }
    }

    /// Loads keys from the key store into the transport if they satisfy `required`.
    async fn upload_stored_keys(&self, required: SecurityLevel) {
        let ctx = &self.0.context;
        let keys = match ctx.key_store.read(&ctx.config.local_address, &self.0.address) {
            Ok(Some(keys)) if keys.satisfies(required) => keys,
            Ok(_) => return,
            Err(err) => {
                warn!("reading stored keys of {} failed: {}", self.0.address, err);
                return;
            }
        };
        match ctx.transport.upload_keys(&self.0.address, &keys).await {
            Ok(()) => {
                debug!("uploaded stored {:?} keys of {}", keys.security_level, self.0.address);
                self.0.link().pairing.set_pre_paired(Some(keys));
            }
            Err(err) => warn!("uploading stored keys of {} failed: {}", self.0.address, err),
        }
    }

    /// Disconnects the device.
    ///
    /// The attribute cache and listener registry are cleared before this returns. Calling this while already
    /// disconnecting or disconnected is not an error.
    pub async fn disconnect(&self, reason: HciStatus) -> Result<DisconnectOutcome> {
        let conn = {
            let mut link = self.0.link();
            match link.state {
                DeviceState::Removed => return Err(self.removed_error()),
                DeviceState::Disconnecting => return Ok(DisconnectOutcome::AlreadyDisconnecting),
                DeviceState::Created | DeviceState::Discovered | DeviceState::Disconnected => {
                    return Ok(DisconnectOutcome::AlreadyDisconnected)
                }
                DeviceState::Connecting => {
                    return Err(Error::new(
                        ErrorKind::InvalidState,
                        None,
                        "connection attempt still in progress",
                    ))
                }
                DeviceState::Connected | DeviceState::Pairing | DeviceState::Ready => {}
            }
            link.state = DeviceState::Disconnecting;
            link.last_update = Instant::now();
            self.clear_gatt(&mut self.0.gatt(), "disconnect request");
            link.conn
        };

        info!("disconnecting {} ({})", self.0.address, reason);
        if let Err(err) = self.0.context.transport.disconnect(conn, reason).await {
            warn!("transport rejected disconnect of {}: {}", self.0.address, err);
            // The link is unusable either way.
            self.on_disconnected(reason);
            return Err(err);
        }
        Ok(DisconnectOutcome::Initiated)
    }

    /// Removes the device: detaches every listener, forgets it in the adapter and drops the link if there is one.
    ///
    /// Every later operation on the device fails with [`InvalidState`][ErrorKind::InvalidState].
    pub fn remove(&self) {
        let (conn, task) = {
            let mut link = self.0.link();
            if link.state == DeviceState::Removed {
                return;
            }
            let conn = link.conn;
            link.state = DeviceState::Removed;
            link.conn = ConnHandle::NONE;
            link.pairing.reset();
            link.ready_pending = false;
            link.delivery = None;
            self.clear_gatt(&mut self.0.gatt(), "remove");
            (conn, link.delivery_task.take())
        };
        self.0.workers.abort_all();
        if let Some(task) = task {
            task.abort();
        }
        if let Some(adapter) = self.adapter() {
            adapter.unregister(self);
        }
        if conn.is_valid() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let transport = self.0.context.transport.clone();
                    let address = self.0.address;
                    runtime.spawn(async move {
                        if let Err(err) = transport
                            .disconnect(conn, HciStatus::CONNECTION_TERMINATED_BY_LOCAL_HOST)
                            .await
                        {
                            warn!("disconnecting removed device {} failed: {}", address, err);
                        }
                    });
                }
                Err(_) => warn!("no runtime to disconnect removed device {}", self.0.address),
            }
        }
        info!("removed {}", self.0.address);
    }

    fn clear_gatt(&self, gatt: &mut GattState, context: &str) {
        gatt.cache = None;
        gatt.registry.clear();
        gatt.registry.check_consistency(&self.0.address, context);
    }

    // Event delivery

    /// Queues a link event for in-order processing on this device's delivery task.
    pub(crate) fn deliver(&self, event: LinkEvent) {
        let tx = {
            let mut link = self.0.link();
            if link.state == DeviceState::Removed {
                trace!("dropping {:?} for removed {}", event, self.0.address);
                return;
            }
            match &link.delivery {
                Some(tx) if !tx.is_closed() => tx.clone(),
                _ => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    link.delivery_task = Some(tokio::spawn(run_delivery(Arc::downgrade(&self.0), rx)));
                    link.delivery = Some(tx.clone());
                    tx
                }
            }
        };
        if tx.send(event).is_err() {
            warn!("delivery task of {} is gone", self.0.address);
        }
    }

    fn handle_link_event(&self, event: LinkEvent) {
        trace!("{}: {:?}", self.0.address, event);
        match event {
            LinkEvent::Connected { handle, status } => self.on_connected(handle, status),
            LinkEvent::Disconnected { reason } => self.on_disconnected(reason),
            LinkEvent::Notification {
                value_handle,
                value,
                timestamp,
            } => self.dispatch(value_handle, &value, timestamp, None),
            LinkEvent::Indication {
                value_handle,
                value,
                timestamp,
                confirmed,
            } => self.dispatch(value_handle, &value, timestamp, Some(confirmed)),
            LinkEvent::Security(event) => self.on_security_event(event),
        }
    }

    fn on_connected(&self, handle: ConnHandle, status: HciStatus) {
        let (level, io_capability) = {
            let mut link = self.0.link();
            match link.state {
                DeviceState::Removed => return,
                state if state.is_connected() => {
                    warn!("{} reported connected again ({}), ignoring", self.0.address, handle);
                    return;
                }
                _ => {}
            }
            if !status.is_success() {
                link.state = DeviceState::Disconnected;
                link.last_update = Instant::now();
                drop(link);
                info!("connection to {} failed: {}", self.0.address, status);
                if let Some(adapter) = self.adapter() {
                    adapter.device_connection_failed(self, Some(status));
                }
                return;
            }
            link.state = DeviceState::Connected;
            link.conn = handle;
            link.last_update = Instant::now();
            link.ready_pending = false;
            self.security_for(&link)
        };

        info!("{} connected, handle {}", self.0.address, handle);
        if let Some(adapter) = self.adapter() {
            adapter.device_connected(self, handle);
        }
        if level.requires_encryption() {
            self.request_security(handle, level, io_capability);
        } else {
            self.schedule_ready();
        }
    }

    /// Handles the end of the link. Clears the attribute cache and listener registry together.
    pub(crate) fn on_disconnected(&self, reason: HciStatus) {
        let conn = {
            let mut link = self.0.link();
            match link.state {
                DeviceState::Removed => return,
                DeviceState::Connecting | DeviceState::Disconnecting => {}
                state if state.is_connected() => {}
                state => {
                    debug!("{} reported disconnected while {:?}", self.0.address, state);
                    return;
                }
            }
            let conn = std::mem::replace(&mut link.conn, ConnHandle::NONE);
            link.state = DeviceState::Disconnected;
            link.last_update = Instant::now();
            link.pairing.reset();
            link.ready_pending = false;
            self.clear_gatt(&mut self.0.gatt(), "disconnect");
            conn
        };
        self.0.workers.abort_all();

        info!("{} disconnected: {}", self.0.address, reason);
        if let Some(adapter) = self.adapter() {
            adapter.device_disconnected(self, reason, conn);
        }
        if self.0.context.config.device.remove_on_disconnect {
            self.remove();
        }
    }

    fn schedule_ready(&self) {
        {
            let mut link = self.0.link();
            if link.ready_pending || !matches!(link.state, DeviceState::Connected | DeviceState::Pairing) {
                return;
            }
            link.ready_pending = true;
        }
        let device = self.clone();
        self.0.workers.spawn(async move { device.process_ready().await });
    }

    async fn process_ready(&self) {
        if self.gatt_role() == GattRole::Client {
            match self.resolve_services().await {
                Ok(services) => debug!("{} has {} services", self.0.address, services.len()),
                Err(err) => {
                    warn!("service discovery on {} failed: {}", self.0.address, err);
                    self.0.link().ready_pending = false;
                    return;
                }
            }
        }
        {
            let mut link = self.0.link();
            link.ready_pending = false;
            if !matches!(link.state, DeviceState::Connected | DeviceState::Pairing) {
                return;
            }
            link.state = DeviceState::Ready;
            link.last_update = Instant::now();
        }
        info!("{} ready", self.0.address);
        if let Some(adapter) = self.adapter() {
            adapter.device_ready(self);
        }
    }

    // GATT client

    /// Discovers the services of the connected device and populates the attribute cache.
    ///
    /// Returns the cached services if discovery already ran on this link. An empty discovery result is reported as
    /// [`NotFound`][ErrorKind::NotFound] and leaves the link up.
    pub async fn resolve_services(&self) -> Result<Vec<Service>> {
        let conn = self.link_handle(ErrorKind::InvalidState)?;
        let cached = self.0.gatt().cache.as_ref().map(AttributeCache::services);
        if let Some(services) = cached {
            return Ok(services);
        }

        let definitions = self.0.context.transport.discover_services(conn).await?;
        if definitions.is_empty() {
            warn!("{} reported no services", self.0.address);
            return Err(Error::new(ErrorKind::NotFound, None, "peer reported no services"));
        }

        let link = self.0.link();
        if link.conn != conn || !link.state.is_connected() {
            return Err(Error::new(ErrorKind::InvalidState, None, "link lost during service discovery"));
        }
        let mut gatt = self.0.gatt();
        if gatt.cache.is_none() {
            let cache = AttributeCache::build(next_generation(), definitions);
            debug!("attribute cache of {} built, generation {}", self.0.address, cache.generation());
            gatt.cache = Some(cache);
        }
        Ok(gatt.cache.as_ref().map(AttributeCache::services).unwrap_or_default())
    }

    /// The services in the attribute cache
    pub fn services(&self) -> Result<Vec<Service>> {
        self.ensure_not_removed()?;
        self.with_cache(|cache| Ok(cache.services()))
    }

    fn with_cache<T>(&self, f: impl FnOnce(&AttributeCache) -> Result<T>) -> Result<T> {
        let gatt = self.0.gatt();
        match &gatt.cache {
            Some(cache) => f(cache),
            None => Err(Error::new(ErrorKind::InvalidState, None, "services not resolved")),
        }
    }

    /// Finds a cached service by UUID
    pub fn find_service(&self, uuid: Uuid) -> Result<Service> {
        self.ensure_not_removed()?;
        self.with_cache(|cache| {
            cache
                .find_service(uuid)
                .ok_or_else(|| Error::new(ErrorKind::NotFound, None, format!("service {uuid}")))
        })
    }

    /// Finds a cached characteristic by UUID, optionally within one service
    pub fn find_characteristic(&self, service: Option<Uuid>, uuid: Uuid) -> Result<Characteristic> {
        self.ensure_not_removed()?;
        self.with_cache(|cache| {
            cache
                .find_characteristic(service, uuid)
                .ok_or_else(|| Error::new(ErrorKind::NotFound, None, format!("characteristic {uuid}")))
        })
    }

    /// Reads the value of a characteristic from the device
    pub async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>> {
        let conn = self.client_handle()?;
        let value_handle = self.with_cache(|cache| cache.validate(characteristic))?;
        let value = self.0.context.transport.read(conn, value_handle).await?;
        if let Some(cache) = self.0.gatt().cache.as_mut() {
            if cache.generation() == characteristic.generation {
                cache.store_value(value_handle, &value);
            }
        }
        Ok(value)
    }

    /// Writes the value of a characteristic
    pub async fn write(&self, characteristic: &Characteristic, value: &[u8], write_type: WriteType) -> Result<()> {
        let conn = self.client_handle()?;
        let value_handle = self.with_cache(|cache| cache.validate(characteristic))?;
        self.0
            .context
            .transport
            .write(conn, value_handle, value, write_type)
            .await
    }

    /// Reads the value of a descriptor from the device
    pub async fn read_descriptor(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let conn = self.client_handle()?;
        let handle = self.with_cache(|cache| cache.validate_descriptor(descriptor))?;
        self.0.context.transport.read(conn, handle).await
    }

    /// Writes the value of a descriptor
    pub async fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Result<()> {
        let conn = self.client_handle()?;
        let handle = self.with_cache(|cache| cache.validate_descriptor(descriptor))?;
        self.0
            .context
            .transport
            .write(conn, handle, value, WriteType::WithResponse)
            .await
    }

    /// The last value read or received for a characteristic on the current link
    pub fn cached_value(&self, characteristic: &Characteristic) -> Option<Vec<u8>> {
        let gatt = self.0.gatt();
        let cache = gatt.cache.as_ref()?;
        let value_handle = cache.validate(characteristic).ok()?;
        cache.cached_value(value_handle).map(<[u8]>::to_vec)
    }

    fn dispatch(&self, value_handle: u16, value: &[u8], timestamp: Instant, indication: Option<bool>) {
        let (characteristic, listeners) = {
            let mut guard = self.0.gatt();
            let gatt = &mut *guard;
            let Some(cache) = gatt.cache.as_mut() else {
                debug!("dropping update of {:#06x} from {}: services not resolved", value_handle, self.0.address);
                return;
            };
            let Some(characteristic) = cache.characteristic_by_value_handle(value_handle) else {
                debug!("dropping update of unknown handle {:#06x} from {}", value_handle, self.0.address);
                return;
            };
            cache.store_value(value_handle, value);
            (characteristic, gatt.registry.matching(value_handle))
        };
        trace!(
            "{} update of {:#06x} for {} listeners",
            self.0.address,
            value_handle,
            listeners.len()
        );
        for listener in listeners {
            call_guarded("characteristic listener", || match indication {
                None => listener.notification_received(&characteristic, value, timestamp),
                Some(confirmed) => listener.indication_received(&characteristic, value, timestamp, confirmed),
            });
        }
    }

    // Listeners

    /// Registers a characteristic listener.
    ///
    /// For a concrete characteristic the CCCD is written (and the write awaited) unless the needed notify/indicate
    /// bits are already enabled. Fails with [`NoNotificationSupport`][ErrorKind::NoNotificationSupport] if the
    /// characteristic has no CCCD. On failure the registry is unchanged.
    pub async fn add_char_listener(
        &self,
        matcher: ListenerMatch,
        listener: Arc<dyn CharacteristicListener>,
    ) -> Result<ListenerHandle> {
        self.ensure_not_removed()?;
        let characteristic = match matcher {
            ListenerMatch::All => {
                self.link_handle(ErrorKind::NotConnected)?;
                let mut gatt = self.0.gatt();
                if gatt.cache.is_none() {
                    return Err(Error::new(ErrorKind::InvalidState, None, "services not resolved"));
                }
                let handle = gatt.registry.insert(None, CccdState::default(), listener);
                gatt.registry.check_consistency(&self.0.address, "add");
                return Ok(handle);
            }
            ListenerMatch::Characteristic(characteristic) => characteristic,
        };
        let conn = self.link_handle(ErrorKind::NotConnected)?;

        let _serial = self.0.cccd_writes.lock().await;
        let (value_handle, cccd_handle, wants, write) = {
            let gatt = self.0.gatt();
            let cache = gatt
                .cache
                .as_ref()
                .ok_or_else(|| Error::new(ErrorKind::InvalidState, None, "services not resolved"))?;
            let value_handle = cache.validate(&characteristic)?;
            let props = characteristic.properties();
            let wants = CccdState {
                notify: props.notify,
                indicate: props.indicate,
            };
            let cccd_handle = cache
                .cccd_handle(value_handle)
                .filter(|_| !wants.is_empty())
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::NoNotificationSupport,
                        None,
                        format!("characteristic {}", characteristic.uuid()),
                    )
                })?;
            let enabled = gatt.registry.enabled(value_handle);
            let write = (!enabled.contains(wants)).then(|| enabled.union(wants));
            (value_handle, cccd_handle, wants, write)
        };

        if let Some(target) = write {
            debug!(
                "enabling {:?} for {:#06x} on {}",
                target, value_handle, self.0.address
            );
            self.0
                .context
                .transport
                .write(conn, cccd_handle, &target.to_value(), WriteType::WithResponse)
                .await?;
        }

        let mut gatt = self.0.gatt();
        if gatt.cache.as_ref().map(AttributeCache::generation) != Some(characteristic.generation) {
            return Err(Error::new(
                ErrorKind::InvalidState,
                None,
                "link lost while enabling notifications",
            ));
        }
        if let Some(target) = write {
            gatt.registry.set_enabled(value_handle, target);
        }
        let handle = gatt.registry.insert(Some(value_handle), wants, listener);
        gatt.registry.check_consistency(&self.0.address, "add");
        Ok(handle)
    }

    /// Removes a listener. Returns `false` if `handle` is not registered.
    ///
    /// When the last listener of a characteristic goes, its CCCD is cleared. A failed CCCD write is logged; the
    /// listener is removed regardless.
    pub async fn remove_char_listener(&self, handle: ListenerHandle) -> Result<bool> {
        self.ensure_not_removed()?;
        let _serial = self.0.cccd_writes.lock().await;
        let Some(pending) = self.unregister_listener(handle) else {
            debug!("listener {:?} not registered on {}", handle, self.0.address);
            return Ok(false);
        };
        if let Some((cccd_handle, state)) = pending {
            let conn = self.conn_handle();
            if conn.is_valid() {
                if let Err(err) = self
                    .0
                    .context
                    .transport
                    .write(conn, cccd_handle, &state.to_value(), WriteType::WithResponse)
                    .await
                {
                    warn!("clearing CCCD {:#06x} on {} failed: {}", cccd_handle, self.0.address, err);
                }
            }
        }
        Ok(true)
    }

    /// Drops a listener from the registry. Returns the CCCD write still owed, if any.
    fn unregister_listener(&self, handle: ListenerHandle) -> Option<Option<(u16, CccdState)>> {
        let mut guard = self.0.gatt();
        let gatt = &mut *guard;
        let target = gatt.registry.remove(handle)?;
        let pending = target.and_then(|value_handle| {
            let required = gatt.registry.required(value_handle);
            if required.contains(gatt.registry.enabled(value_handle)) {
                return None;
            }
            gatt.registry.set_enabled(value_handle, required);
            let cccd_handle = gatt.cache.as_ref()?.cccd_handle(value_handle)?;
            Some((cccd_handle, required))
        });
        gatt.registry.check_consistency(&self.0.address, "remove");
        Some(pending)
    }

    pub(crate) fn forget_char_listener(&self, handle: ListenerHandle) {
        if self.unregister_listener(handle).is_some() {
            debug!("dropped listener {:?} of {} without touching the CCCD", handle, self.0.address);
        }
    }

    /// Removes every listener of one characteristic. Returns how many were removed.
    pub async fn remove_all_char_listeners_for(&self, characteristic: &Characteristic) -> Result<usize> {
        self.ensure_not_removed()?;
        let value_handle = self.with_cache(|cache| cache.validate(characteristic))?;
        let handles = self.0.gatt().registry.handles_for(value_handle);
        self.remove_listeners(handles).await
    }

    /// Removes every listener. Returns how many were removed.
    pub async fn remove_all_char_listeners(&self) -> Result<usize> {
        self.ensure_not_removed()?;
        let handles = self.0.gatt().registry.handles();
        self.remove_listeners(handles).await
    }

    async fn remove_listeners(&self, handles: Vec<ListenerHandle>) -> Result<usize> {
        let mut removed = 0;
        for handle in handles {
            if self.remove_char_listener(handle).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.0.gatt().registry.count()
    }

    /// Number of listeners reachable from the notification dispatch path. Always equal to
    /// [`listener_count`][Self::listener_count] unless the registry is corrupt.
    pub fn transport_listener_count(&self) -> usize {
        self.0.gatt().registry.dispatch_count()
    }

    /// Enables notifications or indications of `characteristic` and returns a stream of its updates.
    ///
    /// Dropping the stream removes the listener.
    pub async fn notifications(&self, characteristic: &Characteristic) -> Result<Notifications> {
        let (listener, rx) = Notifications::channel();
        let handle = self
            .add_char_listener(ListenerMatch::Characteristic(characteristic.clone()), listener)
            .await?;
        Ok(Notifications::new(rx, ListenerGuard::new(self, handle)))
    }

    // GATT server

    /// Sends a notification of a local attribute to the connected client
    pub async fn send_notification(&self, attribute: u16, value: &[u8]) -> Result<()> {
        let conn = self.server_handle()?;
        self.0.context.transport.send_notification(conn, attribute, value).await
    }

    /// Sends an indication of a local attribute to the connected client and waits for the confirmation
    pub async fn send_indication(&self, attribute: u16, value: &[u8]) -> Result<()> {
        let conn = self.server_handle()?;
        self.0.context.transport.send_indication(conn, attribute, value).await
    }

    fn server_handle(&self) -> Result<ConnHandle> {
        let conn = self.link_handle(ErrorKind::NotConnected)?;
        if self.gatt_role() != GattRole::Server {
            return Err(Error::new(ErrorKind::InvalidState, None, "not in the GATT server role"));
        }
        Ok(conn)
    }

    // Security

    /// Requests `level` with `io_capability` on the next connection.
    ///
    /// A pairing that ends below `level` disconnects the link.
    pub fn set_conn_security(&self, level: SecurityLevel, io_capability: IoCapability) -> Result<()> {
        let mut link = self.0.link();
        self.check_unconnected(&link, "security")?;
        link.security = SecurityRequest {
            level,
            io_capability,
            explicit: true,
            auto_max: None,
        };
        Ok(())
    }

    /// Requests encryption with the lowest I/O capability, raising it up to `max_io_capability` only when the peer
    /// demands authentication.
    pub fn set_conn_security_auto(&self, max_io_capability: IoCapability) -> Result<()> {
        let mut link = self.0.link();
        self.check_unconnected(&link, "security")?;
        link.security = SecurityRequest {
            level: SecurityLevel::EncryptionOnly,
            io_capability: IoCapability::NoInputNoOutput,
            explicit: true,
            auto_max: Some(max_io_capability),
        };
        Ok(())
    }

    /// The (level, I/O capability) to request on connect.
    fn security_for(&self, link: &LinkState) -> (SecurityLevel, IoCapability) {
        let ctx = &self.0.context;
        let (mut level, io) = if link.security.explicit {
            (link.security.level, link.security.io_capability)
        } else if let Some(entry) = ctx.policy.find(&self.0.address, link.name.as_deref()) {
            (entry.level, entry.io_capability.unwrap_or(link.security.io_capability))
        } else {
            (link.security.level, link.security.io_capability)
        };
        if let Some(keys) = link.pairing.pre_paired() {
            level = level.max(keys.security_level);
        }
        (level, io)
    }

    /// The level a completed pairing must reach.
    fn required_level(&self) -> SecurityLevel {
        let min = self.0.context.config.device.min_security_level;
        let link = self.0.link();
        if link.security.explicit && link.security.auto_max.is_none() {
            min.max(link.security.level)
        } else {
            min
        }
    }

    fn request_security(&self, conn: ConnHandle, level: SecurityLevel, io_capability: IoCapability) {
        let device = self.clone();
        self.0.workers.spawn(async move {
            debug!("requesting {:?} ({:?}) on {}", level, io_capability, device.0.address);
            if let Err(err) = device
                .0
                .context
                .transport
                .set_security(conn, level, io_capability)
                .await
            {
                warn!("requesting security on {} failed: {}", device.0.address, err);
                device.settle_without_security().await;
            }
        });
    }

    /// Continues after security could not be established, per the configured tolerance.
    async fn settle_without_security(&self) {
        let config = &self.0.context.config.device;
        if config.tolerate_failed_pairing && SecurityLevel::None.satisfies(config.min_security_level) {
            self.schedule_ready();
        } else if let Err(err) = self.disconnect(HciStatus::AUTHENTICATION_FAILURE).await {
            warn!("disconnecting {} after failed security failed: {}", self.0.address, err);
        }
    }

    fn on_security_event(&self, event: SmpEvent) {
        let mut escalate = None;
        let (actions, conn, settled) = {
            let mut link = self.0.link();
            if !link.state.is_connected() {
                debug!("security event for {} while {:?}", self.0.address, link.state);
                return;
            }
            if let SmpEvent::Pdu {
                pdu: SmpPdu::SecurityRequest(auth),
                from_peer: true,
            } = event
            {
                if let Some(max) = link.security.auto_max {
                    if auth.mitm && link.security.io_capability.rank() < max.rank() {
                        link.security.io_capability = max;
                        link.security.level = SecurityLevel::EncryptionAuthenticated;
                        escalate = Some((SecurityLevel::EncryptionAuthenticated, max));
                    }
                }
            }
            let actions = link.pairing.handle(event);
            if link.pairing.state().is_in_progress() && link.state == DeviceState::Connected {
                link.state = DeviceState::Pairing;
            }
            // Encryption with keys the transport already held, no pairing session.
            let settled = matches!(event, SmpEvent::EncryptionChanged { enabled: true, .. })
                && link.pairing.state() == PairingState::None;
            (actions, link.conn, settled)
        };

        if let Some((level, io_capability)) = escalate {
            info!("{} demands MITM protection, raising I/O capability to {:?}", self.0.address, io_capability);
            self.request_security(conn, level, io_capability);
        }
        for action in actions {
            self.perform(action);
        }
        if settled {
            self.schedule_ready();
        }
    }

    fn perform(&self, action: PairingAction) {
        match action {
            PairingAction::StateChanged { state, mode } => {
                if let Some(adapter) = self.adapter() {
                    adapter.emit("pairing state", |l| l.device_pairing_state(self, state, mode));
                }
            }
            PairingAction::RequestPasskey { session } => {
                let device = self.clone();
                self.0.workers.spawn(async move { device.answer_passkey(session).await });
            }
            PairingAction::ConfirmNumeric { session, passkey } => {
                let device = self.clone();
                self.0
                    .workers
                    .spawn(async move { device.answer_numeric_comparison(session, passkey).await });
            }
            PairingAction::DisplayPasskey(passkey) => {
                if let Some(agent) = self.0.context.agent.clone() {
                    let address = self.0.address;
                    self.0.workers.spawn(async move {
                        call_guarded("pairing agent", || agent.display_passkey(&address, passkey));
                    });
                }
            }
            PairingAction::Completed {
                level,
                keys,
                pre_paired,
            } => self.on_pairing_completed(level, keys, pre_paired),
            PairingAction::Failed { reason } => self.on_pairing_failed(reason),
        }
    }

    async fn answer_passkey(&self, session: u64) {
        let ctx = &self.0.context;
        let entry = ctx.policy.find(&self.0.address, self.name().as_deref());
        let passkey = if let Some(passkey) = entry.and_then(|e| e.passkey) {
            debug!("answering passkey request of {} from security policy", self.0.address);
            Some(passkey)
        } else if let Some(agent) = &ctx.agent {
            agent.request_passkey(&self.0.address).await.ok()
        } else {
            Passkey::try_from(ctx.config.device.default_passkey).ok()
        };
        if let Err(err) = self.reply_passkey(session, passkey).await {
            warn!("passkey reply to {} failed: {}", self.0.address, err);
        }
    }

    async fn answer_numeric_comparison(&self, session: u64, passkey: Passkey) {
        let ctx = &self.0.context;
        let entry = ctx.policy.find(&self.0.address, self.name().as_deref());
        let accept = if let Some(accept) = entry.and_then(|e| e.numeric_comparison) {
            accept
        } else if let Some(agent) = &ctx.agent {
            agent.confirm_passkey(&self.0.address, passkey).await.is_ok()
        } else {
            ctx.config.device.auto_accept_numeric_comparison
        };
        if let Err(err) = self.reply_numeric_comparison(session, accept).await {
            warn!("numeric comparison reply to {} failed: {}", self.0.address, err);
        }
    }

    async fn reply_passkey(&self, session: u64, passkey: Option<Passkey>) -> Result<()> {
        let conn = {
            let mut link = self.0.link();
            if !link.pairing.accept_passkey_reply(session) {
                return Ok(());
            }
            link.conn
        };
        self.0.context.transport.passkey_reply(conn, passkey).await
    }

    async fn reply_numeric_comparison(&self, session: u64, accept: bool) -> Result<()> {
        let conn = {
            let mut link = self.0.link();
            if !link.pairing.accept_numeric_reply(session) {
                return Ok(());
            }
            link.conn
        };
        self.0.context.transport.numeric_comparison_reply(conn, accept).await
    }

    /// Answers an outstanding passkey request.
    ///
    /// A reply that arrives when no passkey is expected (pairing already failed, or the link dropped) is ignored.
    pub async fn set_pairing_passkey(&self, passkey: u32) -> Result<()> {
        let passkey = Passkey::try_from(passkey)?;
        self.ensure_not_removed()?;
        let session = self.0.link().pairing.session();
        self.reply_passkey(session, Some(passkey)).await
    }

    /// Answers an outstanding numeric comparison request. Late replies are ignored.
    pub async fn set_pairing_numeric_comparison(&self, accept: bool) -> Result<()> {
        self.ensure_not_removed()?;
        let session = self.0.link().pairing.session();
        self.reply_numeric_comparison(session, accept).await
    }

    fn on_pairing_completed(&self, level: SecurityLevel, keys: KeyMaterial, pre_paired: bool) {
        {
            let mut link = self.0.link();
            if link.state == DeviceState::Pairing {
                link.state = DeviceState::Connected;
            }
        }
        info!(
            "pairing with {} completed at {:?}{}",
            self.0.address,
            level,
            if pre_paired { " using stored keys" } else { "" }
        );
        if let Some(adapter) = self.adapter() {
            adapter.device_paired(self);
        }

        let required = self.required_level();
        let satisfied = level.satisfies(required);
        if !satisfied {
            warn!(
                "{} paired at {:?}, below the required {:?}",
                self.0.address, level, required
            );
            if let Some(adapter) = self.adapter() {
                adapter.emit("security violation", |l| {
                    l.device_security_violation(self, level, required)
                });
            }
        }

        // Key storage may hit the filesystem, keep it off the delivery task.
        let device = self.clone();
        self.0.workers.spawn(async move {
            if !pre_paired {
                device.store_keys(&keys);
            }
            if satisfied {
                device.schedule_ready();
            } else if let Err(err) = device.disconnect(HciStatus::AUTHENTICATION_FAILURE).await {
                warn!("disconnecting {} failed: {}", device.0.address, err);
            }
        });
    }

    fn store_keys(&self, keys: &KeyMaterial) {
        let ctx = &self.0.context;
        match ctx.key_store.write(&ctx.config.local_address, &self.0.address, keys) {
            Ok(()) => debug!("stored {:?} keys of {}", keys.security_level, self.0.address),
            Err(err) => warn!("storing keys of {} failed: {}", self.0.address, err),
        }
    }

    fn remove_stored_keys(&self) {
        let ctx = &self.0.context;
        match ctx.key_store.remove(&ctx.config.local_address, &self.0.address) {
            Ok(true) => info!("removed stored keys of {}", self.0.address),
            Ok(false) => {}
            Err(err) => warn!("removing stored keys of {} failed: {}", self.0.address, err),
        }
    }

    fn on_pairing_failed(&self, reason: Option<PairingFailure>) {
        match reason {
            Some(reason) => warn!("pairing with {} failed: {}", self.0.address, reason),
            None => warn!("pairing with {} failed", self.0.address),
        }
        let ctx = &self.0.context;
        {
            let mut link = self.0.link();
            if link.state == DeviceState::Pairing {
                link.state = DeviceState::Connected;
            }
            if ctx.config.device.remove_keys_on_failure {
                link.pairing.set_pre_paired(None);
            }
            if let Some(max) = link.security.auto_max {
                if reason == Some(PairingFailure::AuthenticationRequirements) && link.security.io_capability != max {
                    info!("next pairing with {} will use {:?}", self.0.address, max);
                    link.security.io_capability = max;
                    link.security.level = SecurityLevel::EncryptionAuthenticated;
                }
            }
        }
        let remove_keys = ctx.config.device.remove_keys_on_failure;
        let device = self.clone();
        self.0.workers.spawn(async move {
            if remove_keys {
                device.remove_stored_keys();
            }
            device.settle_without_security().await
        });
    }

    /// Loads the key material of this device from a key directory and uploads it, so the next connection is
    /// encrypted without pairing.
    ///
    /// Fails with [`SecurityPolicyViolation`][ErrorKind::SecurityPolicyViolation] if the stored keys are below
    /// `min_level`.
    pub async fn upload_keys(&self, dir: impl AsRef<Path>, min_level: SecurityLevel) -> Result<()> {
        let keys = read_key_file(dir, &self.0.context.config.local_address, &self.0.address)?;
        self.upload_key_material(keys, min_level).await
    }

    /// Uploads the given key material, like [`upload_keys`][Self::upload_keys].
    pub async fn upload_key_material(&self, keys: KeyMaterial, min_level: SecurityLevel) -> Result<()> {
        {
            let link = self.0.link();
            self.check_unconnected(&link, "keys")?;
        }
        if !keys.satisfies(min_level) {
            return Err(Error::new(
                ErrorKind::SecurityPolicyViolation,
                None,
                format!("stored keys are {:?}, {:?} required", keys.security_level, min_level),
            ));
        }
        self.0.context.transport.upload_keys(&self.0.address, &keys).await?;
        info!("uploaded {:?} keys of {}", keys.security_level, self.0.address);
        self.0.link().pairing.set_pre_paired(Some(keys));
        Ok(())
    }

    /// Forgets the bond with this device: removes stored and uploaded keys and drops the link.
    pub async fn unpair(&self) -> Result<()> {
        self.ensure_not_removed()?;
        let ctx = &self.0.context;
        ctx.key_store.remove(&ctx.config.local_address, &self.0.address)?;
        self.0.link().pairing.set_pre_paired(None);
        self.disconnect(HciStatus::REMOTE_USER_TERMINATED_CONNECTION).await?;
        Ok(())
    }
}

async fn run_delivery(device: Weak<DeviceInner>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = device.upgrade() else {
            break;
        };
        Device(inner).handle_link_event(event);
    }
}
