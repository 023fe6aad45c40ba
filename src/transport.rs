//! The boundary between the host engine and the controller transport.
//!
//! A [`Transport`] owns the HCI/mgmt plumbing and the L2CAP/ATT/SMP codecs. The engine calls its request methods
//! and consumes one stream of unsolicited [`TransportEvent`]s. Request methods must complete on their own; they may
//! never wait for an event to be consumed from the stream.

use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::keys::KeyMaterial;
use crate::pairing::{IoCapability, Passkey};
use crate::smp::SmpEvent;
use crate::{
    AdapterSettings, CharacteristicProperties, ConnHandle, ConnectionParameters, DeviceAddress, DiscoveryParameters,
    HciStatus, Result, ScanType, SecurityLevel, Uuid, WriteType,
};

/// A discovered GATT service, as returned by [`Transport::discover_services`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    #[allow(missing_docs)]
    pub uuid: Uuid,
    /// Primary or secondary service
    pub primary: bool,
    /// First attribute handle of the service
    pub start_handle: u16,
    /// Last attribute handle of the service
    pub end_handle: u16,
    #[allow(missing_docs)]
    pub characteristics: Vec<CharacteristicDefinition>,
}

/// A discovered GATT characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDefinition {
    #[allow(missing_docs)]
    pub uuid: Uuid,
    /// Handle of the characteristic declaration
    pub declaration_handle: u16,
    /// Handle of the characteristic value
    pub value_handle: u16,
    #[allow(missing_docs)]
    pub properties: CharacteristicProperties,
    #[allow(missing_docs)]
    pub descriptors: Vec<DescriptorDefinition>,
}

/// A discovered GATT descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorDefinition {
    #[allow(missing_docs)]
    pub uuid: Uuid,
    #[allow(missing_docs)]
    pub handle: u16,
}

/// An advertising report or inquiry result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    /// The reporting device
    pub peer: DeviceAddress,
    /// Advertised local name, if any
    pub name: Option<String>,
    /// Signal strength in dBm
    pub rssi: Option<i8>,
    /// Set for connectable advertisements
    pub connectable: bool,
    /// When the report was received
    pub timestamp: Instant,
}

/// Adapter-wide events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// The controller settings changed; a cleared `powered` bit means the adapter was powered off
    SettingsChanged(AdapterSettings),
    /// Discovery started or stopped on the controller
    DiscoveringChanged(ScanType),
    /// A device was seen during discovery
    DeviceFound(DeviceReport),
}

/// Events concerning one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A connection attempt finished, or a peer connected to us
    Connected {
        #[allow(missing_docs)]
        handle: ConnHandle,
        /// Non-success status means the attempt failed
        status: HciStatus,
    },
    /// The link is gone
    Disconnected {
        #[allow(missing_docs)]
        reason: HciStatus,
    },
    /// An ATT Handle Value Notification
    Notification {
        #[allow(missing_docs)]
        value_handle: u16,
        #[allow(missing_docs)]
        value: Vec<u8>,
        #[allow(missing_docs)]
        timestamp: Instant,
    },
    /// An ATT Handle Value Indication
    Indication {
        #[allow(missing_docs)]
        value_handle: u16,
        #[allow(missing_docs)]
        value: Vec<u8>,
        #[allow(missing_docs)]
        timestamp: Instant,
        /// Whether the transport already sent the confirmation
        confirmed: bool,
    },
    /// A pairing PDU or security event
    Security(SmpEvent),
}

/// An unsolicited event from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    #[allow(missing_docs)]
    Adapter(AdapterEvent),
    /// An event for the link to `peer`
    Link {
        #[allow(missing_docs)]
        peer: DeviceAddress,
        #[allow(missing_docs)]
        event: LinkEvent,
    },
}

/// The controller transport a host engine drives.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Takes the event stream. The stream can be taken only once; later calls fail with
    /// [`AlreadyInProgress`][crate::error::ErrorKind::AlreadyInProgress].
    fn take_events(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Current controller settings
    async fn adapter_settings(&self) -> Result<AdapterSettings>;

    /// Starts discovery and returns the scan type the controller runs
    async fn start_discovery(&self, params: &DiscoveryParameters) -> Result<ScanType>;

    #[allow(missing_docs)]
    async fn stop_discovery(&self) -> Result<()>;

    /// Initiates a connection. Completion is reported with [`LinkEvent::Connected`].
    async fn connect(&self, peer: &DeviceAddress, params: &ConnectionParameters) -> Result<()>;

    /// Initiates a disconnect. Completion is reported with [`LinkEvent::Disconnected`].
    async fn disconnect(&self, handle: ConnHandle, reason: HciStatus) -> Result<()>;

    /// Runs the primary service, characteristic and descriptor discovery procedures
    async fn discover_services(&self, handle: ConnHandle) -> Result<Vec<ServiceDefinition>>;

    /// Reads an attribute value
    async fn read(&self, handle: ConnHandle, attribute: u16) -> Result<Vec<u8>>;

    /// Writes an attribute value
    async fn write(&self, handle: ConnHandle, attribute: u16, value: &[u8], write_type: WriteType) -> Result<()>;

    /// Sends a Handle Value Notification from the local server
    async fn send_notification(&self, handle: ConnHandle, attribute: u16, value: &[u8]) -> Result<()>;

    /// Sends a Handle Value Indication from the local server and waits for its confirmation
    async fn send_indication(&self, handle: ConnHandle, attribute: u16, value: &[u8]) -> Result<()>;

    /// Requests `level` on the link, pairing with `io_capability` if needed
    async fn set_security(&self, handle: ConnHandle, level: SecurityLevel, io_capability: IoCapability) -> Result<()>;

    /// Answers a passkey request; `None` rejects it
    async fn passkey_reply(&self, handle: ConnHandle, passkey: Option<Passkey>) -> Result<()>;

    /// Answers a numeric comparison request
    async fn numeric_comparison_reply(&self, handle: ConnHandle, accept: bool) -> Result<()>;

    /// Loads stored keys for `peer` into the controller so the next connection is encrypted without pairing
    async fn upload_keys(&self, peer: &DeviceAddress, keys: &KeyMaterial) -> Result<()>;
}
