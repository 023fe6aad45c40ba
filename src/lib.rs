#![warn(missing_docs)]

//! bthost is an asynchronous [Bluetooth] host engine for [Rust]. It drives LE and BR/EDR devices through their
//! connection lifecycle on top of a raw controller [transport][transport::Transport], the HCI/mgmt plumbing plus the
//! L2CAP, ATT and SMP codecs.
//!
//! The engine owns what sits above the codecs: the device lifecycle, the SMP pairing state machine and key handling,
//! the GATT attribute cache of each link, characteristic listeners and request/response commands over GATT.
//!
//! [Rust]: https://www.rust-lang.org/
//! [Bluetooth]: https://www.bluetooth.com/specifications/specs/
//!
//! # Usage
//!
//! ```rust,no_run
//!# use std::sync::Arc;
//!# use bthost::{Adapter, DiscoveryParameters};
//!# use bthost::transport::Transport;
//!# async fn run(transport: Arc<dyn Transport>) -> bthost::Result<()> {
//!let adapter = Adapter::builder(transport).open().await?;
//!adapter.start_discovery(DiscoveryParameters::default()).await?;
//!
//!for device in adapter.discovered_devices() {
//!    println!("{}: {:?} dBm", device, device.rssi());
//!}
//!#
//!#    Ok(())
//!# }
//! ```
//!
//! # Overview
//!
//! - Discovery:
//!   - [Starting][Adapter::start_discovery] and [stopping][Adapter::stop_discovery] discovery, paused while devices
//!     connect according to a [`DiscoveryPolicy`]
//!   - [Status listeners][AdapterStatusListener] for adapter and device lifecycle events
//! - Devices:
//!   - [Connecting][Device::connect], [disconnecting][Device::disconnect] and [removing][Device::remove]
//!   - Pairing with [per-device security][Device::set_conn_security], a [`SecurityPolicy`][policy::SecurityPolicy]
//!     and a [`PairingAgent`][pairing::PairingAgent]
//!   - Persisting bonds in a [`KeyStore`][keys::KeyStore] and [uploading keys][Device::upload_keys] to skip pairing
//! - GATT client:
//!   - [Resolving services][Device::resolve_services] into a per-connection attribute cache
//!   - [Reading][Device::read] and [writing][Device::write] characteristics
//!   - [Characteristic listeners][Device::add_char_listener] and [notification streams][Device::notifications]
//!   - [Commands][GattCommand] that write one characteristic and wait for the reply on another
//!
//! # Threading
//!
//! The engine runs on the Tokio runtime. Each device processes its link events on its own task, so listener callbacks
//! of one device are serialized and see updates in transport order. Callbacks must not block; pairing agents are
//! consulted from separate worker tasks and may.
//!
//! # Snapshots
//!
//! [`Service`], [`Characteristic`] and [`Descriptor`] values are snapshots of the attribute cache of one connection.
//! Once the link drops they are stale, and passing them to a [`Device`] method fails with
//! [`InvalidState`][error::ErrorKind::InvalidState]. Resolve services again after reconnecting.

pub mod adapter;
mod attribute_cache;
pub mod btuuid;
mod characteristic;
pub mod command;
pub mod config;
mod descriptor;
pub mod device;
pub mod error;
pub mod keys;
pub mod listener;
pub mod pairing;
pub mod policy;
mod service;
pub mod smp;
pub mod transport;
mod types;
mod util;

pub use adapter::{Adapter, AdapterBuilder, AdapterStatusListener, StatusListenerHandle};
pub use btuuid::BluetoothUuidExt;
pub use characteristic::Characteristic;
pub use command::GattCommand;
pub use descriptor::Descriptor;
pub use device::{Device, DeviceState, DisconnectOutcome};
pub use error::Error;
pub use listener::{CharacteristicListener, ListenerHandle, ListenerMatch, Notification, Notifications};
pub use service::Service;
pub use types::{
    AdapterSettings, Address, AddressType, ConnHandle, ConnectionParameters, DeviceAddress, DiscoveryParameters,
    DiscoveryPolicy, GattRole, HciStatus, ScanType, SecurityLevel, WriteType,
};
pub use uuid::Uuid;

/// Convenience alias for a result with [`Error`]
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// GATT characteristic properties as defined in the Bluetooth Core Specification, Vol 3, Part G, §3.3.1.1.
/// Extended properties are also included as defined in §3.3.3.1.
#[allow(missing_docs)]
#[non_exhaustive]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CharacteristicProperties {
    pub broadcast: bool,
    pub read: bool,
    pub write_without_response: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
    pub authenticated_signed_writes: bool,
    pub extended_properties: bool,
    pub reliable_write: bool,
    pub writable_auxiliaries: bool,
}

impl CharacteristicProperties {
    /// Raw transmutation from [`u32`].
    ///
    /// Extended properties are in the upper bits.
    pub fn from_bits(bits: u32) -> Self {
        CharacteristicProperties {
            broadcast: (bits & (1 << 0)) != 0,
            read: (bits & (1 << 1)) != 0,
            write_without_response: (bits & (1 << 2)) != 0,
            write: (bits & (1 << 3)) != 0,
            notify: (bits & (1 << 4)) != 0,
            indicate: (bits & (1 << 5)) != 0,
            authenticated_signed_writes: (bits & (1 << 6)) != 0,
            extended_properties: (bits & (1 << 7)) != 0,
            reliable_write: (bits & (1 << 8)) != 0,
            writable_auxiliaries: (bits & (1 << 9)) != 0,
        }
    }

    /// Raw transmutation to [`u32`].
    ///
    /// Extended properties are in the upper bits.
    pub fn to_bits(self) -> u32 {
        u32::from(self.broadcast)
            | (u32::from(self.read) << 1)
            | (u32::from(self.write_without_response) << 2)
            | (u32::from(self.write) << 3)
            | (u32::from(self.notify) << 4)
            | (u32::from(self.indicate) << 5)
            | (u32::from(self.authenticated_signed_writes) << 6)
            | (u32::from(self.extended_properties) << 7)
            | (u32::from(self.reliable_write) << 8)
            | (u32::from(self.writable_auxiliaries) << 9)
    }
}
