//! Adapter and device configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pairing::IoCapability;
use crate::{
    Address, AddressType, ConnectionParameters, DeviceAddress, DiscoveryParameters, GattRole, Result, SecurityLevel,
};

/// Per-device defaults applied to every [`Device`][crate::Device] an adapter creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// GATT role for locally initiated connections
    pub role: GattRole,
    /// Links below this level after pairing are disconnected
    pub min_security_level: SecurityLevel,
    /// Level requested on connect when neither the application nor the security policy chose one
    pub security_level: SecurityLevel,
    /// I/O capability advertised when pairing
    pub io_capability: IoCapability,
    /// Keep a link whose pairing failed if the minimum level allows an unencrypted link
    pub tolerate_failed_pairing: bool,
    /// Remove stored keys for a peer when pairing with it fails
    pub remove_keys_on_failure: bool,
    /// Answer numeric comparison requests with "accept" when nothing else decides
    pub auto_accept_numeric_comparison: bool,
    /// Passkey replied when neither the security policy nor the pairing agent provides one
    pub default_passkey: u32,
    /// Remove the device from the adapter once it disconnects
    pub remove_on_disconnect: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            role: GattRole::Client,
            min_security_level: SecurityLevel::Unset,
            security_level: SecurityLevel::Unset,
            io_capability: IoCapability::NoInputNoOutput,
            tolerate_failed_pairing: false,
            remove_keys_on_failure: true,
            auto_accept_numeric_comparison: false,
            default_passkey: 0,
            remove_on_disconnect: false,
        }
    }
}

/// Configuration of an [`Adapter`][crate::Adapter].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Controller index
    pub dev_id: u16,
    /// Identity of the local controller; keys are stored per (local, peer) pair
    pub local_address: DeviceAddress,
    /// Parameters used by [`Device::connect`][crate::Device::connect]
    pub connection: ConnectionParameters,
    /// Parameters used when discovery is resumed after a pause
    pub discovery: DiscoveryParameters,
    /// Defaults for new devices
    pub device: DeviceConfig,
    /// Default timeout of [`GattCommand::send`][crate::GattCommand::send], in milliseconds
    pub command_timeout_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        AdapterConfig {
            dev_id: 0,
            local_address: DeviceAddress::new(Address::ANY, AddressType::LePublic),
            connection: ConnectionParameters::default(),
            discovery: DiscoveryParameters::default(),
            device: DeviceConfig::default(),
            command_timeout_ms: 3000,
        }
    }
}

impl AdapterConfig {
    /// Loads a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// The default command timeout
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}
