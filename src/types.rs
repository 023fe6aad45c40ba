//! Value types shared by the adapter, device and pairing layers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::Error;

/// A 48-bit Bluetooth device address (EUI-48), most significant octet first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// The all-zero address, used for "any" or "unknown".
    pub const ANY: Address = Address([0; 6]);

    /// Creates an address from its six octets, most significant first.
    pub const fn new(octets: [u8; 6]) -> Self {
        Address(octets)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::new(ErrorKind::InvalidParameter, None, format!("invalid address '{s}'"));
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Address(octets))
    }
}

/// The address type of a device identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AddressType {
    /// BR/EDR (classic) address
    BrEdr,
    /// LE public device address
    LePublic,
    /// LE random device address
    LeRandom,
}

impl AddressType {
    /// Whether this address belongs to the LE transport.
    pub fn is_le(self) -> bool {
        !matches!(self, AddressType::BrEdr)
    }
}

/// A device identity: address plus address type. Immutable for the life of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    /// The device address
    pub address: Address,
    /// The address type
    pub kind: AddressType,
}

impl DeviceAddress {
    /// Creates a new device identity
    pub const fn new(address: Address, kind: AddressType) -> Self {
        DeviceAddress { address, kind }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.address, self.kind)
    }
}

/// An HCI connection handle. Zero means "no connection".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnHandle(pub u16);

impl ConnHandle {
    /// The handle of a disconnected device
    pub const NONE: ConnHandle = ConnHandle(0);

    /// Whether this handle refers to a live connection
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// An HCI status / reason code. See the Bluetooth Core Specification, Vol 1, Part F.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HciStatus(pub u8);

#[allow(missing_docs)]
impl HciStatus {
    pub const SUCCESS: HciStatus = HciStatus(0x00);
    pub const UNKNOWN_CONNECTION_IDENTIFIER: HciStatus = HciStatus(0x02);
    pub const HARDWARE_FAILURE: HciStatus = HciStatus(0x03);
    pub const PAGE_TIMEOUT: HciStatus = HciStatus(0x04);
    pub const AUTHENTICATION_FAILURE: HciStatus = HciStatus(0x05);
    pub const PIN_OR_KEY_MISSING: HciStatus = HciStatus(0x06);
    pub const CONNECTION_TIMEOUT: HciStatus = HciStatus(0x08);
    pub const CONNECTION_ALREADY_EXISTS: HciStatus = HciStatus(0x0b);
    pub const COMMAND_DISALLOWED: HciStatus = HciStatus(0x0c);
    pub const REMOTE_USER_TERMINATED_CONNECTION: HciStatus = HciStatus(0x13);
    pub const CONNECTION_TERMINATED_BY_LOCAL_HOST: HciStatus = HciStatus(0x16);
    pub const UNSPECIFIED_ERROR: HciStatus = HciStatus(0x1f);
    pub const INSUFFICIENT_SECURITY: HciStatus = HciStatus(0x2f);
    pub const UNACCEPTABLE_CONNECTION_PARAMETERS: HciStatus = HciStatus(0x3b);
    pub const CONNECTION_FAILED_TO_BE_ESTABLISHED: HciStatus = HciStatus(0x3e);

    /// Whether this status reports success
    pub fn is_success(self) -> bool {
        self == HciStatus::SUCCESS
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            HciStatus::SUCCESS => "success",
            HciStatus::UNKNOWN_CONNECTION_IDENTIFIER => "unknown connection identifier",
            HciStatus::HARDWARE_FAILURE => "hardware failure",
            HciStatus::PAGE_TIMEOUT => "page timeout",
            HciStatus::AUTHENTICATION_FAILURE => "authentication failure",
            HciStatus::PIN_OR_KEY_MISSING => "PIN or key missing",
            HciStatus::CONNECTION_TIMEOUT => "connection timeout",
            HciStatus::CONNECTION_ALREADY_EXISTS => "connection already exists",
            HciStatus::COMMAND_DISALLOWED => "command disallowed",
            HciStatus::REMOTE_USER_TERMINATED_CONNECTION => "remote user terminated connection",
            HciStatus::CONNECTION_TERMINATED_BY_LOCAL_HOST => "connection terminated by local host",
            HciStatus::UNSPECIFIED_ERROR => "unspecified error",
            HciStatus::INSUFFICIENT_SECURITY => "insufficient security",
            HciStatus::UNACCEPTABLE_CONNECTION_PARAMETERS => "unacceptable connection parameters",
            HciStatus::CONNECTION_FAILED_TO_BE_ESTABLISHED => "connection failed to be established",
            _ => return None,
        })
    }
}

impl fmt::Display for HciStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({:#04x})", self.0),
            None => write!(f, "status {:#04x}", self.0),
        }
    }
}

/// Link security level, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SecurityLevel {
    /// No level has been requested yet; the engine picks automatically
    #[default]
    Unset,
    /// No encryption and no authentication
    None,
    /// Encryption without MITM protection (Just Works)
    EncryptionOnly,
    /// Encryption with MITM protection (passkey, numeric comparison, OOB)
    EncryptionAuthenticated,
    /// Authenticated LE Secure Connections with a 128-bit key
    EncryptionAuthenticatedFips,
}

impl SecurityLevel {
    /// Whether this level requires an encrypted link
    pub fn requires_encryption(self) -> bool {
        self >= SecurityLevel::EncryptionOnly
    }

    /// Whether this level requires MITM protection
    pub fn requires_authentication(self) -> bool {
        self >= SecurityLevel::EncryptionAuthenticated
    }

    /// Whether `self` satisfies a `minimum` requirement. `Unset` minimums are always satisfied.
    pub fn satisfies(self, minimum: SecurityLevel) -> bool {
        minimum == SecurityLevel::Unset || self >= minimum
    }
}

/// The GATT role this host plays on a link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GattRole {
    /// Local host consumes the peer's attribute database (central)
    #[default]
    Client,
    /// Local host serves its own attribute database (peripheral)
    Server,
}

/// The adapter's current scan activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ScanType {
    /// Not scanning
    #[default]
    None,
    /// LE scanning without scan requests
    PassiveLe,
    /// LE scanning with scan requests
    ActiveLe,
    /// BR/EDR inquiry
    BrEdr,
    /// LE and BR/EDR interleaved
    Dual,
}

impl ScanType {
    /// Whether any scanning is active
    pub fn is_scanning(self) -> bool {
        self != ScanType::None
    }
}

/// Adapter settings bitmask. Mirrors the controller's current settings.
#[allow(missing_docs)]
#[non_exhaustive]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AdapterSettings {
    pub powered: bool,
    pub connectable: bool,
    pub discoverable: bool,
    pub bondable: bool,
    pub le: bool,
    pub bredr: bool,
    pub secure_connections: bool,
}

impl AdapterSettings {
    /// Raw transmutation from [`u32`].
    pub fn from_bits(bits: u32) -> Self {
        AdapterSettings {
            powered: (bits & (1 << 0)) != 0,
            connectable: (bits & (1 << 1)) != 0,
            discoverable: (bits & (1 << 3)) != 0,
            bondable: (bits & (1 << 4)) != 0,
            bredr: (bits & (1 << 7)) != 0,
            le: (bits & (1 << 9)) != 0,
            secure_connections: (bits & (1 << 11)) != 0,
        }
    }

    /// Raw transmutation to [`u32`].
    pub fn to_bits(self) -> u32 {
        u32::from(self.powered)
            | (u32::from(self.connectable) << 1)
            | (u32::from(self.discoverable) << 3)
            | (u32::from(self.bondable) << 4)
            | (u32::from(self.bredr) << 7)
            | (u32::from(self.le) << 9)
            | (u32::from(self.secure_connections) << 11)
    }

    /// Settings that do not survive a power cycle.
    pub(crate) fn without_transient(self) -> Self {
        AdapterSettings {
            powered: false,
            connectable: false,
            discoverable: false,
            ..self
        }
    }
}

/// When discovery is paused around connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscoveryPolicy {
    /// Discovery is turned off when a device connects and stays off
    AutoOff,
    /// Paused while any device is connected, until it disconnects
    PauseConnectedUntilDisconnected,
    /// Paused while any device is connected, until it is ready
    #[default]
    PauseConnectedUntilReady,
    /// Paused while any device is connected, until it has paired
    PauseConnectedUntilPaired,
    /// Discovery keeps running regardless of connections
    AlwaysOn,
}

/// Parameters for [`Adapter::start_discovery`][crate::Adapter::start_discovery].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryParameters {
    /// Pausing policy around connections
    pub policy: DiscoveryPolicy,
    /// Send scan requests (active scanning)
    pub active: bool,
    /// Scan interval in 0.625 ms units
    pub interval: u16,
    /// Scan window in 0.625 ms units
    pub window: u16,
    /// HCI scan filter policy
    pub filter_policy: u8,
}

impl Default for DiscoveryParameters {
    fn default() -> Self {
        DiscoveryParameters {
            policy: DiscoveryPolicy::default(),
            active: true,
            interval: 24,
            window: 24,
            filter_policy: 0,
        }
    }
}

/// LE connection parameters passed to the transport on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParameters {
    /// Scan interval while initiating, 0.625 ms units
    pub scan_interval: u16,
    /// Scan window while initiating, 0.625 ms units
    pub scan_window: u16,
    /// Minimum connection interval, 1.25 ms units
    pub interval_min: u16,
    /// Maximum connection interval, 1.25 ms units
    pub interval_max: u16,
    /// Peripheral latency in connection events
    pub latency: u16,
    /// Supervision timeout, 10 ms units
    pub supervision_timeout: u16,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        ConnectionParameters {
            scan_interval: 24,
            scan_window: 24,
            interval_min: 8,
            interval_max: 12,
            latency: 0,
            supervision_timeout: 500,
        }
    }
}

impl ConnectionParameters {
    pub(crate) fn validate(&self) -> crate::Result<()> {
        let invalid = |msg: &str| Err(Error::new(ErrorKind::InvalidParameter, None, msg));
        if self.scan_window > self.scan_interval {
            return invalid("scan window exceeds scan interval");
        }
        if self.interval_min > self.interval_max {
            return invalid("minimum connection interval exceeds maximum");
        }
        // supervision timeout (10ms) must exceed (1 + latency) * interval_max (1.25ms) * 2
        let min_timeout = (1 + u32::from(self.latency)) * u32::from(self.interval_max) * 125 * 2 / 1000;
        if u32::from(self.supervision_timeout) <= min_timeout {
            return invalid("supervision timeout too short for interval and latency");
        }
        Ok(())
    }
}

/// How a characteristic value is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteType {
    /// ATT Write Request, acknowledged by the peer
    WithResponse,
    /// ATT Write Command, not acknowledged
    WithoutResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_text() {
        let addr: Address = "C0:26:DA:01:DA:B1".parse().unwrap();
        assert_eq!(addr, Address([0xc0, 0x26, 0xda, 0x01, 0xda, 0xb1]));
        assert_eq!(addr.to_string(), "C0:26:DA:01:DA:B1");
        assert!("C0:26:DA:01:DA".parse::<Address>().is_err());
        assert!("C0:26:DA:01:DA:B1:00".parse::<Address>().is_err());
        assert!("C0:26:DA:01:DA:ZZ".parse::<Address>().is_err());
    }

    #[test]
    fn security_levels_are_ordered() {
        assert!(SecurityLevel::EncryptionAuthenticated.satisfies(SecurityLevel::EncryptionOnly));
        assert!(!SecurityLevel::EncryptionOnly.satisfies(SecurityLevel::EncryptionAuthenticated));
        assert!(SecurityLevel::None.satisfies(SecurityLevel::Unset));
        assert!(!SecurityLevel::None.requires_encryption());
        assert!(SecurityLevel::EncryptionAuthenticatedFips.requires_authentication());
    }

    #[test]
    fn adapter_settings_bits() {
        let settings = AdapterSettings {
            powered: true,
            bondable: true,
            le: true,
            ..Default::default()
        };
        assert_eq!(AdapterSettings::from_bits(settings.to_bits()), settings);
        let cleared = AdapterSettings {
            discoverable: true,
            ..settings
        }
        .without_transient();
        assert!(!cleared.powered && !cleared.discoverable && cleared.bondable && cleared.le);
    }

    #[test]
    fn connection_parameters_validation() {
        assert!(ConnectionParameters::default().validate().is_ok());
        let bad = ConnectionParameters {
            interval_min: 20,
            interval_max: 10,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let short = ConnectionParameters {
            supervision_timeout: 2,
            ..Default::default()
        };
        assert!(short.validate().is_err());
    }
}
