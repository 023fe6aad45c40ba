//! Pairing I/O capabilities, passkeys and the application pairing agent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::DeviceAddress;

/// Bluetooth input/output capabilities for pairing
///
/// See the Bluetooth Core Specification, Vol 3, Part H, §2.3.2
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IoCapability {
    /// Can display a passkey but not accept user input
    DisplayOnly,
    /// Can display a passkey and request simple confirmation from the user
    DisplayYesNo,
    /// Can request a passkey from the user but not display anything
    KeyboardOnly,
    /// Cannot display anything to or request anything from the user
    NoInputNoOutput,
    /// Can display a passkey to and/or request a passkey or confirmation from the user
    KeyboardDisplay,
}

impl IoCapability {
    /// Rank used when escalating automatic security; higher ranks allow authenticated pairing with more peers.
    pub(crate) fn rank(self) -> u8 {
        match self {
            IoCapability::NoInputNoOutput => 0,
            IoCapability::DisplayOnly => 1,
            IoCapability::KeyboardOnly => 2,
            IoCapability::DisplayYesNo => 3,
            IoCapability::KeyboardDisplay => 4,
        }
    }
}

impl From<IoCapability> for u8 {
    fn from(val: IoCapability) -> u8 {
        match val {
            IoCapability::DisplayOnly => 0x00,
            IoCapability::DisplayYesNo => 0x01,
            IoCapability::KeyboardOnly => 0x02,
            IoCapability::NoInputNoOutput => 0x03,
            IoCapability::KeyboardDisplay => 0x04,
        }
    }
}

impl TryFrom<u8> for IoCapability {
    type Error = crate::Error;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        Ok(match val {
            0x00 => IoCapability::DisplayOnly,
            0x01 => IoCapability::DisplayYesNo,
            0x02 => IoCapability::KeyboardOnly,
            0x03 => IoCapability::NoInputNoOutput,
            0x04 => IoCapability::KeyboardDisplay,
            _ => return Err(crate::error::ErrorKind::InvalidParameter.into()),
        })
    }
}

/// An error indicating the pairing request has been rejected
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub struct PairingRejected;

impl std::fmt::Display for PairingRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("pairing rejected")
    }
}

impl std::error::Error for PairingRejected {}

/// An error returned when trying to convert an invalid value value into a [`Passkey`]
///
/// `Passkey`s must be a 6-digit numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InvalidPasskey(());

impl std::fmt::Display for InvalidPasskey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("invalid passkey")
    }
}

impl std::error::Error for InvalidPasskey {}

impl From<InvalidPasskey> for crate::Error {
    fn from(err: InvalidPasskey) -> Self {
        crate::Error::new(crate::error::ErrorKind::InvalidParameter, Some(Box::new(err)), "")
    }
}

/// A Bluetooth 6-digit passkey
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Passkey(u32);

impl Passkey {
    /// The largest valid passkey
    pub const MAX: u32 = 999_999;

    /// Creates a new `Passkey` from a `u32`
    ///
    /// # Panics
    ///
    /// Panics if `n` has more than six digits.
    pub fn new(n: u32) -> Self {
        assert!(n <= Self::MAX);
        Passkey(n)
    }
}

impl std::fmt::Display for Passkey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

impl From<Passkey> for u32 {
    fn from(val: Passkey) -> Self {
        val.0
    }
}

impl TryFrom<u32> for Passkey {
    type Error = InvalidPasskey;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value <= Self::MAX {
            Ok(Passkey(value))
        } else {
            Err(InvalidPasskey(()))
        }
    }
}

impl std::str::FromStr for Passkey {
    type Err = InvalidPasskey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>()
            .map_err(|_| InvalidPasskey(()))
            .and_then(Passkey::try_from)
    }
}

/// An application pairing agent, consulted when the security policy has no answer for a peer.
///
/// Agent methods are always invoked from a worker task, never from a device's event delivery task, so they may take
/// as long as the user needs. A reply that arrives after pairing has failed or the link dropped is discarded.
#[async_trait]
pub trait PairingAgent: Send + Sync {
    /// Request a 6 digit numeric passkey from the user.
    async fn request_passkey(&self, _peer: &DeviceAddress) -> Result<Passkey, PairingRejected> {
        Err(PairingRejected)
    }

    /// Request confirmation that `passkey` matches the value shown on the peer (numeric comparison).
    async fn confirm_passkey(&self, _peer: &DeviceAddress, _passkey: Passkey) -> Result<(), PairingRejected> {
        Err(PairingRejected)
    }

    /// Display a 6 digit numeric passkey to the user for entry on the peer.
    fn display_passkey(&self, _peer: &DeviceAddress, _passkey: Passkey) {}
}

/// The simplest possible pairing agent.
///
/// This agent does not interact with the user and rejects every request that needs input or confirmation, which
/// leaves only "Just Works" pairing.
pub struct NoInputOutputPairingAgent;

#[async_trait]
impl PairingAgent for NoInputOutputPairingAgent {}
