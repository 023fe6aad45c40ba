//! Per-peer security policy lookup.

use std::sync::RwLock;

use crate::pairing::{IoCapability, Passkey};
use crate::{Address, DeviceAddress, SecurityLevel};

/// Security settings provisioned for a peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityEntry {
    /// Security level to request when connecting
    pub level: SecurityLevel,
    /// I/O capability to advertise when pairing
    pub io_capability: Option<IoCapability>,
    /// Passkey to answer passkey-entry requests with
    pub passkey: Option<Passkey>,
    /// Answer to numeric comparison requests
    pub numeric_comparison: Option<bool>,
}

/// Resolves the provisioned security settings for a peer.
pub trait SecurityPolicy: Send + Sync {
    /// Finds the entry for `peer`, falling back to a match on its advertised `name`.
    fn find(&self, peer: &DeviceAddress, name: Option<&str>) -> Option<SecurityEntry>;
}

#[derive(Debug, Clone)]
enum Matcher {
    Address(Address),
    NamePrefix(String),
}

/// A table of security entries keyed by address or by name prefix, with an optional default.
///
/// Address matches win over name matches; among name matches the longest prefix wins.
#[derive(Debug, Default)]
pub struct SecurityRegistry {
    entries: RwLock<Vec<(Matcher, SecurityEntry)>>,
    default: RwLock<Option<SecurityEntry>>,
}

impl SecurityRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the entry for `address`
    pub fn set_for_address(&self, address: Address, entry: SecurityEntry) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|(m, _)| !matches!(m, Matcher::Address(a) if *a == address));
        entries.push((Matcher::Address(address), entry));
    }

    /// Adds or replaces the entry for names starting with `prefix`
    pub fn set_for_name_prefix(&self, prefix: impl Into<String>, entry: SecurityEntry) {
        let prefix = prefix.into();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|(m, _)| !matches!(m, Matcher::NamePrefix(p) if *p == prefix));
        entries.push((Matcher::NamePrefix(prefix), entry));
    }

    /// Sets the entry used when nothing else matches
    pub fn set_default(&self, entry: Option<SecurityEntry>) {
        *self.default.write().unwrap_or_else(|e| e.into_inner()) = entry;
    }

    /// Removes every entry, including the default
    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.set_default(None);
    }
}

impl SecurityPolicy for SecurityRegistry {
    fn find(&self, peer: &DeviceAddress, name: Option<&str>) -> Option<SecurityEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let by_address = entries.iter().find_map(|(m, entry)| match m {
            Matcher::Address(a) if *a == peer.address => Some(*entry),
            _ => None,
        });
        by_address
            .or_else(|| {
                let name = name?;
                entries
                    .iter()
                    .filter_map(|(m, entry)| match m {
                        Matcher::NamePrefix(p) if name.starts_with(p.as_str()) => Some((p.len(), *entry)),
                        _ => None,
                    })
                    .max_by_key(|(len, _)| *len)
                    .map(|(_, entry)| entry)
            })
            .or_else(|| *self.default.read().unwrap_or_else(|e| e.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AddressType;

    fn peer(last: u8) -> DeviceAddress {
        DeviceAddress::new(Address::new([0, 1, 2, 3, 4, last]), AddressType::LePublic)
    }

    #[test]
    fn address_beats_name_and_longest_prefix_wins() {
        let registry = SecurityRegistry::new();
        let by_name = SecurityEntry {
            passkey: Some(Passkey::new(1)),
            ..Default::default()
        };
        let by_longer_name = SecurityEntry {
            passkey: Some(Passkey::new(2)),
            ..Default::default()
        };
        let by_address = SecurityEntry {
            passkey: Some(Passkey::new(3)),
            ..Default::default()
        };
        registry.set_for_name_prefix("TAG", by_name);
        registry.set_for_name_prefix("TAG-1", by_longer_name);
        registry.set_for_address(peer(9).address, by_address);

        assert_eq!(registry.find(&peer(1), Some("TAG-100")), Some(by_longer_name));
        assert_eq!(registry.find(&peer(1), Some("TAG-200")), Some(by_name));
        assert_eq!(registry.find(&peer(9), Some("TAG-100")), Some(by_address));
        assert_eq!(registry.find(&peer(1), Some("other")), None);
        assert_eq!(registry.find(&peer(1), None), None);
    }

    #[test]
    fn default_entry_is_the_fallback() {
        let registry = SecurityRegistry::new();
        let fallback = SecurityEntry {
            level: SecurityLevel::EncryptionOnly,
            ..Default::default()
        };
        registry.set_default(Some(fallback));
        assert_eq!(registry.find(&peer(1), None), Some(fallback));
        registry.clear();
        assert_eq!(registry.find(&peer(1), None), None);
    }
}
