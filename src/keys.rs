//! Pairing key material and its persistent storage.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::{DeviceAddress, Error, Result, SecurityLevel};

/// An LE long term key, with the identifiers used to look it up on re-encryption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongTermKey {
    /// The 128-bit key
    pub key: [u8; 16],
    /// Encrypted diversifier (legacy pairing only)
    pub ediv: u16,
    /// Random number (legacy pairing only)
    pub rand: u64,
    /// Negotiated key size in octets
    pub key_size: u8,
    /// Whether the key was generated with MITM protection
    pub authenticated: bool,
    /// Whether the key was generated with LE Secure Connections
    pub secure_connections: bool,
}

/// An identity resolving key with the identity address it resolves to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityResolvingKey {
    #[allow(missing_docs)]
    pub key: [u8; 16],
    /// The identity address distributed with the key
    pub identity: Option<DeviceAddress>,
}

/// A connection signature resolving key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureKey {
    #[allow(missing_docs)]
    pub key: [u8; 16],
    /// Whether the key was generated with MITM protection
    pub authenticated: bool,
}

/// A BR/EDR link key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkKey {
    #[allow(missing_docs)]
    pub key: [u8; 16],
    /// HCI link key type
    pub key_type: u8,
    /// PIN length used for legacy pairing
    pub pin_length: u8,
}

/// A single key distributed during pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributedKey {
    #[allow(missing_docs)]
    LongTermKey(LongTermKey),
    #[allow(missing_docs)]
    IdentityResolvingKey(IdentityResolvingKey),
    #[allow(missing_docs)]
    SignatureKey(SignatureKey),
    #[allow(missing_docs)]
    LinkKey(LinkKey),
}

/// Keys distributed by one side of a pairing.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet {
    pub ltk: Option<LongTermKey>,
    pub irk: Option<IdentityResolvingKey>,
    pub csrk: Option<SignatureKey>,
}

impl KeySet {
    fn store(&mut self, key: DistributedKey) {
        match key {
            DistributedKey::LongTermKey(k) => self.ltk = Some(k),
            DistributedKey::IdentityResolvingKey(k) => self.irk = Some(k),
            DistributedKey::SignatureKey(k) => self.csrk = Some(k),
            DistributedKey::LinkKey(_) => {}
        }
    }
}

/// The key material of one bonded peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    /// The peer this material belongs to
    pub peer: Option<DeviceAddress>,
    /// Security level the keys were generated at
    pub security_level: SecurityLevel,
    /// Keys distributed by the local host
    pub local: KeySet,
    /// Keys distributed by the peer
    pub remote: KeySet,
    /// BR/EDR link key
    pub link_key: Option<LinkKey>,
}

impl KeyMaterial {
    /// Whether there is any key that can encrypt a link
    pub fn has_encryption_key(&self) -> bool {
        self.local.ltk.is_some() || self.remote.ltk.is_some() || self.link_key.is_some()
    }

    /// Whether this material is usable and was generated at `minimum` or better
    pub fn satisfies(&self, minimum: SecurityLevel) -> bool {
        self.has_encryption_key() && self.security_level.satisfies(minimum)
    }

    pub(crate) fn store(&mut self, key: DistributedKey, from_peer: bool) {
        match key {
            DistributedKey::LinkKey(k) => self.link_key = Some(k),
            key if from_peer => self.remote.store(key),
            key => self.local.store(key),
        }
    }
}

/// Persistent storage for pairing key material, keyed by the (local, peer) identity pair.
///
/// Implementations serialize their own accesses; the engine calls them from delivery and worker tasks without
/// holding any device lock.
pub trait KeyStore: Send + Sync {
    /// Reads the stored material, `Ok(None)` if there is none
    fn read(&self, local: &DeviceAddress, peer: &DeviceAddress) -> Result<Option<KeyMaterial>>;

    /// Stores `keys`, replacing any previous material
    fn write(&self, local: &DeviceAddress, peer: &DeviceAddress, keys: &KeyMaterial) -> Result<()>;

    /// Removes the stored material. Returns whether anything was removed.
    fn remove(&self, local: &DeviceAddress, peer: &DeviceAddress) -> Result<bool>;
}

/// A [`KeyStore`] that keeps keys in memory only.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<(DeviceAddress, DeviceAddress), KeyMaterial>>,
}

impl MemoryKeyStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn read(&self, local: &DeviceAddress, peer: &DeviceAddress) -> Result<Option<KeyMaterial>> {
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        Ok(keys.get(&(*local, *peer)).cloned())
    }

    fn write(&self, local: &DeviceAddress, peer: &DeviceAddress, keys: &KeyMaterial) -> Result<()> {
        let mut map = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        map.insert((*local, *peer), keys.clone());
        Ok(())
    }

    fn remove(&self, local: &DeviceAddress, peer: &DeviceAddress) -> Result<bool> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        Ok(keys.remove(&(*local, *peer)).is_some())
    }
}

/// A [`KeyStore`] holding one JSON file per (local, peer) pair in a directory.
#[derive(Debug)]
pub struct FileKeyStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileKeyStore {
    /// Opens (creating if needed) a key directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(FileKeyStore {
            dir,
            lock: Mutex::new(()),
        })
    }

    /// The directory keys are stored in
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn file_name(local: &DeviceAddress, peer: &DeviceAddress) -> String {
        let hex = |a: &DeviceAddress| a.address.0.iter().map(|b| format!("{b:02x}")).collect::<String>();
        let kind = |a: &DeviceAddress| match a.kind {
            crate::AddressType::BrEdr => 'c',
            crate::AddressType::LePublic => 'p',
            crate::AddressType::LeRandom => 'r',
        };
        format!("bd_{}{}_{}{}.json", hex(local), kind(local), hex(peer), kind(peer))
    }

    fn file_path(&self, local: &DeviceAddress, peer: &DeviceAddress) -> PathBuf {
        self.dir.join(Self::file_name(local, peer))
    }
}

impl KeyStore for FileKeyStore {
    fn read(&self, local: &DeviceAddress, peer: &DeviceAddress) -> Result<Option<KeyMaterial>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.file_path(local, peer);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let keys: KeyMaterial = serde_json::from_slice(&data)?;
        if keys.peer.is_some_and(|p| p != *peer) {
            warn!("key file {} belongs to {:?}, not {}", path.display(), keys.peer, peer);
            return Err(Error::new(ErrorKind::InvalidParameter, None, "key file peer mismatch"));
        }
        Ok(Some(keys))
    }

    fn write(&self, local: &DeviceAddress, peer: &DeviceAddress, keys: &KeyMaterial) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.file_path(local, peer);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(keys)?;
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        debug!("stored keys for {} in {}", peer, path.display());
        Ok(())
    }

    fn remove(&self, local: &DeviceAddress, peer: &DeviceAddress) -> Result<bool> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match std::fs::remove_file(self.file_path(local, peer)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/// Reads the key material for `peer` out of a key directory, as written by [`FileKeyStore`].
pub fn read_key_file(dir: impl AsRef<Path>, local: &DeviceAddress, peer: &DeviceAddress) -> Result<KeyMaterial> {
    let store = FileKeyStore {
        dir: dir.as_ref().to_path_buf(),
        lock: Mutex::new(()),
    };
    store
        .read(local, peer)?
        .ok_or_else(|| Error::new(ErrorKind::NotFound, None, format!("no keys for {peer}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Address, AddressType};

    fn addr(last: u8) -> DeviceAddress {
        DeviceAddress::new(Address::new([0xc0, 0, 0, 0, 0, last]), AddressType::LePublic)
    }

    fn sample(peer: DeviceAddress) -> KeyMaterial {
        let mut keys = KeyMaterial {
            peer: Some(peer),
            security_level: SecurityLevel::EncryptionAuthenticated,
            ..Default::default()
        };
        keys.store(
            DistributedKey::LongTermKey(LongTermKey {
                key: [7; 16],
                key_size: 16,
                authenticated: true,
                ..Default::default()
            }),
            true,
        );
        keys
    }

    #[test]
    fn satisfies_requires_a_key_and_level() {
        let keys = sample(addr(1));
        assert!(keys.satisfies(SecurityLevel::EncryptionOnly));
        assert!(!keys.satisfies(SecurityLevel::EncryptionAuthenticatedFips));
        assert!(!KeyMaterial::default().satisfies(SecurityLevel::Unset));
    }

    #[test]
    fn memory_store_is_keyed_by_pair() {
        let store = MemoryKeyStore::new();
        let keys = sample(addr(2));
        store.write(&addr(0), &addr(2), &keys).unwrap();
        assert_eq!(store.read(&addr(0), &addr(2)).unwrap(), Some(keys));
        assert_eq!(store.read(&addr(9), &addr(2)).unwrap(), None);
        assert!(store.remove(&addr(0), &addr(2)).unwrap());
        assert!(!store.remove(&addr(0), &addr(2)).unwrap());
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let keys = sample(addr(3));
        FileKeyStore::open(dir.path())
            .unwrap()
            .write(&addr(0), &addr(3), &keys)
            .unwrap();

        let reopened = FileKeyStore::open(dir.path()).unwrap();
        assert_eq!(reopened.read(&addr(0), &addr(3)).unwrap(), Some(keys.clone()));
        assert_eq!(read_key_file(dir.path(), &addr(0), &addr(3)).unwrap(), keys);
        assert!(reopened.remove(&addr(0), &addr(3)).unwrap());
        assert_eq!(reopened.read(&addr(0), &addr(3)).unwrap(), None);
        assert_eq!(
            read_key_file(dir.path(), &addr(0), &addr(3)).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn malformed_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join(FileKeyStore::file_name(&addr(0), &addr(4))), b"{ not json").unwrap();
        assert_eq!(
            store.read(&addr(0), &addr(4)).unwrap_err().kind(),
            ErrorKind::InvalidParameter
        );
    }
}
