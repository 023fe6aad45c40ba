//! The per-connection GATT attribute cache.
//!
//! Services, characteristics and descriptors live in flat arenas; parents refer to their children by index range and
//! children to their parent by index. Snapshots handed out to applications carry the cache generation so they can be
//! checked against the cache that is current when they are used again.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::btuuid::descriptors::{CHARACTERISTIC_USER_DESCRIPTION, CLIENT_CHARACTERISTIC_CONFIGURATION};
use crate::error::ErrorKind;
use crate::transport::ServiceDefinition;
use crate::{Characteristic, CharacteristicProperties, Descriptor, Error, Result, Service, Uuid};

#[derive(Debug)]
struct ServiceEntry {
    uuid: Uuid,
    primary: bool,
    start_handle: u16,
    end_handle: u16,
    characteristics: Range<usize>,
}

#[derive(Debug)]
struct CharacteristicEntry {
    service: usize,
    uuid: Uuid,
    declaration_handle: u16,
    value_handle: u16,
    properties: CharacteristicProperties,
    descriptors: Range<usize>,
    cccd: Option<usize>,
    user_description: Option<usize>,
}

#[derive(Debug)]
struct DescriptorEntry {
    uuid: Uuid,
    handle: u16,
}

// Shared by every device so a snapshot of one peer never validates against another.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// A generation no other cache has used.
pub(crate) fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug)]
pub(crate) struct AttributeCache {
    generation: u64,
    services: Vec<ServiceEntry>,
    characteristics: Vec<CharacteristicEntry>,
    descriptors: Vec<DescriptorEntry>,
    by_value_handle: HashMap<u16, usize>,
    values: HashMap<u16, Vec<u8>>,
}

impl AttributeCache {
    pub(crate) fn build(generation: u64, definitions: Vec<ServiceDefinition>) -> Self {
        let mut cache = AttributeCache {
            generation,
            services: Vec::with_capacity(definitions.len()),
            characteristics: Vec::new(),
            descriptors: Vec::new(),
            by_value_handle: HashMap::new(),
            values: HashMap::new(),
        };

        for (service_index, service) in definitions.into_iter().enumerate() {
            let first_char = cache.characteristics.len();
            for characteristic in service.characteristics {
                let index = cache.characteristics.len();
                let first_desc = cache.descriptors.len();
                let mut cccd = None;
                let mut user_description = None;
                for descriptor in characteristic.descriptors {
                    let desc_index = cache.descriptors.len();
                    if descriptor.uuid == CLIENT_CHARACTERISTIC_CONFIGURATION {
                        cccd = Some(desc_index);
                    } else if descriptor.uuid == CHARACTERISTIC_USER_DESCRIPTION {
                        user_description = Some(desc_index);
                    }
                    cache.descriptors.push(DescriptorEntry {
                        uuid: descriptor.uuid,
                        handle: descriptor.handle,
                    });
                }
                if cache
                    .by_value_handle
                    .insert(characteristic.value_handle, index)
                    .is_some()
                {
                    debug!("duplicate value handle {:#06x} in discovery result", characteristic.value_handle);
                }
                cache.characteristics.push(CharacteristicEntry {
                    service: service_index,
                    uuid: characteristic.uuid,
                    declaration_handle: characteristic.declaration_handle,
                    value_handle: characteristic.value_handle,
                    properties: characteristic.properties,
                    descriptors: first_desc..cache.descriptors.len(),
                    cccd,
                    user_description,
                });
            }
            cache.services.push(ServiceEntry {
                uuid: service.uuid,
                primary: service.primary,
                start_handle: service.start_handle,
                end_handle: service.end_handle,
                characteristics: first_char..cache.characteristics.len(),
            });
        }
        cache
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn services(&self) -> Vec<Service> {
        (0..self.services.len()).map(|i| self.service(i)).collect()
    }

    fn service(&self, index: usize) -> Service {
        let entry = &self.services[index];
        Service {
            generation: self.generation,
            uuid: entry.uuid,
            primary: entry.primary,
            start_handle: entry.start_handle,
            end_handle: entry.end_handle,
            characteristics: entry.characteristics.clone().map(|i| self.characteristic(i)).collect(),
        }
    }

    fn characteristic(&self, index: usize) -> Characteristic {
        let entry = &self.characteristics[index];
        let handle_of = |i: Option<usize>| i.map(|i| self.descriptors[i].handle);
        Characteristic {
            generation: self.generation,
            index,
            uuid: entry.uuid,
            service_uuid: self.services.get(entry.service).map_or(entry.uuid, |s| s.uuid),
            declaration_handle: entry.declaration_handle,
            value_handle: entry.value_handle,
            properties: entry.properties,
            cccd_handle: handle_of(entry.cccd),
            user_description_handle: handle_of(entry.user_description),
            descriptors: entry
                .descriptors
                .clone()
                .map(|i| Descriptor {
                    generation: self.generation,
                    uuid: self.descriptors[i].uuid,
                    handle: self.descriptors[i].handle,
                    characteristic_value_handle: entry.value_handle,
                })
                .collect(),
        }
    }

    pub(crate) fn characteristic_by_value_handle(&self, value_handle: u16) -> Option<Characteristic> {
        self.by_value_handle
            .get(&value_handle)
            .map(|&index| self.characteristic(index))
    }

    pub(crate) fn find_service(&self, uuid: Uuid) -> Option<Service> {
        self.services.iter().position(|s| s.uuid == uuid).map(|i| self.service(i))
    }

    /// Finds a characteristic by UUID, optionally restricted to one service.
    pub(crate) fn find_characteristic(&self, service: Option<Uuid>, uuid: Uuid) -> Option<Characteristic> {
        self.characteristics
            .iter()
            .position(|c| c.uuid == uuid && service.map_or(true, |s| self.services[c.service].uuid == s))
            .map(|i| self.characteristic(i))
    }

    /// Checks that `characteristic` was taken from this cache and returns its value handle.
    pub(crate) fn validate(&self, characteristic: &Characteristic) -> Result<u16> {
        if characteristic.generation != self.generation {
            return Err(Error::new(
                ErrorKind::InvalidState,
                None,
                "characteristic belongs to another connection",
            ));
        }
        match self.characteristics.get(characteristic.index) {
            Some(entry) if entry.value_handle == characteristic.value_handle => Ok(entry.value_handle),
            _ => Err(Error::new(ErrorKind::NotFound, None, "characteristic not in attribute cache")),
        }
    }

    pub(crate) fn validate_descriptor(&self, descriptor: &Descriptor) -> Result<u16> {
        if descriptor.generation != self.generation {
            return Err(Error::new(
                ErrorKind::InvalidState,
                None,
                "descriptor belongs to another connection",
            ));
        }
        if self.descriptors.iter().any(|d| d.handle == descriptor.handle) {
            Ok(descriptor.handle)
        } else {
            Err(Error::new(ErrorKind::NotFound, None, "descriptor not in attribute cache"))
        }
    }

    /// The CCCD handle of the characteristic with `value_handle`
    pub(crate) fn cccd_handle(&self, value_handle: u16) -> Option<u16> {
        let index = *self.by_value_handle.get(&value_handle)?;
        self.characteristics[index].cccd.map(|i| self.descriptors[i].handle)
    }

    pub(crate) fn cached_value(&self, value_handle: u16) -> Option<&[u8]> {
        self.values.get(&value_handle).map(Vec::as_slice)
    }

    pub(crate) fn store_value(&mut self, value_handle: u16, value: &[u8]) {
        if self.by_value_handle.contains_key(&value_handle) {
            self.values.insert(value_handle, value.to_vec());
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::btuuid::{bluetooth_uuid_from_u16, characteristics, services};
    use crate::transport::{CharacteristicDefinition, DescriptorDefinition};

    pub(crate) fn battery_service() -> ServiceDefinition {
        ServiceDefinition {
            uuid: services::BATTERY,
            primary: true,
            start_handle: 0x10,
            end_handle: 0x14,
            characteristics: vec![CharacteristicDefinition {
                uuid: characteristics::BATTERY_LEVEL,
                declaration_handle: 0x11,
                value_handle: 0x12,
                properties: CharacteristicProperties::from_bits(0x12),
                descriptors: vec![
                    DescriptorDefinition {
                        uuid: CLIENT_CHARACTERISTIC_CONFIGURATION,
                        handle: 0x13,
                    },
                    DescriptorDefinition {
                        uuid: CHARACTERISTIC_USER_DESCRIPTION,
                        handle: 0x14,
                    },
                ],
            }],
        }
    }

    fn generic_access() -> ServiceDefinition {
        ServiceDefinition {
            uuid: services::GENERIC_ACCESS,
            primary: true,
            start_handle: 0x01,
            end_handle: 0x03,
            characteristics: vec![CharacteristicDefinition {
                uuid: characteristics::DEVICE_NAME,
                declaration_handle: 0x02,
                value_handle: 0x03,
                properties: CharacteristicProperties::from_bits(0x02),
                descriptors: vec![],
            }],
        }
    }

    #[test]
    fn lookups_and_descriptor_index() {
        let cache = AttributeCache::build(3, vec![generic_access(), battery_service()]);
        assert_eq!(cache.services().len(), 2);

        let level = cache.find_characteristic(None, characteristics::BATTERY_LEVEL).unwrap();
        assert_eq!(level.service_uuid(), services::BATTERY);
        assert_eq!(level.value_handle(), 0x12);
        assert_eq!(level.client_config().map(|d| d.handle()), Some(0x13));
        assert_eq!(level.user_description().map(|d| d.handle()), Some(0x14));
        assert!(level.supports_notifications());
        assert_eq!(cache.cccd_handle(0x12), Some(0x13));

        let name = cache.characteristic_by_value_handle(0x03).unwrap();
        assert!(!name.supports_notifications());
        assert_eq!(cache.cccd_handle(0x03), None);

        assert!(cache
            .find_characteristic(Some(services::GENERIC_ACCESS), characteristics::BATTERY_LEVEL)
            .is_none());
        assert!(cache.find_service(bluetooth_uuid_from_u16(0x1234)).is_none());
    }

    #[test]
    fn stale_snapshots_are_rejected() {
        let old = AttributeCache::build(1, vec![battery_service()]);
        let level = old.find_characteristic(None, characteristics::BATTERY_LEVEL).unwrap();
        assert_eq!(old.validate(&level).unwrap(), 0x12);

        let new = AttributeCache::build(2, vec![battery_service()]);
        assert_eq!(new.validate(&level).unwrap_err().kind(), ErrorKind::InvalidState);
        let cccd = level.client_config().unwrap();
        assert_eq!(
            new.validate_descriptor(cccd).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn value_cache_only_holds_known_handles() {
        let mut cache = AttributeCache::build(1, vec![battery_service()]);
        cache.store_value(0x12, &[99]);
        cache.store_value(0x40, &[1]);
        assert_eq!(cache.cached_value(0x12), Some(&[99][..]));
        assert_eq!(cache.cached_value(0x40), None);
    }

    #[test]
    fn generations_are_never_reused() {
        let a = next_generation();
        let b = next_generation();
        assert!(b > a);
        let cache = AttributeCache::build(b, vec![battery_service()]);
        let stale = AttributeCache::build(a, vec![battery_service()]).services()[0].characteristics()[0].clone();
        assert_eq!(cache.validate(&stale).unwrap_err().kind(), ErrorKind::InvalidState);
    }
}
