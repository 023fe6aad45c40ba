use crate::{CharacteristicProperties, Descriptor, Uuid};

/// A Bluetooth GATT characteristic
///
/// This is a snapshot taken from the attribute cache of a connection. It becomes stale when that connection ends;
/// using a stale characteristic fails with [`InvalidState`][crate::error::ErrorKind::InvalidState]. Operations on
/// the characteristic are methods of [`Device`][crate::Device].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Characteristic {
    pub(crate) generation: u64,
    pub(crate) index: usize,
    pub(crate) uuid: Uuid,
    pub(crate) service_uuid: Uuid,
    pub(crate) declaration_handle: u16,
    pub(crate) value_handle: u16,
    pub(crate) properties: CharacteristicProperties,
    pub(crate) cccd_handle: Option<u16>,
    pub(crate) user_description_handle: Option<u16>,
    pub(crate) descriptors: Vec<Descriptor>,
}

impl Characteristic {
    /// The [`Uuid`] identifying the type of this GATT characteristic
    #[inline]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The [`Uuid`] of the service containing this characteristic
    #[inline]
    pub fn service_uuid(&self) -> Uuid {
        self.service_uuid
    }

    /// The handle of the characteristic declaration
    #[inline]
    pub fn declaration_handle(&self) -> u16 {
        self.declaration_handle
    }

    /// The handle of the characteristic value
    #[inline]
    pub fn value_handle(&self) -> u16 {
        self.value_handle
    }

    /// The properties of this this GATT characteristic.
    ///
    /// Characteristic properties indicate which operations (e.g. read, write, notify, etc) may be performed on this
    /// characteristic.
    #[inline]
    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    /// Whether the characteristic can notify or indicate value changes
    pub fn supports_notifications(&self) -> bool {
        self.cccd_handle.is_some() && (self.properties.notify || self.properties.indicate)
    }

    /// The Client Characteristic Configuration descriptor, if present
    pub fn client_config(&self) -> Option<&Descriptor> {
        let handle = self.cccd_handle?;
        self.descriptors.iter().find(|d| d.handle == handle)
    }

    /// The Characteristic User Description descriptor, if present
    pub fn user_description(&self) -> Option<&Descriptor> {
        let handle = self.user_description_handle?;
        self.descriptors.iter().find(|d| d.handle == handle)
    }

    /// The descriptors of this characteristic in handle order
    #[inline]
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }
}
