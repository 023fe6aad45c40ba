use crate::Uuid;

/// A Bluetooth GATT descriptor
///
/// This is a snapshot taken from the attribute cache of a connection. It becomes stale when that connection ends;
/// using a stale descriptor fails with [`InvalidState`][crate::error::ErrorKind::InvalidState].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub(crate) generation: u64,
    pub(crate) uuid: Uuid,
    pub(crate) handle: u16,
    pub(crate) characteristic_value_handle: u16,
}

impl Descriptor {
    /// The [`Uuid`] identifying the type of this GATT descriptor
    #[inline]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The attribute handle of this descriptor
    #[inline]
    pub fn handle(&self) -> u16 {
        self.handle
    }

    /// The value handle of the characteristic this descriptor belongs to
    #[inline]
    pub fn characteristic_value_handle(&self) -> u16 {
        self.characteristic_value_handle
    }
}
