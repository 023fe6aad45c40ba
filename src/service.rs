use crate::{Characteristic, Uuid};

/// A Bluetooth GATT service
///
/// A snapshot taken from the attribute cache of a connection, like [`Characteristic`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Service {
    pub(crate) generation: u64,
    pub(crate) uuid: Uuid,
    pub(crate) primary: bool,
    pub(crate) start_handle: u16,
    pub(crate) end_handle: u16,
    pub(crate) characteristics: Vec<Characteristic>,
}

impl Service {
    /// The [`Uuid`] identifying the type of this GATT service
    #[inline]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Whether this is a primary service of the device.
    #[inline]
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// The attribute handle range of this service
    #[inline]
    pub fn handle_range(&self) -> std::ops::RangeInclusive<u16> {
        self.start_handle..=self.end_handle
    }

    /// The characteristics of this service in handle order
    #[inline]
    pub fn characteristics(&self) -> &[Characteristic] {
        &self.characteristics
    }

    /// The first characteristic with the given [`Uuid`]
    pub fn characteristic(&self, uuid: Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}
