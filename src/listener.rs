//! Characteristic listeners and the per-device listener registry.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Instant;

use futures_core::Stream;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::device::DeviceInner;
use crate::{Characteristic, Device, DeviceAddress};

/// Receives value updates of remote characteristics.
///
/// Callbacks run on the device's event delivery task: they are serialized per device and see updates in the order
/// the transport produced them. They must not block; hand long work off to another task. A panicking callback is
/// logged and does not affect other listeners.
pub trait CharacteristicListener: Send + Sync {
    /// A notification was received
    fn notification_received(&self, _characteristic: &Characteristic, _value: &[u8], _timestamp: Instant) {}

    /// An indication was received. `confirmation_sent` is true if the transport already confirmed it.
    fn indication_received(
        &self,
        _characteristic: &Characteristic,
        _value: &[u8],
        _timestamp: Instant,
        _confirmation_sent: bool,
    ) {
    }
}

/// Which characteristics a listener receives updates for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerMatch {
    /// Updates of one characteristic. Registration enables notifications and/or indications in its CCCD.
    Characteristic(Characteristic),
    /// Updates of every characteristic that is already enabled by someone else
    All,
}

/// Identifies a registered listener. Handles are never reused within a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerHandle(u64);

/// Enabled bits of a Client Characteristic Configuration descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CccdState {
    pub(crate) notify: bool,
    pub(crate) indicate: bool,
}

impl CccdState {
    pub(crate) fn to_value(self) -> [u8; 2] {
        [u8::from(self.notify) | (u8::from(self.indicate) << 1), 0]
    }

    pub(crate) fn union(self, other: CccdState) -> CccdState {
        CccdState {
            notify: self.notify || other.notify,
            indicate: self.indicate || other.indicate,
        }
    }

    pub(crate) fn contains(self, other: CccdState) -> bool {
        (self.notify || !other.notify) && (self.indicate || !other.indicate)
    }

    pub(crate) fn is_empty(self) -> bool {
        !self.notify && !self.indicate
    }
}

struct Entry {
    target: Option<u16>,
    wants: CccdState,
    listener: Arc<dyn CharacteristicListener>,
}

/// Listener bookkeeping of one device.
///
/// `entries` is the application-facing list in registration order. `by_value_handle` and `match_all` form the
/// dispatch index used when an update arrives. Both views must always describe the same set of listeners.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: u64,
    entries: BTreeMap<ListenerHandle, Entry>,
    by_value_handle: HashMap<u16, Vec<ListenerHandle>>,
    match_all: Vec<ListenerHandle>,
    cccd: HashMap<u16, CccdState>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("count", &self.count())
            .field("dispatch_count", &self.dispatch_count())
            .field("cccd", &self.cccd)
            .finish()
    }
}

impl ListenerRegistry {
    pub(crate) fn insert(
        &mut self,
        target: Option<u16>,
        wants: CccdState,
        listener: Arc<dyn CharacteristicListener>,
    ) -> ListenerHandle {
        self.next_id += 1;
        let handle = ListenerHandle(self.next_id);
        match target {
            Some(value_handle) => self.by_value_handle.entry(value_handle).or_default().push(handle),
            None => self.match_all.push(handle),
        }
        self.entries.insert(
            handle,
            Entry {
                target,
                wants,
                listener,
            },
        );
        handle
    }

    /// Removes a listener. Returns its target value handle (`Some(None)` for match-all listeners).
    pub(crate) fn remove(&mut self, handle: ListenerHandle) -> Option<Option<u16>> {
        let entry = self.entries.remove(&handle)?;
        match entry.target {
            Some(value_handle) => {
                if let Some(handles) = self.by_value_handle.get_mut(&value_handle) {
                    handles.retain(|h| *h != handle);
                    if handles.is_empty() {
                        self.by_value_handle.remove(&value_handle);
                    }
                }
            }
            None => self.match_all.retain(|h| *h != handle),
        }
        Some(entry.target)
    }

    /// Handles of the listeners registered on exactly `value_handle`
    pub(crate) fn handles_for(&self, value_handle: u16) -> Vec<ListenerHandle> {
        self.entries
            .iter()
            .filter(|(_, e)| e.target == Some(value_handle))
            .map(|(h, _)| *h)
            .collect()
    }

    pub(crate) fn handles(&self) -> Vec<ListenerHandle> {
        self.entries.keys().copied().collect()
    }

    /// The CCCD bits the remaining listeners of `value_handle` need
    pub(crate) fn required(&self, value_handle: u16) -> CccdState {
        self.entries
            .values()
            .filter(|e| e.target == Some(value_handle))
            .fold(CccdState::default(), |acc, e| acc.union(e.wants))
    }

    pub(crate) fn enabled(&self, value_handle: u16) -> CccdState {
        self.cccd.get(&value_handle).copied().unwrap_or_default()
    }

    pub(crate) fn set_enabled(&mut self, value_handle: u16, state: CccdState) {
        if state.is_empty() {
            self.cccd.remove(&value_handle);
        } else {
            self.cccd.insert(value_handle, state);
        }
    }

    /// Listeners interested in an update of `value_handle`, in registration order
    pub(crate) fn matching(&self, value_handle: u16) -> Vec<Arc<dyn CharacteristicListener>> {
        let mut handles: Vec<ListenerHandle> = self
            .by_value_handle
            .get(&value_handle)
            .into_iter()
            .flatten()
            .chain(self.match_all.iter())
            .copied()
            .collect();
        handles.sort_unstable();
        handles
            .into_iter()
            .filter_map(|h| self.entries.get(&h).map(|e| e.listener.clone()))
            .collect()
    }

    /// Drops every listener and all CCCD bookkeeping.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.by_value_handle.clear();
        self.match_all.clear();
        self.cccd.clear();
    }

    /// Number of registered listeners
    pub(crate) fn count(&self) -> usize {
        self.entries.len()
    }

    /// Number of listeners reachable through the dispatch index
    pub(crate) fn dispatch_count(&self) -> usize {
        self.by_value_handle.values().map(Vec::len).sum::<usize>() + self.match_all.len()
    }

    /// Cross-checks the registration list against the dispatch index, logging any mismatch.
    pub(crate) fn check_consistency(&self, peer: &DeviceAddress, context: &str) -> bool {
        let (count, dispatch) = (self.count(), self.dispatch_count());
        if count != dispatch {
            error!(
                "listener registry of {} inconsistent after {}: {} registered, {} dispatchable",
                peer, context, count, dispatch
            );
            return false;
        }
        true
    }
}

/// Removes a listener when dropped, unless disarmed first.
pub(crate) struct ListenerGuard {
    device: Weak<DeviceInner>,
    handle: Option<ListenerHandle>,
}

impl ListenerGuard {
    pub(crate) fn new(device: &Device, handle: ListenerHandle) -> Self {
        ListenerGuard {
            device: Arc::downgrade(&device.0),
            handle: Some(handle),
        }
    }

    pub(crate) fn disarm(&mut self) -> Option<ListenerHandle> {
        self.handle.take()
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        let (Some(handle), Some(inner)) = (self.handle.take(), self.device.upgrade()) else {
            return;
        };
        let device = Device(inner);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = device.remove_char_listener(handle).await {
                        debug!("removing dropped listener of {}: {}", device.address(), err);
                    }
                });
            }
            // Without a runtime the CCCD cannot be written; drop the bookkeeping only.
            Err(_) => device.forget_char_listener(handle),
        }
    }
}

/// A value update delivered through [`Notifications`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    #[allow(missing_docs)]
    pub value: Vec<u8>,
    /// When the transport received the update
    pub timestamp: Instant,
    /// Whether the update was an indication
    pub indication: bool,
}

struct Forwarder(mpsc::UnboundedSender<Notification>);

impl CharacteristicListener for Forwarder {
    fn notification_received(&self, _characteristic: &Characteristic, value: &[u8], timestamp: Instant) {
        let _ = self.0.send(Notification {
            value: value.to_vec(),
            timestamp,
            indication: false,
        });
    }

    fn indication_received(&self, _characteristic: &Characteristic, value: &[u8], timestamp: Instant, _: bool) {
        let _ = self.0.send(Notification {
            value: value.to_vec(),
            timestamp,
            indication: true,
        });
    }
}

/// A stream of value updates of one characteristic, returned by [`Device::notifications`].
///
/// The stream ends when the link goes down. Dropping it removes the underlying listener.
pub struct Notifications {
    rx: mpsc::UnboundedReceiver<Notification>,
    _guard: ListenerGuard,
}

impl Notifications {
    pub(crate) fn channel() -> (Arc<dyn CharacteristicListener>, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Forwarder(tx)), rx)
    }

    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Notification>, guard: ListenerGuard) -> Self {
        Notifications { rx, _guard: guard }
    }
}

impl Stream for Notifications {
    type Item = Notification;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
