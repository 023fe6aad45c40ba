//! Request/response exchanges over a pair of GATT characteristics.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::listener::{CharacteristicListener, ListenerGuard, ListenerMatch};
use crate::{Characteristic, Device, Error, Result, Uuid, WriteType};

/// Sends commands by writing one characteristic and, optionally, waits for the reply as a notification or
/// indication of another.
///
/// Calls to [`send`][Self::send] on one `GattCommand` are serialized: a second caller waits until the first exchange
/// finished.
pub struct GattCommand {
    device: Device,
    name: String,
    command: Characteristic,
    response: Option<Characteristic>,
    default_timeout: Duration,
    in_flight: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for GattCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GattCommand")
            .field("name", &self.name)
            .field("device", &self.device.address())
            .field("command", &self.command.uuid())
            .field("response", &self.response.as_ref().map(Characteristic::uuid))
            .finish()
    }
}

/// Hands the first update of the response characteristic to the waiting exchange.
struct ResponseSlot {
    value_handle: u16,
    tx: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
}

impl ResponseSlot {
    fn fulfill(&self, characteristic: &Characteristic, value: &[u8]) {
        if characteristic.value_handle() != self.value_handle {
            return;
        }
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = tx {
            let _ = tx.send(value.to_vec());
        }
    }
}

impl CharacteristicListener for ResponseSlot {
    fn notification_received(&self, characteristic: &Characteristic, value: &[u8], _: Instant) {
        self.fulfill(characteristic, value);
    }

    fn indication_received(&self, characteristic: &Characteristic, value: &[u8], _: Instant, _: bool) {
        self.fulfill(characteristic, value);
    }
}

impl GattCommand {
    /// Creates a command over characteristics taken from `device`'s attribute cache.
    pub fn new(
        device: &Device,
        name: impl Into<String>,
        command: Characteristic,
        response: Option<Characteristic>,
    ) -> Self {
        GattCommand {
            device: device.clone(),
            name: name.into(),
            command,
            response,
            default_timeout: device.config().command_timeout(),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Looks the characteristics up by UUID within one service.
    pub fn resolve(
        device: &Device,
        name: impl Into<String>,
        service: Uuid,
        command: Uuid,
        response: Option<Uuid>,
    ) -> Result<Self> {
        let command = device.find_characteristic(Some(service), command)?;
        let response = response
            .map(|uuid| device.find_characteristic(Some(service), uuid))
            .transpose()?;
        Ok(Self::new(device, name, command, response))
    }

    #[allow(missing_docs)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The timeout used by [`send_with_default_timeout`][Self::send_with_default_timeout]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Writes `payload` and, if there is a response characteristic, waits up to `timeout` for the reply.
    ///
    /// The response listener is registered before the write so an immediate reply is not lost. `prefer_no_ack`
    /// selects a write without response when the command characteristic supports it. Returns `Ok(None)` when there is
    /// no response characteristic. An empty reply is returned as `Some` of an empty vector. On
    /// [`Timeout`][ErrorKind::Timeout] the listener is removed again.
    pub async fn send(&self, prefer_no_ack: bool, payload: &[u8], timeout: Duration) -> Result<Option<Vec<u8>>> {
        let _in_flight = self.in_flight.lock().await;
        let write_type = self.write_type(prefer_no_ack)?;
        let Some(response) = &self.response else {
            self.device.write(&self.command, payload, write_type).await?;
            return Ok(None);
        };

        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(ResponseSlot {
            value_handle: response.value_handle(),
            tx: Mutex::new(Some(tx)),
        });
        let handle = self
            .device
            .add_char_listener(ListenerMatch::Characteristic(response.clone()), slot)
            .await?;
        // Removes the listener should this future be dropped mid-exchange.
        let mut guard = ListenerGuard::new(&self.device, handle);

        let result = self.exchange(payload, write_type, rx, timeout).await;

        if let Some(handle) = guard.disarm() {
            if let Err(err) = self.device.remove_char_listener(handle).await {
                debug!("{}: removing response listener failed: {}", self.name, err);
            }
        }
        result.map(Some)
    }

    /// [`send`][Self::send] with the adapter's configured command timeout
    pub async fn send_with_default_timeout(&self, prefer_no_ack: bool, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        self.send(prefer_no_ack, payload, self.default_timeout).await
    }

    /// Writes `payload` without waiting for a response, even if there is a response characteristic.
    pub async fn send_only(&self, prefer_no_ack: bool, payload: &[u8]) -> Result<()> {
        let _in_flight = self.in_flight.lock().await;
        let write_type = self.write_type(prefer_no_ack)?;
        self.device.write(&self.command, payload, write_type).await
    }

    fn write_type(&self, prefer_no_ack: bool) -> Result<WriteType> {
        let props = self.command.properties();
        match (props.write, props.write_without_response) {
            (_, true) if prefer_no_ack => Ok(WriteType::WithoutResponse),
            (true, _) => Ok(WriteType::WithResponse),
            (false, true) => Ok(WriteType::WithoutResponse),
            (false, false) => Err(Error::new(
                ErrorKind::InvalidParameter,
                None,
                format!("{}: characteristic {} is not writable", self.name, self.command.uuid()),
            )),
        }
    }

    async fn exchange(
        &self,
        payload: &[u8],
        write_type: WriteType,
        rx: oneshot::Receiver<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.device.write(&self.command, payload, write_type).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => {
                if value.is_empty() {
                    debug!("{}: empty response", self.name);
                }
                Ok(value)
            }
            Ok(Err(_)) => Err(Error::new(
                ErrorKind::NotConnected,
                None,
                format!("{}: link lost while waiting for the response", self.name),
            )),
            Err(_) => {
                warn!("{}: no response within {:?}", self.name, timeout);
                Err(Error::new(
                    ErrorKind::Timeout,
                    None,
                    format!("{}: no response within {:?}", self.name, timeout),
                ))
            }
        }
    }
}
