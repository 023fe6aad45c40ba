//! Security Manager Protocol pairing state tracking.
//!
//! The transport performs the SMP cryptography. This module observes the decoded PDUs and security events of one
//! link, decides the association model, tracks key distribution and tells the device layer what to do next.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, warn};

use crate::keys::{DistributedKey, KeyMaterial};
use crate::pairing::{IoCapability, Passkey};
use crate::{DeviceAddress, SecurityLevel};

/// Pairing progress of a link.
///
/// `Completed` and `Failed` are terminal for a pairing session: no further user interaction is requested for that
/// session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PairingState {
    /// No pairing in progress
    #[default]
    None,
    /// The peer (responder) sent a security request
    RequestedByResponder,
    /// Pairing request seen, waiting for the response
    FeatureExchangeStarted,
    /// Features exchanged and association model chosen
    FeatureExchangeCompleted,
    /// Waiting for the local passkey reply
    PasskeyExpected,
    /// Waiting for the local numeric comparison reply
    NumericCompareExpected,
    /// Waiting for out-of-band data
    OobExpected,
    /// Link encrypted, keys being distributed
    KeyDistribution,
    /// Pairing succeeded
    Completed,
    /// Pairing failed
    Failed,
}

impl PairingState {
    /// Whether a pairing session is underway
    pub fn is_in_progress(self) -> bool {
        !matches!(
            self,
            PairingState::None | PairingState::Completed | PairingState::Failed
        )
    }

    /// Whether the state ends a pairing session
    pub fn is_terminal(self) -> bool {
        matches!(self, PairingState::Completed | PairingState::Failed)
    }
}

/// The association model in use, from the local point of view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PairingMode {
    /// Not determined
    #[default]
    None,
    /// Unauthenticated "Just Works"
    JustWorks,
    /// The local side enters the passkey
    PasskeyEntryInput,
    /// The local side displays the passkey
    PasskeyEntryDisplay,
    /// Both sides confirm a displayed value
    NumericComparison,
    /// Out of band
    OutOfBand,
    /// Keys were uploaded before connecting; pairing was skipped
    PrePaired,
}

/// What one side does during passkey entry.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PasskeyAction {
    Display,
    Input,
}

/// The association model chosen from the exchanged pairing features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairingMethod {
    #[allow(missing_docs)]
    JustWorks,
    #[allow(missing_docs)]
    NumericComparison,
    /// Passkey entry with the action each side performs
    PasskeyEntry {
        #[allow(missing_docs)]
        initiator: PasskeyAction,
        #[allow(missing_docs)]
        responder: PasskeyAction,
    },
    #[allow(missing_docs)]
    OutOfBand,
}

impl PairingMethod {
    /// Whether the method gives MITM protection
    pub fn is_authenticated(self) -> bool {
        !matches!(self, PairingMethod::JustWorks)
    }
}

/// SMP AuthReq flags.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AuthRequirements {
    pub bonding: bool,
    pub mitm: bool,
    pub secure_connections: bool,
    pub keypress: bool,
}

impl AuthRequirements {
    /// Raw transmutation from [`u8`].
    pub fn from_bits(bits: u8) -> Self {
        AuthRequirements {
            bonding: (bits & 0x03) == 0x01,
            mitm: (bits & 0x04) != 0,
            secure_connections: (bits & 0x08) != 0,
            keypress: (bits & 0x10) != 0,
        }
    }

    /// Raw transmutation to [`u8`].
    pub fn to_bits(self) -> u8 {
        u8::from(self.bonding)
            | (u8::from(self.mitm) << 2)
            | (u8::from(self.secure_connections) << 3)
            | (u8::from(self.keypress) << 4)
    }
}

/// SMP key distribution flags.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct KeyDistribution {
    pub enc_key: bool,
    pub id_key: bool,
    pub sign_key: bool,
    pub link_key: bool,
}

impl KeyDistribution {
    /// Raw transmutation from [`u8`].
    pub fn from_bits(bits: u8) -> Self {
        KeyDistribution {
            enc_key: (bits & 0x01) != 0,
            id_key: (bits & 0x02) != 0,
            sign_key: (bits & 0x04) != 0,
            link_key: (bits & 0x08) != 0,
        }
    }

    /// Raw transmutation to [`u8`].
    pub fn to_bits(self) -> u8 {
        u8::from(self.enc_key)
            | (u8::from(self.id_key) << 1)
            | (u8::from(self.sign_key) << 2)
            | (u8::from(self.link_key) << 3)
    }

    fn contains(self, other: KeyDistribution) -> bool {
        let bits = other.to_bits();
        self.to_bits() & bits == bits
    }

    fn mark(&mut self, key: &DistributedKey) {
        match key {
            DistributedKey::LongTermKey(_) => self.enc_key = true,
            DistributedKey::IdentityResolvingKey(_) => self.id_key = true,
            DistributedKey::SignatureKey(_) => self.sign_key = true,
            DistributedKey::LinkKey(_) => self.link_key = true,
        }
    }
}

/// Pairing request or response features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairingFeatures {
    #[allow(missing_docs)]
    pub io_capability: IoCapability,
    /// OOB authentication data present
    pub oob_data_present: bool,
    #[allow(missing_docs)]
    pub auth: AuthRequirements,
    /// Maximum encryption key size, 7..=16
    pub max_key_size: u8,
    /// Keys the initiator distributes
    pub initiator_keys: KeyDistribution,
    /// Keys the responder distributes
    pub responder_keys: KeyDistribution,
}

impl Default for PairingFeatures {
    fn default() -> Self {
        PairingFeatures {
            io_capability: IoCapability::NoInputNoOutput,
            oob_data_present: false,
            auth: AuthRequirements {
                bonding: true,
                ..Default::default()
            },
            max_key_size: 16,
            initiator_keys: KeyDistribution::default(),
            responder_keys: KeyDistribution::default(),
        }
    }
}

/// SMP Pairing Failed reason codes. See the Bluetooth Core Specification, Vol 3, Part H, §3.5.5
#[allow(missing_docs)]
#[repr(u8)]
#[derive(Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum PairingFailure {
    /// passkey entry failed
    PasskeyEntryFailed = 0x01,
    /// OOB data not available
    OobNotAvailable = 0x02,
    /// authentication requirements cannot be met
    AuthenticationRequirements = 0x03,
    /// confirm value failed
    ConfirmValueFailed = 0x04,
    /// pairing not supported
    PairingNotSupported = 0x05,
    /// encryption key size too short
    EncryptionKeySize = 0x06,
    /// command not supported
    CommandNotSupported = 0x07,
    /// unspecified reason
    UnspecifiedReason = 0x08,
    /// repeated attempts
    RepeatedAttempts = 0x09,
    /// invalid parameters
    InvalidParameters = 0x0a,
    /// DHKey check failed
    DhKeyCheckFailed = 0x0b,
    /// numeric comparison failed
    NumericComparisonFailed = 0x0c,
    /// BR/EDR pairing in progress
    BrEdrPairingInProgress = 0x0d,
    /// cross-transport key derivation not allowed
    GenerationNotAllowed = 0x0e,
    /// key rejected
    KeyRejected = 0x0f,
    /// busy
    Busy = 0x10,
}

/// A decoded SMP PDU.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpPdu {
    SecurityRequest(AuthRequirements),
    PairingRequest(PairingFeatures),
    PairingResponse(PairingFeatures),
    PairingConfirm,
    PairingRandom,
    PairingPublicKey,
    PairingDhKeyCheck,
    KeypressNotification,
    PairingFailed(PairingFailure),
}

/// Security events of a link, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpEvent {
    /// An SMP PDU sent (`from_peer == false`) or received on the link
    Pdu {
        #[allow(missing_docs)]
        pdu: SmpPdu,
        #[allow(missing_docs)]
        from_peer: bool,
    },
    /// The local side must supply a passkey
    PasskeyRequest,
    /// The local side must display this passkey
    PasskeyDisplay(Passkey),
    /// The local side must confirm that this value matches the peer's
    NumericComparisonRequest(Passkey),
    /// The local side must supply out-of-band data
    OobRequest,
    /// A key was generated or distributed
    KeyDistributed {
        #[allow(missing_docs)]
        key: DistributedKey,
        #[allow(missing_docs)]
        from_peer: bool,
    },
    /// Link encryption was switched on or off
    EncryptionChanged {
        #[allow(missing_docs)]
        enabled: bool,
        #[allow(missing_docs)]
        key_size: u8,
    },
}

/// Chooses the association model for the given initiator and responder features.
///
/// See the Bluetooth Core Specification, Vol 3, Part H, §2.3.5.1. Numeric comparison is only available with LE
/// Secure Connections; legacy pairing falls back to Just Works or passkey entry.
pub fn choose_pairing_method(initiator: &PairingFeatures, responder: &PairingFeatures) -> PairingMethod {
    use IoCapability::*;
    use PasskeyAction::*;

    let sc = initiator.auth.secure_connections && responder.auth.secure_connections;
    let oob = if sc {
        initiator.oob_data_present || responder.oob_data_present
    } else {
        initiator.oob_data_present && responder.oob_data_present
    };
    if oob {
        return PairingMethod::OutOfBand;
    }
    if !initiator.auth.mitm && !responder.auth.mitm {
        return PairingMethod::JustWorks;
    }

    let passkey = |initiator, responder| PairingMethod::PasskeyEntry { initiator, responder };
    let numeric_or = |fallback| if sc { PairingMethod::NumericComparison } else { fallback };

    match (responder.io_capability, initiator.io_capability) {
        (NoInputNoOutput, _) | (_, NoInputNoOutput) => PairingMethod::JustWorks,
        (DisplayOnly, KeyboardOnly | KeyboardDisplay) => passkey(Input, Display),
        (DisplayOnly, _) => PairingMethod::JustWorks,
        (DisplayYesNo, DisplayYesNo) => numeric_or(PairingMethod::JustWorks),
        (DisplayYesNo, KeyboardOnly) => passkey(Input, Display),
        (DisplayYesNo, KeyboardDisplay) => numeric_or(passkey(Input, Display)),
        (DisplayYesNo, DisplayOnly) => PairingMethod::JustWorks,
        (KeyboardOnly, KeyboardOnly) => passkey(Input, Input),
        (KeyboardOnly, _) => passkey(Display, Input),
        (KeyboardDisplay, DisplayOnly) => passkey(Display, Input),
        (KeyboardDisplay, DisplayYesNo) => numeric_or(passkey(Display, Input)),
        (KeyboardDisplay, KeyboardOnly) => passkey(Input, Display),
        (KeyboardDisplay, KeyboardDisplay) => numeric_or(passkey(Input, Display)),
    }
}

/// What the device layer must do in response to a security event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PairingAction {
    StateChanged {
        state: PairingState,
        mode: PairingMode,
    },
    RequestPasskey {
        session: u64,
    },
    ConfirmNumeric {
        session: u64,
        passkey: Passkey,
    },
    DisplayPasskey(Passkey),
    Completed {
        level: SecurityLevel,
        keys: KeyMaterial,
        pre_paired: bool,
    },
    Failed {
        reason: Option<PairingFailure>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingInput {
    Passkey,
    NumericComparison,
}

/// Pairing context of one link.
///
/// Every new pairing session gets a fresh session id; replies carry the id they were requested under so that a
/// late reply to an abandoned session is recognised and dropped.
#[derive(Debug)]
pub(crate) struct PairingContext {
    peer: DeviceAddress,
    state: PairingState,
    mode: PairingMode,
    session: u64,
    local_is_initiator: bool,
    initiator: Option<PairingFeatures>,
    method: Option<PairingMethod>,
    secure_connections: bool,
    expected_local: KeyDistribution,
    expected_remote: KeyDistribution,
    got_local: KeyDistribution,
    got_remote: KeyDistribution,
    keys: KeyMaterial,
    key_size: u8,
    level: SecurityLevel,
    pending: Option<PendingInput>,
    pre_paired: Option<KeyMaterial>,
}

impl PairingContext {
    pub(crate) fn new(peer: DeviceAddress) -> Self {
        PairingContext {
            peer,
            state: PairingState::None,
            mode: PairingMode::None,
            session: 0,
            local_is_initiator: true,
            initiator: None,
            method: None,
            secure_connections: false,
            expected_local: KeyDistribution::default(),
            expected_remote: KeyDistribution::default(),
            got_local: KeyDistribution::default(),
            got_remote: KeyDistribution::default(),
            keys: KeyMaterial::default(),
            key_size: 0,
            level: SecurityLevel::None,
            pending: None,
            pre_paired: None,
        }
    }

    pub(crate) fn state(&self) -> PairingState {
        self.state
    }

    pub(crate) fn mode(&self) -> PairingMode {
        self.mode
    }

    pub(crate) fn session(&self) -> u64 {
        self.session
    }

    /// The security level of the link as currently established
    pub(crate) fn security_level(&self) -> SecurityLevel {
        self.level
    }

    pub(crate) fn pre_paired(&self) -> Option<&KeyMaterial> {
        self.pre_paired.as_ref()
    }

    pub(crate) fn set_pre_paired(&mut self, keys: Option<KeyMaterial>) {
        self.pre_paired = keys;
    }

    /// Clears every per-link field. Uploaded keys survive; they belong to the next connection.
    pub(crate) fn reset(&mut self) {
        let pre_paired = self.pre_paired.take();
        let session = self.session + 1;
        *self = PairingContext::new(self.peer);
        self.session = session;
        self.pre_paired = pre_paired;
    }

    /// Consumes an outstanding passkey request of `session`. Returns `false` for late or unexpected replies.
    pub(crate) fn accept_passkey_reply(&mut self, session: u64) -> bool {
        self.accept_reply(session, PairingState::PasskeyExpected, PendingInput::Passkey)
    }

    /// Consumes an outstanding numeric comparison request of `session`.
    pub(crate) fn accept_numeric_reply(&mut self, session: u64) -> bool {
        self.accept_reply(session, PairingState::NumericCompareExpected, PendingInput::NumericComparison)
    }

    fn accept_reply(&mut self, session: u64, state: PairingState, input: PendingInput) -> bool {
        if session == self.session && self.state == state && self.pending == Some(input) {
            self.pending = None;
            true
        } else {
            debug!(
                "dropping stale pairing reply for {} (session {}, current {} in {:?})",
                self.peer, session, self.session, self.state
            );
            false
        }
    }

    pub(crate) fn handle(&mut self, event: SmpEvent) -> Vec<PairingAction> {
        let mut actions = Vec::new();
        match event {
            SmpEvent::Pdu { pdu, from_peer } => self.handle_pdu(pdu, from_peer, &mut actions),
            SmpEvent::PasskeyRequest => {
                if self.accepts_user_input() {
                    self.begin_user_input(PairingMode::PasskeyEntryInput, &mut actions);
                    self.pending = Some(PendingInput::Passkey);
                    self.transition(PairingState::PasskeyExpected, &mut actions);
                    actions.push(PairingAction::RequestPasskey { session: self.session });
                } else {
                    debug!("ignoring passkey request for {} in {:?}", self.peer, self.state);
                }
            }
            SmpEvent::NumericComparisonRequest(passkey) => {
                if self.accepts_user_input() {
                    self.begin_user_input(PairingMode::NumericComparison, &mut actions);
                    self.pending = Some(PendingInput::NumericComparison);
                    self.transition(PairingState::NumericCompareExpected, &mut actions);
                    actions.push(PairingAction::ConfirmNumeric {
                        session: self.session,
                        passkey,
                    });
                } else {
                    debug!("ignoring numeric comparison for {} in {:?}", self.peer, self.state);
                }
            }
            SmpEvent::PasskeyDisplay(passkey) => {
                if self.accepts_user_input() {
                    self.begin_user_input(PairingMode::PasskeyEntryDisplay, &mut actions);
                    actions.push(PairingAction::DisplayPasskey(passkey));
                }
            }
            SmpEvent::OobRequest => {
                if self.accepts_user_input() {
                    self.begin_user_input(PairingMode::OutOfBand, &mut actions);
                    self.transition(PairingState::OobExpected, &mut actions);
                }
            }
            SmpEvent::KeyDistributed { key, from_peer } => self.handle_key(key, from_peer, &mut actions),
            SmpEvent::EncryptionChanged { enabled, key_size } => {
                self.handle_encryption(enabled, key_size, &mut actions)
            }
        }
        actions
    }

    fn handle_pdu(&mut self, pdu: SmpPdu, from_peer: bool, actions: &mut Vec<PairingAction>) {
        match pdu {
            SmpPdu::SecurityRequest(_) if from_peer => {
                if self.state.is_in_progress() {
                    warn!("{} requested security while pairing is in {:?}", self.peer, self.state);
                } else {
                    self.start_session();
                    self.transition(PairingState::RequestedByResponder, actions);
                }
            }
            SmpPdu::SecurityRequest(_) => {}
            SmpPdu::PairingRequest(features) => {
                if self.state.is_in_progress() && self.state != PairingState::RequestedByResponder {
                    warn!("rejecting pairing request for {} while in {:?}", self.peer, self.state);
                    return;
                }
                if self.state != PairingState::RequestedByResponder {
                    self.start_session();
                }
                self.local_is_initiator = !from_peer;
                self.initiator = Some(features);
                self.transition(PairingState::FeatureExchangeStarted, actions);
            }
            SmpPdu::PairingResponse(responder) => {
                let Some(initiator) = self.initiator.filter(|_| self.state == PairingState::FeatureExchangeStarted)
                else {
                    warn!("unexpected pairing response for {} in {:?}", self.peer, self.state);
                    return;
                };
                self.negotiate(initiator, responder);
                self.transition(PairingState::FeatureExchangeCompleted, actions);
            }
            SmpPdu::PairingFailed(reason) => {
                if self.state.is_in_progress() {
                    self.fail(Some(reason), actions);
                } else {
                    debug!("ignoring pairing failure ({}) for {} in {:?}", reason, self.peer, self.state);
                }
            }
            SmpPdu::PairingConfirm
            | SmpPdu::PairingRandom
            | SmpPdu::PairingPublicKey
            | SmpPdu::PairingDhKeyCheck
            | SmpPdu::KeypressNotification => {}
        }
    }

    fn negotiate(&mut self, initiator: PairingFeatures, responder: PairingFeatures) {
        let method = choose_pairing_method(&initiator, &responder);
        self.secure_connections = initiator.auth.secure_connections && responder.auth.secure_connections;
        self.method = Some(method);
        self.mode = match method {
            PairingMethod::JustWorks => PairingMode::JustWorks,
            PairingMethod::NumericComparison => PairingMode::NumericComparison,
            PairingMethod::OutOfBand => PairingMode::OutOfBand,
            PairingMethod::PasskeyEntry { initiator, responder } => {
                let local = if self.local_is_initiator { initiator } else { responder };
                match local {
                    PasskeyAction::Input => PairingMode::PasskeyEntryInput,
                    PasskeyAction::Display => PairingMode::PasskeyEntryDisplay,
                }
            }
        };

        // The response carries the agreed distribution for both sides.
        let (mut local, mut remote) = if self.local_is_initiator {
            (responder.initiator_keys, responder.responder_keys)
        } else {
            (responder.responder_keys, responder.initiator_keys)
        };
        if self.secure_connections {
            // The LTK is derived, not distributed.
            local.enc_key = false;
            remote.enc_key = false;
        }
        local.link_key = false;
        remote.link_key = false;
        self.expected_local = local;
        self.expected_remote = remote;
        debug!("pairing {} with {:?} (mode {:?})", self.peer, method, self.mode);
    }

    fn accepts_user_input(&self) -> bool {
        matches!(
            self.state,
            PairingState::None
                | PairingState::RequestedByResponder
                | PairingState::FeatureExchangeStarted
                | PairingState::FeatureExchangeCompleted
                | PairingState::PasskeyExpected
                | PairingState::NumericCompareExpected
        )
    }

    fn begin_user_input(&mut self, mode: PairingMode, actions: &mut Vec<PairingAction>) {
        // BR/EDR secure simple pairing has no SMP feature exchange
        if self.state == PairingState::None {
            self.start_session();
            self.transition(PairingState::FeatureExchangeCompleted, actions);
        }
        if self.mode != mode {
            if self.mode != PairingMode::None {
                warn!("{} asked for {:?} while pairing with {:?}", self.peer, mode, self.mode);
            }
            self.mode = mode;
        }
    }

    fn handle_key(&mut self, key: DistributedKey, from_peer: bool, actions: &mut Vec<PairingAction>) {
        if self.state.is_terminal() {
            debug!("ignoring key for {} after pairing {:?}", self.peer, self.state);
            return;
        }
        if self.secure_connections && matches!(key, DistributedKey::LongTermKey(_)) {
            // One derived LTK serves both directions
            self.got_local.enc_key = true;
            self.got_remote.enc_key = true;
        } else if from_peer {
            self.got_remote.mark(&key);
        } else {
            self.got_local.mark(&key);
        }
        self.keys.store(key, from_peer);
        self.check_complete(actions);
    }

    fn handle_encryption(&mut self, enabled: bool, key_size: u8, actions: &mut Vec<PairingAction>) {
        if !enabled {
            self.level = SecurityLevel::None;
            if self.state.is_in_progress() {
                self.fail(None, actions);
            }
            return;
        }

        self.key_size = key_size;
        match self.state {
            PairingState::FeatureExchangeStarted
            | PairingState::FeatureExchangeCompleted
            | PairingState::PasskeyExpected
            | PairingState::NumericCompareExpected
            | PairingState::OobExpected => {
                self.pending = None;
                self.transition(PairingState::KeyDistribution, actions);
                self.check_complete(actions);
            }
            PairingState::None | PairingState::RequestedByResponder => {
                if let Some(keys) = self.pre_paired.clone() {
                    self.start_session();
                    self.mode = PairingMode::PrePaired;
                    self.level = keys.security_level;
                    self.transition(PairingState::Completed, actions);
                    actions.push(PairingAction::Completed {
                        level: keys.security_level,
                        keys,
                        pre_paired: true,
                    });
                } else {
                    // Re-encryption with keys the transport already holds
                    self.level = self.level.max(SecurityLevel::EncryptionOnly);
                }
            }
            PairingState::KeyDistribution | PairingState::Completed | PairingState::Failed => {}
        }
    }

    fn check_complete(&mut self, actions: &mut Vec<PairingAction>) {
        if self.state != PairingState::KeyDistribution
            || !self.got_local.contains(self.expected_local)
            || !self.got_remote.contains(self.expected_remote)
        {
            return;
        }
        let level = self.negotiated_level();
        self.level = level;
        self.keys.peer = Some(self.peer);
        self.keys.security_level = level;
        self.transition(PairingState::Completed, actions);
        actions.push(PairingAction::Completed {
            level,
            keys: self.keys.clone(),
            pre_paired: false,
        });
    }

    fn negotiated_level(&self) -> SecurityLevel {
        let authenticated = match self.method {
            Some(method) => method.is_authenticated(),
            None => !matches!(self.mode, PairingMode::JustWorks | PairingMode::None),
        };
        if !authenticated {
            SecurityLevel::EncryptionOnly
        } else if self.secure_connections && self.key_size >= 16 {
            SecurityLevel::EncryptionAuthenticatedFips
        } else {
            SecurityLevel::EncryptionAuthenticated
        }
    }

    fn start_session(&mut self) {
        self.session += 1;
        self.mode = PairingMode::None;
        self.initiator = None;
        self.method = None;
        self.secure_connections = false;
        self.expected_local = KeyDistribution::default();
        self.expected_remote = KeyDistribution::default();
        self.got_local = KeyDistribution::default();
        self.got_remote = KeyDistribution::default();
        self.keys = KeyMaterial::default();
        self.pending = None;
    }

    fn fail(&mut self, reason: Option<PairingFailure>, actions: &mut Vec<PairingAction>) {
        self.pending = None;
        self.keys = KeyMaterial::default();
        self.transition(PairingState::Failed, actions);
        actions.push(PairingAction::Failed { reason });
    }

    fn transition(&mut self, state: PairingState, actions: &mut Vec<PairingAction>) {
        if self.state == state {
            return;
        }
        debug!("pairing {}: {:?} -> {:?}", self.peer, self.state, state);
        self.state = state;
        actions.push(PairingAction::StateChanged { state, mode: self.mode });
    }
}
