mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bthost::config::AdapterConfig;
use bthost::error::ErrorKind;
use bthost::keys::{DistributedKey, FileKeyStore, KeyMaterial, KeyStore, LongTermKey, MemoryKeyStore};
use bthost::pairing::{IoCapability, PairingAgent, PairingRejected, Passkey};
use bthost::policy::{SecurityEntry, SecurityRegistry};
use bthost::smp::{
    AuthRequirements, KeyDistribution, PairingFailure, PairingFeatures, PairingMode, PairingState, SmpEvent, SmpPdu,
};
use bthost::*;
use common::*;

fn features(io_capability: IoCapability, secure_connections: bool) -> PairingFeatures {
    PairingFeatures {
        io_capability,
        auth: AuthRequirements {
            bonding: true,
            mitm: true,
            secure_connections,
            keypress: false,
        },
        initiator_keys: KeyDistribution::from_bits(0x01),
        responder_keys: KeyDistribution::from_bits(0x01),
        ..Default::default()
    }
}

fn pdu(pdu: SmpPdu, from_peer: bool) -> SmpEvent {
    SmpEvent::Pdu { pdu, from_peer }
}

/// Legacy passkey entry up to the passkey request, local side initiating and entering the passkey.
fn start_passkey_pairing(mock: &MockTransport, peer: DeviceAddress) {
    mock.security(peer, pdu(SmpPdu::PairingRequest(features(IoCapability::KeyboardOnly, false)), false));
    mock.security(peer, pdu(SmpPdu::PairingResponse(features(IoCapability::DisplayOnly, false)), true));
    mock.security(peer, SmpEvent::PasskeyRequest);
}

fn finish_pairing(mock: &MockTransport, peer: DeviceAddress) {
    mock.security(
        peer,
        SmpEvent::EncryptionChanged {
            enabled: true,
            key_size: 16,
        },
    );
    for from_peer in [true, false] {
        mock.security(
            peer,
            SmpEvent::KeyDistributed {
                key: DistributedKey::LongTermKey(LongTermKey {
                    key: [from_peer as u8; 16],
                    ..Default::default()
                }),
                from_peer,
            },
        );
    }
}

fn passkey_replies(mock: &MockTransport) -> Vec<Option<Passkey>> {
    mock.calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::PasskeyReply(p) => Some(p),
            _ => None,
        })
        .collect()
}

fn stored_keys(store: &MemoryKeyStore, peer: DeviceAddress) -> Option<KeyMaterial> {
    store.read(&AdapterConfig::default().local_address, &peer).unwrap()
}

#[tokio::test]
async fn unanswered_passkey_defaults_to_zero_and_failure_drops_keys() {
    let mock = MockTransport::new();
    let store = Arc::new(MemoryKeyStore::new());
    let mut old = KeyMaterial::default();
    old.security_level = SecurityLevel::EncryptionOnly;
    store
        .write(&AdapterConfig::default().local_address, &peer(1), &old)
        .unwrap();
    init_tracing();
    let adapter = Adapter::builder(mock.clone())
        .key_store(store.clone())
        .open()
        .await
        .unwrap();
    let device = connect_ready(&adapter, &mock, peer(1)).await;

    start_passkey_pairing(&mock, peer(1));
    eventually(|| !passkey_replies(&mock).is_empty()).await;
    assert_eq!(passkey_replies(&mock), [Some(Passkey::new(0))]);
    assert_eq!(device.pairing_state(), PairingState::PasskeyExpected);

    mock.security(peer(1), pdu(SmpPdu::PairingFailed(PairingFailure::PasskeyEntryFailed), true));
    // Not tolerated: the stored keys go, then the link.
    eventually(|| device.state() == DeviceState::Disconnected).await;
    assert!(stored_keys(&store, peer(1)).is_none());
    assert_eq!(
        mock.count(|c| matches!(c, Call::Disconnect(_, status) if *status == HciStatus::AUTHENTICATION_FAILURE)),
        1
    );

    // A late reply is a silent no-op.
    device.set_pairing_passkey(123456).await.unwrap();
    assert_eq!(passkey_replies(&mock).len(), 1);
    assert_eq!(
        device.set_pairing_passkey(1_000_000).await.unwrap_err().kind(),
        ErrorKind::InvalidParameter
    );
}

#[tokio::test]
async fn tolerated_failure_keeps_the_link() {
    let mock = MockTransport::new();
    let mut config = AdapterConfig::default();
    config.device.tolerate_failed_pairing = true;
    init_tracing();
    let adapter = Adapter::builder(mock.clone()).config(config).open().await.unwrap();
    let device = connect_ready(&adapter, &mock, peer(1)).await;

    start_passkey_pairing(&mock, peer(1));
    eventually(|| device.pairing_state() == PairingState::PasskeyExpected).await;
    mock.security(peer(1), pdu(SmpPdu::PairingFailed(PairingFailure::ConfirmValueFailed), true));
    eventually(|| device.pairing_state() == PairingState::Failed).await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(device.state(), DeviceState::Ready);
    assert_eq!(mock.count(|c| matches!(c, Call::Disconnect(..))), 0);
}

struct CountingAgent {
    passkeys: AtomicUsize,
    comparisons: AtomicUsize,
}

#[async_trait]
impl PairingAgent for CountingAgent {
    async fn request_passkey(&self, _peer: &DeviceAddress) -> Result<Passkey, PairingRejected> {
        self.passkeys.fetch_add(1, Ordering::SeqCst);
        Ok(Passkey::new(654321))
    }

    async fn confirm_passkey(&self, _peer: &DeviceAddress, passkey: Passkey) -> Result<(), PairingRejected> {
        self.comparisons.fetch_add(1, Ordering::SeqCst);
        if passkey == Passkey::new(111111) {
            Ok(())
        } else {
            Err(PairingRejected::default())
        }
    }
}

#[tokio::test]
async fn agent_answers_and_finished_sessions_ignore_requests() {
    let mock = MockTransport::new();
    let agent = Arc::new(CountingAgent {
        passkeys: AtomicUsize::new(0),
        comparisons: AtomicUsize::new(0),
    });
    init_tracing();
    let adapter = Adapter::builder(mock.clone())
        .pairing_agent(agent.clone())
        .open()
        .await
        .unwrap();
    let device = connect_ready(&adapter, &mock, peer(1)).await;

    start_passkey_pairing(&mock, peer(1));
    eventually(|| !passkey_replies(&mock).is_empty()).await;
    assert_eq!(passkey_replies(&mock), [Some(Passkey::new(654321))]);

    finish_pairing(&mock, peer(1));
    eventually(|| device.pairing_state() == PairingState::Completed).await;
    assert_eq!(device.security_level(), SecurityLevel::EncryptionAuthenticated);
    assert_eq!(device.pairing_mode(), PairingMode::PasskeyEntryInput);

    // Requests after completion reach neither the agent nor the transport.
    mock.security(peer(1), SmpEvent::PasskeyRequest);
    mock.security(peer(1), SmpEvent::NumericComparisonRequest(Passkey::new(111111)));
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(agent.passkeys.load(Ordering::SeqCst), 1);
    assert_eq!(agent.comparisons.load(Ordering::SeqCst), 0);
    assert_eq!(mock.count(|c| matches!(c, Call::NumericComparisonReply(_))), 0);
}

#[tokio::test]
async fn numeric_comparison_is_answered_once() {
    let mock = MockTransport::new();
    let agent = Arc::new(CountingAgent {
        passkeys: AtomicUsize::new(0),
        comparisons: AtomicUsize::new(0),
    });
    init_tracing();
    let adapter = Adapter::builder(mock.clone())
        .pairing_agent(agent.clone())
        .open()
        .await
        .unwrap();
    let device = connect_ready(&adapter, &mock, peer(1)).await;

    mock.security(peer(1), pdu(SmpPdu::PairingRequest(features(IoCapability::DisplayYesNo, true)), false));
    mock.security(peer(1), pdu(SmpPdu::PairingResponse(features(IoCapability::DisplayYesNo, true)), true));
    mock.security(peer(1), SmpEvent::NumericComparisonRequest(Passkey::new(111111)));
    eventually(|| mock.count(|c| matches!(c, Call::NumericComparisonReply(_))) == 1).await;
    assert_eq!(mock.count(|c| *c == Call::NumericComparisonReply(true)), 1);
    assert_eq!(device.pairing_mode(), PairingMode::NumericComparison);

    // The outstanding request was consumed by the agent's answer.
    device.set_pairing_numeric_comparison(false).await.unwrap();
    assert_eq!(mock.count(|c| matches!(c, Call::NumericComparisonReply(_))), 1);
}

#[tokio::test]
async fn uploaded_keys_skip_pairing_at_the_same_level() {
    let mock = MockTransport::new();
    let store = Arc::new(MemoryKeyStore::new());
    let policy = Arc::new(SecurityRegistry::new());
    policy.set_for_address(
        peer(1).address,
        SecurityEntry {
            passkey: Some(Passkey::new(123456)),
            ..Default::default()
        },
    );
    init_tracing();
    let adapter = Adapter::builder(mock.clone())
        .key_store(store.clone())
        .security_policy(policy)
        .open()
        .await
        .unwrap();

    // Full pairing
    let device = adapter.open_device(&peer(1));
    device
        .set_conn_security(SecurityLevel::EncryptionAuthenticated, IoCapability::KeyboardOnly)
        .unwrap();
    device.connect().await.unwrap();
    mock.complete_connect(peer(1));
    eventually(|| mock.count(|c| matches!(c, Call::SetSecurity(..))) == 1).await;
    assert_eq!(
        mock.count(|c| *c == Call::SetSecurity(SecurityLevel::EncryptionAuthenticated, IoCapability::KeyboardOnly)),
        1
    );
    assert_eq!(device.state(), DeviceState::Connected);

    start_passkey_pairing(&mock, peer(1));
    eventually(|| !passkey_replies(&mock).is_empty()).await;
    assert_eq!(passkey_replies(&mock), [Some(Passkey::new(123456))]);
    finish_pairing(&mock, peer(1));
    eventually(|| device.state() == DeviceState::Ready).await;
    let paired_level = device.security_level();
    assert_eq!(paired_level, SecurityLevel::EncryptionAuthenticated);
    let stored = stored_keys(&store, peer(1)).expect("keys stored after pairing");
    assert_eq!(stored.security_level, paired_level);

    device
        .disconnect(HciStatus::REMOTE_USER_TERMINATED_CONNECTION)
        .await
        .unwrap();
    eventually(|| device.state() == DeviceState::Disconnected).await;

    // Below the requested minimum
    let err = device
        .upload_key_material(stored.clone(), SecurityLevel::EncryptionAuthenticatedFips)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SecurityPolicyViolation);

    device
        .upload_key_material(stored, SecurityLevel::EncryptionAuthenticated)
        .await
        .unwrap();
    assert_eq!(mock.count(|c| *c == Call::UploadKeys(peer(1))), 1);

    device.connect().await.unwrap();
    mock.complete_connect(peer(1));
    eventually(|| mock.count(|c| matches!(c, Call::SetSecurity(..))) == 2).await;
    mock.security(
        peer(1),
        SmpEvent::EncryptionChanged {
            enabled: true,
            key_size: 16,
        },
    );
    eventually(|| device.state() == DeviceState::Ready).await;
    assert_eq!(device.pairing_mode(), PairingMode::PrePaired);
    assert_eq!(device.security_level(), paired_level);
    assert_eq!(passkey_replies(&mock).len(), 1);
}

#[tokio::test]
async fn keys_load_from_a_key_directory() {
    let mock = MockTransport::new();
    let dir = tempfile::tempdir().unwrap();
    let file_store = FileKeyStore::open(dir.path()).unwrap();
    let mut material = KeyMaterial::default();
    material.peer = Some(peer(2));
    material.security_level = SecurityLevel::EncryptionOnly;
    material.remote.ltk = Some(LongTermKey::default());
    file_store
        .write(&AdapterConfig::default().local_address, &peer(2), &material)
        .unwrap();

    let adapter = open(&mock).await;
    let device = adapter.open_device(&peer(2));
    let err = device
        .upload_keys(dir.path(), SecurityLevel::EncryptionAuthenticated)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SecurityPolicyViolation);
    device
        .upload_keys(dir.path(), SecurityLevel::EncryptionOnly)
        .await
        .unwrap();
    assert_eq!(mock.count(|c| *c == Call::UploadKeys(peer(2))), 1);

    let unknown = adapter.open_device(&peer(3));
    let err = unknown
        .upload_keys(dir.path(), SecurityLevel::Unset)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn pairing_below_minimum_disconnects() {
    let mock = MockTransport::new();
    let mut config = AdapterConfig::default();
    config.device.min_security_level = SecurityLevel::EncryptionAuthenticated;
    init_tracing();
    let adapter = Adapter::builder(mock.clone()).config(config).open().await.unwrap();
    let device = connect_ready(&adapter, &mock, peer(1)).await;

    // Just Works: unauthenticated
    let mut initiator = features(IoCapability::NoInputNoOutput, false);
    initiator.auth.mitm = false;
    mock.security(peer(1), pdu(SmpPdu::PairingRequest(initiator), false));
    mock.security(peer(1), pdu(SmpPdu::PairingResponse(initiator), true));
    finish_pairing(&mock, peer(1));

    eventually(|| device.state() == DeviceState::Disconnected).await;
    assert_eq!(
        mock.count(|c| matches!(c, Call::Disconnect(_, status) if *status == HciStatus::AUTHENTICATION_FAILURE)),
        1
    );
}

/// A key store whose writes wait until the test lets them through.
struct GatedStore {
    inner: MemoryKeyStore,
    gate: Mutex<mpsc::Receiver<()>>,
}

impl KeyStore for GatedStore {
    fn read(&self, local: &DeviceAddress, peer: &DeviceAddress) -> bthost::Result<Option<KeyMaterial>> {
        self.inner.read(local, peer)
    }

    fn write(&self, local: &DeviceAddress, peer: &DeviceAddress, keys: &KeyMaterial) -> bthost::Result<()> {
        let _ = self.gate.lock().unwrap().recv_timeout(Duration::from_secs(5));
        self.inner.write(local, peer, keys)
    }

    fn remove(&self, local: &DeviceAddress, peer: &DeviceAddress) -> bthost::Result<bool> {
        self.inner.remove(local, peer)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_key_storage_does_not_hold_up_notifications() {
    let mock = MockTransport::new();
    let (release, gate) = mpsc::channel();
    let store = Arc::new(GatedStore {
        inner: MemoryKeyStore::new(),
        gate: Mutex::new(gate),
    });
    init_tracing();
    let adapter = Adapter::builder(mock.clone())
        .key_store(store.clone())
        .open()
        .await
        .unwrap();
    let device = connect_ready(&adapter, &mock, peer(1)).await;
    let recorder = Arc::new(Recorder::default());
    device
        .add_char_listener(ListenerMatch::All, recorder.clone())
        .await
        .unwrap();

    start_passkey_pairing(&mock, peer(1));
    eventually(|| !passkey_replies(&mock).is_empty()).await;
    finish_pairing(&mock, peer(1));
    eventually(|| device.pairing_state() == PairingState::Completed).await;

    // The key write is still blocked here.
    mock.notify(peer(1), LEVEL_VALUE, &[5]);
    eventually(|| !recorder.values().is_empty()).await;
    assert_eq!(recorder.values(), [(LEVEL_VALUE, vec![5])]);
    assert!(store.inner.read(&AdapterConfig::default().local_address, &peer(1)).unwrap().is_none());

    release.send(()).unwrap();
    eventually(|| {
        store
            .inner
            .read(&AdapterConfig::default().local_address, &peer(1))
            .unwrap()
            .is_some()
    })
    .await;
}
