mod common;

use std::sync::Arc;
use std::time::Duration;

use bthost::error::ErrorKind;
use bthost::transport::LinkEvent;
use bthost::*;
use common::*;

fn command(device: &Device) -> GattCommand {
    GattCommand::resolve(
        device,
        "test command",
        command_service_uuid(),
        command_uuid(),
        Some(response_uuid()),
    )
    .unwrap()
}

fn command_writes(mock: &MockTransport) -> Vec<(Vec<u8>, WriteType)> {
    mock.calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Write(COMMAND_VALUE, value, write_type) => Some((value, write_type)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn immediate_reply_is_not_lost() {
    let mock = MockTransport::new();
    let adapter = open(&mock).await;
    let device = connect_ready(&adapter, &mock, peer(1)).await;
    mock.reply_on_write(COMMAND_VALUE, RESPONSE_VALUE, &[0xaa, 0x01]);

    let cmd = command(&device);
    assert_eq!(cmd.name(), "test command");
    assert_eq!(cmd.default_timeout(), Duration::from_millis(3000));
    let reply = cmd.send(true, &[0x01, 0x02], Duration::from_secs(1)).await.unwrap();
    assert_eq!(reply, Some(vec![0xaa, 0x01]));
    assert_eq!(command_writes(&mock), [(vec![0x01, 0x02], WriteType::WithoutResponse)]);

    // The response listener only lives for the exchange.
    assert_eq!(device.listener_count(), 0);
    let cccd: Vec<_> = mock
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Write(RESPONSE_CCCD, ..)))
        .collect();
    assert_eq!(
        cccd,
        [
            Call::Write(RESPONSE_CCCD, vec![1, 0], WriteType::WithResponse),
            Call::Write(RESPONSE_CCCD, vec![0, 0], WriteType::WithResponse),
        ]
    );
}

#[tokio::test]
async fn empty_reply_is_some() {
    let mock = MockTransport::new();
    let adapter = open(&mock).await;
    let device = connect_ready(&adapter, &mock, peer(1)).await;
    mock.reply_on_write(COMMAND_VALUE, RESPONSE_VALUE, &[]);

    let reply = command(&device).send_with_default_timeout(false, &[0x10]).await.unwrap();
    assert_eq!(reply, Some(Vec::new()));
    assert_eq!(command_writes(&mock), [(vec![0x10], WriteType::WithResponse)]);
}

#[tokio::test(start_paused = true)]
async fn timeout_removes_the_response_listener() {
    let mock = MockTransport::new();
    let adapter = open(&mock).await;
    let device = connect_ready(&adapter, &mock, peer(1)).await;
    let level = device
        .find_characteristic(None, btuuid::characteristics::BATTERY_LEVEL)
        .unwrap();
    device
        .add_char_listener(ListenerMatch::Characteristic(level), Arc::new(Recorder::default()))
        .await
        .unwrap();
    let before = device.listener_count();

    let err = command(&device)
        .send(false, &[0x01], Duration::from_millis(250))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(device.listener_count(), before);
    assert_eq!(device.transport_listener_count(), before);

    // A reply arriving after the timeout reaches nobody.
    mock.notify(peer(1), RESPONSE_VALUE, &[0xff]);
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(device.listener_count(), before);
}

#[tokio::test]
async fn command_without_response_characteristic() {
    let mock = MockTransport::new();
    let adapter = open(&mock).await;
    let device = connect_ready(&adapter, &mock, peer(1)).await;
    let cmd = GattCommand::resolve(&device, "fire and forget", command_service_uuid(), command_uuid(), None).unwrap();

    assert_eq!(cmd.send(false, &[0x05], Duration::from_secs(1)).await.unwrap(), None);
    cmd.send_only(true, &[0x06]).await.unwrap();
    assert_eq!(
        command_writes(&mock),
        [
            (vec![0x05], WriteType::WithResponse),
            (vec![0x06], WriteType::WithoutResponse)
        ]
    );
    assert_eq!(mock.count(|c| matches!(c, Call::Write(RESPONSE_CCCD, ..))), 0);
}

#[tokio::test]
async fn unresolvable_or_unwritable_commands() {
    let mock = MockTransport::new();
    let adapter = open(&mock).await;
    let device = connect_ready(&adapter, &mock, peer(1)).await;

    let err = GattCommand::resolve(
        &device,
        "missing",
        command_service_uuid(),
        command_uuid(),
        Some(btuuid::characteristics::BATTERY_LEVEL),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let response = device
        .find_characteristic(Some(command_service_uuid()), response_uuid())
        .unwrap();
    let cmd = GattCommand::new(&device, "read only", response, None);
    let err = cmd.send(false, &[0x01], Duration::from_secs(1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    assert!(command_writes(&mock).is_empty());
}

#[tokio::test]
async fn link_loss_ends_the_wait() {
    let mock = MockTransport::new();
    let adapter = open(&mock).await;
    let device = connect_ready(&adapter, &mock, peer(1)).await;

    let cmd = command(&device);
    let pending = tokio::spawn(async move { cmd.send(false, &[0x01], Duration::from_secs(60)).await });
    eventually(|| command_writes(&mock).len() == 1).await;
    assert_eq!(device.listener_count(), 1);

    mock.link(
        peer(1),
        LinkEvent::Disconnected {
            reason: HciStatus::CONNECTION_TIMEOUT,
        },
    );
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    assert_eq!(device.listener_count(), 0);
}
