mod common;

use std::time::Duration;

use common::*;
use murmel::proto::mumble;
use murmel::{ControlMessage, DisconnectReason, Error, Event, Session, State};
use tokio::io::AsyncWriteExt;

#[tokio::test]
async fn oversize_frame_disconnects_exactly_once() {
    init_tracing();
    let server = spawn(|mut stream| async move {
        lobby_handshake(&mut stream).await;
        // 11 MiB announced in the preamble; the payload never follows.
        let mut header = [0u8; 6];
        header[2..].copy_from_slice(&(11u32 * 1024 * 1024).to_be_bytes());
        stream.write_all(&header).await.expect("write header");
        stream.flush().await.expect("flush");
        drain(&mut stream).await;
    })
    .await;

    let mut session = Session::new(client_config(server.addr));
    let mut events = session.subscribe();
    session.connect().await.expect("connect");

    assert!(
        wait_for_event(&mut events, Duration::from_secs(5), |event| {
            matches!(event, Event::Disconnect(DisconnectReason::Error(reason))
                if reason.contains("frame too large"))
        })
        .await,
        "expected an error disconnect for the oversize frame"
    );
    assert_eq!(session.state(), State::Disconnected);

    // Subsequent sends fail without touching the wire.
    let err = session
        .send(ControlMessage::Ping(mumble::Ping::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    // No further events are delivered: the disconnect was the last one.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));

    // A second disconnect attempt reports the invalid state.
    let err = session.disconnect().await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[tokio::test]
async fn kick_surfaces_actor_and_reason() {
    init_tracing();
    let server = spawn(|mut stream| async move {
        lobby_handshake(&mut stream).await;
        write_message(
            &mut stream,
            &ControlMessage::UserRemove(mumble::UserRemove {
                session: 7,
                actor: Some(2),
                reason: Some("spamming".into()),
                ban: None,
            }),
        )
        .await;
        drain(&mut stream).await;
    })
    .await;

    let mut session = Session::new(client_config(server.addr));
    let mut events = session.subscribe();
    session.connect().await.expect("connect");

    assert!(
        wait_for_event(&mut events, Duration::from_secs(5), |event| {
            matches!(
                event,
                Event::Disconnect(DisconnectReason::Kicked { actor, reason })
                    if *actor == Some(2) && reason.as_deref() == Some("spamming")
            )
        })
        .await,
        "expected a kick disconnect"
    );
    assert_eq!(session.state(), State::Disconnected);
}

#[tokio::test]
async fn ban_surfaces_as_banned() {
    init_tracing();
    let server = spawn(|mut stream| async move {
        lobby_handshake(&mut stream).await;
        write_message(
            &mut stream,
            &ControlMessage::UserRemove(mumble::UserRemove {
                session: 7,
                actor: Some(2),
                reason: Some("rude".into()),
                ban: Some(true),
            }),
        )
        .await;
        drain(&mut stream).await;
    })
    .await;

    let mut session = Session::new(client_config(server.addr));
    let mut events = session.subscribe();
    session.connect().await.expect("connect");

    assert!(
        wait_for_event(&mut events, Duration::from_secs(5), |event| {
            matches!(event, Event::Disconnect(DisconnectReason::Banned { .. }))
        })
        .await,
        "expected a ban disconnect"
    );
}

#[tokio::test]
async fn world_contents_are_dropped_on_disconnect() {
    init_tracing();
    let server = spawn(|mut stream| async move {
        lobby_handshake(&mut stream).await;
        drain(&mut stream).await;
    })
    .await;

    let mut session = Session::new(client_config(server.addr));
    let mut events = session.subscribe();
    session.connect().await.expect("connect");
    assert!(
        wait_for_event(&mut events, Duration::from_secs(5), |event| {
            matches!(event, Event::Connect(_))
        })
        .await
    );
    assert!(session.world().await.self_user().is_some());

    session.disconnect().await.expect("disconnect");
    let world = session.world().await;
    assert!(world.self_user().is_none());
    assert_eq!(world.channels().count(), 0);
    assert_eq!(world.users().count(), 0);
}
