mod common;

use std::time::Duration;

use common::*;
use murmel::proto::mumble;
use murmel::{
    ControlMessage, DisconnectReason, Error, Event, RejectKind, Session, State,
};

#[tokio::test]
async fn connect_and_sync_builds_the_world() {
    init_tracing();
    let server = spawn(|mut stream| async move {
        lobby_handshake(&mut stream).await;
        drain(&mut stream).await;
    })
    .await;

    let mut session = Session::new(client_config(server.addr));
    let mut events = session.subscribe();
    assert_eq!(session.state(), State::Disconnected);

    session.connect().await.expect("connect");
    assert_ne!(session.state(), State::Disconnected);

    assert!(
        wait_for_event(&mut events, Duration::from_secs(5), |event| {
            matches!(event, Event::Connect(info) if info.session == 7)
        })
        .await,
        "expected a Connect event for session 7"
    );
    assert_eq!(session.state(), State::Synced);

    let world = session.world().await;
    let me = world.self_user().expect("self user");
    assert_eq!(me.session, 7);
    assert_eq!(me.name, "alice");
    assert_eq!(world.find_channel(&["Lobby"]).expect("lobby").id, 1);
    assert_eq!(world.user_channel(7).expect("channel").name, "Lobby");
    assert_eq!(world.server.welcome_text.as_deref(), Some("welcome!"));
    assert_eq!(world.server.semantic_version(), Some((1, 2, 4)));
    assert_eq!(world.server.release.as_deref(), Some("scripted"));
    let crypt = world.server.crypt.as_ref().expect("crypt parameters");
    assert_eq!(crypt.key, vec![1; 16]);

    session.disconnect().await.expect("disconnect");
    assert_eq!(session.state(), State::Disconnected);
    assert!(
        wait_for_event(&mut events, Duration::from_secs(5), |event| {
            matches!(event, Event::Disconnect(DisconnectReason::User))
        })
        .await,
        "expected a user-initiated Disconnect event"
    );
}

#[tokio::test]
async fn server_reject_is_surfaced_and_terminal() {
    init_tracing();
    let server = spawn(|mut stream| async move {
        let _version = read_message(&mut stream).await;
        let _auth = read_message(&mut stream).await;
        write_message(
            &mut stream,
            &ControlMessage::Reject(mumble::Reject {
                r#type: Some(mumble::reject::RejectType::UsernameInUse as i32),
                reason: Some("name is taken".into()),
            }),
        )
        .await;
    })
    .await;

    let mut session = Session::new(client_config(server.addr));
    let mut events = session.subscribe();
    session.connect().await.expect("connect");

    assert!(
        wait_for_event(&mut events, Duration::from_secs(5), |event| {
            matches!(
                event,
                Event::Disconnect(DisconnectReason::Rejected { kind, reason })
                    if *kind == RejectKind::UsernameInUse && reason == "name is taken"
            )
        })
        .await,
        "expected a Rejected disconnect"
    );
    assert_eq!(session.state(), State::Disconnected);

    // The session is terminal: no sends, no second connect.
    let err = session
        .send(ControlMessage::Ping(mumble::Ping::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[tokio::test]
async fn connect_twice_is_rejected() {
    init_tracing();
    let server = spawn(|mut stream| async move {
        lobby_handshake(&mut stream).await;
        drain(&mut stream).await;
    })
    .await;

    let mut session = Session::new(client_config(server.addr));
    let mut events = session.subscribe();
    session.connect().await.expect("connect");
    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    assert!(
        wait_for_event(&mut events, Duration::from_secs(5), |event| {
            matches!(event, Event::Connect(_))
        })
        .await
    );
    session.disconnect().await.expect("disconnect");
}
