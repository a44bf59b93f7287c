mod common;

use std::time::Duration;

use common::*;
use murmel::messages::{read_envelope, MessageKind};
use murmel::{Event, Session, SessionConfig, TalkState, VoiceCodec, VoicePacket};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn voice_config(addr: std::net::SocketAddr) -> SessionConfig {
    SessionConfig::builder(addr.ip().to_string())
        .port(addr.port())
        .username("alice")
        .accept_invalid_certs(true)
        .encoder(Some(stub_encoder_factory()))
        .decoder(Some(stub_decoder_factory()))
        .build()
}

/// A burst of three frames leaves as three sequenced packets, the last of
/// which carries the terminator bit, all tunnelled through the control
/// channel.
#[tokio::test]
async fn outgoing_burst_is_sequenced_and_terminated() {
    init_tracing();
    let (packets_tx, mut packets_rx) = mpsc::channel::<VoicePacket>(16);
    let server = spawn(move |mut stream| async move {
        lobby_handshake(&mut stream).await;
        while let Ok(envelope) = read_envelope(&mut stream).await {
            if envelope.kind == MessageKind::UdpTunnel {
                let packet =
                    VoicePacket::decode_outgoing(&envelope.payload).expect("voice packet");
                if packets_tx.send(packet).await.is_err() {
                    break;
                }
            }
        }
    })
    .await;

    let mut session = Session::new(voice_config(server.addr));
    let mut events = session.subscribe();
    session.connect().await.expect("connect");
    assert!(
        wait_for_event(&mut events, Duration::from_secs(5), |event| {
            matches!(event, Event::Connect(_))
        })
        .await
    );

    let input = session.audio_input().expect("audio input");
    assert_eq!(input.frame_size(), 960);
    for value in [10i16, 20, 30] {
        input.send_frame(vec![value; 960]).await.expect("queue frame");
    }
    input.end_transmission().await.expect("end burst");

    let mut packets = Vec::new();
    for _ in 0..3 {
        let packet = timeout(Duration::from_secs(5), packets_rx.recv())
            .await
            .expect("packet in time")
            .expect("packet");
        packets.push(packet);
    }

    for (index, packet) in packets.iter().enumerate() {
        assert_eq!(packet.codec, VoiceCodec::Opus);
        assert_eq!(packet.target, 0);
        assert_eq!(packet.sequence, index as u64);
        assert_eq!(packet.frames.len(), 1);
        // The stub codec is a loopback: recover the PCM value.
        let pcm: Vec<i16> = packet.frames[0]
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        assert_eq!(pcm, vec![(index as i16 + 1) * 10; 960]);
    }
    assert!(!packets[0].end_of_transmission);
    assert!(!packets[1].end_of_transmission);
    assert!(packets[2].end_of_transmission);

    session.disconnect().await.unwrap();
}

/// Outgoing packets name the active voice-target slot in their header.
#[tokio::test]
async fn outgoing_packets_carry_the_voice_target() {
    init_tracing();
    let (packets_tx, mut packets_rx) = mpsc::channel::<VoicePacket>(16);
    let server = spawn(move |mut stream| async move {
        lobby_handshake(&mut stream).await;
        while let Ok(envelope) = read_envelope(&mut stream).await {
            if envelope.kind == MessageKind::UdpTunnel {
                let packet =
                    VoicePacket::decode_outgoing(&envelope.payload).expect("voice packet");
                if packets_tx.send(packet).await.is_err() {
                    break;
                }
            }
        }
    })
    .await;

    let mut session = Session::new(voice_config(server.addr));
    let mut events = session.subscribe();
    session.connect().await.expect("connect");
    assert!(
        wait_for_event(&mut events, Duration::from_secs(5), |event| {
            matches!(event, Event::Connect(_))
        })
        .await
    );

    let mut target = murmel::VoiceTarget::new(5).unwrap();
    target.add_user(9);
    session.register_voice_target(&target).await.unwrap();
    session.set_voice_target(Some(5)).unwrap();

    let input = session.audio_input().expect("audio input");
    input.send_frame(vec![1i16; 960]).await.unwrap();
    input.end_transmission().await.unwrap();

    let packet = timeout(Duration::from_secs(5), packets_rx.recv())
        .await
        .expect("packet in time")
        .expect("packet");
    assert_eq!(packet.target, 5);
    assert!(packet.end_of_transmission);

    session.disconnect().await.unwrap();
}

/// Inbound tunnelled voice fans out into a per-speaker stream with
/// decoded PCM, positional data and talk-state events.
#[tokio::test]
async fn incoming_voice_fans_out_per_speaker() {
    init_tracing();
    let server = spawn(|mut stream| async move {
        lobby_handshake(&mut stream).await;

        let pcm: Vec<i16> = vec![7; 960];
        let opus: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut first = VoicePacket::opus(0, 0);
        first.session = Some(7);
        first.frames = vec![opus.clone()];
        let mut second = VoicePacket::opus(0, 1);
        second.session = Some(7);
        second.frames = vec![opus];
        second.end_of_transmission = true;
        second.positional = Some([1.0, 2.0, 3.0]);

        voice_envelope(&first)
            .write_to(&mut stream)
            .await
            .expect("write voice");
        voice_envelope(&second)
            .write_to(&mut stream)
            .await
            .expect("write voice");
        drain(&mut stream).await;
    })
    .await;

    let mut session = Session::new(voice_config(server.addr));
    let mut events = session.subscribe();
    let mut streams = session.take_audio_streams().expect("streams receiver");
    session.connect().await.expect("connect");

    let mut stream = timeout(Duration::from_secs(5), streams.recv())
        .await
        .expect("stream in time")
        .expect("stream");
    assert_eq!(stream.session(), 7);

    let first = timeout(Duration::from_secs(5), stream.recv())
        .await
        .expect("frame in time")
        .expect("frame");
    assert_eq!(first.sequence, 0);
    assert_eq!(first.pcm, vec![7i16; 960]);
    assert!(!first.end_of_transmission);
    assert_eq!(first.positional, None);

    let second = timeout(Duration::from_secs(5), stream.recv())
        .await
        .expect("frame in time")
        .expect("frame");
    assert_eq!(second.sequence, 1);
    assert!(second.end_of_transmission);
    assert_eq!(second.positional, Some([1.0, 2.0, 3.0]));

    assert!(
        wait_for_event(&mut events, Duration::from_secs(5), |event| {
            matches!(
                event,
                Event::TalkStateChange {
                    session: 7,
                    state: TalkState::Talking
                }
            )
        })
        .await,
        "expected the talking transition"
    );
    assert!(
        wait_for_event(&mut events, Duration::from_secs(5), |event| {
            matches!(
                event,
                Event::TalkStateChange {
                    session: 7,
                    state: TalkState::Passive
                }
            )
        })
        .await,
        "expected the passive transition at burst end"
    );

    session.disconnect().await.unwrap();
}
