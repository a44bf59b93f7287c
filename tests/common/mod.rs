#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use murmel::messages::{read_envelope, ControlMessage, MessageEnvelope, MessageKind};
use murmel::proto::mumble;
use murmel::{
    Decoder, DecoderFactory, Encoder, EncoderFactory, Error, Event, SessionConfig,
};
use rcgen::generate_simple_self_signed;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};
use tokio_rustls::rustls::{self, ServerConfig as TlsServerConfig};
use tokio_rustls::TlsAcceptor;

pub type ServerStream = tokio_rustls::server::TlsStream<TcpStream>;

pub struct ScriptedServer {
    pub addr: SocketAddr,
    pub handle: tokio::task::JoinHandle<()>,
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Accept one TLS connection and run the provided script against it.
pub async fn spawn<F, Fut>(script: F) -> ScriptedServer
where
    F: FnOnce(ServerStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let cert = generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(cert.serialize_private_key_der().into());
    let cert_chain = vec![rustls::pki_types::CertificateDer::from(
        cert.serialize_der().unwrap(),
    )];

    let mut tls_config = TlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .unwrap();
    tls_config.alpn_protocols = vec![b"mumble".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            match acceptor.accept(stream).await {
                Ok(stream) => script(stream).await,
                Err(err) => eprintln!("test server: TLS accept failed: {err}"),
            }
        }
    });

    ScriptedServer { addr, handle }
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .try_init()
        .ok();
}

pub fn client_config(addr: SocketAddr) -> SessionConfig {
    SessionConfig::builder(addr.ip().to_string())
        .port(addr.port())
        .username("alice")
        .accept_invalid_certs(true)
        .encoder(None)
        .decoder(None)
        .build()
}

pub async fn write_message<W>(stream: &mut W, message: &ControlMessage)
where
    W: AsyncWrite + Unpin,
{
    message
        .encode()
        .expect("encode message")
        .write_to(stream)
        .await
        .expect("write message");
}

pub async fn read_message(stream: &mut ServerStream) -> ControlMessage {
    let envelope = read_envelope(stream).await.expect("read envelope");
    ControlMessage::try_from(envelope).expect("decode message")
}

pub fn channel_state(id: u32, parent: Option<u32>, name: &str) -> ControlMessage {
    ControlMessage::ChannelState(mumble::ChannelState {
        channel_id: Some(id),
        parent,
        name: Some(name.to_string()),
        ..Default::default()
    })
}

pub fn user_state(session: u32, name: &str, channel: u32) -> ControlMessage {
    ControlMessage::UserState(mumble::UserState {
        session: Some(session),
        name: Some(name.to_string()),
        channel_id: Some(channel),
        ..Default::default()
    })
}

/// Consume the client's `Version` and `Authenticate`, then reply with the
/// standard lobby: two channels, the user "alice" (session 7) and
/// `ServerSync`.
pub async fn lobby_handshake(stream: &mut ServerStream) {
    let version = read_message(stream).await;
    assert!(matches!(version, ControlMessage::Version(_)));
    let auth = read_message(stream).await;
    match auth {
        ControlMessage::Authenticate(auth) => {
            assert_eq!(auth.username.as_deref(), Some("alice"));
            assert_eq!(auth.opus, Some(true));
        }
        other => panic!("expected Authenticate, got {other:?}"),
    }

    write_message(
        stream,
        &ControlMessage::Version(mumble::Version {
            version: Some(0x0001_0204),
            release: Some("scripted".into()),
            ..Default::default()
        }),
    )
    .await;
    write_message(
        stream,
        &ControlMessage::CryptSetup(mumble::CryptSetup {
            key: Some(vec![1; 16]),
            client_nonce: Some(vec![2; 16]),
            server_nonce: Some(vec![3; 16]),
        }),
    )
    .await;
    write_message(stream, &channel_state(0, None, "Root")).await;
    write_message(stream, &channel_state(1, Some(0), "Lobby")).await;
    write_message(stream, &user_state(7, "alice", 1)).await;
    write_message(
        stream,
        &ControlMessage::ServerSync(mumble::ServerSync {
            session: Some(7),
            max_bandwidth: Some(72_000),
            welcome_text: Some("welcome!".into()),
            permissions: Some(0xF),
        }),
    )
    .await;
    stream.flush().await.expect("flush handshake");
}

/// Drain envelopes until the connection drops, so client pings never back
/// up in the socket.
pub async fn drain(stream: &mut ServerStream) {
    while read_envelope(stream).await.is_ok() {}
}

/// Wait until the predicate matches an event or the timeout elapses.
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<Event>,
    timeout_dur: Duration,
    mut pred: F,
) -> bool
where
    F: FnMut(&Event) -> bool,
{
    let deadline = Instant::now() + timeout_dur;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        match timeout(deadline - now, rx.recv()).await {
            Ok(Ok(event)) => {
                if pred(&event) {
                    return true;
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(_)) => return false,
            Err(_) => return false,
        }
    }
}

/// Loopback test codec: two little-endian bytes per sample.
pub struct StubCodec;

impl Encoder for StubCodec {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, Error> {
        Ok(pcm.iter().flat_map(|s| s.to_le_bytes()).collect())
    }
}

impl Decoder for StubCodec {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, Error> {
        Ok(data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }
}

pub fn stub_encoder_factory() -> EncoderFactory {
    Arc::new(|| Ok(Box::new(StubCodec) as Box<dyn Encoder>))
}

pub fn stub_decoder_factory() -> DecoderFactory {
    Arc::new(|| Ok(Box::new(StubCodec) as Box<dyn Decoder>))
}

/// Raw voice-packet envelope for the scripted server to send.
pub fn voice_envelope(packet: &murmel::VoicePacket) -> MessageEnvelope {
    MessageEnvelope::new(MessageKind::UdpTunnel, packet.encode().expect("encode voice"))
}
