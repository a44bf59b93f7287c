//! The session: one TLS connection to a server, its state machine, and
//! the fibers that keep it alive.
//!
//! A session is created disconnected, may be connected exactly once, and
//! is terminal after it disconnects for any reason; create a fresh
//! session to reconnect. While connected, the read fiber (sole writer of
//! the world model) and the keep-alive fiber run, plus the outgoing-audio
//! fiber when an encoder is configured.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::CertificateDer;

use crate::audio::{
    AudioConfig, AudioInput, AudioStream, DecoderFactory, EncoderFactory, IncomingAudio,
    OutboundAudio,
};
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::events::{change_mask, DisconnectReason, Event};
use crate::messages::{ControlMessage, PROTOCOL_VERSION};
use crate::proto::mumble;
use crate::target::VoiceTarget;
use crate::transport::{self, FrameReader, SharedWriter, TlsIdentity, TlsSettings};
use crate::voice::VOICE_TARGET_LOOPBACK;
use crate::world::{User, World};

/// The public Mumble control port.
pub const DEFAULT_PORT: u16 = 64738;
/// Interval between client keep-alive pings. The read deadline is twice
/// this.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

pub(crate) type ControlWriter = WriteHalf<TlsStream<TcpStream>>;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// No connection; the initial and terminal state.
    Disconnected = 0,
    /// TLS is up and authentication has been sent; awaiting server sync.
    Connected = 1,
    /// `ServerSync` arrived; the world model is live.
    Synced = 2,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => State::Connected,
            2 => State::Synced,
            _ => State::Disconnected,
        }
    }
}

change_mask! {
    /// Server-held information the client can explicitly ask for.
    Request {
        /// Channel description blob (per channel).
        DESCRIPTION = 1 << 0,
        /// User comment blob (per user).
        COMMENT = 1 << 1,
        /// User texture blob (per user).
        TEXTURE = 1 << 2,
        /// Connection statistics (per user).
        STATS = 1 << 3,
        /// The registered-user list.
        USER_LIST = 1 << 4,
        /// Channel ACLs and groups (per channel).
        ACL = 1 << 5,
        /// The server ban list.
        BAN_LIST = 1 << 6,
    }
}

/// User-provided parameters describing how to reach a server.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Hostname or IP address of the server.
    pub host: String,
    /// TCP port, defaults to the public Mumble port.
    pub port: u16,
    /// Username presented during authentication.
    pub username: String,
    /// Optional server or account password.
    pub password: Option<String>,
    /// Access tokens supplied during authentication.
    pub tokens: Vec<String>,
    /// Duration to wait for the TCP and TLS handshakes, each.
    pub connect_timeout: Duration,
    /// Local address to bind the outgoing connection to.
    pub local_bind: Option<std::net::SocketAddr>,
    /// Keep-alive period; liveness allows two missed pings.
    pub ping_interval: Duration,
    /// TLS options.
    pub tls: TlsSettings,
    /// Audio pipeline options.
    pub audio: AudioConfig,
    /// Capacity of the host event channel.
    pub event_buffer: usize,
}

impl SessionConfig {
    /// Create a configuration for the given host with defaults.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: "murmel".to_string(),
            password: None,
            tokens: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            local_bind: None,
            ping_interval: DEFAULT_PING_INTERVAL,
            tls: TlsSettings::default(),
            audio: AudioConfig::default(),
            event_buffer: 64,
        }
    }

    /// Begin building a custom configuration for the given host.
    pub fn builder(host: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder {
            config: SessionConfig::new(host),
        }
    }
}

/// Fluent builder for a [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Override the TCP port used when connecting.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the username presented to the server.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = username.into();
        self
    }

    /// Provide a password used during authentication.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Replace the entire access token list.
    pub fn tokens(mut self, tokens: impl Into<Vec<String>>) -> Self {
        self.config.tokens = tokens.into();
        self
    }

    /// Append a single access token.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.tokens.push(token.into());
        self
    }

    /// Configure the handshake timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Bind the outgoing connection to a local address.
    pub fn local_bind(mut self, addr: std::net::SocketAddr) -> Self {
        self.config.local_bind = Some(addr);
        self
    }

    /// Override the keep-alive period (and with it the read deadline).
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    /// Set a custom TLS server name for SNI and certificate matching.
    pub fn tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.config.tls.server_name = Some(name.into());
        self
    }

    /// Control whether invalid or self-signed certificates are accepted.
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.config.tls.accept_invalid_certs = accept;
        self
    }

    /// Add a trust anchor for certificate verification.
    pub fn root_cert(mut self, cert: CertificateDer<'static>) -> Self {
        self.config.tls.root_certs.push(cert);
        self
    }

    /// Present a client certificate during the handshake.
    pub fn identity(mut self, identity: TlsIdentity) -> Self {
        self.config.tls.identity = Some(identity);
        self
    }

    /// Audio frame duration; one of 10, 20, 40 or 60 ms.
    pub fn audio_interval(mut self, interval: Duration) -> Self {
        self.config.audio.interval = interval;
        self
    }

    /// Number of frames batched into one outgoing voice packet.
    pub fn frames_per_packet(mut self, frames: usize) -> Self {
        self.config.audio.frames_per_packet = frames;
        self
    }

    /// Depth of the outgoing PCM queue and of each per-speaker queue.
    pub fn audio_queue_depth(mut self, depth: usize) -> Self {
        self.config.audio.queue_depth = depth;
        self
    }

    /// Replace the outgoing audio encoder factory.
    pub fn encoder(mut self, factory: Option<EncoderFactory>) -> Self {
        self.config.audio.encoder = factory;
        self
    }

    /// Replace the per-speaker decoder factory.
    pub fn decoder(mut self, factory: Option<DecoderFactory>) -> Self {
        self.config.audio.decoder = factory;
        self
    }

    /// Capacity of the host event channel.
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.config.event_buffer = capacity;
        self
    }

    /// Finalise the builder, producing an owned [`SessionConfig`].
    pub fn build(self) -> SessionConfig {
        self.config
    }
}

/// State shared between the session handle and its fibers.
pub(crate) struct Shared {
    state: AtomicU8,
    closed: AtomicBool,
    pub(crate) world: RwLock<World>,
    pub(crate) writer: SharedWriter<ControlWriter>,
    pub(crate) events: broadcast::Sender<Event>,
    shutdown: watch::Sender<bool>,
    pub(crate) voice_target: Arc<AtomicU8>,
}

impl Shared {
    pub(crate) fn new(events: broadcast::Sender<Event>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: AtomicU8::new(State::Disconnected as u8),
            closed: AtomicBool::new(false),
            world: RwLock::new(World::default()),
            writer: Arc::new(Mutex::new(None)),
            events,
            shutdown,
            voice_target: Arc::new(AtomicU8::new(0)),
        }
    }

    pub(crate) fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear the session down exactly once: stop the fibers, close the
    /// transport, drop the world and deliver the terminal event.
    pub(crate) async fn close(&self, reason: DisconnectReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        {
            let mut guard = self.writer.lock().await;
            if let Some(mut writer) = guard.take() {
                let _ = writer.shutdown().await;
            }
        }
        self.set_state(State::Disconnected);
        self.world.write().await.clear();
        let _ = self.events.send(Event::Disconnect(reason));
    }
}

/// An authenticated connection to one server.
pub struct Session {
    config: SessionConfig,
    shared: Arc<Shared>,
    streams_tx: mpsc::Sender<AudioStream>,
    streams_rx: Option<mpsc::Receiver<AudioStream>>,
    audio_input: Option<AudioInput>,
    read_task: Option<JoinHandle<()>>,
    ping_task: Option<JoinHandle<()>>,
    audio_task: Option<JoinHandle<()>>,
}

impl Session {
    /// Create a disconnected session with the provided configuration.
    pub fn new(config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (streams_tx, streams_rx) = mpsc::channel(64);
        Self {
            config,
            shared: Arc::new(Shared::new(events)),
            streams_tx,
            streams_rx: Some(streams_rx),
            audio_input: None,
            read_task: None,
            ping_task: None,
            audio_task: None,
        }
    }

    /// The configuration this session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// Subscribe to the session's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Snapshot of the replicated world.
    pub async fn world(&self) -> World {
        self.shared.world.read().await.clone()
    }

    /// The local user; available once the session is synced.
    pub async fn self_user(&self) -> Option<User> {
        self.shared.world.read().await.self_user().cloned()
    }

    /// Receiver of per-speaker audio streams. Yields one [`AudioStream`]
    /// per remote speaker; single consumer, so this can be taken once.
    pub fn take_audio_streams(&mut self) -> Option<mpsc::Receiver<AudioStream>> {
        self.streams_rx.take()
    }

    /// Producer handle for outgoing audio; present after a successful
    /// connect when an encoder is configured.
    pub fn audio_input(&self) -> Option<AudioInput> {
        self.audio_input.clone()
    }

    /// Connect to the configured server.
    ///
    /// Dials TLS, launches the session fibers and sends the `Version` and
    /// `Authenticate` messages. The method returns once authentication is
    /// on the wire; sync completion is signalled by [`Event::Connect`].
    pub async fn connect(&mut self) -> Result<(), Error> {
        if self.shared.is_closed() {
            return Err(Error::InvalidState("session already disconnected"));
        }
        if self.state() != State::Disconnected {
            return Err(Error::InvalidState("session already connected"));
        }
        if self.config.username.trim().is_empty() {
            return Err(Error::InvalidConfig("username may not be empty".into()));
        }
        self.config.audio.validate()?;

        let stream = transport::dial(
            &self.config.host,
            self.config.port,
            self.config.connect_timeout,
            self.config.local_bind,
            &self.config.tls,
        )
        .await?;

        let encoder = match &self.config.audio.encoder {
            Some(factory) => Some(factory()?),
            None => None,
        };

        let (read_half, write_half) = tokio::io::split(stream);
        *self.shared.writer.lock().await = Some(write_half);
        *self.shared.world.write().await = World::new();
        self.shared.set_state(State::Connected);

        let (fatal_tx, fatal_rx) = mpsc::channel(4);
        let reader = FrameReader::new(read_half, self.config.ping_interval * 2);
        let incoming = IncomingAudio::new(
            self.streams_tx.clone(),
            self.config.audio.decoder.clone(),
            self.config.audio.queue_depth,
        );
        let dispatcher = Dispatcher::new(Arc::clone(&self.shared), incoming);
        self.read_task = Some(tokio::spawn(read_loop(
            reader,
            dispatcher,
            Arc::clone(&self.shared),
            self.shared.shutdown.subscribe(),
            fatal_rx,
        )));
        self.ping_task = Some(tokio::spawn(ping_loop(
            Arc::clone(&self.shared),
            self.config.ping_interval,
            fatal_tx.clone(),
            self.shared.shutdown.subscribe(),
        )));
        if let Some(encoder) = encoder {
            let (input, outbound) = OutboundAudio::new(
                &self.config.audio,
                encoder,
                Arc::clone(&self.shared.writer),
                Arc::clone(&self.shared.voice_target),
            );
            self.audio_input = Some(input);
            self.audio_task = Some(tokio::spawn(
                outbound.run(self.shared.shutdown.subscribe(), fatal_tx),
            ));
        }

        self.send(ControlMessage::Version(version_message())).await?;
        self.send(ControlMessage::Authenticate(authenticate_message(
            &self.config,
        )))
        .await?;
        Ok(())
    }

    /// Disconnect from the server. The session is terminal afterwards.
    pub async fn disconnect(&mut self) -> Result<(), Error> {
        if self.state() == State::Disconnected {
            return Err(Error::InvalidState("session is not connected"));
        }
        self.shared.close(DisconnectReason::User).await;
        self.join_fibers().await;
        Ok(())
    }

    async fn join_fibers(&mut self) {
        let tasks = [
            self.read_task.take(),
            self.ping_task.take(),
            self.audio_task.take(),
        ];
        for task in tasks.into_iter().flatten() {
            let _ = task.await;
        }
    }

    /// Send a control message.
    ///
    /// Serializes under the writer lock; wire order equals the order in
    /// which sends acquire it. Transport faults trigger the terminal
    /// disconnect path before the error is returned.
    pub async fn send(&self, message: ControlMessage) -> Result<(), Error> {
        let envelope = message
            .encode()
            .map_err(|err| Error::Protocol(format!("encode {:?} failed: {err}", message.kind())))?;
        match transport::write_frame(&self.shared.writer, &envelope).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if matches!(err, Error::Transport(_)) {
                    self.shared
                        .close(DisconnectReason::Error(err.to_string()))
                        .await;
                }
                Err(err)
            }
        }
    }

    /// Send a private text message to a user.
    pub async fn send_user_message(
        &self,
        session: u32,
        message: impl Into<String>,
    ) -> Result<(), Error> {
        self.send(ControlMessage::TextMessage(mumble::TextMessage {
            session: vec![session],
            message: message.into(),
            ..Default::default()
        }))
        .await
    }

    /// Send a text message to everyone in a channel.
    pub async fn send_channel_message(
        &self,
        channel_id: u32,
        message: impl Into<String>,
    ) -> Result<(), Error> {
        self.send(ControlMessage::TextMessage(mumble::TextMessage {
            channel_id: vec![channel_id],
            message: message.into(),
            ..Default::default()
        }))
        .await
    }

    /// Send a text message to a channel and its whole subtree.
    pub async fn send_tree_message(
        &self,
        channel_id: u32,
        message: impl Into<String>,
    ) -> Result<(), Error> {
        self.send(ControlMessage::TextMessage(mumble::TextMessage {
            tree_id: vec![channel_id],
            message: message.into(),
            ..Default::default()
        }))
        .await
    }

    /// Ask the server to move a user into a channel. The world model is
    /// updated when the server echoes the change.
    pub async fn move_user(&self, session: u32, channel_id: u32) -> Result<(), Error> {
        self.send(ControlMessage::UserState(mumble::UserState {
            session: Some(session),
            channel_id: Some(channel_id),
            ..Default::default()
        }))
        .await
    }

    /// Move the local user into a channel.
    pub async fn join_channel(&self, channel_id: u32) -> Result<(), Error> {
        let session = self.require_self().await?;
        self.move_user(session, channel_id).await
    }

    /// Ask the server to create a sub-channel; the server assigns the id
    /// and echoes a `ChannelState`.
    pub async fn create_channel(
        &self,
        parent: u32,
        name: impl Into<String>,
        temporary: bool,
    ) -> Result<(), Error> {
        self.send(ControlMessage::ChannelState(mumble::ChannelState {
            parent: Some(parent),
            name: Some(name.into()),
            temporary: Some(temporary),
            ..Default::default()
        }))
        .await
    }

    /// Ask the server to remove a channel and its subtree.
    pub async fn remove_channel(&self, channel_id: u32) -> Result<(), Error> {
        self.send(ControlMessage::ChannelRemove(mumble::ChannelRemove {
            channel_id,
        }))
        .await
    }

    /// Rename a channel.
    pub async fn rename_channel(
        &self,
        channel_id: u32,
        name: impl Into<String>,
    ) -> Result<(), Error> {
        self.send(ControlMessage::ChannelState(mumble::ChannelState {
            channel_id: Some(channel_id),
            name: Some(name.into()),
            ..Default::default()
        }))
        .await
    }

    /// Set a channel's description.
    pub async fn set_channel_description(
        &self,
        channel_id: u32,
        description: impl Into<String>,
    ) -> Result<(), Error> {
        self.send(ControlMessage::ChannelState(mumble::ChannelState {
            channel_id: Some(channel_id),
            description: Some(description.into()),
            ..Default::default()
        }))
        .await
    }

    /// Server-mute or unmute another user (requires permission).
    pub async fn set_user_mute(&self, session: u32, mute: bool) -> Result<(), Error> {
        self.send(ControlMessage::UserState(mumble::UserState {
            session: Some(session),
            mute: Some(mute),
            ..Default::default()
        }))
        .await
    }

    /// Server-deafen or undeafen another user (requires permission).
    pub async fn set_user_deaf(&self, session: u32, deaf: bool) -> Result<(), Error> {
        self.send(ControlMessage::UserState(mumble::UserState {
            session: Some(session),
            deaf: Some(deaf),
            ..Default::default()
        }))
        .await
    }

    /// Mute or unmute the local user.
    pub async fn set_self_mute(&self, mute: bool) -> Result<(), Error> {
        let session = self.require_self().await?;
        self.send(ControlMessage::UserState(mumble::UserState {
            session: Some(session),
            self_mute: Some(mute),
            ..Default::default()
        }))
        .await
    }

    /// Deafen or undeafen the local user.
    pub async fn set_self_deaf(&self, deaf: bool) -> Result<(), Error> {
        let session = self.require_self().await?;
        self.send(ControlMessage::UserState(mumble::UserState {
            session: Some(session),
            self_deaf: Some(deaf),
            ..Default::default()
        }))
        .await
    }

    /// Register a user with the server; they must have a certificate.
    pub async fn register_user(&self, session: u32) -> Result<(), Error> {
        self.send(ControlMessage::UserState(mumble::UserState {
            session: Some(session),
            user_id: Some(0),
            ..Default::default()
        }))
        .await
    }

    /// Register the local user with the server.
    pub async fn register_self(&self) -> Result<(), Error> {
        let session = self.require_self().await?;
        self.register_user(session).await
    }

    /// Set the local user's comment.
    pub async fn set_comment(&self, comment: impl Into<String>) -> Result<(), Error> {
        let session = self.require_self().await?;
        self.send(ControlMessage::UserState(mumble::UserState {
            session: Some(session),
            comment: Some(comment.into()),
            ..Default::default()
        }))
        .await
    }

    /// Request server-wide lists: [`Request::USER_LIST`] and
    /// [`Request::BAN_LIST`]; other bits are ignored here.
    pub async fn request(&self, request: Request) -> Result<(), Error> {
        if request.contains(Request::USER_LIST) {
            self.send(ControlMessage::UserList(mumble::UserList::default()))
                .await?;
        }
        if request.contains(Request::BAN_LIST) {
            self.send(ControlMessage::BanList(mumble::BanList {
                query: Some(true),
                ..Default::default()
            }))
            .await?;
        }
        Ok(())
    }

    /// Request per-user blobs and statistics: [`Request::COMMENT`],
    /// [`Request::TEXTURE`] and [`Request::STATS`].
    pub async fn request_user(&self, session: u32, request: Request) -> Result<(), Error> {
        let mut blob = mumble::RequestBlob::default();
        if request.contains(Request::COMMENT) {
            blob.session_comment.push(session);
        }
        if request.contains(Request::TEXTURE) {
            blob.session_texture.push(session);
        }
        if !blob.session_comment.is_empty() || !blob.session_texture.is_empty() {
            self.send(ControlMessage::RequestBlob(blob)).await?;
        }
        if request.contains(Request::STATS) {
            self.send(ControlMessage::UserStats(mumble::UserStats {
                session: Some(session),
                stats_only: Some(false),
                ..Default::default()
            }))
            .await?;
        }
        Ok(())
    }

    /// Request per-channel blobs and ACLs: [`Request::DESCRIPTION`] and
    /// [`Request::ACL`].
    pub async fn request_channel(&self, channel_id: u32, request: Request) -> Result<(), Error> {
        if request.contains(Request::DESCRIPTION) {
            self.send(ControlMessage::RequestBlob(mumble::RequestBlob {
                channel_description: vec![channel_id],
                ..Default::default()
            }))
            .await?;
        }
        if request.contains(Request::ACL) {
            self.send(ControlMessage::Acl(mumble::Acl {
                channel_id,
                query: Some(true),
                ..Default::default()
            }))
            .await?;
        }
        Ok(())
    }

    /// Register a voice target with the server so audio can name its slot.
    pub async fn register_voice_target(&self, target: &VoiceTarget) -> Result<(), Error> {
        self.send(ControlMessage::VoiceTarget(target.to_message()))
            .await
    }

    /// Select the voice-target slot for outgoing audio. `None` restores
    /// normal channel routing. The target must already be registered.
    pub fn set_voice_target(&self, id: Option<u8>) -> Result<(), Error> {
        let value = id.unwrap_or(0);
        if value > VOICE_TARGET_LOOPBACK {
            return Err(Error::InvalidConfig(format!(
                "voice target {value} outside 0..=31"
            )));
        }
        self.shared.voice_target.store(value, Ordering::Relaxed);
        Ok(())
    }

    async fn require_self(&self) -> Result<u32, Error> {
        self.shared
            .world
            .read()
            .await
            .self_session
            .ok_or(Error::InvalidState("session is not synced"))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shared.shutdown.send(true);
        let tasks = [
            self.read_task.take(),
            self.ping_task.take(),
            self.audio_task.take(),
        ];
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
    }
}

async fn read_loop(
    mut reader: FrameReader<ReadHalf<TlsStream<TcpStream>>>,
    mut dispatcher: Dispatcher,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    mut fatal: mpsc::Receiver<DisconnectReason>,
) {
    loop {
        tokio::select! {
            result = reader.read_frame() => {
                match result {
                    Ok(envelope) => {
                        let message = match ControlMessage::try_from(envelope) {
                            Ok(message) => message,
                            Err(err) => {
                                shared.close(DisconnectReason::Error(err.to_string())).await;
                                break;
                            }
                        };
                        if let Some(reason) = dispatcher.handle(message).await {
                            shared.close(reason).await;
                            break;
                        }
                    }
                    Err(err) => {
                        shared.close(DisconnectReason::Error(err.to_string())).await;
                        break;
                    }
                }
            }
            reason = fatal.recv() => {
                if let Some(reason) = reason {
                    shared.close(reason).await;
                }
                break;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    dispatcher.shutdown();
    tracing::debug!("read fiber stopped");
}

async fn ping_loop(
    shared: Arc<Shared>,
    period: Duration,
    fatal: mpsc::Sender<DisconnectReason>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    // The first tick completes immediately; skip it so pings are spaced a
    // full period apart.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let ping = {
                    let mut world = shared.world.write().await;
                    world.ping.record_sent();
                    mumble::Ping {
                        timestamp: Some(unix_seconds()),
                        tcp_packets: Some(world.ping.sent as u32),
                        tcp_ping_avg: Some(world.ping.average_ms as f32),
                        ..Default::default()
                    }
                };
                let envelope = match ControlMessage::Ping(ping).encode() {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        tracing::warn!("failed to encode ping: {err}");
                        continue;
                    }
                };
                match transport::write_frame(&shared.writer, &envelope).await {
                    Ok(()) => {}
                    Err(Error::InvalidState(_)) => break,
                    Err(err) => {
                        let _ = fatal.try_send(DisconnectReason::Error(err.to_string()));
                        break;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("keep-alive fiber stopped");
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn version_message() -> mumble::Version {
    let (major, minor, patch) = PROTOCOL_VERSION;
    mumble::Version {
        version: Some((major << 16) | (minor << 8) | patch),
        release: Some(format!("murmel {}", env!("CARGO_PKG_VERSION"))),
        os: Some(std::env::consts::OS.to_string()),
        os_version: Some(std::env::consts::ARCH.to_string()),
    }
}

fn authenticate_message(config: &SessionConfig) -> mumble::Authenticate {
    mumble::Authenticate {
        username: Some(config.username.clone()),
        password: config.password.clone(),
        tokens: config.tokens.clone(),
        celt_versions: Vec::new(),
        opus: Some(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder_sets_fields() {
        let config = SessionConfig::builder("example.org")
            .port(12345)
            .username("bot")
            .password("secret")
            .token("alpha")
            .token("beta")
            .connect_timeout(Duration::from_secs(30))
            .ping_interval(Duration::from_secs(5))
            .tls_server_name("server.example.org")
            .accept_invalid_certs(true)
            .audio_interval(Duration::from_millis(40))
            .frames_per_packet(2)
            .event_buffer(128)
            .build();

        assert_eq!(config.host, "example.org");
        assert_eq!(config.port, 12345);
        assert_eq!(config.username, "bot");
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.tokens, vec!["alpha", "beta"]);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.ping_interval, Duration::from_secs(5));
        assert_eq!(
            config.tls.server_name.as_deref(),
            Some("server.example.org")
        );
        assert!(config.tls.accept_invalid_certs);
        assert_eq!(config.audio.interval, Duration::from_millis(40));
        assert_eq!(config.audio.frames_per_packet, 2);
        assert_eq!(config.audio.frame_size(), 1920);
        assert_eq!(config.event_buffer, 128);
    }

    #[test]
    fn authenticate_message_contains_credentials() {
        let config = SessionConfig::builder("example")
            .username("alice")
            .password("pw")
            .tokens(vec!["one".into(), "two".into()])
            .build();

        let message = authenticate_message(&config);
        assert_eq!(message.username.as_deref(), Some("alice"));
        assert_eq!(message.password.as_deref(), Some("pw"));
        assert_eq!(message.tokens, vec!["one", "two"]);
        assert_eq!(message.opus, Some(true));
    }

    #[test]
    fn version_message_packs_protocol_revision() {
        let message = version_message();
        let expected =
            (PROTOCOL_VERSION.0 << 16) | (PROTOCOL_VERSION.1 << 8) | PROTOCOL_VERSION.2;
        assert_eq!(message.version, Some(expected));
        assert!(message.release.unwrap().starts_with("murmel"));
    }

    #[tokio::test]
    async fn connect_rejects_empty_username() {
        let config = SessionConfig::builder("localhost").username("  ").build();
        let mut session = Session::new(config);
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert_eq!(session.state(), State::Disconnected);
    }

    #[tokio::test]
    async fn connect_rejects_bad_audio_interval() {
        let config = SessionConfig::builder("localhost")
            .audio_interval(Duration::from_millis(25))
            .build();
        let mut session = Session::new(config);
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn send_requires_a_connection() {
        let session = Session::new(SessionConfig::new("localhost"));
        let err = session
            .send(ControlMessage::Ping(mumble::Ping::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn disconnect_requires_a_connection() {
        let mut session = Session::new(SessionConfig::new("localhost"));
        let err = session.disconnect().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn voice_target_selection_validates_range() {
        let session = Session::new(SessionConfig::new("localhost"));
        assert!(session.set_voice_target(Some(5)).is_ok());
        assert!(session.set_voice_target(Some(31)).is_ok());
        assert!(session.set_voice_target(None).is_ok());
        assert!(session.set_voice_target(Some(32)).is_err());
    }
}
