//! The audio pipeline: outgoing PCM framing and incoming per-speaker
//! fan-out.
//!
//! The codec itself is a collaborator behind the [`Encoder`] and
//! [`Decoder`] traits; the `audio` cargo feature supplies Opus
//! implementations. Sequencing, voice-target headers, burst termination
//! and the bounded queues are codec-agnostic and always available.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, watch};

use crate::error::Error;
use crate::events::DisconnectReason;
use crate::messages::{MessageEnvelope, MessageKind};
use crate::transport::{self, SharedWriter};
use crate::voice::VoicePacket;

/// Fixed sample rate of the voice path.
pub const SAMPLE_RATE: u32 = 48_000;
/// The voice path is mono.
pub const CHANNELS: u32 = 1;

/// Stateful audio encoder contract: 16-bit mono PCM in, codec bytes out.
/// Encoded frames must fit the 13-bit length field (at most 8191 bytes).
pub trait Encoder: Send {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, Error>;
}

/// Stateful audio decoder contract: codec bytes in, 16-bit mono PCM out.
pub trait Decoder: Send {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, Error>;
}

/// Creates one [`Encoder`] per connection.
pub type EncoderFactory = Arc<dyn Fn() -> Result<Box<dyn Encoder>, Error> + Send + Sync>;
/// Creates one [`Decoder`] per remote speaker.
pub type DecoderFactory = Arc<dyn Fn() -> Result<Box<dyn Decoder>, Error> + Send + Sync>;

/// Settings for both directions of the audio pipeline.
#[derive(Clone)]
pub struct AudioConfig {
    /// Frame duration; one of 10, 20, 40 or 60 ms.
    pub interval: Duration,
    /// Frames batched into one outgoing voice packet.
    pub frames_per_packet: usize,
    /// Depth of the outgoing PCM queue and of each per-speaker queue.
    pub queue_depth: usize,
    /// Encoder used for outgoing audio; `None` disables the outgoing
    /// pipeline.
    pub encoder: Option<EncoderFactory>,
    /// Decoder applied per speaker; `None` delivers raw frames only.
    pub decoder: Option<DecoderFactory>,
}

impl AudioConfig {
    /// PCM samples per frame at the configured interval.
    pub fn frame_size(&self) -> usize {
        self.interval.as_millis() as usize * (SAMPLE_RATE as usize / 1000)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if !matches!(self.interval.as_millis(), 10 | 20 | 40 | 60) {
            return Err(Error::InvalidConfig(format!(
                "audio interval must be 10, 20, 40 or 60 ms, got {} ms",
                self.interval.as_millis()
            )));
        }
        if self.frames_per_packet == 0 {
            return Err(Error::InvalidConfig(
                "frames_per_packet must be at least 1".into(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(Error::InvalidConfig("queue_depth must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(20),
            frames_per_packet: 1,
            queue_depth: 32,
            #[cfg(feature = "audio")]
            encoder: Some(opus_encoder_factory()),
            #[cfg(not(feature = "audio"))]
            encoder: None,
            #[cfg(feature = "audio")]
            decoder: Some(opus_decoder_factory()),
            #[cfg(not(feature = "audio"))]
            decoder: None,
        }
    }
}

impl std::fmt::Debug for AudioConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioConfig")
            .field("interval", &self.interval)
            .field("frames_per_packet", &self.frames_per_packet)
            .field("queue_depth", &self.queue_depth)
            .field("encoder", &self.encoder.is_some())
            .field("decoder", &self.decoder.is_some())
            .finish()
    }
}

pub(crate) enum OutboundFrame {
    Pcm(Vec<i16>),
    EndTransmission,
}

/// Producer handle for outgoing audio. Clones share the same bounded
/// queue; sends apply back-pressure when the pipeline falls behind.
#[derive(Clone)]
pub struct AudioInput {
    tx: mpsc::Sender<OutboundFrame>,
    positional: Arc<StdMutex<Option<[f32; 3]>>>,
    frame_size: usize,
}

impl AudioInput {
    /// Samples expected per frame.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Queue one PCM frame for encoding and transmission.
    pub async fn send_frame(&self, pcm: Vec<i16>) -> Result<(), Error> {
        if pcm.len() != self.frame_size {
            return Err(Error::Audio(format!(
                "expected {} samples per frame, got {}",
                self.frame_size,
                pcm.len()
            )));
        }
        self.tx
            .send(OutboundFrame::Pcm(pcm))
            .await
            .map_err(|_| Error::InvalidState("audio pipeline stopped"))
    }

    /// Mark the end of the current talk burst. The last packet already in
    /// flight carries the terminator bit.
    pub async fn end_transmission(&self) -> Result<(), Error> {
        self.tx
            .send(OutboundFrame::EndTransmission)
            .await
            .map_err(|_| Error::InvalidState("audio pipeline stopped"))
    }

    /// Attach positional coordinates to subsequent packets, or clear them.
    pub fn set_positional(&self, coords: Option<[f32; 3]>) {
        *self.positional.lock().unwrap() = coords;
    }
}

/// The outgoing-audio fiber: drains the PCM queue, encodes, frames and
/// tunnels packets through the control channel.
pub(crate) struct OutboundAudio<W> {
    rx: mpsc::Receiver<OutboundFrame>,
    encoder: Box<dyn Encoder>,
    writer: SharedWriter<W>,
    target: Arc<AtomicU8>,
    positional: Arc<StdMutex<Option<[f32; 3]>>>,
    frames_per_packet: usize,
    sequence: u64,
    batch: Vec<Vec<u8>>,
    pending: Option<VoicePacket>,
}

impl<W: AsyncWrite + Unpin> OutboundAudio<W> {
    pub(crate) fn new(
        config: &AudioConfig,
        encoder: Box<dyn Encoder>,
        writer: SharedWriter<W>,
        target: Arc<AtomicU8>,
    ) -> (AudioInput, Self) {
        let (tx, rx) = mpsc::channel(config.queue_depth);
        let positional = Arc::new(StdMutex::new(None));
        let input = AudioInput {
            tx,
            positional: Arc::clone(&positional),
            frame_size: config.frame_size(),
        };
        let outbound = Self {
            rx,
            encoder,
            writer,
            target,
            positional,
            frames_per_packet: config.frames_per_packet,
            sequence: 0,
            batch: Vec::new(),
            pending: None,
        };
        (input, outbound)
    }

    pub(crate) async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        fatal: mpsc::Sender<DisconnectReason>,
    ) {
        loop {
            tokio::select! {
                frame = self.rx.recv() => {
                    let result = match frame {
                        Some(OutboundFrame::Pcm(pcm)) => self.handle_pcm(&pcm).await,
                        Some(OutboundFrame::EndTransmission) => self.finish_burst().await,
                        None => {
                            let _ = self.finish_burst().await;
                            break;
                        }
                    };
                    match result {
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
        tracing::debug!("outgoing audio fiber stopped");
    }

    async fn handle_pcm(&mut self, pcm: &[i16]) -> Result<(), Error> {
        match self.encoder.encode(pcm) {
            Ok(bytes) => self.batch.push(bytes),
            Err(err) => {
                // Codec faults are never fatal to the session.
                tracing::warn!("dropping audio frame: {err}");
                return Ok(());
            }
        }
        if self.batch.len() >= self.frames_per_packet {
            let packet = self.build_packet();
            self.rotate_pending(packet).await?;
        }
        Ok(())
    }

    /// Flush the partial batch and the held-back packet, marking the very
    /// last frame as the end of the talk burst.
    async fn finish_burst(&mut self) -> Result<(), Error> {
        if !self.batch.is_empty() {
            let packet = self.build_packet();
            self.rotate_pending(packet).await?;
        }
        if let Some(mut packet) = self.pending.take() {
            packet.end_of_transmission = true;
            self.write_packet(&packet).await?;
        }
        Ok(())
    }

    fn build_packet(&mut self) -> VoicePacket {
        let mut packet = VoicePacket::opus(self.target.load(Ordering::Relaxed), self.sequence);
        self.sequence += self.batch.len() as u64;
        packet.frames = std::mem::take(&mut self.batch);
        packet.positional = *self.positional.lock().unwrap();
        packet
    }

    /// Hold `packet` back and ship its predecessor. The one-packet delay
    /// lets the final packet of a burst carry the terminator bit.
    async fn rotate_pending(&mut self, packet: VoicePacket) -> Result<(), Error> {
        if let Some(previous) = self.pending.replace(packet) {
            self.write_packet(&previous).await?;
        }
        Ok(())
    }

    async fn write_packet(&mut self, packet: &VoicePacket) -> Result<(), Error> {
        let bytes = packet
            .encode()
            .map_err(|err| Error::Protocol(err.to_string()))?;
        let envelope = MessageEnvelope::new(MessageKind::UdpTunnel, bytes);
        transport::write_frame(&self.writer, &envelope).await
    }
}

/// One decoded (or raw) frame delivered to a speaker's stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Sender session id.
    pub session: u32,
    pub sequence: u64,
    /// Raw codec payload.
    pub opus: Vec<u8>,
    /// Decoded PCM; empty when no decoder is configured or decode failed.
    pub pcm: Vec<i16>,
    /// Positional coordinates attached to the carrying packet.
    pub positional: Option<[f32; 3]>,
    /// True on the final frame of a talk burst.
    pub end_of_transmission: bool,
}

/// A per-speaker stream of audio frames.
///
/// Created when a speaker's first voice packet arrives and handed to the
/// host through [`crate::Session::take_audio_streams`]. The stream stays
/// open across talk bursts and closes when the speaker leaves or the
/// session ends.
#[derive(Debug)]
pub struct AudioStream {
    session: u32,
    rx: mpsc::Receiver<AudioFrame>,
}

impl AudioStream {
    /// Session id of the speaker feeding this stream.
    pub fn session(&self) -> u32 {
        self.session
    }

    /// Receive the next frame; `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<AudioFrame, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

struct Lane {
    tx: mpsc::Sender<AudioFrame>,
    decoder: Option<Box<dyn Decoder>>,
}

/// Demultiplexes inbound voice packets into per-speaker lanes.
///
/// When a lane's queue is full the newest frame is dropped; stale audio is
/// worth less than fresh audio.
pub(crate) struct IncomingAudio {
    streams_tx: mpsc::Sender<AudioStream>,
    lanes: HashMap<u32, Lane>,
    decoder_factory: Option<DecoderFactory>,
    queue_depth: usize,
}

impl IncomingAudio {
    pub(crate) fn new(
        streams_tx: mpsc::Sender<AudioStream>,
        decoder_factory: Option<DecoderFactory>,
        queue_depth: usize,
    ) -> Self {
        Self {
            streams_tx,
            lanes: HashMap::new(),
            decoder_factory,
            queue_depth,
        }
    }

    pub(crate) fn route(&mut self, packet: &VoicePacket) {
        let Some(session) = packet.session else {
            return;
        };
        let lane = self.lane_for(session);

        let count = packet.frames.len();
        for (index, opus) in packet.frames.iter().enumerate() {
            let last = index + 1 == count;
            let pcm = match lane.decoder.as_mut() {
                Some(decoder) => match decoder.decode(opus) {
                    Ok(pcm) => pcm,
                    Err(err) => {
                        tracing::warn!(session, "audio decode failed: {err}");
                        Vec::new()
                    }
                },
                None => Vec::new(),
            };
            let frame = AudioFrame {
                session,
                sequence: packet.sequence + index as u64,
                opus: opus.clone(),
                pcm,
                positional: if last { packet.positional } else { None },
                end_of_transmission: last && packet.end_of_transmission,
            };
            match lane.tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(session, "dropping audio frame: receiver is full");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    fn lane_for(&mut self, session: u32) -> &mut Lane {
        self.lanes.entry(session).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.queue_depth);
            let decoder = self.decoder_factory.as_ref().and_then(|factory| {
                factory()
                    .map_err(|err| tracing::warn!(session, "decoder creation failed: {err}"))
                    .ok()
            });
            if self
                .streams_tx
                .try_send(AudioStream { session, rx })
                .is_err()
            {
                tracing::warn!(session, "audio stream dropped: host is not consuming");
            }
            Lane { tx, decoder }
        })
    }

    /// Close a speaker's stream when they disconnect.
    pub(crate) fn remove(&mut self, session: u32) {
        self.lanes.remove(&session);
    }

    /// Close every stream at session teardown.
    pub(crate) fn clear(&mut self) {
        self.lanes.clear();
    }
}

#[cfg(feature = "audio")]
pub use opus_codec::{opus_decoder_factory, opus_encoder_factory, OpusDecoder, OpusEncoder};

#[cfg(feature = "audio")]
mod opus_codec {
    use super::{Decoder, DecoderFactory, Encoder, EncoderFactory, SAMPLE_RATE};
    use crate::error::Error;
    use std::sync::Arc;

    // 120 ms at 48 kHz, the longest frame Opus can emit.
    const MAX_FRAME_SAMPLES: usize = 5760;
    const MAX_ENCODED_BYTES: usize = 4096;

    fn opus_err(err: opus::Error) -> Error {
        Error::Audio(err.to_string())
    }

    /// VoIP-profile mono Opus encoder at 48 kHz with VBR disabled.
    pub struct OpusEncoder {
        inner: opus::Encoder,
    }

    impl OpusEncoder {
        pub fn new() -> Result<Self, Error> {
            let mut inner =
                opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
                    .map_err(opus_err)?;
            inner.set_vbr(false).map_err(opus_err)?;
            Ok(Self { inner })
        }
    }

    impl Encoder for OpusEncoder {
        fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, Error> {
            let mut buffer = vec![0u8; MAX_ENCODED_BYTES];
            let written = self.inner.encode(pcm, &mut buffer).map_err(opus_err)?;
            buffer.truncate(written);
            Ok(buffer)
        }
    }

    /// Mono Opus decoder at 48 kHz.
    pub struct OpusDecoder {
        inner: opus::Decoder,
    }

    impl OpusDecoder {
        pub fn new() -> Result<Self, Error> {
            let inner = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono).map_err(opus_err)?;
            Ok(Self { inner })
        }
    }

    impl Decoder for OpusDecoder {
        fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, Error> {
            let mut pcm = vec![0i16; MAX_FRAME_SAMPLES];
            let samples = self.inner.decode(data, &mut pcm, false).map_err(opus_err)?;
            pcm.truncate(samples);
            Ok(pcm)
        }
    }

    /// Factory wiring [`OpusEncoder`] into [`super::AudioConfig`].
    pub fn opus_encoder_factory() -> EncoderFactory {
        Arc::new(|| Ok(Box::new(OpusEncoder::new()?) as Box<dyn Encoder>))
    }

    /// Factory wiring [`OpusDecoder`] into [`super::AudioConfig`].
    pub fn opus_decoder_factory() -> DecoderFactory {
        Arc::new(|| Ok(Box::new(OpusDecoder::new()?) as Box<dyn Decoder>))
    }
}
