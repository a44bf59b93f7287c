//! Codec for the legacy voice-packet framing carried inside `UdpTunnel`
//! control packets.
//!
//! The first byte packs the audio codec into the high three bits and the
//! routing target into the low five. A varint sender session (inbound
//! only) and a varint sequence number follow, then one or more
//! length-prefixed Opus frames and an optional 12-byte positional trailer.
//! Non-Opus codecs are recognised but their payloads are carried opaquely;
//! sessions negotiated by this crate always use Opus.

use thiserror::Error;

use crate::varint::{self, VarintError};

/// Target value for regular channel routing.
pub const VOICE_TARGET_NORMAL: u8 = 0;
/// Target value for server loopback.
pub const VOICE_TARGET_LOOPBACK: u8 = 31;

/// Largest Opus frame the 13-bit length field can carry.
pub const MAX_FRAME_BYTES: usize = 0x1FFF;

const TERMINATOR_BIT: u64 = 0x2000;
const FRAME_LENGTH_MASK: u64 = 0x1FFF;
const POSITIONAL_LEN: usize = 12;

/// Audio codec identifier packed into the voice-packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceCodec {
    CeltAlpha,
    Ping,
    Speex,
    CeltBeta,
    Opus,
}

impl VoiceCodec {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(VoiceCodec::CeltAlpha),
            1 => Some(VoiceCodec::Ping),
            2 => Some(VoiceCodec::Speex),
            3 => Some(VoiceCodec::CeltBeta),
            4 => Some(VoiceCodec::Opus),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            VoiceCodec::CeltAlpha => 0,
            VoiceCodec::Ping => 1,
            VoiceCodec::Speex => 2,
            VoiceCodec::CeltBeta => 3,
            VoiceCodec::Opus => 4,
        }
    }
}

/// Failures while encoding or parsing a voice packet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VoiceError {
    /// The buffer ended before the structure it announced.
    #[error("truncated voice packet")]
    Truncated,
    /// A varint field was malformed.
    #[error("voice packet varint: {0}")]
    Varint(#[from] VarintError),
    /// The header carried an unassigned codec id.
    #[error("unknown voice codec {0}")]
    UnknownCodec(u8),
    /// A frame exceeds the 13-bit length field.
    #[error("voice frame too large: {0} bytes")]
    FrameTooLarge(usize),
    /// The routing target does not fit the 5-bit field.
    #[error("voice target out of range: {0}")]
    TargetOutOfRange(u8),
}

/// One voice packet, inbound or outbound.
#[derive(Debug, Clone, PartialEq)]
pub struct VoicePacket {
    pub codec: VoiceCodec,
    /// Routing target, `0..=31`.
    pub target: u8,
    /// Sender session id; present on packets received from the server.
    pub session: Option<u32>,
    /// Sequence number of the first frame in this packet. Voice pings
    /// reuse this field for their timestamp.
    pub sequence: u64,
    /// Encoded audio frames, in transmission order.
    pub frames: Vec<Vec<u8>>,
    /// True when the last frame terminates the talk burst.
    pub end_of_transmission: bool,
    /// Positional coordinates from the 12-byte trailer, if present.
    pub positional: Option<[f32; 3]>,
}

impl VoicePacket {
    /// Start an outbound Opus packet for the given target and sequence.
    pub fn opus(target: u8, sequence: u64) -> Self {
        Self {
            codec: VoiceCodec::Opus,
            target,
            session: None,
            sequence,
            frames: Vec::new(),
            end_of_transmission: false,
            positional: None,
        }
    }

    /// Serialize the packet. The sender session varint is written only
    /// when `session` is set, mirroring the server-side framing.
    pub fn encode(&self) -> Result<Vec<u8>, VoiceError> {
        if self.target > VOICE_TARGET_LOOPBACK {
            return Err(VoiceError::TargetOutOfRange(self.target));
        }
        let mut out = Vec::with_capacity(16 + self.frames.iter().map(Vec::len).sum::<usize>());
        out.push((self.codec.bits() << 5) | (self.target & 0x1F));
        if let Some(session) = self.session {
            varint::encode_u64(session as u64, &mut out);
        }
        varint::encode_u64(self.sequence, &mut out);
        match self.codec {
            VoiceCodec::Ping => {}
            VoiceCodec::Opus => {
                for (index, frame) in self.frames.iter().enumerate() {
                    if frame.len() > MAX_FRAME_BYTES {
                        return Err(VoiceError::FrameTooLarge(frame.len()));
                    }
                    let mut header = frame.len() as u64;
                    if self.end_of_transmission && index == self.frames.len() - 1 {
                        header |= TERMINATOR_BIT;
                    }
                    varint::encode_u64(header, &mut out);
                    out.extend_from_slice(frame);
                }
            }
            _ => {
                for frame in &self.frames {
                    out.extend_from_slice(frame);
                }
            }
        }
        if let Some(coords) = self.positional {
            for coord in coords {
                out.extend_from_slice(&coord.to_le_bytes());
            }
        }
        Ok(out)
    }

    /// Parse a packet received from the server (sender session present).
    pub fn decode_incoming(buf: &[u8]) -> Result<Self, VoiceError> {
        Self::decode(buf, true)
    }

    /// Parse a client-originated packet (no sender session).
    pub fn decode_outgoing(buf: &[u8]) -> Result<Self, VoiceError> {
        Self::decode(buf, false)
    }

    fn decode(buf: &[u8], incoming: bool) -> Result<Self, VoiceError> {
        let header = *buf.first().ok_or(VoiceError::Truncated)?;
        let codec = VoiceCodec::from_bits(header >> 5).ok_or(VoiceError::UnknownCodec(header >> 5))?;
        let target = header & 0x1F;
        let mut offset = 1;

        let session = if incoming {
            let (value, consumed) = varint::decode(&buf[offset..])?;
            offset += consumed;
            Some(value as u32)
        } else {
            None
        };
        let (sequence, consumed) = varint::decode(&buf[offset..])?;
        offset += consumed;

        let mut packet = Self {
            codec,
            target,
            session,
            sequence,
            frames: Vec::new(),
            end_of_transmission: false,
            positional: None,
        };

        match codec {
            VoiceCodec::Ping => {}
            VoiceCodec::Opus => loop {
                let remaining = buf.len() - offset;
                if remaining == 0 {
                    break;
                }
                // A trailing block of exactly 12 bytes after at least one
                // frame is the positional trailer.
                if remaining == POSITIONAL_LEN && !packet.frames.is_empty() {
                    packet.positional = Some(read_positional(&buf[offset..]));
                    break;
                }
                let (frame_header, consumed) = varint::decode(&buf[offset..])?;
                offset += consumed;
                let length = (frame_header & FRAME_LENGTH_MASK) as usize;
                let frame = buf
                    .get(offset..offset + length)
                    .ok_or(VoiceError::Truncated)?;
                offset += length;
                packet.frames.push(frame.to_vec());
                if frame_header & TERMINATOR_BIT != 0 {
                    packet.end_of_transmission = true;
                }
            },
            _ => {
                if offset < buf.len() {
                    packet.frames.push(buf[offset..].to_vec());
                }
            }
        }
        Ok(packet)
    }
}

fn read_positional(buf: &[u8]) -> [f32; 3] {
    let mut coords = [0f32; 3];
    for (index, coord) in coords.iter_mut().enumerate() {
        let start = index * 4;
        *coord = f32::from_le_bytes([buf[start], buf[start + 1], buf[start + 2], buf[start + 3]]);
    }
    coords
}
