//! Control-channel framing and the typed message space.
//!
//! Every control packet is a 6-byte preamble (`u16` type id, `u32` payload
//! length, both big endian) followed by the payload: a Protocol-Buffer body
//! for every assigned id except `UdpTunnel`, whose payload is a raw voice
//! packet. Unassigned ids pass through as [`ControlMessage::Unknown`] so
//! newer servers do not break older clients.

use prost::{EncodeError, Message};
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::proto::mumble;

/// Protocol revision tuple (major, minor, patch) advertised to the server.
pub const PROTOCOL_VERSION: (u32, u32, u32) = (1, 2, 4);
/// Size of the framing preamble in bytes.
pub const PREAMBLE_SIZE: usize = 6;
/// Largest payload accepted from the server. Anything bigger is a
/// protocol violation that terminates the session.
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

macro_rules! control_messages {
    ($($id:literal => $variant:ident($proto:ty),)+) => {
        /// Wire identifier for a control packet.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum MessageKind {
            $($variant,)+
            /// Voice data tunnelled over the control channel.
            UdpTunnel,
            /// Identifier without an assigned message type.
            Unknown(u16),
        }

        impl MessageKind {
            /// Construct a message kind from its wire identifier.
            pub fn from_id(value: u16) -> Self {
                match value {
                    1 => MessageKind::UdpTunnel,
                    $($id => MessageKind::$variant,)+
                    other => MessageKind::Unknown(other),
                }
            }

            /// Return the numeric identifier associated with this kind.
            pub fn id(self) -> u16 {
                match self {
                    MessageKind::UdpTunnel => 1,
                    $(MessageKind::$variant => $id,)+
                    MessageKind::Unknown(value) => value,
                }
            }
        }

        /// Fully typed representation of a control message.
        #[derive(Debug, Clone, PartialEq)]
        pub enum ControlMessage {
            $($variant($proto),)+
            /// Raw voice packet bytes (type id 1).
            UdpTunnel(Vec<u8>),
            /// Message type not modelled by this enum.
            Unknown(MessageEnvelope),
        }

        impl ControlMessage {
            /// Return the wire identifier corresponding to this variant.
            pub fn kind(&self) -> MessageKind {
                match self {
                    $(ControlMessage::$variant(_) => MessageKind::$variant,)+
                    ControlMessage::UdpTunnel(_) => MessageKind::UdpTunnel,
                    ControlMessage::Unknown(envelope) => envelope.kind,
                }
            }

            /// Convert the message into a framed envelope ready to send.
            pub fn encode(&self) -> Result<MessageEnvelope, EncodeError> {
                match self {
                    $(ControlMessage::$variant(msg) => {
                        MessageEnvelope::from_proto(MessageKind::$variant, msg)
                    })+
                    ControlMessage::UdpTunnel(bytes) => {
                        Ok(MessageEnvelope::new(MessageKind::UdpTunnel, bytes.clone()))
                    }
                    ControlMessage::Unknown(envelope) => Ok(envelope.clone()),
                }
            }
        }

        impl TryFrom<MessageEnvelope> for ControlMessage {
            type Error = MessageDecodeError;

            fn try_from(envelope: MessageEnvelope) -> Result<Self, Self::Error> {
                Ok(match envelope.kind {
                    $(MessageKind::$variant => {
                        ControlMessage::$variant(decode_as(envelope.kind, &envelope.payload)?)
                    })+
                    MessageKind::UdpTunnel => ControlMessage::UdpTunnel(envelope.payload),
                    MessageKind::Unknown(_) => ControlMessage::Unknown(envelope),
                })
            }
        }
    };
}

control_messages! {
    0 => Version(mumble::Version),
    2 => Authenticate(mumble::Authenticate),
    3 => Ping(mumble::Ping),
    4 => Reject(mumble::Reject),
    5 => ServerSync(mumble::ServerSync),
    6 => ChannelRemove(mumble::ChannelRemove),
    7 => ChannelState(mumble::ChannelState),
    8 => UserRemove(mumble::UserRemove),
    9 => UserState(mumble::UserState),
    10 => BanList(mumble::BanList),
    11 => TextMessage(mumble::TextMessage),
    12 => PermissionDenied(mumble::PermissionDenied),
    13 => Acl(mumble::Acl),
    14 => QueryUsers(mumble::QueryUsers),
    15 => CryptSetup(mumble::CryptSetup),
    16 => ContextActionModify(mumble::ContextActionModify),
    17 => ContextAction(mumble::ContextAction),
    18 => UserList(mumble::UserList),
    19 => VoiceTarget(mumble::VoiceTarget),
    20 => PermissionQuery(mumble::PermissionQuery),
    21 => CodecVersion(mumble::CodecVersion),
    22 => UserStats(mumble::UserStats),
    23 => RequestBlob(mumble::RequestBlob),
    24 => ServerConfig(mumble::ServerConfig),
    25 => SuggestConfig(mumble::SuggestConfig),
}

fn decode_as<M: Message + Default>(
    kind: MessageKind,
    payload: &[u8],
) -> Result<M, MessageDecodeError> {
    M::decode(payload).map_err(|source| MessageDecodeError::Decode { kind, source })
}

/// A framed control packet: wire identifier plus raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    /// Message identifier.
    pub kind: MessageKind,
    /// Serialized payload.
    pub payload: Vec<u8>,
}

impl MessageEnvelope {
    /// Build an envelope from raw parts.
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Build an envelope from a protobuf message.
    pub fn from_proto<M: Message>(kind: MessageKind, message: &M) -> Result<Self, EncodeError> {
        let mut payload = Vec::with_capacity(message.encoded_len());
        message.encode(&mut payload)?;
        Ok(Self { kind, payload })
    }

    /// Serialize the envelope to the provided async writer.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), io::Error>
    where
        W: AsyncWrite + Unpin,
    {
        let mut header = [0u8; PREAMBLE_SIZE];
        header[..2].copy_from_slice(&self.kind.id().to_be_bytes());
        header[2..].copy_from_slice(&(self.payload.len() as u32).to_be_bytes());

        writer.write_all(&header).await?;
        writer.write_all(&self.payload).await?;
        writer.flush().await?;

        Ok(())
    }

    /// Serialize the envelope into a contiguous byte buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PREAMBLE_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.kind.id().to_be_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Read a single framed packet from the wire.
///
/// Payloads above [`MAX_PAYLOAD_SIZE`] yield an `InvalidData` error; the
/// caller is expected to treat that as fatal.
pub async fn read_envelope<R>(reader: &mut R) -> Result<MessageEnvelope, io::Error>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; PREAMBLE_SIZE];
    reader.read_exact(&mut header).await?;

    let kind = u16::from_be_bytes([header[0], header[1]]);
    let length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {length} bytes (type={kind})"),
        ));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(MessageEnvelope::new(MessageKind::from_id(kind), payload))
}

/// Errors that can occur while decoding an envelope into a typed message.
#[derive(Debug, Error)]
pub enum MessageDecodeError {
    /// Protobuf decoding failed for the given message type.
    #[error("failed to decode {kind:?}: {source}")]
    Decode {
        /// Message identifier that failed to decode.
        kind: MessageKind,
        /// Underlying protobuf decode error.
        #[source]
        source: prost::DecodeError,
    },
}
