//! Async client library for the Mumble voice-and-text conferencing
//! protocol.
//!
//! A [`Session`] owns one TLS connection to a server, replicates the
//! server's channel tree and user roster into a [`World`] snapshot,
//! delivers state changes as [`Event`]s, and carries Opus voice both ways
//! through the control channel.
//!
//! ## Example
//!
//! ```no_run
//! use murmel::{Event, Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig::builder("mumble.example")
//!         .username("rust-bot")
//!         .accept_invalid_certs(true)
//!         .build();
//!
//!     let mut session = Session::new(config);
//!     let mut events = session.subscribe();
//!     session.connect().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let Event::Connect(info) = event {
//!             println!("synced as session {}", info.session);
//!             break;
//!         }
//!     }
//!
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod audio;
mod dispatch;
pub mod error;
pub mod events;
pub mod messages;
pub mod proto;
pub mod session;
pub mod target;
mod transport;
pub mod varint;
pub mod voice;
pub mod world;

pub use audio::{
    AudioConfig, AudioFrame, AudioInput, AudioStream, Decoder, DecoderFactory, Encoder,
    EncoderFactory,
};
#[cfg(feature = "audio")]
pub use audio::{OpusDecoder, OpusEncoder};
pub use error::Error;
pub use events::{
    ChannelChange, ConnectInfo, DisconnectReason, Event, PermissionDeniedEvent, RejectKind,
    TextMessageEvent, UserChange,
};
pub use messages::{ControlMessage, MessageEnvelope, MessageKind};
pub use session::{Request, Session, SessionConfig, SessionConfigBuilder, State, DEFAULT_PORT};
pub use target::{ChannelTarget, VoiceTarget};
pub use transport::{TlsIdentity, TlsSettings};
pub use voice::{VoiceCodec, VoicePacket};
pub use world::{Channel, ContextAction, TalkState, User, World};
