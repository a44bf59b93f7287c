//! Events delivered to the host through the session's broadcast channel.
//!
//! Events are emitted by the dispatcher in arrival order; subscribers that
//! fall behind lose the oldest entries instead of stalling the protocol.

use crate::proto::mumble;
use crate::world::TalkState;

macro_rules! change_mask {
    ($(#[$doc:meta])* $name:ident { $($(#[$bit_doc:meta])* $bit:ident = $value:expr,)+ }) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(u32);

        impl $name {
            $($(#[$bit_doc])* pub const $bit: $name = $name($value);)+

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub const fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let mut set = f.debug_tuple(stringify!($name));
                $(if self.contains($name::$bit) {
                    set.field(&stringify!($bit));
                })+
                set.finish()
            }
        }
    };
}

pub(crate) use change_mask;

change_mask! {
    /// Which user attributes an update touched.
    UserChange {
        CONNECTED = 1 << 0,
        DISCONNECTED = 1 << 1,
        KICKED = 1 << 2,
        BANNED = 1 << 3,
        NAME = 1 << 4,
        CHANNEL = 1 << 5,
        COMMENT = 1 << 6,
        /// Any of the mute/deaf/suppress flags.
        AUDIO = 1 << 7,
        TEXTURE = 1 << 8,
        PRIORITY_SPEAKER = 1 << 9,
        RECORDING = 1 << 10,
        REGISTERED = 1 << 11,
    }
}

change_mask! {
    /// Which channel attributes an update touched.
    ChannelChange {
        CREATED = 1 << 0,
        REMOVED = 1 << 1,
        /// Parent changed.
        MOVED = 1 << 2,
        NAME = 1 << 3,
        DESCRIPTION = 1 << 4,
        DESCRIPTION_HASH = 1 << 5,
        POSITION = 1 << 6,
        TEMPORARY = 1 << 7,
        LINKS = 1 << 8,
        /// ACL summary or cached permissions updated.
        PERMISSIONS = 1 << 9,
    }
}

/// Why a connection attempt was refused by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    None,
    WrongVersion,
    InvalidUsername,
    WrongUserPassword,
    WrongServerPassword,
    UsernameInUse,
    ServerFull,
    NoCertificate,
    AuthenticatorFail,
}

impl RejectKind {
    pub(crate) fn from_wire(value: Option<i32>) -> Self {
        use mumble::reject::RejectType;
        match value.and_then(|v| RejectType::try_from(v).ok()) {
            Some(RejectType::WrongVersion) => RejectKind::WrongVersion,
            Some(RejectType::InvalidUsername) => RejectKind::InvalidUsername,
            Some(RejectType::WrongUserPw) => RejectKind::WrongUserPassword,
            Some(RejectType::WrongServerPw) => RejectKind::WrongServerPassword,
            Some(RejectType::UsernameInUse) => RejectKind::UsernameInUse,
            Some(RejectType::ServerFull) => RejectKind::ServerFull,
            Some(RejectType::NoCertificate) => RejectKind::NoCertificate,
            Some(RejectType::AuthenticatorFail) => RejectKind::AuthenticatorFail,
            _ => RejectKind::None,
        }
    }
}

/// The single terminal reason attached to a session's `Disconnect` event.
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    /// The host called `disconnect`.
    User,
    /// The server removed this session by kick.
    Kicked {
        actor: Option<u32>,
        reason: Option<String>,
    },
    /// The server removed this session by ban.
    Banned {
        actor: Option<u32>,
        reason: Option<String>,
    },
    /// The server refused the connection attempt.
    Rejected { kind: RejectKind, reason: String },
    /// Transport fault, protocol violation or read-deadline miss.
    Error(String),
}

/// Details delivered with [`Event::Connect`] once sync completes.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectInfo {
    /// Session id assigned to the local user.
    pub session: u32,
    pub welcome_text: Option<String>,
    pub max_bandwidth: Option<u32>,
}

/// A text message with sender and receivers resolved at dispatch time.
#[derive(Debug, Clone, PartialEq)]
pub struct TextMessageEvent {
    /// Sender session, when the sender is known to the world model.
    pub sender: Option<u32>,
    pub sender_name: Option<String>,
    /// Receiving user sessions.
    pub sessions: Vec<u32>,
    /// Receiving channels.
    pub channels: Vec<u32>,
    /// Receiving channel subtrees.
    pub trees: Vec<u32>,
    pub message: String,
}

/// A `PermissionDenied` response from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionDeniedEvent {
    pub kind: mumble::permission_denied::DenyType,
    pub permission: Option<u32>,
    pub channel_id: Option<u32>,
    pub session: Option<u32>,
    pub reason: Option<String>,
    pub name: Option<String>,
}

/// Events emitted by the session while it is connected.
#[derive(Debug, Clone)]
pub enum Event {
    /// Server sync completed; the world model is populated and the
    /// session is live.
    Connect(ConnectInfo),
    /// The session ended; no further events follow.
    Disconnect(DisconnectReason),
    TextMessage(TextMessageEvent),
    UserChange { session: u32, mask: UserChange },
    ChannelChange { channel_id: u32, mask: ChannelChange },
    PermissionDenied(PermissionDeniedEvent),
    /// A context action was triggered or advertised for this client.
    ContextAction {
        action: String,
        session: Option<u32>,
        channel_id: Option<u32>,
    },
    TalkStateChange { session: u32, state: TalkState },
    BanList(mumble::BanList),
    UserList(mumble::UserList),
    QueryUsers(mumble::QueryUsers),
    UserStats(mumble::UserStats),
}
