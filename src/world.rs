//! The client's replica of server-visible state: users, channels and
//! context actions.
//!
//! Entities reference each other by id only; parent/child and
//! user-to-channel navigation are lookups against the maps owned here.
//! Updates arrive as incremental messages and may be reordered, so a
//! user's channel reference is stored raw and resolved on read. All
//! mutation happens on the session's read fiber; readers work from
//! cloned snapshots.

use std::collections::HashMap;
use std::time::Instant;

use crate::events::{ChannelChange, UserChange};
use crate::proto::mumble;

/// The server root channel always has id 0 and no parent.
pub const ROOT_CHANNEL_ID: u32 = 0;

/// Voice activity of a user, derived from their audio packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TalkState {
    #[default]
    Passive,
    Talking,
    Whispering,
    Shouting,
}

/// A connected user, keyed by their ephemeral session id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct User {
    pub session: u32,
    pub name: String,
    /// Channel reference by id; resolve through [`World::user_channel`].
    pub channel_id: u32,
    /// Persistent id, present once the user is registered.
    pub user_id: Option<u32>,
    pub mute: bool,
    pub deaf: bool,
    pub suppress: bool,
    pub self_mute: bool,
    pub self_deaf: bool,
    pub priority_speaker: bool,
    pub recording: bool,
    pub comment: String,
    pub comment_hash: Vec<u8>,
    pub texture: Vec<u8>,
    pub texture_hash: Vec<u8>,
    /// Certificate hash reported by the server.
    pub hash: String,
    pub talk_state: TalkState,
}

impl User {
    fn new(session: u32) -> Self {
        Self {
            session,
            channel_id: ROOT_CHANNEL_ID,
            ..Default::default()
        }
    }

    /// True once the user has a persistent registration.
    pub fn is_registered(&self) -> bool {
        self.user_id.is_some()
    }
}

/// A channel in the server tree, keyed by its stable id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Channel {
    pub id: u32,
    /// Parent channel id; only the root has none.
    pub parent: Option<u32>,
    pub name: String,
    pub description: String,
    pub description_hash: Vec<u8>,
    /// Sort key for display ordering.
    pub position: i32,
    pub temporary: bool,
    pub links: Vec<u32>,
    /// ACL summary, populated when explicitly requested.
    pub acl: Option<mumble::Acl>,
    /// Cached permissions from the latest `PermissionQuery`.
    pub permissions: Option<u32>,
}

impl Channel {
    fn new(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_CHANNEL_ID
    }
}

/// A server-advertised context menu entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextAction {
    pub name: String,
    pub text: String,
    /// Bitmask of [`CONTEXT_SERVER`], [`CONTEXT_CHANNEL`], [`CONTEXT_USER`].
    pub context: u32,
}

/// Context action applies to the server entry.
pub const CONTEXT_SERVER: u32 = 0x01;
/// Context action applies to channels.
pub const CONTEXT_CHANNEL: u32 = 0x02;
/// Context action applies to users.
pub const CONTEXT_USER: u32 = 0x04;

/// Cryptographic parameters delivered through `CryptSetup`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CryptParams {
    pub key: Vec<u8>,
    pub client_nonce: Vec<u8>,
    pub server_nonce: Vec<u8>,
}

/// Static facts about the connected server.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerInfo {
    /// Packed semantic version (2-byte major, 1-byte minor, 1-byte patch).
    pub version: Option<u32>,
    pub release: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub welcome_text: Option<String>,
    pub max_bandwidth: Option<u32>,
    /// Permissions granted to this session in the root channel.
    pub permissions: Option<u64>,
    pub codec: Option<mumble::CodecVersion>,
    pub config: Option<mumble::ServerConfig>,
    pub suggested: Option<mumble::SuggestConfig>,
    pub crypt: Option<CryptParams>,
}

impl ServerInfo {
    /// Unpack the version field into (major, minor, patch).
    pub fn semantic_version(&self) -> Option<(u16, u8, u8)> {
        self.version
            .map(|v| ((v >> 16) as u16, (v >> 8) as u8, v as u8))
    }
}

/// Keep-alive counters and latency estimate.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PingStats {
    pub sent: u64,
    pub received: u64,
    /// Running average round trip in milliseconds.
    pub average_ms: f64,
    pub last_rtt_ms: Option<f64>,
    last_sent: Option<Instant>,
}

impl PingStats {
    pub(crate) fn record_sent(&mut self) {
        self.sent += 1;
        self.last_sent = Some(Instant::now());
    }

    pub(crate) fn record_pong(&mut self) {
        self.received += 1;
        if let Some(at) = self.last_sent {
            let rtt = at.elapsed().as_secs_f64() * 1000.0;
            self.last_rtt_ms = Some(rtt);
            let count = self.received as f64;
            self.average_ms = ((self.average_ms * (count - 1.0)) + rtt) / count;
        }
    }
}

/// The replicated world: all users, channels and context actions known to
/// this session, plus server facts and keep-alive statistics.
#[derive(Debug, Clone, Default)]
pub struct World {
    users: HashMap<u32, User>,
    channels: HashMap<u32, Channel>,
    context_actions: HashMap<String, ContextAction>,
    /// Session id of the local user, set once during sync.
    pub self_session: Option<u32>,
    pub server: ServerInfo,
    pub ping: PingStats,
}

impl World {
    /// Fresh world holding only the root channel.
    pub fn new() -> Self {
        let mut world = Self::default();
        world
            .channels
            .insert(ROOT_CHANNEL_ID, Channel::new(ROOT_CHANNEL_ID));
        world
    }

    /// Drop all contents; used during session teardown.
    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn channel(&self, id: u32) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn user(&self, session: u32) -> Option<&User> {
        self.users.get(&session)
    }

    pub fn context_action(&self, name: &str) -> Option<&ContextAction> {
        self.context_actions.get(name)
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn context_actions(&self) -> impl Iterator<Item = &ContextAction> {
        self.context_actions.values()
    }

    /// The local user, available once the session is synced.
    pub fn self_user(&self) -> Option<&User> {
        self.users.get(&self.self_session?)
    }

    pub fn root(&self) -> Option<&Channel> {
        self.channels.get(&ROOT_CHANNEL_ID)
    }

    /// Resolve a user's channel reference. Returns `None` when the channel
    /// has been removed out from under the user.
    pub fn user_channel(&self, session: u32) -> Option<&Channel> {
        self.channels.get(&self.users.get(&session)?.channel_id)
    }

    pub fn users_in_channel(&self, channel_id: u32) -> Vec<&User> {
        let mut users: Vec<&User> = self
            .users
            .values()
            .filter(|user| user.channel_id == channel_id)
            .collect();
        users.sort_by_key(|user| user.session);
        users
    }

    /// Direct children of a channel, ordered by position, then name.
    pub fn children_of(&self, channel_id: u32) -> Vec<&Channel> {
        let mut children: Vec<&Channel> = self
            .channels
            .values()
            .filter(|channel| channel.parent == Some(channel_id))
            .collect();
        children.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        });
        children
    }

    /// Walk a name path starting at the root. An empty path returns the
    /// root itself.
    pub fn find_channel(&self, path: &[&str]) -> Option<&Channel> {
        self.find_channel_from(ROOT_CHANNEL_ID, path)
    }

    /// Walk a name path starting at an arbitrary channel; descent stops at
    /// the first missing hop.
    pub fn find_channel_from(&self, start: u32, path: &[&str]) -> Option<&Channel> {
        let mut current = self.channels.get(&start)?;
        for name in path {
            current = self
                .children_of(current.id)
                .into_iter()
                .find(|child| child.name == *name)?;
        }
        Some(current)
    }

    pub(crate) fn apply_channel_state(&mut self, message: &mumble::ChannelState) -> ChannelChange {
        let id = message.channel_id.unwrap_or(ROOT_CHANNEL_ID);
        let mut mask = ChannelChange::empty();

        if !self.channels.contains_key(&id) {
            self.channels.insert(id, Channel::new(id));
            mask |= ChannelChange::CREATED;
        }

        if let Some(parent) = message.parent {
            let current = self.channels[&id].parent;
            if id != ROOT_CHANNEL_ID && current != Some(parent) {
                if self.would_cycle(id, parent) {
                    tracing::warn!(channel = id, parent, "ignoring channel re-parent: cycle");
                } else {
                    self.channels.get_mut(&id).unwrap().parent = Some(parent);
                    if !mask.contains(ChannelChange::CREATED) {
                        mask |= ChannelChange::MOVED;
                    }
                }
            }
        }

        let channel = self.channels.get_mut(&id).unwrap();
        if let Some(name) = &message.name {
            if channel.name != *name {
                channel.name = name.clone();
                mask |= ChannelChange::NAME;
            }
        }
        if let Some(description) = &message.description {
            if channel.description != *description {
                channel.description = description.clone();
                mask |= ChannelChange::DESCRIPTION;
            }
        }
        if let Some(hash) = &message.description_hash {
            if channel.description_hash != *hash {
                channel.description_hash = hash.clone();
                mask |= ChannelChange::DESCRIPTION_HASH;
            }
        }
        if let Some(position) = message.position {
            if channel.position != position {
                channel.position = position;
                mask |= ChannelChange::POSITION;
            }
        }
        if let Some(temporary) = message.temporary {
            if channel.temporary != temporary {
                channel.temporary = temporary;
                mask |= ChannelChange::TEMPORARY;
            }
        }
        if !message.links.is_empty() {
            channel.links = message.links.clone();
            mask |= ChannelChange::LINKS;
        }
        if !message.links_add.is_empty() || !message.links_remove.is_empty() {
            for link in &message.links_add {
                if !channel.links.contains(link) {
                    channel.links.push(*link);
                }
            }
            channel
                .links
                .retain(|link| !message.links_remove.contains(link));
            mask |= ChannelChange::LINKS;
        }
        mask
    }

    /// Remove a channel and its descendants. Returns the removed ids in
    /// child-before-parent order; empty when the id is unknown.
    pub(crate) fn apply_channel_remove(&mut self, id: u32) -> Vec<u32> {
        if !self.channels.contains_key(&id) {
            return Vec::new();
        }
        let mut order = Vec::new();
        self.collect_subtree(id, &mut order);
        for removed in &order {
            self.channels.remove(removed);
        }
        order
    }

    fn collect_subtree(&self, id: u32, out: &mut Vec<u32>) {
        let children: Vec<u32> = self.children_of(id).iter().map(|c| c.id).collect();
        for child in children {
            self.collect_subtree(child, out);
        }
        out.push(id);
    }

    fn would_cycle(&self, id: u32, new_parent: u32) -> bool {
        let mut cursor = Some(new_parent);
        let mut hops = 0;
        while let Some(current) = cursor {
            if current == id {
                return true;
            }
            hops += 1;
            if hops > self.channels.len() {
                return true;
            }
            cursor = self.channels.get(&current).and_then(|c| c.parent);
        }
        false
    }

    pub(crate) fn apply_user_state(&mut self, message: &mumble::UserState) -> UserChange {
        let Some(session) = message.session else {
            return UserChange::empty();
        };
        let mut mask = UserChange::empty();

        let user = self.users.entry(session).or_insert_with(|| {
            mask |= UserChange::CONNECTED;
            User::new(session)
        });

        if let Some(name) = &message.name {
            if user.name != *name {
                user.name = name.clone();
                mask |= UserChange::NAME;
            }
        }
        if let Some(channel_id) = message.channel_id {
            if user.channel_id != channel_id {
                user.channel_id = channel_id;
                mask |= UserChange::CHANNEL;
            }
        }
        if let Some(user_id) = message.user_id {
            if user.user_id != Some(user_id) {
                user.user_id = Some(user_id);
                mask |= UserChange::REGISTERED;
            }
        }

        let mut audio_changed = false;
        let mut apply_flag = |current: &mut bool, incoming: Option<bool>| {
            if let Some(value) = incoming {
                if *current != value {
                    *current = value;
                    audio_changed = true;
                }
            }
        };
        apply_flag(&mut user.mute, message.mute);
        apply_flag(&mut user.deaf, message.deaf);
        apply_flag(&mut user.suppress, message.suppress);
        apply_flag(&mut user.self_mute, message.self_mute);
        apply_flag(&mut user.self_deaf, message.self_deaf);
        if audio_changed {
            mask |= UserChange::AUDIO;
        }

        if let Some(priority) = message.priority_speaker {
            if user.priority_speaker != priority {
                user.priority_speaker = priority;
                mask |= UserChange::PRIORITY_SPEAKER;
            }
        }
        if let Some(recording) = message.recording {
            if user.recording != recording {
                user.recording = recording;
                mask |= UserChange::RECORDING;
            }
        }
        if let Some(comment) = &message.comment {
            if user.comment != *comment {
                user.comment = comment.clone();
                mask |= UserChange::COMMENT;
            }
        }
        if let Some(hash) = &message.comment_hash {
            if user.comment_hash != *hash {
                user.comment_hash = hash.clone();
                mask |= UserChange::COMMENT;
            }
        }
        if let Some(texture) = &message.texture {
            if user.texture != *texture {
                user.texture = texture.clone();
                mask |= UserChange::TEXTURE;
            }
        }
        if let Some(hash) = &message.texture_hash {
            if user.texture_hash != *hash {
                user.texture_hash = hash.clone();
                mask |= UserChange::TEXTURE;
            }
        }
        if let Some(hash) = &message.hash {
            user.hash = hash.clone();
        }
        mask
    }

    /// Remove a user. Returns the removed user together with the change
    /// mask describing how they left.
    pub(crate) fn apply_user_remove(&mut self, message: &mumble::UserRemove) -> Option<(User, UserChange)> {
        let user = self.users.remove(&message.session)?;
        let mut mask = UserChange::DISCONNECTED;
        if message.ban.unwrap_or(false) {
            mask |= UserChange::BANNED;
        } else if message.actor.is_some() {
            mask |= UserChange::KICKED;
        }
        Some((user, mask))
    }

    pub(crate) fn apply_context_action_modify(&mut self, message: &mumble::ContextActionModify) {
        use mumble::context_action_modify::Operation;
        let operation = message
            .operation
            .and_then(|value| Operation::try_from(value).ok())
            .unwrap_or(Operation::Add);
        match operation {
            Operation::Add => {
                self.context_actions.insert(
                    message.action.clone(),
                    ContextAction {
                        name: message.action.clone(),
                        text: message.text.clone().unwrap_or_default(),
                        context: message.context.unwrap_or(0),
                    },
                );
            }
            Operation::Remove => {
                self.context_actions.remove(&message.action);
            }
        }
    }

    pub(crate) fn apply_permission_query(&mut self, message: &mumble::PermissionQuery) {
        if message.flush.unwrap_or(false) {
            for channel in self.channels.values_mut() {
                channel.permissions = None;
            }
        }
        if let Some(channel_id) = message.channel_id {
            if let Some(channel) = self.channels.get_mut(&channel_id) {
                channel.permissions = message.permissions;
            }
        }
    }

    pub(crate) fn apply_acl(&mut self, message: &mumble::Acl) -> bool {
        if let Some(channel) = self.channels.get_mut(&message.channel_id) {
            channel.acl = Some(message.clone());
            true
        } else {
            false
        }
    }

    /// Update a user's talk state; returns true when it changed.
    pub(crate) fn set_talk_state(&mut self, session: u32, state: TalkState) -> bool {
        match self.users.get_mut(&session) {
            Some(user) if user.talk_state != state => {
                user.talk_state = state;
                true
            }
            _ => false,
        }
    }
}
