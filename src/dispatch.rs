//! Applies inbound control messages to the world model and emits host
//! events.
//!
//! The dispatcher runs on the session's read fiber and is the world's only
//! writer. Handlers tolerate reordered deltas (users may reference
//! channels that have not arrived yet) and treat duplicate updates as
//! no-ops. Unknown message types are dropped for forward compatibility;
//! malformed voice payloads and server rejections are terminal.

use std::sync::Arc;

use crate::audio::IncomingAudio;
use crate::events::{
    ChannelChange, ConnectInfo, DisconnectReason, Event, PermissionDeniedEvent, RejectKind,
    TextMessageEvent,
};
use crate::messages::ControlMessage;
use crate::proto::mumble;
use crate::session::{Shared, State};
use crate::voice::{VoiceCodec, VoicePacket};
use crate::world::{CryptParams, TalkState, ROOT_CHANNEL_ID};

pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    incoming: IncomingAudio,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<Shared>, incoming: IncomingAudio) -> Self {
        Self { shared, incoming }
    }

    fn emit(&self, event: Event) {
        let _ = self.shared.events.send(event);
    }

    /// Close all per-speaker streams; called when the read fiber exits.
    pub(crate) fn shutdown(&mut self) {
        self.incoming.clear();
    }

    /// Apply one inbound message. A `Some` return carries the terminal
    /// reason and instructs the read fiber to close the session.
    pub(crate) async fn handle(&mut self, message: ControlMessage) -> Option<DisconnectReason> {
        if self.shared.is_closed() {
            return None;
        }
        match message {
            ControlMessage::Version(version) => {
                let mut world = self.shared.world.write().await;
                world.server.version = version.version;
                world.server.release = version.release;
                world.server.os = version.os;
                world.server.os_version = version.os_version;
                None
            }
            ControlMessage::UdpTunnel(bytes) => self.handle_voice(&bytes).await,
            // Client-to-server messages; nothing to do when echoed here.
            ControlMessage::Authenticate(_)
            | ControlMessage::VoiceTarget(_)
            | ControlMessage::RequestBlob(_) => None,
            ControlMessage::Ping(_) => {
                self.shared.world.write().await.ping.record_pong();
                None
            }
            ControlMessage::Reject(reject) => Some(DisconnectReason::Rejected {
                kind: RejectKind::from_wire(reject.r#type),
                reason: reject
                    .reason
                    .unwrap_or_else(|| "no reason given".to_string()),
            }),
            ControlMessage::ServerSync(sync) => {
                let info = {
                    let mut world = self.shared.world.write().await;
                    world.self_session = sync.session;
                    world.server.welcome_text = sync.welcome_text.clone();
                    world.server.max_bandwidth = sync.max_bandwidth;
                    world.server.permissions = sync.permissions;
                    ConnectInfo {
                        session: sync.session.unwrap_or_default(),
                        welcome_text: sync.welcome_text,
                        max_bandwidth: sync.max_bandwidth,
                    }
                };
                self.shared.set_state(State::Synced);
                self.emit(Event::Connect(info));
                None
            }
            ControlMessage::ChannelRemove(remove) => {
                let removed = {
                    let mut world = self.shared.world.write().await;
                    world.apply_channel_remove(remove.channel_id)
                };
                for channel_id in removed {
                    self.emit(Event::ChannelChange {
                        channel_id,
                        mask: ChannelChange::REMOVED,
                    });
                }
                None
            }
            ControlMessage::ChannelState(state) => {
                let channel_id = state.channel_id.unwrap_or(ROOT_CHANNEL_ID);
                let mask = {
                    let mut world = self.shared.world.write().await;
                    world.apply_channel_state(&state)
                };
                if !mask.is_empty() {
                    self.emit(Event::ChannelChange { channel_id, mask });
                }
                None
            }
            ControlMessage::UserRemove(remove) => self.handle_user_remove(remove).await,
            ControlMessage::UserState(state) => {
                let session = state.session.unwrap_or_default();
                let mask = {
                    let mut world = self.shared.world.write().await;
                    world.apply_user_state(&state)
                };
                if !mask.is_empty() {
                    self.emit(Event::UserChange { session, mask });
                }
                None
            }
            ControlMessage::BanList(list) => {
                self.emit(Event::BanList(list));
                None
            }
            ControlMessage::TextMessage(text) => {
                let (sender, sender_name) = {
                    let world = self.shared.world.read().await;
                    match text.actor.and_then(|actor| world.user(actor)) {
                        Some(user) => (Some(user.session), Some(user.name.clone())),
                        None => (None, None),
                    }
                };
                self.emit(Event::TextMessage(TextMessageEvent {
                    sender,
                    sender_name,
                    sessions: text.session,
                    channels: text.channel_id,
                    trees: text.tree_id,
                    message: text.message,
                }));
                None
            }
            ControlMessage::PermissionDenied(denied) => {
                use mumble::permission_denied::DenyType;
                let kind = denied
                    .r#type
                    .and_then(|value| DenyType::try_from(value).ok())
                    .unwrap_or(DenyType::Text);
                self.emit(Event::PermissionDenied(PermissionDeniedEvent {
                    kind,
                    permission: denied.permission,
                    channel_id: denied.channel_id,
                    session: denied.session,
                    reason: denied.reason,
                    name: denied.name,
                }));
                None
            }
            ControlMessage::Acl(acl) => {
                let channel_id = acl.channel_id;
                let stored = self.shared.world.write().await.apply_acl(&acl);
                if stored {
                    self.emit(Event::ChannelChange {
                        channel_id,
                        mask: ChannelChange::PERMISSIONS,
                    });
                }
                None
            }
            ControlMessage::QueryUsers(query) => {
                self.emit(Event::QueryUsers(query));
                None
            }
            ControlMessage::CryptSetup(setup) => {
                let mut world = self.shared.world.write().await;
                match (&setup.key, &setup.client_nonce, &setup.server_nonce) {
                    (Some(key), Some(client), Some(server)) => {
                        world.server.crypt = Some(CryptParams {
                            key: key.clone(),
                            client_nonce: client.clone(),
                            server_nonce: server.clone(),
                        });
                    }
                    _ => {
                        if let Some(server) = &setup.server_nonce {
                            if let Some(crypt) = world.server.crypt.as_mut() {
                                crypt.server_nonce = server.clone();
                            } else {
                                tracing::warn!("CryptSetup resync without existing parameters");
                            }
                        }
                    }
                }
                None
            }
            ControlMessage::ContextActionModify(modify) => {
                self.shared
                    .world
                    .write()
                    .await
                    .apply_context_action_modify(&modify);
                None
            }
            ControlMessage::ContextAction(action) => {
                self.emit(Event::ContextAction {
                    action: action.action,
                    session: action.session,
                    channel_id: action.channel_id,
                });
                None
            }
            ControlMessage::UserList(list) => {
                self.emit(Event::UserList(list));
                None
            }
            ControlMessage::PermissionQuery(query) => {
                let channel_id = query.channel_id;
                let known = {
                    let mut world = self.shared.world.write().await;
                    world.apply_permission_query(&query);
                    channel_id.is_some_and(|id| world.channel(id).is_some())
                };
                if let (Some(channel_id), true) = (channel_id, known) {
                    self.emit(Event::ChannelChange {
                        channel_id,
                        mask: ChannelChange::PERMISSIONS,
                    });
                }
                None
            }
            ControlMessage::CodecVersion(codec) => {
                self.shared.world.write().await.server.codec = Some(codec);
                None
            }
            ControlMessage::UserStats(stats) => {
                self.emit(Event::UserStats(stats));
                None
            }
            ControlMessage::ServerConfig(config) => {
                self.shared.world.write().await.server.config = Some(config);
                None
            }
            ControlMessage::SuggestConfig(suggested) => {
                self.shared.world.write().await.server.suggested = Some(suggested);
                None
            }
            ControlMessage::Unknown(envelope) => {
                tracing::debug!(kind = envelope.kind.id(), "ignoring unknown message type");
                None
            }
        }
    }

    async fn handle_voice(&mut self, bytes: &[u8]) -> Option<DisconnectReason> {
        let packet = match VoicePacket::decode_incoming(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                return Some(DisconnectReason::Error(format!(
                    "malformed voice packet: {err}"
                )))
            }
        };
        if packet.codec == VoiceCodec::Ping {
            return None;
        }
        let Some(session) = packet.session else {
            return None;
        };

        let transitions = {
            let mut world = self.shared.world.write().await;
            if world.user(session).is_none() {
                tracing::debug!(session, "dropping voice packet from unknown session");
                return None;
            }
            let mut transitions = Vec::new();
            let state = talk_state_for(packet.target);
            if world.set_talk_state(session, state) {
                transitions.push(state);
            }
            if packet.end_of_transmission && world.set_talk_state(session, TalkState::Passive) {
                transitions.push(TalkState::Passive);
            }
            transitions
        };

        self.incoming.route(&packet);
        for state in transitions {
            self.emit(Event::TalkStateChange { session, state });
        }
        None
    }

    async fn handle_user_remove(&mut self, remove: mumble::UserRemove) -> Option<DisconnectReason> {
        let is_self = self.shared.world.read().await.self_session == Some(remove.session);
        if is_self {
            return Some(if remove.ban.unwrap_or(false) {
                DisconnectReason::Banned {
                    actor: remove.actor,
                    reason: remove.reason,
                }
            } else {
                DisconnectReason::Kicked {
                    actor: remove.actor,
                    reason: remove.reason,
                }
            });
        }
        let outcome = {
            let mut world = self.shared.world.write().await;
            world.apply_user_remove(&remove)
        };
        if let Some((user, mask)) = outcome {
            self.incoming.remove(user.session);
            self.emit(Event::UserChange {
                session: user.session,
                mask,
            });
        }
        None
    }
}

fn talk_state_for(target: u8) -> TalkState {
    // For server-to-client audio the target field carries the context the
    // sender used.
    match target {
        1 => TalkState::Shouting,
        2 => TalkState::Whispering,
        _ => TalkState::Talking,
    }
}
