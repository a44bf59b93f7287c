//! Outbound voice routing targets.
//!
//! A target occupies one of the server's 30 addressable slots and lists
//! the users and channels audio sent to that slot should reach. Targets
//! must be registered with the server before an audio packet may name
//! their slot in its header.

use crate::error::Error;
use crate::proto::mumble;

/// First addressable voice-target slot.
pub const VOICE_TARGET_MIN: u8 = 1;
/// Last addressable voice-target slot.
pub const VOICE_TARGET_MAX: u8 = 30;

/// A channel selector inside a [`VoiceTarget`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    pub channel_id: u32,
    /// Restrict delivery to members of this access group.
    pub group: Option<String>,
    /// Follow channel links.
    pub links: bool,
    /// Include the channel's subtree.
    pub recursive: bool,
}

impl ChannelTarget {
    pub fn new(channel_id: u32) -> Self {
        Self {
            channel_id,
            group: None,
            links: false,
            recursive: false,
        }
    }
}

/// A registrable voice routing descriptor for slots 1 through 30.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceTarget {
    id: u8,
    users: Vec<u32>,
    channels: Vec<ChannelTarget>,
}

impl VoiceTarget {
    /// Create an empty target for the given slot.
    pub fn new(id: u8) -> Result<Self, Error> {
        if !(VOICE_TARGET_MIN..=VOICE_TARGET_MAX).contains(&id) {
            return Err(Error::InvalidConfig(format!(
                "voice target id {id} outside 1..=30"
            )));
        }
        Ok(Self {
            id,
            users: Vec::new(),
            channels: Vec::new(),
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Add a user to the target by session id.
    pub fn add_user(&mut self, session: u32) {
        if !self.users.contains(&session) {
            self.users.push(session);
        }
    }

    /// Add a channel selector to the target.
    pub fn add_channel(&mut self, target: ChannelTarget) {
        self.channels.push(target);
    }

    /// Remove all selectors; re-register to take effect server side.
    pub fn clear(&mut self) {
        self.users.clear();
        self.channels.clear();
    }

    /// Build the registration message for this target.
    pub fn to_message(&self) -> mumble::VoiceTarget {
        let mut targets = Vec::new();
        if !self.users.is_empty() {
            targets.push(mumble::voice_target::Target {
                session: self.users.clone(),
                ..Default::default()
            });
        }
        for channel in &self.channels {
            targets.push(mumble::voice_target::Target {
                channel_id: Some(channel.channel_id),
                group: channel.group.clone(),
                links: Some(channel.links),
                children: Some(channel.recursive),
                ..Default::default()
            });
        }
        mumble::VoiceTarget {
            id: Some(self.id as u32),
            targets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_range_is_enforced() {
        assert!(VoiceTarget::new(0).is_err());
        assert!(VoiceTarget::new(31).is_err());
        assert!(VoiceTarget::new(1).is_ok());
        assert!(VoiceTarget::new(30).is_ok());
    }

    #[test]
    fn registration_message_carries_selectors() {
        let mut target = VoiceTarget::new(3).unwrap();
        target.add_user(7);
        target.add_user(7);
        target.add_user(9);
        let mut channel = ChannelTarget::new(4);
        channel.recursive = true;
        target.add_channel(channel);

        let message = target.to_message();
        assert_eq!(message.id, Some(3));
        assert_eq!(message.targets.len(), 2);
        assert_eq!(message.targets[0].session, vec![7, 9]);
        assert_eq!(message.targets[1].channel_id, Some(4));
        assert_eq!(message.targets[1].children, Some(true));
    }
}
