//! Facade call capability bitmask

use std::fmt;

bitflags::bitflags! {
    /// Capabilities advertised for a facade call
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Capabilities: u32 {
        /// Call can be held right now
        const HOLD = 1 << 0;
        /// Call supports hold in general
        const SUPPORT_HOLD = 1 << 1;
        const MERGE_CONFERENCE = 1 << 2;
        const SWAP_CONFERENCE = 1 << 3;
        const RESPOND_VIA_TEXT = 1 << 4;
        const MUTE = 1 << 5;
        const MANAGE_CONFERENCE = 1 << 6;
        const VIDEO_LOCAL_RX = 1 << 7;
        const VIDEO_LOCAL_TX = 1 << 8;
        const VIDEO_REMOTE_RX = 1 << 9;
        const VIDEO_REMOTE_TX = 1 << 10;
        const SEPARATE_FROM_CONFERENCE = 1 << 11;
        const DISCONNECT_FROM_CONFERENCE = 1 << 12;
        const HIGH_DEF_AUDIO = 1 << 13;
        const VOICE_PRIVACY = 1 << 14;
    }
}

impl Capabilities {
    pub const NONE: Self = Self::empty();

    /// Copy with the bits of `flag` set or cleared
    #[must_use]
    pub fn with(mut self, flag: Self, enabled: bool) -> Self {
        self.set(flag, enabled);
        self
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        write!(f, "[{}]", names.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_clear() {
        let mut caps = Capabilities::MUTE | Capabilities::HOLD;
        assert!(caps.contains(Capabilities::HOLD));

        caps.set(Capabilities::HOLD, false);
        assert!(!caps.contains(Capabilities::HOLD));
        assert!(caps.contains(Capabilities::MUTE));

        let caps = caps.with(Capabilities::VOICE_PRIVACY, true);
        assert!(caps.contains(Capabilities::VOICE_PRIVACY));
        assert!(Capabilities::NONE.is_empty());
    }

    #[test]
    fn test_display_lists_names() {
        let caps = Capabilities::MUTE | Capabilities::MANAGE_CONFERENCE;
        assert_eq!(caps.to_string(), "[MUTE|MANAGE_CONFERENCE]");
        assert_eq!(Capabilities::NONE.to_string(), "[]");
    }

    #[test]
    fn test_unknown_bits_are_dropped() {
        assert_eq!(Capabilities::from_bits(1 << 31), None);
        let caps = Capabilities::from_bits_truncate((1 << 31) | (1 << 5));
        assert_eq!(caps, Capabilities::MUTE);
        assert_eq!(caps.bits(), 1 << 5);
    }
}
