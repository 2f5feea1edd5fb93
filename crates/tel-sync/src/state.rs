//! Facade call identity and snapshot types

use std::fmt;

use serde::{Deserialize, Serialize};
use tel_protocol::{
    Capabilities, ConnectionId, DisconnectCause, EndpointKey, FacadeState, LineId,
    Presentation, VideoState,
};

use crate::account::AccountHandle;
use crate::capability::CallVariant;

/// Unique identifier for a facade call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl CallId {
    /// Get the raw id value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call{}", self.0)
    }
}

/// Unique identifier for a conference reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConferenceId(pub u64);

impl fmt::Display for ConferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conf{}", self.0)
    }
}

/// Role of a facade call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallKind {
    /// An ordinary call shown on its own
    TopLevel,
    /// Anchor of a network conference
    ConferenceHost(ConferenceId),
    /// One member of a network conference
    ConferenceParticipant(ConferenceId),
}

impl CallKind {
    /// Participants are shown under their conference; every other kind is a
    /// top-level call and takes part in foreground arbitration
    pub fn is_top_level(&self) -> bool {
        !matches!(self, CallKind::ConferenceParticipant(_))
    }

    /// Conference this call belongs to or hosts
    pub fn conference(&self) -> Option<ConferenceId> {
        match self {
            CallKind::TopLevel => None,
            CallKind::ConferenceHost(id) | CallKind::ConferenceParticipant(id) => Some(*id),
        }
    }
}

/// Direction of a facade call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallDirection {
    Outgoing,
    Incoming,
    /// Not known yet (conference participants)
    Unknown,
}

impl CallDirection {
    /// Direction of a radio connection
    pub fn of_connection(incoming: bool) -> Self {
        if incoming {
            CallDirection::Incoming
        } else {
            CallDirection::Outgoing
        }
    }
}

/// Everything the UI can observe about a facade call
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub id: CallId,
    pub line: Option<LineId>,
    pub account: Option<AccountHandle>,
    pub kind: CallKind,
    pub variant: CallVariant,
    pub direction: CallDirection,
    pub state: FacadeState,
    /// Capabilities computed from the call's own connection
    pub capabilities: Capabilities,
    /// Bits owned by a conference reconciler
    pub overlay: Capabilities,
    pub address: Option<String>,
    pub presentation: Presentation,
    pub caller_name: Option<String>,
    pub video_state: VideoState,
    pub video_provider: Option<String>,
    /// Wrapped radio connection, if any
    pub connection: Option<ConnectionId>,
    /// Endpoint key of a conference participant
    pub endpoint: Option<EndpointKey>,
    pub disconnect_cause: Option<DisconnectCause>,
}

impl CallSnapshot {
    /// A fresh INITIALIZING call
    pub fn new(id: CallId, kind: CallKind, variant: CallVariant, direction: CallDirection) -> Self {
        Self {
            id,
            line: None,
            account: None,
            kind,
            variant,
            direction,
            state: FacadeState::Initializing,
            capabilities: Capabilities::NONE,
            overlay: Capabilities::NONE,
            address: None,
            presentation: Presentation::Allowed,
            caller_name: None,
            video_state: VideoState::AudioOnly,
            video_provider: None,
            connection: None,
            endpoint: None,
            disconnect_cause: None,
        }
    }

    /// Capabilities shown to the UI
    pub fn effective_capabilities(&self) -> Capabilities {
        self.capabilities | self.overlay
    }

    /// Returns whether this is a top-level call that has not terminated
    pub fn is_live_top_level(&self) -> bool {
        self.kind.is_top_level() && !self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participants_are_not_top_level() {
        assert!(CallKind::TopLevel.is_top_level());
        assert!(CallKind::ConferenceHost(ConferenceId(1)).is_top_level());
        assert!(!CallKind::ConferenceParticipant(ConferenceId(1)).is_top_level());
        assert_eq!(
            CallKind::ConferenceParticipant(ConferenceId(4)).conference(),
            Some(ConferenceId(4))
        );
    }

    #[test]
    fn test_effective_capabilities_include_overlay() {
        let mut snap = CallSnapshot::new(
            CallId(1),
            CallKind::TopLevel,
            CallVariant::Standard,
            CallDirection::Outgoing,
        );
        snap.capabilities = Capabilities::MUTE;
        snap.overlay = Capabilities::MANAGE_CONFERENCE;
        assert!(snap
            .effective_capabilities()
            .contains(Capabilities::MUTE | Capabilities::MANAGE_CONFERENCE));
    }
}
