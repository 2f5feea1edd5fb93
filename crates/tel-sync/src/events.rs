//! Unified event stream for the calling UI
//!
//! Every observable change to a facade call or conference is emitted through
//! a single channel. Events are only emitted when something actually changed.

use tel_protocol::{
    Capabilities, ConnectionId, DisconnectCause, FacadeState, LineId, Presentation, VideoState,
};

use crate::account::AccountHandle;
use crate::state::{CallDirection, CallId, CallKind, ConferenceId};

/// Unified event enum for all facade activity
#[derive(Debug, Clone, PartialEq)]
pub enum FacadeEvent {
    // -------------------------------------------------------------------------
    // Call lifecycle events
    // -------------------------------------------------------------------------
    /// A facade call was registered
    CallAdded {
        call: CallId,
        kind: CallKind,
        line: Option<LineId>,
        direction: CallDirection,
    },

    /// A facade call changed state
    StateChanged {
        call: CallId,
        from: FacadeState,
        to: FacadeState,
    },

    /// A facade call ended; the cause is final
    Disconnected { call: CallId, cause: DisconnectCause },

    /// A facade call was torn down and unregistered
    Destroyed { call: CallId },

    // -------------------------------------------------------------------------
    // Call detail events
    // -------------------------------------------------------------------------
    /// Effective capabilities changed
    CapabilitiesChanged {
        call: CallId,
        capabilities: Capabilities,
    },

    AddressChanged {
        call: CallId,
        address: Option<String>,
        presentation: Presentation,
    },

    CallerNameChanged { call: CallId, name: Option<String> },

    VideoChanged {
        call: CallId,
        video_state: VideoState,
        provider: Option<String>,
    },

    // -------------------------------------------------------------------------
    // Conference events
    // -------------------------------------------------------------------------
    /// A call started hosting a conference
    ConferenceStarted {
        conference: ConferenceId,
        host: CallId,
    },

    /// Conference management became available or unavailable
    CanManageConferenceChanged {
        conference: ConferenceId,
        host: CallId,
        can_manage: bool,
    },

    /// The host left the conference-capable technology and is an ordinary
    /// call again
    ConferenceHostRetired {
        conference: ConferenceId,
        host: CallId,
    },

    // -------------------------------------------------------------------------
    // Line events
    // -------------------------------------------------------------------------
    /// A line has a ringing connection the UI may accept through the router
    IncomingCallAvailable {
        line: LineId,
        account: Option<AccountHandle>,
        connection: ConnectionId,
    },

    /// An error occurred in the engine
    Error {
        /// Source of the error
        source: String,
        /// Error message
        message: String,
    },
}

impl FacadeEvent {
    /// Check if this is a call lifecycle event
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            FacadeEvent::CallAdded { .. }
                | FacadeEvent::StateChanged { .. }
                | FacadeEvent::Disconnected { .. }
                | FacadeEvent::Destroyed { .. }
        )
    }

    /// Check if this is a conference event
    pub fn is_conference(&self) -> bool {
        matches!(
            self,
            FacadeEvent::ConferenceStarted { .. }
                | FacadeEvent::CanManageConferenceChanged { .. }
                | FacadeEvent::ConferenceHostRetired { .. }
        )
    }

    /// Get the call this event concerns, if any
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            FacadeEvent::CallAdded { call, .. }
            | FacadeEvent::StateChanged { call, .. }
            | FacadeEvent::Disconnected { call, .. }
            | FacadeEvent::Destroyed { call }
            | FacadeEvent::CapabilitiesChanged { call, .. }
            | FacadeEvent::AddressChanged { call, .. }
            | FacadeEvent::CallerNameChanged { call, .. }
            | FacadeEvent::VideoChanged { call, .. } => Some(*call),
            FacadeEvent::ConferenceStarted { host, .. }
            | FacadeEvent::CanManageConferenceChanged { host, .. }
            | FacadeEvent::ConferenceHostRetired { host, .. } => Some(*host),
            FacadeEvent::IncomingCallAvailable { .. } | FacadeEvent::Error { .. } => None,
        }
    }
}
