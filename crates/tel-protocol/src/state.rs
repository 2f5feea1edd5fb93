//! Radio-side and facade-side state enums

/// State of a call group as reported by the radio layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RadioCallState {
    /// No call in this group
    Idle,
    /// Connected and in the foreground
    Active,
    /// Connected and held
    Holding,
    /// Outgoing, dial in progress
    Dialing,
    /// Outgoing, far end is alerting
    Alerting,
    /// Incoming, no other call present
    Incoming,
    /// Incoming while another call is present
    Waiting,
    /// Terminated
    Disconnected,
    /// Termination in progress
    Disconnecting,
}

impl RadioCallState {
    /// Returns whether this is an incoming ringing state
    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Incoming | Self::Waiting)
    }

    /// Returns whether this is an outgoing dialing state
    pub fn is_dialing(&self) -> bool {
        matches!(self, Self::Dialing | Self::Alerting)
    }

    /// Returns whether a call in this state still has a live network leg
    pub fn is_alive(&self) -> bool {
        !matches!(
            self,
            Self::Idle | Self::Disconnected | Self::Disconnecting
        )
    }
}

/// State of a call as exposed to the calling UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FacadeState {
    /// Created, no radio connection bound yet
    Initializing,
    /// Bound to a radio connection, no radio state applied yet
    New,
    /// Outgoing call in progress
    Dialing,
    /// Incoming call alerting
    Ringing,
    /// The foreground call
    Active,
    /// Held
    Holding,
    /// Terminated with a cause
    Disconnected,
    /// Torn down; accepts no further transitions
    Destroyed,
}

impl FacadeState {
    /// Returns whether the call has terminated
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Destroyed)
    }

    /// Returns whether the call has not yet been confirmed by the network
    pub fn is_unconfirmed(&self) -> bool {
        matches!(self, Self::Initializing | Self::New | Self::Dialing)
    }

    /// Get a short display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::New => "NEW",
            Self::Dialing => "DIALING",
            Self::Ringing => "RINGING",
            Self::Active => "ACTIVE",
            Self::Holding => "HOLDING",
            Self::Disconnected => "DISCONNECTED",
            Self::Destroyed => "DESTROYED",
        }
    }
}

/// State of one conference participant as reported by the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ParticipantState {
    Active,
    Holding,
    Disconnected,
}

impl ParticipantState {
    /// Map onto the facade state shown for the participant
    pub fn facade_state(&self) -> FacadeState {
        match self {
            Self::Active => FacadeState::Active,
            Self::Holding => FacadeState::Holding,
            Self::Disconnected => FacadeState::Disconnected,
        }
    }
}

/// Network registration state of a line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ServiceState {
    InService,
    OutOfService,
    /// Camped on a network for emergency calls only
    EmergencyOnly,
    PowerOff,
    Unknown,
}

impl ServiceState {
    /// Returns whether an emergency call can be placed right away
    pub fn can_place_emergency(&self) -> bool {
        matches!(self, Self::InService | Self::EmergencyOnly)
    }
}

/// Line family, which selects the call variant built for the line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LineFamily {
    /// Packet/standard circuit lines with full hold and conference support
    #[default]
    Standard,
    /// Legacy circuit lines (no hold, voice privacy mode)
    LegacyCircuit,
}

/// Radio technology currently backing a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RadioTech {
    /// IMS packet voice; the only conference-capable technology
    #[default]
    Ims,
    /// Circuit-switched voice
    Circuit,
}

/// Number presentation for an address or caller name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Presentation {
    #[default]
    Allowed,
    Restricted,
    Unknown,
    Payphone,
}

/// Video capability of one side of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VideoCapability {
    pub receive: bool,
    pub transmit: bool,
}

impl VideoCapability {
    /// No video in either direction
    pub const NONE: Self = Self {
        receive: false,
        transmit: false,
    };

    /// Video in both directions
    pub const BIDIRECTIONAL: Self = Self {
        receive: true,
        transmit: true,
    };
}

/// Current video state of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VideoState {
    #[default]
    AudioOnly,
    TransmitOnly,
    ReceiveOnly,
    Bidirectional,
    Paused,
}

/// Audio codec quality reported for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AudioQuality {
    #[default]
    Standard,
    HighDefinition,
}
