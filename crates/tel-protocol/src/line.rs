//! Radio line interface
//!
//! A [`RadioLine`] is one subscription's path to the network. The engine
//! issues commands through this trait; results that take network time come
//! back later as [`LineEvent`]s or connection events.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::RadioError;
use crate::radio::{RadioConnection, Subscription};
use crate::state::{LineFamily, RadioCallState, RadioTech, ServiceState, VideoState};
use crate::{ConnectionId, LineId, RequestTag};

/// The three call groups a line keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallGroup {
    Foreground,
    Background,
    Ringing,
}

impl CallGroup {
    /// All groups, in the order they are scanned for unbound connections
    pub const ALL: [CallGroup; 3] = [CallGroup::Ringing, CallGroup::Foreground, CallGroup::Background];
}

/// Snapshot of one call group
#[derive(Debug, Clone)]
pub struct RadioCall {
    pub group: CallGroup,
    pub state: RadioCallState,
    /// Connections in creation order
    pub connections: Vec<Arc<RadioConnection>>,
}

impl RadioCall {
    /// An empty group
    pub fn idle(group: CallGroup) -> Self {
        Self {
            group,
            state: RadioCallState::Idle,
            connections: Vec::new(),
        }
    }

    pub fn earliest_connection(&self) -> Option<&Arc<RadioConnection>> {
        self.connections.first()
    }

    pub fn latest_connection(&self) -> Option<&Arc<RadioConnection>> {
        self.connections.last()
    }
}

/// Registration and SIM status of a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineStatus {
    pub id: LineId,
    /// Slot index; lower indexes win ties during emergency selection
    pub index: u32,
    pub service: ServiceState,
    pub sim_ready: bool,
    pub subscription_active: bool,
}

/// Extra parameters for a dial request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DialExtras {
    pub is_emergency: bool,
    /// Call subject shown to the far end, when the network supports it
    pub subject: Option<String>,
}

/// Asynchronous notifications from a line
#[derive(Debug, Clone)]
pub enum LineEvent {
    /// A new incoming call is alerting
    NewRingingConnection(Arc<RadioConnection>),
    /// A second incoming call is waiting behind an existing call
    CallWaiting(Arc<RadioConnection>),
    /// A connection appeared that nobody requested
    UnknownConnection(Arc<RadioConnection>),
    /// Supplementary-service notification (forwarded, held, etc.)
    SuppServiceNotification { code: i32, number: Option<String> },
    /// Any call-group state changed
    PreciseCallStateChanged,
    /// A connection moved to another radio technology
    HandoverStateChanged {
        connection: ConnectionId,
        technology: RadioTech,
    },
    /// Network ringback tone started or stopped
    RingbackTone { playing: bool },
    /// Line-level video calling availability changed
    VideoCapabilityChanged { capable: bool },
}

/// Commands and queries the engine issues to a radio line
pub trait RadioLine: Send + Sync + fmt::Debug {
    fn id(&self) -> LineId;

    fn status(&self) -> LineStatus;

    fn family(&self) -> LineFamily;

    /// Number the `voicemail:` alias resolves to
    fn voicemail_number(&self) -> Option<String>;

    /// Snapshot of one call group
    fn call(&self, group: CallGroup) -> RadioCall;

    /// Place a call; `Ok(None)` means the radio accepted the request but
    /// produced no connection
    fn dial(
        &self,
        number: &str,
        video_state: VideoState,
        extras: &DialExtras,
    ) -> Result<Option<Arc<RadioConnection>>, RadioError>;

    fn hangup(&self, connection: ConnectionId) -> Result<(), RadioError>;

    /// Swap foreground and background groups. Holding and unholding are the
    /// same command.
    fn switch_holding_and_active(&self) -> Result<(), RadioError>;

    /// Merge foreground and background into a conference
    fn conference(&self) -> Result<(), RadioError>;

    /// Ask the network to add `address` to the conference hosted on `host`;
    /// the outcome arrives as an `AddParticipantResponse` carrying `tag`
    fn add_participant(
        &self,
        host: ConnectionId,
        address: &str,
        tag: RequestTag,
    ) -> Result<(), RadioError>;

    /// Answer the ringing call
    fn accept(&self, video_state: VideoState) -> Result<(), RadioError>;

    /// Redirect the ringing call to another number
    fn deflect(&self, number: &str) -> Result<(), RadioError>;

    /// Mute the line locally while another line holds the foreground call
    fn set_local_call_hold(&self, hold: bool);

    /// Start the out-of-band radio power-on sequence; resolves to whether the
    /// radio came up
    fn request_power_on(&self) -> oneshot::Receiver<bool>;

    fn subscribe(&self, tx: mpsc::UnboundedSender<LineEvent>) -> Subscription;
}
