//! Error types for the synchronization engine

use tel_protocol::{ConnectionId, EndpointKey, LineId, RadioError};
use thiserror::Error;

use crate::account::AccountHandle;
use crate::state::{CallId, ConferenceId};

/// Errors that can occur in the synchronization engine
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The call's actor has stopped
    #[error("call {0} is closed")]
    CallClosed(CallId),

    /// No call with this id is registered
    #[error("call not found: {0}")]
    CallNotFound(CallId),

    /// The call does not wrap a radio connection
    #[error("call {0} has no radio connection")]
    NotBound(CallId),

    /// The radio connection already backs another call
    #[error("{connection} already backs {owner}")]
    AlreadyBound {
        connection: ConnectionId,
        owner: CallId,
    },

    /// Line not attached to the router
    #[error("line not found: {0}")]
    LineNotFound(LineId),

    /// No attached line serves the account
    #[error("no line for account {0}")]
    AccountNotFound(AccountHandle),

    /// No line is attached at all
    #[error("no line attached")]
    NoLines,

    /// The conference reconciler has stopped
    #[error("conference {0} is closed")]
    ConferenceClosed(ConferenceId),

    /// The call already anchors a conference
    #[error("call already hosts {0}")]
    AlreadyHosting(ConferenceId),

    /// Participant already belongs to another conference
    #[error("participant {key} already belongs to {owner}")]
    ParticipantClaimed {
        key: EndpointKey,
        owner: ConferenceId,
    },

    /// Too many add-participant requests are waiting
    #[error("add-participant queue is full ({0} pending)")]
    QueueFull(usize),

    /// A radio command failed
    #[error("radio error: {0}")]
    Radio(#[from] RadioError),
}
