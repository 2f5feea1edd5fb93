//! Radio line protocol types
//!
//! This crate provides the types shared between the radio layer, the call
//! synchronization engine, and the calling UI:
//!
//! - **State enums**: radio call-group states and facade call states
//! - **Disconnect causes**: standardized cause codes with diagnostic strings
//! - **Capabilities**: the facade capability bitmask
//! - **Addresses**: `tel:`/`voicemail:` destination parsing and number matching
//! - **Radio objects**: the shared [`RadioConnection`] and the [`RadioLine`] trait
//!
//! # Architecture
//!
//! The radio layer owns every [`RadioConnection`] and mutates it; everything
//! above only reads snapshots and subscribes to change events. A subscription
//! is an explicit [`Subscription`] guard around a registered channel sender,
//! and dropping the guard unsubscribes.
//!
//! # Example
//!
//! ```rust
//! use tel_protocol::address::{parse_destination, Destination};
//!
//! let dest = parse_destination(Some("tel:+1 (555) 123-4")).unwrap();
//! assert_eq!(dest, Destination::Number("+15551234".to_string()));
//! ```

pub mod address;
pub mod capability;
pub mod cause;
pub mod error;
pub mod line;
pub mod radio;
pub mod state;

use std::fmt;

pub use address::Destination;
pub use capability::Capabilities;
pub use cause::{DisconnectCause, DisconnectCode};
pub use error::{ParseError, RadioError};
pub use line::{CallGroup, DialExtras, LineEvent, LineStatus, RadioCall, RadioLine};
pub use radio::{
    ConnectionEvent, ConnectionEventKind, ConnectionSnapshot, ParticipantInfo, RadioConnection,
    SubscriberList, Subscription,
};
pub use state::{
    AudioQuality, FacadeState, LineFamily, ParticipantState, Presentation, RadioCallState,
    RadioTech, ServiceState, VideoCapability, VideoState,
};

/// Identifies one radio line (one subscription)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LineId(pub u32);

impl LineId {
    /// Get the raw line id
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line{}", self.0)
    }
}

/// Identifies one radio connection (network leg)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn{}", self.0)
    }
}

/// Correlates an asynchronous radio response with the request that caused it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RequestTag(pub u64);

/// Address-like identifier naming one conference participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EndpointKey(pub String);

impl EndpointKey {
    /// Create a key from any string-like value
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow the key text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
