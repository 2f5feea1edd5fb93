//! Call State Synchronization Engine
//!
//! This crate keeps the calls a calling UI sees consistent with what the
//! radio lines underneath report, including routing new call requests to the
//! right line.
//!
//! # Architecture
//!
//! Every facade call is an actor task that wraps at most one radio
//! connection and translates its state changes. Calls coordinate only through
//! the process-wide registries:
//!
//! - **CallRegistry**: the single write path for facade state; arbitrates the
//!   one ACTIVE top-level call
//! - **LineRegistry**: attached lines and their local-call-hold flags
//! - **ParticipantIndex**: which conference owns each participant
//!
//! Around the calls sit:
//!
//! - **ConnectionRouter**: outgoing, incoming and unknown call creation,
//!   emergency line selection, conference hosting
//! - **ConferenceReconciler**: one actor per conference host, folding
//!   membership snapshots into participant calls
//! - **UnknownConnectionNotifier**: one watcher per line, swapping unsolicited
//!   connections into matching calls
//!
//! All observable changes are emitted through a unified [`FacadeEvent`] stream.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tel_protocol::LineId;
//! use tel_sim::VirtualLine;
//! use tel_sync::{ConnectionRouter, OutgoingRequest, StaticAccountResolver, SyncConfig};
//! use tokio::sync::mpsc;
//!
//! # async fn demo() {
//! let (events_tx, mut events) = mpsc::unbounded_channel();
//! let accounts = Arc::new(StaticAccountResolver::new([LineId(0)]));
//! let router = ConnectionRouter::new(SyncConfig::default(), accounts, events_tx);
//! router.attach_line(VirtualLine::in_service(0));
//!
//! let call = router.create_outgoing(OutgoingRequest::new("tel:+15551234"));
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # let _ = call;
//! # }
//! ```

pub mod account;
pub mod capability;
pub mod conference;
pub mod config;
pub mod error;
pub mod events;
pub mod notifier;
pub mod registry;
pub mod router;
pub mod state;
pub mod translator;

pub use account::{AccountHandle, AccountResolver, StaticAccountResolver};
pub use capability::{compute_capabilities, CallVariant, CapabilityInputs, CapabilityProvider};
pub use conference::{ConferenceHandle, ConferenceSummary, HostRetired, ParticipantSummary};
pub use config::{RouterConfig, SyncConfig};
pub use error::SyncError;
pub use events::FacadeEvent;
pub use notifier::NotifierHandle;
pub use registry::{CallRegistry, LineRegistry, ParticipantIndex};
pub use router::{
    cause_for_parse_error, cause_for_radio_error, select_emergency_line, service_rejection,
    ConnectionRouter, LineRequest, OutgoingRequest,
};
pub use state::{CallDirection, CallId, CallKind, CallSnapshot, ConferenceId};
pub use translator::{CallCommand, CallHandle};
