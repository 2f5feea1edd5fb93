//! Radio Line Simulation Library
//!
//! This crate provides a simulated radio line for exercising the call
//! synchronization engine without a modem. It includes:
//!
//! - **VirtualLine**: implements `RadioLine`, keeps foreground/background/ringing
//!   call groups, and records every command it receives
//! - **Network-side drivers**: `ring`, `inject_unknown`, `remote_answer`,
//!   `remote_hangup`, `handover`, `publish_conference` and friends, which
//!   play the role of the network
//!
//! # Example
//!
//! ```rust
//! use tel_protocol::{RadioLine, VideoState, DialExtras};
//! use tel_sim::{LineCommand, VirtualLine, VirtualLineConfig};
//!
//! let line = VirtualLine::new(VirtualLineConfig::default());
//! let conn = line
//!     .dial("+15551234", VideoState::AudioOnly, &DialExtras::default())
//!     .unwrap()
//!     .unwrap();
//!
//! line.remote_answer(conn.id());
//! assert!(matches!(line.commands()[0], LineCommand::Dial { .. }));
//! ```

pub mod line;

pub use line::{LineCommand, VirtualLine, VirtualLineConfig};
