//! Error types for address parsing and radio commands

use thiserror::Error;

/// Errors that can occur while parsing a call destination
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// No address was supplied
    #[error("no address supplied")]
    MissingAddress,

    /// Address scheme is not `tel:` or `voicemail:`
    #[error("unsupported scheme: {0:?}")]
    UnsupportedScheme(String),

    /// Nothing dialable was left after stripping separators
    #[error("address contains no dialable number")]
    EmptyNumber,
}

/// Errors reported synchronously by a radio line command
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// The target connection is already gone
    #[error("connection already disconnected")]
    AlreadyDisconnected,

    /// The command is not valid in the line's current state
    #[error("invalid call state: {0}")]
    InvalidState(String),

    /// The line does not implement this command
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The radio is powered off
    #[error("radio is powered off")]
    RadioOff,

    /// The network refused the dial
    #[error("dial rejected: {0}")]
    DialRejected(String),
}
