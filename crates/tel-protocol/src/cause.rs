//! Disconnect causes
//!
//! Every way a call can end, including every routing rejection, maps to one
//! [`DisconnectCode`] plus a human-readable diagnostic string.

use std::fmt;

/// Standardized disconnect cause code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DisconnectCode {
    /// Remote party hung up
    Normal,
    /// Local party hung up
    Local,
    Busy,
    Congestion,
    /// Synthetic teardown; not shown in call history
    Cancelled,
    /// Incoming call ended before it was answered
    Missed,
    OutOfService,
    PowerOff,
    InvalidNumber,
    NoPhoneNumberSupplied,
    VoicemailNumberMissing,
    OutgoingFailure,
    IncomingFailure,
    /// The radio connection already backs another facade call
    AlreadyBound,
    ErrorUnspecified,
}

impl DisconnectCode {
    /// Stable upper-case name used in logs and events
    pub fn name(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Local => "LOCAL",
            Self::Busy => "BUSY",
            Self::Congestion => "CONGESTION",
            Self::Cancelled => "CANCELED",
            Self::Missed => "MISSED",
            Self::OutOfService => "OUT_OF_SERVICE",
            Self::PowerOff => "POWER_OFF",
            Self::InvalidNumber => "INVALID_NUMBER",
            Self::NoPhoneNumberSupplied => "NO_PHONE_NUMBER_SUPPLIED",
            Self::VoicemailNumberMissing => "VOICEMAIL_NUMBER_MISSING",
            Self::OutgoingFailure => "OUTGOING_FAILURE",
            Self::IncomingFailure => "INCOMING_FAILURE",
            Self::AlreadyBound => "ALREADY_BOUND",
            Self::ErrorUnspecified => "ERROR_UNSPECIFIED",
        }
    }

    /// Returns whether a call ending with this code belongs in call history
    pub fn is_logged_in_history(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for DisconnectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A disconnect code with its diagnostic string
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DisconnectCause {
    pub code: DisconnectCode,
    pub reason: String,
}

impl DisconnectCause {
    /// Create a cause with a diagnostic string
    pub fn new(code: DisconnectCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Remote hangup with no further diagnostics
    pub fn normal() -> Self {
        Self::new(DisconnectCode::Normal, "")
    }

    /// Synthetic cleanup cause, excluded from call history
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(DisconnectCode::Cancelled, reason)
    }
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_not_in_history() {
        assert!(!DisconnectCause::cancelled("sweep").code.is_logged_in_history());
        assert!(DisconnectCause::normal().code.is_logged_in_history());
    }

    #[test]
    fn test_display_includes_reason() {
        let cause = DisconnectCause::new(DisconnectCode::PowerOff, "radio is off");
        assert_eq!(cause.to_string(), "POWER_OFF (radio is off)");
        assert_eq!(DisconnectCause::normal().to_string(), "NORMAL");
    }
}
