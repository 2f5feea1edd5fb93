//! Call destination parsing
//!
//! Outgoing requests carry a URI-like handle. Only `tel:` numbers and the
//! `voicemail:` alias are routable over a radio line.

use crate::error::ParseError;

/// URI scheme for dialable numbers
pub const SCHEME_TEL: &str = "tel";
/// URI scheme aliasing the line's voicemail number
pub const SCHEME_VOICEMAIL: &str = "voicemail";

/// A parsed outgoing destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// A dialable number with visual separators removed
    Number(String),
    /// The voicemail alias, resolved against the selected line
    Voicemail,
}

/// Parse an outgoing handle such as `tel:+1-555-0100` or `voicemail:`
pub fn parse_destination(handle: Option<&str>) -> Result<Destination, ParseError> {
    let handle = handle.ok_or(ParseError::MissingAddress)?;

    let (scheme, rest) = handle
        .split_once(':')
        .ok_or_else(|| ParseError::UnsupportedScheme(String::new()))?;

    if scheme.eq_ignore_ascii_case(SCHEME_VOICEMAIL) {
        return Ok(Destination::Voicemail);
    }
    if !scheme.eq_ignore_ascii_case(SCHEME_TEL) {
        return Err(ParseError::UnsupportedScheme(scheme.to_string()));
    }

    let number = strip_separators(rest);
    if number.is_empty() {
        return Err(ParseError::EmptyNumber);
    }
    Ok(Destination::Number(number))
}

/// Remove visual separators, keeping only dialable characters
pub fn strip_separators(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '+' | '*' | '#' | ',' | ';'))
        .collect()
}

/// Compare two addresses as dialed numbers
pub fn same_number(a: &str, b: &str) -> bool {
    let a = strip_separators(a);
    !a.is_empty() && a == strip_separators(b)
}

/// Returns whether `number` is one of the configured emergency numbers
pub fn is_emergency_number<S: AsRef<str>>(number: &str, emergency_numbers: &[S]) -> bool {
    let number = strip_separators(number);
    emergency_numbers
        .iter()
        .any(|e| strip_separators(e.as_ref()) == number)
}
