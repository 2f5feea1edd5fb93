//! Account handle resolution
//!
//! The calling UI addresses lines through stable account handles. The
//! registration bookkeeping behind them lives outside the engine; the router
//! only consumes the [`AccountResolver`] trait.

use std::collections::BTreeSet;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tel_protocol::LineId;

const HANDLE_PREFIX: &str = "line-";

/// Stable routing identity of a line, as seen by the UI
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountHandle(pub String);

impl AccountHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps lines to account handles and back
pub trait AccountResolver: Send + Sync + fmt::Debug {
    /// Stable handle for a line, if the line has an account
    fn resolve(&self, line: LineId) -> Option<AccountHandle>;

    fn has_registered_account(&self, handle: &AccountHandle) -> bool;

    /// Line a handle routes to
    fn line_for(&self, handle: &AccountHandle) -> Option<LineId>;
}

/// Resolver with handles of the form `line-<n>` for a configured set of lines
#[derive(Debug, Default)]
pub struct StaticAccountResolver {
    registered: RwLock<BTreeSet<LineId>>,
}

impl StaticAccountResolver {
    pub fn new(lines: impl IntoIterator<Item = LineId>) -> Self {
        Self {
            registered: RwLock::new(lines.into_iter().collect()),
        }
    }

    pub fn register(&self, line: LineId) {
        self.registered.write().insert(line);
    }

    pub fn unregister(&self, line: LineId) {
        self.registered.write().remove(&line);
    }

    /// Handle a line would be given, registered or not
    pub fn handle_for(line: LineId) -> AccountHandle {
        AccountHandle(format!("{}{}", HANDLE_PREFIX, line.as_u32()))
    }

    fn parse(handle: &AccountHandle) -> Option<LineId> {
        handle
            .as_str()
            .strip_prefix(HANDLE_PREFIX)
            .and_then(|n| n.parse().ok())
            .map(LineId)
    }
}

impl AccountResolver for StaticAccountResolver {
    fn resolve(&self, line: LineId) -> Option<AccountHandle> {
        self.registered
            .read()
            .contains(&line)
            .then(|| Self::handle_for(line))
    }

    fn has_registered_account(&self, handle: &AccountHandle) -> bool {
        Self::parse(handle).is_some_and(|line| self.registered.read().contains(&line))
    }

    fn line_for(&self, handle: &AccountHandle) -> Option<LineId> {
        Self::parse(handle).filter(|line| self.registered.read().contains(line))
    }
}
