//! Process-wide registries
//!
//! - [`CallRegistry`]: every facade call, keyed by [`CallId`]. The only write
//!   path for facade state; every write emits a [`FacadeEvent`] when, and only
//!   when, something changed. Also arbitrates which call holds the foreground.
//! - [`LineRegistry`]: attached radio lines and their local-call-hold flags.
//! - [`ParticipantIndex`]: which conference owns each participant endpoint.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tel_protocol::{
    Capabilities, ConnectionId, DisconnectCause, EndpointKey, FacadeState, LineId, LineStatus,
    Presentation, RadioLine, VideoState,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use crate::error::SyncError;
use crate::events::FacadeEvent;
use crate::state::{CallDirection, CallId, CallKind, CallSnapshot, ConferenceId};
use crate::translator::{CallCommand, CallHandle};

struct CallRecord {
    snapshot: watch::Sender<CallSnapshot>,
    commands: mpsc::UnboundedSender<CallCommand>,
}

/// Registry of every live facade call
pub struct CallRegistry {
    calls: DashMap<CallId, CallRecord>,
    /// Which call wraps each radio connection
    bound: DashMap<ConnectionId, CallId>,
    next_id: AtomicU64,
    /// Serializes foreground arbitration
    arbitration: Mutex<()>,
    events: mpsc::UnboundedSender<FacadeEvent>,
}

impl CallRegistry {
    pub fn new(events: mpsc::UnboundedSender<FacadeEvent>) -> Arc<Self> {
        Arc::new(Self {
            calls: DashMap::new(),
            bound: DashMap::new(),
            next_id: AtomicU64::new(1),
            arbitration: Mutex::new(()),
            events,
        })
    }

    pub fn allocate_id(&self) -> CallId {
        CallId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Emit an event on the UI stream
    pub fn emit(&self, event: FacadeEvent) {
        trace!("facade event: {:?}", event);
        let _ = self.events.send(event);
    }

    /// Register a call driven by an actor listening on `commands`
    pub fn insert(
        &self,
        snapshot: CallSnapshot,
        commands: mpsc::UnboundedSender<CallCommand>,
    ) -> CallHandle {
        let id = snapshot.id;
        let added = FacadeEvent::CallAdded {
            call: id,
            kind: snapshot.kind,
            line: snapshot.line,
            direction: snapshot.direction,
        };
        let (tx, rx) = watch::channel(snapshot);
        let handle = CallHandle::new(id, commands.clone(), rx);
        self.calls.insert(
            id,
            CallRecord {
                snapshot: tx,
                commands,
            },
        );
        debug!("registered {}", id);
        self.emit(added);
        handle
    }

    /// Register a call with no actor behind it
    ///
    /// Commands sent through the returned handle fail with `CallClosed`.
    pub fn insert_detached(&self, snapshot: CallSnapshot) -> CallHandle {
        let (commands, _) = mpsc::unbounded_channel();
        self.insert(snapshot, commands)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn contains(&self, id: CallId) -> bool {
        self.calls.contains_key(&id)
    }

    pub fn snapshot(&self, id: CallId) -> Option<CallSnapshot> {
        self.calls.get(&id).map(|r| r.snapshot.borrow().clone())
    }

    /// Snapshots of every registered call, ordered by id
    pub fn snapshots(&self) -> Vec<CallSnapshot> {
        let mut all: Vec<CallSnapshot> = self
            .calls
            .iter()
            .map(|r| r.snapshot.borrow().clone())
            .collect();
        all.sort_by_key(|s| s.id);
        all
    }

    /// Live top-level calls, ordered by id
    pub fn live_top_level(&self) -> Vec<CallSnapshot> {
        self.snapshots()
            .into_iter()
            .filter(CallSnapshot::is_live_top_level)
            .collect()
    }

    /// Number of live top-level calls other than `id`
    pub fn count_other_live_top_level(&self, id: CallId) -> usize {
        self.calls
            .iter()
            .filter(|r| *r.key() != id && r.snapshot.borrow().is_live_top_level())
            .count()
    }

    /// Number of top-level calls currently ACTIVE
    pub fn active_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|r| {
                let snap = r.snapshot.borrow();
                snap.kind.is_top_level() && snap.state == FacadeState::Active
            })
            .count()
    }

    /// Lines carrying at least one live top-level call
    pub fn lines_with_live_calls(&self) -> HashSet<LineId> {
        self.calls
            .iter()
            .filter_map(|r| {
                let snap = r.snapshot.borrow();
                snap.is_live_top_level().then_some(snap.line).flatten()
            })
            .collect()
    }

    /// Handle for a registered call
    pub fn handle(&self, id: CallId) -> Option<CallHandle> {
        self.calls
            .get(&id)
            .map(|r| CallHandle::new(id, r.commands.clone(), r.snapshot.subscribe()))
    }

    pub fn is_bound(&self, connection: ConnectionId) -> bool {
        self.bound.contains_key(&connection)
    }

    /// Call wrapping `connection`
    pub fn owner_of(&self, connection: ConnectionId) -> Option<CallId> {
        self.bound.get(&connection).map(|owner| *owner)
    }

    /// Deliver a command to a call's actor; false if the call is gone
    pub fn send(&self, id: CallId, command: CallCommand) -> bool {
        self.calls
            .get(&id)
            .is_some_and(|r| r.commands.send(command).is_ok())
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Apply `f` to a call's snapshot. `f` returns `Some` when it changed
    /// something; DESTROYED calls are never modified.
    fn modify<R>(&self, id: CallId, f: impl FnOnce(&mut CallSnapshot) -> Option<R>) -> Option<R> {
        let record = self.calls.get(&id)?;
        let mut out = None;
        record.snapshot.send_if_modified(|snap| {
            if snap.state == FacadeState::Destroyed {
                return false;
            }
            out = f(snap);
            out.is_some()
        });
        out
    }

    /// Move a call to `to`
    ///
    /// Top-level calls become ACTIVE only through [`CallRegistry::activate`].
    pub fn set_state(&self, id: CallId, to: FacadeState) -> bool {
        let from = self.modify(id, |snap| {
            if snap.state == to {
                return None;
            }
            let from = snap.state;
            snap.state = to;
            Some(from)
        });
        match from {
            Some(from) => {
                debug!("{} {} -> {}", id, from.name(), to.name());
                self.emit(FacadeEvent::StateChanged { call: id, from, to });
                true
            }
            None => false,
        }
    }

    /// Move a call to DISCONNECTED with `cause`; no-op once terminal
    pub fn set_disconnected(&self, id: CallId, cause: DisconnectCause) -> bool {
        let from = self.modify(id, |snap| {
            if snap.state.is_terminal() {
                return None;
            }
            let from = snap.state;
            snap.state = FacadeState::Disconnected;
            snap.disconnect_cause = Some(cause.clone());
            Some(from)
        });
        let Some(from) = from else {
            return false;
        };
        info!("{} disconnected: {}", id, cause);
        self.emit(FacadeEvent::StateChanged {
            call: id,
            from,
            to: FacadeState::Disconnected,
        });
        self.emit(FacadeEvent::Disconnected { call: id, cause });
        true
    }

    /// Mark a call DESTROYED and unregister it
    pub fn destroy(&self, id: CallId) -> bool {
        let from = self.modify(id, |snap| {
            let from = snap.state;
            snap.state = FacadeState::Destroyed;
            snap.capabilities = Capabilities::NONE;
            snap.overlay = Capabilities::NONE;
            snap.connection = None;
            Some(from)
        });
        self.bound.retain(|_, owner| *owner != id);
        let removed = self.calls.remove(&id).is_some();

        if let Some(from) = from {
            self.emit(FacadeEvent::StateChanged {
                call: id,
                from,
                to: FacadeState::Destroyed,
            });
            self.emit(FacadeEvent::Destroyed { call: id });
        }
        removed
    }

    /// Atomically make `id` the only ACTIVE top-level call
    ///
    /// Any other top-level call found ACTIVE is moved to HOLDING and nudged to
    /// re-read its own radio state.
    pub fn activate(&self, id: CallId) -> bool {
        let _guard = self.arbitration.lock();

        let Some(target) = self.snapshot(id) else {
            return false;
        };
        if target.state.is_terminal() {
            return false;
        }

        if target.kind.is_top_level() {
            let others: Vec<CallId> = self
                .calls
                .iter()
                .filter(|r| {
                    let snap = r.snapshot.borrow();
                    *r.key() != id
                        && snap.kind.is_top_level()
                        && snap.state == FacadeState::Active
                })
                .map(|r| *r.key())
                .collect();

            for other in others {
                info!("{} activating; moving {} to HOLDING", id, other);
                self.set_state(other, FacadeState::Holding);
                self.send(other, CallCommand::Reevaluate);
            }
        }

        self.set_state(id, FacadeState::Active);
        true
    }

    /// Record that `id` wraps `connection`
    ///
    /// Fails if another call already wraps it. Releases the call's previous
    /// connection.
    pub fn bind_connection(
        &self,
        id: CallId,
        connection: ConnectionId,
        direction: CallDirection,
    ) -> Result<(), SyncError> {
        match self.bound.entry(connection) {
            Entry::Occupied(entry) => {
                let owner = *entry.get();
                if owner != id {
                    return Err(SyncError::AlreadyBound { connection, owner });
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(id);
            }
        }

        let previous = self.modify(id, |snap| {
            if snap.connection == Some(connection) && snap.direction == direction {
                return None;
            }
            let previous = snap.connection.replace(connection);
            snap.direction = direction;
            Some(previous)
        });

        if !self.contains(id) {
            self.bound.remove_if(&connection, |_, owner| *owner == id);
            return Err(SyncError::CallNotFound(id));
        }
        if let Some(Some(previous)) = previous {
            if previous != connection {
                self.bound.remove_if(&previous, |_, owner| *owner == id);
            }
        }
        Ok(())
    }

    pub fn set_kind(&self, id: CallId, kind: CallKind) -> bool {
        self.modify(id, |snap| {
            (snap.kind != kind).then(|| {
                snap.kind = kind;
            })
        })
        .is_some()
    }

    /// Replace the call's own capabilities
    pub fn set_capabilities(&self, id: CallId, capabilities: Capabilities) -> bool {
        self.update_capabilities(id, |snap| {
            (snap.capabilities != capabilities).then(|| snap.capabilities = capabilities)
        })
    }

    /// Replace the reconciler-owned capability bits
    pub fn set_overlay(&self, id: CallId, overlay: Capabilities) -> bool {
        self.update_capabilities(id, |snap| {
            (snap.overlay != overlay).then(|| snap.overlay = overlay)
        })
    }

    fn update_capabilities(
        &self,
        id: CallId,
        f: impl FnOnce(&mut CallSnapshot) -> Option<()>,
    ) -> bool {
        let changed = self.modify(id, |snap| {
            let before = snap.effective_capabilities();
            f(snap)?;
            let after = snap.effective_capabilities();
            Some((before != after).then_some(after))
        });
        match changed {
            Some(Some(capabilities)) => {
                self.emit(FacadeEvent::CapabilitiesChanged {
                    call: id,
                    capabilities,
                });
                true
            }
            _ => false,
        }
    }

    pub fn set_address(
        &self,
        id: CallId,
        address: Option<String>,
        presentation: Presentation,
    ) -> bool {
        let changed = self.modify(id, |snap| {
            if snap.address == address && snap.presentation == presentation {
                return None;
            }
            snap.address = address.clone();
            snap.presentation = presentation;
            Some(())
        });
        if changed.is_some() {
            self.emit(FacadeEvent::AddressChanged {
                call: id,
                address,
                presentation,
            });
        }
        changed.is_some()
    }

    pub fn set_caller_name(&self, id: CallId, name: Option<String>) -> bool {
        let changed = self.modify(id, |snap| {
            (snap.caller_name != name).then(|| snap.caller_name = name.clone())
        });
        if changed.is_some() {
            self.emit(FacadeEvent::CallerNameChanged { call: id, name });
        }
        changed.is_some()
    }

    pub fn set_video(&self, id: CallId, video_state: VideoState, provider: Option<String>) -> bool {
        let changed = self.modify(id, |snap| {
            if snap.video_state == video_state && snap.video_provider == provider {
                return None;
            }
            snap.video_state = video_state;
            snap.video_provider = provider.clone();
            Some(())
        });
        if changed.is_some() {
            self.emit(FacadeEvent::VideoChanged {
                call: id,
                video_state,
                provider,
            });
        }
        changed.is_some()
    }
}

impl std::fmt::Debug for CallRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRegistry")
            .field("calls", &self.calls.len())
            .field("bound", &self.bound.len())
            .finish()
    }
}

struct LineEntry {
    line: Arc<dyn RadioLine>,
    local_call_hold: bool,
}

/// Attached radio lines, keyed by line id
#[derive(Default)]
pub struct LineRegistry {
    lines: DashMap<LineId, LineEntry>,
}

impl LineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a line, replacing any line with the same id
    pub fn insert(&self, line: Arc<dyn RadioLine>) -> Option<Arc<dyn RadioLine>> {
        self.lines
            .insert(
                line.id(),
                LineEntry {
                    line,
                    local_call_hold: false,
                },
            )
            .map(|previous| previous.line)
    }

    pub fn remove(&self, id: LineId) -> Option<Arc<dyn RadioLine>> {
        self.lines.remove(&id).map(|(_, entry)| entry.line)
    }

    pub fn get(&self, id: LineId) -> Option<Arc<dyn RadioLine>> {
        self.lines.get(&id).map(|entry| entry.line.clone())
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// All lines, lowest slot index first
    pub fn lines(&self) -> Vec<Arc<dyn RadioLine>> {
        let mut lines: Vec<_> = self.lines.iter().map(|e| e.line.clone()).collect();
        lines.sort_by_key(|line| {
            let status = line.status();
            (status.index, status.id)
        });
        lines
    }

    pub fn statuses(&self) -> Vec<LineStatus> {
        self.lines().iter().map(|line| line.status()).collect()
    }

    pub fn local_call_hold(&self, id: LineId) -> bool {
        self.lines.get(&id).is_some_and(|e| e.local_call_hold)
    }

    /// Update a line's local-call-hold flag, commanding the line on change
    pub fn set_local_call_hold(&self, id: LineId, hold: bool) -> bool {
        let line = {
            let Some(mut entry) = self.lines.get_mut(&id) else {
                return false;
            };
            if entry.local_call_hold == hold {
                return false;
            }
            entry.local_call_hold = hold;
            entry.line.clone()
        };
        debug!("{} local call hold -> {}", id, hold);
        line.set_local_call_hold(hold);
        true
    }

    /// After a call on `active` took the foreground: clear its flag and set
    /// the flag on every other line still carrying a live call
    pub fn update_local_call_hold(&self, active: LineId, busy: &HashSet<LineId>) {
        let ids: Vec<LineId> = self.lines.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.set_local_call_hold(id, id != active && busy.contains(&id));
        }
    }
}

impl std::fmt::Debug for LineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<LineId> = self.lines.iter().map(|e| *e.key()).collect();
        f.debug_struct("LineRegistry").field("lines", &ids).finish()
    }
}

/// Which conference owns each participant endpoint
#[derive(Debug, Default)]
pub struct ParticipantIndex {
    owners: DashMap<EndpointKey, ConferenceId>,
}

impl ParticipantIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for `conference`; idempotent for the current owner
    pub fn claim(&self, key: &EndpointKey, conference: ConferenceId) -> Result<(), SyncError> {
        match self.owners.entry(key.clone()) {
            Entry::Occupied(entry) if *entry.get() != conference => {
                Err(SyncError::ParticipantClaimed {
                    key: key.clone(),
                    owner: *entry.get(),
                })
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(entry) => {
                entry.insert(conference);
                Ok(())
            }
        }
    }

    /// Release `key` if `conference` owns it
    pub fn release(&self, key: &EndpointKey, conference: ConferenceId) -> bool {
        self.owners
            .remove_if(key, |_, owner| *owner == conference)
            .is_some()
    }

    pub fn owner(&self, key: &EndpointKey) -> Option<ConferenceId> {
        self.owners.get(key).map(|owner| *owner)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CallVariant;
    use tel_protocol::DisconnectCode;

    fn registry() -> (Arc<CallRegistry>, mpsc::UnboundedReceiver<FacadeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CallRegistry::new(tx), rx)
    }

    fn add_call(registry: &CallRegistry, kind: CallKind) -> CallHandle {
        let id = registry.allocate_id();
        let mut snapshot =
            CallSnapshot::new(id, kind, CallVariant::Standard, CallDirection::Outgoing);
        snapshot.line = Some(LineId(0));
        registry.insert_detached(snapshot)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<FacadeEvent>) -> Vec<FacadeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_insert_emits_call_added() {
        let (registry, mut rx) = registry();
        let call = add_call(&registry, CallKind::TopLevel);
        let events = drain(&mut rx);
        assert!(matches!(events[0], FacadeEvent::CallAdded { call: id, .. } if id == call.id()));
        assert_eq!(call.state(), FacadeState::Initializing);
    }

    #[test]
    fn test_identical_writes_emit_once() {
        let (registry, mut rx) = registry();
        let call = add_call(&registry, CallKind::TopLevel);
        drain(&mut rx);

        assert!(registry.set_capabilities(call.id(), Capabilities::MUTE));
        assert!(!registry.set_capabilities(call.id(), Capabilities::MUTE));
        assert!(registry.set_address(call.id(), Some("+15551234".into()), Presentation::Allowed));
        assert!(!registry.set_address(call.id(), Some("+15551234".into()), Presentation::Allowed));
        assert!(registry.set_caller_name(call.id(), Some("Alice".into())));
        assert!(!registry.set_caller_name(call.id(), Some("Alice".into())));

        assert_eq!(drain(&mut rx).len(), 3);
    }

    #[test]
    fn test_overlay_changes_effective_capabilities() {
        let (registry, mut rx) = registry();
        let call = add_call(&registry, CallKind::TopLevel);
        registry.set_capabilities(call.id(), Capabilities::MUTE);
        drain(&mut rx);

        registry.set_overlay(call.id(), Capabilities::MANAGE_CONFERENCE);
        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![FacadeEvent::CapabilitiesChanged {
                call: call.id(),
                capabilities: Capabilities::MUTE | Capabilities::MANAGE_CONFERENCE,
            }]
        );
        assert!(call.capabilities().contains(Capabilities::MANAGE_CONFERENCE));
    }

    #[test]
    fn test_activate_demotes_other_active_call() {
        let (registry, _rx) = registry();
        let a = add_call(&registry, CallKind::TopLevel);
        let b = add_call(&registry, CallKind::TopLevel);

        assert!(registry.activate(a.id()));
        assert!(registry.activate(b.id()));

        assert_eq!(a.state(), FacadeState::Holding);
        assert_eq!(b.state(), FacadeState::Active);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_participants_do_not_take_part_in_arbitration() {
        let (registry, _rx) = registry();
        let top = add_call(&registry, CallKind::TopLevel);
        let participant = add_call(&registry, CallKind::ConferenceParticipant(ConferenceId(1)));

        registry.activate(top.id());
        registry.set_state(participant.id(), FacadeState::Active);
        assert_eq!(top.state(), FacadeState::Active);
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.count_other_live_top_level(top.id()), 0);
    }

    #[test]
    fn test_destroyed_accepts_no_transitions() {
        let (registry, mut rx) = registry();
        let call = add_call(&registry, CallKind::TopLevel);
        registry.set_disconnected(call.id(), DisconnectCause::new(DisconnectCode::Busy, "busy"));
        assert!(registry.destroy(call.id()));
        drain(&mut rx);

        assert!(!registry.destroy(call.id()));
        assert!(!registry.set_state(call.id(), FacadeState::Active));
        assert!(!registry.activate(call.id()));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(call.state(), FacadeState::Destroyed);
        assert_eq!(call.disconnect_cause().unwrap().code, DisconnectCode::Busy);
    }

    #[test]
    fn test_bind_connection_is_exclusive() {
        let (registry, _rx) = registry();
        let a = add_call(&registry, CallKind::TopLevel);
        let b = add_call(&registry, CallKind::TopLevel);

        registry
            .bind_connection(a.id(), ConnectionId(9), CallDirection::Outgoing)
            .unwrap();
        assert_eq!(
            registry.bind_connection(b.id(), ConnectionId(9), CallDirection::Outgoing),
            Err(SyncError::AlreadyBound {
                connection: ConnectionId(9),
                owner: a.id()
            })
        );

        // Rebinding releases the previous connection
        registry
            .bind_connection(a.id(), ConnectionId(10), CallDirection::Outgoing)
            .unwrap();
        assert!(!registry.is_bound(ConnectionId(9)));
        assert_eq!(registry.owner_of(ConnectionId(10)), Some(a.id()));

        registry.destroy(a.id());
        assert!(!registry.is_bound(ConnectionId(10)));
    }

    #[test]
    fn test_participant_index_claims() {
        let index = ParticipantIndex::new();
        let key = EndpointKey::new("sip:alice@example.com");

        index.claim(&key, ConferenceId(1)).unwrap();
        index.claim(&key, ConferenceId(1)).unwrap();
        assert!(matches!(
            index.claim(&key, ConferenceId(2)),
            Err(SyncError::ParticipantClaimed { owner, .. }) if owner == ConferenceId(1)
        ));

        assert!(!index.release(&key, ConferenceId(2)));
        assert!(index.release(&key, ConferenceId(1)));
        assert!(index.is_empty());
    }
}
