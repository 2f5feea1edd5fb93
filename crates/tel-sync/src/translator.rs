//! Call state translator
//!
//! Every facade call is driven by its own actor task. The actor wraps at most
//! one radio connection, turns the connection's radio-state transitions into
//! facade-state transitions, and recomputes capabilities and caller identity.
//!
//! # Architecture
//!
//! The actor consumes two ordered channels:
//! - a command channel fed by [`CallHandle`]s, the router and the registry
//! - a connection-event channel whose sender end is registered with the
//!   wrapped connection
//!
//! Events are tagged with the connection they came from. After a rebind,
//! events still queued from the old connection are dropped.
//!
//! ```text
//! radio state        facade transition
//! IDLE               none
//! ACTIVE             activate (foreground arbitration)
//! HOLDING            HOLDING
//! DIALING, ALERTING  DIALING
//! INCOMING, WAITING  RINGING
//! DISCONNECTED       DISCONNECTED, then DESTROYED
//! DISCONNECTING      none
//! ```

use std::sync::Arc;

use tel_protocol::{
    CallGroup, Capabilities, ConnectionEvent, ConnectionEventKind, DisconnectCause,
    DisconnectCode, FacadeState, RadioCallState, RadioConnection, RadioError, RadioLine,
    Subscription, VideoState,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::capability::{compute_capabilities, CallVariant, CapabilityInputs, CapabilityProvider};
use crate::error::SyncError;
use crate::registry::{CallRegistry, LineRegistry};
use crate::state::{CallDirection, CallId, CallKind, CallSnapshot};

/// Commands sent to a call actor
#[derive(Debug)]
pub enum CallCommand {
    /// Wrap a radio connection
    Bind(Arc<RadioConnection>),

    /// Swap in a different radio connection; replies whether it was accepted
    Rebind {
        connection: Arc<RadioConnection>,
        reply: oneshot::Sender<bool>,
    },

    /// Re-read the wrapped connection's radio state after another call took
    /// the foreground
    Reevaluate,

    /// Replies whether a radio command was issued
    Hold { reply: oneshot::Sender<bool> },

    /// Replies whether a radio command was issued
    Unhold { reply: oneshot::Sender<bool> },

    Answer {
        video_state: VideoState,
        reply: oneshot::Sender<()>,
    },

    Hangup { reply: oneshot::Sender<()> },

    Deflect {
        number: String,
        reply: oneshot::Sender<()>,
    },

    /// The conference this call hosted is gone; become an ordinary call
    Rehost,

    /// End the call with `cause` without asking the radio
    Fail(DisconnectCause),

    /// Tear the call down
    Close { reply: oneshot::Sender<()> },
}

/// Public face of a facade call
#[derive(Debug, Clone)]
pub struct CallHandle {
    id: CallId,
    commands: mpsc::UnboundedSender<CallCommand>,
    snapshot: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    pub(crate) fn new(
        id: CallId,
        commands: mpsc::UnboundedSender<CallCommand>,
        snapshot: watch::Receiver<CallSnapshot>,
    ) -> Self {
        Self {
            id,
            commands,
            snapshot,
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    /// Latest snapshot; stays readable after the call is destroyed
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> FacadeState {
        self.snapshot.borrow().state
    }

    /// Effective capabilities, including conference overlay bits
    pub fn capabilities(&self) -> Capabilities {
        self.snapshot.borrow().effective_capabilities()
    }

    pub fn disconnect_cause(&self) -> Option<DisconnectCause> {
        self.snapshot.borrow().disconnect_cause.clone()
    }

    /// A receiver that observes every snapshot change
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the snapshot satisfies `pred`
    pub async fn wait_until(
        &self,
        mut pred: impl FnMut(&CallSnapshot) -> bool,
    ) -> Result<CallSnapshot, SyncError> {
        let mut rx = self.snapshot.clone();
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if pred(&snapshot) {
                    return Ok(snapshot.clone());
                }
            }
            if rx.changed().await.is_err() {
                // Unregistered: the final value is all there will ever be
                let snapshot = rx.borrow().clone();
                return if pred(&snapshot) {
                    Ok(snapshot)
                } else {
                    Err(SyncError::CallClosed(self.id))
                };
            }
        }
    }

    pub async fn wait_for_state(&self, state: FacadeState) -> Result<CallSnapshot, SyncError> {
        self.wait_until(|s| s.state == state).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> CallCommand,
    ) -> Result<T, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| SyncError::CallClosed(self.id))?;
        rx.await.map_err(|_| SyncError::CallClosed(self.id))
    }

    /// Put the call on hold; returns whether the radio was commanded
    pub async fn hold(&self) -> Result<bool, SyncError> {
        self.request(|reply| CallCommand::Hold { reply }).await
    }

    /// Take the call off hold; returns whether the radio was commanded
    pub async fn unhold(&self) -> Result<bool, SyncError> {
        self.request(|reply| CallCommand::Unhold { reply }).await
    }

    pub async fn answer(&self, video_state: VideoState) -> Result<(), SyncError> {
        self.request(|reply| CallCommand::Answer { video_state, reply })
            .await
    }

    /// Decline a ringing call
    pub async fn reject(&self) -> Result<(), SyncError> {
        self.hangup().await
    }

    pub async fn hangup(&self) -> Result<(), SyncError> {
        self.request(|reply| CallCommand::Hangup { reply }).await
    }

    pub async fn deflect(&self, number: impl Into<String>) -> Result<(), SyncError> {
        let number = number.into();
        self.request(|reply| CallCommand::Deflect { number, reply })
            .await
    }

    /// Tear the call down. Calling it again, or on a call that already ended,
    /// does nothing.
    pub async fn close(&self) {
        let _ = self.request(|reply| CallCommand::Close { reply }).await;
    }

    pub(crate) fn bind(&self, connection: Arc<RadioConnection>) -> bool {
        self.commands.send(CallCommand::Bind(connection)).is_ok()
    }

    pub(crate) async fn rebind(&self, connection: Arc<RadioConnection>) -> Result<bool, SyncError> {
        self.request(|reply| CallCommand::Rebind { connection, reply })
            .await
    }

    pub(crate) fn fail(&self, cause: DisconnectCause) -> bool {
        self.commands.send(CallCommand::Fail(cause)).is_ok()
    }
}

/// Register a call and start its actor
pub(crate) fn spawn_call(
    registry: &Arc<CallRegistry>,
    lines: &Arc<LineRegistry>,
    line: Arc<dyn RadioLine>,
    snapshot: CallSnapshot,
) -> CallHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();

    let actor = CallActor {
        id: snapshot.id,
        variant: snapshot.variant,
        line,
        registry: registry.clone(),
        lines: lines.clone(),
        conn_tx,
        connection: None,
        subscription: None,
        last_radio_state: None,
        last_capabilities: None,
        closed: false,
    };
    let handle = registry.insert(snapshot, cmd_tx);
    tokio::spawn(run_call_actor(actor, cmd_rx, conn_rx));
    handle
}

struct CallActor {
    id: CallId,
    variant: CallVariant,
    line: Arc<dyn RadioLine>,
    registry: Arc<CallRegistry>,
    lines: Arc<LineRegistry>,
    /// Sender end registered with whichever connection is wrapped
    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
    connection: Option<Arc<RadioConnection>>,
    subscription: Option<Subscription>,
    last_radio_state: Option<RadioCallState>,
    last_capabilities: Option<Capabilities>,
    closed: bool,
}

async fn run_call_actor(
    mut actor: CallActor,
    mut cmd_rx: mpsc::UnboundedReceiver<CallCommand>,
    mut conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    debug!("{} actor started", actor.id);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break; };
                actor.handle_command(cmd);
            }
            Some(event) = conn_rx.recv() => {
                actor.handle_connection_event(event);
            }
        }
        if actor.closed {
            break;
        }
    }

    actor.close();

    // Commands that raced with teardown
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        actor.refuse(cmd);
    }
    debug!("{} actor stopped", actor.id);
}

impl CallActor {
    fn state(&self) -> FacadeState {
        self.registry
            .snapshot(self.id)
            .map_or(FacadeState::Destroyed, |s| s.state)
    }

    fn handle_command(&mut self, cmd: CallCommand) {
        match cmd {
            CallCommand::Bind(connection) => {
                self.bind_radio_connection(connection);
            }
            CallCommand::Rebind { connection, reply } => {
                let accepted =
                    self.accepts_swap(&connection) && self.bind_radio_connection(connection);
                let _ = reply.send(accepted);
            }
            CallCommand::Reevaluate => self.reevaluate(),
            CallCommand::Hold { reply } => {
                let _ = reply.send(self.perform_hold());
            }
            CallCommand::Unhold { reply } => {
                let _ = reply.send(self.perform_unhold());
            }
            CallCommand::Answer { video_state, reply } => {
                if let Err(err) = self.line.accept(video_state) {
                    warn!("{} answer failed: {}", self.id, err);
                }
                let _ = reply.send(());
            }
            CallCommand::Hangup { reply } => {
                self.hangup();
                let _ = reply.send(());
            }
            CallCommand::Deflect { number, reply } => {
                if let Err(err) = self.line.deflect(&number) {
                    warn!("{} deflect to {} failed: {}", self.id, number, err);
                }
                let _ = reply.send(());
            }
            CallCommand::Rehost => self.rehost(),
            CallCommand::Fail(cause) => {
                self.registry.set_disconnected(self.id, cause);
                self.close();
            }
            CallCommand::Close { reply } => {
                self.close();
                let _ = reply.send(());
            }
        }
    }

    /// Answer a command that arrived after teardown
    fn refuse(&self, cmd: CallCommand) {
        match cmd {
            CallCommand::Bind(connection) => {
                // Nobody else will ever own this leg
                warn!(
                    "{} closed before {} was bound; hanging it up",
                    self.id,
                    connection.id()
                );
                let _ = self.line.hangup(connection.id());
            }
            CallCommand::Rebind { reply, .. } => {
                let _ = reply.send(false);
            }
            CallCommand::Close { reply } => {
                let _ = reply.send(());
            }
            other => trace!("{} dropping {:?} after close", self.id, other),
        }
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        let Some(current) = self.connection.clone() else {
            return;
        };
        if event.connection != current.id() {
            trace!("{} dropping stale event from {}", self.id, event.connection);
            return;
        }

        match event.kind {
            ConnectionEventKind::StateChanged(state) => self.on_radio_state_changed(state),
            ConnectionEventKind::Updated => self.refresh_fields(&current),
            ConnectionEventKind::TechnologyChanged(technology) => {
                debug!("{} handed over to {:?}", self.id, technology);
                self.update_capabilities();
            }
            // Conference traffic belongs to the reconciler
            ConnectionEventKind::ConferenceSnapshot(_)
            | ConnectionEventKind::AddParticipantResponse { .. } => {}
        }
    }

    /// Wrap `connection`, replacing any previous one
    /// Only an unconfirmed outgoing call may move onto another outgoing connection
    fn accepts_swap(&self, connection: &RadioConnection) -> bool {
        let Some(snapshot) = self.registry.snapshot(self.id) else {
            return false;
        };
        let accepted = snapshot.state.is_unconfirmed()
            && snapshot.direction == CallDirection::Outgoing
            && !connection.is_incoming();
        if !accepted {
            debug!(
                "{} refusing swap onto {} while {}",
                self.id,
                connection.id(),
                snapshot.state.name()
            );
        }
        accepted
    }

    fn bind_radio_connection(&mut self, connection: Arc<RadioConnection>) -> bool {
        if self.closed {
            return false;
        }
        let direction = CallDirection::of_connection(connection.is_incoming());
        if let Err(err) = self
            .registry
            .bind_connection(self.id, connection.id(), direction)
        {
            warn!("{} cannot bind {}: {}", self.id, connection.id(), err);
            return false;
        }

        // At most one live subscription: release the old one first
        self.subscription = None;
        self.subscription = Some(connection.subscribe(self.conn_tx.clone()));
        self.connection = Some(connection.clone());
        info!("{} bound to {}", self.id, connection.id());

        if self.state() == FacadeState::Initializing {
            self.registry.set_state(self.id, FacadeState::New);
        }
        self.refresh_fields(&connection);
        self.last_radio_state = None;
        self.on_radio_state_changed(connection.state());
        true
    }

    /// Re-derive address, name and video fields from the connection
    fn refresh_fields(&mut self, connection: &RadioConnection) {
        let snapshot = connection.snapshot();
        self.registry
            .set_address(self.id, snapshot.address, snapshot.presentation);
        self.registry.set_caller_name(self.id, snapshot.caller_name);
        self.registry
            .set_video(self.id, snapshot.video_state, snapshot.video_provider);
        self.update_capabilities();
    }

    fn on_radio_state_changed(&mut self, state: RadioCallState) {
        if self.last_radio_state == Some(state) {
            return;
        }
        debug!(
            "{} radio state {:?} -> {:?}",
            self.id, self.last_radio_state, state
        );
        self.last_radio_state = Some(state);

        match state {
            RadioCallState::Idle | RadioCallState::Disconnecting => {}
            RadioCallState::Active => self.activate(),
            RadioCallState::Holding => {
                self.registry.set_state(self.id, FacadeState::Holding);
            }
            RadioCallState::Dialing | RadioCallState::Alerting => {
                self.registry.set_state(self.id, FacadeState::Dialing);
            }
            RadioCallState::Incoming | RadioCallState::Waiting => {
                self.registry.set_state(self.id, FacadeState::Ringing);
            }
            RadioCallState::Disconnected => {
                let cause = self
                    .connection
                    .as_ref()
                    .and_then(|c| c.disconnect_cause())
                    .unwrap_or_else(DisconnectCause::normal);
                self.registry.set_disconnected(self.id, cause);
                self.close();
                return;
            }
        }
        self.update_capabilities();
    }

    fn activate(&mut self) {
        if self.registry.activate(self.id) {
            let busy = self.registry.lines_with_live_calls();
            self.lines.update_local_call_hold(self.line.id(), &busy);
        }
    }

    /// Another call took the foreground while this one was ACTIVE
    fn reevaluate(&mut self) {
        self.last_radio_state = None;
        if let Some(connection) = self.connection.clone() {
            let current = connection.state();
            if current == RadioCallState::Active {
                // Stay demoted; the next radio update decides
                debug!("{} nudged while radio still reports ACTIVE", self.id);
            } else {
                self.on_radio_state_changed(current);
            }
        }
        self.update_capabilities();
    }

    fn update_capabilities(&mut self) {
        let Some(snapshot) = self.registry.snapshot(self.id) else {
            return;
        };
        let inputs = match &self.connection {
            Some(connection) => CapabilityInputs::from_connection(snapshot.state, &connection.snapshot()),
            None => CapabilityInputs::bare(snapshot.state),
        };
        let capabilities = compute_capabilities(&self.variant, &inputs);
        if self.last_capabilities == Some(capabilities) {
            return;
        }
        self.last_capabilities = Some(capabilities);
        self.registry.set_capabilities(self.id, capabilities);
    }

    fn perform_hold(&mut self) -> bool {
        if !self.variant.supports_hold() {
            info!("{} ignoring hold: {:?} calls cannot be held", self.id, self.variant);
            return false;
        }
        let state = self.state();
        if state != FacadeState::Active {
            debug!("{} ignoring hold in {}", self.id, state.name());
            return false;
        }
        // The same command would accept the waiting call
        if self.line.call(CallGroup::Ringing).state == RadioCallState::Waiting {
            info!("{} not holding: a call is waiting", self.id);
            return false;
        }
        self.switch_holding_and_active("hold")
    }

    fn perform_unhold(&mut self) -> bool {
        if !self.variant.supports_hold() {
            info!("{} ignoring unhold: {:?} calls cannot be held", self.id, self.variant);
            return false;
        }
        let state = self.state();
        if state != FacadeState::Holding {
            debug!("{} ignoring unhold in {}", self.id, state.name());
            return false;
        }
        // With two or more other calls the hold issued for the active call
        // already swaps this one in; a second command would swap it back out
        let others = self.registry.count_other_live_top_level(self.id);
        if others >= 2 {
            info!(
                "{} unhold suppressed with {} other calls; relying on the hold",
                self.id, others
            );
            return false;
        }
        self.switch_holding_and_active("unhold")
    }

    fn switch_holding_and_active(&self, action: &str) -> bool {
        match self.line.switch_holding_and_active() {
            Ok(()) => true,
            Err(err) => {
                warn!("{} {} failed: {}", self.id, action, err);
                false
            }
        }
    }

    fn hangup(&mut self) {
        let Some(connection) = self.connection.clone() else {
            info!("{} hung up before a connection was bound", self.id);
            self.registry.set_disconnected(
                self.id,
                DisconnectCause::new(DisconnectCode::Local, "hung up before connecting"),
            );
            self.close();
            return;
        };

        match self.line.hangup(connection.id()) {
            // DISCONNECTED arrives as a connection event
            Ok(()) => {}
            Err(RadioError::AlreadyDisconnected) => {
                debug!("{} hangup raced with disconnect", self.id);
            }
            Err(err) => {
                warn!("{} hangup failed: {}", self.id, err);
                self.registry.set_disconnected(
                    self.id,
                    DisconnectCause::new(DisconnectCode::ErrorUnspecified, err.to_string()),
                );
                self.close();
            }
        }
    }

    fn rehost(&mut self) {
        if self.closed {
            return;
        }
        info!("{} no longer hosts a conference", self.id);
        self.registry.set_kind(self.id, CallKind::TopLevel);
        self.registry.set_overlay(self.id, Capabilities::NONE);
        self.last_capabilities = None;
        if let Some(connection) = self.connection.clone() {
            self.last_radio_state = None;
            self.refresh_fields(&connection);
            self.on_radio_state_changed(connection.state());
        }
        self.update_capabilities();
    }

    /// Idempotent teardown
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Unsubscribe before letting go of the connection
        self.subscription = None;
        self.connection = None;
        self.registry.destroy(self.id);
        info!("{} closed", self.id);
    }
}
