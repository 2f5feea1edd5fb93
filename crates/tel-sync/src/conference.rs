//! Conference participant reconciliation
//!
//! A reconciler owns one conference host connection and the participant
//! calls derived from it. The network reports membership as full snapshots;
//! the reconciler folds each snapshot into per-participant lifecycles:
//!
//! 1. Unknown keys become new participants, registered HOLDING and then moved
//!    to their reported state. Participants never take part in foreground
//!    arbitration.
//! 2. Known keys are updated in place; DISCONNECTED ones are destroyed.
//! 3. Members missing from the snapshot are cancelled and removed.
//! 4. The host's MANAGE_CONFERENCE bit tracks whether membership is non-empty.
//!
//! Add-participant requests go through a FIFO with one request in flight. A
//! failed response discards everything still queued.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use tel_protocol::{
    Capabilities, ConnectionEvent, ConnectionEventKind, DisconnectCause, EndpointKey, LineId,
    ParticipantInfo, ParticipantState, RadioCallState, RadioConnection, RadioError, RadioLine,
    RadioTech, RequestTag, Subscription,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::account::AccountHandle;
use crate::capability::{compute_capabilities, CallVariant, CapabilityInputs};
use crate::error::SyncError;
use crate::events::FacadeEvent;
use crate::registry::{CallRegistry, ParticipantIndex};
use crate::state::{CallDirection, CallId, CallKind, CallSnapshot, ConferenceId};

/// Commands sent to a conference reconciler
#[derive(Debug)]
pub enum ConferenceCommand {
    /// Queue a dial-in of `address` into the conference
    AddParticipant {
        address: String,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },

    Summary {
        reply: oneshot::Sender<ConferenceSummary>,
    },

    /// Tear down every participant and stop
    Close { reply: oneshot::Sender<()> },
}

/// Point-in-time view of a conference
#[derive(Debug, Clone, PartialEq)]
pub struct ConferenceSummary {
    pub id: ConferenceId,
    pub host: CallId,
    /// Members ordered by endpoint key
    pub participants: Vec<ParticipantSummary>,
    pub can_manage: bool,
    /// Address of the add-participant request awaiting a response
    pub in_flight: Option<String>,
    /// Addresses queued behind the in-flight request
    pub pending: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantSummary {
    pub key: EndpointKey,
    pub call: CallId,
    pub state: ParticipantState,
}

/// Sent when the host left the conference-capable technology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostRetired {
    pub conference: ConferenceId,
    pub host: CallId,
}

/// Handle to a running conference reconciler
#[derive(Debug, Clone)]
pub struct ConferenceHandle {
    id: ConferenceId,
    host: CallId,
    commands: mpsc::UnboundedSender<ConferenceCommand>,
}

impl ConferenceHandle {
    pub fn id(&self) -> ConferenceId {
        self.id
    }

    /// The call anchoring the conference
    pub fn host(&self) -> CallId {
        self.host
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Queue `address` to be added to the conference
    ///
    /// Returns once the request is queued or sent; the network's answer
    /// arrives later as membership snapshots.
    pub async fn add_participant(&self, address: impl Into<String>) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ConferenceCommand::AddParticipant {
                address: address.into(),
                reply,
            })
            .map_err(|_| SyncError::ConferenceClosed(self.id))?;
        rx.await.map_err(|_| SyncError::ConferenceClosed(self.id))?
    }

    pub async fn summary(&self) -> Result<ConferenceSummary, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ConferenceCommand::Summary { reply })
            .map_err(|_| SyncError::ConferenceClosed(self.id))?;
        rx.await.map_err(|_| SyncError::ConferenceClosed(self.id))
    }

    /// Stop the reconciler; a no-op once it has stopped
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(ConferenceCommand::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Shared collaborators of every reconciler
#[derive(Debug, Clone)]
pub(crate) struct ConferenceContext {
    pub registry: Arc<CallRegistry>,
    pub participants: Arc<ParticipantIndex>,
    pub line: Arc<dyn RadioLine>,
    pub max_pending: usize,
}

/// Start a reconciler for the conference anchored on `host`
pub(crate) fn spawn_conference(
    id: ConferenceId,
    host: &CallSnapshot,
    connection: Arc<RadioConnection>,
    ctx: ConferenceContext,
) -> (ConferenceHandle, oneshot::Receiver<HostRetired>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();
    let (retired_tx, retired_rx) = oneshot::channel();

    let mut reconciler = ConferenceReconciler {
        id,
        host: host.id,
        variant: host.variant,
        line_id: host.line,
        account: host.account.clone(),
        conference_technology: connection.technology(),
        host_connection: None,
        subscription: None,
        ctx,
        members: BTreeMap::new(),
        can_manage: false,
        pending: VecDeque::new(),
        in_flight: None,
        next_request: 0,
        retired: Some(retired_tx),
        closed: false,
    };
    reconciler.set_host(connection, conn_tx);

    tokio::spawn(run_conference_actor(reconciler, cmd_rx, conn_rx));

    let handle = ConferenceHandle {
        id,
        host: host.id,
        commands: cmd_tx,
    };
    (handle, retired_rx)
}

struct Member {
    call: CallId,
    state: ParticipantState,
}

struct ConferenceReconciler {
    id: ConferenceId,
    host: CallId,
    variant: CallVariant,
    line_id: Option<LineId>,
    account: Option<AccountHandle>,
    /// Technology the conference was set up on
    conference_technology: RadioTech,
    host_connection: Option<Arc<RadioConnection>>,
    subscription: Option<Subscription>,
    ctx: ConferenceContext,
    members: BTreeMap<EndpointKey, Member>,
    can_manage: bool,
    pending: VecDeque<String>,
    in_flight: Option<(RequestTag, String)>,
    next_request: u32,
    retired: Option<oneshot::Sender<HostRetired>>,
    closed: bool,
}

async fn run_conference_actor(
    mut reconciler: ConferenceReconciler,
    mut cmd_rx: mpsc::UnboundedReceiver<ConferenceCommand>,
    mut conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    info!(
        "{} reconciler started for host {}",
        reconciler.id, reconciler.host
    );

    loop {
        tokio::select! {
            // Membership updates first so queries see everything already reported
            biased;

            Some(event) = conn_rx.recv() => {
                reconciler.handle_connection_event(event);
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break; };
                reconciler.handle_command(cmd);
            }
        }
        if reconciler.closed {
            break;
        }
    }

    reconciler.shutdown(DisconnectCause::cancelled("conference closed"));

    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            ConferenceCommand::AddParticipant { reply, .. } => {
                let _ = reply.send(Err(SyncError::ConferenceClosed(reconciler.id)));
            }
            ConferenceCommand::Summary { reply } => {
                let _ = reply.send(reconciler.summary());
            }
            ConferenceCommand::Close { reply } => {
                let _ = reply.send(());
            }
        }
    }
    info!("{} reconciler stopped", reconciler.id);
}

impl ConferenceReconciler {
    fn registry(&self) -> &CallRegistry {
        &self.ctx.registry
    }

    /// Subscribe to the host connection and mark the host call
    fn set_host(
        &mut self,
        connection: Arc<RadioConnection>,
        conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        self.subscription = None;
        self.subscription = Some(connection.subscribe(conn_tx));
        self.host_connection = Some(connection);
        self.registry()
            .set_kind(self.host, CallKind::ConferenceHost(self.id));
        self.registry().emit(FacadeEvent::ConferenceStarted {
            conference: self.id,
            host: self.host,
        });
    }

    fn handle_command(&mut self, cmd: ConferenceCommand) {
        match cmd {
            ConferenceCommand::AddParticipant { address, reply } => {
                let _ = reply.send(self.queue_participant(address));
            }
            ConferenceCommand::Summary { reply } => {
                let _ = reply.send(self.summary());
            }
            ConferenceCommand::Close { reply } => {
                self.shutdown(DisconnectCause::cancelled("conference closed"));
                self.registry().set_kind(self.host, CallKind::TopLevel);
                let _ = reply.send(());
            }
        }
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        let Some(host) = &self.host_connection else {
            return;
        };
        if event.connection != host.id() {
            return;
        }

        match event.kind {
            ConnectionEventKind::ConferenceSnapshot(participants) => {
                self.on_participant_snapshot(participants);
            }
            ConnectionEventKind::AddParticipantResponse { tag, success } => {
                self.on_add_participant_response(tag, success);
            }
            ConnectionEventKind::TechnologyChanged(technology) => {
                if technology != self.conference_technology {
                    self.retire_host(technology);
                }
            }
            ConnectionEventKind::StateChanged(RadioCallState::Disconnected) => {
                info!("{} host {} disconnected", self.id, self.host);
                self.shutdown(DisconnectCause::cancelled("conference host disconnected"));
            }
            ConnectionEventKind::StateChanged(_) | ConnectionEventKind::Updated => {}
        }
    }

    /// Fold a full membership snapshot into the participant set
    fn on_participant_snapshot(&mut self, participants: Vec<ParticipantInfo>) {
        debug!(
            "{} snapshot with {} entries ({} known)",
            self.id,
            participants.len(),
            self.members.len()
        );
        let mut seen = HashSet::new();

        for info in participants {
            seen.insert(info.key.clone());

            let Some(member) = self.members.get_mut(&info.key) else {
                self.add_member(info);
                continue;
            };

            if info.state == ParticipantState::Disconnected {
                let call = member.call;
                self.members.remove(&info.key);
                self.remove_member(&info.key, call, DisconnectCause::normal());
                continue;
            }

            if member.state != info.state {
                member.state = info.state;
                let call = member.call;
                self.apply_participant_state(call, info.state);
            }
            if info.display_name.is_some() {
                self.registry().set_caller_name(
                    self.members[&info.key].call,
                    info.display_name,
                );
            }
        }

        let absent: Vec<EndpointKey> = self
            .members
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
        for key in absent {
            if let Some(member) = self.members.remove(&key) {
                self.remove_member(&key, member.call, DisconnectCause::cancelled("left conference"));
            }
        }

        self.update_can_manage();
    }

    fn add_member(&mut self, info: ParticipantInfo) {
        if info.state == ParticipantState::Disconnected {
            trace!("{} ignoring departed participant {}", self.id, info.key);
            return;
        }
        if let Err(err) = self.ctx.participants.claim(&info.key, self.id) {
            warn!("{} skipping participant: {}", self.id, err);
            return;
        }

        let registry = self.ctx.registry.clone();
        let mut snapshot = CallSnapshot::new(
            registry.allocate_id(),
            CallKind::ConferenceParticipant(self.id),
            self.variant,
            CallDirection::Unknown,
        );
        snapshot.line = self.line_id;
        snapshot.account = self.account.clone();
        snapshot.address = Some(info.key.as_str().to_string());
        snapshot.caller_name = info.display_name;
        snapshot.endpoint = Some(info.key.clone());

        let call = registry.insert_detached(snapshot).id();
        info!("{} participant {} joined as {}", self.id, info.key, call);

        // New legs start out of the foreground, then take the reported state
        self.apply_participant_state(call, ParticipantState::Holding);
        if info.state != ParticipantState::Holding {
            self.apply_participant_state(call, info.state);
        }
        self.members.insert(
            info.key,
            Member {
                call,
                state: info.state,
            },
        );
    }

    fn apply_participant_state(&self, call: CallId, state: ParticipantState) {
        let facade = state.facade_state();
        self.registry().set_state(call, facade);
        let inputs = CapabilityInputs {
            in_conference: true,
            ..CapabilityInputs::bare(facade)
        };
        self.registry()
            .set_capabilities(call, compute_capabilities(&self.variant, &inputs));
    }

    fn remove_member(&self, key: &EndpointKey, call: CallId, cause: DisconnectCause) {
        info!("{} participant {} removed: {}", self.id, key, cause);
        self.registry().set_disconnected(call, cause);
        self.registry().destroy(call);
        self.ctx.participants.release(key, self.id);
    }

    fn update_can_manage(&mut self) {
        let can_manage = !self.members.is_empty();
        if can_manage == self.can_manage {
            return;
        }
        self.can_manage = can_manage;
        let overlay = if can_manage {
            Capabilities::MANAGE_CONFERENCE
        } else {
            Capabilities::NONE
        };
        self.registry().set_overlay(self.host, overlay);
        self.registry().emit(FacadeEvent::CanManageConferenceChanged {
            conference: self.id,
            host: self.host,
            can_manage,
        });
    }

    // ---------------------------------------------------------------------
    // Add-participant queue
    // ---------------------------------------------------------------------

    fn queue_participant(&mut self, address: String) -> Result<(), SyncError> {
        if self.pending.len() >= self.ctx.max_pending {
            warn!("{} add-participant queue full", self.id);
            return Err(SyncError::QueueFull(self.pending.len()));
        }
        debug!("{} queueing participant {}", self.id, address);
        self.pending.push_back(address);
        if self.in_flight.is_none() {
            self.send_next_participant()?;
        }
        Ok(())
    }

    fn send_next_participant(&mut self) -> Result<(), SyncError> {
        let Some(host) = self.host_connection.clone() else {
            return Err(SyncError::ConferenceClosed(self.id));
        };
        let Some(address) = self.pending.pop_front() else {
            return Ok(());
        };

        self.next_request += 1;
        let tag = RequestTag((self.id.0 << 32) | u64::from(self.next_request));
        match self.ctx.line.add_participant(host.id(), &address, tag) {
            Ok(()) => {
                debug!("{} adding {} ({:?})", self.id, address, tag);
                self.in_flight = Some((tag, address));
                Ok(())
            }
            Err(err) => {
                warn!("{} add-participant {} failed: {}", self.id, address, err);
                self.discard_pending(&err);
                Err(SyncError::Radio(err))
            }
        }
    }

    fn on_add_participant_response(&mut self, tag: RequestTag, success: bool) {
        match &self.in_flight {
            Some((expected, _)) if *expected == tag => {}
            _ => {
                debug!("{} ignoring response for unknown {:?}", self.id, tag);
                return;
            }
        }
        let Some((_, address)) = self.in_flight.take() else {
            return;
        };

        if success {
            info!("{} added {}", self.id, address);
            if let Err(err) = self.send_next_participant() {
                debug!("{} queue drained after error: {}", self.id, err);
            }
        } else {
            warn!("{} network refused {}", self.id, address);
            self.discard_pending(&RadioError::DialRejected(address));
        }
    }

    fn discard_pending(&mut self, err: &RadioError) {
        if self.pending.is_empty() {
            return;
        }
        let dropped: Vec<String> = self.pending.drain(..).collect();
        warn!(
            "{} discarding {} queued participants after failure",
            self.id,
            dropped.len()
        );
        self.registry().emit(FacadeEvent::Error {
            source: self.id.to_string(),
            message: format!("add-participant failed ({}); dropped {:?}", err, dropped),
        });
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// The host moved off the conference technology: drop every participant
    /// and hand the host back as an ordinary call
    fn retire_host(&mut self, technology: RadioTech) {
        info!(
            "{} host {} moved to {:?}; retiring conference",
            self.id, self.host, technology
        );
        self.shutdown(DisconnectCause::cancelled("conference handed over"));
        self.registry().emit(FacadeEvent::ConferenceHostRetired {
            conference: self.id,
            host: self.host,
        });
        if let Some(tx) = self.retired.take() {
            let _ = tx.send(HostRetired {
                conference: self.id,
                host: self.host,
            });
        }
    }

    /// Remove every participant and release the host; idempotent
    fn shutdown(&mut self, cause: DisconnectCause) {
        if self.closed {
            return;
        }
        self.closed = true;

        let members = std::mem::take(&mut self.members);
        for (key, member) in members {
            self.remove_member(&key, member.call, cause.clone());
        }
        self.update_can_manage();

        self.pending.clear();
        self.in_flight = None;
        self.subscription = None;
        self.host_connection = None;
    }

    fn summary(&self) -> ConferenceSummary {
        ConferenceSummary {
            id: self.id,
            host: self.host,
            participants: self
                .members
                .iter()
                .map(|(key, member)| ParticipantSummary {
                    key: key.clone(),
                    call: member.call,
                    state: member.state,
                })
                .collect(),
            can_manage: self.can_manage,
            in_flight: self.in_flight.as_ref().map(|(_, address)| address.clone()),
            pending: self.pending.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LineRegistry;
    use crate::translator::{spawn_call, CallHandle};
    use std::time::Duration;
    use tel_protocol::{DisconnectCode, FacadeState, VideoState};
    use tel_sim::{LineCommand, VirtualLine};
    use tokio::time::timeout;

    struct Fixture {
        registry: Arc<CallRegistry>,
        participants: Arc<ParticipantIndex>,
        line: Arc<VirtualLine>,
        host: CallHandle,
        connection: Arc<RadioConnection>,
        events: mpsc::UnboundedReceiver<FacadeEvent>,
    }

    async fn fixture() -> Fixture {
        let (tx, events) = mpsc::unbounded_channel();
        let registry = CallRegistry::new(tx);
        let lines = Arc::new(LineRegistry::new());
        let line = VirtualLine::in_service(0);
        lines.insert(line.clone());

        let mut snapshot = CallSnapshot::new(
            registry.allocate_id(),
            CallKind::TopLevel,
            CallVariant::Standard,
            CallDirection::Outgoing,
        );
        snapshot.line = Some(LineId(0));
        let host = spawn_call(&registry, &lines, line.clone(), snapshot);
        let connection = line
            .dial("conf", VideoState::AudioOnly, &Default::default())
            .unwrap()
            .unwrap();
        host.bind(connection.clone());
        line.remote_answer(connection.id());
        timeout(Duration::from_secs(2), host.wait_for_state(FacadeState::Active))
            .await
            .unwrap()
            .unwrap();

        Fixture {
            registry,
            participants: Arc::new(ParticipantIndex::new()),
            line,
            host,
            connection,
            events,
        }
    }

    impl Fixture {
        fn start(&self, id: u64, max_pending: usize) -> (ConferenceHandle, oneshot::Receiver<HostRetired>) {
            let ctx = ConferenceContext {
                registry: self.registry.clone(),
                participants: self.participants.clone(),
                line: self.line.clone(),
                max_pending,
            };
            spawn_conference(
                ConferenceId(id),
                &self.host.snapshot(),
                self.connection.clone(),
                ctx,
            )
        }

        fn publish(&self, entries: &[(&str, ParticipantState)]) {
            let participants = entries
                .iter()
                .map(|(key, state)| ParticipantInfo::new(*key, *state))
                .collect();
            self.line.publish_conference(self.connection.id(), participants);
        }
    }

    #[tokio::test]
    async fn test_snapshot_reconciliation() {
        let fx = fixture().await;
        let (conf, _retired) = fx.start(1, 16);

        fx.publish(&[("A", ParticipantState::Active), ("B", ParticipantState::Active)]);
        let summary = conf.summary().await.unwrap();
        assert_eq!(summary.participants.len(), 2);
        assert!(summary.can_manage);
        for p in &summary.participants {
            assert_eq!(p.state, ParticipantState::Active);
            assert_eq!(fx.registry.snapshot(p.call).unwrap().state, FacadeState::Active);
        }
        // Active participants never demote the host
        assert_eq!(fx.host.state(), FacadeState::Active);
        assert!(fx.host.capabilities().contains(Capabilities::MANAGE_CONFERENCE));
        let b = fx.registry.handle(summary.participants[1].call).unwrap();

        fx.publish(&[("A", ParticipantState::Holding)]);
        let summary = conf.summary().await.unwrap();
        assert_eq!(summary.participants.len(), 1);
        assert_eq!(summary.participants[0].key, EndpointKey::new("A"));
        assert_eq!(summary.participants[0].state, ParticipantState::Holding);
        assert!(summary.can_manage);

        assert_eq!(b.state(), FacadeState::Destroyed);
        assert_eq!(b.disconnect_cause().unwrap().code, DisconnectCode::Cancelled);
        assert_eq!(fx.participants.owner(&EndpointKey::new("B")), None);
    }

    #[tokio::test]
    async fn test_disconnected_participant_removed() {
        let fx = fixture().await;
        let (conf, _retired) = fx.start(1, 16);

        fx.publish(&[("A", ParticipantState::Active)]);
        let a = conf.summary().await.unwrap().participants[0].call;
        let a = fx.registry.handle(a).unwrap();

        fx.publish(&[("A", ParticipantState::Active)]);
        conf.summary().await.unwrap();
        assert_eq!(a.state(), FacadeState::Active);
        // Participants never take part in foreground arbitration
        assert_eq!(fx.host.state(), FacadeState::Active);

        fx.publish(&[("A", ParticipantState::Disconnected), ("C", ParticipantState::Disconnected)]);
        let summary = conf.summary().await.unwrap();
        assert!(summary.participants.is_empty());
        assert!(!summary.can_manage);
        assert_eq!(a.disconnect_cause().unwrap().code, DisconnectCode::Normal);
        assert!(!fx.host.capabilities().contains(Capabilities::MANAGE_CONFERENCE));
    }

    #[tokio::test]
    async fn test_identical_snapshot_is_idempotent() {
        let fx = fixture().await;
        let (conf, _retired) = fx.start(1, 16);

        for _ in 0..2 {
            fx.publish(&[("A", ParticipantState::Active), ("B", ParticipantState::Holding)]);
            let summary = conf.summary().await.unwrap();
            assert_eq!(summary.participants.len(), 2);
            let states: Vec<_> = summary
                .participants
                .iter()
                .map(|p| (p.state, fx.registry.snapshot(p.call).unwrap().state))
                .collect();
            assert_eq!(
                states,
                vec![
                    (ParticipantState::Active, FacadeState::Active),
                    (ParticipantState::Holding, FacadeState::Holding),
                ]
            );
        }
    }

    #[tokio::test]
    async fn test_participant_owned_by_one_conference() {
        let fx = fixture().await;
        fx.participants
            .claim(&EndpointKey::new("A"), ConferenceId(9))
            .unwrap();
        let (conf, _retired) = fx.start(1, 16);

        fx.publish(&[("A", ParticipantState::Active), ("B", ParticipantState::Active)]);
        let summary = conf.summary().await.unwrap();
        assert_eq!(summary.participants.len(), 1);
        assert_eq!(summary.participants[0].key, EndpointKey::new("B"));
        assert_eq!(
            fx.participants.owner(&EndpointKey::new("A")),
            Some(ConferenceId(9))
        );
    }

    #[tokio::test]
    async fn test_add_participant_serialized() {
        let fx = fixture().await;
        let (conf, _retired) = fx.start(1, 16);
        fx.line.clear_commands();

        conf.add_participant("200").await.unwrap();
        conf.add_participant("300").await.unwrap();
        let adds = |line: &VirtualLine| {
            line.count_commands(|c| matches!(c, LineCommand::AddParticipant { .. }))
        };
        assert_eq!(adds(&fx.line), 1);

        let summary = conf.summary().await.unwrap();
        assert_eq!(summary.in_flight.as_deref(), Some("200"));
        assert_eq!(summary.pending, vec!["300".to_string()]);

        fx.line.respond_add_participant(true).unwrap();
        let summary = conf.summary().await.unwrap();
        assert_eq!(summary.in_flight.as_deref(), Some("300"));
        assert!(summary.pending.is_empty());
        assert_eq!(adds(&fx.line), 2);
    }

    #[tokio::test]
    async fn test_failed_add_discards_queue() {
        let mut fx = fixture().await;
        let (conf, _retired) = fx.start(1, 16);

        for address in ["200", "300", "400"] {
            conf.add_participant(address).await.unwrap();
        }
        fx.line.respond_add_participant(false).unwrap();

        let summary = conf.summary().await.unwrap();
        assert_eq!(summary.in_flight, None);
        assert!(summary.pending.is_empty());
        assert_eq!(
            fx.line
                .count_commands(|c| matches!(c, LineCommand::AddParticipant { .. })),
            1
        );

        let mut saw_error = false;
        while let Ok(event) = fx.events.try_recv() {
            saw_error |= matches!(event, FacadeEvent::Error { .. });
        }
        assert!(saw_error);

        // Callers re-issue after a failure
        conf.add_participant("300").await.unwrap();
        assert_eq!(conf.summary().await.unwrap().in_flight.as_deref(), Some("300"));
    }

    #[tokio::test]
    async fn test_add_participant_queue_bound() {
        let fx = fixture().await;
        let (conf, _retired) = fx.start(1, 1);

        conf.add_participant("200").await.unwrap();
        conf.add_participant("300").await.unwrap();
        assert_eq!(
            conf.add_participant("400").await,
            Err(SyncError::QueueFull(1))
        );
    }

    #[tokio::test]
    async fn test_handover_retires_host() {
        let mut fx = fixture().await;
        let (conf, retired) = fx.start(1, 16);

        fx.publish(&[("A", ParticipantState::Active), ("B", ParticipantState::Holding)]);
        let calls: Vec<CallHandle> = conf
            .summary()
            .await
            .unwrap()
            .participants
            .iter()
            .map(|p| fx.registry.handle(p.call).unwrap())
            .collect();

        fx.line.handover(fx.connection.id(), RadioTech::Circuit);
        let signal = timeout(Duration::from_secs(2), retired)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.host, fx.host.id());

        for call in &calls {
            assert_eq!(call.state(), FacadeState::Destroyed);
            assert_eq!(call.disconnect_cause().unwrap().code, DisconnectCode::Cancelled);
        }
        assert!(fx.participants.is_empty());
        assert!(!fx.host.capabilities().contains(Capabilities::MANAGE_CONFERENCE));

        let mut saw_retired = false;
        while let Ok(event) = fx.events.try_recv() {
            saw_retired |= matches!(event, FacadeEvent::ConferenceHostRetired { .. });
        }
        assert!(saw_retired);
        assert_eq!(
            conf.add_participant("200").await,
            Err(SyncError::ConferenceClosed(ConferenceId(1)))
        );
    }

    #[tokio::test]
    async fn test_host_disconnect_tears_down() {
        let fx = fixture().await;
        let (conf, retired) = fx.start(1, 16);

        fx.publish(&[("A", ParticipantState::Active)]);
        let a = conf.summary().await.unwrap().participants[0].call;
        let a = fx.registry.handle(a).unwrap();

        fx.line.remote_hangup(fx.connection.id(), DisconnectCode::Normal);
        // Dropped without a retirement signal
        assert!(timeout(Duration::from_secs(2), retired).await.unwrap().is_err());
        assert_eq!(a.disconnect_cause().unwrap().code, DisconnectCode::Cancelled);
        assert!(conf.is_closed() || conf.summary().await.is_err());
    }
}
