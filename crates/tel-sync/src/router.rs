//! Connection routing
//!
//! The [`ConnectionRouter`] turns outgoing, incoming and unknown call requests
//! into facade calls bound to the right radio line. Rejections never escape
//! as errors: every failure path yields a call that ends DISCONNECTED, then
//! DESTROYED, with a cause and a diagnostic string.
//!
//! # Emergency line selection
//!
//! [`select_emergency_line`] is a deterministic cascade over line statuses
//! ordered by slot index:
//!
//! 1. the default voice line, if it can place an emergency call now
//! 2. the lowest-indexed line that can
//! 3. among lines with a ready SIM and an active subscription, the default
//!    voice line, else the lowest-indexed one
//! 4. the primary line, else index 0, else the first line

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tel_protocol::address::{is_emergency_number, parse_destination, strip_separators};
use tel_protocol::{
    CallGroup, Destination, DialExtras, DisconnectCause, DisconnectCode, LineId, LineStatus,
    ParseError, RadioCallState, RadioConnection, RadioError, RadioLine, ServiceState, VideoState,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::account::{AccountHandle, AccountResolver};
use crate::capability::CallVariant;
use crate::conference::{spawn_conference, ConferenceContext, ConferenceHandle, HostRetired};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::FacadeEvent;
use crate::notifier::{spawn_notifier, NotifierHandle};
use crate::registry::{CallRegistry, LineRegistry, ParticipantIndex};
use crate::state::{CallDirection, CallId, CallKind, CallSnapshot, ConferenceId};
use crate::translator::{spawn_call, CallCommand, CallHandle};

/// Request to place a call
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRequest {
    /// Destination handle such as `tel:+15551234` or `voicemail:`
    pub address: Option<String>,
    /// Account to place the call from; the default voice line otherwise
    pub account: Option<AccountHandle>,
    pub video_state: VideoState,
    pub subject: Option<String>,
    /// Treat the number as an emergency number even if it is not configured
    /// as one
    pub emergency: bool,
}

impl OutgoingRequest {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            account: None,
            video_state: VideoState::AudioOnly,
            subject: None,
            emergency: false,
        }
    }

    pub fn with_account(mut self, account: AccountHandle) -> Self {
        self.account = Some(account);
        self
    }

    pub fn with_video(mut self, video_state: VideoState) -> Self {
        self.video_state = video_state;
        self
    }

    pub fn as_emergency(mut self) -> Self {
        self.emergency = true;
        self
    }
}

/// Request naming the line an incoming or unknown call lives on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineRequest {
    pub account: Option<AccountHandle>,
    pub line: Option<LineId>,
}

impl LineRequest {
    pub fn for_line(line: LineId) -> Self {
        Self {
            account: None,
            line: Some(line),
        }
    }

    pub fn for_account(account: AccountHandle) -> Self {
        Self {
            account: Some(account),
            line: None,
        }
    }
}

/// Routes call requests to radio lines
pub struct ConnectionRouter {
    config: SyncConfig,
    accounts: Arc<dyn AccountResolver>,
    registry: Arc<CallRegistry>,
    lines: Arc<LineRegistry>,
    participants: Arc<ParticipantIndex>,
    notifiers: DashMap<LineId, NotifierHandle>,
    conferences: DashMap<ConferenceId, ConferenceHandle>,
    next_conference: AtomicU64,
}

impl ConnectionRouter {
    pub fn new(
        config: SyncConfig,
        accounts: Arc<dyn AccountResolver>,
        events: mpsc::UnboundedSender<FacadeEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            accounts,
            registry: CallRegistry::new(events),
            lines: Arc::new(LineRegistry::new()),
            participants: Arc::new(ParticipantIndex::new()),
            notifiers: DashMap::new(),
            conferences: DashMap::new(),
            next_conference: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    pub fn lines(&self) -> &Arc<LineRegistry> {
        &self.lines
    }

    pub fn participants(&self) -> &Arc<ParticipantIndex> {
        &self.participants
    }

    pub fn accounts(&self) -> &Arc<dyn AccountResolver> {
        &self.accounts
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Handle to a registered call
    pub fn call(&self, id: CallId) -> Option<CallHandle> {
        self.registry.handle(id)
    }

    pub fn conference(&self, id: ConferenceId) -> Option<ConferenceHandle> {
        self.conferences.get(&id).map(|c| c.clone())
    }

    // ---------------------------------------------------------------------
    // Lines
    // ---------------------------------------------------------------------

    /// Attach a line and start watching it for unsolicited connections
    pub fn attach_line(self: &Arc<Self>, line: Arc<dyn RadioLine>) {
        if let Some(previous) = self.replace_line(line) {
            warn!("{} was already attached; replaced", previous.id());
        }
    }

    /// Swap in a new line object for the same id, as after a radio
    /// technology change
    pub fn replace_line(self: &Arc<Self>, line: Arc<dyn RadioLine>) -> Option<Arc<dyn RadioLine>> {
        let id = line.id();
        let notifier = spawn_notifier(Arc::downgrade(self), line.clone());
        let previous = self.lines.insert(line);
        // Dropping the old handle stops the old watcher
        self.notifiers.insert(id, notifier);
        info!("{} attached", id);
        previous
    }

    pub fn detach_line(&self, id: LineId) -> Option<Arc<dyn RadioLine>> {
        self.notifiers.remove(&id);
        let line = self.lines.remove(id);
        if line.is_some() {
            info!("{} detached", id);
        }
        line
    }

    /// Line for an explicit id, an account, or the default voice line
    fn resolve_line(
        &self,
        account: Option<&AccountHandle>,
        line: Option<LineId>,
    ) -> Option<Arc<dyn RadioLine>> {
        if let Some(id) = line {
            return self.lines.get(id);
        }
        if let Some(account) = account {
            return self
                .accounts
                .line_for(account)
                .and_then(|id| self.lines.get(id));
        }
        self.config
            .router
            .default_voice_line
            .and_then(|id| self.lines.get(id))
            .or_else(|| self.lines.lines().into_iter().next())
    }

    /// Like `resolve_line`, but reports what could not be resolved
    fn require_line(&self, request: &LineRequest) -> Result<Arc<dyn RadioLine>, SyncError> {
        if let Some(line) = self.resolve_line(request.account.as_ref(), request.line) {
            return Ok(line);
        }
        if let Some(id) = request.line {
            return Err(SyncError::LineNotFound(id));
        }
        match &request.account {
            Some(account) => match self.accounts.line_for(account) {
                Some(id) => Err(SyncError::LineNotFound(id)),
                None => Err(SyncError::AccountNotFound(account.clone())),
            },
            None => Err(SyncError::NoLines),
        }
    }

    fn base_snapshot(
        &self,
        line: &Arc<dyn RadioLine>,
        direction: CallDirection,
    ) -> CallSnapshot {
        let mut snapshot = CallSnapshot::new(
            self.registry.allocate_id(),
            CallKind::TopLevel,
            CallVariant::from(line.family()),
            direction,
        );
        snapshot.line = Some(line.id());
        snapshot.account = self.accounts.resolve(line.id());
        snapshot
    }

    /// Register a call that failed before it ever reached the radio
    fn fail_detached(&self, snapshot: CallSnapshot, cause: DisconnectCause) -> CallHandle {
        warn!("{} rejected: {}", snapshot.id, cause);
        let handle = self.registry.insert_detached(snapshot);
        self.registry.set_disconnected(handle.id(), cause);
        self.registry.destroy(handle.id());
        handle
    }

    fn fail_unrouted(&self, direction: CallDirection, cause: DisconnectCause) -> CallHandle {
        let snapshot = CallSnapshot::new(
            self.registry.allocate_id(),
            CallKind::TopLevel,
            CallVariant::default(),
            direction,
        );
        self.fail_detached(snapshot, cause)
    }

    // ---------------------------------------------------------------------
    // Outgoing
    // ---------------------------------------------------------------------

    /// Place a call
    pub fn create_outgoing(self: &Arc<Self>, request: OutgoingRequest) -> CallHandle {
        let destination = match parse_destination(request.address.as_deref()) {
            Ok(destination) => destination,
            Err(err) => {
                return self.fail_unrouted(CallDirection::Outgoing, cause_for_parse_error(&err))
            }
        };

        let emergency = match &destination {
            Destination::Number(number) => {
                request.emergency
                    || is_emergency_number(number, &self.config.router.emergency_numbers)
            }
            Destination::Voicemail => false,
        };

        let line = if emergency {
            select_emergency_line(
                &self.lines.statuses(),
                self.config.router.default_voice_line,
                self.config.router.primary_line,
            )
            .and_then(|id| self.lines.get(id))
        } else {
            self.resolve_line(request.account.as_ref(), None)
        };
        let Some(line) = line else {
            return self.fail_unrouted(
                CallDirection::Outgoing,
                DisconnectCause::new(DisconnectCode::OutgoingFailure, "no line available"),
            );
        };

        let mut snapshot = self.base_snapshot(&line, CallDirection::Outgoing);
        let number = match destination {
            Destination::Number(number) => number,
            Destination::Voicemail => {
                let number = line
                    .voicemail_number()
                    .map(|n| strip_separators(&n))
                    .filter(|n| !n.is_empty());
                match number {
                    Some(number) => number,
                    None => {
                        return self.fail_detached(
                            snapshot,
                            DisconnectCause::new(
                                DisconnectCode::VoicemailNumberMissing,
                                format!("{} has no voicemail number", line.id()),
                            ),
                        )
                    }
                }
            }
        };
        snapshot.address = Some(number.clone());

        let service = line.status().service;
        if !emergency {
            if let Some(cause) = service_rejection(service) {
                return self.fail_detached(snapshot, cause);
            }
        }

        info!(
            "{} placing {}call to {} on {}",
            snapshot.id,
            if emergency { "emergency " } else { "" },
            number,
            line.id()
        );
        let handle = spawn_call(&self.registry, &self.lines, line.clone(), snapshot);
        let extras = DialExtras {
            is_emergency: emergency,
            subject: request.subject,
        };

        if emergency && service == ServiceState::PowerOff {
            self.power_on_then_dial(handle.clone(), line, number, request.video_state, extras);
        } else {
            self.place_call(&handle, &line, &number, request.video_state, &extras);
        }
        handle
    }

    /// Run the radio power-on sequence, then dial
    fn power_on_then_dial(
        self: &Arc<Self>,
        handle: CallHandle,
        line: Arc<dyn RadioLine>,
        number: String,
        video_state: VideoState,
        extras: DialExtras,
    ) {
        info!("{} powering on {} before dialing", handle.id(), line.id());
        let powered = line.request_power_on();
        let router = self.clone();
        tokio::spawn(async move {
            match powered.await {
                Ok(true) => {
                    debug!("{} radio up on {}", handle.id(), line.id());
                    router.place_call(&handle, &line, &number, video_state, &extras);
                }
                Ok(false) | Err(_) => {
                    handle.fail(DisconnectCause::new(
                        DisconnectCode::PowerOff,
                        "radio power-on failed",
                    ));
                }
            }
        });
    }

    fn place_call(
        &self,
        handle: &CallHandle,
        line: &Arc<dyn RadioLine>,
        number: &str,
        video_state: VideoState,
        extras: &DialExtras,
    ) {
        match line.dial(number, video_state, extras) {
            Ok(Some(connection)) => self.claim_and_bind(handle, line, connection),
            Ok(None) => {
                handle.fail(DisconnectCause::new(
                    DisconnectCode::OutgoingFailure,
                    "dial produced no connection",
                ));
            }
            Err(err) => {
                warn!("{} dial failed: {}", handle.id(), err);
                handle.fail(cause_for_radio_error(&err));
            }
        }
    }

    /// Record ownership of `connection` before the call's actor sees it, so
    /// no other discovery path can adopt it in between
    fn claim_and_bind(
        &self,
        handle: &CallHandle,
        line: &Arc<dyn RadioLine>,
        connection: Arc<RadioConnection>,
    ) {
        let direction = CallDirection::of_connection(connection.is_incoming());
        match self
            .registry
            .bind_connection(handle.id(), connection.id(), direction)
        {
            Ok(()) => {
                if !handle.bind(connection.clone()) {
                    warn!(
                        "{} closed before {} arrived; hanging it up",
                        handle.id(),
                        connection.id()
                    );
                    let _ = line.hangup(connection.id());
                }
            }
            Err(SyncError::AlreadyBound { owner, .. }) => {
                handle.fail(DisconnectCause::new(
                    DisconnectCode::AlreadyBound,
                    format!("{} already backs {}", connection.id(), owner),
                ));
            }
            Err(err) => {
                // The call went away first; nobody else will own this leg
                debug!("{} not bound: {}", handle.id(), err);
                let _ = line.hangup(connection.id());
            }
        }
    }

    // ---------------------------------------------------------------------
    // Incoming and unknown
    // ---------------------------------------------------------------------

    /// Wrap the ringing connection of a line
    pub fn create_incoming(&self, request: LineRequest) -> CallHandle {
        let Some(line) = self.resolve_line(request.account.as_ref(), request.line) else {
            return self.fail_unrouted(
                CallDirection::Incoming,
                DisconnectCause::new(DisconnectCode::IncomingFailure, "no line for incoming call"),
            );
        };

        let mut snapshot = self.base_snapshot(&line, CallDirection::Incoming);
        let ringing = line.call(CallGroup::Ringing);
        if !ringing.state.is_ringing() {
            return self.fail_detached(
                snapshot,
                DisconnectCause::new(DisconnectCode::Missed, "no ringing call"),
            );
        }

        // A waiting call rings behind the first; it is the one being offered
        let connection = if ringing.state == RadioCallState::Waiting {
            ringing.latest_connection()
        } else {
            ringing.earliest_connection()
        };
        let Some(connection) = connection.cloned() else {
            return self.fail_detached(
                snapshot,
                DisconnectCause::new(DisconnectCode::Missed, "ringing call has no connection"),
            );
        };

        if let Some(owner) = self.registry.owner_of(connection.id()) {
            snapshot.address = connection.address();
            return self.fail_detached(
                snapshot,
                DisconnectCause::new(
                    DisconnectCode::AlreadyBound,
                    format!("{} already backs {}", connection.id(), owner),
                ),
            );
        }

        self.adopt(&line, connection)
    }

    /// Wrap the first connection on a line that no call owns yet
    pub fn create_unknown(&self, request: LineRequest) -> CallHandle {
        let Some(line) = self.resolve_line(request.account.as_ref(), request.line) else {
            return self.fail_unrouted(
                CallDirection::Unknown,
                DisconnectCause::new(DisconnectCode::IncomingFailure, "no line for unknown call"),
            );
        };

        let unbound = CallGroup::ALL
            .iter()
            .flat_map(|group| line.call(*group).connections)
            .find(|c| c.state().is_alive() && !self.registry.is_bound(c.id()));
        match unbound {
            Some(connection) => self.adopt(&line, connection),
            None => {
                let snapshot = self.base_snapshot(&line, CallDirection::Unknown);
                self.fail_detached(
                    snapshot,
                    DisconnectCause::new(
                        DisconnectCode::IncomingFailure,
                        "no unbound connection on line",
                    ),
                )
            }
        }
    }

    /// Start a call around an existing connection
    pub(crate) fn adopt(
        &self,
        line: &Arc<dyn RadioLine>,
        connection: Arc<RadioConnection>,
    ) -> CallHandle {
        let direction = CallDirection::of_connection(connection.is_incoming());
        let mut snapshot = self.base_snapshot(line, direction);
        snapshot.address = connection.address();
        info!(
            "{} adopting {} on {}",
            snapshot.id,
            connection.id(),
            line.id()
        );
        let handle = spawn_call(&self.registry, &self.lines, line.clone(), snapshot);
        self.claim_and_bind(&handle, line, connection);
        handle
    }

    /// Decline the ringing call on a line without creating a facade call
    pub fn reject_incoming(&self, request: LineRequest) -> Result<(), SyncError> {
        let line = self.require_line(&request)?;
        let ringing = line.call(CallGroup::Ringing);
        let Some(connection) = ringing.latest_connection() else {
            return Ok(());
        };
        match line.hangup(connection.id()) {
            Ok(()) | Err(RadioError::AlreadyDisconnected) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    // ---------------------------------------------------------------------
    // Conferences
    // ---------------------------------------------------------------------

    /// Start reconciling the conference anchored on `call`
    pub fn host_conference(self: &Arc<Self>, call: CallId) -> Result<ConferenceHandle, SyncError> {
        let snapshot = self
            .registry
            .snapshot(call)
            .ok_or(SyncError::CallNotFound(call))?;
        if let CallKind::ConferenceHost(conference) = snapshot.kind {
            return Err(SyncError::AlreadyHosting(conference));
        }
        let (line, connection) = self.wrapped_connection(&snapshot)?;

        let id = ConferenceId(self.next_conference.fetch_add(1, Ordering::Relaxed));
        let ctx = ConferenceContext {
            registry: self.registry.clone(),
            participants: self.participants.clone(),
            line,
            max_pending: self.config.max_pending_participants,
        };
        let (handle, retired) = spawn_conference(id, &snapshot, connection, ctx);
        self.conferences.insert(id, handle.clone());
        info!("{} hosting {}", call, id);

        let router = Arc::downgrade(self);
        tokio::spawn(watch_retirement(router, id, retired));
        Ok(handle)
    }

    /// Merge the line's active and held calls, then host the result on `call`
    pub fn merge_conference(self: &Arc<Self>, call: CallId) -> Result<ConferenceHandle, SyncError> {
        let snapshot = self
            .registry
            .snapshot(call)
            .ok_or(SyncError::CallNotFound(call))?;
        let (line, _) = self.wrapped_connection(&snapshot)?;
        line.conference()?;
        self.host_conference(call)
    }

    fn wrapped_connection(
        &self,
        snapshot: &CallSnapshot,
    ) -> Result<(Arc<dyn RadioLine>, Arc<RadioConnection>), SyncError> {
        let connection = snapshot.connection.ok_or(SyncError::NotBound(snapshot.id))?;
        let line_id = snapshot.line.ok_or(SyncError::NotBound(snapshot.id))?;
        let line = self
            .lines
            .get(line_id)
            .ok_or(SyncError::LineNotFound(line_id))?;
        let connection = CallGroup::ALL
            .iter()
            .flat_map(|group| line.call(*group).connections)
            .find(|c| c.id() == connection)
            .ok_or(SyncError::NotBound(snapshot.id))?;
        Ok((line, connection))
    }
}

impl std::fmt::Debug for ConnectionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRouter")
            .field("lines", &self.lines)
            .field("registry", &self.registry)
            .field("conferences", &self.conferences.len())
            .finish()
    }
}

/// Turn a retired conference host back into an ordinary call
async fn watch_retirement(
    router: Weak<ConnectionRouter>,
    conference: ConferenceId,
    retired: tokio::sync::oneshot::Receiver<HostRetired>,
) {
    let outcome = retired.await;
    let Some(router) = router.upgrade() else {
        return;
    };
    router.conferences.remove(&conference);
    if let Ok(HostRetired { host, .. }) = outcome {
        info!("{} re-hosting {} as an ordinary call", conference, host);
        router.registry.send(host, CallCommand::Rehost);
    }
}

/// Pick the line for an emergency call; `None` only without lines
pub fn select_emergency_line(
    lines: &[LineStatus],
    default_voice: Option<LineId>,
    primary: Option<LineId>,
) -> Option<LineId> {
    let mut ordered: Vec<LineStatus> = lines.to_vec();
    ordered.sort_by_key(|s| (s.index, s.id));

    let usable = |s: &LineStatus| s.service.can_place_emergency();
    let is_default = |s: &LineStatus| Some(s.id) == default_voice;

    if let Some(line) = ordered.iter().find(|s| usable(s) && is_default(s)) {
        return Some(line.id);
    }
    if let Some(line) = ordered.iter().find(|s| usable(s)) {
        return Some(line.id);
    }

    let provisioned: Vec<&LineStatus> = ordered
        .iter()
        .filter(|s| s.sim_ready && s.subscription_active)
        .collect();
    if let Some(line) = provisioned
        .iter()
        .find(|s| is_default(s))
        .or_else(|| provisioned.first())
    {
        return Some(line.id);
    }

    ordered
        .iter()
        .find(|s| Some(s.id) == primary)
        .or_else(|| ordered.iter().find(|s| s.index == 0))
        .or_else(|| ordered.first())
        .map(|s| s.id)
}

pub fn cause_for_parse_error(err: &ParseError) -> DisconnectCause {
    let code = match err {
        ParseError::MissingAddress | ParseError::EmptyNumber => {
            DisconnectCode::NoPhoneNumberSupplied
        }
        ParseError::UnsupportedScheme(_) => DisconnectCode::InvalidNumber,
    };
    DisconnectCause::new(code, err.to_string())
}

pub fn cause_for_radio_error(err: &RadioError) -> DisconnectCause {
    let code = match err {
        RadioError::RadioOff => DisconnectCode::PowerOff,
        RadioError::AlreadyDisconnected
        | RadioError::InvalidState(_)
        | RadioError::NotSupported(_)
        | RadioError::DialRejected(_) => DisconnectCode::OutgoingFailure,
    };
    DisconnectCause::new(code, err.to_string())
}

/// Cause for refusing a non-emergency call in `service`, if any
pub fn service_rejection(service: ServiceState) -> Option<DisconnectCause> {
    let (code, reason) = match service {
        ServiceState::InService => return None,
        ServiceState::OutOfService => (DisconnectCode::OutOfService, "line out of service"),
        ServiceState::EmergencyOnly => (DisconnectCode::OutOfService, "line is emergency only"),
        ServiceState::PowerOff => (DisconnectCode::PowerOff, "radio is powered off"),
        ServiceState::Unknown => (DisconnectCode::OutgoingFailure, "line state unknown"),
    };
    Some(DisconnectCause::new(code, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::StaticAccountResolver;
    use std::time::Duration;
    use tel_protocol::{FacadeState, LineFamily};
    use tel_sim::{LineCommand, VirtualLine, VirtualLineConfig};
    use tokio::time::timeout;

    fn status(id: u32, service: ServiceState) -> LineStatus {
        LineStatus {
            id: LineId(id),
            index: id,
            service,
            sim_ready: true,
            subscription_active: true,
        }
    }

    fn router_with(lines: &[Arc<VirtualLine>]) -> (Arc<ConnectionRouter>, mpsc::UnboundedReceiver<FacadeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let accounts = Arc::new(StaticAccountResolver::new(
            lines.iter().map(|l| l.status().id),
        ));
        let router = ConnectionRouter::new(SyncConfig::default(), accounts, tx);
        for line in lines {
            router.attach_line(line.clone());
        }
        (router, rx)
    }

    async fn settle(call: &CallHandle, state: FacadeState) {
        timeout(Duration::from_secs(2), call.wait_for_state(state))
            .await
            .expect("timed out")
            .expect("call closed first");
    }

    #[test]
    fn test_emergency_prefers_usable_default() {
        let lines = [status(0, ServiceState::InService), status(1, ServiceState::EmergencyOnly)];
        assert_eq!(select_emergency_line(&lines, Some(LineId(1)), None), Some(LineId(1)));
    }

    #[test]
    fn test_emergency_skips_unusable_default() {
        let lines = [status(0, ServiceState::OutOfService), status(1, ServiceState::InService)];
        assert_eq!(select_emergency_line(&lines, Some(LineId(0)), None), Some(LineId(1)));
    }

    #[test]
    fn test_emergency_falls_back_to_provisioned() {
        let mut unprovisioned = status(0, ServiceState::OutOfService);
        unprovisioned.sim_ready = false;
        let lines = [unprovisioned, status(1, ServiceState::PowerOff), status(2, ServiceState::OutOfService)];
        assert_eq!(select_emergency_line(&lines, Some(LineId(2)), None), Some(LineId(2)));
        assert_eq!(select_emergency_line(&lines, None, None), Some(LineId(1)));
    }

    #[test]
    fn test_emergency_falls_back_to_primary() {
        let mut a = status(0, ServiceState::PowerOff);
        a.sim_ready = false;
        let mut b = status(1, ServiceState::PowerOff);
        b.subscription_active = false;
        assert_eq!(select_emergency_line(&[a, b], None, Some(LineId(1))), Some(LineId(1)));
        assert_eq!(select_emergency_line(&[b, a], None, None), Some(LineId(0)));
        assert_eq!(select_emergency_line(&[], None, None), None);
    }

    #[test]
    fn test_cause_mapping() {
        assert_eq!(
            cause_for_parse_error(&ParseError::MissingAddress).code,
            DisconnectCode::NoPhoneNumberSupplied
        );
        assert_eq!(
            cause_for_parse_error(&ParseError::UnsupportedScheme("sip".into())).code,
            DisconnectCode::InvalidNumber
        );
        assert_eq!(
            cause_for_radio_error(&RadioError::RadioOff).code,
            DisconnectCode::PowerOff
        );
        assert_eq!(service_rejection(ServiceState::InService), None);
        assert_eq!(
            service_rejection(ServiceState::EmergencyOnly).unwrap().code,
            DisconnectCode::OutOfService
        );
        assert_eq!(
            service_rejection(ServiceState::Unknown).unwrap().code,
            DisconnectCode::OutgoingFailure
        );
    }

    #[tokio::test]
    async fn test_outgoing_dials_resolved_line() {
        let l0 = VirtualLine::in_service(0);
        let l1 = VirtualLine::in_service(1);
        let (router, _events) = router_with(&[l0.clone(), l1.clone()]);

        let call = router.create_outgoing(
            OutgoingRequest::new("tel:555-0100")
                .with_account(StaticAccountResolver::handle_for(LineId(1))),
        );
        settle(&call, FacadeState::Dialing).await;

        assert!(l0.commands().is_empty());
        assert!(matches!(
            &l1.commands()[..],
            [LineCommand::Dial { number, emergency: false, .. }] if number == "5550100"
        ));
        let snapshot = call.snapshot();
        assert_eq!(snapshot.line, Some(LineId(1)));
        assert_eq!(snapshot.account, Some(StaticAccountResolver::handle_for(LineId(1))));
    }

    #[tokio::test]
    async fn test_rejections_are_terminal_calls() {
        let line = VirtualLine::in_service(0);
        let (router, _events) = router_with(&[line.clone()]);

        let missing = router.create_outgoing(OutgoingRequest {
            address: None,
            ..OutgoingRequest::new("")
        });
        assert_eq!(missing.state(), FacadeState::Destroyed);
        assert_eq!(
            missing.disconnect_cause().unwrap().code,
            DisconnectCode::NoPhoneNumberSupplied
        );

        let sip = router.create_outgoing(OutgoingRequest::new("sip:bob@example.com"));
        assert_eq!(sip.disconnect_cause().unwrap().code, DisconnectCode::InvalidNumber);

        let voicemail = router.create_outgoing(OutgoingRequest::new("voicemail:"));
        assert_eq!(
            voicemail.disconnect_cause().unwrap().code,
            DisconnectCode::VoicemailNumberMissing
        );

        line.set_service(ServiceState::OutOfService);
        let out = router.create_outgoing(OutgoingRequest::new("tel:100"));
        assert_eq!(out.disconnect_cause().unwrap().code, DisconnectCode::OutOfService);
        assert!(line.commands().is_empty());
        assert!(router.registry().snapshots().is_empty());
    }

    #[tokio::test]
    async fn test_voicemail_alias_resolves() {
        let line = VirtualLine::new(VirtualLineConfig {
            voicemail_number: Some("+1 (555) 000".to_string()),
            ..Default::default()
        });
        let (router, _events) = router_with(&[line.clone()]);

        let call = router.create_outgoing(OutgoingRequest::new("voicemail:"));
        settle(&call, FacadeState::Dialing).await;
        assert_eq!(call.snapshot().address.as_deref(), Some("+1555000"));
    }

    #[tokio::test]
    async fn test_dial_failures() {
        let line = VirtualLine::in_service(0);
        let (router, _events) = router_with(&[line.clone()]);

        line.set_dial_returns_none();
        let none = router.create_outgoing(OutgoingRequest::new("tel:100"));
        settle(&none, FacadeState::Destroyed).await;
        assert_eq!(none.disconnect_cause().unwrap().code, DisconnectCode::OutgoingFailure);

        line.set_dial_error(RadioError::DialRejected("barred".into()));
        let rejected = router.create_outgoing(OutgoingRequest::new("tel:100"));
        settle(&rejected, FacadeState::Destroyed).await;
        assert_eq!(
            rejected.disconnect_cause().unwrap().code,
            DisconnectCode::OutgoingFailure
        );
    }

    #[tokio::test]
    async fn test_emergency_powers_on_first() {
        let line = VirtualLine::in_service(0);
        line.set_service(ServiceState::PowerOff);
        let (router, _events) = router_with(&[line.clone()]);

        let call = router.create_outgoing(OutgoingRequest::new("tel:112"));
        settle(&call, FacadeState::Dialing).await;
        assert!(matches!(
            &line.commands()[..],
            [LineCommand::PowerOn, LineCommand::Dial { emergency: true, .. }]
        ));
    }

    #[tokio::test]
    async fn test_incoming_picks_waiting_connection() {
        let line = VirtualLine::in_service(0);
        let (router, _events) = router_with(&[line.clone()]);

        let first = line.ring("100");
        let call = router.create_incoming(LineRequest::for_line(LineId(0)));
        settle(&call, FacadeState::Ringing).await;
        assert_eq!(call.snapshot().connection, Some(first.id()));

        call.answer(VideoState::AudioOnly).await.unwrap();
        settle(&call, FacadeState::Active).await;

        let waiting = line.ring("200");
        let second = router.create_incoming(LineRequest::for_line(LineId(0)));
        settle(&second, FacadeState::Ringing).await;
        assert_eq!(second.snapshot().connection, Some(waiting.id()));
        assert_eq!(second.snapshot().direction, CallDirection::Incoming);
    }

    #[tokio::test]
    async fn test_incoming_failures() {
        let line = VirtualLine::in_service(0);
        let (router, _events) = router_with(&[line.clone()]);

        let missed = router.create_incoming(LineRequest::for_line(LineId(0)));
        assert_eq!(missed.disconnect_cause().unwrap().code, DisconnectCode::Missed);

        let nowhere = router.create_incoming(LineRequest::for_line(LineId(7)));
        assert_eq!(
            nowhere.disconnect_cause().unwrap().code,
            DisconnectCode::IncomingFailure
        );

        line.ring("100");
        let call = router.create_incoming(LineRequest::for_line(LineId(0)));
        settle(&call, FacadeState::Ringing).await;
        let duplicate = router.create_incoming(LineRequest::for_line(LineId(0)));
        assert_eq!(
            duplicate.disconnect_cause().unwrap().code,
            DisconnectCode::AlreadyBound
        );
        assert_eq!(call.state(), FacadeState::Ringing);
    }

    #[tokio::test]
    async fn test_unknown_scans_for_unbound() {
        let line = VirtualLine::in_service(0);
        let (router, _events) = router_with(&[line.clone()]);

        let empty = router.create_unknown(LineRequest::for_line(LineId(0)));
        assert_eq!(empty.disconnect_cause().unwrap().code, DisconnectCode::IncomingFailure);

        let outgoing = router.create_outgoing(OutgoingRequest::new("tel:100"));
        settle(&outgoing, FacadeState::Dialing).await;
        let ringing = line.ring("200");

        let unknown = router.create_unknown(LineRequest::for_line(LineId(0)));
        settle(&unknown, FacadeState::Ringing).await;
        assert_eq!(unknown.snapshot().connection, Some(ringing.id()));
    }

    #[tokio::test]
    async fn test_legacy_line_builds_legacy_call() {
        let line = VirtualLine::new(VirtualLineConfig {
            family: LineFamily::LegacyCircuit,
            ..Default::default()
        });
        let (router, _events) = router_with(&[line.clone()]);

        let call = router.create_outgoing(OutgoingRequest::new("tel:100"));
        settle(&call, FacadeState::Dialing).await;
        assert_eq!(call.snapshot().variant, CallVariant::LegacyCircuit);
    }

    #[tokio::test]
    async fn test_host_conference_once() {
        let line = VirtualLine::in_service(0);
        let (router, _events) = router_with(&[line.clone()]);

        let first = router.create_outgoing(OutgoingRequest::new("tel:100"));
        settle(&first, FacadeState::Dialing).await;
        line.remote_answer(first.snapshot().connection.unwrap());
        let second = router.create_outgoing(OutgoingRequest::new("tel:200"));
        settle(&second, FacadeState::Dialing).await;
        line.remote_answer(second.snapshot().connection.unwrap());
        settle(&second, FacadeState::Active).await;

        let conference = router.merge_conference(second.id()).unwrap();
        assert_eq!(conference.host(), second.id());
        assert!(router.conference(conference.id()).is_some());
        assert_eq!(
            router.host_conference(second.id()).unwrap_err(),
            SyncError::AlreadyHosting(conference.id())
        );
        assert_eq!(line.count_commands(|c| matches!(c, LineCommand::Conference)), 1);
    }

    #[tokio::test]
    async fn test_deflect_ringing_call() {
        let line = VirtualLine::in_service(0);
        let (router, _events) = router_with(&[line.clone()]);

        line.ring("100");
        let call = router.create_incoming(LineRequest::for_line(LineId(0)));
        settle(&call, FacadeState::Ringing).await;

        call.deflect("+1 555 9999").await.unwrap();
        settle(&call, FacadeState::Destroyed).await;
        assert_eq!(
            line.count_commands(|c| matches!(c, LineCommand::Deflect(n) if n == "+1 555 9999")),
            1
        );
        assert_eq!(call.disconnect_cause().unwrap().code, DisconnectCode::Local);
    }

    #[tokio::test]
    async fn test_reject_incoming_without_call() {
        let line = VirtualLine::in_service(0);
        let (router, _events) = router_with(&[line.clone()]);

        let ringing = line.ring("100");
        router.reject_incoming(LineRequest::for_line(LineId(0))).unwrap();
        assert_eq!(ringing.state(), RadioCallState::Disconnected);
        assert!(router.registry().snapshots().is_empty());

        // Nothing left to reject
        router.reject_incoming(LineRequest::for_line(LineId(0))).unwrap();
        assert_eq!(
            router.reject_incoming(LineRequest::for_line(LineId(7))),
            Err(SyncError::LineNotFound(LineId(7)))
        );
    }

    #[tokio::test]
    async fn test_reject_incoming_by_account() {
        let line = VirtualLine::in_service(0);
        let (router, _events) = router_with(&[line.clone()]);

        let ringing = line.ring("100");
        let account = StaticAccountResolver::handle_for(LineId(0));
        router.reject_incoming(LineRequest::for_account(account)).unwrap();
        assert_eq!(ringing.state(), RadioCallState::Disconnected);

        let unknown = AccountHandle::new("line-5");
        assert_eq!(
            router.reject_incoming(LineRequest::for_account(unknown.clone())),
            Err(SyncError::AccountNotFound(unknown))
        );

        let (empty, _events) = router_with(&[]);
        assert_eq!(
            empty.reject_incoming(LineRequest::default()),
            Err(SyncError::NoLines)
        );
    }

    #[tokio::test]
    async fn test_replace_line_moves_watcher() {
        let old = VirtualLine::in_service(0);
        let (router, _events) = router_with(&[old.clone()]);

        let new = VirtualLine::in_service(0);
        let previous = router.replace_line(new.clone()).unwrap();
        assert_eq!(previous.id(), LineId(0));
        assert_eq!(router.lines().len(), 1);

        old.inject_unknown("100", true, RadioCallState::Active);
        new.inject_unknown("200", true, RadioCallState::Active);
        timeout(Duration::from_secs(2), async {
            while router.registry().snapshots().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let calls = router.registry().snapshots();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].address.as_deref(), Some("200"));
    }
}
