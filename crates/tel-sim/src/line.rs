//! Virtual radio line
//!
//! A [`VirtualLine`] keeps the three call groups of a real line and answers
//! the engine's commands the way a modem would. The network side is driven
//! explicitly from tests (`ring`, `remote_answer`, `remote_hangup`, ...).
//! Every command the engine issues is recorded as a [`LineCommand`].

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tel_protocol::{
    CallGroup, ConnectionEventKind, ConnectionId, ConnectionSnapshot, DialExtras,
    DisconnectCause, DisconnectCode, LineEvent, LineFamily, LineId, LineStatus,
    ParticipantInfo, RadioCall, RadioCallState, RadioConnection, RadioError, RadioLine,
    RadioTech, RequestTag, ServiceState, SubscriberList, Subscription, VideoState,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Configuration for creating a virtual line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualLineConfig {
    pub id: LineId,
    /// Slot index used by emergency line selection
    pub index: u32,
    pub family: LineFamily,
    pub service: ServiceState,
    pub sim_ready: bool,
    pub subscription_active: bool,
    pub voicemail_number: Option<String>,
    /// Result reported by the power-on sequence
    pub power_on_succeeds: bool,
}

impl Default for VirtualLineConfig {
    fn default() -> Self {
        Self {
            id: LineId(0),
            index: 0,
            family: LineFamily::Standard,
            service: ServiceState::InService,
            sim_ready: true,
            subscription_active: true,
            voicemail_number: None,
            power_on_succeeds: true,
        }
    }
}

/// A radio command received by a virtual line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineCommand {
    Dial {
        number: String,
        video_state: VideoState,
        emergency: bool,
    },
    Hangup(ConnectionId),
    SwitchHoldingAndActive,
    Conference,
    AddParticipant {
        host: ConnectionId,
        address: String,
        tag: RequestTag,
    },
    Accept(VideoState),
    Deflect(String),
    SetLocalCallHold(bool),
    PowerOn,
}

#[derive(Debug)]
struct LineInner {
    status: LineStatus,
    voicemail_number: Option<String>,
    foreground: Vec<Arc<RadioConnection>>,
    background: Vec<Arc<RadioConnection>>,
    ringing: Vec<Arc<RadioConnection>>,
    next_connection: u64,
    commands: Vec<LineCommand>,
    pending_adds: Vec<(ConnectionId, RequestTag)>,
    dial_error: Option<RadioError>,
    dial_returns_none: bool,
    hangup_error: Option<RadioError>,
    power_on_succeeds: bool,
    local_call_hold: bool,
}

impl LineInner {
    fn group(&self, group: CallGroup) -> &Vec<Arc<RadioConnection>> {
        match group {
            CallGroup::Foreground => &self.foreground,
            CallGroup::Background => &self.background,
            CallGroup::Ringing => &self.ringing,
        }
    }

    fn group_mut(&mut self, group: CallGroup) -> &mut Vec<Arc<RadioConnection>> {
        match group {
            CallGroup::Foreground => &mut self.foreground,
            CallGroup::Background => &mut self.background,
            CallGroup::Ringing => &mut self.ringing,
        }
    }

    /// Drop terminated legs from every group
    fn prune(&mut self) {
        for group in CallGroup::ALL {
            self.group_mut(group).retain(|c| c.state().is_alive());
        }
    }

    fn find(&self, id: ConnectionId) -> Option<Arc<RadioConnection>> {
        CallGroup::ALL
            .iter()
            .flat_map(|g| self.group(*g).iter())
            .find(|c| c.id() == id)
            .cloned()
    }

    fn has_live_call(&self) -> bool {
        !self.foreground.is_empty() || !self.background.is_empty()
    }

    fn allocate_id(&mut self) -> ConnectionId {
        self.next_connection += 1;
        ConnectionId(((self.status.id.as_u32() as u64) << 32) | self.next_connection)
    }
}

/// A simulated radio line implementing [`RadioLine`]
#[derive(Debug)]
pub struct VirtualLine {
    family: LineFamily,
    inner: Mutex<LineInner>,
    events: Arc<SubscriberList<LineEvent>>,
}

impl VirtualLine {
    /// Create a line from configuration
    pub fn new(config: VirtualLineConfig) -> Arc<Self> {
        Arc::new(Self {
            family: config.family,
            inner: Mutex::new(LineInner {
                status: LineStatus {
                    id: config.id,
                    index: config.index,
                    service: config.service,
                    sim_ready: config.sim_ready,
                    subscription_active: config.subscription_active,
                },
                voicemail_number: config.voicemail_number,
                foreground: Vec::new(),
                background: Vec::new(),
                ringing: Vec::new(),
                next_connection: 0,
                commands: Vec::new(),
                pending_adds: Vec::new(),
                dial_error: None,
                dial_returns_none: false,
                hangup_error: None,
                power_on_succeeds: config.power_on_succeeds,
                local_call_hold: false,
            }),
            events: Arc::new(SubscriberList::new()),
        })
    }

    /// In-service standard line with the given id and index
    pub fn in_service(id: u32) -> Arc<Self> {
        Self::new(VirtualLineConfig {
            id: LineId(id),
            index: id,
            ..Default::default()
        })
    }

    // ---------------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------------

    /// Commands received so far, oldest first
    pub fn commands(&self) -> Vec<LineCommand> {
        self.inner.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.inner.lock().commands.clear();
    }

    /// Number of recorded commands matching `pred`
    pub fn count_commands(&self, pred: impl Fn(&LineCommand) -> bool) -> usize {
        self.inner.lock().commands.iter().filter(|c| pred(c)).count()
    }

    pub fn local_call_hold(&self) -> bool {
        self.inner.lock().local_call_hold
    }

    /// Look up a live connection on any group
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<RadioConnection>> {
        self.inner.lock().find(id)
    }

    // ---------------------------------------------------------------------
    // Fault injection
    // ---------------------------------------------------------------------

    pub fn set_service(&self, service: ServiceState) {
        self.inner.lock().status.service = service;
    }

    /// Make the next dial fail with `error`
    pub fn set_dial_error(&self, error: RadioError) {
        self.inner.lock().dial_error = Some(error);
    }

    /// Make the next dial succeed without producing a connection
    pub fn set_dial_returns_none(&self) {
        self.inner.lock().dial_returns_none = true;
    }

    /// Make the next hangup fail with `error`
    pub fn set_hangup_error(&self, error: RadioError) {
        self.inner.lock().hangup_error = Some(error);
    }

    pub fn set_power_on_result(&self, succeeds: bool) {
        self.inner.lock().power_on_succeeds = succeeds;
    }

    // ---------------------------------------------------------------------
    // Network side
    // ---------------------------------------------------------------------

    /// Present an incoming call from `number`
    ///
    /// The call is WAITING when another call is already up, INCOMING otherwise.
    pub fn ring(&self, number: &str) -> Arc<RadioConnection> {
        let (conn, waiting) = {
            let mut inner = self.inner.lock();
            inner.prune();
            let waiting = inner.has_live_call();
            let state = if waiting {
                RadioCallState::Waiting
            } else {
                RadioCallState::Incoming
            };
            let conn = RadioConnection::new(
                inner.allocate_id(),
                true,
                ConnectionSnapshot::new(state, number),
            );
            inner.ringing.push(conn.clone());
            (conn, waiting)
        };

        info!("{} ringing from {} ({})", self.id(), number, conn.id());
        if waiting {
            self.events.publish(LineEvent::CallWaiting(conn.clone()));
        } else {
            self.events
                .publish(LineEvent::NewRingingConnection(conn.clone()));
        }
        self.events.publish(LineEvent::PreciseCallStateChanged);
        conn
    }

    /// Announce a connection nobody requested, placed in the foreground
    pub fn inject_unknown(&self, number: &str, incoming: bool, state: RadioCallState) -> Arc<RadioConnection> {
        let conn = {
            let mut inner = self.inner.lock();
            let conn = RadioConnection::new(
                inner.allocate_id(),
                incoming,
                ConnectionSnapshot::new(state, number),
            );
            inner.foreground.push(conn.clone());
            conn
        };
        self.events.publish(LineEvent::UnknownConnection(conn.clone()));
        conn
    }

    /// Far end picks up an outgoing call
    pub fn remote_answer(&self, id: ConnectionId) {
        if let Some(conn) = self.connection(id) {
            conn.set_state(RadioCallState::Active);
            self.events.publish(LineEvent::PreciseCallStateChanged);
        }
    }

    /// Far end is alerting
    pub fn remote_alerting(&self, id: ConnectionId) {
        if let Some(conn) = self.connection(id) {
            conn.set_state(RadioCallState::Alerting);
        }
    }

    /// Far end hangs up
    pub fn remote_hangup(&self, id: ConnectionId, code: DisconnectCode) {
        let conn = {
            let mut inner = self.inner.lock();
            let conn = inner.find(id);
            if let Some(conn) = &conn {
                conn.disconnect(DisconnectCause::new(code, "remote hangup"));
            }
            inner.prune();
            conn
        };
        if conn.is_some() {
            self.events.publish(LineEvent::PreciseCallStateChanged);
        }
    }

    /// Move a connection to another radio technology
    pub fn handover(&self, id: ConnectionId, technology: RadioTech) {
        if let Some(conn) = self.connection(id) {
            conn.set_technology(technology);
            self.events.publish(LineEvent::HandoverStateChanged {
                connection: id,
                technology,
            });
        }
    }

    /// Deliver a conference membership snapshot on `host`
    pub fn publish_conference(&self, host: ConnectionId, participants: Vec<ParticipantInfo>) {
        if let Some(conn) = self.connection(host) {
            conn.publish(ConnectionEventKind::ConferenceSnapshot(participants));
        }
    }

    /// Answer the oldest outstanding add-participant request
    pub fn respond_add_participant(&self, success: bool) -> Option<RequestTag> {
        let (host, tag) = {
            let mut inner = self.inner.lock();
            if inner.pending_adds.is_empty() {
                return None;
            }
            let (host, tag) = inner.pending_adds.remove(0);
            (inner.find(host), tag)
        };
        if let Some(host) = host {
            host.publish(ConnectionEventKind::AddParticipantResponse { tag, success });
        }
        Some(tag)
    }

    /// Publish an arbitrary line event
    pub fn emit(&self, event: LineEvent) {
        self.events.publish(event);
    }
}

impl RadioLine for VirtualLine {
    fn id(&self) -> LineId {
        self.inner.lock().status.id
    }

    fn status(&self) -> LineStatus {
        self.inner.lock().status
    }

    fn family(&self) -> LineFamily {
        self.family
    }

    fn voicemail_number(&self) -> Option<String> {
        self.inner.lock().voicemail_number.clone()
    }

    fn call(&self, group: CallGroup) -> RadioCall {
        let inner = self.inner.lock();
        let connections: Vec<_> = inner
            .group(group)
            .iter()
            .filter(|c| c.state().is_alive())
            .cloned()
            .collect();
        match connections.first() {
            Some(first) => RadioCall {
                group,
                state: first.state(),
                connections,
            },
            None => RadioCall::idle(group),
        }
    }

    fn dial(
        &self,
        number: &str,
        video_state: VideoState,
        extras: &DialExtras,
    ) -> Result<Option<Arc<RadioConnection>>, RadioError> {
        let mut inner = self.inner.lock();
        inner.commands.push(LineCommand::Dial {
            number: number.to_string(),
            video_state,
            emergency: extras.is_emergency,
        });

        if inner.status.service == ServiceState::PowerOff {
            return Err(RadioError::RadioOff);
        }
        if let Some(err) = inner.dial_error.take() {
            return Err(err);
        }
        if std::mem::take(&mut inner.dial_returns_none) {
            return Ok(None);
        }

        inner.prune();
        if !inner.foreground.is_empty() && !inner.background.is_empty() {
            return Err(RadioError::InvalidState("no free call slot".to_string()));
        }
        let held = std::mem::take(&mut inner.foreground);
        for conn in &held {
            conn.set_state(RadioCallState::Holding);
        }
        inner.background.extend(held);

        let mut snapshot = ConnectionSnapshot::new(RadioCallState::Dialing, number);
        snapshot.video_state = video_state;
        let conn = RadioConnection::new(inner.allocate_id(), false, snapshot);
        inner.foreground.push(conn.clone());
        drop(inner);

        debug!("{} dialing {} as {}", self.id(), number, conn.id());
        self.events.publish(LineEvent::PreciseCallStateChanged);
        Ok(Some(conn))
    }

    fn hangup(&self, connection: ConnectionId) -> Result<(), RadioError> {
        let mut inner = self.inner.lock();
        inner.commands.push(LineCommand::Hangup(connection));

        let conn = inner
            .find(connection)
            .filter(|c| c.state().is_alive())
            .ok_or(RadioError::AlreadyDisconnected)?;
        if let Some(err) = inner.hangup_error.take() {
            return Err(err);
        }
        conn.disconnect(DisconnectCause::new(DisconnectCode::Local, ""));
        inner.prune();
        drop(inner);

        self.events.publish(LineEvent::PreciseCallStateChanged);
        Ok(())
    }

    fn switch_holding_and_active(&self) -> Result<(), RadioError> {
        let mut inner = self.inner.lock();
        inner.commands.push(LineCommand::SwitchHoldingAndActive);
        inner.prune();
        if !inner.has_live_call() {
            return Err(RadioError::InvalidState("no call to switch".to_string()));
        }

        let LineInner {
            foreground,
            background,
            ..
        } = &mut *inner;
        std::mem::swap(foreground, background);
        for conn in foreground.iter() {
            conn.set_state(RadioCallState::Active);
        }
        for conn in background.iter() {
            conn.set_state(RadioCallState::Holding);
        }
        drop(inner);

        self.events.publish(LineEvent::PreciseCallStateChanged);
        Ok(())
    }

    fn conference(&self) -> Result<(), RadioError> {
        let mut inner = self.inner.lock();
        inner.commands.push(LineCommand::Conference);
        inner.prune();
        if inner.foreground.is_empty() || inner.background.is_empty() {
            return Err(RadioError::InvalidState(
                "conference needs an active and a held call".to_string(),
            ));
        }

        let held = std::mem::take(&mut inner.background);
        inner.foreground.extend(held);
        for conn in &inner.foreground {
            conn.set_state(RadioCallState::Active);
        }
        drop(inner);

        self.events.publish(LineEvent::PreciseCallStateChanged);
        Ok(())
    }

    fn add_participant(
        &self,
        host: ConnectionId,
        address: &str,
        tag: RequestTag,
    ) -> Result<(), RadioError> {
        let mut inner = self.inner.lock();
        inner.commands.push(LineCommand::AddParticipant {
            host,
            address: address.to_string(),
            tag,
        });
        if inner.find(host).map_or(true, |c| !c.state().is_alive()) {
            return Err(RadioError::InvalidState(format!("no live host {}", host)));
        }
        inner.pending_adds.push((host, tag));
        Ok(())
    }

    fn accept(&self, video_state: VideoState) -> Result<(), RadioError> {
        let mut inner = self.inner.lock();
        inner.commands.push(LineCommand::Accept(video_state));
        inner.prune();
        if inner.ringing.is_empty() {
            return Err(RadioError::InvalidState("no ringing call".to_string()));
        }
        if !inner.background.is_empty() && !inner.foreground.is_empty() {
            return Err(RadioError::InvalidState("no free call slot".to_string()));
        }

        let held = std::mem::take(&mut inner.foreground);
        for conn in &held {
            conn.set_state(RadioCallState::Holding);
        }
        inner.background.extend(held);

        let answered = inner.ringing.remove(0);
        answered.update(|s| s.video_state = video_state);
        answered.set_state(RadioCallState::Active);
        inner.foreground.push(answered);
        drop(inner);

        self.events.publish(LineEvent::PreciseCallStateChanged);
        Ok(())
    }

    fn deflect(&self, number: &str) -> Result<(), RadioError> {
        let mut inner = self.inner.lock();
        inner.commands.push(LineCommand::Deflect(number.to_string()));
        inner.prune();
        if inner.ringing.is_empty() {
            return Err(RadioError::InvalidState("no ringing call".to_string()));
        }
        let deflected = inner.ringing.remove(0);
        deflected.disconnect(DisconnectCause::new(
            DisconnectCode::Local,
            format!("deflected to {}", number),
        ));
        drop(inner);

        self.events.publish(LineEvent::PreciseCallStateChanged);
        Ok(())
    }

    fn set_local_call_hold(&self, hold: bool) {
        let mut inner = self.inner.lock();
        inner.commands.push(LineCommand::SetLocalCallHold(hold));
        inner.local_call_hold = hold;
    }

    fn request_power_on(&self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        let succeeded = {
            let mut inner = self.inner.lock();
            inner.commands.push(LineCommand::PowerOn);
            if inner.power_on_succeeds {
                inner.status.service = ServiceState::InService;
            }
            inner.power_on_succeeds
        };
        info!("{} power-on requested, success={}", self.id(), succeeded);
        let _ = tx.send(succeeded);
        rx
    }

    fn subscribe(&self, tx: mpsc::UnboundedSender<LineEvent>) -> Subscription {
        SubscriberList::subscribe(&self.events, tx)
    }
}
