//! Shared radio connection objects and event subscriptions
//!
//! A [`RadioConnection`] is owned by the radio layer. The radio layer mutates
//! it through the `set_*`/`update`/`publish` methods, which also deliver a
//! [`ConnectionEvent`] to every subscriber. Consumers only read snapshots.
//!
//! Subscribing registers the sender end of a channel and returns a
//! [`Subscription`]; dropping the subscription removes the sender, so no
//! further events can reach the consumer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::trace;

use crate::cause::DisconnectCause;
use crate::state::{
    AudioQuality, ParticipantState, Presentation, RadioCallState, RadioTech, VideoCapability,
    VideoState,
};
use crate::{ConnectionId, EndpointKey, RequestTag};

/// Guard for a registered event sender
///
/// Dropping the guard unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unsubscribe explicitly
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Registered event senders for one event source
pub struct SubscriberList<T> {
    next_id: AtomicU64,
    senders: Mutex<Vec<(u64, mpsc::UnboundedSender<T>)>>,
}

impl<T: Clone + Send + 'static> SubscriberList<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Register a sender; the returned guard removes it again
    pub fn subscribe(list: &Arc<Self>, tx: mpsc::UnboundedSender<T>) -> Subscription {
        let id = list.next_id.fetch_add(1, Ordering::Relaxed);
        list.senders.lock().push((id, tx));

        let weak = Arc::downgrade(list);
        Subscription::new(move || {
            if let Some(list) = weak.upgrade() {
                list.senders.lock().retain(|(sid, _)| *sid != id);
            }
        })
    }

    /// Deliver an event to every live subscriber, pruning closed ones
    pub fn publish(&self, event: T) {
        self.senders
            .lock()
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    /// Number of registered senders
    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + 'static> Default for SubscriberList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SubscriberList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberList")
            .field("len", &self.senders.lock().len())
            .finish()
    }
}

/// One entry of a conference membership snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub key: EndpointKey,
    pub display_name: Option<String>,
    pub state: ParticipantState,
}

impl ParticipantInfo {
    pub fn new(key: impl Into<String>, state: ParticipantState) -> Self {
        Self {
            key: EndpointKey::new(key),
            display_name: None,
            state,
        }
    }
}

/// What changed on a radio connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEventKind {
    /// The connection's call-group state changed
    StateChanged(RadioCallState),
    /// Address, name, video or audio fields changed; re-read the snapshot
    Updated,
    /// Full conference membership as reported by the network
    ConferenceSnapshot(Vec<ParticipantInfo>),
    /// The backing radio technology changed (handover)
    TechnologyChanged(RadioTech),
    /// Response to an add-participant request
    AddParticipantResponse { tag: RequestTag, success: bool },
}

/// Event published by a radio connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvent {
    pub connection: ConnectionId,
    pub kind: ConnectionEventKind,
}

/// Readable fields of a radio connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub state: RadioCallState,
    pub address: Option<String>,
    pub presentation: Presentation,
    pub caller_name: Option<String>,
    pub local_video: VideoCapability,
    pub remote_video: VideoCapability,
    pub video_state: VideoState,
    pub video_provider: Option<String>,
    pub audio_quality: AudioQuality,
    pub technology: RadioTech,
    pub voice_privacy: bool,
    pub disconnect_cause: Option<DisconnectCause>,
}

impl ConnectionSnapshot {
    /// Snapshot for a new leg to or from `address`
    pub fn new(state: RadioCallState, address: impl Into<String>) -> Self {
        Self {
            state,
            address: Some(address.into()),
            presentation: Presentation::Allowed,
            caller_name: None,
            local_video: VideoCapability::NONE,
            remote_video: VideoCapability::NONE,
            video_state: VideoState::AudioOnly,
            video_provider: None,
            audio_quality: AudioQuality::Standard,
            technology: RadioTech::Ims,
            voice_privacy: false,
            disconnect_cause: None,
        }
    }
}

/// The atomic network leg of a call
pub struct RadioConnection {
    id: ConnectionId,
    incoming: bool,
    snapshot: RwLock<ConnectionSnapshot>,
    subscribers: Arc<SubscriberList<ConnectionEvent>>,
}

impl RadioConnection {
    /// Create a connection owned by the radio layer
    pub fn new(id: ConnectionId, incoming: bool, snapshot: ConnectionSnapshot) -> Arc<Self> {
        Arc::new(Self {
            id,
            incoming,
            snapshot: RwLock::new(snapshot),
            subscribers: Arc::new(SubscriberList::new()),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    /// Copy of the current fields
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.read().clone()
    }

    pub fn state(&self) -> RadioCallState {
        self.snapshot.read().state
    }

    pub fn address(&self) -> Option<String> {
        self.snapshot.read().address.clone()
    }

    pub fn technology(&self) -> RadioTech {
        self.snapshot.read().technology
    }

    pub fn disconnect_cause(&self) -> Option<DisconnectCause> {
        self.snapshot.read().disconnect_cause.clone()
    }

    /// Register for change events on this connection
    pub fn subscribe(&self, tx: mpsc::UnboundedSender<ConnectionEvent>) -> Subscription {
        SubscriberList::subscribe(&self.subscribers, tx)
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    // ---------------------------------------------------------------------
    // Radio-layer side
    // ---------------------------------------------------------------------

    /// Change the call-group state; publishes only on an actual change
    pub fn set_state(&self, state: RadioCallState) {
        {
            let mut snapshot = self.snapshot.write();
            if snapshot.state == state {
                return;
            }
            snapshot.state = state;
        }
        self.publish(ConnectionEventKind::StateChanged(state));
    }

    /// Record the cause and move to DISCONNECTED
    pub fn disconnect(&self, cause: DisconnectCause) {
        self.snapshot.write().disconnect_cause = Some(cause);
        self.set_state(RadioCallState::Disconnected);
    }

    /// Mutate descriptive fields and publish `Updated`
    pub fn update(&self, f: impl FnOnce(&mut ConnectionSnapshot)) {
        f(&mut self.snapshot.write());
        self.publish(ConnectionEventKind::Updated);
    }

    /// Change the backing technology and publish the handover
    pub fn set_technology(&self, technology: RadioTech) {
        {
            let mut snapshot = self.snapshot.write();
            if snapshot.technology == technology {
                return;
            }
            snapshot.technology = technology;
        }
        self.publish(ConnectionEventKind::TechnologyChanged(technology));
    }

    /// Deliver an event to every subscriber
    pub fn publish(&self, kind: ConnectionEventKind) {
        trace!("{} publishing {:?}", self.id, kind);
        self.subscribers.publish(ConnectionEvent {
            connection: self.id,
            kind,
        });
    }
}

impl fmt::Debug for RadioConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot.read();
        f.debug_struct("RadioConnection")
            .field("id", &self.id)
            .field("incoming", &self.incoming)
            .field("state", &snapshot.state)
            .field("address", &snapshot.address)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing(address: &str) -> Arc<RadioConnection> {
        RadioConnection::new(
            ConnectionId(1),
            false,
            ConnectionSnapshot::new(RadioCallState::Dialing, address),
        )
    }

    #[tokio::test]
    async fn test_subscriber_receives_state_change() {
        let conn = outgoing("+15551234");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = conn.subscribe(tx);

        conn.set_state(RadioCallState::Active);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.connection, ConnectionId(1));
        assert_eq!(
            event.kind,
            ConnectionEventKind::StateChanged(RadioCallState::Active)
        );
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let conn = outgoing("+15551234");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = conn.subscribe(tx);
        assert_eq!(conn.subscriber_count(), 1);

        drop(sub);
        assert_eq!(conn.subscriber_count(), 0);

        conn.set_state(RadioCallState::Active);
        // The only sender lived in the subscriber list, so the channel is closed
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_same_state_is_not_republished() {
        let conn = outgoing("+15551234");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = conn.subscribe(tx);

        conn.set_state(RadioCallState::Dialing);
        assert!(rx.try_recv().is_err());

        conn.set_state(RadioCallState::Alerting);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_disconnect_records_cause() {
        let conn = outgoing("+15551234");
        conn.disconnect(DisconnectCause::normal());
        assert_eq!(conn.state(), RadioCallState::Disconnected);
        assert_eq!(conn.disconnect_cause(), Some(DisconnectCause::normal()));
    }

    #[test]
    fn test_subscriber_list_debug_shows_count() {
        let list: Arc<SubscriberList<u32>> = Arc::new(SubscriberList::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let _sub = SubscriberList::subscribe(&list, tx);
        assert_eq!(format!("{:?}", list), "SubscriberList { len: 1 }");
    }
}
