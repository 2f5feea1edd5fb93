//! Unknown-connection notifier
//!
//! Watches one line for connections nobody asked the router for. An
//! unsolicited outgoing connection is usually the network's view of a call
//! that is still being placed locally; those are swapped into the matching
//! facade call instead of creating a duplicate.

use std::sync::{Arc, Weak};

use tel_protocol::address::same_number;
use tel_protocol::{LineEvent, LineId, RadioConnection, RadioLine, Subscription};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::events::FacadeEvent;
use crate::router::ConnectionRouter;
use crate::state::CallDirection;

/// Keeps a line watcher running; dropping it stops the watcher
#[derive(Debug)]
pub struct NotifierHandle {
    line: LineId,
    _shutdown: oneshot::Sender<()>,
}

impl NotifierHandle {
    pub fn line(&self) -> LineId {
        self.line
    }
}

/// Start watching `line`
pub(crate) fn spawn_notifier(
    router: Weak<ConnectionRouter>,
    line: Arc<dyn RadioLine>,
) -> NotifierHandle {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    // Subscribed before returning so no event raised after attach is missed
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = line.subscribe(tx);
    let id = line.id();
    tokio::spawn(run_notifier(router, line, rx, subscription, shutdown_rx));
    NotifierHandle {
        line: id,
        _shutdown: shutdown_tx,
    }
}

async fn run_notifier(
    router: Weak<ConnectionRouter>,
    line: Arc<dyn RadioLine>,
    mut rx: mpsc::UnboundedReceiver<LineEvent>,
    _subscription: Subscription,
    mut shutdown: oneshot::Receiver<()>,
) {
    debug!("{} notifier started", line.id());

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            event = rx.recv() => {
                let Some(event) = event else { break; };
                let Some(router) = router.upgrade() else { break; };
                handle_line_event(&router, &line, event).await;
            }
        }
    }
    debug!("{} notifier stopped", line.id());
}

async fn handle_line_event(router: &ConnectionRouter, line: &Arc<dyn RadioLine>, event: LineEvent) {
    match event {
        LineEvent::UnknownConnection(connection) => {
            if router.registry().is_bound(connection.id()) {
                trace!("{} already owned", connection.id());
                return;
            }
            if !swap(router, line.id(), &connection).await {
                router.adopt(line, connection);
            }
        }
        LineEvent::NewRingingConnection(connection) | LineEvent::CallWaiting(connection) => {
            router.registry().emit(FacadeEvent::IncomingCallAvailable {
                line: line.id(),
                account: router.accounts().resolve(line.id()),
                connection: connection.id(),
            });
        }
        LineEvent::SuppServiceNotification { code, number } => {
            debug!("{} supplementary service {} ({:?})", line.id(), code, number);
        }
        LineEvent::HandoverStateChanged {
            connection,
            technology,
        } => {
            debug!("{} {} handed over to {:?}", line.id(), connection, technology);
        }
        LineEvent::RingbackTone { playing } => {
            debug!("{} ringback tone playing={}", line.id(), playing);
        }
        LineEvent::VideoCapabilityChanged { capable } => {
            debug!("{} video capable={}", line.id(), capable);
        }
        LineEvent::PreciseCallStateChanged => {}
    }
}

/// Rebind `connection` into an unconfirmed outgoing call to the same number
///
/// Returns whether a call took it.
async fn swap(router: &ConnectionRouter, line: LineId, connection: &Arc<RadioConnection>) -> bool {
    if connection.is_incoming() {
        return false;
    }
    let Some(address) = connection.address() else {
        return false;
    };

    let candidates = router.registry().live_top_level().into_iter().filter(|call| {
        call.line == Some(line)
            && call.direction == CallDirection::Outgoing
            && call.state.is_unconfirmed()
            && call
                .address
                .as_deref()
                .is_some_and(|a| same_number(a, &address))
    });

    for candidate in candidates {
        let Some(handle) = router.registry().handle(candidate.id) else {
            continue;
        };
        if let Ok(true) = handle.rebind(connection.clone()).await {
            info!(
                "{} swapped onto unsolicited {} for {}",
                candidate.id,
                connection.id(),
                address
            );
            return true;
        }
    }
    false
}
