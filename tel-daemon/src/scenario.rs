//! Scripted call scenario
//!
//! Plays the network side of a few typical calls against the simulated lines
//! so the engine's behavior can be followed in the log.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tel_protocol::{
    DisconnectCode, FacadeState, ParticipantInfo, ParticipantState, RadioLine, RadioTech,
    ServiceState, VideoState,
};
use tel_sim::VirtualLine;
use tel_sync::{
    CallHandle, CallKind, ConnectionRouter, LineRequest, OutgoingRequest, StaticAccountResolver,
};
use tokio::time::{sleep, timeout};
use tracing::info;

const STEP_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Scenario {
    router: Arc<ConnectionRouter>,
    lines: Vec<Arc<VirtualLine>>,
}

impl Scenario {
    pub fn new(router: Arc<ConnectionRouter>, lines: Vec<Arc<VirtualLine>>) -> Self {
        Self { router, lines }
    }

    pub async fn run(&self) -> Result<()> {
        if self.lines.len() < 2 {
            bail!("the scenario needs two lines, {} configured", self.lines.len());
        }

        let first = self.place_and_answer(0, "tel:+1 555 0100").await?;
        let second = self.place_and_answer(1, "tel:+15550200").await?;
        reach(&first, FacadeState::Holding).await?;
        info!("{} moved to HOLDING behind {}", first.id(), second.id());

        second.hangup().await?;
        reach(&second, FacadeState::Destroyed).await?;
        if first.unhold().await? {
            reach(&first, FacadeState::Active).await?;
        }

        self.conference(&first).await?;
        first.hangup().await?;
        reach(&first, FacadeState::Destroyed).await?;

        self.incoming(1).await?;
        self.emergency(0).await?;
        Ok(())
    }

    fn line(&self, index: usize) -> &Arc<VirtualLine> {
        &self.lines[index]
    }

    async fn place_and_answer(&self, index: usize, address: &str) -> Result<CallHandle> {
        let line = self.line(index);
        let request =
            OutgoingRequest::new(address).with_account(StaticAccountResolver::handle_for(line.id()));
        let call = self.router.create_outgoing(request);
        let snapshot = reach(&call, FacadeState::Dialing).await?;
        let connection = snapshot
            .connection
            .context("dialing call has no connection")?;

        line.remote_alerting(connection);
        line.remote_answer(connection);
        reach(&call, FacadeState::Active).await?;
        info!("{} to {} answered", call.id(), address);
        Ok(call)
    }

    async fn conference(&self, host: &CallHandle) -> Result<()> {
        let line = self.line(0);
        let conference = self.router.host_conference(host.id())?;
        let connection = host
            .snapshot()
            .connection
            .context("conference host has no connection")?;

        line.publish_conference(
            connection,
            vec![
                ParticipantInfo::new("sip:+15550101@ims", ParticipantState::Active),
                ParticipantInfo::new("sip:+15550102@ims", ParticipantState::Active),
            ],
        );
        conference.add_participant("tel:+15550103").await?;
        line.respond_add_participant(true);
        line.publish_conference(
            connection,
            vec![
                ParticipantInfo::new("sip:+15550101@ims", ParticipantState::Active),
                ParticipantInfo::new("sip:+15550102@ims", ParticipantState::Holding),
                ParticipantInfo::new("sip:+15550103@ims", ParticipantState::Active),
            ],
        );

        let summary = conference.summary().await?;
        info!(
            "{} has {} participants, manageable={}",
            summary.id,
            summary.participants.len(),
            summary.can_manage
        );

        // Single radio voice call continuity
        line.handover(connection, RadioTech::Circuit);
        timeout(STEP_TIMEOUT, host.wait_until(|s| s.kind == CallKind::TopLevel))
            .await
            .context("conference host was never re-hosted")??;
        info!("{} continues as an ordinary call", host.id());
        Ok(())
    }

    async fn incoming(&self, index: usize) -> Result<()> {
        let line = self.line(index);
        line.ring("+15550400");
        let call = self
            .router
            .create_incoming(LineRequest::for_line(line.id()));
        reach(&call, FacadeState::Ringing).await?;

        call.answer(VideoState::AudioOnly).await?;
        let snapshot = reach(&call, FacadeState::Active).await?;
        let connection = snapshot
            .connection
            .context("answered call has no connection")?;

        line.remote_hangup(connection, DisconnectCode::Normal);
        reach(&call, FacadeState::Destroyed).await?;
        info!(
            "{} ended by the remote party: {:?}",
            call.id(),
            call.disconnect_cause()
        );
        Ok(())
    }

    async fn emergency(&self, index: usize) -> Result<()> {
        let line = self.line(index);
        line.set_service(ServiceState::PowerOff);

        let call = self.router.create_outgoing(OutgoingRequest::new("tel:112"));
        let snapshot = reach(&call, FacadeState::Dialing).await?;
        info!("emergency call placed on {:?}", snapshot.line);

        call.hangup().await?;
        reach(&call, FacadeState::Destroyed).await?;
        // Let the event logger catch up
        sleep(Duration::from_millis(50)).await;
        Ok(())
    }
}

async fn reach(call: &CallHandle, state: FacadeState) -> Result<tel_sync::CallSnapshot> {
    let snapshot = timeout(STEP_TIMEOUT, call.wait_for_state(state))
        .await
        .with_context(|| format!("{} never reached {}", call.id(), state.name()))??;
    Ok(snapshot)
}
