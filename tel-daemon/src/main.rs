//! Telsync Daemon
//!
//! Runs the call synchronization engine headless against simulated radio
//! lines and logs every facade event.

mod scenario;
mod settings;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use scenario::Scenario;
use settings::Settings;
use tel_protocol::RadioLine;
use tel_sim::VirtualLine;
use tel_sync::{ConnectionRouter, FacadeEvent, StaticAccountResolver};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "telsync=info,tel_protocol=info,tel_sync=info,tel_sim=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting telsync");

    let settings = Settings::load();
    if let Some(path) = Settings::settings_path() {
        debug!("settings: {}", path.display());
    }

    let lines: Vec<Arc<VirtualLine>> = settings
        .lines
        .iter()
        .cloned()
        .map(VirtualLine::new)
        .collect();

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let accounts = Arc::new(StaticAccountResolver::new(lines.iter().map(|l| l.id())));
    let router = ConnectionRouter::new(settings.engine.clone(), accounts, events_tx);
    for line in &lines {
        info!("attaching {} ({:?})", line.id(), line.status().service);
        router.attach_line(line.clone());
    }

    let logger = tokio::spawn(log_events(events_rx));

    if settings.run_scenario {
        Scenario::new(router.clone(), lines.clone()).run().await?;
        info!("scenario complete");
    } else {
        info!("waiting for ctrl-c");
        tokio::signal::ctrl_c().await?;
    }

    for line in &lines {
        router.detach_line(line.id());
    }
    drop(router);
    // Calls still winding down keep the event channel open
    match timeout(Duration::from_millis(500), logger).await {
        Ok(Err(e)) => warn!("event logger failed: {}", e),
        Ok(Ok(())) => {}
        Err(_) => debug!("event stream still open at exit"),
    }
    Ok(())
}

async fn log_events(mut events: mpsc::UnboundedReceiver<FacadeEvent>) {
    while let Some(event) = events.recv().await {
        match &event {
            FacadeEvent::Error { .. } => warn!("{:?}", event),
            e if e.is_lifecycle() || e.is_conference() => info!("{:?}", event),
            _ => debug!("{:?}", event),
        }
    }
}
