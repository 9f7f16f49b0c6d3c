//! Background whitelist refresh with a graceful stop.

use crate::{
    access::{AccessGate, RefreshOutcome},
    dedup::TaskDeduplicator,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

pub struct Supervisor {
    gate: Arc<AccessGate>,
    dedup: Arc<TaskDeduplicator>,
    refresh_every: Duration,
    shutdown: watch::Sender<bool>,
    refresher: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(gate: Arc<AccessGate>, dedup: Arc<TaskDeduplicator>, refresh_every: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            gate,
            dedup,
            refresh_every,
            shutdown,
            refresher: None,
        }
    }

    pub fn dedup(&self) -> Arc<TaskDeduplicator> {
        self.dedup.clone()
    }

    /// Starts the refresh loop. The first refresh runs immediately.
    pub fn start(&mut self) {
        if self.refresher.is_some() {
            return;
        }
        let gate = self.gate.clone();
        let every = self.refresh_every;
        let mut stop = self.shutdown.subscribe();
        self.refresher = Some(tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match gate.refresh().await {
                            RefreshOutcome::Replaced { members, reconciled } => {
                                debug!(target = "listing_bot.supervisor", members, reconciled, "whitelist refreshed");
                            }
                            RefreshOutcome::RetainedEmptyPull { retained } => {
                                debug!(target = "listing_bot.supervisor", retained, "empty pull; snapshot kept");
                            }
                            RefreshOutcome::Failed => {
                                warn!(target = "listing_bot.supervisor", "whitelist refresh failed; keeping snapshot");
                            }
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            info!(target = "listing_bot.supervisor", "refresh loop stopped");
        }));
        info!(
            target = "listing_bot.supervisor",
            every_secs = every.as_secs(),
            "refresh loop started"
        );
    }

    /// Stops the loop and waits for pending backup rewrites. In-flight jobs are not cancelled.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.refresher.take()
            && let Err(err) = handle.await
        {
            warn!(target = "listing_bot.supervisor", error = %err, "refresh loop ended abnormally");
        }
        self.gate.flush_backups().await;
        info!(
            target = "listing_bot.supervisor",
            in_flight = self.dedup.in_flight(),
            "supervisor stopped"
        );
    }
}
