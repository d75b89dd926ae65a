//! Periodic runtime-state reports to the server

use std::time::Duration;

use chrono::Utc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::protocol::RuntimeReport;
use crate::registry::PoolRegistry;

use super::agent::ServerAgent;

pub struct RuntimeReporter {
    registry: PoolRegistry,
    agent: ServerAgent,
    period: Duration,
}

impl RuntimeReporter {
    pub fn new(registry: PoolRegistry, agent: ServerAgent, period: Duration) -> Self {
        Self {
            registry,
            agent,
            period,
        }
    }

    /// Send one report per registered pool; returns how many were accepted.
    pub async fn report_all(&self) -> usize {
        let mut sent = 0;
        for handle in self.registry.handles() {
            let report = RuntimeReport {
                group_key: handle.group_key().clone(),
                sample: handle.sample(),
                reported_at: Utc::now(),
            };
            match self.agent.report(&report).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(pool = %report.group_key, "failed to report runtime state: {e}"),
            }
        }
        sent
    }

    #[instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) {
        debug!("starting runtime reporter");
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.report_all().await;
                }
            }
        }
        debug!("runtime reporter stopped");
    }
}
