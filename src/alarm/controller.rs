//! Alarm actor and its handle

use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, instrument, trace, warn};

use crate::model::{AlarmReceiver, GroupKey};
use crate::registry::PoolRegistry;

use super::limiter::RateLimiter;
use super::notifier::Notifiers;
use super::{AlertPayload, ThresholdKind};

/// Default sampling period
pub const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(5);

/// An alert outside its rate-limit window that still has to be delivered
#[derive(Debug, Clone)]
pub struct PendingAlert {
    pub receivers: BTreeSet<AlarmReceiver>,
    pub payload: AlertPayload,
}

/// Threshold evaluation with its rate-limit and breach bookkeeping.
///
/// Kept apart from the actor so evaluation can be driven with explicit
/// instants.
#[derive(Debug, Default)]
pub struct Evaluator {
    limiter: RateLimiter,
    breached: HashSet<(GroupKey, ThresholdKind)>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate every pool in `registry` as of `now`.
    pub fn evaluate(&mut self, registry: &PoolRegistry, now: Instant) -> Vec<PendingAlert> {
        let mut alerts = Vec::new();
        let handles = registry.handles();

        for handle in &handles {
            let key = handle.group_key();
            let alarm = handle.alarm();
            if !alarm.enabled {
                self.breached.retain(|(k, _)| k != key);
                continue;
            }

            let sample = handle.sample();
            let interval = Duration::from_secs(alarm.interval_secs);
            for (kind, threshold) in [
                (ThresholdKind::Active, alarm.active_threshold_percent),
                (ThresholdKind::Capacity, alarm.capacity_threshold_percent),
            ] {
                let current = kind.percent(&sample);
                let slot = (key.clone(), kind);
                trace!(pool = %key, %kind, current, threshold, "evaluated");

                let recovered = if current >= f64::from(threshold) {
                    self.breached.insert(slot.clone());
                    if !self.limiter.is_open(key, kind, interval, now) {
                        trace!(pool = %key, %kind, "alert suppressed by rate limit");
                        continue;
                    }
                    false
                } else if self.breached.remove(&slot) && alarm.notify_on_recovery {
                    true
                } else {
                    continue;
                };

                alerts.push(PendingAlert {
                    receivers: alarm.receivers.clone(),
                    payload: AlertPayload {
                        group_key: key.clone(),
                        kind,
                        current_percent: current,
                        threshold_percent: threshold,
                        recovered,
                        timestamp: Utc::now(),
                    },
                });
            }
        }

        let live: HashSet<&GroupKey> = handles.iter().map(|h| h.group_key()).collect();
        self.breached.retain(|(k, _)| live.contains(k));
        self.limiter.retain(|k| live.contains(k));
        alerts
    }

    /// Start the rate-limit window of a delivered breach alert.
    pub fn record_sent(&mut self, alert: &PendingAlert, now: Instant) {
        if !alert.payload.recovered {
            self.limiter
                .record(&alert.payload.group_key, alert.payload.kind, now);
        }
    }
}

#[derive(Debug)]
pub enum AlarmCommand {
    /// Run one evaluation cycle now; answers with the number of alerts
    /// delivered to at least one receiver
    EvaluateNow { respond_to: oneshot::Sender<usize> },

    Mute,

    Unmute,

    Shutdown,
}

pub struct AlarmController {
    registry: PoolRegistry,
    notifiers: Notifiers,
    evaluator: Evaluator,
    command_rx: mpsc::Receiver<AlarmCommand>,
    period: Duration,
    muted: bool,
}

impl AlarmController {
    pub fn new(
        registry: PoolRegistry,
        notifiers: Notifiers,
        period: Duration,
        command_rx: mpsc::Receiver<AlarmCommand>,
    ) -> Self {
        Self {
            registry,
            notifiers,
            evaluator: Evaluator::new(),
            command_rx,
            period,
            muted: false,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting alarm controller");
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.muted {
                        self.cycle().await;
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        AlarmCommand::EvaluateNow { respond_to } => {
                            let sent = if self.muted { 0 } else { self.cycle().await };
                            let _ = respond_to.send(sent);
                        }

                        AlarmCommand::Mute => {
                            debug!("muting alarms");
                            self.muted = true;
                        }

                        AlarmCommand::Unmute => {
                            debug!("unmuting alarms");
                            self.muted = false;
                        }

                        AlarmCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("alarm controller stopped");
    }

    /// One evaluation and delivery round. Delivery failures never end it;
    /// an alert no receiver got is retried on the next round.
    async fn cycle(&mut self) -> usize {
        let now = Instant::now();
        let alerts = self.evaluator.evaluate(&self.registry, now);
        let mut sent = 0;
        for alert in alerts {
            debug!("{}", alert.payload.message());
            let delivered = self
                .notifiers
                .deliver(&alert.receivers, &alert.payload)
                .await;
            if delivered > 0 {
                self.evaluator.record_sent(&alert, now);
                sent += 1;
            }
        }
        sent
    }
}

/// Handle for communicating with the alarm controller
#[derive(Clone)]
pub struct AlarmHandle {
    sender: mpsc::Sender<AlarmCommand>,
}

impl AlarmHandle {
    /// Spawn a new alarm controller sampling `registry` every `period`
    pub fn spawn(registry: PoolRegistry, notifiers: Notifiers, period: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let actor = AlarmController::new(registry, notifiers, period, cmd_rx);
        tokio::spawn(actor.run());
        Self { sender: cmd_tx }
    }

    /// Run one cycle immediately; `None` if the controller has stopped.
    pub async fn evaluate_now(&self) -> Option<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AlarmCommand::EvaluateNow { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn mute(&self) {
        let _ = self.sender.send(AlarmCommand::Mute).await;
    }

    pub async fn unmute(&self) {
        let _ = self.sender.send(AlarmCommand::Unmute).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(AlarmCommand::Shutdown).await;
    }
}
