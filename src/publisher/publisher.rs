use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::sink::{BusMessage, BusSink};
use crate::config::PublisherConfig;
use crate::error::FusionError;
use crate::kernel::event::{Observation, Severity, SystemEvent, SystemEventKind};
use crate::kernel::snapshot::WorldModel;
use crate::kernel::time::Timestamp;
use crate::navigation::GuidanceCommand;

const SOURCE: &str = "publisher";

/// Bounded exponential backoff between delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PublisherConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Wait before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PublisherStats {
    pub published: u64,
    pub failed: u64,
    pub retries: u64,
    pub snapshots: u64,
    pub last_generation: Option<u64>,
}

/// Channels the publisher drains.
pub struct PublisherInputs {
    pub snapshots: watch::Receiver<Arc<WorldModel>>,
    pub guidance: mpsc::Receiver<GuidanceCommand>,
    pub events: mpsc::Receiver<SystemEvent>,
    pub observations: mpsc::Receiver<Observation>,
}

/// Puts snapshots, guidance and events on the bus.
///
/// Snapshots go out at a fixed rate and only the latest one counts; a slow bus
/// skips generations instead of queueing them. Guidance and events are relayed
/// one by one. Delivery failures never reach the fusion core: after too many
/// consecutive failed publications the publisher halts on its own.
pub struct Publisher<S: BusSink> {
    sink: S,
    config: PublisherConfig,
    retry: RetryPolicy,
    consecutive_failures: u32,
    stats: PublisherStats,
}

impl<S: BusSink> Publisher<S> {
    pub fn new(sink: S, config: PublisherConfig) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config),
            sink,
            config,
            consecutive_failures: 0,
            stats: PublisherStats::default(),
        }
    }

    pub fn stats(&self) -> PublisherStats {
        self.stats
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_halted(&self) -> bool {
        self.consecutive_failures >= self.config.fatal_after_failures.max(1)
    }

    /// Deliver one message, retrying with backoff. The failure counter tracks
    /// whole publications, not individual attempts.
    pub async fn publish(&mut self, message: &BusMessage) -> Result<(), FusionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.sink.publish(message).await {
                Ok(()) => {
                    self.stats.published += 1;
                    self.consecutive_failures = 0;
                    return Ok(());
                }
                Err(e) if attempt < self.retry.max_attempts => {
                    self.stats.retries += 1;
                    let delay = self.retry.delay(attempt);
                    debug!(
                        "{} on '{}' failed (attempt {}): {}; retrying in {}ms",
                        message.kind(),
                        self.sink.name(),
                        attempt,
                        e,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                }
                Err(source) => {
                    self.stats.failed += 1;
                    self.consecutive_failures += 1;
                    let err = FusionError::BusPublishFailure {
                        attempts: attempt,
                        source,
                    };
                    warn!("{} dropped: {}", message.kind(), err);
                    return Err(err);
                }
            }
        }
    }

    /// Publish the latest snapshot if it is newer than the last one sent.
    pub async fn publish_snapshot(&mut self, model: Arc<WorldModel>) -> Result<bool, FusionError> {
        if self.stats.last_generation.is_some_and(|g| g >= model.generation) {
            return Ok(false);
        }
        let generation = model.generation;
        // A dropped snapshot is superseded by the next one, so it still counts as handled.
        self.stats.last_generation = Some(generation);
        self.publish(&BusMessage::WorldModelSnapshot(model)).await?;
        self.stats.snapshots += 1;
        Ok(true)
    }

    /// Single best-effort attempt to tell the bus the publisher is giving up.
    async fn announce_halt(&mut self) -> SystemEvent {
        let event = SystemEvent::new(
            SystemEventKind::PublisherHalted,
            Severity::Critical,
            SOURCE,
            format!(
                "{} consecutive publications failed on '{}'",
                self.consecutive_failures,
                self.sink.name()
            ),
            Timestamp::now(),
        );
        let _ = self.sink.publish(&BusMessage::SystemEvent(event.clone())).await;
        event
    }

    /// Publisher task. Returns its stats on shutdown, or the `PublisherHalted`
    /// event when the bus stayed unreachable.
    pub async fn run(mut self, mut inputs: PublisherInputs, cancel: CancellationToken) -> Result<PublisherStats, SystemEvent> {
        let rate = if self.config.snapshot_rate_hz > 0.0 {
            self.config.snapshot_rate_hz
        } else {
            1.0
        };
        let period = Duration::from_secs_f64(1.0 / rate);
        info!("Publisher started on '{}'. Snapshots every {}ms", self.sink.name(), period.as_millis());

        let mut cadence = interval(period);
        cadence.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut guidance_open = true;
        let mut events_open = true;
        let mut observations_open = true;

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = cadence.tick() => {
                    let model = inputs.snapshots.borrow_and_update().clone();
                    self.publish_snapshot(model).await.map(|_| ())
                }
                command = inputs.guidance.recv(), if guidance_open => match command {
                    Some(command) => self.publish(&BusMessage::GuidanceCommand(command)).await,
                    None => {
                        guidance_open = false;
                        Ok(())
                    }
                },
                event = inputs.events.recv(), if events_open => match event {
                    Some(event) => self.publish(&BusMessage::SystemEvent(event)).await,
                    None => {
                        events_open = false;
                        Ok(())
                    }
                },
                obs = inputs.observations.recv(), if observations_open => match obs {
                    Some(obs) => self.publish(&BusMessage::Observation(obs)).await,
                    None => {
                        observations_open = false;
                        Ok(())
                    }
                },
            };

            if outcome.is_err() && self.is_halted() {
                error!(
                    "Publisher halting after {} consecutive failures; fusion continues without a bus",
                    self.consecutive_failures
                );
                return Err(self.announce_halt().await);
            }
        }

        info!("Publisher stopped: {:?}", self.stats);
        Ok(self.stats)
    }
}
