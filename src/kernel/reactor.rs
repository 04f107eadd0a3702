use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event::{Event, SystemEvent};
use super::fusion::FusionEngine;
use super::snapshot::WorldModel;
use super::time::{Tick, Timestamp};
use crate::error::FusionError;

/// What the driver must do after a step. The step itself never touches a channel.
#[derive(Debug, Clone)]
pub enum SideEffect {
    Publish(Arc<WorldModel>),
    Emit(SystemEvent),
}

/// Single-writer driver around the fusion engine.
///
/// Everything that mutates the world arrives on `receiver` and is applied in
/// arrival order, one batch per cycle. Readers only ever see the `Arc`
/// snapshots pushed through the watch channel.
pub struct Reactor {
    pub receiver: mpsc::Receiver<Event>,
    pub engine: FusionEngine,
    pub tick: Tick,
    snapshots: watch::Sender<Arc<WorldModel>>,
    events: mpsc::Sender<SystemEvent>,
}

impl Reactor {
    pub fn new(
        receiver: mpsc::Receiver<Event>,
        engine: FusionEngine,
        snapshots: watch::Sender<Arc<WorldModel>>,
        events: mpsc::Sender<SystemEvent>,
    ) -> Self {
        Self {
            receiver,
            engine,
            tick: Tick::new(),
            snapshots,
            events,
        }
    }

    /// Pure step: apply one batch of mailbox events at `now`, close the cycle and
    /// return the side effects. MUST NOT await.
    ///
    /// The tick is advanced at the very start; every reduction in the batch
    /// happens in the context of the new tick.
    pub fn tick_step(&mut self, now: Timestamp, events: Vec<Event>) -> Vec<SideEffect> {
        self.tick = self.tick.next();
        self.engine.set_tick(self.tick);
        let count = events.len();

        // === 1. REDUCE (arrival order) ===
        for event in events {
            match event {
                Event::Observation(obs) => {
                    if let Err(e) = self.engine.ingest(obs, now) {
                        match e {
                            FusionError::MalformedObservation { .. } | FusionError::CameraQuarantined { .. } => {
                                debug!("Observation rejected: {}", e)
                            }
                            _ => debug!("Observation dropped: {}", e),
                        }
                    }
                }
                Event::CameraStatus { camera_id, liveness, at } => {
                    self.engine.set_camera_liveness(&camera_id, liveness, at.max(now));
                }
                Event::Acknowledge { camera_id } => {
                    if !self.engine.acknowledge(&camera_id, now) {
                        info!("Acknowledge for '{}' ignored: not quarantined", camera_id);
                    }
                }
                Event::ZonesReloaded(zones) => {
                    // Rejection is reported as a SystemEvent by the engine.
                    let _ = self.engine.replace_zones(zones, now);
                }
            }
        }

        // === 2. LIFECYCLE ===
        self.engine.end_cycle(now);
        self.engine.record_cycle(self.tick, count);

        // === 3. EMIT ===
        let mut effects: Vec<SideEffect> = self
            .engine
            .take_events()
            .into_iter()
            .map(SideEffect::Emit)
            .collect();
        effects.push(SideEffect::Publish(self.engine.snapshot(now)));
        effects
    }

    /// Async driver loop. Returns when cancelled or when every mailbox sender is gone.
    pub async fn run(mut self, cycle: Duration, cancel: CancellationToken) -> FusionEngine {
        info!("Fusion reactor started. Cycle: {}ms", cycle.as_millis());

        let mut cadence = interval(cycle);
        cadence.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Fusion reactor cancelled at tick {}", self.tick.frame);
                    break;
                }
                _ = cadence.tick() => {}
            }

            let mut events: Vec<Event> = Vec::new();
            let mut closed = false;
            loop {
                match self.receiver.try_recv() {
                    Ok(event) => events.push(event),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        closed = true;
                        break;
                    }
                }
            }

            let effects = self.tick_step(Timestamp::now(), events);
            self.apply(effects);

            if closed {
                info!("Fusion mailbox closed; reactor stopping");
                break;
            }
        }

        self.engine
    }

    /// Hand side effects to the channels without awaiting. Events that do not
    /// fit in the queue are counted in telemetry.
    pub fn apply(&mut self, effects: Vec<SideEffect>) {
        for effect in effects {
            match effect {
                SideEffect::Publish(model) => {
                    self.snapshots.send_replace(model);
                }
                SideEffect::Emit(event) => match self.events.try_send(event) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(event)) => {
                        warn!("System event queue full; dropping {:?} from {}", event.kind, event.source);
                        self.engine.record_event_dropped(&event);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                },
            }
        }
    }
}
