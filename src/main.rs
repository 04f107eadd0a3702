use aether_fusion::adapter::{AdapterLinks, DetectionAdapter, RawFrame};
use aether_fusion::calibration::{
    CalibrationRecord, CalibrationResolver, CalibrationStore, DirectoryCalibrationStore, MemoryCalibrationStore,
};
use aether_fusion::config::{load_zones, SystemConfig};
use aether_fusion::kernel::event::{CameraId, Event, RobotId};
use aether_fusion::kernel::snapshot::WorldModel;
use aether_fusion::kernel::time::Timestamp;
use aether_fusion::kernel::zone::ZoneId;
use aether_fusion::monitor::HealthMonitor;
use aether_fusion::navigation::{NavigationArbitrator, NavigationControl, RobotGoal};
use aether_fusion::publisher::{JsonLinesSink, Publisher, PublisherInputs};
use aether_fusion::{FusionEngine, Reactor};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// One line of operator / upstream input on stdin.
#[derive(Debug, Deserialize)]
#[serde(tag = "input", rename_all = "snake_case")]
enum NodeInput {
    Frame(RawFrame),
    Goal(RobotGoal),
    ClearGoal { robot_id: RobotId },
    /// A robot acknowledged the guidance built from this snapshot.
    Acknowledge { robot_id: RobotId, model_timestamp: Timestamp },
    Override { zone_id: ZoneId, expires_at: Option<Timestamp> },
    ClearOverride { zone_id: ZoneId },
    /// Operator release of a quarantined camera.
    CameraAck { camera_id: CameraId },
    ReloadZones { path: Option<PathBuf> },
    Calibration(CalibrationRecord),
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: aether-fusion <config.json>")?;
    let config = SystemConfig::load(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    // Stdout carries the bus; logs go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.logging.with_target)
        .with_writer(std::io::stderr)
        .init();
    info!("Fusion node '{}' booting...", config.node_id);

    let cancel = CancellationToken::new();
    let camera_ids: Vec<CameraId> = config.enabled_cameras().map(|c| c.id.clone()).collect();

    // Channels
    let (mailbox_tx, mailbox_rx) = mpsc::channel::<Event>(config.fusion.mailbox_capacity);
    let (events_tx, events_rx) = mpsc::channel(config.publisher.event_queue);
    let (health_tx, health_rx) = mpsc::channel(config.fusion.mailbox_capacity);
    let (guidance_tx, guidance_rx) = mpsc::channel(config.publisher.event_queue);
    let (control_tx, control_rx) = mpsc::channel::<NavigationControl>(64);
    let (tap_tx, tap_rx) = mpsc::channel(config.publisher.event_queue);
    let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(WorldModel::empty(config.zones.clone())));

    // Fusion core
    let mut engine = FusionEngine::new(config.fusion.clone(), config.zones.clone());
    let mut monitor = HealthMonitor::new(config.health.clone());
    let boot = Timestamp::now();
    for camera_id in &camera_ids {
        engine.register_camera(camera_id);
        monitor.register(camera_id, boot);
    }

    // Calibration
    let memory_store = config
        .calibration
        .store_dir
        .is_none()
        .then(|| Arc::new(MemoryCalibrationStore::new()));
    let store: Arc<dyn CalibrationStore> = match (&config.calibration.store_dir, &memory_store) {
        (Some(dir), _) => Arc::new(DirectoryCalibrationStore::new(dir.clone())),
        (None, Some(memory)) => Arc::clone(memory) as Arc<dyn CalibrationStore>,
        (None, None) => Arc::new(MemoryCalibrationStore::new()),
    };
    let mut resolver = CalibrationResolver::new();
    for event in resolver.refresh(store.as_ref(), &camera_ids, boot) {
        let _ = events_tx.try_send(event);
    }

    // Adapters
    let mut frame_inputs: HashMap<CameraId, mpsc::Sender<RawFrame>> = HashMap::new();
    let mut adapter_tasks = Vec::new();
    for camera_id in &camera_ids {
        let (frame_tx, frame_rx) = mpsc::channel(config.adapter.frame_queue);
        frame_inputs.insert(camera_id.clone(), frame_tx);
        let adapter = DetectionAdapter::new(resolver.watch(camera_id), config.adapter.clone());
        let links = AdapterLinks {
            mailbox: mailbox_tx.clone(),
            health: health_tx.clone(),
            events: events_tx.clone(),
            tap: config.publisher.mirror_observations.then(|| tap_tx.clone()),
        };
        adapter_tasks.push(tokio::spawn(adapter.run(frame_rx, links, cancel.clone())));
    }
    drop(health_tx);
    drop(tap_tx);

    let monitor_task = tokio::spawn(monitor.run(health_rx, mailbox_tx.clone(), events_tx.clone(), cancel.clone()));

    let reactor = Reactor::new(mailbox_rx, engine, snapshot_tx, events_tx.clone());
    let cycle = Duration::from_millis(config.fusion.cycle_interval_ms.max(1));
    let reactor_task = tokio::spawn(reactor.run(cycle, cancel.clone()));

    let arbitrator = NavigationArbitrator::new(config.navigation.clone());
    let navigation_task = tokio::spawn(arbitrator.run(
        snapshot_rx.clone(),
        control_rx,
        guidance_tx,
        events_tx.clone(),
        cancel.clone(),
    ));

    let refresh_every = Duration::from_millis(config.calibration.refresh_interval_ms.max(1));
    let calibration_task = tokio::spawn(resolver.run(
        store,
        camera_ids.clone(),
        refresh_every,
        events_tx.clone(),
        cancel.clone(),
    ));

    let publisher = Publisher::new(JsonLinesSink::new(tokio::io::stdout(), "stdout"), config.publisher.clone());
    let publisher_task = tokio::spawn(publisher.run(
        PublisherInputs {
            snapshots: snapshot_rx,
            guidance: guidance_rx,
            events: events_rx,
            observations: tap_rx,
        },
        cancel.clone(),
    ));
    drop(events_tx);

    info!("Fusion node active: {} cameras, {} zones. Press Ctrl+C to stop.", camera_ids.len(), config.zones.len());

    // === INPUT LOOP ===
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received; shutting down");
                break;
            }
            line = lines.next_line(), if stdin_open => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Input closed; running until interrupted");
                stdin_open = false;
                continue;
            }
            Err(e) => {
                error!("Reading input failed: {}", e);
                stdin_open = false;
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let input: NodeInput = match serde_json::from_str(&line) {
            Ok(input) => input,
            Err(e) => {
                warn!("Ignoring unreadable input line: {}", e);
                continue;
            }
        };

        match input {
            NodeInput::Frame(frame) => match frame_inputs.get(&frame.camera_id) {
                Some(tx) => {
                    let _ = tx.send(frame).await;
                }
                None => warn!("Frame for unknown camera '{}' dropped", frame.camera_id),
            },
            NodeInput::Goal(goal) => {
                let _ = control_tx.send(NavigationControl::SetGoal(goal)).await;
            }
            NodeInput::ClearGoal { robot_id } => {
                let _ = control_tx.send(NavigationControl::ClearGoal { robot_id }).await;
            }
            NodeInput::Acknowledge { robot_id, model_timestamp } => {
                let _ = control_tx
                    .send(NavigationControl::Acknowledge { robot_id, model_timestamp })
                    .await;
            }
            NodeInput::Override { zone_id, expires_at } => {
                info!("Operator override for zone '{}'", zone_id);
                let _ = control_tx.send(NavigationControl::Override { zone_id, expires_at }).await;
            }
            NodeInput::ClearOverride { zone_id } => {
                let _ = control_tx.send(NavigationControl::ClearOverride { zone_id }).await;
            }
            NodeInput::CameraAck { camera_id } => {
                let _ = mailbox_tx.send(Event::Acknowledge { camera_id }).await;
            }
            NodeInput::ReloadZones { path } => match path.or_else(|| config.zones_path.clone()) {
                Some(path) => match load_zones(&path) {
                    Ok(zones) => {
                        let _ = mailbox_tx.send(Event::ZonesReloaded(zones)).await;
                    }
                    Err(e) => warn!("Zone reload from {} rejected: {}", path.display(), e),
                },
                None => warn!("Zone reload requested but no zone feed is configured"),
            },
            NodeInput::Calibration(record) => match &memory_store {
                Some(memory) => match memory.insert(&record) {
                    Ok(()) => info!("Calibration for '{}' staged; applied on next refresh", record.camera_id),
                    Err(e) => warn!("Calibration for '{}' not stored: {}", record.camera_id, e),
                },
                None => warn!("Calibration is file-backed; ignoring inline record for '{}'", record.camera_id),
            },
        }
    }

    // === SHUTDOWN ===
    cancel.cancel();
    drop(frame_inputs);
    drop(mailbox_tx);
    drop(control_tx);

    for task in adapter_tasks {
        let stats = task.await.context("adapter task panicked")?;
        info!("Adapter stats: {:?}", stats);
    }
    monitor_task.await.context("health monitor panicked")?;
    navigation_task.await.context("navigation task panicked")?;
    calibration_task.await.context("calibration task panicked")?;
    let engine = reactor_task.await.context("fusion reactor panicked")?;
    info!("Final telemetry: {:?}", engine.telemetry());
    match publisher_task.await.context("publisher panicked")? {
        Ok(stats) => info!("Publisher stats: {:?}", stats),
        Err(halted) => error!("Publisher had halted: {}", halted.message),
    }

    info!("Fusion node stopped");
    Ok(())
}
