//! System integrator: drives the fixed-period monitoring cycle.
//!
//! [`SystemIntegrator`] is the only writer of [`SystemState`].  Each call to
//! [`run_cycle`](SystemIntegrator::run_cycle) builds the next state from a
//! working copy and swaps it in once it validates; readers only ever see
//! whole snapshots through the `watch` channel.
//!
//! # Cycle flow
//!
//! ```text
//! drain DeliveryReports ──▶ connector health
//! sensor.pull  (timeout) ──┬─ Ok  ──▶ HEALTHY, latest_reading
//!                          └─ Err ──▶ recalibrate + re-pull ──▶ failure bookkeeping
//! voice.pull   (timeout) + subscriber inbox ──▶ commands
//! TaskStateMachine.apply(command)   (rejections reported, never escalated)
//! ModeMachine.evaluate(health)
//! validate + swap state ──▶ watch snapshot
//! DeliverySink.enqueue  (suspended in FALLBACK, periodic probe)
//! BroadcastHub.broadcast
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::adapters::{SensorAdapter, SensorError, VoiceAdapter, VoiceError};
use crate::broadcast::{BroadcastEvent, BroadcastHub};
use crate::config::IntegratorConfig;
use crate::delivery::{
    DeliveryError, DeliveryPayload, DeliveryReports, DeliverySink, DeliveryStatus, EndpointKind,
};
use crate::model::{
    Component, SensorReading, Snapshot, SnapshotReceiver, SystemMode, SystemState, VoiceCommand,
};
use crate::task::{TaskRecord, TaskStateError, TaskStateMachine, TaskStatus};

use super::health::{mark_failure, mark_success};
use super::mode::ModeMachine;

/// Capacity of the subscriber command inbox.
const INBOX_CAPACITY: usize = 64;

/// Extra time allowed for the delivery worker beyond its own grace period.
const WORKER_JOIN_MARGIN: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Errors and reports
// ---------------------------------------------------------------------------

/// Conditions that end the run loop.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FatalError {
    /// The state produced by a cycle broke an invariant.
    #[error("system state corrupted: {0}")]
    CorruptedState(String),

    /// Shutdown was requested while the cycle was suspended.
    #[error("cycle interrupted by shutdown")]
    Cancelled,

    /// The integrator is already in SHUTDOWN.
    #[error("integrator has shut down")]
    ShutDown,
}

/// What one cycle did, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    pub sensor_ok: bool,
    pub commands_processed: usize,
    pub task_errors: Vec<TaskStateError>,
    pub deliveries_enqueued: usize,
    pub events_published: usize,
    pub transition: Option<(SystemMode, SystemMode)>,
}

// ---------------------------------------------------------------------------
// Bounded pulls
// ---------------------------------------------------------------------------

enum Bounded<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

async fn bounded<T>(
    limit: Duration,
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Bounded<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Bounded::Cancelled,
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(value) => Bounded::Done(value),
            Err(_) => Bounded::TimedOut,
        },
    }
}

// ---------------------------------------------------------------------------
// SystemIntegrator
// ---------------------------------------------------------------------------

pub struct SystemIntegrator {
    config: IntegratorConfig,
    sensor: Box<dyn SensorAdapter>,
    voice: Box<dyn VoiceAdapter>,
    delivery: Arc<dyn DeliverySink>,
    reports: DeliveryReports,
    hub: Arc<BroadcastHub>,
    tasks: TaskStateMachine,
    modes: ModeMachine,
    state: SystemState,
    snapshots: watch::Sender<Snapshot>,
    inbox_tx: mpsc::Sender<VoiceCommand>,
    inbox: mpsc::Receiver<VoiceCommand>,
    cancel: CancellationToken,
    delivery_worker: Option<JoinHandle<()>>,
    fallback_cycles: u32,
}

impl SystemIntegrator {
    /// Create an integrator in MONITORING mode.
    ///
    /// * `delivery` / `reports`: the connector handle and its outcome stream.
    /// * `cancel`: shared shutdown signal; cancelling it stops [`run`](Self::run).
    pub fn new(
        config: IntegratorConfig,
        sensor: Box<dyn SensorAdapter>,
        voice: Box<dyn VoiceAdapter>,
        delivery: Arc<dyn DeliverySink>,
        reports: DeliveryReports,
        hub: Arc<BroadcastHub>,
        cancel: CancellationToken,
    ) -> Self {
        let state = SystemState::default();
        let (snapshots, _) = watch::channel(Arc::new(state.clone()));
        let (inbox_tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let modes = ModeMachine::new(config.recovery_confirmation_cycles);

        Self {
            config,
            sensor,
            voice,
            delivery,
            reports,
            hub,
            tasks: TaskStateMachine::new(),
            modes,
            state,
            snapshots,
            inbox_tx,
            inbox,
            cancel,
            delivery_worker: None,
            fallback_cycles: 0,
        }
    }

    /// Await this worker (bounded by the shutdown grace) before `run` returns.
    pub fn with_delivery_worker(mut self, handle: JoinHandle<()>) -> Self {
        self.delivery_worker = Some(handle);
        self
    }

    /// Inbox for commands that did not come from the voice adapter.
    pub fn command_sender(&self) -> mpsc::Sender<VoiceCommand> {
        self.inbox_tx.clone()
    }

    pub fn subscribe_state(&self) -> SnapshotReceiver {
        self.snapshots.subscribe()
    }

    pub fn state(&self) -> &SystemState {
        &self.state
    }

    pub fn tasks(&self) -> &TaskStateMachine {
        &self.tasks
    }

    pub fn shutdown_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request graceful termination.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    /// Run cycles every `cycle_interval` until shutdown or a fatal error.
    /// Returns the final state, in SHUTDOWN mode.
    pub async fn run(mut self) -> SystemState {
        let mut ticker = tokio::time::interval(self.config.cycle_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = self.cancel.clone();

        log::info!(
            "integrator: started, cycle interval {:?}",
            self.config.cycle_interval()
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.run_cycle().await {
                Ok(report) => log_report(&report),
                Err(FatalError::Cancelled) => break,
                Err(e) => {
                    log::error!("integrator: {e}, shutting down");
                    break;
                }
            }
        }

        self.finish().await
    }

    async fn finish(mut self) -> SystemState {
        let from = self.state.mode;
        if from != SystemMode::Shutdown {
            self.state.mode = SystemMode::Shutdown;
            self.hub.broadcast(BroadcastEvent::degraded(
                from,
                SystemMode::Shutdown,
                &self.state.failed_critical(),
            ));
            self.snapshots.send_replace(Arc::new(self.state.clone()));
        }
        log::info!("integrator: entering SHUTDOWN after cycle {}", self.state.cycle);

        // Lets the delivery worker start draining if it shares the token.
        self.cancel.cancel();
        if let Some(worker) = self.delivery_worker.take() {
            let limit = self.config.shutdown_grace() + WORKER_JOIN_MARGIN;
            match tokio::time::timeout(limit, worker).await {
                Ok(Ok(())) => log::info!("integrator: delivery worker drained"),
                Ok(Err(e)) => log::error!("integrator: delivery worker failed: {e}"),
                Err(_) => log::warn!("integrator: delivery worker did not stop within {limit:?}"),
            }
        }

        self.state
    }

    // -----------------------------------------------------------------------
    // One cycle
    // -----------------------------------------------------------------------

    /// Perform exactly one monitoring cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, FatalError> {
        if self.state.mode == SystemMode::Shutdown {
            return Err(FatalError::ShutDown);
        }

        let mut next = self.state.clone();
        next.cycle += 1;
        let mut report = CycleReport {
            cycle: next.cycle,
            ..CycleReport::default()
        };

        // ── 1. Connector outcomes since the previous cycle ────────────────
        self.absorb_delivery_reports(&mut next);

        // ── 2. Sensor, with one local recovery attempt ────────────────────
        let reading = match self.pull_sensor().await? {
            Ok(reading) => {
                mark_success(&mut next.health, Component::Sensor, reading.timestamp());
                next.latest_reading = Some(reading.clone());
                Some(reading)
            }
            Err(e) => {
                mark_failure(
                    &mut next.health,
                    Component::Sensor,
                    self.config.failure_threshold,
                    e.kind(),
                );
                None
            }
        };
        report.sensor_ok = reading.is_some();

        // ── 3. Voice tokens and subscriber commands ──────────────────────
        let mut commands = match self.pull_voice().await? {
            Ok(commands) => {
                mark_success(&mut next.health, Component::Voice, chrono::Utc::now());
                commands
            }
            Err(e) => {
                mark_failure(
                    &mut next.health,
                    Component::Voice,
                    self.config.failure_threshold,
                    e.kind(),
                );
                Vec::new()
            }
        };
        while let Ok(command) = self.inbox.try_recv() {
            commands.push(command);
        }

        // ── 4. Task state machine ────────────────────────────────────────
        let level = next.latest_reading.as_ref().map(SensorReading::value);
        let mut processed: Vec<(VoiceCommand, Option<TaskRecord>)> = Vec::new();
        for command in commands {
            match self.tasks.apply(&command, level) {
                Ok(transition) => {
                    log::info!(
                        "integrator: {} → task {} {:?}",
                        transition.command,
                        transition.task.id(),
                        transition.to
                    );
                    let completed =
                        (transition.to == TaskStatus::Complete).then_some(transition.task);
                    processed.push((command, completed));
                }
                Err(e) => {
                    log::info!("integrator: command {} rejected: {e}", command.kind());
                    report.task_errors.push(e);
                }
            }
        }
        report.commands_processed = processed.len();
        next.active_task = self.tasks.active().cloned();

        // ── 5. Mode transition ───────────────────────────────────────────
        let previous = next.mode;
        next.mode = self.modes.evaluate(previous, &next.health);
        if next.mode != previous {
            log::warn!(
                "integrator: mode {previous} → {} (failed critical: {:?})",
                next.mode,
                next.failed_critical()
            );
            report.transition = Some((previous, next.mode));
        }

        // ── 6. Swap state and publish the snapshot ───────────────────────
        next.validate().map_err(FatalError::CorruptedState)?;
        self.state = next;
        self.snapshots.send_replace(Arc::new(self.state.clone()));

        // ── 7. Delivery ──────────────────────────────────────────────────
        report.deliveries_enqueued = self.enqueue_deliveries(reading.as_ref(), &processed);

        // ── 8. Broadcast ─────────────────────────────────────────────────
        report.events_published = self.broadcast_cycle(reading.as_ref(), report.transition);

        Ok(report)
    }

    fn absorb_delivery_reports(&mut self, next: &mut SystemState) {
        while let Ok(outcome) = self.reports.try_recv() {
            match outcome.status {
                DeliveryStatus::Delivered => {
                    mark_success(&mut next.health, Component::Connector, chrono::Utc::now());
                }
                DeliveryStatus::Failed => {
                    let kind = outcome.error.as_ref().map_or("unknown", DeliveryError::kind);
                    log::warn!(
                        "integrator: delivery {} to {} failed after {} attempt(s): {}",
                        outcome.task_id,
                        outcome.endpoint,
                        outcome.attempts,
                        outcome
                            .error
                            .as_ref()
                            .map_or_else(|| "unknown error".to_string(), |e| e.to_string())
                    );
                    mark_failure(
                        &mut next.health,
                        Component::Connector,
                        self.config.failure_threshold,
                        kind,
                    );
                }
                DeliveryStatus::Pending | DeliveryStatus::InFlight => {}
            }
        }
    }

    async fn pull_sensor(&mut self) -> Result<Result<SensorReading, SensorError>, FatalError> {
        let error = match self.sensor_once().await? {
            Ok(reading) => return Ok(Ok(reading)),
            Err(error) => error,
        };

        log::warn!(
            "integrator: sensor pull failed ({}): {error}, recalibrating",
            error.kind()
        );
        let recalibrated =
            match bounded(self.config.pull_timeout(), &self.cancel, self.sensor.recalibrate()).await
            {
                Bounded::Done(ok) => ok,
                Bounded::TimedOut => false,
                Bounded::Cancelled => return Err(FatalError::Cancelled),
            };

        if recalibrated {
            self.sensor_once().await
        } else {
            log::warn!("integrator: sensor recalibration failed");
            Ok(Err(error))
        }
    }

    async fn sensor_once(&mut self) -> Result<Result<SensorReading, SensorError>, FatalError> {
        match bounded(self.config.pull_timeout(), &self.cancel, self.sensor.pull()).await {
            Bounded::Done(result) => Ok(result),
            Bounded::TimedOut => Ok(Err(SensorError::Timeout)),
            Bounded::Cancelled => Err(FatalError::Cancelled),
        }
    }

    async fn pull_voice(&mut self) -> Result<Result<Vec<VoiceCommand>, VoiceError>, FatalError> {
        match bounded(self.config.pull_timeout(), &self.cancel, self.voice.pull()).await {
            Bounded::Done(result) => Ok(result),
            Bounded::TimedOut => Ok(Err(VoiceError::Timeout)),
            Bounded::Cancelled => Err(FatalError::Cancelled),
        }
    }

    /// Hand this cycle's outputs to the connector.  Returns how many
    /// payloads were accepted.
    fn enqueue_deliveries(
        &mut self,
        reading: Option<&SensorReading>,
        processed: &[(VoiceCommand, Option<TaskRecord>)],
    ) -> usize {
        let mut payloads = Vec::new();

        if self.state.mode.suspends_delivery() {
            self.fallback_cycles += 1;
            let every = self.config.fallback_recheck_cycles.max(1);
            if self.fallback_cycles % every == 0 {
                if let Some(latest) = &self.state.latest_reading {
                    log::info!("integrator: FALLBACK re-check, probing the connector");
                    payloads.push(DeliveryPayload::reading(latest));
                }
            }
        } else {
            self.fallback_cycles = 0;
            payloads.extend(reading.map(DeliveryPayload::reading));
            payloads.extend(
                processed
                    .iter()
                    .map(|(command, completed)| DeliveryPayload::command(command, completed.as_ref())),
            );
        }

        let mut enqueued = 0;
        for payload in payloads {
            let endpoint = payload.endpoint();
            match self.delivery.enqueue(payload, endpoint) {
                Ok(()) => enqueued += 1,
                Err(e) => log::error!("integrator: could not enqueue {endpoint} payload: {e}"),
            }
        }
        enqueued
    }

    /// Push this cycle's events.  In FALLBACK only the degraded status goes
    /// out.  Returns the number of events broadcast.
    fn broadcast_cycle(
        &self,
        reading: Option<&SensorReading>,
        transition: Option<(SystemMode, SystemMode)>,
    ) -> usize {
        let mut events = Vec::new();
        let mode = self.state.mode;

        if mode != SystemMode::Fallback {
            events.extend(reading.map(BroadcastEvent::reading));
            events.push(BroadcastEvent::state_update(&self.state));
        }
        if transition.is_some() || mode == SystemMode::Fallback {
            let from = transition.map_or(mode, |(from, _)| from);
            events.push(BroadcastEvent::degraded(
                from,
                mode,
                &self.state.failed_critical(),
            ));
        }

        let count = events.len();
        for event in events {
            self.hub.broadcast(event);
        }
        count
    }
}

fn log_report(report: &CycleReport) {
    log::debug!(
        "integrator: cycle {} sensor_ok={} commands={} rejected={} enqueued={} events={}",
        report.cycle,
        report.sensor_ok,
        report.commands_processed,
        report.task_errors.len(),
        report.deliveries_enqueued,
        report.events_published
    );
    if !report.sensor_ok {
        log::info!("integrator: cycle {} completed without a sensor reading", report.cycle);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{EventKind, Subscription};
    use crate::config::DeliveryConfig;
    use crate::delivery::{DeliveryConnector, DeliveryReport, DeliveryTransport, PayloadKind};
    use crate::model::{CommandKind, HealthStatus, ReadingQuality};
    use crate::testing::{
        HangingSensor, RecordingSink, ScriptedSensor, ScriptedTransport, ScriptedVoice,
    };
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    struct Harness {
        integrator: SystemIntegrator,
        sensor: ScriptedSensor,
        voice: ScriptedVoice,
        sink: Arc<RecordingSink>,
        reports: mpsc::UnboundedSender<DeliveryReport>,
        hub: Arc<BroadcastHub>,
    }

    fn config() -> IntegratorConfig {
        IntegratorConfig {
            failure_threshold: 1,
            recovery_confirmation_cycles: 2,
            fallback_recheck_cycles: 3,
            ..IntegratorConfig::default()
        }
    }

    fn harness(config: IntegratorConfig) -> Harness {
        let sensor = ScriptedSensor::new();
        let voice = ScriptedVoice::new();
        let sink = Arc::new(RecordingSink::new());
        let (reports, reports_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(BroadcastHub::new(32));

        let integrator = SystemIntegrator::new(
            config,
            Box::new(sensor.clone()),
            Box::new(voice.clone()),
            Arc::clone(&sink) as Arc<dyn DeliverySink>,
            reports_rx,
            Arc::clone(&hub),
            CancellationToken::new(),
        );

        Harness {
            integrator,
            sensor,
            voice,
            sink,
            reports,
            hub,
        }
    }

    fn drain(sub: &mut Subscription) -> Vec<EventKind> {
        std::iter::from_fn(|| sub.try_recv()).map(|e| e.kind).collect()
    }

    fn failed_delivery() -> DeliveryReport {
        DeliveryReport {
            task_id: Uuid::new_v4(),
            endpoint: EndpointKind::SensorData,
            status: DeliveryStatus::Failed,
            attempts: 3,
            payloads: 1,
            error: Some(crate::delivery::DeliveryError::Status(500)),
        }
    }

    #[tokio::test]
    async fn reading_reaches_snapshot_delivery_and_broadcast() {
        let mut h = harness(config());
        let mut snapshots = h.integrator.subscribe_state();
        let mut sub = h.hub.register();

        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        h.sensor
            .push_reading(SensorReading::at(25.5, t0, ReadingQuality::Good));

        let report = h.integrator.run_cycle().await.unwrap();
        assert!(report.sensor_ok);

        assert!(snapshots.has_changed().unwrap());
        let snapshot = snapshots.borrow_and_update().clone();
        assert_eq!(snapshot.cycle, 1);
        assert_eq!(snapshot.latest_reading.as_ref().map(|r| r.value()), Some(25.5));

        let enqueued = h.sink.enqueued();
        assert_eq!(enqueued.len(), 1);
        assert_eq!(enqueued[0].1, EndpointKind::SensorData);
        assert_eq!(
            serde_json::to_value(&enqueued[0].0).unwrap(),
            serde_json::json!({
                "type": "sensor_reading",
                "value": 25.5,
                "timestamp": "2024-05-01T12:00:00Z",
            })
        );

        let event = sub.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::SensorReading);
        assert_eq!(event.value, 25.5);
        assert_eq!(event.timestamp, t0);
        assert_eq!(sub.try_recv().unwrap().kind, EventKind::StateUpdate);
    }

    #[tokio::test]
    async fn one_snapshot_per_cycle_in_order() {
        let mut h = harness(config());
        let mut snapshots = h.integrator.subscribe_state();

        for (i, value) in [10.0, 11.0, 12.0].into_iter().enumerate() {
            h.sensor.push_value(value);
            h.voice.push(vec![VoiceCommand::new(CommandKind::StartTask, None)]);
            h.integrator.run_cycle().await.unwrap();

            assert!(snapshots.has_changed().unwrap());
            let snap = snapshots.borrow_and_update().clone();
            assert_eq!(snap.cycle, i as u64 + 1);
            assert_eq!(snap.latest_reading.as_ref().map(|r| r.value()), Some(value));
            assert!(snap.active_task.is_some());
            assert!(!snapshots.has_changed().unwrap());
        }
    }

    #[tokio::test]
    async fn start_add_complete_through_the_cycle() {
        let mut h = harness(config());

        h.sensor.push_value(20.0);
        h.voice.push(vec![
            VoiceCommand::new(CommandKind::StartTask, None),
            VoiceCommand::new(CommandKind::StartTask, None),
        ]);
        let report = h.integrator.run_cycle().await.unwrap();
        assert_eq!(report.commands_processed, 1);
        assert!(matches!(
            report.task_errors.as_slice(),
            [TaskStateError::AlreadyActive { .. }]
        ));

        h.sensor.push_value(24.0);
        h.voice.push(vec![VoiceCommand::new(
            CommandKind::AddItem,
            Some("X".into()),
        )]);
        h.integrator.run_cycle().await.unwrap();
        assert_eq!(
            h.integrator.state().active_task.as_ref().map(|t| t.items().to_vec()),
            Some(vec!["X".to_string()])
        );

        h.sensor.push_value(24.0);
        h.voice.push(vec![VoiceCommand::new(CommandKind::CompleteTask, None)]);
        h.integrator.run_cycle().await.unwrap();
        assert!(h.integrator.state().active_task.is_none());
        let done = h.integrator.tasks().last_finished().unwrap();
        assert_eq!(done.status(), TaskStatus::Complete);
        assert_eq!(done.items().to_vec(), vec!["X".to_string()]);

        // The completion command carries the task summary.
        let commands: Vec<DeliveryPayload> = h
            .sink
            .enqueued()
            .into_iter()
            .filter(|(p, _)| p.kind == PayloadKind::Command)
            .map(|(p, _)| p)
            .collect();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[2].value["task"]["items"], serde_json::json!(["X"]));
        assert_eq!(commands[2].value["task"]["status"], "complete");
    }

    #[tokio::test]
    async fn subscriber_commands_join_the_cycle() {
        let mut h = harness(config());
        h.integrator
            .command_sender()
            .send(VoiceCommand::from_subscriber(CommandKind::StartTask, None))
            .await
            .unwrap();
        h.sensor.push_value(20.0);

        let report = h.integrator.run_cycle().await.unwrap();
        assert_eq!(report.commands_processed, 1);
        assert!(h.integrator.state().active_task.is_some());
    }

    #[tokio::test]
    async fn unknown_commands_are_reported_not_delivered() {
        let mut h = harness(config());
        h.sensor.push_value(20.0);
        h.voice.push(vec![VoiceCommand::new(
            CommandKind::Unknown,
            Some("hello".into()),
        )]);

        let report = h.integrator.run_cycle().await.unwrap();
        assert_eq!(report.task_errors.len(), 1);
        assert_eq!(report.deliveries_enqueued, 1);
        assert_eq!(h.integrator.state().mode, SystemMode::Monitoring);
    }

    #[tokio::test]
    async fn sensor_failure_recalibrates_then_keeps_previous_reading() {
        let mut h = harness(IntegratorConfig {
            failure_threshold: 3,
            ..config()
        });
        h.sensor.push_value(30.0);
        h.integrator.run_cycle().await.unwrap();

        h.sensor.push_failure().push_failure();
        let report = h.integrator.run_cycle().await.unwrap();
        assert!(!report.sensor_ok);
        assert_eq!(h.sensor.recalibrations(), 1);

        let state = h.integrator.state();
        assert_eq!(state.latest_reading.as_ref().map(|r| r.value()), Some(30.0));
        assert_eq!(state.health_of(Component::Sensor), Some(HealthStatus::Degraded));
        assert_eq!(state.mode, SystemMode::Monitoring);
    }

    #[tokio::test]
    async fn recalibration_rescues_the_cycle() {
        let mut h = harness(config());
        h.sensor.push_failure().push_value(22.0);

        let report = h.integrator.run_cycle().await.unwrap();
        assert!(report.sensor_ok);
        assert_eq!(
            h.integrator.state().health_of(Component::Sensor),
            Some(HealthStatus::Healthy)
        );
    }

    #[tokio::test]
    async fn voice_failure_is_tracked_but_not_critical() {
        let mut h = harness(config());
        h.sensor.push_value(20.0);
        h.voice.push_failure();

        h.integrator.run_cycle().await.unwrap();
        let state = h.integrator.state();
        assert_eq!(state.health_of(Component::Voice), Some(HealthStatus::Failed));
        assert_eq!(state.mode, SystemMode::Monitoring);
    }

    #[tokio::test]
    async fn both_critical_failures_enter_fallback_and_suspend_enqueue() {
        let mut h = harness(config());
        let mut sub = h.hub.register();

        // Cycle 1: sensor fails → DEGRADED.
        h.sensor.push_failure().push_failure();
        let report = h.integrator.run_cycle().await.unwrap();
        assert_eq!(report.transition, Some((SystemMode::Monitoring, SystemMode::Degraded)));
        assert!(drain(&mut sub).contains(&EventKind::Degraded));

        // Cycle 2: connector also fails while the sensor is still down → FALLBACK.
        h.reports.send(failed_delivery()).unwrap();
        h.sensor.push_failure().push_failure();
        h.sink.clear();
        let report = h.integrator.run_cycle().await.unwrap();
        assert_eq!(report.transition, Some((SystemMode::Degraded, SystemMode::Fallback)));
        assert_eq!(h.integrator.state().mode, SystemMode::Fallback);
        assert_eq!(report.deliveries_enqueued, 0);
        assert!(h.sink.enqueued().is_empty());
        assert_eq!(drain(&mut sub), vec![EventKind::Degraded]);

        // Cycle 3: the sensor is back but the connector is still FAILED.
        // The mode steps down to DEGRADED; the sensor alone is not enough
        // for full recovery.
        h.sensor.push_value(21.0);
        h.voice.push(vec![VoiceCommand::new(CommandKind::StartTask, None)]);
        let report = h.integrator.run_cycle().await.unwrap();
        assert_eq!(report.transition, Some((SystemMode::Fallback, SystemMode::Degraded)));
        assert_eq!(report.deliveries_enqueued, 2);
    }

    #[tokio::test]
    async fn fallback_probes_the_connector_periodically() {
        let mut h = harness(config());
        h.reports.send(failed_delivery()).unwrap();
        h.sensor.push_failure().push_failure();
        h.integrator.run_cycle().await.unwrap();
        assert_eq!(h.integrator.state().mode, SystemMode::Fallback);

        // Sensor recovered, connector still failed → DEGRADED.  This also
        // leaves a latest reading for the probe to carry later.
        h.sensor.push_value(5.0);
        h.sink.clear();
        h.integrator.run_cycle().await.unwrap();
        assert_eq!(h.integrator.state().mode, SystemMode::Degraded);

        // Push back into FALLBACK and stay there for three cycles.
        h.reports.send(failed_delivery()).unwrap();
        for _ in 0..3 {
            h.sensor.push_failure().push_failure();
        }
        h.sink.clear();
        let enqueued: Vec<usize> = {
            let mut counts = Vec::new();
            for _ in 0..3 {
                counts.push(h.integrator.run_cycle().await.unwrap().deliveries_enqueued);
            }
            counts
        };
        assert_eq!(h.integrator.state().mode, SystemMode::Fallback);
        assert_eq!(enqueued, vec![0, 0, 1]);
        assert_eq!(h.sink.enqueued()[0].0.value, 5.0);
    }

    #[tokio::test]
    async fn degraded_recovers_after_confirmation_window() {
        let mut h = harness(config());
        h.sensor.push_failure().push_failure();
        h.integrator.run_cycle().await.unwrap();
        assert_eq!(h.integrator.state().mode, SystemMode::Degraded);

        h.sensor.push_value(20.0);
        h.integrator.run_cycle().await.unwrap();
        assert_eq!(h.integrator.state().mode, SystemMode::Degraded);

        h.sensor.push_value(20.0);
        let report = h.integrator.run_cycle().await.unwrap();
        assert_eq!(report.transition, Some((SystemMode::Degraded, SystemMode::Monitoring)));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_sensor_times_out() {
        let sink = Arc::new(RecordingSink::new());
        let (_reports, reports_rx) = mpsc::unbounded_channel();
        let mut integrator = SystemIntegrator::new(
            config(),
            Box::new(HangingSensor),
            Box::new(ScriptedVoice::new()),
            sink,
            reports_rx,
            Arc::new(BroadcastHub::new(4)),
            CancellationToken::new(),
        );

        let report = integrator.run_cycle().await.unwrap();
        assert!(!report.sensor_ok);
        assert_eq!(
            integrator.state().health_of(Component::Sensor),
            Some(HealthStatus::Failed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_a_suspended_pull() {
        let sink = Arc::new(RecordingSink::new());
        let (_reports, reports_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let mut integrator = SystemIntegrator::new(
            IntegratorConfig {
                pull_timeout_ms: 60_000,
                ..config()
            },
            Box::new(HangingSensor),
            Box::new(ScriptedVoice::new()),
            sink,
            reports_rx,
            Arc::new(BroadcastHub::new(4)),
            cancel.clone(),
        );

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        assert_eq!(integrator.run_cycle().await, Err(FatalError::Cancelled));
        // The aborted cycle published nothing.
        assert_eq!(integrator.state().cycle, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_stops_in_shutdown() {
        let h = harness(config());
        for _ in 0..3 {
            h.sensor.push_value(20.0);
        }
        let handle = h.integrator.shutdown_handle();
        let snapshots = h.integrator.subscribe_state();
        let runner = tokio::spawn(h.integrator.run());

        tokio::time::sleep(Duration::from_millis(12_500)).await;
        handle.cancel();
        let final_state = runner.await.unwrap();

        assert_eq!(final_state.mode, SystemMode::Shutdown);
        assert_eq!(final_state.cycle, 3);
        assert_eq!(snapshots.borrow().mode, SystemMode::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_degrades_connector() {
        let delivery = DeliveryConfig {
            max_retries: 3,
            batch_size: 1,
            ..DeliveryConfig::default()
        };
        let transport = Arc::new(ScriptedTransport::failing(4));
        let cancel = CancellationToken::new();
        let (connector, reports, worker) = DeliveryConnector::spawn(
            &delivery,
            Arc::clone(&transport) as Arc<dyn DeliveryTransport>,
            Duration::from_secs(5),
            cancel.clone(),
        );

        let sensor = ScriptedSensor::new();
        sensor.push_value(25.5);
        let mut integrator = SystemIntegrator::new(
            IntegratorConfig::default(),
            Box::new(sensor),
            Box::new(ScriptedVoice::new()),
            Arc::new(connector),
            reports,
            Arc::new(BroadcastHub::new(4)),
            cancel,
        )
        .with_delivery_worker(worker);

        integrator.run_cycle().await.unwrap();
        // Attempts at t=0, 1s and 3s; the task is FAILED by now.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.sent().len(), 3);

        // The sensor script is exhausted, so this cycle enqueues nothing.
        let report = integrator.run_cycle().await.unwrap();
        assert_eq!(report.deliveries_enqueued, 0);
        assert_eq!(
            integrator.state().health_of(Component::Connector),
            Some(HealthStatus::Degraded)
        );

        // No fourth attempt, however long we wait.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.sent().len(), 3);
    }
}
