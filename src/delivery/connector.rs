//! The delivery worker: batching, concurrent retries and graceful drain.
//!
//! `enqueue` never waits on the network.  It validates the payload and hands
//! it to a background worker over an unbounded channel.  The worker
//!
//! * sends commands immediately,
//! * coalesces sensor readings until `batch_size` is reached or
//!   `batch_window` has passed since the first reading of the batch,
//! * runs every dispatched [`DeliveryTask`] as its own tokio task in a
//!   `JoinSet`, so a slow or failing endpoint never blocks newer payloads,
//! * reports every terminal outcome on the reports channel.
//!
//! On cancellation the worker accepts what is already queued, flushes the
//! open batch and waits up to the grace period for in-flight tasks.  A task
//! waiting out its backoff keeps retrying as long as the next attempt starts
//! before the grace deadline.  Tasks still running after that are aborted and
//! reported `Failed`.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::DeliveryConfig;

use super::backoff::BackoffPolicy;
use super::payload::{DeliveryPayload, DeliveryReport, DeliveryTask, EndpointKind, OutboundBody};
use super::transport::{DeliveryError, DeliveryTransport};

/// Terminal outcomes, consumed by the integrator.
pub type DeliveryReports = mpsc::UnboundedReceiver<DeliveryReport>;

// ---------------------------------------------------------------------------
// DeliverySink trait
// ---------------------------------------------------------------------------

/// Fire-and-forget hand-off of outbound payloads.
pub trait DeliverySink: Send + Sync {
    fn enqueue(&self, payload: DeliveryPayload, endpoint: EndpointKind)
        -> Result<(), DeliveryError>;
}

// ---------------------------------------------------------------------------
// DeliveryConnector handle
// ---------------------------------------------------------------------------

enum ConnectorMsg {
    Enqueue(DeliveryPayload, EndpointKind),
    Flush(oneshot::Sender<()>),
}

/// Cheap, cloneable handle to the delivery worker.
#[derive(Clone)]
pub struct DeliveryConnector {
    tx: mpsc::UnboundedSender<ConnectorMsg>,
}

impl DeliveryConnector {
    /// Start the worker.  It stops once `cancel` fires (after draining) or
    /// when every handle has been dropped.
    pub fn spawn(
        config: &DeliveryConfig,
        transport: Arc<dyn DeliveryTransport>,
        grace: Duration,
        cancel: CancellationToken,
    ) -> (Self, DeliveryReports, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            transport,
            policy: BackoffPolicy::from_config(config),
            batch: Batch::new(config.batch_size, config.batch_window()),
            in_flight: JoinSet::new(),
            reports: reports_tx,
            cancel,
            clock: ShutdownClock::new(grace),
        };
        let handle = tokio::spawn(worker.run(rx));

        (Self { tx }, reports_rx, handle)
    }

    /// Send the open sensor batch now instead of waiting for its window.
    pub async fn flush(&self) -> Result<(), DeliveryError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(ConnectorMsg::Flush(ack_tx))
            .map_err(|_| DeliveryError::Closed)?;
        ack_rx.await.map_err(|_| DeliveryError::Closed)
    }
}

impl DeliverySink for DeliveryConnector {
    fn enqueue(
        &self,
        payload: DeliveryPayload,
        endpoint: EndpointKind,
    ) -> Result<(), DeliveryError> {
        payload.validate()?;
        self.tx
            .send(ConnectorMsg::Enqueue(payload, endpoint))
            .map_err(|_| DeliveryError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

struct Batch {
    size: usize,
    window: Duration,
    items: Vec<DeliveryPayload>,
    opened_at: Option<Instant>,
}

impl Batch {
    fn new(size: usize, window: Duration) -> Self {
        Self {
            size: size.max(1),
            window,
            items: Vec::new(),
            opened_at: None,
        }
    }

    /// Returns `true` once the batch is full.
    fn push(&mut self, payload: DeliveryPayload) -> bool {
        if self.items.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.items.push(payload);
        self.items.len() >= self.size
    }

    fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|at| at + self.window)
    }

    fn take(&mut self) -> Option<OutboundBody> {
        self.opened_at = None;
        let mut items = std::mem::take(&mut self.items);
        match items.len() {
            0 => None,
            1 => items.pop().map(OutboundBody::Single),
            _ => Some(OutboundBody::Batch(items)),
        }
    }
}

/// Grace deadline shared by the worker and its delivery tasks.  Fixed by
/// whichever of them first observes shutdown.
#[derive(Clone)]
struct ShutdownClock {
    grace: Duration,
    deadline: Arc<OnceLock<Instant>>,
}

impl ShutdownClock {
    fn new(grace: Duration) -> Self {
        Self {
            grace,
            deadline: Arc::new(OnceLock::new()),
        }
    }

    fn deadline(&self) -> Instant {
        *self.deadline.get_or_init(|| Instant::now() + self.grace)
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    transport: Arc<dyn DeliveryTransport>,
    policy: BackoffPolicy,
    batch: Batch,
    in_flight: JoinSet<()>,
    reports: mpsc::UnboundedSender<DeliveryReport>,
    cancel: CancellationToken,
    clock: ShutdownClock,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ConnectorMsg>) {
        let cancel = self.cancel.clone();
        loop {
            let deadline = self.batch.deadline();
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },

                _ = until(deadline) => self.flush_batch(),

                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            log::error!("delivery: task panicked: {e}");
                        }
                    }
                }
            }
        }

        // Take whatever was queued before shutdown, then stop accepting.
        rx.close();
        while let Ok(msg) = rx.try_recv() {
            self.handle(msg);
        }
        self.flush_batch();
        self.drain().await;
    }

    fn handle(&mut self, msg: ConnectorMsg) {
        match msg {
            ConnectorMsg::Enqueue(payload, EndpointKind::SensorData) => {
                if self.batch.push(payload) {
                    self.flush_batch();
                }
            }
            ConnectorMsg::Enqueue(payload, endpoint) => {
                self.dispatch(OutboundBody::Single(payload), endpoint)
            }
            ConnectorMsg::Flush(ack) => {
                self.flush_batch();
                let _ = ack.send(());
            }
        }
    }

    fn flush_batch(&mut self) {
        if let Some(body) = self.batch.take() {
            self.dispatch(body, EndpointKind::SensorData);
        }
    }

    fn dispatch(&mut self, body: OutboundBody, endpoint: EndpointKind) {
        let task = DeliveryTask::new(body, endpoint);
        log::debug!(
            "delivery: dispatching {} ({} payload(s)) to {endpoint}",
            task.id(),
            task.body().len()
        );
        let flight = InFlight {
            task,
            reports: self.reports.clone(),
            settled: false,
        };
        self.in_flight.spawn(deliver(
            flight,
            Arc::clone(&self.transport),
            self.policy,
            self.cancel.clone(),
            self.clock.clone(),
        ));
    }

    async fn drain(mut self) {
        if self.in_flight.is_empty() {
            return;
        }
        let deadline = self.clock.deadline();
        log::info!(
            "delivery: waiting up to {:?} for {} in-flight task(s)",
            deadline.saturating_duration_since(Instant::now()),
            self.in_flight.len()
        );

        let in_flight = &mut self.in_flight;
        let drained = tokio::time::timeout_at(deadline, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            log::warn!(
                "delivery: grace period elapsed, aborting {} task(s)",
                self.in_flight.len()
            );
            // Aborted tasks report themselves as failed when dropped.
            self.in_flight.shutdown().await;
        }
    }
}

// ---------------------------------------------------------------------------
// One delivery task
// ---------------------------------------------------------------------------

/// Owns a task while it is in flight.  If it is dropped before settling
/// (abort or panic) the task is reported `Failed`.
struct InFlight {
    task: DeliveryTask,
    reports: mpsc::UnboundedSender<DeliveryReport>,
    settled: bool,
}

impl InFlight {
    fn settle(mut self) {
        self.report();
        self.settled = true;
    }

    fn report(&self) {
        let _ = self.reports.send(DeliveryReport::from(&self.task));
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.settled {
            self.task.fail(Some(DeliveryError::Cancelled));
            self.report();
        }
    }
}

async fn deliver(
    mut flight: InFlight,
    transport: Arc<dyn DeliveryTransport>,
    policy: BackoffPolicy,
    cancel: CancellationToken,
    clock: ShutdownClock,
) {
    let body = flight.task.body().to_json();
    let endpoint = flight.task.endpoint();

    loop {
        flight.task.begin_attempt();
        let attempt = flight.task.attempts();

        match transport.send(endpoint, &body).await {
            Ok(()) => {
                flight.task.delivered();
                log::debug!(
                    "delivery: {} delivered to {endpoint} on attempt {attempt}",
                    flight.task.id()
                );
                return flight.settle();
            }
            Err(e) => {
                log::warn!(
                    "delivery: {} attempt {attempt}/{} to {endpoint} failed: {e}",
                    flight.task.id(),
                    policy.max_attempts()
                );
                flight.task.record_error(e);
            }
        }

        if !policy.should_retry(attempt) {
            flight.task.fail(None);
            log::error!(
                "delivery: {} failed after {attempt} attempt(s)",
                flight.task.id()
            );
            return flight.settle();
        }

        let retry_at = Instant::now() + policy.delay_after(attempt);
        tokio::select! {
            _ = tokio::time::sleep_until(retry_at) => {}
            _ = cancel.cancelled() => {
                // Past the grace deadline the retry would only be aborted.
                if retry_at >= clock.deadline() {
                    flight.task.fail(Some(DeliveryError::Cancelled));
                    return flight.settle();
                }
                tokio::time::sleep_until(retry_at).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryStatus;
    use crate::model::{CommandKind, ReadingQuality, SensorReading, VoiceCommand};
    use crate::testing::ScriptedTransport;

    fn config(batch_size: usize) -> DeliveryConfig {
        DeliveryConfig {
            max_retries: 3,
            base_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            batch_size,
            batch_window_ms: 10_000,
            ..DeliveryConfig::default()
        }
    }

    fn reading(value: f64) -> DeliveryPayload {
        DeliveryPayload::reading(&SensorReading::new(value, ReadingQuality::Good))
    }

    fn spawn(
        config: &DeliveryConfig,
        transport: &Arc<ScriptedTransport>,
    ) -> (DeliveryConnector, DeliveryReports, JoinHandle<()>, CancellationToken) {
        let cancel = CancellationToken::new();
        let (connector, reports, handle) = DeliveryConnector::spawn(
            config,
            Arc::clone(transport) as Arc<dyn DeliveryTransport>,
            Duration::from_secs(5),
            cancel.clone(),
        );
        (connector, reports, handle, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts_with_growing_backoff() {
        let transport = Arc::new(ScriptedTransport::failing(4));
        let (connector, mut reports, _handle, _cancel) = spawn(&config(1), &transport);

        connector
            .enqueue(reading(25.5), EndpointKind::SensorData)
            .unwrap();

        let report = reports.recv().await.unwrap();
        assert_eq!(report.status, DeliveryStatus::Failed);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.error, Some(DeliveryError::Status(500)));

        // No fourth attempt, even much later.
        tokio::time::sleep(Duration::from_secs(120)).await;
        let sent = transport.sent();
        assert_eq!(sent.len(), 3);

        let gaps: Vec<Duration> = sent.windows(2).map(|w| w[1].at - w[0].at).collect();
        assert_eq!(gaps, vec![Duration::from_secs(1), Duration::from_secs(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_retry() {
        let transport = Arc::new(ScriptedTransport::failing(1));
        let (connector, mut reports, _handle, _cancel) = spawn(&config(1), &transport);

        connector
            .enqueue(reading(30.0), EndpointKind::SensorData)
            .unwrap();

        let report = reports.recv().await.unwrap();
        assert_eq!(report.status, DeliveryStatus::Delivered);
        assert_eq!(report.attempts, 2);
        assert_eq!(report.error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn readings_batch_by_size() {
        let transport = Arc::new(ScriptedTransport::ok());
        let (connector, mut reports, _handle, _cancel) = spawn(&config(3), &transport);

        for v in [1.0, 2.0, 3.0] {
            connector.enqueue(reading(v), EndpointKind::SensorData).unwrap();
        }

        let report = reports.recv().await.unwrap();
        assert_eq!(report.payloads, 3);
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].endpoint, EndpointKind::SensorData);
        assert_eq!(sent[0].body.as_array().map(Vec::len), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_flushes_after_window() {
        let transport = Arc::new(ScriptedTransport::ok());
        let (connector, mut reports, _handle, _cancel) = spawn(&config(10), &transport);

        connector
            .enqueue(reading(12.5), EndpointKind::SensorData)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(transport.sent().is_empty());

        let report = reports.recv().await.unwrap();
        assert_eq!(report.status, DeliveryStatus::Delivered);
        // A lone reading goes out as a plain object.
        let sent = transport.sent();
        assert_eq!(sent[0].body["value"], 12.5);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_flush_sends_open_batch() {
        let transport = Arc::new(ScriptedTransport::ok());
        let (connector, mut reports, _handle, _cancel) = spawn(&config(10), &transport);

        connector.enqueue(reading(1.0), EndpointKind::SensorData).unwrap();
        connector.enqueue(reading(2.0), EndpointKind::SensorData).unwrap();
        connector.flush().await.unwrap();

        assert_eq!(reports.recv().await.unwrap().payloads, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_skip_the_batch() {
        let transport = Arc::new(ScriptedTransport::ok());
        let (connector, mut reports, _handle, _cancel) = spawn(&config(10), &transport);

        connector.enqueue(reading(1.0), EndpointKind::SensorData).unwrap();
        let cmd = VoiceCommand::new(CommandKind::StartTask, None);
        connector
            .enqueue(DeliveryPayload::command(&cmd, None), EndpointKind::Command)
            .unwrap();

        let report = reports.recv().await.unwrap();
        assert_eq!(report.endpoint, EndpointKind::Command);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_endpoint_does_not_block_newer_payloads() {
        let transport = Arc::new(ScriptedTransport::failing(1));
        let (connector, mut reports, _handle, _cancel) = spawn(&config(1), &transport);

        connector.enqueue(reading(1.0), EndpointKind::SensorData).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.sent().len(), 1);
        connector.enqueue(reading(2.0), EndpointKind::SensorData).unwrap();

        // The second payload is delivered while the first waits out its backoff.
        let first = reports.recv().await.unwrap();
        assert_eq!(first.status, DeliveryStatus::Delivered);
        assert_eq!(first.attempts, 1);
        let second = reports.recv().await.unwrap();
        assert_eq!(second.attempts, 2);
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected_at_enqueue() {
        let transport = Arc::new(ScriptedTransport::ok());
        let (connector, _reports, _handle, _cancel) = spawn(&config(1), &transport);

        let mut payload = reading(1.0);
        payload.value = serde_json::Value::Null;
        assert!(matches!(
            connector.enqueue(payload, EndpointKind::SensorData),
            Err(DeliveryError::InvalidPayload(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_open_batch() {
        let transport = Arc::new(ScriptedTransport::ok());
        let (connector, mut reports, handle, cancel) = spawn(&config(10), &transport);

        connector.enqueue(reading(7.0), EndpointKind::SensorData).unwrap();
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(reports.recv().await.unwrap().status, DeliveryStatus::Delivered);
        assert!(matches!(
            connector.enqueue(reading(8.0), EndpointKind::SensorData),
            Err(DeliveryError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_inside_grace_completes_after_shutdown() {
        let transport = Arc::new(ScriptedTransport::failing(1));
        let (connector, mut reports, handle, cancel) = spawn(&config(1), &transport);

        connector.enqueue(reading(7.0), EndpointKind::SensorData).unwrap();
        // Let the first attempt fail and enter its 1s backoff.
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        handle.await.unwrap();

        let report = reports.recv().await.unwrap();
        assert_eq!(report.status, DeliveryStatus::Delivered);
        assert_eq!(report.attempts, 2);
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_retries_scheduled_past_grace() {
        let transport = Arc::new(ScriptedTransport::failing(10));
        let config = DeliveryConfig {
            max_retries: 5,
            ..config(1)
        };
        let (connector, mut reports, handle, cancel) = spawn(&config, &transport);

        connector.enqueue(reading(7.0), EndpointKind::SensorData).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Grace ends at ~5s: the retries at 1s and 3s run, the one at 7s does not.
        let started = Instant::now();
        cancel.cancel();
        handle.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        let report = reports.recv().await.unwrap();
        assert_eq!(report.status, DeliveryStatus::Failed);
        assert_eq!(report.error, Some(DeliveryError::Cancelled));
        assert_eq!(report.attempts, 3);
        assert_eq!(transport.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_tasks_are_aborted_after_grace() {
        let transport = Arc::new(ScriptedTransport::hanging());
        let (connector, mut reports, handle, cancel) = spawn(&config(1), &transport);

        connector.enqueue(reading(7.0), EndpointKind::SensorData).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        cancel.cancel();
        handle.await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));

        let report = reports.recv().await.unwrap();
        assert_eq!(report.status, DeliveryStatus::Failed);
        assert_eq!(report.error, Some(DeliveryError::Cancelled));
    }
}
