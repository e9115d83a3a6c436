//! Scripted test doubles for the capability traits.
//!
//! Each double replays a queue of canned results and records what it was
//! asked to do, so tests can drive the integrator and connector without
//! hardware, speech or network.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::adapters::{SensorAdapter, SensorError, VoiceAdapter, VoiceError};
use crate::delivery::{DeliveryError, DeliveryPayload, DeliverySink, DeliveryTransport, EndpointKind};
use crate::model::{ReadingQuality, SensorReading, VoiceCommand};

// ---------------------------------------------------------------------------
// Sensor
// ---------------------------------------------------------------------------

/// Replays queued pull results; an empty queue means `Unavailable`.
#[derive(Clone, Default)]
pub struct ScriptedSensor {
    pulls: Arc<Mutex<VecDeque<Result<SensorReading, SensorError>>>>,
    recalibrations: Arc<Mutex<usize>>,
    recalibrate_ok: bool,
}

impl ScriptedSensor {
    pub fn new() -> Self {
        Self {
            recalibrate_ok: true,
            ..Self::default()
        }
    }

    pub fn push_value(&self, value: f64) -> &Self {
        self.push(Ok(SensorReading::new(value, ReadingQuality::Good)))
    }

    pub fn push_reading(&self, reading: SensorReading) -> &Self {
        self.push(Ok(reading))
    }

    pub fn push_failure(&self) -> &Self {
        self.push(Err(SensorError::Unavailable("no echo".into())))
    }

    fn push(&self, result: Result<SensorReading, SensorError>) -> &Self {
        self.pulls.lock().unwrap().push_back(result);
        self
    }

    pub fn recalibrations(&self) -> usize {
        *self.recalibrations.lock().unwrap()
    }
}

#[async_trait]
impl SensorAdapter for ScriptedSensor {
    async fn pull(&mut self) -> Result<SensorReading, SensorError> {
        self.pulls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SensorError::Unavailable("script exhausted".into())))
    }

    async fn recalibrate(&mut self) -> bool {
        *self.recalibrations.lock().unwrap() += 1;
        self.recalibrate_ok
    }
}

/// A sensor whose pull never completes.
pub struct HangingSensor;

#[async_trait]
impl SensorAdapter for HangingSensor {
    async fn pull(&mut self) -> Result<SensorReading, SensorError> {
        std::future::pending().await
    }

    async fn recalibrate(&mut self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Voice
// ---------------------------------------------------------------------------

/// Replays queued batches of commands; an empty queue means silence.
#[derive(Clone, Default)]
pub struct ScriptedVoice {
    pulls: Arc<Mutex<VecDeque<Result<Vec<VoiceCommand>, VoiceError>>>>,
}

impl ScriptedVoice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, commands: Vec<VoiceCommand>) -> &Self {
        self.pulls.lock().unwrap().push_back(Ok(commands));
        self
    }

    pub fn push_failure(&self) -> &Self {
        self.pulls
            .lock()
            .unwrap()
            .push_back(Err(VoiceError::Unavailable("mic unplugged".into())));
        self
    }
}

#[async_trait]
impl VoiceAdapter for ScriptedVoice {
    async fn pull(&mut self) -> Result<Vec<VoiceCommand>, VoiceError> {
        self.pulls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Records every enqueued payload instead of delivering it.
#[derive(Default)]
pub struct RecordingSink {
    enqueued: Mutex<Vec<(DeliveryPayload, EndpointKind)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueued(&self) -> Vec<(DeliveryPayload, EndpointKind)> {
        self.enqueued.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.enqueued.lock().unwrap().clear();
    }
}

impl DeliverySink for RecordingSink {
    fn enqueue(
        &self,
        payload: DeliveryPayload,
        endpoint: EndpointKind,
    ) -> Result<(), DeliveryError> {
        payload.validate()?;
        self.enqueued.lock().unwrap().push((payload, endpoint));
        Ok(())
    }
}

/// One call observed by [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub endpoint: EndpointKind,
    pub body: serde_json::Value,
    pub at: Instant,
}

/// Fails the first `n` sends with HTTP 500, then succeeds.  `hanging()`
/// never answers at all.
pub struct ScriptedTransport {
    failures_left: Mutex<usize>,
    hang: bool,
    sent: Mutex<Vec<SentRequest>>,
}

impl ScriptedTransport {
    pub fn ok() -> Self {
        Self::failing(0)
    }

    pub fn failing(n: usize) -> Self {
        Self {
            failures_left: Mutex::new(n),
            hang: false,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::ok()
        }
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryTransport for ScriptedTransport {
    async fn send(
        &self,
        endpoint: EndpointKind,
        body: &serde_json::Value,
    ) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push(SentRequest {
            endpoint,
            body: body.clone(),
            at: Instant::now(),
        });
        if self.hang {
            std::future::pending::<()>().await;
        }
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            Err(DeliveryError::Status(500))
        } else {
            Ok(())
        }
    }
}
