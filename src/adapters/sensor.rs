//! Sensor adapter trait and the moving-average filter over a raw probe.
//!
//! # Overview
//!
//! [`SensorAdapter`] is what the integrator pulls from once per cycle.  It is
//! object-safe so the integrator can hold a `Box<dyn SensorAdapter>`.
//!
//! [`FilteredSensor`] is the production implementation: it wraps any blocking
//! [`DistanceProbe`] (the hardware driver lives outside this crate), rejects
//! implausible raw samples and averages the last `window` good ones.  Probe
//! calls run on the blocking thread pool so a slow echo never stalls the
//! runtime.  While one probe call is still running, further pulls fail fast
//! instead of queueing behind it.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::SensorConfig;
use crate::model::{ReadingQuality, SensorReading};

// ---------------------------------------------------------------------------
// SensorError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    /// The probe could not produce a sample.
    #[error("sensor unavailable: {0}")]
    Unavailable(String),

    /// The probe answered with a value outside the plausible range.
    #[error("raw sample {value} cm outside {min}..={max} cm")]
    OutOfRange { value: f64, min: f64, max: f64 },

    /// The pull did not finish within the per-pull timeout.
    #[error("sensor pull timed out")]
    Timeout,
}

impl SensorError {
    /// Short machine-friendly name used in escalation logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SensorError::Unavailable(_) => "unavailable",
            SensorError::OutOfRange { .. } => "out_of_range",
            SensorError::Timeout => "timeout",
        }
    }
}

// ---------------------------------------------------------------------------
// SensorAdapter trait
// ---------------------------------------------------------------------------

/// A source of filtered level readings.
#[async_trait]
pub trait SensorAdapter: Send {
    /// Take one reading.
    async fn pull(&mut self) -> Result<SensorReading, SensorError>;

    /// Attempt to bring the sensor back into a known-good state.  Returns
    /// `true` when the recalibration itself succeeded.
    async fn recalibrate(&mut self) -> bool;
}

// ---------------------------------------------------------------------------
// DistanceProbe
// ---------------------------------------------------------------------------

/// Blocking access to the raw distance hardware.
pub trait DistanceProbe: Send + 'static {
    /// One raw measurement in centimetres.
    fn measure(&mut self) -> Result<f64, SensorError>;

    /// Re-initialise the hardware.  Defaults to a no-op that succeeds.
    fn reset(&mut self) -> bool {
        true
    }
}

/// A deterministic probe for development machines without hardware.
///
/// Produces a slow oscillation of ±`amplitude` cm around `base`.
#[derive(Debug, Clone)]
pub struct SimulatedProbe {
    base: f64,
    amplitude: f64,
    step: u64,
}

impl SimulatedProbe {
    pub fn new(base: f64, amplitude: f64) -> Self {
        Self {
            base,
            amplitude,
            step: 0,
        }
    }
}

impl Default for SimulatedProbe {
    fn default() -> Self {
        Self::new(25.0, 5.0)
    }
}

impl DistanceProbe for SimulatedProbe {
    fn measure(&mut self) -> Result<f64, SensorError> {
        let phase = self.step as f64 * 0.3;
        self.step = self.step.wrapping_add(1);
        Ok(self.base + self.amplitude * phase.sin())
    }

    fn reset(&mut self) -> bool {
        self.step = 0;
        true
    }
}

// ---------------------------------------------------------------------------
// FilteredSensor
// ---------------------------------------------------------------------------

struct FilterState<P> {
    probe: P,
    samples: VecDeque<f64>,
    config: SensorConfig,
}

impl<P: DistanceProbe> FilterState<P> {
    fn window(&self) -> usize {
        self.config.window.max(1)
    }

    fn sample(&mut self) -> Result<SensorReading, SensorError> {
        let raw = self.probe.measure()?;
        let (min, max) = (self.config.min_cm, self.config.max_cm);
        if !raw.is_finite() || raw < min || raw > max {
            return Err(SensorError::OutOfRange {
                value: raw,
                min,
                max,
            });
        }

        if self.samples.len() == self.window() {
            self.samples.pop_front();
        }
        self.samples.push_back(raw);

        let mean = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        let quality = if self.samples.len() >= self.window() {
            ReadingQuality::Good
        } else {
            ReadingQuality::Warmup
        };
        Ok(SensorReading::new(round2(mean), quality))
    }

    fn recalibrate(&mut self) -> bool {
        self.samples.clear();
        self.probe.reset()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Moving-average filter over a blocking [`DistanceProbe`].
pub struct FilteredSensor<P> {
    state: Arc<Mutex<FilterState<P>>>,
}

impl<P: DistanceProbe> FilteredSensor<P> {
    pub fn new(probe: P, config: SensorConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(FilterState {
                probe,
                samples: VecDeque::with_capacity(config.window.max(1)),
                config,
            })),
        }
    }
}

impl<P: DistanceProbe> FilteredSensor<P> {
    /// The filter, unless a blocking probe call still holds it.
    fn acquire(&self) -> Option<OwnedMutexGuard<FilterState<P>>> {
        Arc::clone(&self.state).try_lock_owned().ok()
    }
}

#[async_trait]
impl<P: DistanceProbe> SensorAdapter for FilteredSensor<P> {
    async fn pull(&mut self) -> Result<SensorReading, SensorError> {
        let mut state = self.acquire().ok_or_else(|| {
            SensorError::Unavailable("previous probe call still running".into())
        })?;
        tokio::task::spawn_blocking(move || state.sample())
            .await
            .map_err(|e| SensorError::Unavailable(format!("probe task failed: {e}")))?
    }

    async fn recalibrate(&mut self) -> bool {
        let Some(mut state) = self.acquire() else {
            log::warn!("sensor: probe busy, recalibration skipped");
            return false;
        };
        let result = tokio::task::spawn_blocking(move || state.recalibrate()).await;

        match result {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("sensor: recalibration task failed: {e}");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
