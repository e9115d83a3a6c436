//! Reliable hand-off of readings and commands to the automation service.
//!
//! # Architecture
//!
//! ```text
//!  integrator ──enqueue──▶ DeliveryConnector ──mpsc──▶ worker
//!                                                       │
//!                        ┌──────── batch (sensor) ◀─────┤
//!                        ▼                              │ commands
//!                  JoinSet<deliver(task)> ◀─────────────┘
//!                        │  retry with BackoffPolicy
//!                        ▼
//!            DeliveryTransport (HttpTransport / test double)
//!                        │
//!  integrator ◀──DeliveryReport (DELIVERED | FAILED)
//! ```

pub mod backoff;
pub mod connector;
pub mod payload;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use connector::{DeliveryConnector, DeliveryReports, DeliverySink};
pub use payload::{
    DeliveryPayload, DeliveryReport, DeliveryStatus, DeliveryTask, EndpointKind, OutboundBody,
    PayloadKind,
};
pub use transport::{DeliveryError, DeliveryTransport, HttpTransport};
