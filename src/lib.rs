//! Potion Monitor: a monitoring-cycle integrator for a mixing station.
//!
//! A [`SystemIntegrator`](integrator::SystemIntegrator) pulls a level sensor
//! and a voice command source once per cycle, drives the single-task
//! [`TaskStateMachine`](task::TaskStateMachine), publishes a
//! [`SystemState`](model::SystemState) snapshot, hands readings and commands
//! to the [`DeliveryConnector`](delivery::DeliveryConnector) and pushes
//! events to websocket subscribers through the
//! [`BroadcastHub`](broadcast::BroadcastHub).

pub mod adapters;
pub mod broadcast;
pub mod config;
pub mod delivery;
pub mod integrator;
pub mod model;
pub mod server;
pub mod task;

#[cfg(test)]
pub mod testing;
