//! # MQTT Integration Module
//!
//! Owns the sync manager's link to the MQTT broker: connection lifecycle,
//! stabilization, backoff-driven reconnects and acknowledged publishing.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs            - Broker settings and backoff tunables
//! ├── backoff.rs           - Exponential backoff with jitter
//! ├── transport.rs         - Transport trait and connection callbacks
//! ├── rumqttc_transport.rs - rumqttc-backed transport with ack tracking
//! └── mqtt_handler.rs      - BrokerClient connection state machine
//! ```
//!
//! ## Design Philosophy
//!
//! - **Never trust a fresh connection**: a connect callback only moves the
//!   client to `Stabilizing`; publishing waits for the stabilization delay
//! - **Fail fast**: publishing while not connected returns an error right away
//!   and the caller retries later from the outbox
//! - **Swappable transport**: the state machine talks to [`transport::Transport`],
//!   which keeps it testable without a broker

pub mod backoff;
pub mod config;
pub mod mqtt_handler;
pub mod rumqttc_transport;
pub mod transport;

pub use mqtt_handler::{BrokerClient, BrokerError, BrokerStatus, ConnectionState};
