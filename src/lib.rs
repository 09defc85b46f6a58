//! # Sync Manager
//!
//! Store-and-forward delivery of outbound events to an MQTT broker. Producers
//! write to a durable SQLite outbox; a dispatch loop publishes claimed rows
//! through a reconnecting broker client and marks them sent once the broker
//! acknowledged them.
//!
//! ```text
//! Producer ──► Outbox ──► Dispatch Loop ──► Dedup Cache ──► Broker Client ──► MQTT
//!                ▲                                              │
//!                └──────────── mark_sent / release ◄────────────┘
//! ```
//!
//! [`service::SyncService`] bundles the pieces into one start/stop unit.

pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod mqtt;
pub mod persistence;
pub mod service;

#[cfg(test)]
mod testing;
