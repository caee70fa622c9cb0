//! Groundstation: collects heartbeats and GPU telemetry from satellites,
//! keeps history bounded, and revives satellites that stop reporting.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod monitor;
pub mod retention;
pub mod server;
pub mod tunnel;
pub mod types;
