//! Keeps an editor's Code Time session in sync with the remote analytics service. Telemetry is
//! buffered on disk while offline and uploaded in bounded batches once the service is reachable
//! again.
//!

pub mod agent;
pub mod api;
pub mod cli;
pub mod config;
pub mod controller;
pub mod editor;
pub mod storage;
pub mod sync;
pub mod utils;
