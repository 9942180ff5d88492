//! File-backed state of the agent. Everything lives in the application directory:
//!  - [session_store::SessionStore] keeps small scalar values (token, display name, flags) in
//!    a single JSON object file.
//!  - [payload_log::PayloadLog] is an append-only newline-delimited JSON queue of telemetry
//!    payloads that couldn't be sent yet.

pub mod payload_log;
pub mod session_store;

pub const SESSION_FILE: &str = "session.json";
pub const PAYLOAD_LOG_FILE: &str = "data.json";
pub const SESSION_SUMMARY_FILE: &str = "sessionSummary.json";
pub const DASHBOARD_FILE: &str = "CodeTime.txt";
