//! Updraft Client Update System
//!
//! Acquires the latest artifact and decides whether it is safe to install.
//!
//! Components:
//! - `capabilities` - Platform seams (transport, notifications, persistence, ...)
//! - `kv` - Local key/value stores
//! - `state` - Session, pending-install and verification records
//! - `trust` - Trust-on-first-use signer pinning
//! - `backoff` / `scheduler` - Timer-driven retries
//! - `orchestrator` - One verification attempt
//! - `session` - Start, discard and inspect download sessions
//! - `download` - HTTP download transport with resume
//! - `verify` - Embedded signature inspection and publisher tooling
//! - `client` - Backend client
//! - `probe` - Installed-version probe
//! - `device` - Stable device id
//! - `notify` - Terminal notification sink

pub mod backoff;
pub mod capabilities;
pub mod client;
pub mod device;
pub mod download;
pub mod kv;
pub mod notify;
pub mod orchestrator;
pub mod probe;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod trust;
pub mod verify;

pub use orchestrator::{Orchestrator, Verdict};
pub use scheduler::{RetryScheduler, ScheduleOutcome};
pub use session::UpdateSession;
pub use state::LocalRecords;
pub use trust::TrustStore;
