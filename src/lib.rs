//! Probe Harness Library
//!
//! Runs a tracing script (DTrace, bpftrace, or any command template) against
//! a freshly materialized target program and hands back everything the
//! script printed, one line per event, together with the paths of both
//! files. Also exposes the user/group database enumeration that probe
//! scenarios exercise.

pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod etc;
pub mod harness;
pub mod lifecycle;
pub mod logging;
pub mod materialize;
pub mod record;
pub mod scenario;

pub use config::{EngineKind, HarnessConfig};
pub use engine::TraceEngine;
pub use error::{ErrorKind, HarnessError};
pub use harness::Harness;
pub use record::{CaptureRecord, ChildStatus};
pub use scenario::{error_kind, trap_probe, with_record};
