//!
//! # Orchestrator
//!
//! Brings up the processes of one end-to-end scenario on a single host, hands off to an external
//! test runner once everything listens, and tears it all down again.
//!
//! A run is described by a [`RunContext`]: the configuration, the selected [`Scenario`], the
//! ports reserved for it and every process it launched. [`run_scenario`] drives the context
//! through its phases, each one timed on the context's [`TimerStack`], and always finishes with
//! [`RunContext::cleanup`], which is idempotent and best-effort. Dropping a context that was
//! never cleaned up kills whatever it still supervises.
//!
//! Processes are started by the [`launcher`] in their own process group with their output
//! appended to the run's [`UnifiedLog`], and are considered up once the [`readiness`] waiter can
//! connect to their port.

pub mod cleanup;
pub mod config;
pub mod context;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod launcher;
pub mod log_stream;
pub mod readiness;
pub mod scenario;
pub mod timer;
pub mod unified_log;
pub mod watchdog;

pub use cleanup::{CleanupReport, CleanupStep, StepOutcome};
pub use config::{CommandSpec, ConfigError, DaemonCommands, OrchestratorConfig};
pub use context::{prepare_run_dir, Party, PortLedger, PortPlan, RunContext, RunFlags};
pub use dispatcher::{plan_ports, run_scenario};
pub use error::{Error, FileIOError, Result};
pub use scenario::{Scenario, ScenarioSpec, Topology};
pub use timer::{PhaseTiming, TimerStack};
pub use unified_log::UnifiedLog;
