//! Contracts of the workloads a policy manages and of the host's error hook.

use std::fmt;

use tracing::warn;

/// A unit of work that must only run on the leader.
///
/// Implementations are owned by the host; the policy only flips them between
/// started and stopped.
pub trait Workload: Send + Sync {
    /// Stable identifier, unique within one policy.
    fn id(&self) -> &str;

    /// Enable or disable starting on the host's own initiative.
    fn set_auto_startup(&self, auto_startup: bool);

    /// Start the workload.
    fn start(&self) -> anyhow::Result<()>;

    /// Stop the workload.
    fn stop(&self) -> anyhow::Result<()>;
}

/// Transition a policy attempted on a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadAction {
    /// `Workload::start`
    Start,
    /// `Workload::stop`
    Stop,
}

impl fmt::Display for WorkloadAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadAction::Start => f.write_str("start"),
            WorkloadAction::Stop => f.write_str("stop"),
        }
    }
}

/// Receives workload failures instead of the event-dispatch caller.
pub trait ExceptionHandler: Send + Sync {
    /// Report that `action` failed for `workload_id`.
    fn handle_exception(&self, action: WorkloadAction, workload_id: &str, error: &anyhow::Error);
}

/// Default handler: logs the failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingExceptionHandler;

impl ExceptionHandler for LoggingExceptionHandler {
    fn handle_exception(&self, action: WorkloadAction, workload_id: &str, error: &anyhow::Error) {
        warn!(workload = %workload_id, action = %action, error = %error, "workload transition failed");
    }
}
