//! Execution supervision.
//!
//! The evaluator has no way to be preempted from outside, so the supervisor
//! runs it on a dedicated worker thread and races the worker's report
//! against a wall-clock deadline. Whichever comes first decides the outcome.
//!
//! Losing the race does not stop the worker. It keeps running until the
//! script ends on its own (or, with `reap_abandoned`, until the evaluator's
//! next progress check); its report goes into a one-slot channel nobody
//! reads. The caller's wait is bounded, the worker's resource use is not.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::binder::Program;
use super::capabilities::CapabilitySet;
use super::evaluator::{build_engine, stop_when, EngineLimits, LanguageFeatures, PrintLog};
use super::outcome::ExecutionOutcome;
use super::{SandboxConfig, ScriptError};

/// Supervisor lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    /// Nothing dispatched yet
    Pending,
    /// Worker dispatched, deadline running
    Running,
    /// Worker finished without error
    Completed,
    /// Worker finished with an error
    Failed,
    /// Deadline elapsed first
    TimedOut,
}

impl SupervisorState {
    /// Whether no further transition can happen
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

type WorkerResult = Result<Vec<String>, ScriptError>;

/// Everything the worker needs, moved onto its thread
pub struct WorkerJob {
    program: Program,
    capabilities: CapabilitySet,
    features: LanguageFeatures,
    limits: EngineLimits,
}

impl WorkerJob {
    /// Bundle a bound program with its capabilities and engine settings
    #[must_use]
    pub const fn new(
        program: Program,
        capabilities: CapabilitySet,
        features: LanguageFeatures,
        limits: EngineLimits,
    ) -> Self {
        Self {
            program,
            capabilities,
            features,
            limits,
        }
    }
}

/// Runs one program to completion or deadline
pub struct ExecutionSupervisor {
    id: Uuid,
    deadline: Duration,
    reap_abandoned: bool,
    state: SupervisorState,
}

impl ExecutionSupervisor {
    /// Create a supervisor for one request
    #[must_use]
    pub fn new(id: Uuid, config: &SandboxConfig) -> Self {
        Self {
            id,
            deadline: config.deadline(),
            reap_abandoned: config.reap_abandoned,
            state: SupervisorState::Pending,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SupervisorState {
        self.state
    }

    /// Run `job` on a worker thread and wait for it, at most until the deadline
    pub async fn run(&mut self, job: WorkerJob) -> ExecutionOutcome {
        let started = Instant::now();
        let (tx, rx) = oneshot::channel();
        let abandoned = match self.dispatch(job, move |result| {
            let _ = tx.send(result);
        }) {
            Ok(flag) => flag,
            Err(err) => return self.settle(Err(err), started),
        };

        let result = match tokio::time::timeout(self.deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(worker_lost()),
            Err(_) => {
                abandoned.store(true, Ordering::Relaxed);
                Err(ScriptError::Timeout)
            }
        };

        self.settle(result, started)
    }

    /// Blocking counterpart of [`run`](Self::run) for callers without a runtime
    pub fn run_blocking(&mut self, job: WorkerJob) -> ExecutionOutcome {
        let started = Instant::now();
        let (tx, rx) = mpsc::sync_channel(1);
        let abandoned = match self.dispatch(job, move |result| {
            let _ = tx.send(result);
        }) {
            Ok(flag) => flag,
            Err(err) => return self.settle(Err(err), started),
        };

        let result = match rx.recv_timeout(self.deadline) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(worker_lost()),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                abandoned.store(true, Ordering::Relaxed);
                Err(ScriptError::Timeout)
            }
        };

        self.settle(result, started)
    }

    /// Pending -> Running: start the worker
    fn dispatch<F>(&mut self, job: WorkerJob, report: F) -> Result<Arc<AtomicBool>, ScriptError>
    where
        F: FnOnce(WorkerResult) + Send + 'static,
    {
        let abandoned = Arc::new(AtomicBool::new(false));
        let stop = self.reap_abandoned.then(|| Arc::clone(&abandoned));
        let id = self.id;

        debug!(request_id = %id, script_bytes = job.program.source().len(), "dispatching script");
        thread::Builder::new()
            .name(format!("script-{id}"))
            .spawn(move || report(evaluate(job, stop)))
            .map_err(|e| ScriptError::WorkerLost(format!("could not start worker: {e}")))?;

        self.state = SupervisorState::Running;
        Ok(abandoned)
    }

    /// Running -> terminal
    fn settle(&mut self, result: WorkerResult, started: Instant) -> ExecutionOutcome {
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        self.state = match &result {
            Ok(_) => SupervisorState::Completed,
            Err(ScriptError::Timeout) => SupervisorState::TimedOut,
            Err(_) => SupervisorState::Failed,
        };

        match &result {
            Ok(lines) => {
                info!(request_id = %self.id, elapsed_ms, lines = lines.len(), "script completed");
            }
            Err(ScriptError::Timeout) => {
                warn!(request_id = %self.id, elapsed_ms, "script timed out");
            }
            Err(err) => {
                warn!(request_id = %self.id, elapsed_ms, kind = err.kind(), "script failed: {err}");
            }
        }

        ExecutionOutcome::from_result(result)
    }
}

fn worker_lost() -> ScriptError {
    ScriptError::WorkerLost("script worker exited without reporting a result".to_string())
}

/// Body of the worker thread
fn evaluate(job: WorkerJob, stop: Option<Arc<AtomicBool>>) -> WorkerResult {
    let WorkerJob {
        program,
        capabilities,
        features,
        limits,
    } = job;

    let log = PrintLog::with_limit(limits.max_output_bytes);
    let mut engine = build_engine(&features, &limits, &log);
    if let Some(flag) = stop {
        stop_when(&mut engine, flag);
    }
    let registered = capabilities.names();
    capabilities
        .install(&mut engine)
        .map_err(|e| ScriptError::Network(e.to_string()))?;

    let ast = program.compile(&engine)?;
    let mut scope = program.into_scope();
    engine
        .run_ast_with_scope(&mut scope, &ast)
        .map_err(|e| ScriptError::from_eval(e, &registered))?;

    Ok(log.lines())
}
