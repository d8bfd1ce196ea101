//! Worker supervisor built on `tokio::process`.
//!
//! [`WorkerSupervisor`] owns the lifecycle of the single simulation worker:
//! spawn, feed the run configuration, relay output, observe exit, stop.
//!
//! Each run gets three tasks:
//!
//! ```text
//!            ┌──────────────┐  stdout   ┌──────────────┐
//!  start ──► │ worker child │ ────────► │ stdout relay │ ──► LineFramer ──► RunPublisher
//!            └──────┬───────┘           └──────────────┘
//!                   │ stderr            ┌──────────────┐
//!                   ├─────────────────► │ stderr log   │
//!                   │ exit              └──────────────┘
//!                   ▼
//!            ┌──────────────┐
//!  stop ───► │ exit observer│ ──► drain stdout ──► artifact ──► terminal RunState
//!            └──────────────┘
//! ```
//!
//! All run state transitions happen while the supervisor's slot lock is held,
//! and that lock is never held across an `.await`.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use parking_lot::Mutex;
use simrelay_core::{
    ArtifactConfig, RelayConfig, RelayError, Result, RunConfig, RunId, RunState, StatusSnapshot,
    WorkerConfig, log_run_event,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::artifact;
use crate::bus::Broker;
use crate::framer::frame_reader;
use crate::publisher::{ResultPublisher, RunPublisher};
use crate::status::StatusStore;
use crate::types::{ExitOutcome, RunHandle, StopSignal};

/// The run currently owning the worker slot.
#[derive(Debug)]
struct ActiveRun {
    run_id: RunId,
    pid: Option<u32>,
    stop_tx: mpsc::Sender<StopSignal>,
    /// A stop was requested at some point during the run
    stop_requested: bool,
    /// Set when the process exit was observed; freezes `stop_before_exit`
    exited: bool,
    /// Whether the stop request came before the process exited
    stop_before_exit: bool,
}

#[derive(Debug)]
struct Slot {
    next_run_id: RunId,
    active: Option<ActiveRun>,
}

/// State shared between the supervisor and its exit observers.
#[derive(Debug)]
struct Shared {
    store: StatusStore,
    slot: Mutex<Slot>,
}

impl Shared {
    /// Note that the process has exited. Returns whether a stop preceded it.
    fn mark_exited(&self, run_id: RunId) -> bool {
        let mut slot = self.slot.lock();
        match slot.active.as_mut() {
            Some(active) if active.run_id == run_id && !active.exited => {
                active.exited = true;
                active.stop_before_exit = active.stop_requested;
                active.stop_before_exit
            }
            Some(active) if active.run_id == run_id => active.stop_before_exit,
            _ => false,
        }
    }

    /// Move the run to its terminal state and free the slot.
    ///
    /// Only the first notification for the current run has any effect.
    fn record_exit(&self, run_id: RunId, outcome: &ExitOutcome) -> bool {
        let mut slot = self.slot.lock();
        let stop_requested = match slot.active.as_ref() {
            Some(active) if active.run_id == run_id => {
                if active.exited {
                    active.stop_before_exit
                } else {
                    active.stop_requested
                }
            }
            _ => {
                debug!(run_id, "exit already recorded, ignoring notification");
                return false;
            }
        };

        let state = outcome.terminal_state(stop_requested);
        slot.active = None;
        self.store.set_state(state.clone());
        drop(slot);

        log_run_event!(run_id, "finished", state = %state);
        true
    }
}

/// Everything the exit observer needs besides the child itself.
struct RunContext {
    run_id: RunId,
    started: SystemTime,
    shared: Arc<Shared>,
    publisher: ResultPublisher,
    artifact: ArtifactConfig,
    drain_timeout: Duration,
}

/// Supervisor for the single simulation worker.
#[derive(Debug)]
pub struct WorkerSupervisor {
    worker: WorkerConfig,
    artifact: ArtifactConfig,
    publisher: ResultPublisher,
    shared: Arc<Shared>,
}

impl WorkerSupervisor {
    /// Create a supervisor publishing results to `broker`.
    pub fn new(config: &RelayConfig, broker: Arc<dyn Broker>) -> Self {
        let store = StatusStore::new();
        let publisher = ResultPublisher::new(&config.bus.results_topic, broker, store.clone());
        Self {
            worker: config.worker.clone(),
            artifact: config.artifact.clone(),
            publisher,
            shared: Arc::new(Shared {
                store,
                slot: Mutex::new(Slot {
                    next_run_id: 1,
                    active: None,
                }),
            }),
        }
    }

    /// Read-only status store.
    pub fn store(&self) -> &StatusStore {
        &self.shared.store
    }

    /// Current status.
    pub fn status(&self) -> StatusSnapshot {
        self.shared.store.snapshot()
    }

    /// Watch run state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.shared.store.subscribe_state()
    }

    /// Topic results are published on.
    pub fn results_topic(&self) -> &str {
        self.publisher.topic()
    }

    /// Start a new run.
    ///
    /// This will:
    /// 1. Reject the request if a worker is running or stopping
    /// 2. Spawn the worker and attach the stdout/stderr readers
    /// 3. Mark the run `Running`
    /// 4. Write the configuration to stdin and close it
    ///
    /// Returns as soon as the configuration is written; the worker keeps
    /// running in the background.
    #[instrument(level = "info", skip(self, config), fields(program = %self.worker.program))]
    pub async fn start(&self, config: RunConfig) -> Result<RunHandle> {
        let mut input = serde_json::to_vec(&config)
            .map_err(|e| RelayError::json_parse("run configuration", e))?;
        input.push(b'\n');

        let started_at = Utc::now();
        let started = SystemTime::now();

        let (handle, stdin, stdout, stderr, child, stop_rx) = {
            let mut slot = self.shared.slot.lock();
            if slot.active.is_some() || !self.shared.store.state().accepts_start() {
                return Err(RelayError::AlreadyRunning);
            }

            let mut child = match self.command().spawn() {
                Ok(child) => child,
                Err(e) => {
                    let err = RelayError::spawn(&self.worker.program, e);
                    warn!(error = %err, "worker failed to spawn");
                    self.shared.store.record_error(err.to_string());
                    return Err(err);
                }
            };

            let (Some(stdin), Some(stdout), Some(stderr)) =
                (child.stdin.take(), child.stdout.take(), child.stderr.take())
            else {
                let _ = child.start_kill();
                let err = RelayError::internal("worker stdio was not piped");
                self.shared.store.record_error(err.to_string());
                return Err(err);
            };

            let run_id = slot.next_run_id;
            slot.next_run_id += 1;

            let pid = child.id();
            let (stop_tx, stop_rx) = mpsc::channel(2);
            slot.active = Some(ActiveRun {
                run_id,
                pid,
                stop_tx,
                stop_requested: false,
                exited: false,
                stop_before_exit: false,
            });
            self.shared.store.begin_run(run_id, started_at);

            let handle = RunHandle {
                run_id,
                pid,
                started_at,
            };
            (handle, stdin, stdout, stderr, child, stop_rx)
        };

        log_run_event!(handle.run_id, "spawned", pid = ?handle.pid);

        // Readers are attached before any input is written
        let relay = tokio::spawn(relay_stdout(
            stdout,
            self.publisher.for_run(handle.run_id),
            self.worker.max_line_bytes,
        ));
        tokio::spawn(log_stderr(stderr, handle.run_id));

        let ctx = RunContext {
            run_id: handle.run_id,
            started,
            shared: Arc::clone(&self.shared),
            publisher: self.publisher.clone(),
            artifact: self.artifact.clone(),
            drain_timeout: self.worker.drain_timeout(),
        };
        tokio::spawn(observe_exit(ctx, child, stop_rx, relay));

        // The exit observer reports whatever the worker does next
        let write_limit = self.worker.drain_timeout();
        match timeout(write_limit, write_input(stdin, &input)).await {
            Ok(Ok(())) => {
                debug!(run_id = handle.run_id, bytes = input.len(), "configuration sent, stdin closed");
            }
            Ok(Err(e)) => {
                warn!(run_id = handle.run_id, error = %e, "worker did not accept configuration");
            }
            Err(_) => {
                // Dropping the write future closes stdin
                warn!(
                    run_id = handle.run_id,
                    timeout_ms = millis(write_limit),
                    "worker is not reading its configuration, closing stdin"
                );
            }
        }

        info!(run_id = handle.run_id, pid = ?handle.pid, "worker started");
        Ok(handle)
    }

    /// Ask the running worker to terminate.
    ///
    /// Returns once the signal is queued; the run reaches its terminal state
    /// when the process actually exits.
    #[instrument(level = "info", skip(self))]
    pub fn stop(&self) -> Result<()> {
        let mut slot = self.shared.slot.lock();
        let active = match slot.active.as_mut() {
            Some(active) if !active.stop_requested => active,
            _ => return Err(RelayError::NotRunning),
        };

        active.stop_requested = true;
        self.shared.store.set_state(RunState::Stopping);
        if active.stop_tx.try_send(StopSignal::Terminate).is_err() {
            debug!(run_id = active.run_id, "exit observer no longer listening");
        }

        log_run_event!(active.run_id, "stop_requested", pid = ?active.pid);
        Ok(())
    }

    /// Force-kill a worker that is ignoring a stop request.
    #[instrument(level = "info", skip(self))]
    pub fn kill(&self) -> Result<()> {
        let slot = self.shared.slot.lock();
        match slot.active.as_ref() {
            Some(active) if active.stop_requested => {
                let _ = active.stop_tx.try_send(StopSignal::Kill);
                log_run_event!(active.run_id, "kill_requested", pid = ?active.pid);
                Ok(())
            }
            _ => Err(RelayError::NotRunning),
        }
    }

    /// Wait until no worker is active, returning the resulting state.
    pub async fn wait_for_terminal(&self, limit: Duration) -> Result<RunState> {
        let mut rx = self.subscribe_state();
        let wait = async {
            loop {
                let state = rx.borrow_and_update().clone();
                if !state.is_active() {
                    return state;
                }
                if rx.changed().await.is_err() {
                    return self.shared.store.state();
                }
            }
        };

        timeout(limit, wait).await.map_err(|_| RelayError::ExitTimeout {
            timeout_ms: millis(limit),
        })
    }

    /// Stop any running worker and wait for it to exit.
    ///
    /// A worker still alive after `grace` is killed.
    pub async fn shutdown(&self, grace: Duration) -> Result<RunState> {
        match self.stop() {
            Ok(()) => info!("stopping worker for shutdown"),
            Err(RelayError::NotRunning) => {}
            Err(e) => return Err(e),
        }

        match self.wait_for_terminal(grace).await {
            Ok(state) => Ok(state),
            Err(RelayError::ExitTimeout { .. }) => {
                warn!(grace_ms = millis(grace), "worker ignored stop, killing");
                let _ = self.kill();
                self.wait_for_terminal(grace).await
            }
            Err(e) => Err(e),
        }
    }

    /// Feed a process exit notification for `run_id`.
    #[cfg(test)]
    pub(crate) fn record_exit(&self, run_id: RunId, outcome: ExitOutcome) -> bool {
        self.shared.record_exit(run_id, &outcome)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.worker.program);
        cmd.args(&self.worker.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.worker.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.worker.env);

        cmd
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Write the configuration and close stdin.
async fn write_input(mut stdin: ChildStdin, input: &[u8]) -> Result<()> {
    let to_err = |e: std::io::Error| RelayError::WorkerInput {
        message: e.to_string(),
    };
    stdin.write_all(input).await.map_err(to_err)?;
    stdin.flush().await.map_err(to_err)?;
    stdin.shutdown().await.map_err(to_err)?;
    drop(stdin);
    Ok(())
}

/// Frame stdout and publish every document, in order, until EOF.
async fn relay_stdout(stdout: ChildStdout, mut run: RunPublisher, max_line_bytes: usize) -> RunPublisher {
    let stats = frame_reader(stdout, max_line_bytes, |document| {
        run.publish(document);
    })
    .await;

    debug!(
        run_id = run.run_id(),
        fragments = stats.fragments,
        discarded = stats.discarded,
        bytes = stats.bytes,
        "worker output closed"
    );
    run
}

/// Surface worker diagnostics in the relay log.
async fn log_stderr(stderr: ChildStderr, run_id: RunId) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    warn!(target: "simrelay::worker::stderr", run_id, "{text}");
                }
            }
            Err(e) => {
                debug!(run_id, error = %e, "reading worker stderr failed");
                break;
            }
        }
    }
}

/// Wait for the worker to exit, delivering stop signals meanwhile, then
/// settle the run.
async fn observe_exit(
    ctx: RunContext,
    mut child: Child,
    mut stop_rx: mpsc::Receiver<StopSignal>,
    mut relay: JoinHandle<RunPublisher>,
) {
    let run_id = ctx.run_id;

    let outcome = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => ExitOutcome::from(status),
                    Err(e) => ExitOutcome::WaitError(format!("waiting for worker failed: {e}")),
                };
            }
            Some(signal) = stop_rx.recv() => {
                if let Err(e) = deliver(&mut child, signal) {
                    warn!(run_id, ?signal, error = %e, "failed to signal worker");
                }
            }
        }
    };

    let stopped = ctx.shared.mark_exited(run_id);
    log_run_event!(run_id, "exited", exit_code = ?outcome.code(), stopped);

    let run = match timeout(ctx.drain_timeout, &mut relay).await {
        Ok(Ok(run)) => run,
        Ok(Err(e)) => {
            warn!(run_id, error = %e, "stdout relay task failed");
            ctx.publisher.for_run(run_id)
        }
        Err(_) => {
            warn!(
                run_id,
                timeout_ms = millis(ctx.drain_timeout),
                "worker stdout still open after exit, abandoning it"
            );
            relay.abort();
            ctx.publisher.for_run(run_id)
        }
    };

    publish_artifact(&ctx, run).await;

    ctx.shared.record_exit(run_id, &outcome);
}

/// Publish the final artifact, if one is configured and present.
async fn publish_artifact(ctx: &RunContext, mut run: RunPublisher) {
    match artifact::collect(&ctx.artifact, ctx.started).await {
        Ok(Some(document)) => {
            let fragment = run.publish(document);
            info!(run_id = ctx.run_id, seq = fragment.seq, "final artifact published");
        }
        Ok(None) => {}
        Err(e) => {
            info!(run_id = ctx.run_id, error = %e, "no final artifact published");
        }
    }
}

/// Deliver a stop signal to the child.
fn deliver(child: &mut Child, signal: StopSignal) -> std::io::Result<()> {
    match signal {
        StopSignal::Terminate => terminate(child),
        StopSignal::Kill => child.start_kill(),
    }
}

/// Send SIGTERM so the worker can shut down on its own terms.
#[cfg(unix)]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        // Already reaped
        return Ok(());
    };
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;

    // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs to
    // a child we have not reaped yet, so it cannot have been reused.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}
