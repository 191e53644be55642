//! Lifecycle of the Tailwind CSS watch process.
//!
//! A [`ProcessSupervisor`] spawns the watcher once, relays every line it
//! prints through the [`BroadcastHub`], and reports its exit. Cancellation
//! runs the terminate / grace period / kill sequence before the supervisor
//! task finishes.

pub mod classify;
pub mod command;
pub mod terminate;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::hub::BroadcastHub;
use crate::message::{types, Message, DONE_PREFIX};

pub use classify::{classify, StreamKind};
pub use command::{build_arguments, Invocation, ProjectLayout};

/// Default time the watcher gets between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Output still buffered in the pipes after exit is relayed for at most this long.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Lines read but not yet broadcast. Readers wait when this is full, so
/// output is never dropped.
const LINE_CHANNEL_CAPACITY: usize = 1024;

pub const STARTED_MESSAGE: &str = "Tailwind CSS watcher started";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessState {
    Idle,
    Starting,
    Running,
    Stopped { code: i32 },
    /// Non-zero exit, or `code: None` when the process never started.
    Crashed { code: Option<i32> },
    Cancelled,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Stopped { .. } | Self::Crashed { .. } | Self::Cancelled
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("supervisor already started (state: {0:?})")]
    AlreadyStarted(ProcessState),
}

/// Owns the watch process for the lifetime of the service.
pub struct ProcessSupervisor {
    invocation: Invocation,
    hub: BroadcastHub,
    grace_period: Duration,
    state: Arc<watch::Sender<ProcessState>>,
}

impl ProcessSupervisor {
    pub fn new(invocation: Invocation, hub: BroadcastHub) -> Self {
        let (state, _) = watch::channel(ProcessState::Idle);
        Self {
            invocation,
            hub,
            grace_period: DEFAULT_GRACE_PERIOD,
            state: Arc::new(state),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    /// Spawn the watcher on a background task.
    ///
    /// Only valid once, from `Idle`. The returned handle cancels and joins
    /// the task; `cancel` may also be a child of a wider shutdown token.
    pub fn start(&self, cancel: CancellationToken) -> Result<SupervisorHandle, SupervisorError> {
        let mut previous = ProcessState::Idle;
        let started = self.state.send_if_modified(|state| {
            previous = *state;
            if *state == ProcessState::Idle {
                *state = ProcessState::Starting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(SupervisorError::AlreadyStarted(previous));
        }

        let run = Run {
            invocation: self.invocation.clone(),
            hub: self.hub.clone(),
            grace_period: self.grace_period,
            state: self.state.clone(),
        };
        let task = tokio::spawn(run.execute(cancel.clone()));

        Ok(SupervisorHandle {
            cancel,
            task,
            state: self.state.subscribe(),
            grace_period: self.grace_period,
        })
    }
}

/// Control handle for a started supervisor.
#[derive(Debug)]
pub struct SupervisorHandle {
    cancel: CancellationToken,
    task: JoinHandle<ProcessState>,
    state: watch::Receiver<ProcessState>,
    grace_period: Duration,
}

impl SupervisorHandle {
    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    /// Upper bound on how long [`stop`](Self::stop) needs once cancelled:
    /// terminate, drain, then the final stopped event.
    pub fn stop_budget(&self) -> Duration {
        self.grace_period + terminate::REAP_TIMEOUT + DRAIN_TIMEOUT * 2
    }

    /// Wait for the watcher to exit on its own.
    pub async fn wait(self) -> Option<ProcessState> {
        match self.task.await {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::error!(error = %e, "supervisor task failed");
                None
            }
        }
    }

    /// Cancel the supervisor and wait up to `timeout` for it to finish its
    /// terminate sequence. On timeout the task is aborted, which kills the
    /// process group outright.
    pub async fn stop(self, timeout: Duration) -> Option<ProcessState> {
        self.cancel.cancel();
        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(state)) => Some(state),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "supervisor task failed");
                None
            }
            Err(_) => {
                tracing::warn!(?timeout, "supervisor did not stop in time, aborting");
                task.abort();
                None
            }
        }
    }
}

enum Exit {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
}

struct Run {
    invocation: Invocation,
    hub: BroadcastHub,
    grace_period: Duration,
    state: Arc<watch::Sender<ProcessState>>,
}

impl Run {
    async fn execute(self, cancel: CancellationToken) -> ProcessState {
        if cancel.is_cancelled() {
            return self.transition(ProcessState::Cancelled);
        }

        tracing::info!(
            command = %self.invocation,
            cwd = ?self.invocation.working_dir,
            "starting tailwind watcher"
        );

        let mut child = match self.invocation.command().spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(program = %self.invocation.program, error = %e, "failed to spawn tailwind watcher");
                return self.transition(ProcessState::Crashed { code: None });
            }
        };
        let pid = child.id();
        let mut group = terminate::GroupKillGuard::new(&child);

        let (line_tx, mut line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_lines(stdout, StreamKind::Stdout, line_tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_lines(stderr, StreamKind::Stderr, line_tx.clone())));
        }
        drop(line_tx);

        self.transition(ProcessState::Running);
        tracing::info!(?pid, "tailwind watcher started");
        // A slow client can hold a broadcast for the full send timeout, so
        // every broadcast races the cancellation signal.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = self.hub.publish(types::STARTED, STARTED_MESSAGE) => {}
        }

        let exit = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Exit::Cancelled,
                status = child.wait() => break Exit::Exited(status),
                Some((stream, line)) = line_rx.recv() => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break Exit::Cancelled,
                        _ = self.relay(stream, line) => {}
                    }
                }
            }
        };

        let (state, stop_code) = match exit {
            Exit::Exited(Ok(status)) => {
                group.disarm();
                self.drain(&mut line_rx).await;
                let code = terminate::exit_code(status);
                tracing::info!(?pid, code, "tailwind process exited");
                let state = if code == 0 {
                    ProcessState::Stopped { code }
                } else {
                    ProcessState::Crashed { code: Some(code) }
                };
                (state, Some(code))
            }
            Exit::Exited(Err(e)) => {
                tracing::error!(?pid, error = %e, "failed waiting for tailwind process");
                (ProcessState::Crashed { code: None }, None)
            }
            Exit::Cancelled => {
                tracing::info!(?pid, "tailwind watcher cancelled");
                self.transition(ProcessState::Cancelled);
                let status = terminate::terminate(&mut child, self.grace_period).await;
                if status.is_some() {
                    group.disarm();
                }
                self.drain(&mut line_rx).await;
                (ProcessState::Cancelled, status.map(terminate::exit_code))
            }
        };

        for reader in &readers {
            reader.abort();
        }

        if let Some(code) = stop_code {
            let text = format!("Tailwind process exited with code: {code}");
            let stopped = self.hub.publish(types::STOPPED, &text);
            if cancel.is_cancelled() {
                if tokio::time::timeout(DRAIN_TIMEOUT, stopped).await.is_err() {
                    tracing::debug!("stopped event not delivered before shutdown deadline");
                }
            } else {
                stopped.await;
            }
        }
        self.transition(state)
    }

    async fn relay(&self, stream: StreamKind, line: String) {
        if line.is_empty() {
            return;
        }
        let kind = classify(stream, &line);
        if kind == types::ERROR {
            tracing::error!("tailwind: {line}");
        } else {
            tracing::info!("tailwind: {line}");
            if line.starts_with(DONE_PREFIX) {
                tracing::debug!("tailwind rebuild finished");
            }
        }
        self.hub.broadcast(&Message::now(kind, line)).await;
    }

    /// Relay what is still queued once the process is gone. Bounded, since a
    /// grandchild can keep the pipes open after the watcher exits.
    async fn drain(&self, line_rx: &mut mpsc::Receiver<(StreamKind, String)>) {
        let relay_all = async {
            while let Some((stream, line)) = line_rx.recv().await {
                self.relay(stream, line).await;
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, relay_all).await.is_err() {
            tracing::debug!("output still open after exit, not waiting further");
        }
        line_rx.close();
    }

    /// Move to `next` unless a terminal state was already reached.
    fn transition(&self, next: ProcessState) -> ProcessState {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        *self.state.borrow()
    }
}

async fn read_lines<R>(reader: R, stream: StreamKind, tx: mpsc::Sender<(StreamKind, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send((stream, line)).await.is_err() {
                    tracing::debug!(?stream, "line channel closed");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(?stream, error = %e, "error reading watcher output");
                break;
            }
        }
    }
    tracing::debug!(?stream, "watcher output reader finished");
}
