use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::demux::{sentinel_echo_command, OutputDemux, StreamItem};
use crate::detector::CrashDetector;
use crate::error::{EngineError, Result};
use crate::event::{AsyncEvent, Breakpoint, CommandResult, SessionState};
use crate::launch::{strategy_for, LaunchSpec};
use crate::transport::TransportHandle;

const REQUEST_CHANNEL_CAPACITY: usize = 32;
const RECENT_LINES_KEPT: usize = 50;
const INTERRUPT_PROBE: &str = "process status";

/// How signals reach the debugged process. A seam so session logic can be
/// exercised against scripted transports without signaling anything real.
#[derive(Clone, Copy)]
pub(crate) struct SignalDelivery {
    pub interrupt: fn(u32) -> std::io::Result<()>,
    pub kill: fn(u32) -> std::io::Result<()>,
}

fn deliver_interrupt(pid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGINT,
        )
        .map_err(std::io::Error::other)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(std::io::Error::other("interrupt signaling is unix-only"))
    }
}

fn deliver_kill(pid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        )
        .map_err(std::io::Error::other)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(std::io::Error::other("kill signaling is unix-only"))
    }
}

impl Default for SignalDelivery {
    fn default() -> Self {
        Self {
            interrupt: deliver_interrupt,
            kill: deliver_kill,
        }
    }
}

enum CommandReply {
    User(oneshot::Sender<Result<CommandResult>>),
    Breakpoint {
        location: String,
        reply: oneshot::Sender<Result<Breakpoint>>,
    },
}

struct QueuedCommand {
    text: String,
    timeout: Duration,
    reply: CommandReply,
}

struct PendingCommand {
    seq: u64,
    sentinel: String,
    buffer: String,
    deadline: Instant,
    timeout: Duration,
    reply: CommandReply,
}

struct InterruptWait {
    reply: oneshot::Sender<Result<CommandResult>>,
    deadline: Instant,
}

enum SessionRequest {
    Command {
        text: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<CommandResult>>,
    },
    Interrupt {
        reply: oneshot::Sender<Result<CommandResult>>,
    },
    AddBreakpoint {
        location: String,
        reply: oneshot::Sender<Result<Breakpoint>>,
    },
    ListBreakpoints {
        reply: oneshot::Sender<Vec<Breakpoint>>,
    },
    Detach {
        reply: oneshot::Sender<SessionState>,
    },
    Terminate {
        reply: oneshot::Sender<SessionState>,
    },
}

/// Handle to one persistent debugger conversation.
///
/// All mutable session state lives in the event-loop task; this handle
/// only passes messages, which is what eliminates races between caller
/// operations and asynchronous notifications.
#[derive(Clone)]
pub struct Session {
    target_key: String,
    requests: mpsc::Sender<SessionRequest>,
    state: watch::Receiver<SessionState>,
    pid: Arc<OnceLock<u32>>,
    crash_reason: Arc<OnceLock<String>>,
    command_timeout: Duration,
}

impl Session {
    /// Starts a target under the debugger per the selected launch
    /// strategy and waits for the launch handshake to settle.
    ///
    /// Returns `Err` only for spawn/plan failures; a target that crashes
    /// during launch yields `Ok` with the session in `Crashed`, carrying
    /// the reason, so callers can inspect it.
    pub async fn launch(config: &EngineConfig, spec: &LaunchSpec) -> Result<Session> {
        let strategy = strategy_for(&spec.target);
        info!(
            "launching '{}' via {} strategy",
            spec.target.key(),
            strategy.name()
        );
        let plan = strategy.plan(spec, config).await?;
        let transport = TransportHandle::spawn(&config.debugger_path, &plan.debugger_args)?;
        let (session, settled) = Session::start_with(
            config.clone(),
            spec.target.key(),
            spec.stop_at_entry,
            plan.commands,
            plan.attach_pid,
            transport,
            SignalDelivery::default(),
        );
        let _ = settled.await;
        Ok(session)
    }

    /// Attaches to an already-running process id.
    pub async fn attach(config: &EngineConfig, pid: u32) -> Result<Session> {
        let spec = LaunchSpec {
            target: crate::launch::TargetSpec::Pid(pid),
            stop_at_entry: true,
        };
        Self::launch(config, &spec).await
    }

    pub(crate) fn start_with(
        config: EngineConfig,
        target_key: String,
        stop_at_entry: bool,
        launch_commands: Vec<String>,
        attach_pid: Option<u32>,
        mut transport: TransportHandle,
        signals: SignalDelivery,
    ) -> (Session, oneshot::Receiver<()>) {
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(SessionState::Created);
        let (settled_tx, settled_rx) = oneshot::channel();
        let pid = Arc::new(OnceLock::new());
        if let Some(p) = attach_pid {
            let _ = pid.set(p);
        }
        let command_timeout = config.command_timeout;
        let crash_reason = Arc::new(OnceLock::new());

        // Present by construction; the empty-channel fallback surfaces as
        // an immediate stream end if that ever stops holding.
        let output = transport.take_output().unwrap_or_else(|| {
            let (_tx, rx) = mpsc::channel(1);
            rx
        });

        let launch_deadline = Instant::now() + config.launch_timeout;
        let event_loop = SessionLoop {
            config,
            target_key: target_key.clone(),
            stop_at_entry,
            launch_commands,
            transport,
            signals,
            demux: OutputDemux::default(),
            detector: CrashDetector::default(),
            state: SessionState::Created,
            state_tx,
            pid: pid.clone(),
            pending: None,
            queued: VecDeque::new(),
            stale_sentinels: HashSet::new(),
            breakpoints: BTreeMap::new(),
            next_seq: 0,
            interrupt: None,
            settled: Some(settled_tx),
            launch_deadline,
            last_stop_reason: None,
            recent_lines: VecDeque::new(),
            crash_reason: None,
            crash_reason_cell: crash_reason.clone(),
        };
        tokio::spawn(event_loop.run(requests_rx, output));

        let session = Session {
            target_key,
            requests: requests_tx,
            state: state_rx,
            pid,
            crash_reason,
            command_timeout,
        };
        (session, settled_rx)
    }

    pub fn target_key(&self) -> &str {
        &self.target_key
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Process id of the debugged target, once known. Never changes for
    /// the lifetime of the session.
    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// Why the session crashed, if it did.
    pub fn crash_reason(&self) -> Option<String> {
        self.crash_reason.get().cloned()
    }

    /// Issues one debugger command and waits for its completion sentinel.
    ///
    /// Rejected immediately, with no transport round trip, unless the
    /// session is `Running` or `Stopped`. Concurrent calls are queued
    /// behind the in-flight command, so completions are FIFO.
    pub async fn send_command(
        &self,
        text: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<CommandResult> {
        let snapshot = self.state();
        if !snapshot.accepts_commands() {
            return Err(EngineError::Closed(format!(
                "cannot send command while session is {snapshot}"
            )));
        }
        let (tx, rx) = oneshot::channel();
        let request = SessionRequest::Command {
            text: text.into(),
            timeout: timeout.unwrap_or(self.default_timeout()),
            reply: tx,
        };
        self.send_request(request, rx).await
    }

    /// Signals the target to stop and waits for the resulting stop
    /// notification, which is attributed to this interrupt even if other
    /// commands are in flight.
    pub async fn interrupt(&self) -> Result<CommandResult> {
        let (tx, rx) = oneshot::channel();
        self.send_request(SessionRequest::Interrupt { reply: tx }, rx)
            .await
    }

    pub async fn add_breakpoint(&self, location: impl Into<String>) -> Result<Breakpoint> {
        let (tx, rx) = oneshot::channel();
        let request = SessionRequest::AddBreakpoint {
            location: location.into(),
            reply: tx,
        };
        self.send_request(request, rx).await
    }

    pub async fn list_breakpoints(&self) -> Vec<Breakpoint> {
        let (tx, rx) = oneshot::channel();
        if self
            .requests
            .send(SessionRequest::ListBreakpoints { reply: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Graceful detach, falling back to teardown. Calling this on an
    /// already-terminal session is a no-op that reports the final state.
    pub async fn detach(&self) -> SessionState {
        self.terminal_request(|reply| SessionRequest::Detach { reply })
            .await
    }

    /// Kills the target and tears the session down.
    pub async fn terminate(&self) -> SessionState {
        self.terminal_request(|reply| SessionRequest::Terminate { reply })
            .await
    }

    async fn terminal_request(
        &self,
        make: impl FnOnce(oneshot::Sender<SessionState>) -> SessionRequest,
    ) -> SessionState {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(make(tx)).await.is_err() {
            // Loop already gone; the watch holds the final state.
            return self.state();
        }
        rx.await.unwrap_or_else(|_| self.state())
    }

    async fn send_request<T>(
        &self,
        request: SessionRequest,
        rx: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        self.requests.send(request).await.map_err(|_| {
            EngineError::Closed(format!("session ended ({})", self.state()))
        })?;
        rx.await
            .map_err(|_| EngineError::Closed(format!("session ended ({})", self.state())))?
    }

    fn default_timeout(&self) -> Duration {
        self.command_timeout
    }
}

struct SessionLoop {
    config: EngineConfig,
    target_key: String,
    stop_at_entry: bool,
    launch_commands: Vec<String>,
    transport: TransportHandle,
    signals: SignalDelivery,
    demux: OutputDemux,
    detector: CrashDetector,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    pid: Arc<OnceLock<u32>>,
    pending: Option<PendingCommand>,
    queued: VecDeque<QueuedCommand>,
    stale_sentinels: HashSet<String>,
    breakpoints: BTreeMap<u32, String>,
    next_seq: u64,
    interrupt: Option<InterruptWait>,
    settled: Option<oneshot::Sender<()>>,
    launch_deadline: Instant,
    last_stop_reason: Option<String>,
    recent_lines: VecDeque<String>,
    crash_reason: Option<String>,
    crash_reason_cell: Arc<OnceLock<String>>,
}

impl SessionLoop {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<SessionRequest>,
        mut output: mpsc::Receiver<Vec<u8>>,
    ) {
        self.set_state(SessionState::Launching);
        for command in std::mem::take(&mut self.launch_commands) {
            if let Err(err) = self.transport.write_line(&command) {
                self.apply_event(AsyncEvent::ProcessCrashed {
                    reason: format!("launch failed: {err}"),
                });
                break;
            }
        }

        let mut stream_closed = false;
        loop {
            if stream_closed
                || (self.state.is_terminal()
                    && self.pending.is_none()
                    && self.interrupt.is_none())
            {
                break;
            }

            let deadline = self.next_deadline();
            tokio::select! {
                maybe_request = requests.recv() => match maybe_request {
                    Some(request) => self.handle_request(request),
                    None => {
                        // Every handle dropped; nothing can observe this
                        // session any more.
                        self.teardown(SessionState::Terminated, "all session handles dropped");
                    }
                },
                maybe_chunk = output.recv() => match maybe_chunk {
                    Some(bytes) => self.ingest(&bytes),
                    None => {
                        stream_closed = true;
                        self.on_stream_end();
                    }
                },
                _ = async { tokio::time::sleep_until(deadline.unwrap()).await },
                    if deadline.is_some() => self.on_deadline(),
            }
        }

        self.teardown(
            if self.state.is_terminal() { self.state } else { SessionState::Terminated },
            "session loop exited",
        );
        debug!("session '{}' loop finished in {}", self.target_key, self.state);
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut consider = |candidate: Instant| match next {
            Some(current) if current <= candidate => {}
            _ => next = Some(candidate),
        };
        if let Some(pending) = &self.pending {
            consider(pending.deadline);
        }
        if let Some(interrupt) = &self.interrupt {
            consider(interrupt.deadline);
        }
        if self.settled.is_some() {
            consider(self.launch_deadline);
        }
        next
    }

    fn handle_request(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::Command {
                text,
                timeout,
                reply,
            } => {
                if !self.state.accepts_commands() {
                    let _ = reply.send(Err(self.closed_error()));
                    return;
                }
                self.queued.push_back(QueuedCommand {
                    text,
                    timeout,
                    reply: CommandReply::User(reply),
                });
                self.pump();
            }
            SessionRequest::AddBreakpoint { location, reply } => {
                if !self.state.accepts_commands() {
                    let _ = reply.send(Err(self.closed_error()));
                    return;
                }
                let text = breakpoint_command(&location);
                self.queued.push_back(QueuedCommand {
                    text,
                    timeout: self.config.command_timeout,
                    reply: CommandReply::Breakpoint { location, reply },
                });
                self.pump();
            }
            SessionRequest::ListBreakpoints { reply } => {
                let list = self
                    .breakpoints
                    .iter()
                    .map(|(&id, location)| Breakpoint {
                        id,
                        location: location.clone(),
                    })
                    .collect();
                let _ = reply.send(list);
            }
            SessionRequest::Interrupt { reply } => self.handle_interrupt(reply),
            SessionRequest::Detach { reply } => {
                if self.state.is_terminal() {
                    // Idempotent: no second transport close, no error.
                    let _ = reply.send(self.state);
                    return;
                }
                if self.state.accepts_commands() {
                    let _ = self.transport.write_line("process detach");
                }
                self.teardown(SessionState::Detached, "detached by caller");
                let _ = reply.send(self.state);
            }
            SessionRequest::Terminate { reply } => {
                if self.state.is_terminal() {
                    let _ = reply.send(self.state);
                    return;
                }
                if self.state.accepts_commands() {
                    let _ = self.transport.write_line("process kill");
                }
                if let Some(pid) = self.pid.get().copied() {
                    if let Err(err) = (self.signals.kill)(pid) {
                        debug!("kill fallback for pid {pid}: {err}");
                    }
                }
                self.teardown(SessionState::Terminated, "terminated by caller");
                let _ = reply.send(self.state);
            }
        }
    }

    fn handle_interrupt(&mut self, reply: oneshot::Sender<Result<CommandResult>>) {
        match self.state {
            SessionState::Stopped => {
                let output = self.last_stop_reason.clone().unwrap_or_default();
                let _ = reply.send(Ok(CommandResult::completed(output, self.state)));
            }
            SessionState::Running => {
                if self.interrupt.is_some() {
                    let _ = reply.send(Err(EngineError::CommandFailed(
                        "an interrupt is already in flight".to_string(),
                    )));
                    return;
                }
                let Some(pid) = self.pid.get().copied() else {
                    let _ = reply.send(Err(EngineError::CommandFailed(
                        "target process id is not known yet".to_string(),
                    )));
                    return;
                };
                // Record the intent before signaling, so the stop this
                // interrupt provokes is attributed to it and not raced.
                self.interrupt = Some(InterruptWait {
                    reply,
                    deadline: Instant::now() + self.config.command_timeout,
                });
                if let Err(err) = (self.signals.interrupt)(pid) {
                    if let Some(wait) = self.interrupt.take() {
                        let _ = wait.reply.send(Err(EngineError::CommandFailed(format!(
                            "failed to signal pid {pid}: {err}"
                        ))));
                    }
                    return;
                }
                let _ = self.transport.write_line(INTERRUPT_PROBE);
            }
            other => {
                let _ = reply.send(Err(EngineError::Closed(format!(
                    "cannot interrupt while session is {other}"
                ))));
            }
        }
    }

    /// Dispatches queued commands while no command is in flight. At most
    /// one PendingCommand exists per session at any time.
    fn pump(&mut self) {
        while self.pending.is_none() {
            let Some(command) = self.queued.pop_front() else {
                break;
            };
            self.dispatch(command);
        }
    }

    fn dispatch(&mut self, command: QueuedCommand) {
        if !self.state.accepts_commands() {
            self.reply_err(command.reply, self.closed_error());
            return;
        }
        self.next_seq += 1;
        let token = uuid::Uuid::new_v4().simple().to_string();
        debug!(
            "session '{}' dispatching #{}: {}",
            self.target_key, self.next_seq, command.text
        );
        let write = self
            .transport
            .write_line(&command.text)
            .and_then(|_| self.transport.write_line(&sentinel_echo_command(&token)));
        if let Err(err) = write {
            self.reply_err(command.reply, EngineError::Closed(err.to_string()));
            self.apply_event(AsyncEvent::ProcessCrashed {
                reason: format!("transport write failed: {err}"),
            });
            return;
        }
        self.pending = Some(PendingCommand {
            seq: self.next_seq,
            sentinel: token,
            buffer: String::new(),
            deadline: Instant::now() + command.timeout,
            timeout: command.timeout,
            reply: command.reply,
        });
    }

    fn ingest(&mut self, bytes: &[u8]) {
        for item in self.demux.push_bytes(bytes) {
            match item {
                StreamItem::Sentinel(token) => self.on_sentinel(token),
                StreamItem::Event(AsyncEvent::RawLine(line)) => self.on_raw_line(line),
                StreamItem::Event(event) => {
                    if let Some(reason) = self.detector.scan_event(&event) {
                        self.apply_event(AsyncEvent::ProcessCrashed { reason });
                    } else {
                        self.apply_event(event);
                    }
                }
            }
        }
        if self.pid.get().is_none() {
            if let Some(pid) = self.demux.observed_pid() {
                let _ = self.pid.set(pid);
            }
        }
    }

    fn on_raw_line(&mut self, line: String) {
        if let Some(reason) = self.detector.scan_line(&line) {
            self.apply_event(AsyncEvent::ProcessCrashed { reason });
            return;
        }
        if self.recent_lines.len() >= RECENT_LINES_KEPT {
            self.recent_lines.pop_front();
        }
        self.recent_lines.push_back(line.clone());
        if let Some(pending) = &mut self.pending {
            pending.buffer.push_str(&line);
            pending.buffer.push('\n');
        }
    }

    fn on_sentinel(&mut self, token: String) {
        let matches_pending = self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.sentinel == token);
        match self.pending.take_if(|_| matches_pending) {
            Some(pending) => {
                debug!(
                    "session '{}' command #{} completed",
                    self.target_key, pending.seq
                );
                self.resolve_completed(pending);
                self.pump();
            }
            None => {
                if self.stale_sentinels.remove(&token) {
                    // Late completion of a timed-out command; discard.
                    debug!("session '{}' discarding late completion", self.target_key);
                } else {
                    debug!("session '{}' unmatched sentinel {token}", self.target_key);
                }
            }
        }
    }

    fn resolve_completed(&mut self, pending: PendingCommand) {
        match pending.reply {
            CommandReply::User(reply) => {
                let _ = reply.send(Ok(CommandResult {
                    output: pending.buffer,
                    state: self.state,
                    crash_reason: self.crash_reason.clone(),
                }));
            }
            CommandReply::Breakpoint { location, reply } => {
                match parse_breakpoint_id(&pending.buffer) {
                    Some(id) => {
                        self.breakpoints.insert(id, location.clone());
                        let _ = reply.send(Ok(Breakpoint { id, location }));
                    }
                    None => {
                        let _ = reply.send(Err(EngineError::CommandFailed(format!(
                            "breakpoint at '{location}' was not accepted: {}",
                            pending.buffer.trim()
                        ))));
                    }
                }
            }
        }
    }

    fn apply_event(&mut self, event: AsyncEvent) {
        if self.state.is_terminal() {
            return;
        }
        match event {
            AsyncEvent::ProcessStopped {
                reason,
                thread_index,
            } => {
                if let Some(reason) = reason {
                    debug!(
                        "session '{}' stopped on thread {:?}: {reason}",
                        self.target_key, thread_index
                    );
                    self.last_stop_reason = Some(reason);
                }
                self.set_state(SessionState::Stopped);
                if let Some(wait) = self.interrupt.take() {
                    let output = self.last_stop_reason.clone().unwrap_or_default();
                    let _ = wait
                        .reply
                        .send(Ok(CommandResult::completed(output, self.state)));
                }
                // Any stop settles the launch handshake, including the
                // stop-at-entry case that briefly showed a running state.
                self.resolve_settled();
            }
            AsyncEvent::ProcessContinued => {
                let was_launching = self.state == SessionState::Launching;
                self.set_state(SessionState::Running);
                if was_launching && !self.stop_at_entry {
                    self.resolve_settled();
                }
            }
            AsyncEvent::ProcessExited { code } => {
                info!(
                    "session '{}' target exited with code {:?}",
                    self.target_key, code
                );
                self.set_state(SessionState::Terminated);
                self.resolve_settled();
                // The debugger itself is still alive: a pending command's
                // sentinel can still arrive, so leave it in place.
            }
            AsyncEvent::ProcessCrashed { reason } => {
                warn!("session '{}' crashed: {reason}", self.target_key);
                self.crash_reason = Some(reason.clone());
                let _ = self.crash_reason_cell.set(reason.clone());
                self.set_state(SessionState::Crashed);
                if let Some(pending) = self.pending.take() {
                    // Crash pre-empts the pending wait; reported as data,
                    // not an error, so the caller sees the reason.
                    match pending.reply {
                        CommandReply::User(reply) => {
                            let _ = reply
                                .send(Ok(CommandResult::crashed(pending.buffer, reason.clone())));
                        }
                        CommandReply::Breakpoint { reply, .. } => {
                            let _ = reply.send(Err(EngineError::CrashDetected(reason.clone())));
                        }
                    };
                }
                if let Some(wait) = self.interrupt.take() {
                    let _ = wait
                        .reply
                        .send(Ok(CommandResult::crashed(String::new(), reason.clone())));
                }
                self.fail_queued(|| EngineError::CrashDetected(reason.clone()));
                self.resolve_settled();
                self.transport.close();
            }
            AsyncEvent::RawLine(line) => self.on_raw_line(line),
        }
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();
        if self.settled.is_some() && now >= self.launch_deadline {
            let diagnostic = self.recent_output();
            self.apply_event(AsyncEvent::ProcessCrashed {
                reason: format!(
                    "launch failed: handshake did not settle within {:?}; last output: {diagnostic}",
                    self.config.launch_timeout
                ),
            });
            return;
        }
        if let Some(pending) = self.pending.take_if(|p| now >= p.deadline) {
            warn!(
                "session '{}' command #{} timed out after {:?}",
                self.target_key, pending.seq, pending.timeout
            );
            // A late completion for this sentinel must be discarded, not
            // matched against a future command.
            self.stale_sentinels.insert(pending.sentinel.clone());
            self.reply_err(pending.reply, EngineError::Timeout(pending.timeout));
            self.pump();
        }
        if let Some(wait) = self.interrupt.take_if(|w| now >= w.deadline) {
            let _ = wait
                .reply
                .send(Err(EngineError::Timeout(self.config.command_timeout)));
        }
    }

    fn on_stream_end(&mut self) {
        if self.state.is_terminal() {
            // Exit already observed; just flush any leftover waiters.
            if let Some(pending) = self.pending.take() {
                self.resolve_completed(pending);
            }
            if let Some(wait) = self.interrupt.take() {
                let _ = wait.reply.send(Err(self.closed_error()));
            }
            return;
        }
        let diagnostic = self.recent_output();
        self.apply_event(AsyncEvent::ProcessCrashed {
            reason: format!("debugger stream ended unexpectedly; last output: {diagnostic}"),
        });
    }

    fn teardown(&mut self, final_state: SessionState, why: &str) {
        if let Some(pending) = self.pending.take() {
            self.reply_err(pending.reply, EngineError::Closed(why.to_string()));
        }
        if let Some(wait) = self.interrupt.take() {
            let _ = wait.reply.send(Err(EngineError::Closed(why.to_string())));
        }
        self.fail_queued(|| EngineError::Closed(why.to_string()));
        if !self.state.is_terminal() {
            self.set_state(final_state);
        }
        self.resolve_settled();
        self.transport.close();
    }

    fn fail_queued(&mut self, make: impl Fn() -> EngineError) {
        for command in self.queued.drain(..).collect::<Vec<_>>() {
            self.reply_err(command.reply, make());
        }
    }

    fn reply_err(&self, reply: CommandReply, err: EngineError) {
        match reply {
            CommandReply::User(tx) => {
                let _ = tx.send(Err(err));
            }
            CommandReply::Breakpoint { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }

    fn resolve_settled(&mut self) {
        if let Some(tx) = self.settled.take() {
            let _ = tx.send(());
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        debug!("session '{}': {} -> {next}", self.target_key, self.state);
        self.state = next;
        self.state_tx.send_replace(next);
    }

    fn closed_error(&self) -> EngineError {
        let mut message = format!("session is {}", self.state);
        if let Some(reason) = &self.crash_reason {
            message.push_str(": ");
            message.push_str(reason);
        }
        EngineError::Closed(message)
    }

    fn recent_output(&self) -> String {
        let tail: Vec<&str> = self
            .recent_lines
            .iter()
            .rev()
            .take(5)
            .map(String::as_str)
            .collect();
        if tail.is_empty() {
            "<none>".to_string()
        } else {
            tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
        }
    }
}

fn breakpoint_command(location: &str) -> String {
    match location.rsplit_once(':') {
        Some((file, line)) if line.chars().all(|c| c.is_ascii_digit()) && !file.is_empty() => {
            format!("breakpoint set --file {file} --line {line}")
        }
        _ => format!("breakpoint set --name {location}"),
    }
}

fn parse_breakpoint_id(output: &str) -> Option<u32> {
    let re = Regex::new(r"Breakpoint (\d+):").unwrap();
    re.captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::scripted::ScriptedPeer;
    use std::time::Duration;
    use tokio::time::timeout as tokio_timeout;

    fn no_signal(_pid: u32) -> std::io::Result<()> {
        Ok(())
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            command_timeout: Duration::from_secs(5),
            launch_timeout: Duration::from_millis(500),
            ..EngineConfig::default()
        }
    }

    fn scripted_session(
        stop_at_entry: bool,
        launch_commands: Vec<String>,
    ) -> (Session, ScriptedPeer, oneshot::Receiver<()>) {
        let (transport, peer) = TransportHandle::scripted();
        let (session, settled) = Session::start_with(
            test_config(),
            "exec:/tmp/target".to_string(),
            stop_at_entry,
            launch_commands,
            None,
            transport,
            SignalDelivery {
                interrupt: no_signal,
                kill: no_signal,
            },
        );
        (session, peer, settled)
    }

    /// Brings a scripted session into `Stopped` via the usual handshake.
    async fn stopped_session() -> (Session, ScriptedPeer) {
        let (session, peer, settled) =
            scripted_session(true, vec!["process launch --stop-at-entry".to_string()]);
        peer.feed_str("Process 1234 launched: '/tmp/target' (arm64)\n")
            .await;
        peer.feed_str("Process 1234 stopped\n").await;
        settled.await.expect("launch settles");
        assert_eq!(session.state(), SessionState::Stopped);
        let _ = peer.take_written();
        (session, peer)
    }

    /// Extracts the sentinel token from the echo instruction the session
    /// wrote, so tests can feed back the matching completion line.
    fn sentinel_token(written: &[String]) -> String {
        let echo = written
            .iter()
            .find(|line| line.contains("script print"))
            .expect("echo instruction written");
        let start = echo.find("\" + \"").expect("split token") + 5;
        let end = echo.rfind("__\")").expect("suffix");
        echo[start..end].to_string()
    }

    #[tokio::test]
    async fn test_launch_handshake_reaches_stopped_at_entry() {
        let (session, peer) = stopped_session().await;
        assert_eq!(session.pid(), Some(1234));
        drop(peer);
        // Stream end after terminal transitions is handled in teardown.
        let _ = session;
    }

    #[tokio::test]
    async fn test_send_command_completes_with_buffered_output() {
        let (session, peer) = stopped_session().await;

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.send_command("frame variable", None).await }
        });
        // Wait for the command to hit the transport.
        let written = loop {
            let written = peer.take_written();
            if !written.is_empty() {
                break written;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(written[0], "frame variable");
        let token = sentinel_token(&written);

        peer.feed_str("(int) x = 7\n").await;
        peer.feed_str(&format!("__DBG_DONE_{token}__\n")).await;

        let result = task.await.unwrap().expect("command completes");
        assert_eq!(result.state, SessionState::Stopped);
        assert!(result.output.contains("(int) x = 7"));
        assert!(result.crash_reason.is_none());
    }

    #[tokio::test]
    async fn test_rejected_outside_running_or_stopped_with_zero_writes() {
        let (session, peer, settled) = scripted_session(true, vec![]);
        // Crash during launch.
        peer.feed_str("dyld[99]: Library not loaded: @rpath/libmissing.dylib\n")
            .await;
        settled.await.expect("launch settles");
        assert_eq!(session.state(), SessionState::Crashed);

        let _ = peer.take_written();
        let err = session
            .send_command("backtrace", None)
            .await
            .expect_err("must reject");
        assert!(matches!(err, EngineError::Closed(_)), "got {err:?}");
        assert!(
            peer.take_written().is_empty(),
            "rejection must not touch the transport"
        );
    }

    #[tokio::test]
    async fn test_commands_complete_in_fifo_order_despite_noise() {
        let (session, peer) = stopped_session().await;

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.send_command("first", None).await }
        });
        let written = loop {
            let written = peer.take_written();
            if written.iter().any(|l| l == "first") {
                break written;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let token1 = sentinel_token(&written);

        // While the first command is in flight, the second only queues.
        let second = tokio::spawn({
            let session = session.clone();
            async move { session.send_command("second", None).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(
            peer.take_written().is_empty(),
            "second command must wait its turn"
        );

        peer.feed_str("noise before completion\n").await;
        peer.feed_str(&format!("one\n__DBG_DONE_{token1}__\n")).await;
        let r1 = first.await.unwrap().expect("first completes");
        assert!(r1.output.contains("one"));

        let written = loop {
            let written = peer.take_written();
            if written.iter().any(|l| l == "second") {
                break written;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let token2 = sentinel_token(&written);
        peer.feed_str(&format!("two\n__DBG_DONE_{token2}__\n")).await;
        let r2 = second.await.unwrap().expect("second completes");
        assert!(r2.output.contains("two"));
    }

    #[tokio::test]
    async fn test_crash_preempts_pending_command_before_timeout() {
        let (session, peer) = stopped_session().await;

        let task = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .send_command("continue", Some(Duration::from_secs(30)))
                    .await
            }
        });
        loop {
            if !peer.take_written().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        peer.feed_str("dyld[512]: Library not loaded: /usr/lib/libbad.dylib\n")
            .await;

        // Resolves as a crash-indicating result well before the deadline.
        let result = tokio_timeout(Duration::from_secs(2), task)
            .await
            .expect("resolved before timeout")
            .unwrap()
            .expect("crash is data, not an error");
        assert_eq!(result.state, SessionState::Crashed);
        let reason = result.crash_reason.expect("reason attached");
        assert!(reason.contains("dynamic linker abort"), "{reason}");
        assert_eq!(session.state(), SessionState::Crashed);
    }

    #[tokio::test]
    async fn test_timeout_is_local_and_late_completion_is_discarded() {
        let (session, peer) = stopped_session().await;

        let err = session
            .send_command("backtrace", Some(Duration::from_millis(50)))
            .await
            .expect_err("stalled debugger");
        assert!(matches!(err, EngineError::Timeout(_)), "got {err:?}");
        assert_eq!(session.state(), SessionState::Stopped, "session stays usable");

        // The stale sentinel arrives late and must not complete anything.
        let written = peer.take_written();
        let stale = sentinel_token(&written);
        peer.feed_str(&format!("__DBG_DONE_{stale}__\n")).await;

        // A subsequent command still works.
        let task = tokio::spawn({
            let session = session.clone();
            async move { session.send_command("frame info", None).await }
        });
        let written = loop {
            let written = peer.take_written();
            if written.iter().any(|l| l == "frame info") {
                break written;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let token = sentinel_token(&written);
        peer.feed_str(&format!("__DBG_DONE_{token}__\n")).await;
        task.await.unwrap().expect("session still usable");
    }

    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let (session, peer) = stopped_session().await;

        assert_eq!(session.detach().await, SessionState::Detached);
        let first_writes = peer.take_written();
        assert!(first_writes.iter().any(|l| l == "process detach"));

        assert_eq!(session.detach().await, SessionState::Detached);
        assert!(
            peer.take_written().is_empty(),
            "second detach must be a pure no-op"
        );
    }

    #[tokio::test]
    async fn test_natural_exit_transitions_to_terminated() {
        // End-to-end shape: stop at entry, continue, then natural exit.
        let (session, peer) = stopped_session().await;

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.send_command("continue", None).await }
        });
        let written = loop {
            let written = peer.take_written();
            if !written.is_empty() {
                break written;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let token = sentinel_token(&written);

        peer.feed_str("Process 1234 resuming\n").await;
        peer.feed_str(&format!("__DBG_DONE_{token}__\n")).await;
        let result = task.await.unwrap().expect("continue completes");
        assert_eq!(result.state, SessionState::Running);
        assert!(result.crash_reason.is_none());

        peer.feed_str("Process 1234 exited with status = 0 (0x00000000)\n")
            .await;
        // The loop exits after the terminal transition.
        let mut state = session.state();
        for _ in 0..100 {
            if state == SessionState::Terminated {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            state = session.state();
        }
        assert_eq!(state, SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_launch_timeout_ends_in_crashed_not_hanging() {
        let (session, _peer, settled) =
            scripted_session(false, vec!["process launch".to_string()]);
        // Nothing ever responds; the launch deadline must fire.
        tokio_timeout(Duration::from_secs(2), settled)
            .await
            .expect("settles within the launch timeout")
            .expect("settled signal");
        assert_eq!(session.state(), SessionState::Crashed);
    }

    #[tokio::test]
    async fn test_interrupt_attributed_to_provoked_stop() {
        let (session, peer, settled) =
            scripted_session(false, vec!["process launch".to_string()]);
        peer.feed_str("Process 77 launched: '/tmp/target' (arm64)\n")
            .await;
        settled.await.expect("running");
        assert_eq!(session.state(), SessionState::Running);

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.interrupt().await }
        });
        // The probe goes out after intent is recorded.
        loop {
            let written = peer.take_written();
            if written.iter().any(|l| l == INTERRUPT_PROBE) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        peer.feed_str("Process 77 stopped\n").await;
        peer.feed_str("* thread #1, queue = 'main', stop reason = signal SIGINT\n")
            .await;

        let result = task.await.unwrap().expect("interrupt resolves");
        assert_eq!(result.state, SessionState::Stopped);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_add_and_list_breakpoints() {
        let (session, peer) = stopped_session().await;

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.add_breakpoint("main.c:42").await }
        });
        let written = loop {
            let written = peer.take_written();
            if !written.is_empty() {
                break written;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(written[0], "breakpoint set --file main.c --line 42");
        let token = sentinel_token(&written);
        peer.feed_str("Breakpoint 2: where = target`main + 12 at main.c:42\n")
            .await;
        peer.feed_str(&format!("__DBG_DONE_{token}__\n")).await;

        let bp = task.await.unwrap().expect("breakpoint set");
        assert_eq!(bp.id, 2);
        assert_eq!(bp.location, "main.c:42");

        let listed = session.list_breakpoints().await;
        assert_eq!(listed, vec![bp]);
    }

    #[test]
    fn test_breakpoint_command_forms() {
        assert_eq!(
            breakpoint_command("main.c:10"),
            "breakpoint set --file main.c --line 10"
        );
        assert_eq!(breakpoint_command("main"), "breakpoint set --name main");
        assert_eq!(
            breakpoint_command("ns::helper"),
            "breakpoint set --name ns::helper"
        );
    }

    #[test]
    fn test_parse_breakpoint_id_from_debugger_output() {
        assert_eq!(
            parse_breakpoint_id("Breakpoint 3: where = a.out`main at main.c:5"),
            Some(3)
        );
        assert_eq!(parse_breakpoint_id("error: no such file"), None);
    }
}
