//! Protocol engine: command/reply correlation and the live status cache.
//!
//! ## Tasks
//!
//! Every connection runs these tasks:
//!
//! ```text
//!  callers ──▶ request queue (mpsc) ──▶ writer task ──▶ LineWriter ──▶ controller
//!                                          ▲
//!                                          │ ok / error / [info]
//!  watch<StatusSnapshot> ◀── reader task ◀─┴─ LineReader ◀── controller
//! ```
//!
//! - The **writer task** owns the write half. It takes one request at a time,
//!   writes it and, for line commands, waits for the matching `ok`/`error`
//!   before taking the next one. GRBL answers line commands strictly in order,
//!   so one command in flight is enough to correlate every reply.
//! - The **reader task** owns the read half and is the only consumer of
//!   inbound bytes. Replies go to the writer, status reports and alarms update
//!   the cached [`StatusSnapshot`], everything else is dropped.
//! - In poll mode a **poller task** queues `?` real-time requests through the
//!   same request queue, so polls never race a command on the wire.
//!
//! Callers only ever see copies of the snapshot (`watch` receivers or
//! [`ProtocolEngine::snapshot`]).
//!
//! ## Failure handling
//!
//! - An ack timeout re-sends the whole command, up to `max_retries` times, then
//!   fails with `CommunicationTimeout`. The controller still answers the
//!   timed-out line, and in order, so the writer counts one owed reply per
//!   timeout and discards that many `ok`/`error` replies before correlating
//!   the next one. A controller reset (welcome banner) cancels the debt.
//! - End of stream or an I/O error marks the link lost. Queued and in-flight
//!   requests fail with `ConnectionLost` and the next call reconnects.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::command::{Ack, Command, CommandClass, CommandId};
use super::grbl::{self, Incoming};
use crate::config::{ProtocolConfig, StatusMode};
use crate::core::{MachineState, Position4D};
use crate::error::{RigError, RigResult};
use crate::hardware::transport::{LineReader, LineWriter, SerialTransport};

/// Capacity of the writer request queue.
const REQUEST_QUEUE_DEPTH: usize = 64;

/// Immutable copy of the controller state as last reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    /// State keyword from the latest report or alarm
    pub state: MachineState,
    /// Position exactly as the controller reported it
    pub position: Position4D,
    /// Code from the most recent `ALARM:<n>` while the machine is in Alarm
    pub alarm_code: Option<u16>,
    /// Incremented on every status report, alarm or connection change
    pub seq: u64,
    /// Whether a link is open
    pub connected: bool,
    /// When this snapshot was taken
    pub updated_at: DateTime<Utc>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            state: MachineState::Idle,
            position: Position4D::ZERO,
            alarm_code: None,
            seq: 0,
            connected: false,
            updated_at: Utc::now(),
        }
    }
}

/// A motion command the controller has acknowledged but may still be executing.
pub struct MotionTicket {
    /// The controller's acknowledgement
    pub ack: Ack,
    ack_seq: u64,
    accepted_at: Instant,
    status: watch::Receiver<StatusSnapshot>,
    abort: watch::Receiver<u64>,
}

enum WriterRequest {
    Line {
        command: Command,
        timeout: Duration,
        retries: u32,
        reply: oneshot::Sender<RigResult<Ack>>,
    },
    Realtime {
        byte: u8,
        reply: oneshot::Sender<RigResult<()>>,
    },
}

impl WriterRequest {
    fn fail(self, err: RigError) {
        match self {
            WriterRequest::Line { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            WriterRequest::Realtime { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

enum ReplyLine {
    Ok,
    Error(u16),
    Info(String),
    /// Controller restarted; nothing sent before it will be answered.
    Reset,
}

/// Reply stream as seen by the writer, with replies still owed to
/// timed-out attempts.
struct Replies {
    rx: mpsc::UnboundedReceiver<ReplyLine>,
    owed: u32,
}

impl Replies {
    fn new(rx: mpsc::UnboundedReceiver<ReplyLine>) -> Self {
        Self { rx, owed: 0 }
    }

    /// Drop everything already received. Returns the number of complete
    /// replies dropped; each one settles an owed reply if there is one.
    fn drain(&mut self) -> u32 {
        let mut dropped = 0;
        while let Ok(line) = self.rx.try_recv() {
            match line {
                ReplyLine::Ok | ReplyLine::Error(_) => {
                    dropped += 1;
                    self.owed = self.owed.saturating_sub(1);
                }
                ReplyLine::Reset => self.owed = 0,
                ReplyLine::Info(_) => {}
            }
        }
        dropped
    }

    /// Collect informational lines until `ok` (returns them) or `error:n`
    /// (returns the code), skipping whole replies that are still owed.
    async fn next_reply(&mut self) -> RigResult<Result<Vec<String>, u16>> {
        let mut lines = Vec::new();
        loop {
            let line = self.rx.recv().await.ok_or_else(|| {
                RigError::ConnectionLost("reader stopped while waiting for reply".to_string())
            })?;
            match line {
                ReplyLine::Info(text) => lines.push(text),
                ReplyLine::Ok | ReplyLine::Error(_) if self.owed > 0 => {
                    self.owed -= 1;
                    trace!(owed = self.owed, discarded = lines.len(), "late reply discarded");
                    lines.clear();
                }
                ReplyLine::Ok => return Ok(Ok(lines)),
                ReplyLine::Error(code) => return Ok(Err(code)),
                ReplyLine::Reset => {
                    if self.owed > 0 {
                        debug!(owed = self.owed, "controller reset, owed replies cancelled");
                    }
                    self.owed = 0;
                    lines.clear();
                }
            }
        }
    }
}

struct LinkHandle {
    requests: mpsc::Sender<WriterRequest>,
    lost: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl LinkHandle {
    fn is_alive(&self) -> bool {
        !*self.lost.borrow() && !self.requests.is_closed()
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Sole owner of the controller link and of the live machine state.
pub struct ProtocolEngine {
    transport: Arc<dyn SerialTransport>,
    config: ProtocolConfig,
    status: Arc<watch::Sender<StatusSnapshot>>,
    abort: watch::Sender<u64>,
    link: Mutex<Option<LinkHandle>>,
    next_id: AtomicU64,
}

impl ProtocolEngine {
    /// Create an engine. Nothing is opened until the first call that needs the link.
    pub fn new(transport: Arc<dyn SerialTransport>, config: ProtocolConfig) -> Self {
        let (status, _) = watch::channel(StatusSnapshot::default());
        let (abort, _) = watch::channel(0);
        Self {
            transport,
            config,
            status: Arc::new(status),
            abort,
            link: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Timing and retry configuration.
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    // =========================================================================
    // Connection management
    // =========================================================================

    /// Open the link now instead of on first use.
    pub async fn connect(&self) -> RigResult<()> {
        self.requests().await.map(|_| ())
    }

    /// Drop the current link; the next command reconnects.
    pub async fn disconnect(&self) {
        if self.link.lock().await.take().is_some() {
            info!(transport = %self.transport.describe(), "disconnected");
            self.status.send_modify(|s| {
                s.connected = false;
                s.seq += 1;
                s.updated_at = Utc::now();
            });
        }
    }

    /// Whether a link is currently open.
    pub fn is_connected(&self) -> bool {
        self.status.borrow().connected
    }

    async fn requests(&self) -> RigResult<mpsc::Sender<WriterRequest>> {
        let mut link = self.link.lock().await;
        if let Some(handle) = link.as_ref() {
            if handle.is_alive() {
                return Ok(handle.requests.clone());
            }
            info!(transport = %self.transport.describe(), "link lost, reconnecting");
        }
        *link = None;

        let handle = self.open_link().await?;
        let requests = handle.requests.clone();
        *link = Some(handle);
        Ok(requests)
    }

    async fn open_link(&self) -> RigResult<LinkHandle> {
        let (reader, writer) = self.transport.open().await?;
        info!(transport = %self.transport.describe(), "link opened");

        let (lost_tx, lost_rx) = watch::channel(false);
        let lost_tx = Arc::new(lost_tx);
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);

        self.status.send_modify(|s| {
            s.connected = true;
            s.seq += 1;
            s.updated_at = Utc::now();
        });

        let mut tasks = vec![
            tokio::spawn(run_reader(
                reader,
                self.status.clone(),
                reply_tx,
                lost_tx.clone(),
            )),
            tokio::spawn(run_writer(
                writer,
                request_rx,
                reply_rx,
                lost_rx.clone(),
                lost_tx,
                self.config.inter_command_delay,
            )),
        ];

        if self.config.status_mode == StatusMode::Poll {
            tasks.push(tokio::spawn(run_poller(
                request_tx.clone(),
                lost_rx.clone(),
                self.config.status_interval,
            )));
        }

        let handle = LinkHandle {
            requests: request_tx,
            lost: lost_rx,
            tasks,
        };

        if self.config.status_mode == StatusMode::Auto {
            let text = grbl::report_interval_command(self.config.status_interval);
            let command = self.make_command(text, CommandClass::Config);
            // On failure the handle is dropped here, which stops the tasks.
            submit_line(
                &handle.requests,
                command,
                self.config.ack_timeout,
                self.config.max_retries,
            )
            .await?;
        }

        Ok(handle)
    }

    fn make_command(&self, text: impl Into<String>, class: CommandClass) -> Command {
        let id = CommandId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Command::new(id, text, class)
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Send one line command and wait for its acknowledgement.
    ///
    /// Timeouts re-send the whole command up to `max_retries` times before
    /// failing with `CommunicationTimeout`.
    pub async fn send(&self, text: impl Into<String>, class: CommandClass) -> RigResult<Ack> {
        self.send_with_timeout(text, class, self.config.ack_timeout, self.config.max_retries)
            .await
    }

    /// [`send`](Self::send) with an explicit ack timeout and retry budget.
    pub async fn send_with_timeout(
        &self,
        text: impl Into<String>,
        class: CommandClass,
        timeout: Duration,
        retries: u32,
    ) -> RigResult<Ack> {
        let command = self.make_command(text, class);
        let requests = self.requests().await?;
        submit_line(&requests, command, timeout, retries).await
    }

    /// Send a real-time byte. No acknowledgement is expected.
    pub async fn realtime(&self, byte: u8) -> RigResult<()> {
        let requests = self.requests().await?;
        let (reply, rx) = oneshot::channel();
        requests
            .send(WriterRequest::Realtime { byte, reply })
            .await
            .map_err(|_| RigError::ConnectionLost("writer stopped".to_string()))?;
        rx.await
            .map_err(|_| RigError::ConnectionLost("writer stopped".to_string()))?
    }

    /// Pause motion (`!`).
    pub async fn feed_hold(&self) -> RigResult<()> {
        self.realtime(grbl::FEED_HOLD).await
    }

    /// Resume after a feed hold (`~`).
    pub async fn cycle_resume(&self) -> RigResult<()> {
        self.realtime(grbl::CYCLE_RESUME).await
    }

    /// Reset the controller (Ctrl-X). Motion in progress ends in an alarm.
    pub async fn soft_reset(&self) -> RigResult<()> {
        self.realtime(grbl::SOFT_RESET).await
    }

    /// Send a motion command and wait for mechanical completion.
    pub async fn send_and_wait_motion(&self, text: impl Into<String>) -> RigResult<()> {
        self.send_and_wait_motion_with(
            text,
            self.config.ack_timeout,
            self.config.max_retries,
            self.config.motion_timeout,
        )
        .await
    }

    /// Motion command with explicit ack and completion bounds.
    pub async fn send_and_wait_motion_with(
        &self,
        text: impl Into<String>,
        ack_timeout: Duration,
        retries: u32,
        completion_timeout: Duration,
    ) -> RigResult<()> {
        let ticket = self.send_motion(text, ack_timeout, retries).await?;
        self.wait_motion(ticket, completion_timeout).await
    }

    /// First half of a motion: send and wait for the controller to accept it.
    ///
    /// An error here means the controller never acknowledged the command.
    pub async fn send_motion(
        &self,
        text: impl Into<String>,
        ack_timeout: Duration,
        retries: u32,
    ) -> RigResult<MotionTicket> {
        let mut abort = self.abort.subscribe();
        let mut status = self.status.subscribe();

        let ack = tokio::select! {
            ack = self.send_with_timeout(text, CommandClass::Motion, ack_timeout, retries) => ack?,
            _ = abort.changed() => return Err(RigError::MotionCancelled),
        };

        let ack_seq = status.borrow_and_update().seq;
        debug!(command_id = %ack.id, command = %ack.command, "motion accepted");
        Ok(MotionTicket {
            ack,
            ack_seq,
            accepted_at: Instant::now(),
            status,
            abort,
        })
    }

    /// Second half of a motion: wait for mechanical completion.
    ///
    /// Only status reports that arrive after the ack count. The wait ends on
    /// such an Idle report once motion has been seen, or once the
    /// motion-start grace window has passed for moves too short to ever
    /// report Run.
    /// An alarm ends it with `MotionAlarm`; [`abort_motion`](Self::abort_motion)
    /// ends it with `MotionCancelled`.
    pub async fn wait_motion(
        &self,
        ticket: MotionTicket,
        completion_timeout: Duration,
    ) -> RigResult<()> {
        let MotionTicket {
            ack_seq,
            accepted_at,
            mut status,
            mut abort,
            ..
        } = ticket;

        tokio::select! {
            result = self.wait_motion_complete(&mut status, ack_seq, accepted_at, completion_timeout) => result,
            _ = abort.changed() => {
                debug!("motion wait cancelled");
                Err(RigError::MotionCancelled)
            }
        }
    }

    async fn wait_motion_complete(
        &self,
        status: &mut watch::Receiver<StatusSnapshot>,
        ack_seq: u64,
        accepted_at: Instant,
        completion_timeout: Duration,
    ) -> RigResult<()> {
        let grace_end = accepted_at + self.config.motion_start_grace;
        let deadline = accepted_at + completion_timeout;
        let mut seen_motion = false;

        loop {
            let snapshot = status.borrow_and_update().clone();
            if !snapshot.connected {
                return Err(RigError::ConnectionLost(
                    "link lost while waiting for motion".to_string(),
                ));
            }

            let fresh = snapshot.seq > ack_seq;
            match snapshot.state {
                MachineState::Moving | MachineState::Homing | MachineState::Hold if fresh => {
                    seen_motion = true;
                }
                MachineState::Alarm if fresh => {
                    return Err(RigError::MotionAlarm {
                        code: snapshot.alarm_code.unwrap_or(0),
                    });
                }
                // Past the grace window any real motion would have been reported,
                // but only by a report taken after the ack.
                MachineState::Idle if fresh && (seen_motion || Instant::now() >= grace_end) => {
                    trace!(seq = snapshot.seq, "motion complete");
                    return Ok(());
                }
                _ => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(RigError::MotionTimeout(completion_timeout));
            }
            let wake = if !seen_motion && now < grace_end {
                grace_end.min(deadline)
            } else {
                deadline
            };

            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        return Err(RigError::ConnectionLost("status channel closed".to_string()));
                    }
                }
                _ = tokio::time::sleep_until(wake.into()) => {}
            }
        }
    }

    /// Cancel every in-flight motion wait and issue a feed hold.
    pub async fn abort_motion(&self) -> RigResult<()> {
        self.abort.send_modify(|generation| *generation += 1);
        info!("abort requested, holding feed");
        self.feed_hold().await
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Copy of the most recent status.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    /// Machine state from the latest report.
    pub fn state(&self) -> MachineState {
        self.status.borrow().state
    }

    /// Whether the controller is in Alarm.
    pub fn is_alarm(&self) -> bool {
        self.state() == MachineState::Alarm
    }

    /// Issue the unlock command and wait for a fresh report outside Alarm.
    pub async fn clear_alarm(&self) -> RigResult<()> {
        let mut status = self.status.subscribe();
        let code = status.borrow().alarm_code;

        match self.send(grbl::UNLOCK, CommandClass::Config).await {
            Ok(_) => {}
            Err(RigError::CommandRejected { code: err, .. }) => {
                return Err(RigError::AlarmNotCleared(format!(
                    "unlock rejected (error:{})",
                    err
                )));
            }
            Err(other) => return Err(other),
        }

        let ack_seq = status.borrow_and_update().seq;
        match wait_fresh(
            &mut status,
            ack_seq,
            |s| s.state != MachineState::Alarm,
            self.config.unlock_timeout,
        )
        .await
        {
            Ok(_) => {
                info!(alarm = ?code, "alarm cleared");
                Ok(())
            }
            Err(RigError::MotionTimeout(_)) => Err(RigError::AlarmNotCleared(
                "controller still in alarm after unlock".to_string(),
            )),
            Err(other) => Err(other),
        }
    }

    /// Wait until the cached status satisfies `predicate` (checked immediately).
    pub async fn wait_for_state<F>(&self, predicate: F, timeout: Duration) -> RigResult<StatusSnapshot>
    where
        F: Fn(&StatusSnapshot) -> bool,
    {
        let mut status = self.status.subscribe();
        let current = status.borrow_and_update().clone();
        if predicate(&current) {
            return Ok(current);
        }
        wait_fresh(&mut status, current.seq, predicate, timeout).await
    }
}

/// Wait for a snapshot newer than `after_seq` that satisfies `predicate`.
async fn wait_fresh<F>(
    status: &mut watch::Receiver<StatusSnapshot>,
    after_seq: u64,
    predicate: F,
    timeout: Duration,
) -> RigResult<StatusSnapshot>
where
    F: Fn(&StatusSnapshot) -> bool,
{
    let wait = async {
        loop {
            {
                let snapshot = status.borrow_and_update();
                if snapshot.seq > after_seq && predicate(&snapshot) {
                    return Ok(snapshot.clone());
                }
                if !snapshot.connected {
                    return Err(RigError::ConnectionLost(
                        "link lost while waiting for state".to_string(),
                    ));
                }
            }
            status
                .changed()
                .await
                .map_err(|_| RigError::ConnectionLost("status channel closed".to_string()))?;
        }
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| RigError::MotionTimeout(timeout))?
}

async fn submit_line(
    requests: &mpsc::Sender<WriterRequest>,
    command: Command,
    timeout: Duration,
    retries: u32,
) -> RigResult<Ack> {
    let (reply, rx) = oneshot::channel();
    requests
        .send(WriterRequest::Line {
            command,
            timeout,
            retries,
            reply,
        })
        .await
        .map_err(|_| RigError::ConnectionLost("writer stopped".to_string()))?;
    rx.await
        .map_err(|_| RigError::ConnectionLost("writer stopped".to_string()))?
}

// =============================================================================
// Reader task
// =============================================================================

async fn run_reader(
    mut reader: Box<dyn LineReader>,
    status: Arc<watch::Sender<StatusSnapshot>>,
    replies: mpsc::UnboundedSender<ReplyLine>,
    lost: Arc<watch::Sender<bool>>,
) {
    loop {
        match reader.read_line().await {
            Ok(Some(line)) => route_line(&line, &status, &replies),
            Ok(None) => {
                warn!("controller closed the link");
                break;
            }
            Err(e) => {
                warn!(error = %e, "link read failed");
                break;
            }
        }
    }

    lost.send_replace(true);
    status.send_modify(|s| {
        s.connected = false;
        s.seq += 1;
        s.updated_at = Utc::now();
    });
}

fn route_line(
    line: &str,
    status: &watch::Sender<StatusSnapshot>,
    replies: &mpsc::UnboundedSender<ReplyLine>,
) {
    match grbl::classify(line) {
        Incoming::Ok => {
            let _ = replies.send(ReplyLine::Ok);
        }
        Incoming::Error(code) => {
            let _ = replies.send(ReplyLine::Error(code));
        }
        Incoming::Info(text) => {
            let _ = replies.send(ReplyLine::Info(text));
        }
        Incoming::Status(report) => {
            status.send_modify(|s| {
                if s.state != report.state {
                    debug!(from = %s.state, to = %report.state, "machine state changed");
                }
                s.state = report.state;
                s.position = Position4D::from_array(report.position);
                if report.state != MachineState::Alarm {
                    s.alarm_code = None;
                }
                s.seq += 1;
                s.updated_at = Utc::now();
            });
        }
        Incoming::Alarm(code) => {
            warn!(code, "controller alarm");
            status.send_modify(|s| {
                s.state = MachineState::Alarm;
                s.alarm_code = Some(code);
                s.seq += 1;
                s.updated_at = Utc::now();
            });
        }
        Incoming::Welcome(banner) => {
            info!(banner = %banner, "controller reset");
            let _ = replies.send(ReplyLine::Reset);
        }
        Incoming::Noise(text) => {
            trace!(line = %text, "discarding unrecognised line");
        }
    }
}

// =============================================================================
// Writer task
// =============================================================================

async fn run_writer(
    mut writer: Box<dyn LineWriter>,
    mut requests: mpsc::Receiver<WriterRequest>,
    replies: mpsc::UnboundedReceiver<ReplyLine>,
    mut lost: watch::Receiver<bool>,
    lost_tx: Arc<watch::Sender<bool>>,
    inter_command_delay: Duration,
) {
    let mut replies = Replies::new(replies);
    loop {
        let request = tokio::select! {
            biased;
            _ = lost.wait_for(|lost| *lost) => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        match request {
            WriterRequest::Realtime { byte, reply } => {
                let result = writer.write_realtime(byte).await;
                let failed = result.is_err();
                let _ = reply.send(result);
                if failed {
                    lost_tx.send_replace(true);
                    break;
                }
            }
            WriterRequest::Line {
                command,
                timeout,
                retries,
                reply,
            } => {
                let result =
                    exchange(writer.as_mut(), &mut replies, &command, timeout, retries).await;
                let failed = matches!(&result, Err(e) if e.is_connection_lost());
                let _ = reply.send(result);
                if failed {
                    lost_tx.send_replace(true);
                    break;
                }
                if !inter_command_delay.is_zero() {
                    tokio::time::sleep(inter_command_delay).await;
                }
            }
        }
    }

    requests.close();
    while let Ok(request) = requests.try_recv() {
        request.fail(RigError::ConnectionLost("link lost".to_string()));
    }
}

async fn exchange(
    writer: &mut dyn LineWriter,
    replies: &mut Replies,
    command: &Command,
    timeout: Duration,
    retries: u32,
) -> RigResult<Ack> {
    let started = Instant::now();
    let max_attempts = retries + 1;

    for attempt in 1..=max_attempts {
        let stale = replies.drain();
        if stale > 0 {
            debug!(command_id = %command.id, stale, owed = replies.owed, "dropped stale replies");
        }

        writer.write_line(&command.text).await?;
        trace!(command_id = %command.id, attempt, command = %command.text, "sent");

        match tokio::time::timeout(timeout, replies.next_reply()).await {
            Ok(Ok(Ok(lines))) => {
                let latency = started.elapsed();
                trace!(command_id = %command.id, ?latency, "acknowledged");
                return Ok(Ack {
                    id: command.id,
                    command: command.text.clone(),
                    lines,
                    attempts: attempt,
                    latency,
                });
            }
            Ok(Ok(Err(code))) => {
                warn!(command_id = %command.id, command = %command.text, code, "command rejected");
                return Err(RigError::CommandRejected {
                    command: command.text.clone(),
                    code,
                });
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                replies.owed += 1;
                warn!(
                    command_id = %command.id,
                    command = %command.text,
                    attempt,
                    max_attempts,
                    "ack timeout"
                );
            }
        }
    }

    Err(RigError::CommunicationTimeout {
        command: command.text.clone(),
        attempts: max_attempts,
    })
}

// =============================================================================
// Poller task
// =============================================================================

async fn run_poller(
    requests: mpsc::Sender<WriterRequest>,
    mut lost: watch::Receiver<bool>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = lost.wait_for(|lost| *lost) => break,
            _ = ticker.tick() => {}
        }

        let (reply, _ignored) = oneshot::channel();
        match requests.try_send(WriterRequest::Realtime {
            byte: grbl::STATUS_QUERY,
            reply,
        }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => trace!("writer busy, skipping status poll"),
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::transport::{LinkHalves, StreamLink};
    use async_trait::async_trait;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tracing_test::traced_test;

    /// Transport that hands the far end of a duplex to the test.
    struct ScriptedTransport {
        far: parking_lot::Mutex<Option<tokio::sync::oneshot::Sender<DuplexStream>>>,
    }

    #[async_trait]
    impl SerialTransport for ScriptedTransport {
        async fn open(&self) -> RigResult<LinkHalves> {
            let (near, far) = tokio::io::duplex(1024);
            let sender = self
                .far
                .lock()
                .take()
                .ok_or_else(|| RigError::ConnectionLost("already opened".to_string()))?;
            let _ = sender.send(far);
            Ok(StreamLink::split(near))
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    fn poll_free_config() -> ProtocolConfig {
        ProtocolConfig {
            ack_timeout: Duration::from_millis(100),
            max_retries: 2,
            inter_command_delay: Duration::ZERO,
            status_mode: StatusMode::Auto,
            status_interval: Duration::from_millis(20),
            ..ProtocolConfig::default()
        }
    }

    async fn scripted_engine() -> (ProtocolEngine, tokio::sync::oneshot::Receiver<DuplexStream>) {
        scripted_engine_with(poll_free_config()).await
    }

    async fn scripted_engine_with(
        config: ProtocolConfig,
    ) -> (ProtocolEngine, tokio::sync::oneshot::Receiver<DuplexStream>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let transport = ScriptedTransport {
            far: parking_lot::Mutex::new(Some(tx)),
        };
        (ProtocolEngine::new(Arc::new(transport), config), rx)
    }

    fn no_retry_config() -> ProtocolConfig {
        ProtocolConfig {
            max_retries: 0,
            ..poll_free_config()
        }
    }

    #[tokio::test]
    async fn test_noise_is_discarded_and_reply_still_correlates() {
        let (engine, far_rx) = scripted_engine().await;

        let controller = tokio::spawn(async move {
            let far = far_rx.await.unwrap();
            let (rd, mut wr) = tokio::io::split(far);
            let mut lines = BufReader::new(rd).lines();

            // auto-report setup
            let first = lines.next_line().await.unwrap().unwrap();
            assert_eq!(first, "$Report/Interval=20");
            wr.write_all(b"ok\n").await.unwrap();

            let second = lines.next_line().await.unwrap().unwrap();
            assert_eq!(second, "$I");
            wr.write_all(b"garbage \xff\xfe\n<Idle|MPos:1,2\n[VER:1.1h:]\nok\n")
                .await
                .unwrap();
            wr.write_all(b"<Run|MPos:1.000,2.000,3.000,0.000|FS:0,0>\n")
                .await
                .unwrap();
            (lines, wr)
        });

        let ack = engine.send("$I", CommandClass::Query).await.unwrap();
        assert_eq!(ack.lines, vec!["[VER:1.1h:]".to_string()]);
        assert_eq!(ack.attempts, 1);

        let snapshot = engine
            .wait_for_state(|s| s.state == MachineState::Moving, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(snapshot.position, Position4D::new(1.0, 2.0, 3.0, 0.0));
        let _ = controller.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let (engine, far_rx) = scripted_engine().await;

        let controller = tokio::spawn(async move {
            let far = far_rx.await.unwrap();
            let (rd, mut wr) = tokio::io::split(far);
            let mut lines = BufReader::new(rd).lines();
            lines.next_line().await.unwrap();
            wr.write_all(b"ok\n").await.unwrap();

            lines.next_line().await.unwrap();
            wr.write_all(b"error:20\n").await.unwrap();

            // a retry would show up here; the next line must be the follow-up command
            let next = lines.next_line().await.unwrap().unwrap();
            wr.write_all(b"ok\n").await.unwrap();
            next
        });

        let err = engine.send("M999", CommandClass::Config).await.unwrap_err();
        assert!(matches!(err, RigError::CommandRejected { code: 20, .. }));

        engine.send("$I", CommandClass::Query).await.unwrap();
        assert_eq!(controller.await.unwrap(), "$I");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_ack_timeout_is_logged_and_retried() {
        let (engine, far_rx) = scripted_engine().await;

        let controller = tokio::spawn(async move {
            let far = far_rx.await.unwrap();
            let (rd, mut wr) = tokio::io::split(far);
            let mut lines = BufReader::new(rd).lines();
            lines.next_line().await.unwrap();
            wr.write_all(b"ok\n").await.unwrap();

            // answer the first attempt only after the retry went out
            let first = lines.next_line().await.unwrap().unwrap();
            let second = lines.next_line().await.unwrap().unwrap();
            wr.write_all(b"[VER:first]\nok\n[VER:second]\nok\n")
                .await
                .unwrap();
            (first, second, lines, wr)
        });

        let ack = engine.send("$I", CommandClass::Query).await.unwrap();
        assert_eq!(ack.attempts, 2);
        assert_eq!(ack.lines, vec!["[VER:second]".to_string()]);

        let (first, second, _lines, _wr) = controller.await.unwrap();
        assert_eq!(first, "$I");
        assert_eq!(second, "$I");
        assert!(logs_contain("ack timeout"));
    }

    #[tokio::test]
    async fn test_late_reply_goes_to_the_timed_out_command() {
        let (engine, far_rx) = scripted_engine_with(no_retry_config()).await;

        let controller = tokio::spawn(async move {
            let far = far_rx.await.unwrap();
            let (rd, mut wr) = tokio::io::split(far);
            let mut lines = BufReader::new(rd).lines();
            lines.next_line().await.unwrap();
            wr.write_all(b"ok\n").await.unwrap();

            // slow controller: the first line is answered only once the second arrives
            let first = lines.next_line().await.unwrap().unwrap();
            let second = lines.next_line().await.unwrap().unwrap();
            wr.write_all(b"error:9\n[VER:1.1h:]\nok\n").await.unwrap();

            let third = lines.next_line().await.unwrap().unwrap();
            wr.write_all(b"$110=5000.000\nok\n").await.unwrap();
            (first, second, third, lines, wr)
        });

        let err = engine.send("G1 X999", CommandClass::Motion).await.unwrap_err();
        assert!(matches!(err, RigError::CommunicationTimeout { attempts: 1, .. }));

        let ack = engine.send("$I", CommandClass::Query).await.unwrap();
        assert_eq!(ack.lines, vec!["[VER:1.1h:]".to_string()]);

        let ack = engine.send("$110", CommandClass::Query).await.unwrap();
        assert_eq!(ack.setting("110"), Some("5000.000"));

        let (first, second, third, _lines, _wr) = controller.await.unwrap();
        assert_eq!((first.as_str(), second.as_str(), third.as_str()), ("G1 X999", "$I", "$110"));
    }

    #[tokio::test]
    async fn test_controller_reset_cancels_owed_replies() {
        let (engine, far_rx) = scripted_engine_with(no_retry_config()).await;

        let controller = tokio::spawn(async move {
            let far = far_rx.await.unwrap();
            let (rd, mut wr) = tokio::io::split(far);
            let mut lines = BufReader::new(rd).lines();
            lines.next_line().await.unwrap();
            wr.write_all(b"ok\n").await.unwrap();

            // the first line is never answered; a reset flushes it
            lines.next_line().await.unwrap();
            lines.next_line().await.unwrap();
            wr.write_all(b"Grbl 1.1h ['$' for help]\n[VER:1.1h:]\nok\n")
                .await
                .unwrap();
            (lines, wr)
        });

        let err = engine.send("$I", CommandClass::Query).await.unwrap_err();
        assert!(matches!(err, RigError::CommunicationTimeout { .. }));

        let ack = engine.send("$I", CommandClass::Query).await.unwrap();
        assert_eq!(ack.lines, vec!["[VER:1.1h:]".to_string()]);
        let _ = controller.await.unwrap();
    }

    #[tokio::test]
    async fn test_alarm_line_sets_state_without_query() {
        let (engine, far_rx) = scripted_engine().await;

        let controller = tokio::spawn(async move {
            let far = far_rx.await.unwrap();
            let (rd, mut wr) = tokio::io::split(far);
            let mut lines = BufReader::new(rd).lines();
            lines.next_line().await.unwrap();
            wr.write_all(b"ok\nALARM:2\n").await.unwrap();
            (lines, wr)
        });

        engine.connect().await.unwrap();
        let snapshot = engine
            .wait_for_state(|s| s.state == MachineState::Alarm, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(snapshot.alarm_code, Some(2));
        assert!(engine.is_alarm());
        let _ = controller.await.unwrap();
    }
}
